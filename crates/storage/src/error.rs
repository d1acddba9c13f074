//! Storage error types

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type StoreResult<T> = std::result::Result<T, StoreError>;
pub type BufferResult<T> = std::result::Result<T, BufferError>;

/// Errors from the durable store
///
/// The writer only cares about one distinction: a transient error counts
/// toward the circuit breaker, a malformed one means the rows are bad.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// Connection, pool, I/O or protocol trouble; retrying later may succeed
    #[error("Store unavailable: {0}")]
    Transient(String),

    /// The store rejected the rows themselves
    #[error("Malformed record: {0}")]
    Malformed(String),

    #[error("Store call exceeded {0:?}")]
    Timeout(Duration),

    #[error("Store configuration error: {0}")]
    Config(String),
}

impl StoreError {
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => match db.code() {
                // Class 22 data exception, class 23 integrity constraint violation
                Some(code) if code.starts_with("22") || code.starts_with("23") => {
                    Self::Malformed(err.to_string())
                }
                _ => Self::Transient(err.to_string()),
            },
            sqlx::Error::Encode(_) => Self::Malformed(err.to_string()),
            sqlx::Error::Configuration(_) => Self::Config(err.to_string()),
            _ => Self::Transient(err.to_string()),
        }
    }
}

/// Errors from the local spill buffer; always fatal for the writer
#[derive(Error, Debug)]
pub enum BufferError {
    #[error("Buffer I/O failed on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Buffer record could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}

impl BufferError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_errors_are_transient() {
        let err = StoreError::from(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, StoreError::Transient(_)));
        assert!(!err.is_malformed());

        let err = StoreError::from(sqlx::Error::PoolClosed);
        assert!(matches!(err, StoreError::Transient(_)));
    }

    #[test]
    fn test_protocol_errors_are_transient() {
        let err = StoreError::from(sqlx::Error::Protocol("unexpected message".into()));
        assert!(matches!(err, StoreError::Transient(_)));
    }
}
