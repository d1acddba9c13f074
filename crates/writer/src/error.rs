//! Writer error types

use storage::BufferError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, WriterError>;

#[derive(Error, Debug)]
pub enum WriterError {
    /// The spill buffer could not be written; nothing else can absorb an outage
    #[error("Local buffer failed: {0}")]
    Buffer(#[from] BufferError),

    #[error("Invalid writer settings: {0}")]
    InvalidSettings(String),
}
