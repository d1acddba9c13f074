//! Stream session error types

use std::time::Duration;
use thiserror::Error;

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, SessionError>;

/// Everything that can end a connection cycle
///
/// None of these are fatal to the process: the session state machine turns
/// each of them into a RECONNECTING transition. Only the configuration
/// variants are raised at startup, before any session runs.
#[derive(Error, Debug, Clone)]
pub enum SessionError {
    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Authentication rejected: {0}")]
    Auth(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection closed by peer")]
    Closed,

    #[error("No activity for {0:?}")]
    HeartbeatTimeout(Duration),

    #[error("Subscription failed: {0}")]
    Subscribe(String),

    #[error("Session panicked: {0}")]
    Panicked(String),

    #[error("A session for {0} is already running")]
    DuplicateSource(common::Source),

    #[error("Invalid backoff schedule: {0}")]
    InvalidBackoff(String),

    #[error("Invalid maintenance window: {0}")]
    InvalidMaintenance(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for SessionError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => Self::Closed,
            other => Self::Transport(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}
