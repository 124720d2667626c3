//! Pub/sub error types.

use thiserror::Error;

/// Pub/sub error type.
#[derive(Error, Debug)]
pub enum PubSubError {
    /// Channel name is not a valid identifier
    #[error("Invalid channel identifier: {0:?}")]
    InvalidChannel(String),

    /// No live connection to issue commands on
    #[error("No active connection")]
    NoActiveConnection,

    /// Connect, listen or receive failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Command execution failure
    #[error("Execution error: {0}")]
    Execution(String),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PubSubError {
    /// Whether a batch execution may be retried after this error.
    ///
    /// Only a missing connection is transient at the batch level; reconnects
    /// are the supervisor's job.
    pub fn is_no_active_connection(&self) -> bool {
        matches!(self, PubSubError::NoActiveConnection)
    }
}

/// Result type alias using PubSubError.
pub type PubSubResult<T> = Result<T, PubSubError>;
