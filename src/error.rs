//! Error types for agentbus.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Not connected to the message broker. Call connect() first.")]
    NotConnected,

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Failed to decode message from '{topic}': {reason}")]
    Decode { topic: String, reason: String },

    #[error("Failed to publish message to '{topic}': {reason}")]
    Publish { topic: String, reason: String },

    #[error("Expiry store error: {0}")]
    ExpiryStore(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether a caller may reasonably retry the failed operation.
    ///
    /// The broker never retries on its own; this only classifies.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::Publish { .. })
    }
}
