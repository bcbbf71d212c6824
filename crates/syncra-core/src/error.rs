//! Error types for the syncra listener engine.

use thiserror::Error;

/// Result type alias using syncra's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for syncra operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Document store operation failed.
    #[error("Store error: {0}")]
    Store(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Listener record not found.
    #[error("Listener not found: {0}")]
    ListenerNotFound(uuid::Uuid),

    /// Listener registration violates its contract (missing collection, job name).
    #[error("Invalid listener: {0}")]
    InvalidListener(String),

    /// Change-feed subscription failed or was dropped.
    #[error("Subscription error: {0}")]
    Subscription(String),

    /// Job submission to the external scheduler failed.
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
