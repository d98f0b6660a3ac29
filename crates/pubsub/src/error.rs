//! Bus adapter error types.

use thiserror::Error;

/// Bus adapter error type.
#[derive(Debug, Error)]
pub enum BusError {
    /// Redis connection or command error.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Envelope serialization/deserialization error.
    #[error("envelope error: {0}")]
    Json(#[from] serde_json::Error),

    /// Publish gave up after the in-memory retry window.
    #[error("publish failed after {attempts} attempts")]
    PublishFailed {
        /// Number of attempts made, including the first.
        attempts: usize,
    },

    /// The adapter was shut down.
    #[error("bus adapter closed")]
    Closed,
}

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;
