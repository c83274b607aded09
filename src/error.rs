//! Error types for the Ratewarden service.

use thiserror::Error;

/// Error surfaced by the rate limiting core.
///
/// Over-limit requests are not errors; they are reported as denied decisions.
/// The only failure the core knows about is a store that could not answer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    /// The store is unreachable, timed out, or answered with a protocol fault.
    #[error("rate limit backend unavailable: {0}")]
    BackendUnavailable(String),
}

impl From<redis::RedisError> for RateLimitError {
    fn from(err: redis::RedisError) -> Self {
        RateLimitError::BackendUnavailable(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for RateLimitError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        RateLimitError::BackendUnavailable("deadline exceeded".to_string())
    }
}

/// Main error type for Ratewarden operations.
#[derive(Error, Debug)]
pub enum WardenError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rate limiting errors
    #[error("Rate limit error: {0}")]
    RateLimit(#[from] RateLimitError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Ratewarden operations.
pub type Result<T> = std::result::Result<T, WardenError>;
