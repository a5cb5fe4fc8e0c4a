//! Error types for the Turnstile service.

use thiserror::Error;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Invalid policy or service settings. Fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The counter backend timed out, refused the connection or spoke garbage.
    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(String),

    /// The client identity could not be derived from the request.
    #[error("Invalid client identifier: {0}")]
    InvalidIdentifier(String),

    /// Any other fault while computing a decision.
    #[error("Decision error: {0}")]
    Decision(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for TurnstileError {
    fn from(err: config::ConfigError) -> Self {
        TurnstileError::Config(err.to_string())
    }
}

impl From<redis::RedisError> for TurnstileError {
    fn from(err: redis::RedisError) -> Self {
        TurnstileError::StoreUnavailable(err.to_string())
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
