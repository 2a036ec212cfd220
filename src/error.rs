//! Error types for the Ratekeeper service.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Ratekeeper operations.
#[derive(Error, Debug)]
pub enum RatekeeperError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Counter store errors surfaced outside the fail-open path
    #[error("Counter store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for RatekeeperError {
    fn from(err: config::ConfigError) -> Self {
        RatekeeperError::Config(err.to_string())
    }
}

/// Result type alias for Ratekeeper operations.
pub type Result<T> = std::result::Result<T, RatekeeperError>;
