//! Error types for the Tollgate service.

use thiserror::Error;

use crate::ratelimit::UsageError;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Usage could not be determined and the limiter is not fault tolerant
    #[error("Usage error: {0}")]
    Usage(#[from] UsageError),
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
