//! Error types for the Ratewarden service.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Ratewarden operations.
///
/// None of these ever reach a caller of the admission path; they surface at
/// construction time (invalid limiter configuration) or at the binary
/// boundary (configuration loading, server startup).
#[derive(Error, Debug)]
pub enum WardenError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Layered configuration could not be loaded
    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    /// HTTP server errors
    #[error("Server error: {0}")]
    Server(String),
}

/// Failures of the durable counter store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backend reported a failure
    #[error("counter store unavailable: {0}")]
    Unavailable(String),

    /// The backend did not answer within the configured budget
    #[error("counter store timed out after {0:?}")]
    Timeout(Duration),
}

/// Failures reported by a violation sink.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("violation sink rejected event: {0}")]
    Rejected(String),

    #[error("violation sink timed out after {0:?}")]
    Timeout(Duration),
}

/// Result type alias for Ratewarden operations.
pub type Result<T> = std::result::Result<T, WardenError>;
