//! Error types for the admission layer.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for admission-layer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types surfaced by the admission layer
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or invalid configuration at startup (fatal)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The external classifier could not produce a verdict
    #[error("Classifier unavailable: {0}")]
    ClassifierUnavailable(#[from] ClassifierError),

    /// A detection record could not be persisted
    #[error("Persistence failure: {0}")]
    Persistence(String),

    /// Storage backend error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    /// Whether this error must abort process startup
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Configuration(_))
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Configuration(err.to_string())
    }
}

/// Reasons a classifier call failed
#[derive(Debug, Clone, Error)]
pub enum ClassifierError {
    /// No verdict within the allotted budget
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Endpoint could not be reached
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    /// Endpoint answered with a non-2xx status
    #[error("endpoint returned status {0}")]
    Status(u16),

    /// Response body was not a recognizable verdict
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ClassifierError {
    /// Short machine-readable cause used in logs and records
    pub fn kind(&self) -> &'static str {
        match self {
            ClassifierError::Timeout(_) => "timeout",
            ClassifierError::Unreachable(_) => "unreachable",
            ClassifierError::Status(_) => "status",
            ClassifierError::Malformed(_) => "malformed",
        }
    }
}

impl From<reqwest::Error> for ClassifierError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ClassifierError::Malformed(err.to_string())
        } else if let Some(status) = err.status() {
            ClassifierError::Status(status.as_u16())
        } else {
            ClassifierError::Unreachable(err.to_string())
        }
    }
}
