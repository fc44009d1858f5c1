//! Error types for the orchestrator

use thiserror::Error;

/// Main error type for orchestrator operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Request failed admission rules
    #[error("validation error: {0}")]
    Validation(String),

    /// A record with the same id already exists
    #[error("store already exists: {0}")]
    Duplicate(String),

    /// No record with the given id
    #[error("store not found: {0}")]
    NotFound(String),

    /// Global or per-source store quota exhausted
    #[error("store quota exceeded")]
    QuotaExceeded,

    /// Deployment driver (chart install/uninstall) failure
    #[error("driver error: {0}")]
    Driver(String),

    /// Registry persistence failure
    #[error("persistence error: {0}")]
    Persistence(String),

    /// A deadline expired before the operation completed
    #[error("timeout: {0}")]
    Timeout(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a driver error with the given message
    pub fn driver(msg: impl Into<String>) -> Self {
        Self::Driver(msg.into())
    }

    /// Create a persistence error with the given message
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// Create a timeout error with the given message
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Persistence(e.to_string())
    }
}

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_carry_the_message() {
        let err = Error::validation("name is required");
        assert!(err.to_string().contains("validation error"));
        assert!(err.to_string().contains("name is required"));
    }

    #[test]
    fn io_errors_become_persistence_errors() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: Error = io.into();
        assert!(matches!(err, Error::Persistence(_)));
    }

    #[test]
    fn duplicate_and_not_found_name_the_store() {
        assert!(Error::Duplicate("shop".into()).to_string().contains("shop"));
        assert!(Error::NotFound("shop".into()).to_string().contains("shop"));
    }
}
