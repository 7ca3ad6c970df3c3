//! Error types for the GPR engine

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the GPR engine
#[derive(Error, Debug)]
pub enum EgsError {
    /// Malformed or contradictory request fields
    #[error("Bad parameters: {0}")]
    BadParameters(String),

    /// Unknown binding, template, workspace or GPR
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// Not enough GPU capacity to satisfy a request right now
    #[error("Insufficient capacity: {0}")]
    InsufficientCapacity(String),

    /// Template binding cannot supply a template for the request
    #[error("No template available: {0}")]
    NoTemplateAvailable(String),

    /// Operation is not valid for the current state of the record
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Collaborator or infrastructure fault
    #[error("Unhandled error: {0}")]
    Unhandled(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type for engine operations
pub type EgsResult<T> = Result<T, EgsError>;

/// Kind of an error, carried by terminal failures so callers can tell
/// "try again later" from "fix your request"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ErrorKind {
    BadParameters,
    ResourceNotFound,
    InsufficientCapacity,
    NoTemplateAvailable,
    Conflict,
    UnhandledException,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::BadParameters => write!(f, "BadParameters"),
            ErrorKind::ResourceNotFound => write!(f, "ResourceNotFound"),
            ErrorKind::InsufficientCapacity => write!(f, "InsufficientCapacity"),
            ErrorKind::NoTemplateAvailable => write!(f, "NoTemplateAvailable"),
            ErrorKind::Conflict => write!(f, "Conflict"),
            ErrorKind::UnhandledException => write!(f, "UnhandledException"),
        }
    }
}

impl EgsError {
    /// Classify this error into the public taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            EgsError::BadParameters(_) => ErrorKind::BadParameters,
            EgsError::ResourceNotFound(_) => ErrorKind::ResourceNotFound,
            EgsError::InsufficientCapacity(_) => ErrorKind::InsufficientCapacity,
            EgsError::NoTemplateAvailable(_) => ErrorKind::NoTemplateAvailable,
            EgsError::Conflict(_) => ErrorKind::Conflict,
            EgsError::Unhandled(_)
            | EgsError::Config(_)
            | EgsError::Io(_)
            | EgsError::Serialization(_) => ErrorKind::UnhandledException,
        }
    }

    /// Only capacity exhaustion is recovered locally by requeueing
    pub fn is_retryable(&self) -> bool {
        matches!(self, EgsError::InsufficientCapacity(_))
    }
}

impl From<serde_json::Error> for EgsError {
    fn from(err: serde_json::Error) -> Self {
        EgsError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for EgsError {
    fn from(err: toml::de::Error) -> Self {
        EgsError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EgsError::InsufficientCapacity("cluster-a".to_string());
        assert_eq!(err.to_string(), "Insufficient capacity: cluster-a");
    }

    #[test]
    fn test_error_kind_and_retry() {
        assert!(EgsError::InsufficientCapacity(String::new()).is_retryable());
        assert!(!EgsError::NoTemplateAvailable(String::new()).is_retryable());
        assert_eq!(
            EgsError::Unhandled("feed down".to_string()).kind(),
            ErrorKind::UnhandledException
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: EgsError = io_err.into();
        assert!(matches!(err, EgsError::Io(_)));
        assert_eq!(err.kind(), ErrorKind::UnhandledException);
    }
}
