//! Error types for runsync
//!
//! This module defines the common error types used throughout the system.

use crate::value::MetaValueError;
use thiserror::Error;

/// Common result type for runsync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for runsync
#[derive(Debug, Error)]
pub enum Error {
    // Startup errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("pipeline lease is held by another instance: {0}")]
    LeaseHeld(String),

    // Model errors
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("metadata value error: {0}")]
    MetaValue(#[from] MetaValueError),

    // Store errors
    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    // Import errors
    #[error("import failed for {path}: {message}")]
    Import { path: String, message: String },

    // Encoding errors
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an import error for one file
    pub fn import(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Import {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Configuration errors are fatal at startup and never retried
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::LeaseHeld(_))
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_fatal() {
        assert!(Error::configuration("no pattern").is_fatal());
        assert!(Error::LeaseHeld("/tmp/x".into()).is_fatal());
        assert!(!Error::storage("disk").is_fatal());
    }

    #[test]
    fn test_error_not_found() {
        assert!(Error::NotFound("a/b".into()).is_not_found());
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(Error::from(io).is_not_found());
        assert!(!Error::invalid_state("x").is_not_found());
    }

    #[test]
    fn test_error_display() {
        let err = Error::import("run/a.csv", "bad header");
        assert_eq!(err.to_string(), "import failed for run/a.csv: bad header");
    }
}
