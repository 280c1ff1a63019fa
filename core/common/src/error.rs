//! Common error types for Rollcall.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level error type for Rollcall operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A required field is missing or malformed.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A referenced user, event, session or device does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A unique constraint was violated by a concurrent writer.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// No usable field encryption key is configured.
    #[error("Encryption unavailable: {0}")]
    CryptoUnavailable(String),

    /// Cryptographic operation failed.
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Store operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Outbound network call failed.
    #[error("Network error: {0}")]
    Network(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration is missing or invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of an [`Error`], as reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    CryptoUnavailable,
    Internal,
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::CryptoUnavailable(_) => ErrorKind::CryptoUnavailable,
            Error::Crypto(_)
            | Error::Storage(_)
            | Error::Network(_)
            | Error::Serialization(_)
            | Error::Config(_)
            | Error::Io(_) => ErrorKind::Internal,
        }
    }

    /// Whether the error came from losing a unique-constraint race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(Error::Validation("x".into()).kind(), ErrorKind::Validation);
        assert_eq!(Error::NotFound("x".into()).kind(), ErrorKind::NotFound);
        assert_eq!(Error::Storage("x".into()).kind(), ErrorKind::Internal);
        assert!(Error::Conflict("x".into()).is_conflict());
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::CryptoUnavailable).unwrap();
        assert_eq!(json, "\"crypto_unavailable\"");
    }
}
