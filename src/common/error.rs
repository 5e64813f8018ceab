//! Error types for swarmlease

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Store Errors ===
    /// The remote advanced past the version this write was based on.
    #[error("Store conflict on {key}: remote advanced past the expected version")]
    StoreConflict { key: String },

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Invalid document {key}: {reason}")]
    InvalidDocument { key: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // === Node Errors ===
    #[error("Invalid state transition from {from} on {event}")]
    InvalidStateTransition { from: String, event: String },

    #[error("Launcher error: {0}")]
    Launcher(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::StoreConflict { .. } | Error::StoreUnavailable(_) | Error::Timeout(_)
        )
    }

    /// Lost a publish race. Expected under contention.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::StoreConflict { .. })
    }

    /// Backend unreachable (network, auth, timeouts talking to the remote).
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_) | Error::Timeout(_))
    }

    pub fn conflict(key: impl Into<String>) -> Self {
        Error::StoreConflict { key: key.into() }
    }

    pub fn invalid_document(key: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::InvalidDocument {
            key: key.into(),
            reason: reason.to_string(),
        }
    }
}

// Implement From for common error types
impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::conflict("assignments").is_retryable());
        assert!(Error::StoreUnavailable("push timed out".into()).is_retryable());
        assert!(!Error::InvalidConfig("bad ttl".into()).is_retryable());
        assert!(!Error::InvalidStateTransition {
            from: "idle".into(),
            event: "renew".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_conflict_display_names_key() {
        let err = Error::conflict("schedule");
        assert!(err.to_string().contains("schedule"));
        assert!(err.is_conflict());
        assert!(!err.is_unavailable());
    }
}
