//! Error types for hafleet

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Process Errors ===
    #[error("Failed to launch {name}: {source}")]
    Launch {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Interrupted: {0}")]
    Interrupted(String),

    // === Coordination Errors ===
    #[error("Coordination session expired: {0}")]
    SessionExpired(String),

    #[error("Node already exists: {0}")]
    NodeExists(String),

    #[error("No such node: {0}")]
    NoNode(String),

    #[error("Node has children: {0}")]
    NotEmpty(String),

    #[error("Not master: current master is {0}")]
    NotMaster(String),

    // === Snapshot Errors ===
    #[error("Duplicate snapshot commit time: {0}")]
    DuplicateKey(i64),

    #[error("Unsupported snapshot record version: {0}")]
    UnsupportedVersion(u32),

    #[error("Corrupted data: {0}")]
    Corrupted(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // === Generic ===
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
            Error::Timeout(_) | Error::Interrupted(_) | Error::NodeExists(_)
        )
    }

    /// Does this error invalidate leadership or quorum state derived from
    /// the current coordination session?
    pub fn invalidates_session_state(&self) -> bool {
        matches!(self, Error::SessionExpired(_))
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

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
    fn test_retryable() {
        assert!(Error::Timeout("quorum".into()).is_retryable());
        assert!(!Error::DuplicateKey(100).is_retryable());
        assert!(!Error::SessionExpired("s1".into()).is_retryable());
    }

    #[test]
    fn test_session_invalidation() {
        assert!(Error::SessionExpired("s1".into()).invalidates_session_state());
        assert!(!Error::NoNode("/a".into()).invalidates_session_state());
    }
}
