//! Error types for the sentinel agent

use thiserror::Error;

use crate::executor::authority::Rejection;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the sentinel agent
#[derive(Error, Debug)]
pub enum Error {
    // Registration errors
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Delegation not found: {0}")]
    DelegationNotFound(String),

    #[error("Delegation {id} is {status}")]
    DelegationInactive { id: String, status: String },

    // Authority bounds
    #[error("Scope violation: {0}")]
    ScopeViolation(String),

    #[error("Fee ceiling exceeded: {offered} wei > ceiling {ceiling} wei")]
    FeeCeilingExceeded { offered: u128, ceiling: u128 },

    // Indexer errors
    #[error("Indexer timeout after {0}ms")]
    IndexerTimeout(u64),

    #[error("Indexer error: {0}")]
    Indexer(String),

    #[error("Indexer response malformed: {0}")]
    IndexerMalformed(String),

    #[error("Indexer data is {lag_secs}s behind, tolerance is {max_secs}s")]
    IndexerStale { lag_secs: i64, max_secs: u64 },

    // Authority provider errors
    #[error("Authority provider timeout after {0}ms")]
    AuthorityTimeout(u64),

    #[error("Authority provider unavailable: {0}")]
    AuthorityUnavailable(String),

    #[error("Authority provider rejected submission: {0}")]
    AuthorityRejected(Rejection),

    #[error("Authority provider refused request: {0}")]
    AuthorityRefused(String),

    // Bookkeeping
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Persistence failed: {0}")]
    Persistence(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable (transient)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::IndexerTimeout(_)
                | Error::Indexer(_)
                | Error::IndexerStale { .. }
                | Error::AuthorityTimeout(_)
                | Error::AuthorityUnavailable(_)
        )
    }

    /// Check if this error is terminal for the action that raised it
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Error::AuthorityRejected(_)
                | Error::AuthorityRefused(_)
                | Error::DelegationInactive { .. }
                | Error::DelegationNotFound(_)
                | Error::ScopeViolation(_)
                | Error::InvariantViolation(_)
        )
    }
}

// Conversion from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Conversion from I/O errors
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}
