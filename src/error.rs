//! Error types for quotadb.

use thiserror::Error;

/// Main error type for rate limiting operations.
#[derive(Error, Debug)]
pub enum QuotaError {
    /// Missing or malformed limiter configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Table name that is not a plain SQL identifier
    #[error("Invalid table name: {0:?}")]
    InvalidTableName(String),

    /// Non-positive request limit
    #[error("Invalid limit: {0}")]
    InvalidLimit(String),

    /// Non-finite or non-positive window
    #[error("Invalid window: {0}")]
    InvalidWindow(String),

    /// Token bucket parameter that was not supplied
    #[error("Missing parameter: {0}")]
    MissingParameter(&'static str),

    /// Token bucket parameter outside its valid range
    #[error("Invalid parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    /// The token bucket does not hold enough tokens for this request
    #[error("Insufficient tokens: requested {requested}, available {available}")]
    InsufficientTokens { requested: i64, available: i64 },

    /// Schema creation or transaction failure
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of a [`QuotaError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Fatal at construction, never retried.
    Configuration,
    /// Rejected before the store is touched.
    Validation,
    /// The backing store failed; the transaction was rolled back.
    Store,
    /// The token bucket refused the request.
    Rejected,
}

impl QuotaError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QuotaError::Config(_) | QuotaError::InvalidTableName(_) | QuotaError::Io(_) => {
                ErrorKind::Configuration
            }
            QuotaError::InvalidLimit(_)
            | QuotaError::InvalidWindow(_)
            | QuotaError::MissingParameter(_)
            | QuotaError::InvalidParameter { .. } => ErrorKind::Validation,
            QuotaError::Store(_) => ErrorKind::Store,
            QuotaError::InsufficientTokens { .. } => ErrorKind::Rejected,
        }
    }

    pub fn is_validation(&self) -> bool {
        self.kind() == ErrorKind::Validation
    }
}

/// Result type alias for quotadb operations.
pub type Result<T> = std::result::Result<T, QuotaError>;
