//! Error types for quotakeeper operations.

use thiserror::Error;

/// Main error type for limiter, matcher and store operations.
#[derive(Error, Debug)]
pub enum QuotaError {
    /// The store could not be reached or dropped the connection
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// The store answered with something outside the expected set
    #[error("Unrecognized store response: {0}")]
    UnrecognizedResponse(String),

    /// The store rejected an atomic procedure
    #[error("Procedure failed: {0}")]
    Procedure(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl QuotaError {
    /// Whether the failure leaves the outcome of the call indeterminate.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            QuotaError::StoreUnavailable(_)
                | QuotaError::UnrecognizedResponse(_)
                | QuotaError::Procedure(_)
        )
    }
}

impl From<redis::RedisError> for QuotaError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_timeout()
            || err.is_cluster_error()
        {
            return QuotaError::StoreUnavailable(err.to_string());
        }

        if err.code() == Some("WRONGTYPE") {
            return QuotaError::UnrecognizedResponse(err.to_string());
        }

        match err.kind() {
            redis::ErrorKind::TypeError => QuotaError::UnrecognizedResponse(err.to_string()),
            redis::ErrorKind::ClientError | redis::ErrorKind::TryAgain => {
                QuotaError::StoreUnavailable(err.to_string())
            }
            _ => QuotaError::Procedure(err.to_string()),
        }
    }
}

/// Result type alias for quotakeeper operations.
pub type Result<T> = std::result::Result<T, QuotaError>;
