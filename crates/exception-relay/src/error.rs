//! Error types for the exception relay.

use thiserror::Error;

/// Relay error type.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Redis connection or operation error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Record store error
    #[error("Store error: {0}")]
    Store(#[from] exception_store::StoreError),

    /// Message bus rejected or failed a publish
    #[error("Bus error: {0}")]
    Bus(String),

    /// Outbound message could not be serialised
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// At least one publish in a page failed; nothing in that page was committed
    #[error("Page aborted for {subject_key}: {failed} of {total} publishes failed")]
    PageAborted {
        subject_key: String,
        failed: usize,
        total: usize,
    },

    /// A record committed earlier in the run came back as pending
    #[error("Pagination stalled for {subject_key}: record {record_id} is still pending after commit")]
    StalledPagination { subject_key: String, record_id: i64 },

    /// The run ended without reporting (pool shut down or the job panicked)
    #[error("Run abandoned for {0}")]
    RunAbandoned(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Whether the error means the stream connection is gone and should be rebuilt.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Redis(e) => {
                e.is_connection_dropped()
                    || e.is_connection_refusal()
                    || e.is_io_error()
                    || e.is_timeout()
            }
            Self::Io(_) => true,
            _ => false,
        }
    }
}

/// Result type for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;
