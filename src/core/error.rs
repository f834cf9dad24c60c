//! Error types for scheduler operations.

use thiserror::Error;

/// Errors produced by scheduler components.
///
/// `Clone` so that one failed batch can be reported to every batched caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// The referenced pool does not exist.
    #[error("unknown pool: {0}")]
    UnknownPool(String),
    /// A pool with this id already exists.
    #[error("pool already exists: {0}")]
    PoolExists(String),
    /// The referenced account does not exist in the pool.
    #[error("unknown account: {0}")]
    UnknownAccount(String),
    /// The operation is malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// The stored version moved underneath a compare-and-swap write.
    #[error("version conflict on pool {pool}: expected {expected:?}, found {found:?}")]
    Conflict {
        /// Pool whose state was written concurrently.
        pool: String,
        /// Version the writer based its update on.
        expected: Option<u64>,
        /// Version currently stored.
        found: Option<u64>,
    },
    /// The operation could not be committed; its outcome is unknown and it is
    /// safe to resubmit.
    #[error("unavailable: {0}")]
    Unavailable(String),
    /// The caller's deadline passed before the operation was claimed for a
    /// commit; nothing was committed and it is safe to resubmit.
    #[error("deadline exceeded")]
    DeadlineExceeded,
    /// Backend-specific failure with context.
    #[error("backend error: {0}")]
    Backend(String),
    /// Stored state could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),
}

impl SchedulerError {
    /// Validation failures caused by the caller; never retried.
    pub const fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownPool(_)
                | Self::PoolExists(_)
                | Self::UnknownAccount(_)
                | Self::InvalidRequest(_)
        )
    }

    /// Failures after which resubmitting the same operation is safe.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. } | Self::Unavailable(_) | Self::DeadlineExceeded
        )
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
