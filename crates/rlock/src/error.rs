//! Error types for lock acquisition, renewal and release

use std::sync::Arc;
use std::time::Duration;

/// Failure talking to the backing key-value store.
///
/// The outcome of the command that produced this error is unknown: it may or
/// may not have been applied on the store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("unexpected store reply: {0}")]
    UnexpectedReply(String),

    #[error("store backend error: {0}")]
    Backend(#[source] Arc<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    /// Wrap a backend-specific error.
    pub fn backend<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend(Arc::new(err))
    }
}

/// Error type for lock operations
///
/// `Clone` so that callers sharing one coalesced acquisition all observe the
/// same outcome.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LockError {
    /// The key is held by another owner, or retries ran out while it was.
    #[error("lock contended: {key} is held by another owner")]
    Contended {
        key: String,
        #[source]
        source: Option<Box<LockError>>,
    },

    /// The ownership token no longer matches the stored value.
    #[error("lock not held: {key}")]
    NotHeld { key: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("store round-trip timed out after {0:?}")]
    Timeout(Duration),

    #[error("lock operation cancelled")]
    Cancelled,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl LockError {
    pub(crate) fn contended(key: &str) -> Self {
        Self::Contended {
            key: key.to_string(),
            source: None,
        }
    }

    pub(crate) fn not_held(key: &str) -> Self {
        Self::NotHeld {
            key: key.to_string(),
        }
    }

    /// The lock was definitely not acquired.
    pub fn is_contended(&self) -> bool {
        matches!(self, Self::Contended { .. })
    }

    /// The lock was definitely lost.
    pub fn is_not_held(&self) -> bool {
        matches!(self, Self::NotHeld { .. })
    }

    /// The store outcome is unknown.
    pub fn is_store_error(&self) -> bool {
        matches!(self, Self::Store(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, LockError>;
