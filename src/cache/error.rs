use thiserror::Error;

use crate::store::StoreError;

/// Failures inside the cache engine.
///
/// Most public cache operations swallow these after logging them; only
/// [`CacheError::LockUnavailable`] is meant to reach application code.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to serialize cached value: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("cannot build cache key for `{prefix}`: {reason}")]
    Key { prefix: String, reason: String },
    #[error("lock `{name}` is held elsewhere; the write was not performed")]
    LockUnavailable { name: String },
    #[error("cached entry is malformed: {reason}")]
    Frame { reason: String },
}

impl CacheError {
    pub fn key(prefix: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Key {
            prefix: prefix.into(),
            reason: reason.into(),
        }
    }

    pub fn lock_unavailable(name: impl Into<String>) -> Self {
        Self::LockUnavailable { name: name.into() }
    }

    pub fn frame(reason: impl Into<String>) -> Self {
        Self::Frame {
            reason: reason.into(),
        }
    }

    /// Short label used for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Store(_) => "store",
            Self::Serialization(_) => "serialization",
            Self::Key { .. } => "key",
            Self::LockUnavailable { .. } => "lock_unavailable",
            Self::Frame { .. } => "frame",
        }
    }
}
