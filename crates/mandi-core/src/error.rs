//! Error types for cache and sync operations.
//!
//! This module defines [`CacheError`] which covers every failure the cache,
//! the sync engine and the origin collaborators can report. Only
//! [`CacheError::Storage`] is fatal; everything else degrades to partial
//! results at the component boundary.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during cache, sync and origin operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    /// Malformed content or request. Rejected synchronously, never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The store could not free enough space for a write.
    #[error(
        "Capacity exceeded: need {required} bytes within a budget of {budget} bytes \
         ({reclaimable} bytes reclaimable)"
    )]
    Capacity {
        /// Size of the rejected entry in bytes.
        required: u64,
        /// Configured cache budget in bytes.
        budget: u64,
        /// Bytes that eviction could have freed from non-critical entries.
        reclaimable: u64,
    },

    /// The requested key, job or query does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A single sync item failed after its retries were exhausted.
    #[error("Sync of {key} failed: {reason}")]
    SyncItem {
        /// Cache key of the failed item.
        key: String,
        /// Last error observed for the item.
        reason: String,
    },

    /// The origin data service could not be reached.
    #[error("Origin unavailable: {0}")]
    OriginUnavailable(String),

    /// An operation did not finish within its deadline.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The deadline that was exceeded.
        after: Duration,
    },

    /// The origin asked the client to back off.
    #[error("Rate limited by {origin}: retry after {retry_after:?}")]
    RateLimited {
        /// The origin that rate limited the request.
        origin: String,
        /// Suggested time to wait before retrying.
        retry_after: Option<Duration>,
    },

    /// Transport-level failure talking to an origin.
    #[error("Network error: {0}")]
    Network(String),

    /// A payload could not be decoded or encoded.
    #[error("Parse error: {0}")]
    Parse(String),

    /// The persistent medium behind the cache failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A sync cycle is already running on this engine.
    #[error("A sync cycle is already in progress")]
    SyncInProgress,

    /// The device is offline; no cycle can start.
    #[error("Connectivity is offline")]
    Offline,
}

impl CacheError {
    /// Returns true if retrying the failed operation may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::OriginUnavailable(_)
                | Self::Timeout { .. }
                | Self::RateLimited { .. }
                | Self::Network(_)
        )
    }

    /// Returns true if the error is a structural failure of the cache itself.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Wraps any displayable error as a storage failure.
    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

/// Result type alias using [`CacheError`].
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(CacheError::OriginUnavailable("down".into()).is_retryable());
        assert!(CacheError::Network("reset".into()).is_retryable());
        assert!(
            CacheError::Timeout {
                operation: "fetch".into(),
                after: Duration::from_secs(1),
            }
            .is_retryable()
        );
        assert!(!CacheError::Validation("bad".into()).is_retryable());
        assert!(!CacheError::NotFound("price:wheat".into()).is_retryable());
        assert!(
            !CacheError::Capacity {
                required: 10,
                budget: 5,
                reclaimable: 0,
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_only_storage_is_fatal() {
        assert!(CacheError::Storage("disk full".into()).is_fatal());
        assert!(!CacheError::OriginUnavailable("down".into()).is_fatal());
        assert!(!CacheError::SyncInProgress.is_fatal());
    }
}
