//! Sync engine settings.

use mandi_cache::DEFAULT_MAX_SIZE_BYTES;
use mandi_core::{CacheError, MaxAgePolicy, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Longest accepted sync interval: one year.
pub const MAX_INTERVAL_SECS: u64 = 365 * 24 * 3600;

/// Tunables of the sync engine.
///
/// A cycle works on a snapshot taken when it starts, so changes made through
/// [`SyncEngine::configure`](crate::SyncEngine::configure) apply from the next
/// cycle on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Period of full cycles, in seconds.
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
    /// Period of critical/high-priority cycles, in seconds.
    #[serde(default = "default_priority_interval_secs")]
    pub priority_interval_secs: u64,
    /// Byte budget applied to the store at the start of each cycle.
    #[serde(default = "default_max_cache_size_bytes")]
    pub max_cache_size_bytes: u64,
    /// TTL of synced entries per data type.
    #[serde(default)]
    pub max_age: MaxAgePolicy,
    /// Per-item retry policy.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Deadline of a single origin fetch, in seconds.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// Origin fetches in flight at once.
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,
    /// Results kept in the history ring.
    #[serde(default = "default_history_window")]
    pub history_window: usize,
}

fn default_sync_interval_secs() -> u64 {
    15 * 60
}

fn default_priority_interval_secs() -> u64 {
    5 * 60
}

fn default_max_cache_size_bytes() -> u64 {
    DEFAULT_MAX_SIZE_BYTES
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

fn default_max_concurrent_fetches() -> usize {
    4
}

fn default_history_window() -> usize {
    100
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            sync_interval_secs: default_sync_interval_secs(),
            priority_interval_secs: default_priority_interval_secs(),
            max_cache_size_bytes: default_max_cache_size_bytes(),
            max_age: MaxAgePolicy::default(),
            retry: RetryPolicy::default(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            max_concurrent_fetches: default_max_concurrent_fetches(),
            history_window: default_history_window(),
        }
    }
}

impl SyncSettings {
    /// Period of full cycles.
    #[must_use]
    pub const fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    /// Period of priority cycles.
    #[must_use]
    pub const fn priority_interval(&self) -> Duration {
        Duration::from_secs(self.priority_interval_secs)
    }

    /// Deadline of a single origin fetch.
    #[must_use]
    pub const fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Checks that intervals, budget and limits are usable.
    ///
    /// # Errors
    /// Returns [`CacheError::Validation`] naming the offending setting.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("sync_interval_secs", self.sync_interval_secs),
            ("priority_interval_secs", self.priority_interval_secs),
            ("max_cache_size_bytes", self.max_cache_size_bytes),
            ("fetch_timeout_secs", self.fetch_timeout_secs),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(CacheError::Validation(format!("{name} must be positive")));
            }
        }
        let intervals = [
            ("sync_interval_secs", self.sync_interval_secs),
            ("priority_interval_secs", self.priority_interval_secs),
            ("fetch_timeout_secs", self.fetch_timeout_secs),
        ];
        for (name, value) in intervals {
            if value > MAX_INTERVAL_SECS {
                return Err(CacheError::Validation(format!(
                    "{name} must be at most {MAX_INTERVAL_SECS}"
                )));
            }
        }
        if self.max_concurrent_fetches == 0 || self.history_window == 0 {
            return Err(CacheError::Validation(
                "max_concurrent_fetches and history_window must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Partial update applied by `configure_sync`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfigUpdate {
    /// New full-cycle period.
    #[serde(default)]
    pub sync_interval: Option<Duration>,
    /// New priority-cycle period.
    #[serde(default)]
    pub priority_interval: Option<Duration>,
    /// New byte budget.
    #[serde(default)]
    pub max_cache_size_bytes: Option<u64>,
}

/// Whole seconds in `interval`, rounding any fraction up.
fn ceil_secs(interval: Duration) -> u64 {
    interval
        .as_secs()
        .saturating_add(u64::from(interval.subsec_nanos() > 0))
}

impl SyncConfigUpdate {
    /// Returns `settings` with this update applied.
    ///
    /// Intervals are stored in whole seconds; fractions round up.
    #[must_use]
    pub fn apply_to(&self, settings: &SyncSettings) -> SyncSettings {
        let mut next = settings.clone();
        if let Some(interval) = self.sync_interval {
            next.sync_interval_secs = ceil_secs(interval);
        }
        if let Some(interval) = self.priority_interval {
            next.priority_interval_secs = ceil_secs(interval);
        }
        if let Some(bytes) = self.max_cache_size_bytes {
            next.max_cache_size_bytes = bytes;
        }
        next
    }
}
