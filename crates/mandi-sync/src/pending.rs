//! Local writes made while offline.

use chrono::{DateTime, Utc};
use mandi_core::{CacheContent, CacheKey, Priority, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

/// A write originating on the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalWrite {
    /// Target key.
    pub key: CacheKey,
    /// New payload.
    pub content: CacheContent,
    /// Priority; defaults to the data type's priority.
    #[serde(default)]
    pub priority: Option<Priority>,
    /// When the user made the change.
    pub written_at: DateTime<Utc>,
}

impl LocalWrite {
    /// A write of `content` under `key` made at `written_at`.
    #[must_use]
    pub const fn new(key: CacheKey, content: CacheContent, written_at: DateTime<Utc>) -> Self {
        Self {
            key,
            content,
            priority: None,
            written_at,
        }
    }

    /// Effective priority of the write.
    #[must_use]
    pub fn priority(&self) -> Priority {
        self.priority
            .unwrap_or_else(|| self.key.data_type().default_priority())
    }

    /// Checks that the payload matches the key's data type and schema.
    ///
    /// # Errors
    /// Returns [`CacheError::Validation`](mandi_core::CacheError::Validation) on mismatch.
    pub fn validate(&self) -> Result<()> {
        self.key.validate()?;
        self.content.validate_as(self.key.data_type())
    }
}

/// What happened to a submitted local write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocalWriteOutcome {
    /// Written to the cache.
    Applied,
    /// The cache already held a newer version; the write was dropped.
    Superseded,
    /// Queued for replay once connectivity resumes.
    Queued,
}

/// Writes waiting for connectivity, coalesced per key.
///
/// Only the latest write per key (by `written_at`) is kept.
#[derive(Debug, Default)]
pub struct PendingWrites {
    writes: BTreeMap<CacheKey, LocalWrite>,
}

impl PendingWrites {
    /// An empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `write`; returns false if a later write to the same key is
    /// already queued.
    pub fn push(&mut self, write: LocalWrite) -> bool {
        match self.writes.entry(write.key.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(write);
                true
            }
            Entry::Occupied(mut slot) => {
                if write.written_at >= slot.get().written_at {
                    slot.insert(write);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Takes every queued write, oldest first.
    pub fn drain(&mut self) -> Vec<LocalWrite> {
        let mut writes: Vec<_> = std::mem::take(&mut self.writes).into_values().collect();
        writes.sort_by_key(|w| w.written_at);
        writes
    }

    /// Number of queued keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Returns true when nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};
    use mandi_core::{DataType, UserPreference};

    fn pref(language: &str) -> CacheContent {
        CacheContent::UserPreference(UserPreference {
            user_id: "farmer-7".to_string(),
            language: language.to_string(),
            commodities: vec!["onion".to_string()],
            home: None,
            radius_km: None,
        })
    }

    fn at(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap() + TimeDelta::minutes(minutes)
    }

    #[test]
    fn test_last_write_wins_per_key() {
        let key = CacheKey::new(DataType::UserPreference, "farmer-7");
        let mut pending = PendingWrites::new();

        assert!(pending.push(LocalWrite::new(key.clone(), pref("hi"), at(5))));
        assert!(!pending.push(LocalWrite::new(key.clone(), pref("mr"), at(1))));
        assert!(pending.push(LocalWrite::new(key.clone(), pref("ta"), at(9))));
        assert_eq!(pending.len(), 1);

        let drained = pending.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].content, pref("ta"));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_drain_orders_by_time() {
        let mut pending = PendingWrites::new();
        pending.push(LocalWrite::new(CacheKey::new(DataType::UserPreference, "b"), pref("hi"), at(3)));
        pending.push(LocalWrite::new(CacheKey::new(DataType::UserPreference, "a"), pref("hi"), at(7)));
        let keys: Vec<_> = pending.drain().into_iter().map(|w| w.key.id().to_string()).collect();
        assert_eq!(keys, vec!["b", "a"]);
    }

    #[test]
    fn test_validate_and_priority() {
        let write = LocalWrite::new(CacheKey::msp("wheat"), pref("hi"), at(0));
        assert!(write.validate().is_err());

        let write = LocalWrite::new(CacheKey::new(DataType::UserPreference, "farmer-7"), pref("hi"), at(0));
        assert!(write.validate().is_ok());
        assert_eq!(write.priority(), Priority::Low);
    }
}
