//! Point-in-time figures about the store's contents and traffic.

use chrono::{DateTime, Utc};
use mandi_core::{CacheKey, DataType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Number of most-accessed entries carried in a snapshot.
pub const MOST_ACCESSED_LIMIT: usize = 10;

/// One line of the most-accessed ranking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessSummary {
    /// Entry key.
    pub key: CacheKey,
    /// Data type of the entry.
    pub data_type: DataType,
    /// Hits served from it.
    pub access_count: u64,
}

/// Snapshot of the store, taken under its read lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Live entries.
    pub total_entries: usize,
    /// Sum of `size_bytes` over all entries.
    pub total_size_bytes: u64,
    /// Configured byte budget.
    pub budget_bytes: u64,
    /// Entry count per data type; types without entries are absent.
    pub entries_by_type: BTreeMap<DataType, usize>,
    /// Byte usage per data type; types without entries are absent.
    pub size_by_type: BTreeMap<DataType, u64>,
    /// Entries past their expiry that the sweeper has not removed yet.
    pub expired_entries: usize,
    /// Hits since `counters_since`.
    pub hits: u64,
    /// Misses since `counters_since`.
    pub misses: u64,
    /// Entries evicted under pressure since `counters_since`.
    pub evictions: u64,
    /// When the counters were last reset.
    pub counters_since: DateTime<Utc>,
    /// Most frequently read entries, busiest first.
    pub most_accessed: Vec<AccessSummary>,
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
}

impl StoreStats {
    /// Fraction of lookups served from the cache; zero before any lookup.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Fraction of the budget in use.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.budget_bytes == 0 {
            0.0
        } else {
            self.total_size_bytes as f64 / self.budget_bytes as f64
        }
    }
}
