//! Cache and sync statistics.

use chrono::{DateTime, Utc};
use mandi_cache::{AccessSummary, CacheStore};
use mandi_core::DataType;
use mandi_sync::{SyncEngine, SyncStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Read-only projection of the store and the sync history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStatistics {
    /// Entries held.
    pub total_entries: usize,
    /// Bytes held.
    pub total_size_bytes: u64,
    /// Byte budget.
    pub budget_bytes: u64,
    /// Share of the budget in use.
    pub utilization: f64,
    /// Entries per data type.
    pub entries_by_type: BTreeMap<DataType, usize>,
    /// Bytes per data type.
    pub size_by_type: BTreeMap<DataType, u64>,
    /// Entries past expiry awaiting the sweeper.
    pub expired_entries: usize,
    /// Hits over hits and misses since the last reset.
    pub hit_rate: f64,
    /// Misses over hits and misses since the last reset.
    pub miss_rate: f64,
    /// Hits since the last reset.
    pub hits: u64,
    /// Misses since the last reset.
    pub misses: u64,
    /// Evictions since the last reset.
    pub evictions: u64,
    /// Last counter reset.
    pub counters_since: DateTime<Utc>,
    /// Busiest entries.
    pub most_accessed: Vec<AccessSummary>,
    /// Successful items over attempted items across the sync history.
    pub sync_success_rate: f64,
    /// Engine state.
    pub sync_status: SyncStatus,
    /// End of the last cycle.
    pub last_sync: Option<DateTime<Utc>>,
    /// Local writes waiting for connectivity.
    pub pending_local_writes: usize,
    /// When the figures were taken.
    pub generated_at: DateTime<Utc>,
}

/// Computes [`CacheStatistics`].
#[derive(Debug, Clone)]
pub struct StatisticsReporter {
    store: Arc<CacheStore>,
    engine: Arc<SyncEngine>,
}

impl StatisticsReporter {
    /// A reporter over `store` and `engine`.
    #[must_use]
    pub const fn new(store: Arc<CacheStore>, engine: Arc<SyncEngine>) -> Self {
        Self { store, engine }
    }

    /// Current statistics.
    pub async fn report(&self) -> CacheStatistics {
        let stats = self.store.stats().await;
        let sync = self.engine.status_report().await;
        let hit_rate = stats.hit_rate();
        let miss_rate = if stats.hits + stats.misses == 0 {
            0.0
        } else {
            1.0 - hit_rate
        };
        CacheStatistics {
            total_entries: stats.total_entries,
            total_size_bytes: stats.total_size_bytes,
            budget_bytes: stats.budget_bytes,
            utilization: stats.utilization(),
            entries_by_type: stats.entries_by_type,
            size_by_type: stats.size_by_type,
            expired_entries: stats.expired_entries,
            hit_rate,
            miss_rate,
            hits: stats.hits,
            misses: stats.misses,
            evictions: stats.evictions,
            counters_since: stats.counters_since,
            most_accessed: stats.most_accessed,
            sync_success_rate: sync.success_rate,
            sync_status: sync.status,
            last_sync: sync.last_sync,
            pending_local_writes: sync.pending_local_writes,
            generated_at: stats.taken_at,
        }
    }

    /// Resets the hit, miss and eviction counters.
    pub fn reset(&self) {
        self.store.reset_stats();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use mandi_cache::{CacheConfig, NoopBackend};
    use mandi_core::{CacheContent, CacheKey, ManualClock, MspRate, Priority};
    use mandi_sync::{MemoryOrigin, SyncSettings};

    async fn reporter() -> StatisticsReporter {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 6, 0, 0).unwrap(),
        ));
        let store = Arc::new(
            CacheStore::open(&CacheConfig::default(), Arc::new(NoopBackend::new()), clock.clone())
                .await
                .unwrap(),
        );
        let engine = Arc::new(
            SyncEngine::new(
                store.clone(),
                Arc::new(MemoryOrigin::new()),
                clock,
                SyncSettings::default(),
            )
            .unwrap(),
        );
        StatisticsReporter::new(store, engine)
    }

    #[tokio::test]
    async fn test_empty_report() {
        let report = reporter().await.report().await;
        assert_eq!(report.total_entries, 0);
        assert_eq!(report.hit_rate, 0.0);
        assert_eq!(report.miss_rate, 0.0);
        assert_eq!(report.sync_success_rate, 0.0);
        assert_eq!(report.sync_status, SyncStatus::Idle);
        assert!(report.last_sync.is_none());
    }

    #[tokio::test]
    async fn test_rates_and_sizes() {
        let reporter = reporter().await;
        let content = CacheContent::MspRate(MspRate {
            commodity: "wheat".to_string(),
            season: "rabi".to_string(),
            crop_year: "2024-25".to_string(),
            price_per_quintal: 2275.0,
        });
        let key = CacheKey::msp("wheat");
        let entry = reporter
            .store
            .put(key.clone(), content, DataType::MspRate, Priority::Critical, None)
            .await
            .unwrap();

        for _ in 0..3 {
            assert!(reporter.store.get(&key, None).await.is_some());
        }
        assert!(reporter.store.get(&CacheKey::msp("rice"), None).await.is_none());

        let report = reporter.report().await;
        assert!((report.hit_rate - 0.75).abs() < f64::EPSILON);
        assert!((report.miss_rate - 0.25).abs() < f64::EPSILON);
        assert_eq!(report.size_by_type[&DataType::MspRate], entry.size_bytes);
        assert_eq!(report.most_accessed[0].access_count, 3);

        reporter.reset();
        let report = reporter.report().await;
        assert_eq!(report.hits, 0);
        assert_eq!(report.total_entries, 1);
    }
}
