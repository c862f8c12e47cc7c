//! Outcome of sync cycles.

use chrono::{DateTime, Utc};
use mandi_core::{ConnectivityLevel, DataType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

use crate::schedule::SyncScope;
use crate::settings::SyncSettings;

/// State of the engine or final status of a cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// No cycle running.
    #[default]
    Idle,
    /// A cycle is running.
    Syncing,
    /// Every attempted item succeeded.
    Completed,
    /// Nothing succeeded.
    Failed,
    /// Some items succeeded and some failed.
    Partial,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Syncing => "syncing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Partial => "partial",
        };
        f.write_str(s)
    }
}

/// Record of one sync cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    /// Unique cycle identifier.
    pub sync_id: Uuid,
    /// Final status; `Syncing` while the cycle runs.
    pub status: SyncStatus,
    /// Items the cycle covered.
    pub scope: SyncScope,
    /// Connectivity when the cycle started.
    pub connectivity: ConnectivityLevel,
    /// Cycle start.
    pub started_at: DateTime<Utc>,
    /// Cycle end.
    pub completed_at: Option<DateTime<Utc>>,
    /// Items whose content changed and was written.
    pub items_synced: u64,
    /// Items fetched successfully with unchanged content.
    pub items_unchanged: u64,
    /// Items that failed after exhausting their retries.
    pub items_failed: u64,
    /// Queued local writes replayed at the start of the cycle.
    pub local_writes_applied: u64,
    /// Bytes written to the store.
    pub bytes_transferred: u64,
    /// Failure messages in the order they were recorded.
    pub errors: Vec<String>,
    /// Data types with at least one successful item.
    pub data_types_synced: BTreeSet<DataType>,
    /// True if cancellation stopped items from starting.
    pub cancelled: bool,
}

impl SyncResult {
    pub(crate) fn begin(scope: SyncScope, connectivity: ConnectivityLevel, now: DateTime<Utc>) -> Self {
        Self {
            sync_id: Uuid::new_v4(),
            status: SyncStatus::Syncing,
            scope,
            connectivity,
            started_at: now,
            completed_at: None,
            items_synced: 0,
            items_unchanged: 0,
            items_failed: 0,
            local_writes_applied: 0,
            bytes_transferred: 0,
            errors: Vec::new(),
            data_types_synced: BTreeSet::new(),
            cancelled: false,
        }
    }

    /// Items that succeeded, changed or not.
    #[must_use]
    pub const fn items_succeeded(&self) -> u64 {
        self.items_synced + self.items_unchanged
    }

    /// Items that were attempted.
    #[must_use]
    pub const fn items_attempted(&self) -> u64 {
        self.items_succeeded() + self.items_failed
    }

    /// Status implied by the item counters.
    ///
    /// A cycle with no failures is completed, including one with nothing to do.
    #[must_use]
    pub const fn outcome(&self) -> SyncStatus {
        if self.items_failed == 0 {
            SyncStatus::Completed
        } else if self.items_succeeded() > 0 {
            SyncStatus::Partial
        } else {
            SyncStatus::Failed
        }
    }

    pub(crate) fn finish(&mut self, status: SyncStatus, now: DateTime<Utc>) {
        self.status = status;
        self.completed_at = Some(now);
    }
}

/// Snapshot of the engine for status endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatusReport {
    /// Whether a cycle is running.
    pub status: SyncStatus,
    /// End of the most recent cycle.
    pub last_sync: Option<DateTime<Utc>>,
    /// Current connectivity.
    pub connectivity: ConnectivityLevel,
    /// Settings the next cycle will use.
    pub settings: SyncSettings,
    /// Local writes waiting for connectivity.
    pub pending_local_writes: usize,
    /// Items tracked in addition to cached entries.
    pub tracked_items: usize,
    /// Success rate over the history window.
    pub success_rate: f64,
    /// Most recent results, newest first.
    pub recent: Vec<SyncResult>,
}
