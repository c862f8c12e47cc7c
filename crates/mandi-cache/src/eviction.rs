//! Victim selection under storage pressure.
//!
//! The [`EvictionScheduler`] never touches the store itself; it turns a set of
//! candidates and a byte deficit into an [`EvictionOutcome`]. The store then
//! applies the plan atomically, or rejects the write when no plan exists.

use chrono::{DateTime, Utc};
use mandi_core::{CacheKey, Priority};

/// What the scheduler needs to know about a potential victim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionCandidate {
    /// Key of the entry.
    pub key: CacheKey,
    /// Priority tier.
    pub priority: Priority,
    /// Bytes freed by evicting it.
    pub size_bytes: u64,
    /// Whether the entry has already expired.
    pub expired: bool,
    /// Last read, or creation time if never read.
    pub last_touched: DateTime<Utc>,
}

/// Victims chosen to cover a deficit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionPlan {
    /// Keys to remove, in eviction order.
    pub victims: Vec<CacheKey>,
    /// Sum of the victims' sizes.
    pub freed_bytes: u64,
}

/// Result of planning an eviction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvictionOutcome {
    /// Removing `victims` frees at least the requested bytes.
    Plan(EvictionPlan),
    /// Even evicting every candidate would not free enough.
    Insufficient {
        /// Bytes all candidates together would free.
        reclaimable: u64,
    },
}

/// Priority- and age-aware eviction policy.
///
/// Critical entries are never candidates. The rest are ordered lowest
/// priority first, expired before live within a tier, then least recently
/// touched first.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvictionScheduler;

impl EvictionScheduler {
    /// Creates the scheduler.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Drops critical candidates and sorts the rest into eviction order.
    #[must_use]
    pub fn order(&self, candidates: impl IntoIterator<Item = EvictionCandidate>) -> Vec<EvictionCandidate> {
        let mut ordered: Vec<_> = candidates
            .into_iter()
            .filter(|c| c.priority.is_evictable())
            .collect();
        ordered.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| b.expired.cmp(&a.expired))
                .then_with(|| a.last_touched.cmp(&b.last_touched))
                .then_with(|| a.key.cmp(&b.key))
        });
        ordered
    }

    /// Chooses victims freeing at least `bytes_needed`, or reports that it cannot.
    #[must_use]
    pub fn plan(
        &self,
        candidates: impl IntoIterator<Item = EvictionCandidate>,
        bytes_needed: u64,
    ) -> EvictionOutcome {
        let mut plan = EvictionPlan::default();
        if bytes_needed == 0 {
            return EvictionOutcome::Plan(plan);
        }

        for candidate in self.order(candidates) {
            plan.freed_bytes += candidate.size_bytes;
            plan.victims.push(candidate.key);
            if plan.freed_bytes >= bytes_needed {
                return EvictionOutcome::Plan(plan);
            }
        }

        EvictionOutcome::Insufficient {
            reclaimable: plan.freed_bytes,
        }
    }
}
