//! When the next cycle is due.
//!
//! [`SyncSchedule`] is a pure recurring-timer: it only remembers when each
//! kind of cycle last ran and answers "what is due at `now`", so scheduling
//! can be tested with a manual clock.

use chrono::{DateTime, TimeDelta, Utc};
use mandi_core::{ConnectivityLevel, Priority};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::settings::SyncSettings;

/// Which items a cycle covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncScope {
    /// Every item.
    Full,
    /// Critical and high-priority items only.
    Priority,
}

impl SyncScope {
    /// Returns true if items of `priority` belong to this scope.
    #[must_use]
    pub const fn includes(&self, priority: Priority) -> bool {
        match self {
            Self::Full => true,
            Self::Priority => priority.is_priority_tier(),
        }
    }
}

impl fmt::Display for SyncScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => f.write_str("full"),
            Self::Priority => f.write_str("priority"),
        }
    }
}

/// Last run times of each kind of cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSchedule {
    last_full: Option<DateTime<Utc>>,
    last_priority: Option<DateTime<Utc>>,
}

/// `None` when the scaled interval is too large to represent; such a cycle
/// is never due.
fn scaled(interval: Duration, connectivity: ConnectivityLevel) -> Option<TimeDelta> {
    let interval = interval.checked_mul(connectivity.interval_factor())?;
    TimeDelta::from_std(interval).ok()
}

impl SyncSchedule {
    /// A schedule that has never run; both kinds are due immediately.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            last_full: None,
            last_priority: None,
        }
    }

    /// The cycle due at `now`, if any. Full cycles take precedence.
    #[must_use]
    pub fn due(
        &self,
        now: DateTime<Utc>,
        settings: &SyncSettings,
        connectivity: ConnectivityLevel,
    ) -> Option<SyncScope> {
        if !connectivity.is_online() {
            return None;
        }
        let elapsed = |last: Option<DateTime<Utc>>, every: Option<TimeDelta>| match last {
            None => true,
            Some(at) => every.is_some_and(|every| now.signed_duration_since(at) >= every),
        };
        if elapsed(self.last_full, scaled(settings.sync_interval(), connectivity)) {
            Some(SyncScope::Full)
        } else if elapsed(
            self.last_priority,
            scaled(settings.priority_interval(), connectivity),
        ) {
            Some(SyncScope::Priority)
        } else {
            None
        }
    }

    /// Earliest time a cycle becomes due.
    ///
    /// `None` if one is due already, or if neither kind can come due within
    /// the representable time range.
    #[must_use]
    pub fn next_due(
        &self,
        settings: &SyncSettings,
        connectivity: ConnectivityLevel,
    ) -> Option<DateTime<Utc>> {
        let (last_full, last_priority) = (self.last_full?, self.last_priority?);
        let after = |at: DateTime<Utc>, interval: Duration| {
            scaled(interval, connectivity).and_then(|every| at.checked_add_signed(every))
        };
        match (
            after(last_full, settings.sync_interval()),
            after(last_priority, settings.priority_interval()),
        ) {
            (Some(full), Some(priority)) => Some(full.min(priority)),
            (full, priority) => full.or(priority),
        }
    }

    /// Records that a cycle of `scope` started at `at`.
    pub fn record(&mut self, scope: SyncScope, at: DateTime<Utc>) {
        if scope == SyncScope::Full {
            self.last_full = Some(at);
        }
        self.last_priority = Some(at);
    }

    /// Start of the last full cycle.
    #[must_use]
    pub const fn last_full(&self) -> Option<DateTime<Utc>> {
        self.last_full
    }
}
