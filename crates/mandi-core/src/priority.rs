//! Priority tiers and connectivity levels.
//!
//! This module defines [`Priority`], which drives both eviction order and sync
//! frequency, and [`ConnectivityLevel`], the externally supplied network tier
//! that gates which priorities a sync cycle may touch.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Priority tier of a cached entry.
///
/// Ordering follows importance: `Low < Medium < High < Critical`.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Nice to have.
    Low,
    /// Useful but not essential.
    #[default]
    Medium,
    /// Important for the user experience.
    High,
    /// Essential for basic offline functionality.
    Critical,
}

impl Priority {
    /// All tiers, most important first.
    pub const ALL: [Self; 4] = [Self::Critical, Self::High, Self::Medium, Self::Low];

    /// Returns true for tiers synced on the priority interval (critical and high).
    #[must_use]
    pub const fn is_priority_tier(&self) -> bool {
        matches!(self, Self::Critical | Self::High)
    }

    /// Returns true if space-pressure eviction may remove entries of this tier.
    #[must_use]
    pub const fn is_evictable(&self) -> bool {
        !matches!(self, Self::Critical)
    }

    /// Lowercase name used in keys, logs and persisted rows.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Parses the lowercase name produced by [`Priority::as_str`].
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Network connectivity tier, supplied by the host application.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityLevel {
    /// No connectivity; no sync cycle may start.
    Offline,
    /// Below roughly 1 Mbps.
    Poor,
    /// Roughly 1-5 Mbps.
    Moderate,
    /// Above roughly 5 Mbps.
    #[default]
    Good,
}

impl ConnectivityLevel {
    /// Returns true if a sync cycle may start at this level.
    #[must_use]
    pub const fn is_online(&self) -> bool {
        !matches!(self, Self::Offline)
    }

    /// Returns true if entries of `priority` may be synced at this level.
    #[must_use]
    pub const fn allows(&self, priority: Priority) -> bool {
        match self {
            Self::Offline => false,
            Self::Poor => matches!(priority, Priority::Critical),
            Self::Moderate => priority.is_priority_tier(),
            Self::Good => true,
        }
    }

    /// Multiplier applied to sync intervals at this level.
    #[must_use]
    pub const fn interval_factor(&self) -> u32 {
        match self {
            Self::Poor => 2,
            _ => 1,
        }
    }
}

impl fmt::Display for ConnectivityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Offline => "offline",
            Self::Poor => "poor",
            Self::Moderate => "moderate",
            Self::Good => "good",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
    }

    #[test]
    fn test_priority_round_trips_through_name() {
        for p in Priority::ALL {
            assert_eq!(Priority::parse(p.as_str()), Some(p));
        }
        assert_eq!(Priority::parse("urgent"), None);
    }

    #[test]
    fn test_connectivity_gating() {
        assert!(!ConnectivityLevel::Offline.allows(Priority::Critical));
        assert!(ConnectivityLevel::Poor.allows(Priority::Critical));
        assert!(!ConnectivityLevel::Poor.allows(Priority::High));
        assert!(ConnectivityLevel::Moderate.allows(Priority::High));
        assert!(!ConnectivityLevel::Moderate.allows(Priority::Medium));
        assert!(ConnectivityLevel::Good.allows(Priority::Low));
    }
}
