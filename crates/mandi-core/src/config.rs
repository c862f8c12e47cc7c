//! Shared configuration: how old each data type may grow.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::types::DataType;

/// Maximum acceptable age per data type.
///
/// Synced entries use this as their TTL, and the curator uses it to judge
/// freshness of essential data.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaxAgePolicy {
    /// Hours per data type; types missing from the map use the defaults.
    #[serde(default)]
    pub hours: BTreeMap<DataType, u64>,
}

impl MaxAgePolicy {
    /// Built-in maximum age in hours for `data_type`.
    #[must_use]
    pub const fn default_hours(data_type: DataType) -> u64 {
        match data_type {
            DataType::Price => 6,
            DataType::MandiInfo => 24,
            DataType::Weather => 3,
            DataType::MspRate => 168,
            DataType::UserPreference => 720,
            DataType::CropRecommendation => 24,
            DataType::MarketTrend => 12,
        }
    }

    /// Maximum age for `data_type`.
    #[must_use]
    pub fn max_age(&self, data_type: DataType) -> Duration {
        let hours = self
            .hours
            .get(&data_type)
            .copied()
            .unwrap_or_else(|| Self::default_hours(data_type));
        Duration::from_secs(hours.saturating_mul(3600))
    }

    /// Overrides the maximum age of one data type.
    #[must_use]
    pub fn with_hours(mut self, data_type: DataType, hours: u64) -> Self {
        self.hours.insert(data_type, hours);
        self
    }
}

impl Default for MaxAgePolicy {
    fn default() -> Self {
        Self {
            hours: DataType::ALL
                .into_iter()
                .map(|t| (t, Self::default_hours(t)))
                .collect(),
        }
    }
}
