//! What the engine keeps in sync.

use mandi_core::{CacheKey, DataType, FetchFilter, GeoPoint, Priority};
use serde::{Deserialize, Serialize};

/// One record the engine reconciles against the origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncItem {
    /// Cache key the record is stored under.
    pub key: CacheKey,
    /// Priority tier; decides scheduling and connectivity gating.
    pub priority: Priority,
    /// Parameters passed to the origin.
    pub filter: FetchFilter,
}

impl SyncItem {
    /// An item for `key` at its data type's default priority.
    #[must_use]
    pub fn new(key: CacheKey) -> Self {
        Self {
            priority: key.data_type().default_priority(),
            filter: FetchFilter::for_key(&key),
            key,
        }
    }

    /// Overrides the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Overrides the fetch parameters.
    #[must_use]
    pub fn with_filter(mut self, filter: FetchFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Data type of the item.
    #[must_use]
    pub const fn data_type(&self) -> DataType {
        self.key.data_type()
    }
}

/// Items a device needs to work offline around `location`: the support
/// price of each commodity, the local weather and the national trend.
#[must_use]
pub fn essential_items(location_id: &str, location: GeoPoint, commodities: &[String]) -> Vec<SyncItem> {
    let mut items: Vec<SyncItem> = commodities
        .iter()
        .map(|commodity| {
            let key = CacheKey::msp(commodity);
            let filter = FetchFilter::for_key(&key).with_commodity(commodity.as_str());
            SyncItem::new(key).with_filter(filter)
        })
        .collect();

    let weather = CacheKey::new(DataType::Weather, location_id);
    let filter = FetchFilter::for_key(&weather).with_location(location);
    items.push(SyncItem::new(weather).with_filter(filter));

    items.push(SyncItem::new(CacheKey::new(DataType::MarketTrend, "national")));
    items
}
