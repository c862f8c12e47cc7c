//! Core cache types.
//!
//! This module defines the fundamental data structures:
//!
//! - [`DataType`] - Kind of market data held by an entry
//! - [`CacheKey`] - Unique key derived from a data type and a logical id
//! - [`CacheEntry`] - A stored payload with its accounting metadata

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{
    content::CacheContent,
    error::{CacheError, Result},
    priority::Priority,
};

/// Kind of market data held by a cache entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    /// Commodity prices at a mandi.
    Price,
    /// Mandi reference data.
    MandiInfo,
    /// Weather conditions.
    Weather,
    /// Minimum support prices.
    MspRate,
    /// User preferences.
    UserPreference,
    /// Crop recommendations.
    CropRecommendation,
    /// Market trends.
    MarketTrend,
}

impl DataType {
    /// Every data type.
    pub const ALL: [Self; 7] = [
        Self::Price,
        Self::MandiInfo,
        Self::Weather,
        Self::MspRate,
        Self::UserPreference,
        Self::CropRecommendation,
        Self::MarketTrend,
    ];

    /// The types bundled into an essential offline package.
    pub const ESSENTIAL: [Self; 4] = [Self::Price, Self::MandiInfo, Self::MspRate, Self::Weather];

    /// Snake-case name, used in serialized forms and freshness maps.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Price => "price",
            Self::MandiInfo => "mandi_info",
            Self::Weather => "weather",
            Self::MspRate => "msp_rate",
            Self::UserPreference => "user_preference",
            Self::CropRecommendation => "crop_recommendation",
            Self::MarketTrend => "market_trend",
        }
    }

    /// Prefix of cache keys for this type.
    #[must_use]
    pub const fn key_prefix(&self) -> &'static str {
        match self {
            Self::Price => "price",
            Self::MandiInfo => "mandi",
            Self::Weather => "weather",
            Self::MspRate => "msp",
            Self::UserPreference => "user_pref",
            Self::CropRecommendation => "crop_rec",
            Self::MarketTrend => "trend",
        }
    }

    /// Priority assigned to synced entries of this type unless overridden.
    #[must_use]
    pub const fn default_priority(&self) -> Priority {
        match self {
            Self::Price | Self::MspRate => Priority::Critical,
            Self::MandiInfo | Self::Weather => Priority::High,
            Self::CropRecommendation | Self::MarketTrend => Priority::Medium,
            Self::UserPreference => Priority::Low,
        }
    }

    /// Parses either the snake-case name or the key prefix.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s || t.key_prefix() == s)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unique cache key: `<type prefix>:<logical id>`, e.g. `price:wheat:delhi`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CacheKey {
    data_type: DataType,
    id: String,
}

impl CacheKey {
    /// Creates a key from a data type and a logical identifier.
    #[must_use]
    pub fn new(data_type: DataType, id: impl Into<String>) -> Self {
        Self {
            data_type,
            id: id.into().trim().to_lowercase(),
        }
    }

    /// Key of a price quote for `commodity` at `mandi`.
    #[must_use]
    pub fn price(commodity: &str, mandi: &str) -> Self {
        Self::new(DataType::Price, format!("{commodity}:{mandi}"))
    }

    /// Key of the minimum support price for `commodity`.
    #[must_use]
    pub fn msp(commodity: &str) -> Self {
        Self::new(DataType::MspRate, commodity)
    }

    /// Parses a `<prefix>:<id>` string.
    ///
    /// # Errors
    /// Returns [`CacheError::Validation`] for an unknown prefix or an empty id.
    pub fn parse(s: &str) -> Result<Self> {
        let (prefix, id) = s
            .split_once(':')
            .ok_or_else(|| CacheError::Validation(format!("cache key '{s}' has no prefix")))?;
        let data_type = DataType::parse(prefix)
            .ok_or_else(|| CacheError::Validation(format!("unknown key prefix '{prefix}'")))?;
        let key = Self::new(data_type, id);
        key.validate()?;
        Ok(key)
    }

    /// Checks that the logical id is not empty.
    ///
    /// # Errors
    /// Returns [`CacheError::Validation`] for an empty id.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(CacheError::Validation(format!(
                "cache key for {} has an empty id",
                self.data_type
            )));
        }
        Ok(())
    }

    /// The data type encoded in the key.
    #[must_use]
    pub const fn data_type(&self) -> DataType {
        self.data_type
    }

    /// The logical identifier part of the key.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.data_type.key_prefix(), self.id)
    }
}

impl FromStr for CacheKey {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for CacheKey {
    type Error = CacheError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.to_string()
    }
}

/// A stored payload together with its accounting metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Unique key.
    pub key: CacheKey,
    /// Data type of the payload.
    pub data_type: DataType,
    /// Typed payload.
    pub content: CacheContent,
    /// Priority tier.
    pub priority: Priority,
    /// First write of this key.
    pub created_at: DateTime<Utc>,
    /// Most recent write of this key; never moves backwards.
    pub updated_at: DateTime<Utc>,
    /// When the entry stops being served; `None` never expires.
    pub expires_at: Option<DateTime<Utc>>,
    /// Encoded payload size, computed at write time.
    pub size_bytes: u64,
    /// Hex SHA-256 of the encoded payload.
    pub content_hash: String,
    /// Number of cache hits served from this entry.
    pub access_count: u64,
    /// Time of the last cache hit.
    pub last_accessed: Option<DateTime<Utc>>,
}

impl CacheEntry {
    /// Returns true if the entry has expired at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }

    /// Time elapsed since the last write.
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> TimeDelta {
        now.signed_duration_since(self.updated_at)
    }

    /// Returns true if the entry was written no longer than `max_age` ago.
    #[must_use]
    pub fn is_within_age(&self, now: DateTime<Utc>, max_age: std::time::Duration) -> bool {
        let limit = TimeDelta::from_std(max_age).unwrap_or(TimeDelta::MAX);
        self.age(now) <= limit
    }

    /// The last time the entry was read, falling back to its creation time.
    #[must_use]
    pub fn last_touched(&self) -> DateTime<Utc> {
        self.last_accessed.unwrap_or(self.created_at)
    }
}
