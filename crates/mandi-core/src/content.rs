//! Typed payloads stored in the cache.
//!
//! Every [`DataType`] has exactly one payload struct, and [`CacheContent`] is
//! the tagged union over them. Schema checks live on each payload so that
//! writes are validated at the cache boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    error::{CacheError, Result},
    geo::GeoPoint,
    types::DataType,
};

fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(CacheError::Validation(format!("{field} must not be empty")));
    }
    Ok(())
}

fn require_non_negative(field: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(CacheError::Validation(format!(
            "{field} must be a non-negative number, got {value}"
        )));
    }
    Ok(())
}

/// A commodity price observed at a mandi.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    /// Commodity name, lowercase (e.g. "wheat").
    pub commodity: String,
    /// Optional variety or grade.
    #[serde(default)]
    pub variety: Option<String>,
    /// Identifier of the reporting mandi.
    pub mandi_id: String,
    /// Display name of the mandi.
    pub mandi_name: String,
    /// State the mandi belongs to.
    pub state: String,
    /// Location of the mandi.
    pub location: GeoPoint,
    /// Minimum traded price per unit.
    pub min_price: f64,
    /// Maximum traded price per unit.
    pub max_price: f64,
    /// Modal (most frequent) traded price per unit.
    pub modal_price: f64,
    /// Trading unit, usually "quintal".
    pub unit: String,
    /// When the price was observed at the mandi.
    pub observed_at: DateTime<Utc>,
}

impl PriceQuote {
    /// Checks the quote against its schema.
    ///
    /// # Errors
    /// Returns [`CacheError::Validation`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        require_non_empty("commodity", &self.commodity)?;
        require_non_empty("mandi_id", &self.mandi_id)?;
        require_non_empty("unit", &self.unit)?;
        self.location.validate()?;
        require_non_negative("min_price", self.min_price)?;
        require_non_negative("max_price", self.max_price)?;
        require_non_negative("modal_price", self.modal_price)?;
        if !(self.min_price <= self.modal_price && self.modal_price <= self.max_price) {
            return Err(CacheError::Validation(format!(
                "expected min <= modal <= max, got {} / {} / {}",
                self.min_price, self.modal_price, self.max_price
            )));
        }
        Ok(())
    }
}

/// Reference data for a regulated wholesale market.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MandiInfo {
    /// Mandi identifier.
    pub mandi_id: String,
    /// Display name.
    pub name: String,
    /// State.
    pub state: String,
    /// District.
    pub district: String,
    /// Location of the market yard.
    pub location: GeoPoint,
    /// Commodities traded at this mandi.
    #[serde(default)]
    pub commodities: Vec<String>,
    /// Contact number, if published.
    #[serde(default)]
    pub contact: Option<String>,
}

impl MandiInfo {
    /// Checks the mandi record against its schema.
    ///
    /// # Errors
    /// Returns [`CacheError::Validation`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        require_non_empty("mandi_id", &self.mandi_id)?;
        require_non_empty("name", &self.name)?;
        self.location.validate()
    }
}

/// Current conditions and short forecast at a location.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WeatherReport {
    /// Where the report applies.
    pub location: GeoPoint,
    /// Air temperature in degrees Celsius.
    pub temperature_c: f64,
    /// Relative humidity, 0-100.
    pub humidity_pct: f64,
    /// Rainfall over the last 24 hours in millimetres.
    pub rainfall_mm: f64,
    /// Human-readable forecast.
    pub forecast: String,
    /// Active weather alerts.
    #[serde(default)]
    pub alerts: Vec<String>,
    /// Observation time.
    pub observed_at: DateTime<Utc>,
}

impl WeatherReport {
    /// Checks the report against its schema.
    ///
    /// # Errors
    /// Returns [`CacheError::Validation`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        self.location.validate()?;
        if !self.temperature_c.is_finite() || !(-90.0..=70.0).contains(&self.temperature_c) {
            return Err(CacheError::Validation(format!(
                "temperature {} out of range",
                self.temperature_c
            )));
        }
        if !(0.0..=100.0).contains(&self.humidity_pct) {
            return Err(CacheError::Validation(format!(
                "humidity {} out of range",
                self.humidity_pct
            )));
        }
        require_non_negative("rainfall_mm", self.rainfall_mm)
    }
}

/// Government minimum support price for a commodity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MspRate {
    /// Commodity name, lowercase.
    pub commodity: String,
    /// Marketing season ("kharif" or "rabi").
    pub season: String,
    /// Crop year the rate applies to (e.g. "2024-25").
    pub crop_year: String,
    /// Support price in rupees per quintal.
    pub price_per_quintal: f64,
}

impl MspRate {
    /// Checks the rate against its schema.
    ///
    /// # Errors
    /// Returns [`CacheError::Validation`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        require_non_empty("commodity", &self.commodity)?;
        require_non_empty("crop_year", &self.crop_year)?;
        require_non_negative("price_per_quintal", self.price_per_quintal)
    }
}

/// A user's locally stored preferences.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserPreference {
    /// User identifier.
    pub user_id: String,
    /// Preferred language code.
    pub language: String,
    /// Commodities the user follows.
    #[serde(default)]
    pub commodities: Vec<String>,
    /// Home location, if shared.
    #[serde(default)]
    pub home: Option<GeoPoint>,
    /// Preferred search radius in kilometres.
    #[serde(default)]
    pub radius_km: Option<f64>,
}

impl UserPreference {
    /// Checks the preferences against their schema.
    ///
    /// # Errors
    /// Returns [`CacheError::Validation`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        require_non_empty("user_id", &self.user_id)?;
        require_non_empty("language", &self.language)?;
        if let Some(home) = &self.home {
            home.validate()?;
        }
        if let Some(radius) = self.radius_km {
            require_non_negative("radius_km", radius)?;
        }
        Ok(())
    }
}

/// Seasonal crop advice.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CropRecommendation {
    /// Season the advice targets.
    pub season: String,
    /// Region the advice applies to.
    #[serde(default)]
    pub location: Option<GeoPoint>,
    /// Recommended crops, best first.
    pub recommended_crops: Vec<String>,
    /// Known risk factors.
    #[serde(default)]
    pub risk_factors: Vec<String>,
}

impl CropRecommendation {
    /// Checks the recommendation against its schema.
    ///
    /// # Errors
    /// Returns [`CacheError::Validation`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        require_non_empty("season", &self.season)?;
        if self.recommended_crops.is_empty() {
            return Err(CacheError::Validation(
                "recommended_crops must not be empty".to_string(),
            ));
        }
        if let Some(location) = &self.location {
            location.validate()?;
        }
        Ok(())
    }
}

/// Direction of commodity prices over a recent window.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MarketTrend {
    /// Region the trend covers (state or "national").
    pub region: String,
    /// Length of the observation window in days.
    pub window_days: u32,
    /// Commodities with rising prices.
    #[serde(default)]
    pub trending_up: Vec<String>,
    /// Commodities with falling prices.
    #[serde(default)]
    pub trending_down: Vec<String>,
    /// Commodities with flat prices.
    #[serde(default)]
    pub stable: Vec<String>,
}

impl MarketTrend {
    /// Checks the trend against its schema.
    ///
    /// # Errors
    /// Returns [`CacheError::Validation`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        require_non_empty("region", &self.region)?;
        if self.window_days == 0 {
            return Err(CacheError::Validation(
                "window_days must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Tagged payload of a cache entry, one variant per [`DataType`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "data_type", content = "payload", rename_all = "snake_case")]
pub enum CacheContent {
    /// A mandi price quote.
    Price(PriceQuote),
    /// Mandi reference data.
    MandiInfo(MandiInfo),
    /// A weather report.
    Weather(WeatherReport),
    /// A minimum support price.
    MspRate(MspRate),
    /// User preferences.
    UserPreference(UserPreference),
    /// Crop advice.
    CropRecommendation(CropRecommendation),
    /// Market trend summary.
    MarketTrend(MarketTrend),
}

impl CacheContent {
    /// The data type this payload belongs to.
    #[must_use]
    pub const fn data_type(&self) -> DataType {
        match self {
            Self::Price(_) => DataType::Price,
            Self::MandiInfo(_) => DataType::MandiInfo,
            Self::Weather(_) => DataType::Weather,
            Self::MspRate(_) => DataType::MspRate,
            Self::UserPreference(_) => DataType::UserPreference,
            Self::CropRecommendation(_) => DataType::CropRecommendation,
            Self::MarketTrend(_) => DataType::MarketTrend,
        }
    }

    /// Runs the schema check of the wrapped payload.
    ///
    /// # Errors
    /// Returns [`CacheError::Validation`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Price(p) => p.validate(),
            Self::MandiInfo(m) => m.validate(),
            Self::Weather(w) => w.validate(),
            Self::MspRate(r) => r.validate(),
            Self::UserPreference(u) => u.validate(),
            Self::CropRecommendation(c) => c.validate(),
            Self::MarketTrend(t) => t.validate(),
        }
    }

    /// Validates the payload and checks it matches `expected`.
    ///
    /// # Errors
    /// Returns [`CacheError::Validation`] on a type mismatch or schema violation.
    pub fn validate_as(&self, expected: DataType) -> Result<()> {
        if self.data_type() != expected {
            return Err(CacheError::Validation(format!(
                "content of type {} cannot be stored as {}",
                self.data_type(),
                expected
            )));
        }
        self.validate()
    }

    /// Location the payload refers to, if any.
    #[must_use]
    pub fn location(&self) -> Option<GeoPoint> {
        match self {
            Self::Price(p) => Some(p.location),
            Self::MandiInfo(m) => Some(m.location),
            Self::Weather(w) => Some(w.location),
            Self::UserPreference(u) => u.home,
            Self::CropRecommendation(c) => c.location,
            Self::MspRate(_) | Self::MarketTrend(_) => None,
        }
    }

    /// State or region the payload refers to, if any.
    #[must_use]
    pub fn region(&self) -> Option<&str> {
        match self {
            Self::Price(p) => Some(&p.state),
            Self::MandiInfo(m) => Some(&m.state),
            Self::MarketTrend(t) => Some(&t.region),
            _ => None,
        }
    }

    /// Returns true if the payload concerns `commodity` (case-insensitive).
    #[must_use]
    pub fn mentions_commodity(&self, commodity: &str) -> bool {
        let eq = |c: &String| c.eq_ignore_ascii_case(commodity);
        match self {
            Self::Price(p) => p.commodity.eq_ignore_ascii_case(commodity),
            Self::MspRate(r) => r.commodity.eq_ignore_ascii_case(commodity),
            Self::MandiInfo(m) => m.commodities.iter().any(eq),
            Self::UserPreference(u) => u.commodities.iter().any(eq),
            Self::CropRecommendation(c) => c.recommended_crops.iter().any(eq),
            Self::MarketTrend(t) => t
                .trending_up
                .iter()
                .chain(&t.trending_down)
                .chain(&t.stable)
                .any(eq),
            Self::Weather(_) => false,
        }
    }

    /// Canonical JSON encoding of the payload.
    ///
    /// # Errors
    /// Returns [`CacheError::Parse`] if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Hex SHA-256 of the canonical encoding.
    ///
    /// # Errors
    /// Returns [`CacheError::Parse`] if serialization fails.
    pub fn content_hash(&self) -> Result<String> {
        Ok(hash_bytes(&self.encode()?))
    }
}

/// Hex SHA-256 of `bytes`.
#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
