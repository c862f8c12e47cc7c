//! Predicates over typed cache content.
//!
//! [`ContentFilter`] is the serializable predicate used by cache queries,
//! offline query registrations and the essential-data curator. It also scores
//! entries so query results can be ordered by relevance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    content::CacheContent,
    error::{CacheError, Result},
    geo::{BoundingBox, GeoPoint},
    types::CacheEntry,
};

/// Staple commodities that receive a relevance boost.
pub const ESSENTIAL_COMMODITIES: [&str; 5] = ["wheat", "rice", "onion", "potato", "tomato"];

/// Distance, in kilometres, beyond which proximity adds nothing to relevance.
const DISTANCE_SCALE_KM: f64 = 100.0;

/// Age, in hours, beyond which freshness adds nothing to relevance.
const FRESHNESS_SCALE_HOURS: f64 = 24.0;

/// A circle around a point.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Proximity {
    /// Centre of the search area.
    pub center: GeoPoint,
    /// Search radius in kilometres.
    pub radius_km: f64,
}

/// Conjunction of optional conditions over [`CacheContent`].
///
/// An empty filter matches everything.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentFilter {
    /// Match any of these commodities; empty means no commodity condition.
    #[serde(default)]
    pub commodities: Vec<String>,
    /// Match this state or region exactly (case-insensitive).
    #[serde(default)]
    pub region: Option<String>,
    /// Match content located within a radius.
    #[serde(default)]
    pub near: Option<Proximity>,
    /// Match content located inside a bounding box.
    #[serde(default)]
    pub bbox: Option<BoundingBox>,
}

impl ContentFilter {
    /// A filter that matches everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a commodity to the any-of set.
    #[must_use]
    pub fn with_commodity(mut self, commodity: impl Into<String>) -> Self {
        self.commodities.push(commodity.into().to_lowercase());
        self
    }

    /// Adds several commodities to the any-of set.
    #[must_use]
    pub fn with_commodities<I, S>(mut self, commodities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.commodities
            .extend(commodities.into_iter().map(|c| c.into().to_lowercase()));
        self
    }

    /// Restricts matches to one state or region.
    #[must_use]
    pub fn in_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Restricts matches to content within `radius_km` of `center`.
    #[must_use]
    pub const fn near(mut self, center: GeoPoint, radius_km: f64) -> Self {
        self.near = Some(Proximity { center, radius_km });
        self
    }

    /// Restricts matches to content inside `bbox`.
    #[must_use]
    pub const fn within_box(mut self, bbox: BoundingBox) -> Self {
        self.bbox = Some(bbox);
        self
    }

    /// Checks the filter's own parameters.
    ///
    /// # Errors
    /// Returns [`CacheError::Validation`] for a bad centre or negative radius.
    pub fn validate(&self) -> Result<()> {
        if let Some(near) = &self.near {
            near.center.validate()?;
            if !near.radius_km.is_finite() || near.radius_km < 0.0 {
                return Err(CacheError::Validation(format!(
                    "radius {} must be a non-negative number",
                    near.radius_km
                )));
            }
        }
        if let Some(bbox) = &self.bbox {
            bbox.min.validate()?;
            bbox.max.validate()?;
        }
        Ok(())
    }

    /// Returns true if `content` satisfies every condition.
    #[must_use]
    pub fn matches(&self, content: &CacheContent) -> bool {
        if !self.commodities.is_empty()
            && !self.commodities.iter().any(|c| content.mentions_commodity(c))
        {
            return false;
        }
        if let Some(region) = &self.region {
            match content.region() {
                Some(r) if r.eq_ignore_ascii_case(region) => {}
                _ => return false,
            }
        }
        if self.near.is_some() || self.bbox.is_some() {
            let Some(location) = content.location() else {
                return false;
            };
            if let Some(near) = &self.near {
                if !near.center.is_within(&location, near.radius_km) {
                    return false;
                }
            }
            if let Some(bbox) = &self.bbox {
                if !bbox.contains(&location) {
                    return false;
                }
            }
        }
        true
    }

    /// Relevance score of `entry`; higher is more relevant.
    ///
    /// Weighs proximity to the search centre, freshness and whether the entry
    /// concerns a staple commodity at 0.4 / 0.4 / 0.2.
    #[must_use]
    pub fn relevance(&self, entry: &CacheEntry, now: DateTime<Utc>) -> f64 {
        let distance_score = match (&self.near, entry.content.location()) {
            (Some(near), Some(location)) => {
                (DISTANCE_SCALE_KM - near.center.distance_km(&location)).max(0.0)
            }
            _ => 0.0,
        };

        let hours_old = entry.age(now).num_seconds().max(0) as f64 / 3600.0;
        let freshness_score = (FRESHNESS_SCALE_HOURS - hours_old).max(0.0);

        let commodity_score = if ESSENTIAL_COMMODITIES
            .iter()
            .any(|c| entry.content.mentions_commodity(c))
        {
            10.0
        } else {
            5.0
        };

        distance_score * 0.4 + freshness_score * 0.4 + commodity_score * 0.2
    }
}
