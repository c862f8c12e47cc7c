//! Geographic helpers: points, bounding boxes and great-circle distance.

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

/// Mean Earth radius in kilometres.
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Kilometres per degree of latitude.
const KM_PER_DEGREE: f64 = 111.32;

/// A WGS84 coordinate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    /// Latitude in degrees, -90 to 90.
    pub lat: f64,
    /// Longitude in degrees, -180 to 180.
    pub lng: f64,
}

impl GeoPoint {
    /// Creates a new point without validation.
    #[must_use]
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Checks that both coordinates are finite and in range.
    ///
    /// # Errors
    /// Returns [`CacheError::Validation`] for out-of-range coordinates.
    pub fn validate(&self) -> Result<()> {
        if !self.lat.is_finite() || !(-90.0..=90.0).contains(&self.lat) {
            return Err(CacheError::Validation(format!(
                "latitude {} out of range",
                self.lat
            )));
        }
        if !self.lng.is_finite() || !(-180.0..=180.0).contains(&self.lng) {
            return Err(CacheError::Validation(format!(
                "longitude {} out of range",
                self.lng
            )));
        }
        Ok(())
    }

    /// Haversine distance to `other` in kilometres.
    #[must_use]
    pub fn distance_km(&self, other: &Self) -> f64 {
        let lat1 = self.lat.to_radians();
        let lat2 = other.lat.to_radians();
        let d_lat = (other.lat - self.lat).to_radians();
        let d_lng = (other.lng - self.lng).to_radians();

        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
        EARTH_RADIUS_KM * c
    }

    /// Returns true if `other` lies within `radius_km` of this point.
    #[must_use]
    pub fn is_within(&self, other: &Self, radius_km: f64) -> bool {
        self.distance_km(other) <= radius_km
    }
}

/// An axis-aligned latitude/longitude rectangle.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// South-west corner.
    pub min: GeoPoint,
    /// North-east corner.
    pub max: GeoPoint,
}

impl BoundingBox {
    /// Creates a box from two corners.
    #[must_use]
    pub const fn new(min: GeoPoint, max: GeoPoint) -> Self {
        Self { min, max }
    }

    /// The smallest box enclosing a circle of `radius_km` around `center`.
    #[must_use]
    pub fn around(center: GeoPoint, radius_km: f64) -> Self {
        let d_lat = radius_km / KM_PER_DEGREE;
        let cos_lat = center.lat.to_radians().cos().abs().max(1e-6);
        let d_lng = (radius_km / (KM_PER_DEGREE * cos_lat)).min(180.0);
        Self {
            min: GeoPoint::new((center.lat - d_lat).max(-90.0), (center.lng - d_lng).max(-180.0)),
            max: GeoPoint::new((center.lat + d_lat).min(90.0), (center.lng + d_lng).min(180.0)),
        }
    }

    /// Returns true if `point` lies inside the box (edges inclusive).
    #[must_use]
    pub fn contains(&self, point: &GeoPoint) -> bool {
        (self.min.lat..=self.max.lat).contains(&point.lat)
            && (self.min.lng..=self.max.lng).contains(&point.lng)
    }
}
