//! Origin data service abstraction.
//!
//! This module defines [`OriginDataService`], the remote collaborator the sync
//! engine pulls from, together with the request and response types it
//! exchanges.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

use crate::{
    content::CacheContent,
    error::Result,
    geo::GeoPoint,
    types::{CacheKey, DataType},
};

/// Parameters identifying what to fetch from the origin.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchFilter {
    /// Logical identifier of the record (the id part of its cache key).
    pub logical_id: String,
    /// Commodity the record concerns, if any.
    #[serde(default)]
    pub commodity: Option<String>,
    /// Location the record concerns, if any.
    #[serde(default)]
    pub location: Option<GeoPoint>,
}

impl FetchFilter {
    /// A filter for the record behind `key`.
    #[must_use]
    pub fn for_key(key: &CacheKey) -> Self {
        Self {
            logical_id: key.id().to_string(),
            ..Default::default()
        }
    }

    /// Sets the commodity.
    #[must_use]
    pub fn with_commodity(mut self, commodity: impl Into<String>) -> Self {
        self.commodity = Some(commodity.into());
        self
    }

    /// Sets the location.
    #[must_use]
    pub const fn with_location(mut self, location: GeoPoint) -> Self {
        self.location = Some(location);
        self
    }
}

/// A record returned by the origin.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OriginRecord {
    /// Typed payload.
    pub content: CacheContent,
    /// Hex SHA-256 of the payload as reported (or computed) for change detection.
    pub content_hash: String,
}

impl OriginRecord {
    /// Builds a record and computes its hash locally.
    ///
    /// # Errors
    /// Returns [`CacheError::Parse`](crate::CacheError::Parse) if the content cannot be encoded.
    pub fn from_content(content: CacheContent) -> Result<Self> {
        let content_hash = content.content_hash()?;
        Ok(Self {
            content,
            content_hash,
        })
    }
}

/// Remote source of truth the sync engine reconciles against.
///
/// Implementations are assumed to be independently available or unavailable;
/// every failure is reported per call and treated as a failure of that item.
#[async_trait]
pub trait OriginDataService: Send + Sync + Debug {
    /// Returns the name of this origin (e.g. "mandi-ear-http").
    fn name(&self) -> &str;

    /// Fetches one record of `data_type` identified by `filter`.
    async fn fetch(&self, data_type: DataType, filter: &FetchFilter) -> Result<OriginRecord>;
}
