//! Offline query registrations.
//!
//! A client that cannot wait registers an [`OfflineQuery`]; it is persisted as
//! a [`RegisteredQuery`] and resolved against the cache after later sync
//! cycles.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::{
    content::hash_bytes,
    error::Result,
    filter::ContentFilter,
    priority::Priority,
    types::{CacheKey, DataType},
};

/// How long a registered query stays eligible for resolution.
pub const QUERY_TTL: Duration = Duration::from_secs(24 * 3600);

/// Stable identifier of a registered query.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QueryId(String);

impl QueryId {
    /// Wraps an existing identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A read the client wants answered once data is available.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OfflineQuery {
    /// Data type to read.
    pub data_type: DataType,
    /// Predicate over the typed content.
    #[serde(default)]
    pub filter: ContentFilter,
    /// Maximum acceptable age of results, in seconds.
    #[serde(default)]
    pub max_age_secs: Option<u64>,
    /// Requesting user, if known.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Priority of the request.
    #[serde(default)]
    pub priority: Priority,
}

impl OfflineQuery {
    /// A query for every entry of `data_type` matching `filter`.
    #[must_use]
    pub fn new(data_type: DataType, filter: ContentFilter) -> Self {
        Self {
            data_type,
            filter,
            max_age_secs: None,
            user_id: None,
            priority: Priority::default(),
        }
    }

    /// Sets the maximum acceptable result age.
    #[must_use]
    pub const fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age_secs = Some(max_age.as_secs());
        self
    }

    /// Maximum acceptable result age.
    #[must_use]
    pub fn max_age(&self) -> Option<Duration> {
        self.max_age_secs.map(Duration::from_secs)
    }

    /// Deterministic identifier: identical queries share an id.
    ///
    /// # Errors
    /// Returns [`CacheError::Parse`](crate::CacheError::Parse) if the filter cannot be encoded.
    pub fn query_id(&self) -> Result<QueryId> {
        let mut material = self.data_type.as_str().as_bytes().to_vec();
        material.extend(serde_json::to_vec(&self.filter)?);
        if let Some(age) = self.max_age_secs {
            material.extend(age.to_be_bytes());
        }
        let mut digest = hash_bytes(&material);
        digest.truncate(32);
        Ok(QueryId(digest))
    }
}

/// Lifecycle of a registered query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    /// Waiting for matching data.
    Pending,
    /// At least one matching entry was found.
    Resolved,
    /// Passed its expiry without resolving.
    Expired,
}

/// Outcome of resolving a query against the cache.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryResolution {
    /// Matching entries, most relevant first.
    pub entry_keys: Vec<CacheKey>,
    /// When the resolution ran.
    pub resolved_at: DateTime<Utc>,
    /// Oldest write among the matching entries.
    pub oldest_entry_at: Option<DateTime<Utc>>,
    /// True when no entry matched yet.
    pub partial: bool,
}

/// A persisted offline query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegisteredQuery {
    /// Identifier.
    pub id: QueryId,
    /// The request.
    pub query: OfflineQuery,
    /// Registration time.
    pub registered_at: DateTime<Utc>,
    /// After this time the query is no longer resolved.
    pub expires_at: DateTime<Utc>,
    /// Current status.
    pub status: QueryStatus,
    /// Latest resolution, if any ran.
    #[serde(default)]
    pub resolution: Option<QueryResolution>,
}

impl RegisteredQuery {
    /// Registers `query` at `now`.
    ///
    /// # Errors
    /// Returns [`CacheError::Parse`](crate::CacheError::Parse) if the id cannot be derived.
    pub fn register(query: OfflineQuery, now: DateTime<Utc>) -> Result<Self> {
        let ttl = TimeDelta::from_std(QUERY_TTL).unwrap_or(TimeDelta::MAX);
        Ok(Self {
            id: query.query_id()?,
            query,
            registered_at: now,
            expires_at: now + ttl,
            status: QueryStatus::Pending,
            resolution: None,
        })
    }

    /// Returns true once the query passed its expiry.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
