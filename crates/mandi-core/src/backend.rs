//! Persistence abstraction behind the cache store.
//!
//! This module defines the [`CacheBackend`] trait. The store keeps its working
//! set in memory and writes through to a backend so that entries and offline
//! query registrations survive restarts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt::Debug;

use crate::{
    error::Result,
    query::{QueryId, RegisteredQuery},
    types::{CacheEntry, CacheKey},
};

/// Read statistics of one stored entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessUpdate {
    /// Key of the entry.
    pub key: CacheKey,
    /// Reads since the entry was first stored.
    pub access_count: u64,
    /// Most recent read.
    pub last_accessed: Option<DateTime<Utc>>,
}

/// Durable storage for cache entries and offline queries.
///
/// Any error returned by a backend is treated as a structural failure of the
/// cache and surfaced to the caller.
#[async_trait]
pub trait CacheBackend: Send + Sync + Debug {
    /// Loads every persisted entry.
    async fn load_entries(&self) -> Result<Vec<CacheEntry>>;

    /// Inserts or replaces an entry.
    async fn upsert_entry(&self, entry: &CacheEntry) -> Result<()>;

    /// Removes entries by key.
    ///
    /// Returns the number of rows removed.
    async fn remove_entries(&self, keys: &[CacheKey]) -> Result<usize>;

    /// Removes every entry.
    async fn clear_entries(&self) -> Result<()>;

    /// Records read statistics of stored entries; keys with no row are
    /// ignored. Returns the number of rows updated.
    ///
    /// The default persists nothing.
    async fn update_access(&self, updates: &[AccessUpdate]) -> Result<usize> {
        let _ = updates;
        Ok(0)
    }

    /// Inserts or replaces an offline query registration.
    async fn save_query(&self, query: &RegisteredQuery) -> Result<()>;

    /// Loads every persisted offline query.
    async fn load_queries(&self) -> Result<Vec<RegisteredQuery>>;

    /// Removes offline queries by id.
    async fn remove_queries(&self, ids: &[QueryId]) -> Result<usize>;
}
