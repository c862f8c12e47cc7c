//! Backend that persists nothing.

use async_trait::async_trait;
use mandi_core::{CacheBackend, CacheEntry, CacheKey, QueryId, RegisteredQuery, Result};
use tracing::trace;

/// A backend that discards every write and loads nothing.
///
/// The store still works entirely in memory on top of it; contents are simply
/// lost when the process exits.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBackend;

impl NoopBackend {
    /// Create a new no-op backend.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CacheBackend for NoopBackend {
    async fn load_entries(&self) -> Result<Vec<CacheEntry>> {
        trace!("NoopBackend: load_entries called, returning nothing");
        Ok(Vec::new())
    }

    async fn upsert_entry(&self, _entry: &CacheEntry) -> Result<()> {
        Ok(())
    }

    async fn remove_entries(&self, keys: &[CacheKey]) -> Result<usize> {
        trace!(count = keys.len(), "NoopBackend: remove_entries called");
        Ok(keys.len())
    }

    async fn clear_entries(&self) -> Result<()> {
        Ok(())
    }

    async fn save_query(&self, _query: &RegisteredQuery) -> Result<()> {
        Ok(())
    }

    async fn load_queries(&self) -> Result<Vec<RegisteredQuery>> {
        Ok(Vec::new())
    }

    async fn remove_queries(&self, ids: &[QueryId]) -> Result<usize> {
        Ok(ids.len())
    }
}
