//! Offline query registry.
//!
//! Clients register reads they want answered once data arrives. Identical
//! queries share an id, registrations are persisted through the cache backend,
//! and every registration is re-resolved against the cache after each sync
//! cycle until it expires.

use mandi_cache::CacheStore;
use mandi_core::{
    CacheBackend, CacheError, Clock, OfflineQuery, QueryId, QueryResolution, QueryStatus,
    RegisteredQuery, Result,
};
use mandi_sync::SyncResult;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast, watch};
use tracing::{debug, info, instrument, warn};

/// Registered offline queries and their latest resolutions.
#[derive(Debug)]
pub struct QueryRegistry {
    store: Arc<CacheStore>,
    backend: Arc<dyn CacheBackend>,
    clock: Arc<dyn Clock>,
    queries: RwLock<BTreeMap<QueryId, RegisteredQuery>>,
}

impl QueryRegistry {
    /// Loads persisted registrations, discarding expired ones.
    ///
    /// # Errors
    /// Returns [`CacheError::Storage`] if the backend cannot be read.
    pub async fn load(
        store: Arc<CacheStore>,
        backend: Arc<dyn CacheBackend>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let now = clock.now();
        let (expired, live): (Vec<_>, Vec<_>) = backend
            .load_queries()
            .await?
            .into_iter()
            .partition(|q| q.is_expired(now));
        if !expired.is_empty() {
            let ids: Vec<QueryId> = expired.into_iter().map(|q| q.id).collect();
            backend.remove_queries(&ids).await?;
        }
        debug!(loaded = live.len(), "Offline queries loaded");
        Ok(Self {
            store,
            backend,
            clock,
            queries: RwLock::new(live.into_iter().map(|q| (q.id.clone(), q)).collect()),
        })
    }

    /// Registers `query` for background resolution and returns its id.
    ///
    /// Registering a query identical to a live one returns the existing id.
    ///
    /// # Errors
    /// - [`CacheError::Validation`] for an invalid filter.
    /// - [`CacheError::Storage`] if the registration cannot be persisted.
    #[instrument(skip(self, query), fields(data_type = %query.data_type))]
    pub async fn register(&self, query: OfflineQuery) -> Result<QueryId> {
        query.filter.validate()?;
        let now = self.clock.now();
        let id = query.query_id()?;

        let mut queries = self.queries.write().await;
        if queries.get(&id).is_some_and(|q| !q.is_expired(now)) {
            debug!(query_id = %id, "Query already registered");
            return Ok(id);
        }
        let registered = RegisteredQuery::register(query, now)?;
        self.backend.save_query(&registered).await?;
        queries.insert(id.clone(), registered);
        info!(query_id = %id, "Offline query registered");
        Ok(id)
    }

    /// Registration `id` with its latest resolution.
    ///
    /// A registration past its expiry is reported as expired until the next
    /// resolution pass drops it.
    ///
    /// # Errors
    /// Returns [`CacheError::NotFound`] for an unknown id.
    pub async fn get(&self, id: &QueryId) -> Result<RegisteredQuery> {
        let mut query = self
            .queries
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| CacheError::NotFound(format!("query {id}")))?;
        if query.is_expired(self.clock.now()) {
            query.status = QueryStatus::Expired;
        }
        Ok(query)
    }

    /// Live registrations.
    pub async fn len(&self) -> usize {
        self.queries.read().await.len()
    }

    /// Returns true if nothing is registered.
    pub async fn is_empty(&self) -> bool {
        self.queries.read().await.is_empty()
    }

    /// Resolves every live registration against the cache and drops expired
    /// ones. Returns how many registrations have matching data.
    ///
    /// # Errors
    /// Returns [`CacheError::Storage`] if the backend write fails.
    #[instrument(skip(self))]
    pub async fn resolve_all(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut queries = self.queries.write().await;

        let expired: Vec<QueryId> = queries
            .values()
            .filter(|q| q.is_expired(now))
            .map(|q| q.id.clone())
            .collect();
        if !expired.is_empty() {
            self.backend.remove_queries(&expired).await?;
            for id in &expired {
                queries.remove(id);
            }
            debug!(expired = expired.len(), "Dropped expired queries");
        }

        let mut resolved = 0;
        for registered in queries.values_mut() {
            let results = self
                .store
                .query(
                    registered.query.data_type,
                    &registered.query.filter,
                    registered.query.max_age(),
                )
                .await?;
            let oldest_entry_at = results.iter().map(|e| e.updated_at).min();
            let entry_keys: Vec<_> = results.keys().cloned().collect();
            let partial = entry_keys.is_empty();
            if !partial {
                resolved += 1;
            }
            registered.status = if partial {
                QueryStatus::Pending
            } else {
                QueryStatus::Resolved
            };
            registered.resolution = Some(QueryResolution {
                entry_keys,
                resolved_at: now,
                oldest_entry_at,
                partial,
            });
            self.backend.save_query(registered).await?;
        }

        debug!(resolved, total = queries.len(), "Offline queries resolved");
        Ok(resolved)
    }

    /// Resolves registrations after every sync cycle until `shutdown` fires.
    pub async fn run(
        self: Arc<Self>,
        mut results: broadcast::Receiver<SyncResult>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                received = results.recv() => match received {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        if let Err(e) = self.resolve_all().await {
                            warn!(error = %e, "Offline query resolution failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Offline query resolver stopped");
    }
}
