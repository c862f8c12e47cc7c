//! The offline cache service: one explicitly constructed object owning the
//! store, the sync engine, the curator and the query registry.

use mandi_cache::{CacheConfig, CacheStore, NoopBackend};
use mandi_core::{
    CacheBackend, CacheEntry, CacheError, CacheKey, Clock, ConnectivityLevel, ContentFilter,
    DataType, GeoPoint, OfflineQuery, OriginDataService, QueryId, RegisteredQuery, Result,
    SystemClock,
};
use mandi_origin::{HttpOrigin, HttpOriginConfig};
use mandi_sync::{
    LocalWrite, LocalWriteOutcome, SyncConfigUpdate, SyncEngine, SyncItem, SyncResult, SyncScope,
    SyncSettings, SyncStatusReport, SyncTask, essential_items,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::curator::{
    CuratorConfig, EssentialDataCurator, EssentialDataPackage, EssentialRequest,
    OfflinePreparation,
};
use crate::queries::QueryRegistry;
use crate::reporter::{CacheStatistics, StatisticsReporter};

/// Configuration of an [`OfflineCacheService`].
///
/// The store's byte budget is `cache.max_size_bytes`; the sync settings'
/// own budget is overridden with it at build time and changes afterwards
/// only through [`OfflineCacheService::configure_sync`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Store settings.
    pub cache: CacheConfig,
    /// Sync engine settings.
    pub sync: SyncSettings,
    /// Essential bundle settings.
    pub curator: CuratorConfig,
    /// SQLite file; without one nothing is persisted.
    pub database_path: Option<PathBuf>,
    /// HTTP origin, used when no origin is supplied to the builder.
    pub origin: Option<HttpOriginConfig>,
}

impl ServiceConfig {
    /// Parses a JSON configuration; missing fields take their defaults.
    ///
    /// # Errors
    /// Returns [`CacheError::Parse`] for malformed JSON.
    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }
}

/// Builder of [`OfflineCacheService`].
#[derive(Debug, Default)]
pub struct OfflineCacheServiceBuilder {
    config: ServiceConfig,
    origin: Option<Arc<dyn OriginDataService>>,
    backend: Option<Arc<dyn CacheBackend>>,
    clock: Option<Arc<dyn Clock>>,
}

impl OfflineCacheServiceBuilder {
    /// Replaces the configuration.
    #[must_use]
    pub fn with_config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    /// Uses `origin` instead of an HTTP origin built from the configuration.
    #[must_use]
    pub fn with_origin(mut self, origin: Arc<dyn OriginDataService>) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Uses `backend` instead of the one implied by `database_path`.
    #[must_use]
    pub fn with_backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Uses `clock` instead of the system clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    fn backend(&self) -> Result<Arc<dyn CacheBackend>> {
        if let Some(backend) = &self.backend {
            return Ok(Arc::clone(backend));
        }
        match &self.config.database_path {
            #[cfg(feature = "sqlite")]
            Some(path) => Ok(Arc::new(mandi_cache::SqliteBackend::new(path)?)),
            #[cfg(not(feature = "sqlite"))]
            Some(path) => Err(CacheError::Validation(format!(
                "database_path {} requires the sqlite feature",
                path.display()
            ))),
            None => Ok(Arc::new(NoopBackend::new())),
        }
    }

    fn origin(&self) -> Result<Arc<dyn OriginDataService>> {
        if let Some(origin) = &self.origin {
            return Ok(Arc::clone(origin));
        }
        let config = self.config.origin.as_ref().ok_or_else(|| {
            CacheError::Validation("no origin supplied or configured".to_string())
        })?;
        Ok(Arc::new(HttpOrigin::from_config(config)?))
    }

    /// Opens the backend, loads persisted entries and queries, and wires the
    /// components together. Background tasks start with
    /// [`OfflineCacheService::start`].
    ///
    /// # Errors
    /// - [`CacheError::Validation`] for invalid settings or a missing origin.
    /// - [`CacheError::Storage`] if the backend cannot be opened or read.
    pub async fn build(self) -> Result<OfflineCacheService> {
        let backend = self.backend()?;
        let origin = self.origin()?;
        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        let config = self.config;

        let store = Arc::new(
            CacheStore::open(&config.cache, Arc::clone(&backend), Arc::clone(&clock)).await?,
        );
        let mut settings = config.sync.clone();
        settings.max_cache_size_bytes = config.cache.max_size_bytes;
        let engine = Arc::new(SyncEngine::new(
            Arc::clone(&store),
            Arc::clone(&origin),
            Arc::clone(&clock),
            settings,
        )?);
        let curator = Arc::new(
            EssentialDataCurator::new(Arc::clone(&store), Arc::clone(&clock), config.curator.clone())
                .with_max_age(config.sync.max_age.clone()),
        );
        let preparations = Arc::new(Preparations {
            curator: Arc::clone(&curator),
            engine: Arc::clone(&engine),
            tracked: Mutex::new(HashMap::new()),
        });
        let queries = Arc::new(QueryRegistry::load(Arc::clone(&store), backend, clock).await?);
        let reporter = StatisticsReporter::new(Arc::clone(&store), Arc::clone(&engine));

        let entries = store.len().await;
        info!(origin = origin.name(), entries, "Offline cache service built");
        Ok(OfflineCacheService {
            config,
            store,
            engine,
            curator,
            preparations,
            queries,
            reporter,
            tasks: Mutex::new(None),
        })
    }
}

/// Sync items tracked on behalf of each retained preparation job.
///
/// When a finished job is pruned its items are untracked, unless another
/// retained job still needs the same key.
#[derive(Debug)]
struct Preparations {
    curator: Arc<EssentialDataCurator>,
    engine: Arc<SyncEngine>,
    tracked: Mutex<HashMap<Uuid, Vec<CacheKey>>>,
}

impl Preparations {
    async fn track(&self, id: Uuid, items: Vec<SyncItem>) {
        let mut tracked = self.tracked.lock().await;
        let keys = items.iter().map(|item| item.key.clone()).collect();
        for item in items {
            self.engine.track(item).await;
        }
        tracked.insert(id, keys);
    }

    async fn prune(&self) -> usize {
        let pruned = self.curator.prune_finished(self.curator.config().retention()).await;
        if pruned.is_empty() {
            return 0;
        }
        let mut tracked = self.tracked.lock().await;
        let mut released: BTreeSet<CacheKey> = pruned
            .iter()
            .filter_map(|id| tracked.remove(id))
            .flatten()
            .collect();
        for keys in tracked.values() {
            for key in keys {
                released.remove(key);
            }
        }
        for key in &released {
            self.engine.untrack(key).await;
        }
        debug!(pruned = pruned.len(), untracked = released.len(), "Released pruned preparations");
        pruned.len()
    }

    async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.prune().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Preparation pruner stopped");
    }
}

#[derive(Debug)]
struct BackgroundTasks {
    sync: SyncTask,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

/// Operations of the query layer over the offline cache.
///
/// Lifecycle: [`builder`](Self::builder) → [`build`](OfflineCacheServiceBuilder::build)
/// → [`start`](Self::start) → [`shutdown`](Self::shutdown). Every operation
/// also works on a built service that was never started; syncs then only run
/// through [`sync_now`](Self::sync_now).
#[derive(Debug)]
pub struct OfflineCacheService {
    config: ServiceConfig,
    store: Arc<CacheStore>,
    engine: Arc<SyncEngine>,
    curator: Arc<EssentialDataCurator>,
    preparations: Arc<Preparations>,
    queries: Arc<QueryRegistry>,
    reporter: StatisticsReporter,
    tasks: Mutex<Option<BackgroundTasks>>,
}

impl OfflineCacheService {
    /// A builder with default configuration.
    #[must_use]
    pub fn builder() -> OfflineCacheServiceBuilder {
        OfflineCacheServiceBuilder::default()
    }

    /// The configuration the service was built with.
    #[must_use]
    pub const fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// The underlying store.
    #[must_use]
    pub const fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// The underlying sync engine.
    #[must_use]
    pub const fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Starts the sync loop, the expiry sweeper, the preparation pruner and
    /// the query resolver.
    ///
    /// Returns false if they were already running.
    pub async fn start(&self) -> bool {
        let mut tasks = self.tasks.lock().await;
        if tasks.is_some() {
            return false;
        }
        let (shutdown, signal) = watch::channel(false);
        let interval = self.config.cache.sweep_interval();
        let sweeper = tokio::spawn(Arc::clone(&self.store).run_sweeper(interval, signal.clone()));
        let pruner = tokio::spawn(Arc::clone(&self.preparations).run(interval, signal.clone()));
        let resolver = tokio::spawn(Arc::clone(&self.queries).run(self.engine.subscribe(), signal));
        *tasks = Some(BackgroundTasks {
            sync: self.engine.spawn(),
            shutdown,
            handles: vec![sweeper, pruner, resolver],
        });
        info!("Offline cache service started");
        true
    }

    /// Returns true between [`start`](Self::start) and [`shutdown`](Self::shutdown).
    pub async fn is_started(&self) -> bool {
        self.tasks.lock().await.is_some()
    }

    /// Stops the background tasks and waits for them. An in-flight sync
    /// cycle finishes first.
    pub async fn shutdown(&self) {
        let Some(tasks) = self.tasks.lock().await.take() else {
            return;
        };
        let _ = tasks.shutdown.send(true);
        tasks.sync.shutdown().await;
        for handle in tasks.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Offline cache service stopped");
    }

    /// Cached entries of `data_type` matching `filter`, most relevant first.
    /// Never contacts the origin.
    ///
    /// # Errors
    /// Returns [`CacheError::Validation`] for an invalid filter.
    pub async fn get_cached(
        &self,
        data_type: DataType,
        filter: &ContentFilter,
        max_age: Option<Duration>,
    ) -> Result<Vec<CacheEntry>> {
        Ok(self.store.query(data_type, filter, max_age).await?.into_entries())
    }

    /// Single entry lookup; counts as a hit or a miss.
    pub async fn get_entry(&self, key: &CacheKey, max_age: Option<Duration>) -> Option<CacheEntry> {
        self.store.get(key, max_age).await
    }

    /// Registers `query` for resolution after each sync cycle.
    ///
    /// # Errors
    /// - [`CacheError::Validation`] for an invalid filter.
    /// - [`CacheError::Storage`] if the registration cannot be persisted.
    pub async fn cache_query(&self, query: OfflineQuery) -> Result<QueryId> {
        self.queries.register(query).await
    }

    /// Registration `id` with its latest resolution.
    ///
    /// # Errors
    /// Returns [`CacheError::NotFound`] for an unknown id.
    pub async fn query_result(&self, id: &QueryId) -> Result<RegisteredQuery> {
        self.queries.get(id).await
    }

    /// Resolves every registered query now.
    ///
    /// # Errors
    /// Returns [`CacheError::Storage`] if the backend write fails.
    pub async fn resolve_queries(&self) -> Result<usize> {
        self.queries.resolve_all().await
    }

    fn request(&self, lat: f64, lng: f64, radius_km: Option<f64>) -> EssentialRequest {
        EssentialRequest::new(
            GeoPoint::new(lat, lng),
            radius_km.unwrap_or(self.curator.config().default_radius_km),
        )
    }

    /// Best-effort bundle from whatever is cached around (`lat`, `lng`).
    ///
    /// # Errors
    /// Returns [`CacheError::Validation`] for invalid coordinates or radius.
    pub async fn essential_data(
        &self,
        lat: f64,
        lng: f64,
        radius_km: Option<f64>,
    ) -> Result<EssentialDataPackage> {
        self.curator
            .essential_data(&self.request(lat, lng, radius_km))
            .await
    }

    /// Starts a preparation job around (`lat`, `lng`) and tracks the
    /// location's essential items for future syncs until the job is pruned.
    ///
    /// # Errors
    /// Returns [`CacheError::Validation`] for invalid coordinates or radius.
    #[instrument(skip(self, commodities))]
    pub async fn prepare_offline(
        &self,
        lat: f64,
        lng: f64,
        commodities: &[String],
        radius_km: Option<f64>,
    ) -> Result<Uuid> {
        let request = self
            .request(lat, lng, radius_km)
            .with_commodities(commodities);
        let location = request.location;
        let tracked = request.commodities.clone();
        let id = self.curator.prepare(request).await?;

        let location_id = format!("{lat:.2},{lng:.2}");
        self.preparations
            .track(id, essential_items(&location_id, location, &tracked))
            .await;
        Ok(id)
    }

    /// Forgets preparations finished longer ago than the curator's retention
    /// and stops syncing essentials no retained preparation needs. Runs on
    /// the sweep interval once started.
    pub async fn prune_preparations(&self) -> usize {
        self.preparations.prune().await
    }

    /// State of preparation `id`.
    ///
    /// # Errors
    /// Returns [`CacheError::NotFound`] for an unknown id.
    pub async fn preparation_status(&self, id: Uuid) -> Result<OfflinePreparation> {
        self.curator.status(id).await
    }

    /// Package of preparation `id`, once completed.
    ///
    /// # Errors
    /// Returns [`CacheError::NotFound`] for an unknown id.
    pub async fn preparation_package(&self, id: Uuid) -> Result<Option<EssentialDataPackage>> {
        self.curator.package(id).await
    }

    /// Cancels preparation `id`; false if it had already finished.
    ///
    /// # Errors
    /// Returns [`CacheError::NotFound`] for an unknown id.
    pub async fn cancel_preparation(&self, id: Uuid) -> Result<bool> {
        self.curator.cancel(id).await
    }

    /// Waits for preparation `id` to finish.
    ///
    /// # Errors
    /// - [`CacheError::NotFound`] for an unknown id.
    /// - [`CacheError::Timeout`] if it is still running after `timeout`.
    pub async fn wait_for_preparation(&self, id: Uuid, timeout: Duration) -> Result<OfflinePreparation> {
        self.curator.wait(id, timeout).await
    }

    /// Asks the background loop for an immediate full cycle; false if a
    /// cycle is already running.
    pub fn trigger_sync(&self) -> bool {
        self.engine.trigger_sync()
    }

    /// Runs a full cycle in the caller's task.
    ///
    /// # Errors
    /// - [`CacheError::Offline`] when connectivity is offline.
    /// - [`CacheError::SyncInProgress`] if a cycle is already running.
    /// - [`CacheError::Storage`] on a fatal store failure.
    pub async fn sync_now(&self) -> Result<SyncResult> {
        self.engine.run_cycle(SyncScope::Full).await
    }

    /// Changes intervals and budget from the next cycle on.
    ///
    /// # Errors
    /// Returns [`CacheError::Validation`] if the result is invalid.
    pub async fn configure_sync(&self, update: SyncConfigUpdate) -> Result<SyncSettings> {
        self.engine.configure(update).await
    }

    /// Removes entries created more than `older_than` ago, optionally of one
    /// type only. Without `older_than` every entry of the type goes, and
    /// with neither argument the whole cache is cleared.
    ///
    /// # Errors
    /// Returns [`CacheError::Storage`] if the backend delete fails.
    #[instrument(skip(self))]
    pub async fn clear_cache(
        &self,
        older_than: Option<Duration>,
        data_type: Option<DataType>,
    ) -> Result<usize> {
        match (older_than, data_type) {
            (Some(age), data_type) => self.store.clear_older_than(age, data_type).await,
            (None, Some(data_type)) => {
                let removed = self.store.delete_where(|e| e.data_type == data_type).await?;
                info!(removed, "Cleared entries of type");
                Ok(removed)
            }
            (None, None) => self.store.clear().await,
        }
    }

    /// Current statistics.
    pub async fn cache_stats(&self) -> CacheStatistics {
        self.reporter.report().await
    }

    /// Resets the hit, miss and eviction counters.
    pub fn reset_stats(&self) {
        self.reporter.reset();
    }

    /// Current connectivity level.
    pub async fn connectivity(&self) -> ConnectivityLevel {
        self.engine.connectivity().await
    }

    /// Reports a new connectivity level.
    pub async fn set_connectivity(&self, level: ConnectivityLevel) {
        self.engine.set_connectivity(level).await;
    }

    /// Applies or queues a write made on the device.
    ///
    /// # Errors
    /// - [`CacheError::Validation`] for an invalid write.
    /// - [`CacheError::Capacity`] or [`CacheError::Storage`] from the store.
    pub async fn submit_local_write(&self, write: LocalWrite) -> Result<LocalWriteOutcome> {
        self.engine.submit_local_write(write).await
    }

    /// Sync engine snapshot.
    pub async fn sync_status(&self) -> SyncStatusReport {
        self.engine.status_report().await
    }
}
