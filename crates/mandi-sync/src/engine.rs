//! The sync engine.
//!
//! A [`SyncEngine`] reconciles the [`CacheStore`] with an
//! [`OriginDataService`]. Cycles are single-flight: at most one runs at a time,
//! and each works on a snapshot of the settings taken when it starts. Item
//! failures degrade the cycle to PARTIAL or FAILED; only storage failures
//! abort it.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use mandi_cache::CacheStore;
use mandi_core::{
    CacheError, CacheKey, Clock, ConnectivityLevel, OriginDataService, Result,
};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

use crate::item::SyncItem;
use crate::pending::{LocalWrite, LocalWriteOutcome, PendingWrites};
use crate::result::{SyncResult, SyncStatus, SyncStatusReport};
use crate::retry::retry;
use crate::schedule::{SyncSchedule, SyncScope};
use crate::settings::{SyncConfigUpdate, SyncSettings};

/// Results shown in a status report.
const RECENT_RESULTS: usize = 5;

/// Bounds on how long the background loop sleeps between schedule checks.
const MIN_POLL: Duration = Duration::from_secs(1);
const MAX_POLL: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct EngineState {
    status: SyncStatus,
    schedule: SyncSchedule,
    history: VecDeque<SyncResult>,
}

enum ItemChange {
    Written { bytes: u64 },
    Unchanged,
}

/// Resets the single-flight flag when a cycle ends, however it ends.
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Background reconciliation of the cache against the origin.
#[derive(Debug)]
pub struct SyncEngine {
    store: Arc<CacheStore>,
    origin: Arc<dyn OriginDataService>,
    clock: Arc<dyn Clock>,
    settings: RwLock<SyncSettings>,
    connectivity: RwLock<ConnectivityLevel>,
    state: Mutex<EngineState>,
    tracked: RwLock<BTreeMap<CacheKey, SyncItem>>,
    pending: Mutex<PendingWrites>,
    running: AtomicBool,
    cancel: AtomicBool,
    trigger: Notify,
    results: broadcast::Sender<SyncResult>,
}

impl SyncEngine {
    /// Creates an idle engine.
    ///
    /// # Errors
    /// Returns [`CacheError::Validation`] for unusable settings.
    pub fn new(
        store: Arc<CacheStore>,
        origin: Arc<dyn OriginDataService>,
        clock: Arc<dyn Clock>,
        settings: SyncSettings,
    ) -> Result<Self> {
        settings.validate()?;
        let (results, _) = broadcast::channel(16);
        Ok(Self {
            store,
            origin,
            clock,
            settings: RwLock::new(settings),
            connectivity: RwLock::new(ConnectivityLevel::default()),
            state: Mutex::new(EngineState::default()),
            tracked: RwLock::new(BTreeMap::new()),
            pending: Mutex::new(PendingWrites::new()),
            running: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
            trigger: Notify::new(),
            results,
        })
    }

    /// The store this engine writes to.
    #[must_use]
    pub const fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// Adds `item` to the set synced on every matching cycle.
    ///
    /// Cached entries are synced without being tracked; tracking seeds records
    /// that are not cached yet or overrides how a cached one is fetched.
    pub async fn track(&self, item: SyncItem) {
        debug!(key = %item.key, priority = %item.priority, "Tracking sync item");
        self.tracked.write().await.insert(item.key.clone(), item);
    }

    /// Stops tracking `key`; returns false if it was not tracked.
    pub async fn untrack(&self, key: &CacheKey) -> bool {
        self.tracked.write().await.remove(key).is_some()
    }

    /// Current connectivity level.
    pub async fn connectivity(&self) -> ConnectivityLevel {
        *self.connectivity.read().await
    }

    /// Updates the connectivity level reported by the host.
    ///
    /// Coming back online with queued local writes requests a cycle.
    #[instrument(skip(self))]
    pub async fn set_connectivity(&self, level: ConnectivityLevel) {
        let previous = std::mem::replace(&mut *self.connectivity.write().await, level);
        if previous == level {
            return;
        }
        info!(from = %previous, to = %level, "Connectivity changed");
        if !previous.is_online() && level.is_online() && !self.pending.lock().await.is_empty() {
            self.trigger_sync();
        }
    }

    /// Settings the next cycle will use.
    pub async fn settings(&self) -> SyncSettings {
        self.settings.read().await.clone()
    }

    /// Applies `update` atomically; an in-flight cycle keeps its snapshot.
    ///
    /// # Errors
    /// Returns [`CacheError::Validation`] if the result would be unusable; the
    /// settings are left unchanged in that case.
    #[instrument(skip(self))]
    pub async fn configure(&self, update: SyncConfigUpdate) -> Result<SyncSettings> {
        let mut settings = self.settings.write().await;
        let next = update.apply_to(&settings);
        next.validate()?;
        *settings = next.clone();
        info!(
            sync_interval_secs = next.sync_interval_secs,
            priority_interval_secs = next.priority_interval_secs,
            max_cache_size_bytes = next.max_cache_size_bytes,
            "Sync settings updated"
        );
        Ok(next)
    }

    /// Requests an immediate full cycle from the background loop.
    ///
    /// Returns false, and does nothing, while a cycle is running.
    pub fn trigger_sync(&self) -> bool {
        if self.running.load(Ordering::Acquire) {
            debug!("Sync already in flight, trigger ignored");
            return false;
        }
        self.trigger.notify_one();
        true
    }

    /// Stops the running cycle from starting further items.
    ///
    /// Items already in flight complete and are recorded. Returns false when
    /// no cycle is running.
    pub fn cancel_cycle(&self) -> bool {
        if !self.running.load(Ordering::Acquire) {
            return false;
        }
        self.cancel.store(true, Ordering::Release);
        warn!("Sync cycle cancellation requested");
        true
    }

    /// Returns true while a cycle runs.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Receives every finished cycle's result.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SyncResult> {
        self.results.subscribe()
    }

    /// Applies a device-side write, or queues it while offline.
    ///
    /// # Errors
    /// - [`CacheError::Validation`] if the payload does not match the key.
    /// - Store errors when the write is applied immediately.
    #[instrument(skip(self, write), fields(key = %write.key))]
    pub async fn submit_local_write(&self, write: LocalWrite) -> Result<LocalWriteOutcome> {
        write.validate()?;
        if self.connectivity().await.is_online() {
            let settings = self.settings().await;
            return self.apply_local(&write, &settings).await;
        }
        let mut pending = self.pending.lock().await;
        if pending.push(write) {
            debug!(queued = pending.len(), "Local write queued");
        } else {
            debug!("Local write older than the queued one, dropped");
        }
        Ok(LocalWriteOutcome::Queued)
    }

    /// Runs the cycle that is due now, if any.
    ///
    /// Returns `Ok(None)` when nothing is due, the device is offline, or a
    /// cycle is already running.
    ///
    /// # Errors
    /// Returns the fatal error that aborted the cycle.
    pub async fn tick(&self) -> Result<Option<SyncResult>> {
        let now = self.clock.now();
        let settings = self.settings().await;
        let connectivity = self.connectivity().await;
        let due = self.state.lock().await.schedule.due(now, &settings, connectivity);
        let Some(scope) = due else {
            return Ok(None);
        };
        match self.run_cycle(scope).await {
            Ok(result) => Ok(Some(result)),
            Err(CacheError::SyncInProgress | CacheError::Offline) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Runs one cycle over `scope` now.
    ///
    /// # Errors
    /// - [`CacheError::Offline`] if connectivity is offline.
    /// - [`CacheError::SyncInProgress`] if another cycle is running.
    /// - [`CacheError::Storage`] if the store failed; the cycle is recorded as
    ///   FAILED.
    #[instrument(skip(self), fields(scope = %scope))]
    pub async fn run_cycle(&self, scope: SyncScope) -> Result<SyncResult> {
        let connectivity = self.connectivity().await;
        if !connectivity.is_online() {
            debug!("Offline, cycle not started");
            return Err(CacheError::Offline);
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CacheError::SyncInProgress);
        }
        let _guard = CycleGuard(&self.running);
        self.cancel.store(false, Ordering::Release);

        let settings = self.settings().await;
        let started_at = self.clock.now();
        let mut result = SyncResult::begin(scope, connectivity, started_at);
        {
            let mut state = self.state.lock().await;
            state.status = SyncStatus::Syncing;
            state.schedule.record(scope, started_at);
        }
        info!(sync_id = %result.sync_id, connectivity = %connectivity, "Sync cycle started");

        match self.execute(&settings, &mut result).await {
            Ok(()) => {
                result.finish(result.outcome(), self.clock.now());
                info!(
                    sync_id = %result.sync_id,
                    status = %result.status,
                    synced = result.items_synced,
                    unchanged = result.items_unchanged,
                    failed = result.items_failed,
                    "Sync cycle finished"
                );
                self.record(result.clone(), &settings).await;
                Ok(result)
            }
            Err(err) => {
                error!(sync_id = %result.sync_id, error = %err, "Sync cycle aborted");
                result.errors.push(err.to_string());
                result.finish(SyncStatus::Failed, self.clock.now());
                self.record(result, &settings).await;
                Err(err)
            }
        }
    }

    async fn execute(&self, settings: &SyncSettings, result: &mut SyncResult) -> Result<()> {
        if self.store.budget().await != settings.max_cache_size_bytes {
            self.store.set_budget(settings.max_cache_size_bytes).await?;
        }
        self.replay_pending(settings, result).await?;

        let items = self.plan(result.scope, result.connectivity).await;
        debug!(items = items.len(), "Planned sync items");

        let outcomes: Vec<Option<(SyncItem, Result<ItemChange>)>> = stream::iter(items)
            .map(|item| async move {
                if self.cancel.load(Ordering::Acquire) {
                    return None;
                }
                let outcome = self.sync_item(&item, settings).await;
                Some((item, outcome))
            })
            .buffer_unordered(settings.max_concurrent_fetches.max(1))
            .collect()
            .await;

        let mut fatal = None;
        for outcome in outcomes {
            let Some((item, outcome)) = outcome else {
                result.cancelled = true;
                continue;
            };
            match outcome {
                Ok(ItemChange::Written { bytes }) => {
                    result.items_synced += 1;
                    result.bytes_transferred += bytes;
                    result.data_types_synced.insert(item.data_type());
                }
                Ok(ItemChange::Unchanged) => {
                    result.items_unchanged += 1;
                    result.data_types_synced.insert(item.data_type());
                }
                Err(err) if err.is_fatal() => {
                    fatal.get_or_insert(err);
                }
                Err(err) => {
                    let failure = CacheError::SyncItem {
                        key: item.key.to_string(),
                        reason: err.to_string(),
                    };
                    warn!(error = %failure, "Sync item failed");
                    result.items_failed += 1;
                    result.errors.push(failure.to_string());
                }
            }
        }

        if let Some(err) = fatal {
            return Err(err);
        }
        if result.cancelled {
            warn!(sync_id = %result.sync_id, "Sync cycle cancelled before all items started");
        }

        let swept = self.store.sweep_expired().await?;
        if swept > 0 {
            debug!(swept, "Swept expired entries after sync");
        }
        Ok(())
    }

    /// Items of `scope` allowed at `connectivity`: every cached entry plus the
    /// tracked items, tracked definitions taking precedence.
    async fn plan(&self, scope: SyncScope, connectivity: ConnectivityLevel) -> Vec<SyncItem> {
        let mut items: BTreeMap<CacheKey, SyncItem> = self
            .store
            .index()
            .await
            .into_iter()
            .map(|(key, priority)| (key.clone(), SyncItem::new(key).with_priority(priority)))
            .collect();
        for (key, item) in self.tracked.read().await.iter() {
            items.insert(key.clone(), item.clone());
        }
        items
            .into_values()
            .filter(|item| scope.includes(item.priority) && connectivity.allows(item.priority))
            .collect()
    }

    async fn sync_item(&self, item: &SyncItem, settings: &SyncSettings) -> Result<ItemChange> {
        let data_type = item.data_type();
        let operation = format!("fetch {}", item.key);
        let record = retry(&operation, &settings.retry, settings.fetch_timeout(), || {
            self.origin.fetch(data_type, &item.filter)
        })
        .await?;

        if let Some(current) = self.store.peek(&item.key).await {
            if current.content_hash == record.content_hash || current.content == record.content {
                debug!(key = %item.key, "Content unchanged");
                return Ok(ItemChange::Unchanged);
            }
        }

        let ttl = settings.max_age.max_age(data_type);
        let entry = self
            .store
            .put(item.key.clone(), record.content, data_type, item.priority, Some(ttl))
            .await?;
        Ok(ItemChange::Written {
            bytes: entry.size_bytes,
        })
    }

    async fn replay_pending(&self, settings: &SyncSettings, result: &mut SyncResult) -> Result<()> {
        let mut writes = self.pending.lock().await.drain().into_iter();
        while let Some(write) = writes.next() {
            match self.apply_local(&write, settings).await {
                Ok(LocalWriteOutcome::Applied) => result.local_writes_applied += 1,
                Ok(_) => {}
                Err(err) if err.is_fatal() => {
                    let mut pending = self.pending.lock().await;
                    pending.push(write);
                    for rest in writes.by_ref() {
                        pending.push(rest);
                    }
                    return Err(err);
                }
                Err(err) => {
                    warn!(key = %write.key, error = %err, "Local write replay failed");
                    result.errors.push(format!("local write {}: {err}", write.key));
                }
            }
        }
        if result.local_writes_applied > 0 {
            info!(applied = result.local_writes_applied, "Replayed local writes");
        }
        Ok(())
    }

    async fn apply_local(&self, write: &LocalWrite, settings: &SyncSettings) -> Result<LocalWriteOutcome> {
        let ttl = settings.max_age.max_age(write.key.data_type());
        let applied = self
            .store
            .put_if_newer(
                write.key.clone(),
                write.content.clone(),
                write.priority(),
                Some(ttl),
                write.written_at,
            )
            .await?;
        Ok(match applied {
            Some(_) => LocalWriteOutcome::Applied,
            None => {
                debug!(key = %write.key, "Local write superseded by newer data");
                LocalWriteOutcome::Superseded
            }
        })
    }

    async fn record(&self, result: SyncResult, settings: &SyncSettings) {
        {
            let mut state = self.state.lock().await;
            state.history.push_back(result.clone());
            while state.history.len() > settings.history_window {
                state.history.pop_front();
            }
            state.status = SyncStatus::Idle;
        }
        // No subscriber is not an error
        let _ = self.results.send(result);
    }

    /// Retained results, oldest first.
    pub async fn history(&self) -> Vec<SyncResult> {
        self.state.lock().await.history.iter().cloned().collect()
    }

    /// The most recent result.
    pub async fn last_result(&self) -> Option<SyncResult> {
        self.state.lock().await.history.back().cloned()
    }

    /// Successful items of COMPLETED and PARTIAL cycles over all attempted
    /// items in the history window; zero before any attempt.
    pub async fn success_rate(&self) -> f64 {
        let state = self.state.lock().await;
        success_rate(state.history.iter())
    }

    /// Engine snapshot for status endpoints.
    pub async fn status_report(&self) -> SyncStatusReport {
        let settings = self.settings().await;
        let connectivity = self.connectivity().await;
        let pending_local_writes = self.pending.lock().await.len();
        let tracked_items = self.tracked.read().await.len();
        let state = self.state.lock().await;
        SyncStatusReport {
            status: state.status,
            last_sync: state.history.back().and_then(|r| r.completed_at),
            connectivity,
            settings,
            pending_local_writes,
            tracked_items,
            success_rate: success_rate(state.history.iter()),
            recent: state.history.iter().rev().take(RECENT_RESULTS).cloned().collect(),
        }
    }

    async fn time_until_due(&self) -> Duration {
        let settings = self.settings().await;
        let connectivity = self.connectivity().await;
        let now: DateTime<Utc> = self.clock.now();
        let state = self.state.lock().await;
        if state.schedule.due(now, &settings, connectivity).is_some() {
            return Duration::ZERO;
        }
        // Nothing can come due: poll at the slowest rate
        state
            .schedule
            .next_due(&settings, connectivity)
            .map_or(MAX_POLL, |at| at.signed_duration_since(now).to_std().unwrap_or(Duration::ZERO))
    }

    /// Starts the background loop: scheduled cycles, triggered cycles, and
    /// shutdown through the returned handle.
    #[must_use]
    pub fn spawn(self: &Arc<Self>) -> SyncTask {
        let (shutdown, signal) = watch::channel(false);
        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move { engine.run_loop(signal).await });
        SyncTask { shutdown, handle }
    }

    async fn run_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("Sync loop started");
        loop {
            let wait = self.time_until_due().await.clamp(MIN_POLL, MAX_POLL);
            tokio::select! {
                () = sleep(wait) => log_outcome(self.tick().await),
                () = self.trigger.notified() => {
                    log_outcome(self.run_cycle(SyncScope::Full).await.map(Some));
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Sync loop stopped");
    }
}

fn success_rate<'a>(history: impl Iterator<Item = &'a SyncResult>) -> f64 {
    let (succeeded, attempted) = history.fold((0u64, 0u64), |(ok, total), r| {
        let ok = match r.status {
            SyncStatus::Completed | SyncStatus::Partial => ok + r.items_succeeded(),
            _ => ok,
        };
        (ok, total + r.items_attempted())
    });
    if attempted == 0 {
        0.0
    } else {
        succeeded as f64 / attempted as f64
    }
}

fn log_outcome(outcome: Result<Option<SyncResult>>) {
    match outcome {
        Ok(Some(result)) => debug!(sync_id = %result.sync_id, status = %result.status, "Scheduled cycle done"),
        Ok(None) | Err(CacheError::SyncInProgress | CacheError::Offline) => {}
        Err(err) => error!(error = %err, "Sync cycle failed"),
    }
}

/// Handle of the background sync loop.
#[derive(Debug)]
pub struct SyncTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SyncTask {
    /// Stops the loop and waits for it; an in-flight cycle finishes first.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Sync loop ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryOrigin;
    use crate::retry::RetryPolicy;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use mandi_cache::{CacheConfig, NoopBackend};
    use mandi_core::{
        CacheBackend, CacheContent, CacheEntry, DataType, ManualClock, MspRate, Priority, QueryId,
        RegisteredQuery, UserPreference,
    };

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 6, 0, 0).unwrap()
    }

    fn msp(commodity: &str, price: f64) -> CacheContent {
        CacheContent::MspRate(MspRate {
            commodity: commodity.to_string(),
            season: "rabi".to_string(),
            crop_year: "2024-25".to_string(),
            price_per_quintal: price,
        })
    }

    fn pref(language: &str) -> CacheContent {
        CacheContent::UserPreference(UserPreference {
            user_id: "farmer-7".to_string(),
            language: language.to_string(),
            commodities: vec![],
            home: None,
            radius_km: None,
        })
    }

    fn fast_settings() -> SyncSettings {
        SyncSettings {
            retry: RetryPolicy::fast(2),
            ..Default::default()
        }
    }

    struct Harness {
        engine: Arc<SyncEngine>,
        origin: Arc<MemoryOrigin>,
        clock: Arc<ManualClock>,
    }

    async fn harness_with(origin: MemoryOrigin, backend: Arc<dyn CacheBackend>, settings: SyncSettings) -> Harness {
        let clock = Arc::new(ManualClock::new(start()));
        let store = Arc::new(
            CacheStore::open(&CacheConfig::default(), backend, clock.clone())
                .await
                .unwrap(),
        );
        let origin = Arc::new(origin);
        let engine = Arc::new(SyncEngine::new(store, origin.clone(), clock.clone(), settings).unwrap());
        Harness { engine, origin, clock }
    }

    async fn harness() -> Harness {
        harness_with(MemoryOrigin::new(), Arc::new(NoopBackend::new()), fast_settings()).await
    }

    async fn seed(h: &Harness, commodities: &[&str]) {
        for commodity in commodities {
            let key = CacheKey::msp(commodity);
            h.origin.insert(key.clone(), msp(commodity, 2000.0));
            h.engine.track(SyncItem::new(key)).await;
        }
    }

    #[tokio::test]
    async fn test_second_cycle_with_unchanged_origin_writes_nothing() {
        let h = harness().await;
        seed(&h, &["wheat", "rice", "onion", "potato", "tomato"]).await;

        let first = h.engine.run_cycle(SyncScope::Full).await.unwrap();
        assert_eq!(first.items_synced, 5);
        assert_eq!(first.status, SyncStatus::Completed);
        assert!(first.bytes_transferred > 0);

        let before = h.engine.store().peek(&CacheKey::msp("wheat")).await.unwrap();
        h.clock.advance(Duration::from_secs(60));
        let second = h.engine.run_cycle(SyncScope::Full).await.unwrap();
        assert_eq!(second.items_synced, 0);
        assert_eq!(second.items_unchanged, 5);
        assert_eq!(second.status, SyncStatus::Completed);
        assert_eq!(second.bytes_transferred, 0);

        let after = h.engine.store().peek(&CacheKey::msp("wheat")).await.unwrap();
        assert_eq!(after.updated_at, before.updated_at);
    }

    #[tokio::test]
    async fn test_changed_content_is_written_with_type_ttl() {
        let h = harness().await;
        seed(&h, &["wheat"]).await;
        h.engine.run_cycle(SyncScope::Full).await.unwrap();

        h.origin.insert(CacheKey::msp("wheat"), msp("wheat", 2275.0));
        h.clock.advance(Duration::from_secs(60));
        let result = h.engine.run_cycle(SyncScope::Full).await.unwrap();
        assert_eq!(result.items_synced, 1);
        assert!(result.data_types_synced.contains(&DataType::MspRate));

        let entry = h.engine.store().peek(&CacheKey::msp("wheat")).await.unwrap();
        assert_eq!(entry.content, msp("wheat", 2275.0));
        assert_eq!(entry.priority, Priority::Critical);
        assert_eq!(
            entry.expires_at,
            Some(h.clock.now() + chrono::TimeDelta::hours(168))
        );
    }

    #[tokio::test]
    async fn test_partial_failure() {
        let h = harness().await;
        seed(&h, &["wheat", "rice", "onion"]).await;
        h.origin.fail_next(CacheKey::msp("rice"), CacheError::Network("reset".to_string()), 2);
        h.origin.fail_always(CacheKey::msp("onion"), CacheError::OriginUnavailable("503".to_string()));

        let result = h.engine.run_cycle(SyncScope::Full).await.unwrap();
        assert_eq!(result.status, SyncStatus::Partial);
        assert_eq!(result.items_synced, 2);
        assert_eq!(result.items_failed, 1);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("msp:onion"));
    }

    #[tokio::test]
    async fn test_all_items_failing_is_failed() {
        let h = harness().await;
        seed(&h, &["wheat", "rice"]).await;
        for commodity in ["wheat", "rice"] {
            h.origin.fail_always(CacheKey::msp(commodity), CacheError::OriginUnavailable("down".to_string()));
        }

        let result = h.engine.run_cycle(SyncScope::Full).await.unwrap();
        assert_eq!(result.status, SyncStatus::Failed);
        assert_eq!(result.items_failed, 2);
        assert_eq!(h.engine.status_report().await.status, SyncStatus::Idle);
    }

    #[tokio::test]
    async fn test_empty_cycle_completes() {
        let h = harness().await;
        let result = h.engine.run_cycle(SyncScope::Full).await.unwrap();
        assert_eq!(result.status, SyncStatus::Completed);
        assert_eq!(result.items_attempted(), 0);
    }

    #[tokio::test]
    async fn test_connectivity_gates_priorities() {
        let h = harness().await;
        seed(&h, &["wheat"]).await;
        let trend = CacheKey::new(DataType::MarketTrend, "national");
        h.origin.insert(
            trend.clone(),
            CacheContent::MarketTrend(mandi_core::MarketTrend {
                region: "national".to_string(),
                window_days: 7,
                trending_up: vec!["onion".to_string()],
                trending_down: vec![],
                stable: vec![],
            }),
        );
        h.engine.track(SyncItem::new(trend.clone())).await;

        h.engine.set_connectivity(ConnectivityLevel::Poor).await;
        let poor = h.engine.run_cycle(SyncScope::Full).await.unwrap();
        assert_eq!(poor.items_synced, 1);
        assert!(h.engine.store().peek(&trend).await.is_none());

        h.engine.set_connectivity(ConnectivityLevel::Offline).await;
        assert!(matches!(
            h.engine.run_cycle(SyncScope::Full).await,
            Err(CacheError::Offline)
        ));

        h.engine.set_connectivity(ConnectivityLevel::Good).await;
        let good = h.engine.run_cycle(SyncScope::Full).await.unwrap();
        assert_eq!(good.items_synced, 1);
        assert_eq!(good.items_unchanged, 1);
    }

    #[tokio::test]
    async fn test_priority_scope_skips_lower_tiers() {
        let h = harness().await;
        seed(&h, &["wheat"]).await;
        let key = CacheKey::new(DataType::MarketTrend, "national");
        h.engine.track(SyncItem::new(key)).await;

        let result = h.engine.run_cycle(SyncScope::Priority).await.unwrap();
        assert_eq!(result.items_attempted(), 1);
    }

    #[tokio::test]
    async fn test_single_flight() {
        let h = harness_with(
            MemoryOrigin::new().with_latency(Duration::from_millis(50)),
            Arc::new(NoopBackend::new()),
            fast_settings(),
        )
        .await;
        seed(&h, &["wheat"]).await;

        let (a, b) = tokio::join!(
            h.engine.run_cycle(SyncScope::Full),
            h.engine.run_cycle(SyncScope::Full)
        );
        let in_progress = [&a, &b]
            .iter()
            .filter(|r| matches!(r, Err(CacheError::SyncInProgress)))
            .count();
        assert_eq!(in_progress, 1);
        assert!(a.is_ok() || b.is_ok());
        assert!(!h.engine.is_running());
    }

    #[tokio::test]
    async fn test_cancel_stops_further_items() {
        let settings = SyncSettings {
            max_concurrent_fetches: 1,
            ..fast_settings()
        };
        let h = harness_with(
            MemoryOrigin::new().with_latency(Duration::from_millis(100)),
            Arc::new(NoopBackend::new()),
            settings,
        )
        .await;
        seed(&h, &["wheat", "rice", "onion"]).await;

        let engine = h.engine.clone();
        let cycle = tokio::spawn(async move { engine.run_cycle(SyncScope::Full).await });
        sleep(Duration::from_millis(30)).await;
        assert!(h.engine.cancel_cycle());

        let result = cycle.await.unwrap().unwrap();
        assert!(result.cancelled);
        assert_eq!(result.items_synced, 1);
        assert_eq!(result.status, SyncStatus::Completed);
        assert!(!h.engine.cancel_cycle());
    }

    #[tokio::test]
    async fn test_local_writes_queue_while_offline() {
        let h = harness().await;
        let key = CacheKey::new(DataType::UserPreference, "farmer-7");

        h.engine.set_connectivity(ConnectivityLevel::Offline).await;
        let t1 = h.clock.now();
        h.clock.advance(Duration::from_secs(10));
        let t2 = h.clock.now();
        let queued = h
            .engine
            .submit_local_write(LocalWrite::new(key.clone(), pref("ta"), t2))
            .await
            .unwrap();
        assert_eq!(queued, LocalWriteOutcome::Queued);
        h.engine
            .submit_local_write(LocalWrite::new(key.clone(), pref("hi"), t1))
            .await
            .unwrap();
        assert!(h.engine.store().peek(&key).await.is_none());
        assert_eq!(h.engine.status_report().await.pending_local_writes, 1);

        h.engine.set_connectivity(ConnectivityLevel::Good).await;
        let result = h.engine.run_cycle(SyncScope::Full).await.unwrap();
        assert_eq!(result.local_writes_applied, 1);
        assert_eq!(h.engine.store().peek(&key).await.unwrap().content, pref("ta"));

        // Online writes apply at once, and stale ones lose
        let stale = h
            .engine
            .submit_local_write(LocalWrite::new(key.clone(), pref("mr"), t1))
            .await
            .unwrap();
        assert_eq!(stale, LocalWriteOutcome::Superseded);
    }

    #[tokio::test]
    async fn test_configure_applies_from_next_cycle() {
        let h = harness().await;
        let err = h
            .engine
            .configure(SyncConfigUpdate {
                priority_interval: Some(Duration::ZERO),
                ..Default::default()
            })
            .await;
        assert!(matches!(err, Err(CacheError::Validation(_))));

        h.engine
            .configure(SyncConfigUpdate {
                max_cache_size_bytes: Some(64 * 1024),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(h.engine.store().budget().await, CacheConfig::default().max_size_bytes);

        h.engine.run_cycle(SyncScope::Full).await.unwrap();
        assert_eq!(h.engine.store().budget().await, 64 * 1024);
    }

    #[tokio::test]
    async fn test_tick_follows_the_schedule() {
        let h = harness().await;
        seed(&h, &["wheat"]).await;

        let first = h.engine.tick().await.unwrap().unwrap();
        assert_eq!(first.scope, SyncScope::Full);
        assert!(h.engine.tick().await.unwrap().is_none());

        h.clock.advance(Duration::from_secs(5 * 60));
        let second = h.engine.tick().await.unwrap().unwrap();
        assert_eq!(second.scope, SyncScope::Priority);

        h.clock.advance(Duration::from_secs(10 * 60));
        let third = h.engine.tick().await.unwrap().unwrap();
        assert_eq!(third.scope, SyncScope::Full);
    }

    #[tokio::test]
    async fn test_history_window_and_report() {
        let settings = SyncSettings {
            history_window: 3,
            ..fast_settings()
        };
        let h = harness_with(MemoryOrigin::new(), Arc::new(NoopBackend::new()), settings).await;
        seed(&h, &["wheat", "rice"]).await;
        h.origin.fail_always(CacheKey::msp("rice"), CacheError::Network("reset".to_string()));

        let mut results = h.engine.subscribe();
        for _ in 0..4 {
            h.engine.run_cycle(SyncScope::Full).await.unwrap();
        }
        assert_eq!(results.recv().await.unwrap().status, SyncStatus::Partial);

        assert_eq!(h.engine.history().await.len(), 3);
        let report = h.engine.status_report().await;
        assert_eq!(report.recent.len(), 3);
        assert!((report.success_rate - 0.5).abs() < f64::EPSILON);
        assert!(report.last_sync.is_some());
        assert_eq!(report.tracked_items, 2);
    }

    #[derive(Debug)]
    struct BrokenBackend;

    #[async_trait]
    impl CacheBackend for BrokenBackend {
        async fn load_entries(&self) -> Result<Vec<CacheEntry>> {
            Ok(Vec::new())
        }
        async fn upsert_entry(&self, _entry: &CacheEntry) -> Result<()> {
            Err(CacheError::Storage("disk full".to_string()))
        }
        async fn remove_entries(&self, keys: &[CacheKey]) -> Result<usize> {
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

    #[tokio::test]
    async fn test_storage_failure_aborts_the_cycle() {
        let h = harness_with(MemoryOrigin::new(), Arc::new(BrokenBackend), fast_settings()).await;
        seed(&h, &["wheat"]).await;

        let err = h.engine.run_cycle(SyncScope::Full).await.unwrap_err();
        assert!(err.is_fatal());
        let last = h.engine.last_result().await.unwrap();
        assert_eq!(last.status, SyncStatus::Failed);
        assert!(!h.engine.is_running());
    }

    #[tokio::test]
    async fn test_background_loop_runs_and_stops() {
        let h = harness().await;
        seed(&h, &["wheat"]).await;
        let mut results = h.engine.subscribe();

        let task = h.engine.spawn();
        assert!(h.engine.trigger_sync());
        let result = tokio::time::timeout(Duration::from_secs(5), results.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.items_synced, 1);

        task.shutdown().await;
    }
}
