//! The cache store: an in-memory working set with write-through persistence.

use chrono::{DateTime, TimeDelta, Utc};
use mandi_core::{
    AccessUpdate, CacheBackend, CacheContent, CacheEntry, CacheError, CacheKey, Clock,
    ContentFilter, DataType, Priority, Result, hash_bytes,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::eviction::{EvictionCandidate, EvictionOutcome, EvictionScheduler};
use crate::stats::{AccessSummary, MOST_ACCESSED_LIMIT, StoreStats};

/// Default byte budget: 100 MiB.
pub const DEFAULT_MAX_SIZE_BYTES: u64 = 100 * 1024 * 1024;

/// Store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Upper bound on the summed size of all entries.
    pub max_size_bytes: u64,
    /// Period of the background expiry sweep, in seconds.
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: DEFAULT_MAX_SIZE_BYTES,
            sweep_interval_secs: 600,
        }
    }
}

impl CacheConfig {
    /// Period of the background expiry sweep.
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

const NEVER_ACCESSED: i64 = i64::MIN;

/// An entry plus its read statistics, updated without the write lock.
#[derive(Debug)]
struct StoredEntry {
    entry: CacheEntry,
    access_count: AtomicU64,
    last_accessed_ms: AtomicI64,
    /// Read since the statistics were last persisted.
    dirty: AtomicBool,
}

impl StoredEntry {
    fn new(entry: CacheEntry) -> Self {
        let last_accessed_ms = entry
            .last_accessed
            .map_or(NEVER_ACCESSED, |t| t.timestamp_millis());
        Self {
            access_count: AtomicU64::new(entry.access_count),
            last_accessed_ms: AtomicI64::new(last_accessed_ms),
            dirty: AtomicBool::new(false),
            entry,
        }
    }

    fn record_access(&self, now: DateTime<Utc>) {
        self.access_count.fetch_add(1, Ordering::Relaxed);
        self.last_accessed_ms
            .fetch_max(now.timestamp_millis(), Ordering::Relaxed);
        self.dirty.store(true, Ordering::Release);
    }

    fn access_update(&self) -> AccessUpdate {
        AccessUpdate {
            key: self.entry.key.clone(),
            access_count: self.access_count(),
            last_accessed: self.last_accessed(),
        }
    }

    fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }

    fn last_accessed(&self) -> Option<DateTime<Utc>> {
        match self.last_accessed_ms.load(Ordering::Relaxed) {
            NEVER_ACCESSED => None,
            ms => DateTime::from_timestamp_millis(ms),
        }
    }

    fn candidate(&self, now: DateTime<Utc>) -> EvictionCandidate {
        EvictionCandidate {
            key: self.entry.key.clone(),
            priority: self.entry.priority,
            size_bytes: self.entry.size_bytes,
            expired: self.entry.is_expired(now),
            last_touched: self.last_accessed().unwrap_or(self.entry.created_at),
        }
    }

    fn snapshot(&self) -> CacheEntry {
        let mut entry = self.entry.clone();
        entry.access_count = self.access_count();
        entry.last_accessed = self.last_accessed();
        entry
    }
}

/// Size accounting. `total_bytes` counts stored entries plus the net size of
/// writes that have reserved room but are still being persisted.
#[derive(Debug)]
struct SizeLedger {
    total_bytes: u64,
    budget_bytes: u64,
}

impl SizeLedger {
    fn projected(&self, replaced_bytes: u64, size_bytes: u64) -> u64 {
        self.total_bytes.saturating_sub(replaced_bytes) + size_bytes
    }
}

/// Per-key write locks. A key has a slot only while its lock is held or
/// awaited.
#[derive(Debug, Default)]
struct KeyLocks {
    slots: StdMutex<HashMap<CacheKey, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    fn slot(&self, key: &CacheKey) -> Arc<Mutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(key.clone()).or_default())
    }

    async fn lock(&self, key: &CacheKey) -> KeyGuard<'_> {
        let guard = self.slot(key).lock_owned().await;
        KeyGuard {
            locks: self,
            key: key.clone(),
            guard: Some(guard),
        }
    }

    fn try_lock(&self, key: &CacheKey) -> Option<KeyGuard<'_>> {
        match self.slot(key).try_lock_owned() {
            Ok(guard) => Some(KeyGuard {
                locks: self,
                key: key.clone(),
                guard: Some(guard),
            }),
            Err(_) => {
                self.release(key);
                None
            }
        }
    }

    fn is_locked(&self, key: &CacheKey) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    fn release(&self, key: &CacheKey) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if slots.get(key).is_some_and(|slot| Arc::strong_count(slot) == 1) {
            slots.remove(key);
        }
    }
}

#[derive(Debug)]
struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: CacheKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks.release(&self.key);
    }
}

/// A write request after argument unpacking.
struct Write {
    key: CacheKey,
    content: CacheContent,
    data_type: DataType,
    priority: Priority,
    ttl: Option<Duration>,
    written_at: Option<DateTime<Utc>>,
}

enum WriteOutcome {
    Written(CacheEntry),
    Stale(CacheEntry),
}

/// Entries matching a query, most relevant first.
///
/// The result holds a snapshot of the matching entries; iterating it never
/// blocks writers and can be restarted any number of times.
#[derive(Debug, Clone, Default)]
pub struct QueryResults {
    items: Vec<Arc<StoredEntry>>,
}

impl QueryResults {
    /// Number of matching entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true when nothing matched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterates the matching entries in relevance order.
    pub fn iter(&self) -> impl Iterator<Item = CacheEntry> + '_ {
        self.items.iter().map(|s| s.snapshot())
    }

    /// Keys of the matching entries in relevance order.
    pub fn keys(&self) -> impl Iterator<Item = &CacheKey> + '_ {
        self.items.iter().map(|s| &s.entry.key)
    }

    /// Collects the matching entries.
    #[must_use]
    pub fn into_entries(self) -> Vec<CacheEntry> {
        self.items.iter().map(|s| s.snapshot()).collect()
    }
}

/// Bounded, priority-aware store of typed market data.
///
/// Reads take a shared lock only. Writes to one key are serialized by a
/// per-key lock; writes to distinct keys hold the size ledger just long enough
/// to reserve room (evicting if needed) and persist in parallel. Entries are
/// written through to the [`CacheBackend`] before they become visible, and
/// removals leave keys with a write in flight to that write.
#[derive(Debug)]
pub struct CacheStore {
    entries: RwLock<HashMap<CacheKey, Arc<StoredEntry>>>,
    ledger: Mutex<SizeLedger>,
    key_locks: KeyLocks,
    /// Held shared by writes and exclusively by `clear`.
    writers: RwLock<()>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    counters_since_ms: AtomicI64,
    backend: Arc<dyn CacheBackend>,
    clock: Arc<dyn Clock>,
    scheduler: EvictionScheduler,
}

impl CacheStore {
    /// Opens the store, loading every unexpired entry from `backend`.
    ///
    /// Expired rows are deleted from the backend on the way in. If the loaded
    /// entries exceed the budget, evictable entries are dropped until they fit.
    ///
    /// # Errors
    /// Returns [`CacheError::Storage`] if the backend cannot be read.
    #[instrument(skip_all, fields(budget = config.max_size_bytes))]
    pub async fn open(
        config: &CacheConfig,
        backend: Arc<dyn CacheBackend>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let now = clock.now();
        let mut expired = Vec::new();
        let mut entries = HashMap::new();
        let mut total_bytes = 0;

        for entry in backend.load_entries().await? {
            if entry.is_expired(now) {
                expired.push(entry.key);
                continue;
            }
            total_bytes += entry.size_bytes;
            entries.insert(entry.key.clone(), Arc::new(StoredEntry::new(entry)));
        }
        if !expired.is_empty() {
            backend.remove_entries(&expired).await?;
        }

        let loaded = entries.len();
        let store = Self {
            entries: RwLock::new(entries),
            ledger: Mutex::new(SizeLedger {
                total_bytes,
                budget_bytes: config.max_size_bytes,
            }),
            key_locks: KeyLocks::default(),
            writers: RwLock::new(()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            counters_since_ms: AtomicI64::new(now.timestamp_millis()),
            backend,
            clock,
            scheduler: EvictionScheduler::new(),
        };

        {
            let mut ledger = store.ledger.lock().await;
            store.enforce_budget(&mut ledger).await?;
        }

        info!(
            loaded,
            dropped_expired = expired.len(),
            total_bytes,
            "Cache store opened"
        );
        Ok(store)
    }

    /// Current time as seen by the store.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Stores `content` under `key`, evicting lower-priority entries if needed.
    ///
    /// Overwriting keeps the original `created_at` and never moves
    /// `updated_at` backwards. With a `ttl` the entry expires at `now + ttl`.
    ///
    /// # Errors
    /// - [`CacheError::Validation`] if key, data type and content disagree or
    ///   the content violates its schema.
    /// - [`CacheError::Capacity`] if the entry cannot fit even after evicting
    ///   every evictable entry; nothing is evicted in that case.
    /// - [`CacheError::Storage`] if the backend write fails.
    #[instrument(skip(self, content, ttl), fields(key = %key, priority = %priority))]
    pub async fn put(
        &self,
        key: CacheKey,
        content: CacheContent,
        data_type: DataType,
        priority: Priority,
        ttl: Option<Duration>,
    ) -> Result<CacheEntry> {
        let outcome = self
            .write(Write {
                key,
                content,
                data_type,
                priority,
                ttl,
                written_at: None,
            })
            .await?;
        match outcome {
            WriteOutcome::Written(entry) | WriteOutcome::Stale(entry) => Ok(entry),
        }
    }

    /// Like [`put`](Self::put), but stamps the write with `written_at` and drops
    /// it when the stored entry was updated later.
    ///
    /// Returns `None` for a dropped write.
    ///
    /// # Errors
    /// Same as [`put`](Self::put).
    #[instrument(skip(self, content, ttl), fields(key = %key, written_at = %written_at))]
    pub async fn put_if_newer(
        &self,
        key: CacheKey,
        content: CacheContent,
        priority: Priority,
        ttl: Option<Duration>,
        written_at: DateTime<Utc>,
    ) -> Result<Option<CacheEntry>> {
        let data_type = key.data_type();
        let outcome = self
            .write(Write {
                key,
                content,
                data_type,
                priority,
                ttl,
                written_at: Some(written_at),
            })
            .await?;
        match outcome {
            WriteOutcome::Written(entry) => Ok(Some(entry)),
            WriteOutcome::Stale(_) => Ok(None),
        }
    }

    async fn write(&self, request: Write) -> Result<WriteOutcome> {
        let Write {
            key,
            content,
            data_type,
            priority,
            ttl,
            written_at,
        } = request;

        key.validate()?;
        if key.data_type() != data_type {
            return Err(CacheError::Validation(format!(
                "key '{key}' does not belong to data type {data_type}"
            )));
        }
        content.validate_as(data_type)?;

        let encoded = content.encode()?;
        let size_bytes = encoded.len() as u64;
        let content_hash = hash_bytes(&encoded);
        let now = self.clock.now();

        let _writing = self.writers.read().await;
        let _key_guard = self.key_locks.lock(&key).await;

        // Removals skip locked keys, so `existing` stays in place until this
        // write commits or fails.
        let existing = self.lookup(&key).await;
        if let (Some(written_at), Some(current)) = (written_at, &existing) {
            if current.entry.updated_at > written_at {
                debug!(stored_at = %current.entry.updated_at, "Dropping stale write");
                return Ok(WriteOutcome::Stale(current.snapshot()));
            }
        }

        let replaced_bytes = existing.as_ref().map_or(0, |s| s.entry.size_bytes);
        self.reserve(&key, replaced_bytes, size_bytes, now).await?;

        let stamped = written_at.unwrap_or(now);
        let (created_at, updated_at) = match &existing {
            Some(current) => (
                current.entry.created_at,
                stamped.max(current.entry.updated_at),
            ),
            None => (stamped.min(now), stamped),
        };
        let expires_at = ttl
            .and_then(|ttl| TimeDelta::from_std(ttl).ok())
            .and_then(|ttl| now.checked_add_signed(ttl))
            .map(|at| at.max(created_at));

        let entry = CacheEntry {
            key,
            data_type,
            content,
            priority,
            created_at,
            updated_at,
            expires_at,
            size_bytes,
            content_hash,
            access_count: existing.as_ref().map_or(0, |s| s.access_count()),
            last_accessed: existing.as_ref().and_then(|s| s.last_accessed()),
        };

        if let Err(err) = self.backend.upsert_entry(&entry).await {
            let mut ledger = self.ledger.lock().await;
            ledger.total_bytes = ledger.total_bytes.saturating_sub(size_bytes) + replaced_bytes;
            return Err(err);
        }
        self.entries
            .write()
            .await
            .insert(entry.key.clone(), Arc::new(StoredEntry::new(entry.clone())));

        debug!(size_bytes, "Cached entry");
        Ok(WriteOutcome::Written(entry))
    }

    /// Makes room for `size_bytes` replacing `replaced_bytes` under `key` and
    /// books the difference in the ledger.
    ///
    /// Expired entries are swept first; live entries are evicted only when
    /// that is not enough.
    async fn reserve(
        &self,
        key: &CacheKey,
        replaced_bytes: u64,
        size_bytes: u64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut ledger = self.ledger.lock().await;
        if ledger.projected(replaced_bytes, size_bytes) > ledger.budget_bytes {
            self.sweep_locked(&mut ledger, now).await?;
        }

        while ledger.projected(replaced_bytes, size_bytes) > ledger.budget_bytes {
            let deficit = ledger.projected(replaced_bytes, size_bytes) - ledger.budget_bytes;
            let candidates = self.candidates(now, Some(key)).await;
            let reclaimable = match self.scheduler.plan(candidates, deficit) {
                EvictionOutcome::Plan(plan) => {
                    let evicted = self.remove_locked(&mut ledger, &plan.victims).await?;
                    if evicted > 0 {
                        self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
                        info!(evicted, freed_bytes = plan.freed_bytes, "Evicted entries to make room");
                        continue;
                    }
                    // Every victim was taken by a concurrent write
                    0
                }
                EvictionOutcome::Insufficient { reclaimable } => reclaimable,
            };
            warn!(
                required = size_bytes,
                budget = ledger.budget_bytes,
                reclaimable,
                "Cache full, write rejected"
            );
            return Err(CacheError::Capacity {
                required: size_bytes,
                budget: ledger.budget_bytes,
                reclaimable,
            });
        }

        ledger.total_bytes = ledger.projected(replaced_bytes, size_bytes);
        Ok(())
    }

    /// Returns the live entry for `key`, counting a hit or a miss.
    ///
    /// An entry that has expired, or is older than `max_age` when given, is a
    /// miss.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn get(&self, key: &CacheKey, max_age: Option<Duration>) -> Option<CacheEntry> {
        let now = self.clock.now();
        let stored = self.lookup(key).await;
        match stored {
            Some(stored)
                if !stored.entry.is_expired(now)
                    && max_age.is_none_or(|age| stored.entry.is_within_age(now, age)) =>
            {
                stored.record_access(now);
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!("Cache hit");
                Some(stored.snapshot())
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!("Cache miss");
                None
            }
        }
    }

    /// Returns the live entry for `key` without touching statistics.
    pub async fn peek(&self, key: &CacheKey) -> Option<CacheEntry> {
        let now = self.clock.now();
        self.lookup(key)
            .await
            .filter(|s| !s.entry.is_expired(now))
            .map(|s| s.snapshot())
    }

    /// Keys and priorities of every stored entry, expired ones included until
    /// swept.
    pub async fn index(&self) -> Vec<(CacheKey, Priority)> {
        self.entries
            .read()
            .await
            .values()
            .map(|s| (s.entry.key.clone(), s.entry.priority))
            .collect()
    }

    /// Live entries of `data_type` matching `filter`, most relevant first.
    ///
    /// Ties in relevance go to the most recently updated entry. Queries do not
    /// count as hits or misses.
    ///
    /// # Errors
    /// Returns [`CacheError::Validation`] for an invalid filter.
    #[instrument(skip(self, filter))]
    pub async fn query(
        &self,
        data_type: DataType,
        filter: &ContentFilter,
        max_age: Option<Duration>,
    ) -> Result<QueryResults> {
        filter.validate()?;
        let now = self.clock.now();

        let mut scored: Vec<(f64, Arc<StoredEntry>)> = self
            .entries
            .read()
            .await
            .values()
            .filter(|s| {
                s.entry.data_type == data_type
                    && !s.entry.is_expired(now)
                    && max_age.is_none_or(|age| s.entry.is_within_age(now, age))
                    && filter.matches(&s.entry.content)
            })
            .map(|s| (filter.relevance(&s.entry, now), Arc::clone(s)))
            .collect();

        scored.sort_by(|(score_a, a), (score_b, b)| {
            score_b
                .total_cmp(score_a)
                .then_with(|| b.entry.updated_at.cmp(&a.entry.updated_at))
                .then_with(|| a.entry.key.cmp(&b.entry.key))
        });

        debug!(matches = scored.len(), "Query evaluated");
        Ok(QueryResults {
            items: scored.into_iter().map(|(_, s)| s).collect(),
        })
    }

    /// Removes every entry satisfying `predicate`; returns how many were removed.
    ///
    /// # Errors
    /// Returns [`CacheError::Storage`] if the backend delete fails.
    pub async fn delete_where<F>(&self, predicate: F) -> Result<usize>
    where
        F: Fn(&CacheEntry) -> bool + Send,
    {
        let mut ledger = self.ledger.lock().await;
        let keys: Vec<CacheKey> = self
            .entries
            .read()
            .await
            .values()
            .filter(|s| predicate(&s.entry))
            .map(|s| s.entry.key.clone())
            .collect();
        self.remove_locked(&mut ledger, &keys).await
    }

    /// Removes entries created more than `older_than` ago, optionally only of
    /// one data type.
    ///
    /// # Errors
    /// Returns [`CacheError::Storage`] if the backend delete fails.
    #[instrument(skip(self))]
    pub async fn clear_older_than(
        &self,
        older_than: Duration,
        data_type: Option<DataType>,
    ) -> Result<usize> {
        let age = TimeDelta::from_std(older_than).unwrap_or(TimeDelta::MAX);
        let Some(cutoff) = self.clock.now().checked_sub_signed(age) else {
            return Ok(0);
        };
        let removed = self
            .delete_where(|e| data_type.is_none_or(|t| e.data_type == t) && e.created_at < cutoff)
            .await?;
        info!(removed, "Cleared old entries");
        Ok(removed)
    }

    /// Removes every entry.
    ///
    /// # Errors
    /// Returns [`CacheError::Storage`] if the backend cannot be cleared.
    #[instrument(skip(self))]
    pub async fn clear(&self) -> Result<usize> {
        let _exclusive = self.writers.write().await;
        let mut ledger = self.ledger.lock().await;
        self.backend.clear_entries().await?;
        let mut entries = self.entries.write().await;
        let removed = entries.len();
        entries.clear();
        ledger.total_bytes = 0;
        info!(removed, "Cleared cache");
        Ok(removed)
    }

    /// Removes expired entries; returns how many were removed.
    ///
    /// # Errors
    /// Returns [`CacheError::Storage`] if the backend delete fails.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut ledger = self.ledger.lock().await;
        self.sweep_locked(&mut ledger, now).await
    }

    /// Changes the byte budget, evicting entries if usage now exceeds it.
    ///
    /// Returns the number of entries evicted. When critical entries alone
    /// exceed the new budget they are kept and later writes fail with
    /// [`CacheError::Capacity`] until space is freed.
    ///
    /// # Errors
    /// Returns [`CacheError::Storage`] if the backend delete fails.
    #[instrument(skip(self))]
    pub async fn set_budget(&self, budget_bytes: u64) -> Result<usize> {
        let mut ledger = self.ledger.lock().await;
        ledger.budget_bytes = budget_bytes;
        self.enforce_budget(&mut ledger).await
    }

    /// Configured byte budget.
    pub async fn budget(&self) -> u64 {
        self.ledger.lock().await.budget_bytes
    }

    /// Summed size of all entries.
    pub async fn total_bytes(&self) -> u64 {
        self.ledger.lock().await.total_bytes
    }

    /// Number of stored entries, expired ones included until swept.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Returns true when the store holds nothing.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Takes a consistent snapshot of contents and counters.
    pub async fn stats(&self) -> StoreStats {
        let now = self.clock.now();
        let ledger = self.ledger.lock().await;
        let entries = self.entries.read().await;

        let mut entries_by_type = BTreeMap::new();
        let mut size_by_type = BTreeMap::new();
        let mut expired_entries = 0;
        let mut most_accessed = Vec::new();
        for stored in entries.values() {
            let entry = &stored.entry;
            *entries_by_type.entry(entry.data_type).or_insert(0) += 1;
            *size_by_type.entry(entry.data_type).or_insert(0) += entry.size_bytes;
            if entry.is_expired(now) {
                expired_entries += 1;
            }
            let access_count = stored.access_count();
            if access_count > 0 {
                most_accessed.push(AccessSummary {
                    key: entry.key.clone(),
                    data_type: entry.data_type,
                    access_count,
                });
            }
        }
        most_accessed.sort_by(|a, b| {
            b.access_count
                .cmp(&a.access_count)
                .then_with(|| a.key.cmp(&b.key))
        });
        most_accessed.truncate(MOST_ACCESSED_LIMIT);

        StoreStats {
            total_entries: entries.len(),
            total_size_bytes: ledger.total_bytes,
            budget_bytes: ledger.budget_bytes,
            entries_by_type,
            size_by_type,
            expired_entries,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            counters_since: DateTime::from_timestamp_millis(
                self.counters_since_ms.load(Ordering::Relaxed),
            )
            .unwrap_or(now),
            most_accessed,
            taken_at: now,
        }
    }

    /// Zeroes the hit, miss and eviction counters.
    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.counters_since_ms
            .store(self.clock.now().timestamp_millis(), Ordering::Relaxed);
        debug!("Cache counters reset");
    }

    /// Persists read statistics of entries read since the last flush, so
    /// recency survives a restart. Returns how many entries were flushed.
    ///
    /// # Errors
    /// Returns [`CacheError::Storage`] if the backend write fails; the same
    /// entries are flushed again next time.
    pub async fn flush_access_stats(&self) -> Result<usize> {
        let dirty: Vec<Arc<StoredEntry>> = self
            .entries
            .read()
            .await
            .values()
            .filter(|s| s.dirty.swap(false, Ordering::AcqRel))
            .cloned()
            .collect();
        if dirty.is_empty() {
            return Ok(0);
        }
        let updates: Vec<AccessUpdate> = dirty.iter().map(|s| s.access_update()).collect();
        if let Err(err) = self.backend.update_access(&updates).await {
            for stored in &dirty {
                stored.dirty.store(true, Ordering::Release);
            }
            return Err(err);
        }
        debug!(flushed = updates.len(), "Flushed access statistics");
        Ok(updates.len())
    }

    /// Sweeps expired entries and flushes read statistics every `interval`
    /// until `shutdown` flips to true, then flushes once more.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep_expired().await {
                        Ok(0) => {}
                        Ok(removed) => debug!(removed, "Swept expired entries"),
                        Err(e) => warn!(error = %e, "Expiry sweep failed"),
                    }
                    if let Err(e) = self.flush_access_stats().await {
                        warn!(error = %e, "Access statistics flush failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        if let Err(e) = self.flush_access_stats().await {
            warn!(error = %e, "Final access statistics flush failed");
        }
        debug!("Sweeper stopped");
    }

    async fn lookup(&self, key: &CacheKey) -> Option<Arc<StoredEntry>> {
        self.entries.read().await.get(key).cloned()
    }

    /// Entries that may be evicted: everything except `exclude` and keys with
    /// a write in flight.
    async fn candidates(&self, now: DateTime<Utc>, exclude: Option<&CacheKey>) -> Vec<EvictionCandidate> {
        self.entries
            .read()
            .await
            .values()
            .filter(|s| exclude != Some(&s.entry.key) && !self.key_locks.is_locked(&s.entry.key))
            .map(|s| s.candidate(now))
            .collect()
    }

    async fn sweep_locked(&self, ledger: &mut SizeLedger, now: DateTime<Utc>) -> Result<usize> {
        let expired: Vec<CacheKey> = self
            .entries
            .read()
            .await
            .values()
            .filter(|s| s.entry.is_expired(now))
            .map(|s| s.entry.key.clone())
            .collect();
        self.remove_locked(ledger, &expired).await
    }

    async fn enforce_budget(&self, ledger: &mut SizeLedger) -> Result<usize> {
        if ledger.total_bytes <= ledger.budget_bytes {
            return Ok(0);
        }
        let now = self.clock.now();
        let deficit = ledger.total_bytes - ledger.budget_bytes;
        match self.scheduler.plan(self.candidates(now, None).await, deficit) {
            EvictionOutcome::Plan(plan) => {
                let evicted = self.remove_locked(ledger, &plan.victims).await?;
                self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
                info!(evicted, budget = ledger.budget_bytes, "Evicted entries to fit budget");
                Ok(evicted)
            }
            EvictionOutcome::Insufficient { reclaimable } => {
                warn!(
                    total_bytes = ledger.total_bytes,
                    budget = ledger.budget_bytes,
                    reclaimable,
                    "Critical entries exceed the budget"
                );
                Ok(0)
            }
        }
    }

    async fn remove_locked(&self, ledger: &mut SizeLedger, keys: &[CacheKey]) -> Result<usize> {
        // A key being written is left to its writer
        let guards: Vec<KeyGuard<'_>> = keys
            .iter()
            .filter_map(|key| self.key_locks.try_lock(key))
            .collect();
        if guards.is_empty() {
            return Ok(0);
        }
        let keys: Vec<CacheKey> = guards.iter().map(|g| g.key.clone()).collect();
        self.backend.remove_entries(&keys).await?;

        let mut entries = self.entries.write().await;
        let mut removed = 0;
        let mut freed = 0;
        for key in &keys {
            if let Some(stored) = entries.remove(key) {
                removed += 1;
                freed += stored.entry.size_bytes;
            }
        }
        ledger.total_bytes = ledger.total_bytes.saturating_sub(freed);
        Ok(removed)
    }
}
