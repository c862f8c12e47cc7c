//! An in-process origin with scriptable failures.

use async_trait::async_trait;
use mandi_core::{
    CacheContent, CacheError, CacheKey, DataType, FetchFilter, OriginDataService, OriginRecord,
    Result,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::trace;

/// Origin serving records from memory.
///
/// Records are addressed by the cache key built from the requested data type
/// and the filter's logical id. Failures can be scripted per key, either for
/// the next few calls or permanently, which makes it suitable for offline
/// demos and for exercising retry and partial-failure paths.
#[derive(Debug, Default)]
pub struct MemoryOrigin {
    records: Mutex<HashMap<CacheKey, CacheContent>>,
    transient: Mutex<HashMap<CacheKey, VecDeque<CacheError>>>,
    permanent: Mutex<HashMap<CacheKey, CacheError>>,
    latency: Option<Duration>,
    calls: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryOrigin {
    /// An origin with no records.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every fetch by `latency`.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Serves `content` for `key` from now on.
    pub fn insert(&self, key: CacheKey, content: CacheContent) {
        lock(&self.records).insert(key, content);
    }

    /// Stops serving `key`.
    pub fn remove(&self, key: &CacheKey) {
        lock(&self.records).remove(key);
    }

    /// Fails the next `times` fetches of `key` with `error`.
    pub fn fail_next(&self, key: CacheKey, error: CacheError, times: usize) {
        lock(&self.transient)
            .entry(key)
            .or_default()
            .extend(std::iter::repeat_n(error, times));
    }

    /// Fails every fetch of `key` with `error` until [`heal`](Self::heal).
    pub fn fail_always(&self, key: CacheKey, error: CacheError) {
        lock(&self.permanent).insert(key, error);
    }

    /// Clears scripted failures of `key`.
    pub fn heal(&self, key: &CacheKey) {
        lock(&self.transient).remove(key);
        lock(&self.permanent).remove(key);
    }

    /// Fetches served so far, failed ones included.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OriginDataService for MemoryOrigin {
    fn name(&self) -> &str {
        "memory"
    }

    async fn fetch(&self, data_type: DataType, filter: &FetchFilter) -> Result<OriginRecord> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let key = CacheKey::new(data_type, filter.logical_id.as_str());
        trace!(key = %key, "MemoryOrigin: fetch");

        if let Some(err) = lock(&self.transient).get_mut(&key).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        if let Some(err) = lock(&self.permanent).get(&key).cloned() {
            return Err(err);
        }

        let content = lock(&self.records)
            .get(&key)
            .cloned()
            .ok_or_else(|| CacheError::NotFound(key.to_string()))?;
        OriginRecord::from_content(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mandi_core::MspRate;

    fn msp() -> CacheContent {
        CacheContent::MspRate(MspRate {
            commodity: "wheat".to_string(),
            season: "rabi".to_string(),
            crop_year: "2024-25".to_string(),
            price_per_quintal: 2275.0,
        })
    }

    #[tokio::test]
    async fn test_serves_inserted_records() {
        let origin = MemoryOrigin::new();
        let key = CacheKey::msp("wheat");
        origin.insert(key.clone(), msp());

        let record = origin
            .fetch(DataType::MspRate, &FetchFilter::for_key(&key))
            .await
            .unwrap();
        assert_eq!(record.content, msp());
        assert_eq!(record.content_hash, msp().content_hash().unwrap());

        let missing = origin
            .fetch(DataType::MspRate, &FetchFilter::for_key(&CacheKey::msp("rice")))
            .await;
        assert!(matches!(missing, Err(CacheError::NotFound(_))));
        assert_eq!(origin.calls(), 2);
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let origin = MemoryOrigin::new();
        let key = CacheKey::msp("wheat");
        origin.insert(key.clone(), msp());
        origin.fail_next(key.clone(), CacheError::Network("reset".to_string()), 1);

        let filter = FetchFilter::for_key(&key);
        assert!(origin.fetch(DataType::MspRate, &filter).await.is_err());
        assert!(origin.fetch(DataType::MspRate, &filter).await.is_ok());

        origin.fail_always(key.clone(), CacheError::OriginUnavailable("down".to_string()));
        assert!(origin.fetch(DataType::MspRate, &filter).await.is_err());
        origin.heal(&key);
        assert!(origin.fetch(DataType::MspRate, &filter).await.is_ok());
    }
}
