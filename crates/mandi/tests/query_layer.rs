//! End-to-end tests of the query-layer operations.

use chrono::{DateTime, TimeZone, Utc};
use mandi::{
    CacheContent, CacheError, CacheKey, Clock, ConnectivityLevel, ContentFilter, DataType,
    GeoPoint, LocalWrite, LocalWriteOutcome, MandiInfo, ManualClock, MemoryOrigin, MspRate,
    OfflineCacheService, OfflineQuery, PreparationStatus, PriceQuote, Priority, QueryStatus,
    ServiceConfig, SyncConfigUpdate, SyncItem, SyncStatus, UserPreference,
};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const HOUR: Duration = Duration::from_secs(3600);

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 6, 0, 0).unwrap()
}

fn delhi() -> GeoPoint {
    GeoPoint::new(28.61, 77.21)
}

fn azadpur() -> GeoPoint {
    GeoPoint::new(28.71, 77.18)
}

fn price(commodity: &str, mandi_id: &str, location: GeoPoint) -> CacheContent {
    CacheContent::Price(PriceQuote {
        commodity: commodity.to_string(),
        variety: None,
        mandi_id: mandi_id.to_string(),
        mandi_name: mandi_id.to_string(),
        state: "delhi".to_string(),
        location,
        min_price: 2100.0,
        max_price: 2400.0,
        modal_price: 2250.0,
        unit: "quintal".to_string(),
        observed_at: start(),
    })
}

fn mandi(mandi_id: &str, location: GeoPoint) -> CacheContent {
    CacheContent::MandiInfo(MandiInfo {
        mandi_id: mandi_id.to_string(),
        name: mandi_id.to_string(),
        state: "delhi".to_string(),
        district: "north".to_string(),
        location,
        commodities: vec!["wheat".to_string(), "onion".to_string()],
        contact: None,
    })
}

fn msp(commodity: &str, price_per_quintal: f64) -> CacheContent {
    CacheContent::MspRate(MspRate {
        commodity: commodity.to_string(),
        season: "rabi".to_string(),
        crop_year: "2024-25".to_string(),
        price_per_quintal,
    })
}

fn preference(language: &str) -> CacheContent {
    CacheContent::UserPreference(UserPreference {
        user_id: "farmer-1".to_string(),
        language: language.to_string(),
        commodities: vec!["wheat".to_string()],
        home: Some(delhi()),
        radius_km: Some(50.0),
    })
}

struct Harness {
    service: OfflineCacheService,
    origin: Arc<MemoryOrigin>,
    clock: Arc<ManualClock>,
}

async fn harness(config: ServiceConfig) -> Harness {
    let origin = Arc::new(MemoryOrigin::new());
    let clock = Arc::new(ManualClock::new(start()));
    let service = OfflineCacheService::builder()
        .with_config(config)
        .with_origin(origin.clone())
        .with_clock(clock.clone())
        .build()
        .await
        .unwrap();
    Harness {
        service,
        origin,
        clock,
    }
}

#[tokio::test]
async fn test_low_write_rejected_when_only_critical_data_remains() {
    let critical = msp("wheat", 2275.0);
    let low = preference("hi");
    let c = critical.encode().unwrap().len() as u64;
    let l = low.encode().unwrap().len() as u64;

    let mut config = ServiceConfig::default();
    config.cache.max_size_bytes = c + l - 1;
    let h = harness(config).await;
    let store = h.service.store();

    store
        .put(CacheKey::msp("wheat"), critical, DataType::MspRate, Priority::Critical, None)
        .await
        .unwrap();
    let err = store
        .put(
            CacheKey::new(DataType::UserPreference, "farmer-1"),
            low,
            DataType::UserPreference,
            Priority::Low,
            None,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, CacheError::Capacity { .. }));
    assert!(h.service.get_entry(&CacheKey::msp("wheat"), None).await.is_some());
    let stats = h.service.cache_stats().await;
    assert_eq!(stats.total_entries, 1);
    assert_eq!(stats.total_size_bytes, c);
    assert_eq!(stats.evictions, 0);
}

#[tokio::test]
async fn test_expired_entry_is_a_miss_before_sweep() {
    let h = harness(ServiceConfig::default()).await;
    let key: CacheKey = "price:wheat:delhi".parse().unwrap();
    h.service
        .store()
        .put(
            key.clone(),
            price("wheat", "delhi", delhi()),
            DataType::Price,
            Priority::Medium,
            Some(HOUR),
        )
        .await
        .unwrap();
    assert!(h.service.get_entry(&key, None).await.is_some());

    h.clock.advance(2 * HOUR);
    assert!(h.service.get_entry(&key, None).await.is_none());

    let stats = h.service.cache_stats().await;
    assert_eq!(stats.expired_entries, 1);
    assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_unchanged_origin_syncs_nothing() {
    let h = harness(ServiceConfig::default()).await;
    let commodities = [
        ("wheat", 2275.0),
        ("rice", 2183.0),
        ("onion", 1500.0),
        ("potato", 1200.0),
        ("tomato", 900.0),
    ];
    for (commodity, rate) in commodities {
        let key = CacheKey::msp(commodity);
        h.origin.insert(key.clone(), msp(commodity, rate));
        h.service
            .store()
            .put(key, msp(commodity, rate), DataType::MspRate, Priority::Critical, None)
            .await
            .unwrap();
    }

    let result = h.service.sync_now().await.unwrap();
    assert_eq!(result.status, SyncStatus::Completed);
    assert_eq!(result.items_synced, 0);
    assert_eq!(result.items_unchanged, 5);
    assert_eq!(result.items_failed, 0);
    assert_eq!(h.origin.calls(), 5);
}

#[tokio::test]
async fn test_second_sync_is_idempotent() {
    let h = harness(ServiceConfig::default()).await;
    for commodity in ["wheat", "rice", "onion"] {
        let key = CacheKey::msp(commodity);
        h.origin.insert(key.clone(), msp(commodity, 2000.0));
        h.service.engine().track(SyncItem::new(key)).await;
    }

    let first = h.service.sync_now().await.unwrap();
    assert_eq!(first.items_synced, 3);
    assert!(first.bytes_transferred > 0);

    let second = h.service.sync_now().await.unwrap();
    assert_eq!(second.status, SyncStatus::Completed);
    assert_eq!(second.items_synced, 0);
    assert_eq!(second.items_unchanged, 3);

    h.origin.insert(CacheKey::msp("rice"), msp("rice", 2300.0));
    let third = h.service.sync_now().await.unwrap();
    assert_eq!(third.items_synced, 1);

    let report = h.service.sync_status().await;
    assert_eq!(report.recent.len(), 3);
    assert_eq!(report.recent[0].sync_id, third.sync_id);
    assert!((report.success_rate - 1.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_prepare_offline_without_weather() {
    let h = harness(ServiceConfig::default()).await;
    let store = h.service.store();
    store
        .put(
            CacheKey::price("wheat", "azadpur"),
            price("wheat", "azadpur", azadpur()),
            DataType::Price,
            Priority::Critical,
            None,
        )
        .await
        .unwrap();
    store
        .put(
            CacheKey::new(DataType::MandiInfo, "azadpur"),
            mandi("azadpur", azadpur()),
            DataType::MandiInfo,
            Priority::High,
            None,
        )
        .await
        .unwrap();

    let id = h
        .service
        .prepare_offline(28.61, 77.21, &["Wheat".to_string()], None)
        .await
        .unwrap();
    let done = h
        .service
        .wait_for_preparation(id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(done.status, PreparationStatus::Completed);
    assert_eq!(done.progress_percentage, 100.0);

    let package = h.service.preparation_package(id).await.unwrap().unwrap();
    assert_eq!(package.commodities, vec!["wheat".to_string()]);
    assert_eq!(package.prices.len(), 1);
    assert_eq!(package.mandis.len(), 1);
    assert!(package.weather.is_empty());
    assert!(package.data_freshness.contains_key(&DataType::Price));
    assert!(package.data_freshness.contains_key(&DataType::MandiInfo));
    assert!(!package.data_freshness.contains_key(&DataType::Weather));
    assert_eq!(done.data_size_bytes, package.size_bytes);

    // The location's essentials are now part of every sync
    let report = h.service.sync_status().await;
    assert!(report.tracked_items > 0);
}

#[tokio::test]
async fn test_essential_data_reads_current_cache() {
    let h = harness(ServiceConfig::default()).await;
    let package = h.service.essential_data(28.61, 77.21, Some(50.0)).await.unwrap();
    assert!(package.is_empty());
    assert_eq!(package.estimated_validity_hours, 0.0);

    h.service
        .store()
        .put(CacheKey::msp("wheat"), msp("wheat", 2275.0), DataType::MspRate, Priority::Critical, None)
        .await
        .unwrap();
    h.clock.advance(8 * HOUR);

    let package = h.service.essential_data(28.61, 77.21, Some(50.0)).await.unwrap();
    assert_eq!(package.msp_rates.len(), 1);
    assert!((package.estimated_validity_hours - 160.0).abs() < 1e-9);
    assert!(!package.data_freshness[&DataType::MspRate].stale);

    assert!(matches!(
        h.service.essential_data(95.0, 77.21, None).await,
        Err(CacheError::Validation(_))
    ));
}

#[tokio::test]
async fn test_unknown_preparation() {
    let h = harness(ServiceConfig::default()).await;
    assert!(matches!(
        h.service.preparation_status(Uuid::new_v4()).await,
        Err(CacheError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_cached_query_resolves_after_sync() {
    let h = harness(ServiceConfig::default()).await;
    let query = OfflineQuery::new(DataType::MspRate, ContentFilter::new().with_commodity("wheat"));
    let id = h.service.cache_query(query).await.unwrap();

    assert_eq!(h.service.resolve_queries().await.unwrap(), 0);
    assert_eq!(h.service.query_result(&id).await.unwrap().status, QueryStatus::Pending);

    h.origin.insert(CacheKey::msp("wheat"), msp("wheat", 2275.0));
    h.service.engine().track(SyncItem::new(CacheKey::msp("wheat"))).await;
    h.service.sync_now().await.unwrap();

    assert_eq!(h.service.resolve_queries().await.unwrap(), 1);
    let resolved = h.service.query_result(&id).await.unwrap();
    assert_eq!(resolved.status, QueryStatus::Resolved);
    assert_eq!(resolved.resolution.unwrap().entry_keys, vec![CacheKey::msp("wheat")]);

    let cached = h
        .service
        .get_cached(DataType::MspRate, &ContentFilter::new().with_commodity("wheat"), None)
        .await
        .unwrap();
    assert_eq!(cached.len(), 1);
}

#[tokio::test]
async fn test_clear_cache_by_age_and_type() {
    let h = harness(ServiceConfig::default()).await;
    let store = h.service.store();
    store
        .put(
            CacheKey::price("wheat", "azadpur"),
            price("wheat", "azadpur", azadpur()),
            DataType::Price,
            Priority::Critical,
            None,
        )
        .await
        .unwrap();
    h.clock.advance(2 * HOUR);
    store
        .put(CacheKey::msp("wheat"), msp("wheat", 2275.0), DataType::MspRate, Priority::Critical, None)
        .await
        .unwrap();
    store
        .put(
            CacheKey::new(DataType::MandiInfo, "azadpur"),
            mandi("azadpur", azadpur()),
            DataType::MandiInfo,
            Priority::High,
            None,
        )
        .await
        .unwrap();

    assert_eq!(h.service.clear_cache(None, Some(DataType::MandiInfo)).await.unwrap(), 1);
    assert_eq!(h.service.clear_cache(Some(HOUR), None).await.unwrap(), 1);

    let stats = h.service.cache_stats().await;
    assert_eq!(stats.total_entries, 1);
    assert_eq!(stats.entries_by_type.get(&DataType::MspRate), Some(&1));
    assert!(!stats.size_by_type.contains_key(&DataType::Price));

    assert_eq!(h.service.clear_cache(None, None).await.unwrap(), 1);
    let stats = h.service.cache_stats().await;
    assert_eq!(stats.total_entries, 0);
    assert_eq!(stats.total_size_bytes, 0);
}

#[tokio::test]
async fn test_stats_counters_reset() {
    let h = harness(ServiceConfig::default()).await;
    h.service
        .store()
        .put(CacheKey::msp("wheat"), msp("wheat", 2275.0), DataType::MspRate, Priority::Critical, None)
        .await
        .unwrap();
    h.service.get_entry(&CacheKey::msp("wheat"), None).await;
    h.service.get_entry(&CacheKey::msp("rice"), None).await;

    let stats = h.service.cache_stats().await;
    assert_eq!((stats.hits, stats.misses), (1, 1));

    h.clock.advance(HOUR);
    h.service.reset_stats();
    let stats = h.service.cache_stats().await;
    assert_eq!((stats.hits, stats.misses), (0, 0));
    assert_eq!(stats.counters_since, start() + chrono::TimeDelta::hours(1));
}

#[tokio::test]
async fn test_local_writes_queue_while_offline() {
    let h = harness(ServiceConfig::default()).await;
    let key = CacheKey::new(DataType::UserPreference, "farmer-1");

    h.service.set_connectivity(ConnectivityLevel::Offline).await;
    let outcome = h
        .service
        .submit_local_write(LocalWrite::new(key.clone(), preference("hi"), h.clock.now()))
        .await
        .unwrap();
    assert_eq!(outcome, LocalWriteOutcome::Queued);
    assert!(h.service.get_entry(&key, None).await.is_none());
    assert_eq!(h.service.sync_status().await.pending_local_writes, 1);
    assert!(matches!(h.service.sync_now().await, Err(CacheError::Offline)));

    h.origin.insert(key.clone(), preference("hi"));
    h.service.set_connectivity(ConnectivityLevel::Good).await;
    let result = h.service.sync_now().await.unwrap();
    assert_eq!(result.local_writes_applied, 1);
    assert_eq!(result.items_unchanged, 1);
    assert_eq!(result.status, SyncStatus::Completed);
    assert_eq!(h.service.sync_status().await.pending_local_writes, 0);
    assert_eq!(h.service.get_entry(&key, None).await.unwrap().content, preference("hi"));

    // Online writes apply at once; stale ones are dropped
    let earlier = h.clock.now() - chrono::TimeDelta::hours(1);
    let outcome = h
        .service
        .submit_local_write(LocalWrite::new(key.clone(), preference("en"), earlier))
        .await
        .unwrap();
    assert_eq!(outcome, LocalWriteOutcome::Superseded);

    h.clock.advance(HOUR);
    let outcome = h
        .service
        .submit_local_write(LocalWrite::new(key.clone(), preference("en"), h.clock.now()))
        .await
        .unwrap();
    assert_eq!(outcome, LocalWriteOutcome::Applied);
}

#[tokio::test]
async fn test_configure_sync_changes_budget_next_cycle() {
    let h = harness(ServiceConfig::default()).await;
    let update = SyncConfigUpdate {
        sync_interval: Some(Duration::from_secs(600)),
        max_cache_size_bytes: Some(64 * 1024),
        ..Default::default()
    };
    let settings = h.service.configure_sync(update).await.unwrap();
    assert_eq!(settings.sync_interval_secs, 600);
    assert_ne!(h.service.store().budget().await, 64 * 1024);

    h.service.sync_now().await.unwrap();
    assert_eq!(h.service.store().budget().await, 64 * 1024);
    assert_eq!(h.service.cache_stats().await.budget_bytes, 64 * 1024);
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn test_entries_and_queries_persist_in_sqlite() {
    let path = std::env::temp_dir().join(format!("mandi-offline-{}.db", Uuid::new_v4()));
    let config = ServiceConfig {
        database_path: Some(path.clone()),
        ..Default::default()
    };

    let h = harness(config.clone()).await;
    h.service
        .store()
        .put(CacheKey::msp("wheat"), msp("wheat", 2275.0), DataType::MspRate, Priority::Critical, None)
        .await
        .unwrap();
    let query = OfflineQuery::new(DataType::MspRate, ContentFilter::new().with_commodity("wheat"));
    let id = h.service.cache_query(query).await.unwrap();
    drop(h);

    let h = harness(config).await;
    let entry = h.service.get_entry(&CacheKey::msp("wheat"), None).await.unwrap();
    assert_eq!(entry.content, msp("wheat", 2275.0));
    assert_eq!(h.service.query_result(&id).await.unwrap().id, id);
    drop(h);

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn test_background_lifecycle() {
    let origin = Arc::new(MemoryOrigin::new());
    origin.insert(CacheKey::msp("wheat"), msp("wheat", 2275.0));
    let service = OfflineCacheService::builder()
        .with_origin(origin.clone())
        .build()
        .await
        .unwrap();
    service.engine().track(SyncItem::new(CacheKey::msp("wheat"))).await;
    let query = OfflineQuery::new(DataType::MspRate, ContentFilter::new().with_commodity("wheat"));
    let id = service.cache_query(query).await.unwrap();

    let mut results = service.engine().subscribe();
    assert!(service.start().await);
    assert!(service.trigger_sync());

    let result = tokio::time::timeout(Duration::from_secs(5), results.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.status, SyncStatus::Completed);
    assert_eq!(result.items_synced, 1);

    let mut resolved = false;
    for _ in 0..100 {
        if service.query_result(&id).await.unwrap().status == QueryStatus::Resolved {
            resolved = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(resolved);

    service.shutdown().await;
    assert!(!service.is_started().await);
    assert!(service.get_entry(&CacheKey::msp("wheat"), None).await.is_some());
}

#[tokio::test]
async fn test_pruned_preparations_release_tracked_items() {
    let h = harness(ServiceConfig::default()).await;
    let wheat = ["wheat".to_string()];

    let delhi_job = h.service.prepare_offline(28.61, 77.21, &wheat, None).await.unwrap();
    h.service
        .wait_for_preparation(delhi_job, Duration::from_secs(5))
        .await
        .unwrap();
    h.clock.advance(20 * HOUR);
    let mumbai_job = h.service.prepare_offline(19.07, 72.87, &wheat, None).await.unwrap();
    h.service
        .wait_for_preparation(mumbai_job, Duration::from_secs(5))
        .await
        .unwrap();

    // msp:wheat and trend:national are shared, each location adds its weather
    assert_eq!(h.service.sync_status().await.tracked_items, 4);
    assert_eq!(h.service.prune_preparations().await, 0);

    h.clock.advance(5 * HOUR);
    assert_eq!(h.service.prune_preparations().await, 1);
    assert!(matches!(
        h.service.preparation_status(delhi_job).await,
        Err(CacheError::NotFound(_))
    ));
    assert_eq!(h.service.sync_status().await.tracked_items, 3);

    h.clock.advance(20 * HOUR);
    assert_eq!(h.service.prune_preparations().await, 1);
    assert_eq!(h.service.sync_status().await.tracked_items, 0);
}
