#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/mandi-ear/offline-cache/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! Offline cache service for agricultural market data.
//!
//! This crate wires the cache store, the sync engine and the origin client
//! into one [`OfflineCacheService`] exposing the query-layer operations, and
//! re-exports the core types so callers depend on a single crate.
//!
//! # Features
//!
//! - `sqlite` - SQLite persistence through `database_path` (default)
//!
//! # Example
//!
//! ```rust,ignore
//! use mandi::{OfflineCacheService, ServiceConfig, HttpOriginConfig};
//!
//! #[tokio::main]
//! async fn main() -> mandi::Result<()> {
//!     let config = ServiceConfig {
//!         database_path: Some("offline.db".into()),
//!         origin: Some(HttpOriginConfig::new("https://api.example.org/v1/")),
//!         ..Default::default()
//!     };
//!     let service = OfflineCacheService::builder().with_config(config).build().await?;
//!     service.start().await;
//!
//!     let package = service.essential_data(28.61, 77.21, None).await?;
//!     println!("{} entries, valid for {:.1} h", package.len(), package.estimated_validity_hours);
//!
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```

/// Essential data bundles.
pub mod curator;
/// Offline query registry.
pub mod queries;
/// Statistics.
pub mod reporter;
/// The service facade.
pub mod service;

// Core types and traits
pub use mandi_core::*;

pub use mandi_cache::{CacheConfig, CacheStore, EvictionScheduler, NoopBackend, StoreStats};
#[cfg(feature = "sqlite")]
pub use mandi_cache::SqliteBackend;
pub use mandi_origin::{HttpOrigin, HttpOriginConfig};
pub use mandi_sync::{
    LocalWrite, LocalWriteOutcome, MemoryOrigin, RetryPolicy, SyncConfigUpdate, SyncEngine,
    SyncItem, SyncResult, SyncScope, SyncSettings, SyncStatus, SyncStatusReport,
};

pub use curator::{
    CuratorConfig, EssentialDataCurator, EssentialDataPackage, EssentialRequest, Freshness,
    OfflinePreparation, PreparationStatus, SectionLimits,
};
pub use queries::QueryRegistry;
pub use reporter::{CacheStatistics, StatisticsReporter};
pub use service::{OfflineCacheService, OfflineCacheServiceBuilder, ServiceConfig};
