#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/mandi-ear/offline-cache/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! Core traits and types for the offline market-data cache.
//!
//! This crate provides the foundational abstractions shared by the cache,
//! the sync engine and the query facade:
//!
//! - [`CacheContent`](content::CacheContent) - Typed payload, one variant per data type
//! - [`CacheEntry`](types::CacheEntry) - A stored payload with accounting metadata
//! - [`OriginDataService`](origin::OriginDataService) - Remote source the sync engine pulls from
//! - [`CacheBackend`](backend::CacheBackend) - Persistence behind the cache store
//! - [`Clock`](clock::Clock) - Injectable time source

/// Persistence trait for cache entries and offline queries.
pub mod backend;
/// Injectable clocks.
pub mod clock;
/// Shared configuration types.
pub mod config;
/// Typed cache payloads.
pub mod content;
/// Error types for cache operations.
pub mod error;
/// Content predicates and relevance scoring.
pub mod filter;
/// Geographic helpers.
pub mod geo;
/// Origin data service trait.
pub mod origin;
/// Priority tiers and connectivity levels.
pub mod priority;
/// Offline query registrations.
pub mod query;
/// Core cache types (DataType, CacheKey, CacheEntry).
pub mod types;

// Re-export commonly used items at crate root
pub use backend::{AccessUpdate, CacheBackend};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::MaxAgePolicy;
pub use content::{
    CacheContent, CropRecommendation, MandiInfo, MarketTrend, MspRate, PriceQuote, UserPreference,
    WeatherReport, hash_bytes,
};
pub use error::{CacheError, Result};
pub use filter::{ContentFilter, ESSENTIAL_COMMODITIES, Proximity};
pub use geo::{BoundingBox, GeoPoint};
pub use origin::{FetchFilter, OriginDataService, OriginRecord};
pub use priority::{ConnectivityLevel, Priority};
pub use query::{OfflineQuery, QUERY_TTL, QueryId, QueryResolution, QueryStatus, RegisteredQuery};
pub use types::{CacheEntry, CacheKey, DataType};
