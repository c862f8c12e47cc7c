#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/mandi-ear/offline-cache/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! Bounded, persistent cache store for offline market data.
//!
//! - [`CacheStore`] - In-memory working set with a byte budget and write-through persistence
//! - [`EvictionScheduler`] - Priority- and age-aware victim selection
//! - [`SqliteBackend`] - Durable backend (default, requires `sqlite` feature)
//! - [`NoopBackend`] - Backend that persists nothing

/// Eviction policy.
pub mod eviction;
/// No-op backend.
pub mod noop;
/// Store statistics.
pub mod stats;
/// The cache store.
pub mod store;

/// SQLite-based backend.
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use mandi_core::CacheBackend;

pub use eviction::{EvictionCandidate, EvictionOutcome, EvictionPlan, EvictionScheduler};
pub use noop::NoopBackend;
pub use stats::{AccessSummary, StoreStats};
pub use store::{CacheConfig, CacheStore, DEFAULT_MAX_SIZE_BYTES, QueryResults};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteBackend;
