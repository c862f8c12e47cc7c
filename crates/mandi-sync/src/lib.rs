#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/mandi-ear/offline-cache/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! Progressive sync for the offline cache.
//!
//! - [`SyncEngine`] - Single-flight sync cycles and the background loop
//! - [`SyncSchedule`] - Which cycle is due, given connectivity
//! - [`RetryPolicy`] - Exponential backoff for origin fetches
//! - [`MemoryOrigin`] - In-process origin with scriptable failures

/// The sync engine.
pub mod engine;
/// Sync items.
pub mod item;
/// In-memory origin.
pub mod memory;
/// Queued local writes.
pub mod pending;
/// Cycle results.
pub mod result;
/// Retry with backoff.
pub mod retry;
/// Cycle scheduling.
pub mod schedule;
/// Engine settings.
pub mod settings;

pub use engine::{SyncEngine, SyncTask};
pub use item::{SyncItem, essential_items};
pub use memory::MemoryOrigin;
pub use pending::{LocalWrite, LocalWriteOutcome, PendingWrites};
pub use result::{SyncResult, SyncStatus, SyncStatusReport};
pub use retry::{RetryPolicy, retry};
pub use schedule::{SyncSchedule, SyncScope};
pub use settings::{SyncConfigUpdate, SyncSettings};
