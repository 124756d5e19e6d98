//! Caching for the data-access layer.
//!
//! This module provides:
//! - A generic TTL cache, one instance per entity kind
//! - Per-key and bulk (full listing) freshness
//! - Tagged read results so callers can tell fresh, cached and stale data apart
//! - An optional persistent snapshot for offline use across restarts

mod storage;
mod traits;
mod ttl;

pub use storage::{CacheSnapshot, NoopSnapshot, SnapshotRow, SnapshotWriter, SqliteSnapshot};
pub use traits::{CacheSource, Fetched, ReadPolicy, Record};
pub use ttl::{CacheEntry, CacheTicket, TtlCache, DEFAULT_TTL_SECS};
