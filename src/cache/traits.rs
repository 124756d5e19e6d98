//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};

use crate::model::EntityKind;

/// Trait for typed records stored through the data-access layer.
///
/// Implementors provide their id and the entity kind (which picks the cache
/// and the remote collection).
pub trait Record: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Unique identifier within the entity kind
  fn id(&self) -> &str;

  /// Entity kind this record belongs to
  fn kind() -> EntityKind;
}

/// Result of a read, including data and metadata about the source.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> Fetched<T> {
  /// Fresh data just returned by the remote store.
  pub fn from_remote(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Remote,
      cached_at: None,
    }
  }

  /// Data served from a fresh cache entry.
  pub fn from_cache(data: T, cached_at: Option<DateTime<Utc>>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at,
    }
  }

  /// Expired data served because the device is offline.
  pub fn stale(data: T, cached_at: Option<DateTime<Utc>>) -> Self {
    Self {
      data,
      source: CacheSource::StaleOffline,
      cached_at,
    }
  }

  /// Whether the UI should flag this data as possibly out of date.
  pub fn is_stale(&self) -> bool {
    self.source == CacheSource::StaleOffline
  }

  pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Fetched<U> {
    Fetched {
      data: f(self.data),
      source: self.source,
      cached_at: self.cached_at,
    }
  }
}

/// Indicates where read data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from the remote store
  Remote,
  /// Data from cache, still within its TTL
  Cache,
  /// Offline mode - remote unreachable, serving expired cached data
  StaleOffline,
}

/// Per-read options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadPolicy {
  /// Serve an expired cached value when the remote read fails and the device
  /// is known to be disconnected.
  pub serve_stale_if_offline: bool,
}

impl ReadPolicy {
  pub fn serve_stale_if_offline() -> Self {
    Self {
      serve_stale_if_offline: true,
    }
  }
}
