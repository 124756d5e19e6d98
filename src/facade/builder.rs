//! Builder for [`DataAccess`].

use chrono::Duration;
use std::collections::HashMap;
use std::sync::Arc;

use super::{CacheSet, DataAccess};
use crate::auth::{AuthorizationEvaluator, PolicyStore};
use crate::cache::{CacheSnapshot, SnapshotWriter, TtlCache, DEFAULT_TTL_SECS};
use crate::clock::{Clock, SystemClock};
use crate::config::CacheConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::model::{EntityKind, Role};
use crate::remote::RemoteStore;
use crate::subscription::SubscriptionRegistry;

/// Assembles a [`DataAccess`] from its collaborators.
///
/// Only the remote store is required. Everything else has a default: an
/// empty policy store (which denies everything), a 300 second TTL, the wall
/// clock, a fresh connectivity monitor and no snapshot.
pub struct DataAccessBuilder {
  remote: Arc<dyn RemoteStore>,
  policies: Arc<PolicyStore>,
  default_ttl: Duration,
  ttl_overrides: HashMap<EntityKind, Duration>,
  clock: Arc<dyn Clock>,
  connectivity: Option<Arc<ConnectivityMonitor>>,
  snapshot: Option<Arc<dyn CacheSnapshot>>,
}

impl DataAccessBuilder {
  pub fn new(remote: Arc<dyn RemoteStore>) -> Self {
    Self {
      remote,
      policies: Arc::new(PolicyStore::new()),
      default_ttl: Duration::seconds(DEFAULT_TTL_SECS),
      ttl_overrides: HashMap::new(),
      clock: Arc::new(SystemClock),
      connectivity: None,
      snapshot: None,
    }
  }

  /// Share an existing policy store.
  pub fn policies(mut self, policies: Arc<PolicyStore>) -> Self {
    self.policies = policies;
    self
  }

  /// Load roles into a new policy store.
  pub fn roles(mut self, roles: impl IntoIterator<Item = Role>) -> Self {
    self.policies = Arc::new(PolicyStore::from_roles(roles));
    self
  }

  pub fn default_ttl(mut self, ttl: Duration) -> Self {
    self.default_ttl = ttl;
    self
  }

  /// TTL for one entity kind.
  pub fn ttl(mut self, kind: EntityKind, ttl: Duration) -> Self {
    self.ttl_overrides.insert(kind, ttl);
    self
  }

  /// Apply TTL settings from configuration. The snapshot itself is opened by
  /// the caller and passed to [`snapshot`](Self::snapshot).
  pub fn cache_config(mut self, config: &CacheConfig) -> Self {
    self.default_ttl = config.default_ttl();
    for kind in config.ttl_overrides.keys() {
      self.ttl_overrides.insert(*kind, config.ttl_for(*kind));
    }
    self
  }

  pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn connectivity(mut self, monitor: Arc<ConnectivityMonitor>) -> Self {
    self.connectivity = Some(monitor);
    self
  }

  pub fn snapshot(mut self, snapshot: Arc<dyn CacheSnapshot>) -> Self {
    self.snapshot = Some(snapshot);
    self
  }

  /// Build the facade. With a snapshot configured this starts the snapshot
  /// writer, so it must run inside a tokio runtime.
  pub fn build(self) -> DataAccess {
    let clock = self.clock;
    let default_ttl = self.default_ttl;
    let overrides = self.ttl_overrides;
    let caches = CacheSet::new(|kind| {
      let ttl = overrides.get(&kind).copied().unwrap_or(default_ttl);
      TtlCache::with_clock(ttl, Arc::clone(&clock))
    });

    let connectivity = self
      .connectivity
      .unwrap_or_else(|| Arc::new(ConnectivityMonitor::with_clock(Arc::clone(&clock))));

    DataAccess {
      evaluator: AuthorizationEvaluator::new(self.policies),
      caches,
      registry: SubscriptionRegistry::new(Arc::clone(&self.remote)),
      connectivity,
      remote: self.remote,
      snapshot: self.snapshot.map(SnapshotWriter::spawn),
      clock,
    }
  }
}
