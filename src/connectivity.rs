//! Network reachability tracking.
//!
//! [`ConnectivityMonitor`] classifies raw path notifications from the
//! platform's network monitor and announces when reachability flips. It does
//! not reconnect or retry anything.

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};

/// Capacity of the change-event channel; slow receivers miss old flips.
const EVENT_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
  Wired,
  Wireless,
  Cellular,
  Unknown,
  None,
}

/// Interface types reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceType {
  Wired,
  Wifi,
  Cellular,
  Loopback,
  Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStatus {
  Satisfied,
  Unsatisfied,
  /// A connection could be brought up on demand but isn't up now
  RequiresConnection,
}

/// A raw path-change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPath {
  pub status: PathStatus,
  pub interfaces: Vec<InterfaceType>,
  pub expensive: bool,
  pub constrained: bool,
}

impl RawPath {
  pub fn satisfied(interfaces: Vec<InterfaceType>) -> Self {
    Self {
      status: PathStatus::Satisfied,
      interfaces,
      expensive: false,
      constrained: false,
    }
  }

  pub fn unsatisfied() -> Self {
    Self {
      status: PathStatus::Unsatisfied,
      interfaces: Vec::new(),
      expensive: false,
      constrained: false,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectivityState {
  pub reachable: bool,
  pub kind: ConnectionKind,
  pub costly: bool,
  pub constrained: bool,
  pub changed_at: DateTime<Utc>,
}

impl ConnectivityState {
  /// Assumed state before the first notification: reachable over an unknown
  /// link, so nothing is served stale until the platform reports otherwise.
  pub fn assumed_online(at: DateTime<Utc>) -> Self {
    Self {
      reachable: true,
      kind: ConnectionKind::Unknown,
      costly: false,
      constrained: false,
      changed_at: at,
    }
  }

  pub fn offline(at: DateTime<Utc>) -> Self {
    Self {
      reachable: false,
      kind: ConnectionKind::None,
      costly: false,
      constrained: false,
      changed_at: at,
    }
  }

  fn same_classification(&self, other: &Self) -> bool {
    self.reachable == other.reachable
      && self.kind == other.kind
      && self.costly == other.costly
      && self.constrained == other.constrained
  }
}

/// Classify a raw path. Wired beats Wi-Fi beats cellular.
pub fn classify(path: &RawPath, at: DateTime<Utc>) -> ConnectivityState {
  let reachable = path.status == PathStatus::Satisfied;
  if !reachable {
    return ConnectivityState::offline(at);
  }

  let has = |wanted: InterfaceType| path.interfaces.contains(&wanted);
  let kind = if has(InterfaceType::Wired) {
    ConnectionKind::Wired
  } else if has(InterfaceType::Wifi) {
    ConnectionKind::Wireless
  } else if has(InterfaceType::Cellular) {
    ConnectionKind::Cellular
  } else {
    ConnectionKind::Unknown
  };

  ConnectivityState {
    reachable,
    kind,
    costly: path.expensive,
    constrained: path.constrained,
    changed_at: at,
  }
}

pub struct ConnectivityMonitor {
  state: RwLock<ConnectivityState>,
  events: broadcast::Sender<ConnectivityState>,
  clock: Arc<dyn Clock>,
}

impl Default for ConnectivityMonitor {
  fn default() -> Self {
    Self::new()
  }
}

impl ConnectivityMonitor {
  pub fn new() -> Self {
    Self::with_clock(Arc::new(SystemClock))
  }

  pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
    let initial = ConnectivityState::assumed_online(clock.now());
    Self::with_initial(initial, clock)
  }

  pub fn with_initial(initial: ConnectivityState, clock: Arc<dyn Clock>) -> Self {
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    Self {
      state: RwLock::new(initial),
      events,
      clock,
    }
  }

  /// Current state, for callers that cannot wait for a push (e.g. just
  /// resumed from background).
  pub fn check_current_status(&self) -> ConnectivityState {
    self.state.read().unwrap_or_else(PoisonError::into_inner).clone()
  }

  pub fn is_reachable(&self) -> bool {
    self.state.read().unwrap_or_else(PoisonError::into_inner).reachable
  }

  /// Receive a state every time reachability flips.
  pub fn events(&self) -> broadcast::Receiver<ConnectivityState> {
    self.events.subscribe()
  }

  /// Apply one raw notification. Returns the new state if reachability
  /// flipped (and an event was sent), `None` otherwise.
  pub fn observe(&self, path: &RawPath) -> Option<ConnectivityState> {
    let now = self.clock.now();
    let next = classify(path, now);

    let flipped = {
      let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
      if state.same_classification(&next) {
        return None;
      }
      let flipped = state.reachable != next.reachable;
      *state = next.clone();
      flipped
    };

    if !flipped {
      debug!(kind = ?next.kind, costly = next.costly, "Connection details changed");
      return None;
    }

    if next.reachable {
      info!(kind = ?next.kind, "Connectivity restored");
    } else {
      warn!("Connectivity lost");
    }
    // No receivers is fine
    let _ = self.events.send(next.clone());
    Some(next)
  }

  /// Drive the monitor from a stream of raw notifications on a background task.
  pub fn attach<S>(self: &Arc<Self>, paths: S) -> JoinHandle<()>
  where
    S: Stream<Item = RawPath> + Send + 'static,
  {
    let monitor = Arc::clone(self);
    tokio::spawn(async move {
      let mut paths = Box::pin(paths);
      while let Some(path) = paths.next().await {
        monitor.observe(&path);
      }
      debug!("Path notification stream ended");
    })
  }
}
