//! Keyed registry of live remote subscriptions.

use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::RemoteError;
use crate::remote::{Document, RemoteStore, SubscriptionTarget};

struct ActiveSubscription {
  target: SubscriptionTarget,
  task: JoinHandle<()>,
}

/// Maps caller-chosen keys to live push subscriptions.
///
/// At most one subscription is live per key. Each subscription runs a pump
/// task that decodes every pushed batch and hands the decodable items to the
/// caller's callback; cancelling aborts the task, which drops the remote
/// stream.
///
/// [`cleanup`](Self::cleanup) also cancels subscriptions that are still being
/// opened: they fail with [`RemoteError::Cancelled`] instead of registering.
pub struct SubscriptionRegistry {
  remote: Arc<dyn RemoteStore>,
  active: Mutex<HashMap<String, ActiveSubscription>>,
  /// Bumped by `cleanup` while holding the `active` lock
  epoch: AtomicU64,
  cancellations: AtomicUsize,
}

impl SubscriptionRegistry {
  pub fn new(remote: Arc<dyn RemoteStore>) -> Self {
    Self {
      remote,
      active: Mutex::new(HashMap::new()),
      epoch: AtomicU64::new(0),
      cancellations: AtomicUsize::new(0),
    }
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<String, ActiveSubscription>> {
    self.active.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Register a subscription under `key`, replacing any existing one.
  ///
  /// Documents that `decode` rejects are dropped from the batch; the rest of
  /// the batch is still delivered. Transport errors on the stream are logged
  /// and the subscription stays registered.
  pub async fn subscribe<T, D, F>(
    &self,
    key: impl Into<String>,
    target: SubscriptionTarget,
    decode: D,
    on_update: F,
  ) -> Result<(), RemoteError>
  where
    T: Send + 'static,
    D: Fn(&Document) -> Option<T> + Send + Sync + 'static,
    F: Fn(Vec<T>) + Send + Sync + 'static,
  {
    let key = key.into();
    self.unsubscribe(&key);
    let epoch = self.epoch.load(Ordering::SeqCst);

    let mut stream = match self.remote.subscribe(&target).await {
      Ok(stream) => stream,
      Err(e) => {
        warn!(%key, watched = %target.describe(), error = %e, "Failed to open subscription");
        return Err(e);
      }
    };

    let mut active = self.lock();
    if self.epoch.load(Ordering::SeqCst) != epoch {
      drop(active);
      info!(%key, "Cleanup ran while opening; dropping subscription");
      return Err(RemoteError::Cancelled);
    }

    let task_key = key.clone();
    let task = tokio::spawn(async move {
      while let Some(batch) = stream.next().await {
        match batch {
          Ok(docs) => {
            let total = docs.len();
            let items: Vec<T> = docs.iter().filter_map(|doc| decode(doc)).collect();
            if items.len() < total {
              debug!(key = %task_key, dropped = total - items.len(), "Dropped undecodable documents");
            }
            on_update(items);
          }
          Err(e) => {
            warn!(key = %task_key, error = %e, "Subscription transport error");
          }
        }
      }
      debug!(key = %task_key, "Subscription stream ended");
    });

    info!(%key, watched = %target.describe(), "Subscribed");
    let replaced = active.insert(key.clone(), ActiveSubscription { target, task });
    drop(active);

    // A concurrent subscribe for the same key finished first
    if let Some(old) = replaced {
      self.cancel(&key, old);
    }
    Ok(())
  }

  /// Cancel and forget the subscription under `key`. No-op if absent.
  pub fn unsubscribe(&self, key: &str) -> bool {
    let removed = self.lock().remove(key);
    match removed {
      Some(sub) => {
        self.cancel(key, sub);
        true
      }
      None => false,
    }
  }

  /// Cancel every subscription. Returns how many were cancelled.
  pub fn cleanup(&self) -> usize {
    let drained: Vec<(String, ActiveSubscription)> = {
      let mut active = self.lock();
      self.epoch.fetch_add(1, Ordering::SeqCst);
      active.drain().collect()
    };
    let count = drained.len();
    for (key, sub) in drained {
      self.cancel(&key, sub);
    }
    if count > 0 {
      info!(count, "Cancelled all subscriptions");
    }
    count
  }

  fn cancel(&self, key: &str, sub: ActiveSubscription) {
    sub.task.abort();
    self.cancellations.fetch_add(1, Ordering::SeqCst);
    debug!(%key, watched = %sub.target.describe(), "Cancelled subscription");
  }

  /// Registered keys, sorted.
  pub fn active_keys(&self) -> Vec<String> {
    let mut keys: Vec<String> = self.lock().keys().cloned().collect();
    keys.sort();
    keys
  }

  pub fn count(&self) -> usize {
    self.lock().len()
  }

  pub fn is_active(&self, key: &str) -> bool {
    self.lock().contains_key(key)
  }

  pub fn target(&self, key: &str) -> Option<SubscriptionTarget> {
    self.lock().get(key).map(|sub| sub.target.clone())
  }

  /// Total subscriptions cancelled over the registry's lifetime.
  pub fn cancellations(&self) -> usize {
    self.cancellations.load(Ordering::SeqCst)
  }
}

impl Drop for SubscriptionRegistry {
  fn drop(&mut self) {
    for (_, sub) in self.lock().drain() {
      sub.task.abort();
    }
  }
}
