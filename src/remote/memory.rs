//! In-process document store.

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::trace;

use super::{Document, DocumentPath, DocumentStream, ListQuery, RemoteStore, SubscriptionTarget};
use crate::error::RemoteError;

type Collection = BTreeMap<String, Value>;
type PushSender = mpsc::UnboundedSender<Result<Vec<Document>, RemoteError>>;

struct Subscriber {
  target: SubscriptionTarget,
  tx: PushSender,
}

#[derive(Default)]
struct CallCounts {
  fetch: AtomicUsize,
  fetch_many: AtomicUsize,
  write: AtomicUsize,
  delete: AtomicUsize,
  subscribe: AtomicUsize,
}

/// A [`RemoteStore`] kept entirely in memory.
///
/// Writes, including ones made directly through [`MemoryStore::put`] to
/// stand in for another device, push fresh snapshots to every matching live
/// subscription. Reachability can be toggled to simulate going offline.
pub struct MemoryStore {
  collections: Mutex<BTreeMap<String, Collection>>,
  subscribers: Mutex<Vec<Subscriber>>,
  reachable: AtomicBool,
  calls: CallCounts,
}

impl Default for MemoryStore {
  fn default() -> Self {
    Self::new()
  }
}

impl MemoryStore {
  pub fn new() -> Self {
    Self {
      collections: Mutex::new(BTreeMap::new()),
      subscribers: Mutex::new(Vec::new()),
      reachable: AtomicBool::new(true),
      calls: CallCounts::default(),
    }
  }

  /// Load documents without notifying subscribers.
  pub fn seed(&self, collection: &str, docs: impl IntoIterator<Item = Document>) {
    let mut collections = self.lock_collections();
    let entries = collections.entry(collection.to_string()).or_default();
    for doc in docs {
      entries.insert(doc.id, doc.data);
    }
  }

  /// Write a document out-of-band, as another client would, and notify.
  /// The payload is stored as given, so malformed documents can be injected.
  pub fn put(&self, collection: &str, id: &str, data: Value) {
    let doc = Document::new(id, data);
    self
      .lock_collections()
      .entry(collection.to_string())
      .or_default()
      .insert(doc.id, doc.data);
    self.notify(collection);
  }

  /// Remove a document out-of-band and notify.
  pub fn remove(&self, collection: &str, id: &str) {
    if let Some(entries) = self.lock_collections().get_mut(collection) {
      entries.remove(id);
    }
    self.notify(collection);
  }

  /// Push a transport error to every live subscription on `collection`.
  pub fn push_error(&self, collection: &str, error: RemoteError) {
    let subscribers = self.lock_subscribers();
    for sub in subscribers.iter().filter(|s| s.target.collection == collection) {
      let _ = sub.tx.unbounded_send(Err(error.clone()));
    }
  }

  pub fn set_reachable(&self, reachable: bool) {
    self.reachable.store(reachable, Ordering::SeqCst);
  }

  pub fn get(&self, collection: &str, id: &str) -> Option<Value> {
    self
      .lock_collections()
      .get(collection)
      .and_then(|entries| entries.get(id).cloned())
  }

  pub fn fetch_calls(&self) -> usize {
    self.calls.fetch.load(Ordering::SeqCst)
  }

  pub fn fetch_many_calls(&self) -> usize {
    self.calls.fetch_many.load(Ordering::SeqCst)
  }

  pub fn write_calls(&self) -> usize {
    self.calls.write.load(Ordering::SeqCst)
  }

  pub fn delete_calls(&self) -> usize {
    self.calls.delete.load(Ordering::SeqCst)
  }

  pub fn subscribe_calls(&self) -> usize {
    self.calls.subscribe.load(Ordering::SeqCst)
  }

  /// Subscriptions whose stream has not been dropped yet.
  pub fn live_subscriptions(&self) -> usize {
    let mut subscribers = self.lock_subscribers();
    subscribers.retain(|s| !s.tx.is_closed());
    subscribers.len()
  }

  fn lock_collections(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Collection>> {
    self.collections.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn lock_subscribers(&self) -> std::sync::MutexGuard<'_, Vec<Subscriber>> {
    self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn check_reachable(&self) -> Result<(), RemoteError> {
    if self.reachable.load(Ordering::SeqCst) {
      Ok(())
    } else {
      Err(RemoteError::Unreachable)
    }
  }

  fn snapshot_for(&self, target: &SubscriptionTarget) -> Vec<Document> {
    let collections = self.lock_collections();
    let Some(entries) = collections.get(&target.collection) else {
      return Vec::new();
    };

    match &target.document {
      Some(id) => entries
        .get(id)
        .map(|data| vec![Document::new(id.clone(), data.clone())])
        .unwrap_or_default(),
      None => {
        let query = ListQuery {
          filter: target.filter.clone(),
          order: None,
        };
        query.apply(
          entries
            .iter()
            .map(|(id, data)| Document::new(id.clone(), data.clone())),
        )
      }
    }
  }

  fn notify(&self, collection: &str) {
    let targets: Vec<SubscriptionTarget> = self
      .lock_subscribers()
      .iter()
      .filter(|s| s.target.collection == collection)
      .map(|s| s.target.clone())
      .collect();
    if targets.is_empty() {
      return;
    }

    let snapshots: Vec<(SubscriptionTarget, Vec<Document>)> = targets
      .into_iter()
      .map(|target| {
        let docs = self.snapshot_for(&target);
        (target, docs)
      })
      .collect();

    let mut subscribers = self.lock_subscribers();
    subscribers.retain(|sub| {
      let Some((_, docs)) = snapshots.iter().find(|(t, _)| *t == sub.target) else {
        return true;
      };
      sub.tx.unbounded_send(Ok(docs.clone())).is_ok()
    });
    trace!(collection, live = subscribers.len(), "Pushed snapshots");
  }
}

#[async_trait]
impl RemoteStore for MemoryStore {
  async fn fetch(&self, path: &DocumentPath) -> Result<Option<Document>, RemoteError> {
    self.calls.fetch.fetch_add(1, Ordering::SeqCst);
    self.check_reachable()?;
    Ok(
      self
        .get(&path.collection, &path.id)
        .map(|data| Document::new(path.id.clone(), data)),
    )
  }

  async fn fetch_many(&self, collection: &str, query: &ListQuery) -> Result<Vec<Document>, RemoteError> {
    self.calls.fetch_many.fetch_add(1, Ordering::SeqCst);
    self.check_reachable()?;
    let docs: Vec<Document> = self
      .lock_collections()
      .get(collection)
      .map(|entries| {
        entries
          .iter()
          .map(|(id, data)| Document::new(id.clone(), data.clone()))
          .collect()
      })
      .unwrap_or_default();
    Ok(query.apply(docs))
  }

  async fn write(&self, path: &DocumentPath, data: Value) -> Result<(), RemoteError> {
    self.calls.write.fetch_add(1, Ordering::SeqCst);
    self.check_reachable()?;
    if !data.is_object() {
      return Err(RemoteError::Rejected(format!("{} payload must be an object", path)));
    }
    self.put(&path.collection, &path.id, data);
    Ok(())
  }

  async fn delete(&self, path: &DocumentPath) -> Result<(), RemoteError> {
    self.calls.delete.fetch_add(1, Ordering::SeqCst);
    self.check_reachable()?;
    self.remove(&path.collection, &path.id);
    Ok(())
  }

  async fn subscribe(&self, target: &SubscriptionTarget) -> Result<DocumentStream, RemoteError> {
    self.calls.subscribe.fetch_add(1, Ordering::SeqCst);
    self.check_reachable()?;

    let (tx, rx) = mpsc::unbounded();
    // Initial snapshot, then one push per change
    let _ = tx.unbounded_send(Ok(self.snapshot_for(target)));
    self.lock_subscribers().push(Subscriber {
      target: target.clone(),
      tx,
    });
    Ok(rx.boxed())
  }
}
