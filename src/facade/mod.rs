//! The data-access facade used by every domain service.
//!
//! Every call authorizes first, then consults the entity's cache, then the
//! remote store. Writes update the cache before returning, so a caller always
//! reads its own write. Live subscriptions overwrite whatever the cache holds
//! when they push: the push is authoritative over an optimistic write.

mod builder;
#[cfg(test)]
mod tests;

pub use builder::DataAccessBuilder;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::auth::{AuthorizationEvaluator, PolicyStore};
use crate::cache::{CacheTicket, Fetched, ReadPolicy, Record, SnapshotWriter, TtlCache};
use crate::clock::Clock;
use crate::connectivity::{ConnectivityMonitor, ConnectivityState};
use crate::error::{DataError, DataResult, DecodeError};
use crate::model::{ActionKind, Actor, EntityKind, Role};
use crate::remote::{Document, DocumentPath, Filter, ListQuery, RemoteStore, SubscriptionTarget};
use crate::subscription::SubscriptionRegistry;

/// One cache per entity kind.
struct CacheSet {
  caches: [Arc<TtlCache<Document>>; EntityKind::ALL.len()],
}

impl CacheSet {
  fn new(mut make: impl FnMut(EntityKind) -> TtlCache<Document>) -> Self {
    Self {
      caches: EntityKind::ALL.map(|kind| Arc::new(make(kind))),
    }
  }

  fn get(&self, kind: EntityKind) -> &Arc<TtlCache<Document>> {
    &self.caches[kind as usize]
  }

  fn iter(&self) -> impl Iterator<Item = &Arc<TtlCache<Document>>> {
    self.caches.iter()
  }
}

/// The cache of one entity kind together with its snapshot mirror. All cache
/// mutations go through here, including those made from subscription tasks.
///
/// Every mutation carries a [`CacheTicket`] taken before the remote call it
/// stems from. Snapshot updates are issued under the cache lock, so they are
/// ordered with the clear that sign-out queues after `invalidate_all`.
#[derive(Clone)]
struct KindStore {
  kind: EntityKind,
  cache: Arc<TtlCache<Document>>,
  snapshot: Option<SnapshotWriter>,
  clock: Arc<dyn Clock>,
}

impl KindStore {
  fn ticket(&self) -> CacheTicket {
    self.cache.ticket()
  }

  fn mirror_store(&self, doc: &Document, at: DateTime<Utc>) {
    if let Some(snapshot) = &self.snapshot {
      snapshot.store(self.kind, doc.clone(), at);
    }
  }

  fn mirror_remove(&self, id: &str) {
    if let Some(snapshot) = &self.snapshot {
      snapshot.remove(self.kind, id);
    }
  }

  /// Store the result of our own read or write. Returns false when a push
  /// or a sign-out got there first.
  fn put(&self, ticket: CacheTicket, doc: Document) -> bool {
    let now = self.clock.now();
    let id = doc.id.clone();
    let stored = self
      .cache
      .put_fetched(ticket, id.clone(), doc, now, |doc| self.mirror_store(doc, now));
    if !stored {
      debug!(kind = %self.kind, %id, "Cache moved on, result not stored");
    }
    stored
  }

  fn forget(&self, ticket: CacheTicket, id: &str) {
    self
      .cache
      .invalidate_fetched(ticket, id, || self.mirror_remove(id));
  }

  /// Cached ids missing from a full result set.
  fn absent_ids(&self, keep: &HashSet<&str>) -> Vec<String> {
    self
      .cache
      .keys()
      .into_iter()
      .filter(|key| !keep.contains(key.as_str()))
      .collect()
  }

  /// Apply one pushed batch. Returns false when the subscription predates the
  /// last sign-out; the cache then keeps nothing from the batch.
  fn apply_push(
    &self,
    ticket: CacheTicket,
    document: Option<&str>,
    whole_collection: bool,
    docs: Vec<Document>,
  ) -> bool {
    if !self.cache.is_current(ticket) {
      debug!(kind = %self.kind, "Dropping push from a previous session");
      return false;
    }

    let removed: Vec<String> = match document {
      Some(id) if !docs.iter().any(|doc| doc.id == id) => vec![id.to_string()],
      Some(_) => Vec::new(),
      None if whole_collection => {
        let ids: HashSet<&str> = docs.iter().map(|doc| doc.id.as_str()).collect();
        self.absent_ids(&ids)
      }
      None => Vec::new(),
    };
    for id in &removed {
      self
        .cache
        .invalidate_pushed(ticket, id, || self.mirror_remove(id));
    }

    let now = self.clock.now();
    let count = docs.len();
    for doc in docs {
      let id = doc.id.clone();
      self
        .cache
        .put_pushed(ticket, id, doc, now, |doc| self.mirror_store(doc, now));
    }
    if whole_collection {
      self.cache.mark_bulk_fresh_in(ticket);
    }
    debug!(kind = %self.kind, count, removed = removed.len(), "Applied pushed documents");
    // A sign-out mid-batch refused the rest; its listeners must not see it
    self.cache.is_current(ticket)
  }
}

/// Authorized, cached access to the remote store.
///
/// Construct once per session with [`DataAccess::builder`] and hand the
/// instance to each domain service.
pub struct DataAccess {
  evaluator: AuthorizationEvaluator,
  caches: CacheSet,
  registry: SubscriptionRegistry,
  connectivity: Arc<ConnectivityMonitor>,
  remote: Arc<dyn RemoteStore>,
  snapshot: Option<SnapshotWriter>,
  clock: Arc<dyn Clock>,
}

impl DataAccess {
  pub fn builder(remote: Arc<dyn RemoteStore>) -> DataAccessBuilder {
    DataAccessBuilder::new(remote)
  }

  pub fn authorize(&self, action: ActionKind, entity: EntityKind, actor: Option<&Actor>) -> bool {
    self.evaluator.allowed(action, entity, actor)
  }

  pub fn policies(&self) -> &Arc<PolicyStore> {
    self.evaluator.store()
  }

  pub fn cache(&self, kind: EntityKind) -> &TtlCache<Document> {
    self.caches.get(kind)
  }

  pub fn subscriptions(&self) -> &SubscriptionRegistry {
    &self.registry
  }

  pub fn connectivity(&self) -> ConnectivityState {
    self.connectivity.check_current_status()
  }

  pub fn connectivity_monitor(&self) -> &Arc<ConnectivityMonitor> {
    &self.connectivity
  }

  /// The raw remote store, for collaborators such as an offline write queue.
  pub fn remote(&self) -> &Arc<dyn RemoteStore> {
    &self.remote
  }

  fn kind_store(&self, kind: EntityKind) -> KindStore {
    KindStore {
      kind,
      cache: Arc::clone(self.caches.get(kind)),
      snapshot: self.snapshot.clone(),
      clock: Arc::clone(&self.clock),
    }
  }

  fn may_serve_stale(&self, policy: ReadPolicy) -> bool {
    policy.serve_stale_if_offline && !self.connectivity.is_reachable()
  }

  // ==========================================================================
  // Reads
  // ==========================================================================

  /// Read one record. A missing document is `Ok(None)`.
  pub async fn get<T: Record>(&self, actor: Option<&Actor>, id: &str) -> DataResult<Option<T>> {
    let fetched = self.get_with::<T>(actor, id, ReadPolicy::default()).await?;
    Ok(fetched.map(|f| f.data))
  }

  pub async fn get_with<T: Record>(
    &self,
    actor: Option<&Actor>,
    id: &str,
    policy: ReadPolicy,
  ) -> DataResult<Option<Fetched<T>>> {
    let collection = T::kind().collection();
    self
      .read_one(actor, T::kind(), id, policy, |doc| doc.decode::<T>(collection))
      .await
  }

  pub async fn get_document(
    &self,
    actor: Option<&Actor>,
    kind: EntityKind,
    id: &str,
    policy: ReadPolicy,
  ) -> DataResult<Option<Fetched<Document>>> {
    self
      .read_one(actor, kind, id, policy, |doc| Ok(doc.clone()))
      .await
  }

  async fn read_one<T, D>(
    &self,
    actor: Option<&Actor>,
    kind: EntityKind,
    id: &str,
    policy: ReadPolicy,
    decode: D,
  ) -> DataResult<Option<Fetched<T>>>
  where
    D: Fn(&Document) -> Result<T, DecodeError>,
  {
    self.evaluator.check(ActionKind::Read, kind, actor)?;
    let store = self.kind_store(kind);

    if let Some(entry) = store.cache.fresh_entry(id) {
      debug!(%kind, id, "Cache hit");
      let value = decode(&entry.value)?;
      return Ok(Some(Fetched::from_cache(value, Some(entry.inserted_at))));
    }

    let path = DocumentPath::new(kind.collection(), id);
    debug!(%path, "Cache miss, fetching");
    let ticket = store.ticket();
    match self.remote.fetch(&path).await {
      Ok(Some(doc)) => {
        // Undecodable documents never enter the cache
        let value = decode(&doc)?;
        store.put(ticket, doc);
        Ok(Some(Fetched::from_remote(value)))
      }
      Ok(None) => {
        store.forget(ticket, id);
        Ok(None)
      }
      Err(e) => {
        if self.may_serve_stale(policy) {
          if let Some(entry) = store.cache.entry(id) {
            warn!(%path, cached_at = %entry.inserted_at, "Offline, serving stale cache");
            let value = decode(&entry.value)?;
            return Ok(Some(Fetched::stale(value, Some(entry.inserted_at))));
          }
        }
        warn!(%path, error = %e, "Remote fetch failed");
        Err(e.into())
      }
    }
  }

  /// List records. Served from cache while the last full listing is fresh.
  pub async fn list<T: Record>(&self, actor: Option<&Actor>, query: &ListQuery) -> DataResult<Vec<T>> {
    let fetched = self.list_with::<T>(actor, query, ReadPolicy::default()).await?;
    Ok(fetched.data)
  }

  pub async fn list_with<T: Record>(
    &self,
    actor: Option<&Actor>,
    query: &ListQuery,
    policy: ReadPolicy,
  ) -> DataResult<Fetched<Vec<T>>> {
    let collection = T::kind().collection();
    self
      .read_many(actor, T::kind(), query, policy, |doc| doc.decode::<T>(collection))
      .await
  }

  pub async fn list_documents(
    &self,
    actor: Option<&Actor>,
    kind: EntityKind,
    query: &ListQuery,
    policy: ReadPolicy,
  ) -> DataResult<Fetched<Vec<Document>>> {
    self
      .read_many(actor, kind, query, policy, |doc| Ok(doc.clone()))
      .await
  }

  async fn read_many<T, D>(
    &self,
    actor: Option<&Actor>,
    kind: EntityKind,
    query: &ListQuery,
    policy: ReadPolicy,
    decode: D,
  ) -> DataResult<Fetched<Vec<T>>>
  where
    D: Fn(&Document) -> Result<T, DecodeError>,
  {
    self.evaluator.check(ActionKind::Read, kind, actor)?;
    let store = self.kind_store(kind);

    if store.cache.is_bulk_fresh() {
      debug!(%kind, "Serving listing from cache");
      let docs = query.apply(store.cache.values());
      let items = decode_each(kind, docs, &decode);
      return Ok(Fetched::from_cache(items, store.cache.bulk_refreshed_at()));
    }

    let ticket = store.ticket();
    match self.remote.fetch_many(kind.collection(), query).await {
      Ok(docs) => {
        let (kept, items) = split_decoded(kind, docs, &decode);
        let full = query.is_full_listing();
        if full {
          let ids: HashSet<&str> = kept.iter().map(|doc| doc.id.as_str()).collect();
          for id in store.absent_ids(&ids) {
            store.forget(ticket, &id);
          }
        }
        for doc in kept {
          store.put(ticket, doc);
        }
        // Mark only after every item is in place
        if full {
          store.cache.mark_bulk_fresh_in(ticket);
        }
        debug!(%kind, count = items.len(), full, "Fetched listing");
        Ok(Fetched::from_remote(items))
      }
      Err(e) => {
        if self.may_serve_stale(policy) {
          let entries = store.cache.entries();
          if !entries.is_empty() {
            let oldest = entries.iter().map(|entry| entry.inserted_at).min();
            let docs = query.apply(entries.into_iter().map(|entry| entry.value));
            warn!(%kind, "Offline, serving stale listing");
            return Ok(Fetched::stale(decode_each(kind, docs, &decode), oldest));
          }
        }
        warn!(%kind, error = %e, "Remote listing failed");
        Err(e.into())
      }
    }
  }

  // ==========================================================================
  // Writes
  // ==========================================================================

  pub async fn create<T: Record>(&self, actor: Option<&Actor>, record: &T) -> DataResult<T> {
    let doc = Document::encode(record.id(), record)?;
    self.write(actor, T::kind(), ActionKind::Create, doc).await?;
    Ok(record.clone())
  }

  /// Overwrite an existing record. Fails with `NotFound` if it doesn't exist.
  pub async fn update<T: Record>(&self, actor: Option<&Actor>, record: &T) -> DataResult<T> {
    let doc = Document::encode(record.id(), record)?;
    self.write(actor, T::kind(), ActionKind::Update, doc).await?;
    Ok(record.clone())
  }

  /// Delete a record and return what was deleted.
  pub async fn delete<T: Record>(&self, actor: Option<&Actor>, id: &str) -> DataResult<T> {
    let collection = T::kind().collection();
    self
      .remove(actor, T::kind(), id, |doc| doc.decode::<T>(collection))
      .await
  }

  pub async fn create_document(
    &self,
    actor: Option<&Actor>,
    kind: EntityKind,
    doc: Document,
  ) -> DataResult<Document> {
    self.write(actor, kind, ActionKind::Create, doc).await
  }

  pub async fn update_document(
    &self,
    actor: Option<&Actor>,
    kind: EntityKind,
    doc: Document,
  ) -> DataResult<Document> {
    self.write(actor, kind, ActionKind::Update, doc).await
  }

  pub async fn delete_document(
    &self,
    actor: Option<&Actor>,
    kind: EntityKind,
    id: &str,
  ) -> DataResult<Document> {
    self.remove(actor, kind, id, |doc| Ok(doc.clone())).await
  }

  async fn write(
    &self,
    actor: Option<&Actor>,
    kind: EntityKind,
    action: ActionKind,
    doc: Document,
  ) -> DataResult<Document> {
    self.evaluator.check(action, kind, actor)?;
    let path = DocumentPath::new(kind.collection(), doc.id.clone());
    let store = self.kind_store(kind);
    // Pushes for this key from here on are newer than our write
    let ticket = store.ticket();

    if action == ActionKind::Update && self.remote.fetch(&path).await?.is_none() {
      return Err(DataError::NotFound {
        entity: kind,
        id: doc.id,
      });
    }

    if let Err(e) = self.remote.write(&path, doc.data.clone()).await {
      warn!(%path, %action, error = %e, "Remote write failed");
      return Err(e.into());
    }

    if !store.put(ticket, doc.clone()) {
      debug!(%path, "Keeping pushed value over optimistic write");
    }
    info!(%path, %action, "Write committed");
    Ok(doc)
  }

  async fn remove<T, D>(
    &self,
    actor: Option<&Actor>,
    kind: EntityKind,
    id: &str,
    decode: D,
  ) -> DataResult<T>
  where
    D: Fn(&Document) -> Result<T, DecodeError>,
  {
    self.evaluator.check(ActionKind::Delete, kind, actor)?;
    let path = DocumentPath::new(kind.collection(), id);
    let store = self.kind_store(kind);
    let ticket = store.ticket();

    let Some(existing) = self.remote.fetch(&path).await? else {
      store.forget(ticket, id);
      return Err(DataError::NotFound {
        entity: kind,
        id: id.to_string(),
      });
    };
    let value = decode(&existing)?;

    if let Err(e) = self.remote.delete(&path).await {
      warn!(%path, error = %e, "Remote delete failed");
      return Err(e.into());
    }

    store.forget(ticket, id);
    info!(%path, "Delete committed");
    Ok(value)
  }

  // ==========================================================================
  // Subscriptions
  // ==========================================================================

  /// Watch a collection of `T`, optionally filtered. Returns the registry key.
  pub async fn subscribe<T, F>(
    &self,
    actor: Option<&Actor>,
    filter: Option<Filter>,
    on_update: F,
  ) -> DataResult<String>
  where
    T: Record,
    F: Fn(Vec<T>) + Send + Sync + 'static,
  {
    let mut target = SubscriptionTarget::collection(T::kind().collection());
    if let Some(filter) = filter {
      target = target.with_filter(filter);
    }
    self.subscribe_target(actor, T::kind(), target, on_update).await
  }

  /// Watch a single record. The callback receives an empty batch on deletion.
  pub async fn subscribe_document<T, F>(&self, actor: Option<&Actor>, id: &str, on_update: F) -> DataResult<String>
  where
    T: Record,
    F: Fn(Vec<T>) + Send + Sync + 'static,
  {
    let target = SubscriptionTarget::document(T::kind().collection(), id);
    self.subscribe_target(actor, T::kind(), target, on_update).await
  }

  /// Watch any target. Every push is written to the cache of `kind` before
  /// `on_update` sees it; undecodable documents are dropped from both.
  pub async fn subscribe_target<T, F>(
    &self,
    actor: Option<&Actor>,
    kind: EntityKind,
    target: SubscriptionTarget,
    on_update: F,
  ) -> DataResult<String>
  where
    T: DeserializeOwned + Send + 'static,
    F: Fn(Vec<T>) + Send + Sync + 'static,
  {
    self.evaluator.check(ActionKind::Read, kind, actor)?;

    let key = target.derived_key();
    let store = self.kind_store(kind);
    // Pushes are dropped once a sign-out clears the cache after this point
    let ticket = store.ticket();
    let whole_collection = target.is_whole_collection();
    let document = target.document.clone();
    let collection = kind.collection();

    let decode = move |doc: &Document| match doc.decode::<T>(collection) {
      Ok(value) => Some((doc.clone(), value)),
      Err(e) => {
        warn!(error = %e, "Dropping undecodable pushed document");
        None
      }
    };
    let apply = move |items: Vec<(Document, T)>| {
      let (docs, values): (Vec<Document>, Vec<T>) = items.into_iter().unzip();
      if store.apply_push(ticket, document.as_deref(), whole_collection, docs) {
        on_update(values);
      }
    };

    self
      .registry
      .subscribe(key.clone(), target, decode, apply)
      .await?;
    Ok(key)
  }

  pub fn unsubscribe(&self, key: &str) -> bool {
    self.registry.unsubscribe(key)
  }

  // ==========================================================================
  // Session lifecycle
  // ==========================================================================

  /// Forget everything tied to the signed-in actor: subscriptions, every
  /// cache and the snapshot. Runs without suspending.
  ///
  /// A pump or remote call already in flight cannot refill the caches
  /// afterwards: clearing a cache invalidates every ticket taken before it.
  pub fn sign_out(&self) {
    let cancelled = self.registry.cleanup();
    for cache in self.caches.iter() {
      cache.invalidate_all();
    }
    if let Some(snapshot) = &self.snapshot {
      snapshot.clear();
    }
    info!(cancelled, "Signed out, caches cleared");
  }

  /// Reload roles from the remote `roles` collection into the policy store.
  /// Undecodable role documents are skipped.
  pub async fn refresh_roles(&self) -> DataResult<usize> {
    let kind = EntityKind::Role;
    let docs = self
      .remote
      .fetch_many(kind.collection(), &ListQuery::all())
      .await?;
    let roles: Vec<Role> = decode_each(kind, docs, &|doc: &Document| {
      doc.decode::<Role>(kind.collection())
    });

    let count = roles.len();
    self.policies().replace_all(roles);
    info!(count, "Refreshed roles");
    Ok(count)
  }

  /// Populate the caches from the snapshot, keeping original insert times.
  /// Returns the number of documents loaded.
  pub async fn warm_start(&self) -> usize {
    let Some(snapshot) = &self.snapshot else {
      return 0;
    };

    let mut loaded = 0;
    for kind in EntityKind::ALL {
      let cache = self.caches.get(kind);
      let ticket = cache.ticket();
      match snapshot.load(kind).await {
        Ok(rows) => {
          for row in rows {
            let id = row.document.id.clone();
            if cache.put_fetched(ticket, id, row.document, row.cached_at, |_| {}) {
              loaded += 1;
            }
          }
        }
        Err(e) => warn!(%kind, error = %e, "Failed to load cache snapshot"),
      }
    }
    info!(loaded, "Warm-started caches from snapshot");
    loaded
  }

  /// Wait for queued snapshot writes to land.
  pub async fn flush_snapshot(&self) {
    if let Some(snapshot) = &self.snapshot {
      snapshot.flush().await;
    }
  }
}

fn decode_each<T>(
  kind: EntityKind,
  docs: Vec<Document>,
  decode: &impl Fn(&Document) -> Result<T, DecodeError>,
) -> Vec<T> {
  docs
    .iter()
    .filter_map(|doc| match decode(doc) {
      Ok(value) => Some(value),
      Err(e) => {
        warn!(%kind, error = %e, "Dropping undecodable document");
        None
      }
    })
    .collect()
}

fn split_decoded<T>(
  kind: EntityKind,
  docs: Vec<Document>,
  decode: &impl Fn(&Document) -> Result<T, DecodeError>,
) -> (Vec<Document>, Vec<T>) {
  let mut kept = Vec::with_capacity(docs.len());
  let mut items = Vec::with_capacity(docs.len());
  for doc in docs {
    match decode(&doc) {
      Ok(value) => {
        items.push(value);
        kept.push(doc);
      }
      Err(e) => warn!(%kind, error = %e, "Dropping undecodable document"),
    }
  }
  (kept, items)
}
