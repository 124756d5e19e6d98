use super::*;
use crate::cache::{CacheSnapshot, CacheSource, SqliteSnapshot};
use crate::clock::ManualClock;
use crate::connectivity::RawPath;
use crate::error::RemoteError;
use crate::model::{Policy, RoleKind};
use crate::remote::{DocumentStream, MemoryStore};
use async_trait::async_trait;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Kit {
  id: String,
  name: String,
  code: String,
  #[serde(default)]
  base_id: Option<String>,
}

impl Record for Kit {
  fn id(&self) -> &str {
    &self.id
  }

  fn kind() -> EntityKind {
    EntityKind::Kit
  }
}

fn kit(id: &str, name: &str, code: &str) -> Kit {
  Kit {
    id: id.to_string(),
    name: name.to_string(),
    code: code.to_string(),
    base_id: None,
  }
}

fn kit_doc(kit: &Kit) -> Document {
  Document::encode(kit.id.clone(), kit).unwrap()
}

fn policy(entity_kind: EntityKind, create: bool, read: bool, update: bool, delete: bool) -> Policy {
  Policy {
    entity_kind,
    can_create: create,
    can_read: read,
    can_update: update,
    can_delete: delete,
  }
}

fn roles() -> Vec<Role> {
  vec![
    Role {
      id: "admin".into(),
      kind: RoleKind::Admin,
      display_name: "Administrator".into(),
      policies: vec![],
    },
    Role {
      id: "ops".into(),
      kind: RoleKind::Operator,
      display_name: "Operations".into(),
      policies: vec![
        policy(EntityKind::Kit, false, true, true, false),
        policy(EntityKind::Base, false, true, false, false),
      ],
    },
    Role {
      id: "viewer".into(),
      kind: RoleKind::Viewer,
      display_name: "Viewer".into(),
      policies: vec![policy(EntityKind::Kit, false, true, false, false)],
    },
  ]
}

fn admin() -> Actor {
  Actor::new("a1", "admin")
}

fn ops() -> Actor {
  Actor::new("u1", "ops")
}

fn viewer() -> Actor {
  Actor::new("v1", "viewer")
}

struct Harness {
  store: Arc<MemoryStore>,
  clock: Arc<ManualClock>,
  monitor: Arc<ConnectivityMonitor>,
  data: DataAccess,
}

fn seeded_store() -> Arc<MemoryStore> {
  let store = Arc::new(MemoryStore::new());
  store.seed(
    "kits",
    vec![
      kit_doc(&kit("k1", "Alpha", "A-1")),
      kit_doc(&kit("k2", "Bravo", "B-2")),
    ],
  );
  store
}

fn harness() -> Harness {
  let store = seeded_store();
  let clock = Arc::new(ManualClock::default());
  let monitor = Arc::new(ConnectivityMonitor::with_clock(clock.clone()));
  let data = DataAccess::builder(store.clone())
    .roles(roles())
    .clock(clock.clone())
    .connectivity(monitor.clone())
    .build();
  Harness {
    store,
    clock,
    monitor,
    data,
  }
}

fn cached_kit(data: &DataAccess, id: &str) -> Option<Kit> {
  data
    .cache(EntityKind::Kit)
    .get(id)
    .map(|doc| doc.decode("kits").unwrap())
}

async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
  timeout(std::time::Duration::from_secs(2), rx.recv())
    .await
    .expect("timed out waiting for push")
    .expect("channel closed")
}

async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
  for _ in 0..200 {
    if cond() {
      return true;
    }
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
  }
  cond()
}

#[tokio::test]
async fn test_operator_cannot_create_but_can_update() {
  let h = harness();
  let ops = ops();

  let err = h
    .data
    .create(Some(&ops), &kit("k3", "Charlie", "C-3"))
    .await
    .unwrap_err();
  assert!(err.is_unauthorized());
  assert_eq!(h.store.write_calls(), 0);
  assert!(h.store.get("kits", "k3").is_none());

  let updated = kit("k1", "Alpha Prime", "A-1");
  h.data.update(Some(&ops), &updated).await.unwrap();
  assert_eq!(cached_kit(&h.data, "k1"), Some(updated.clone()));
  assert_eq!(h.data.get::<Kit>(Some(&ops), "k1").await.unwrap(), Some(updated));
}

#[tokio::test]
async fn test_list_within_ttl_fetches_once() {
  let h = harness();
  let viewer = viewer();

  let first = h.data.list::<Kit>(Some(&viewer), &ListQuery::all()).await.unwrap();
  let second = h.data.list::<Kit>(Some(&viewer), &ListQuery::all()).await.unwrap();
  assert_eq!(first.len(), 2);
  assert_eq!(first, second);
  assert_eq!(h.store.fetch_many_calls(), 1);

  h.clock.advance(Duration::seconds(301));
  h.data.list::<Kit>(Some(&viewer), &ListQuery::all()).await.unwrap();
  assert_eq!(h.store.fetch_many_calls(), 2);
}

#[tokio::test]
async fn test_subscription_push_overrides_optimistic_write() {
  let h = harness();
  let admin = admin();
  let (tx, mut rx) = mpsc::unbounded_channel();
  let key = h
    .data
    .subscribe_document::<Kit, _>(Some(&admin), "k1", move |kits| {
      let _ = tx.send(kits);
    })
    .await
    .unwrap();
  assert_eq!(next(&mut rx).await.len(), 1);

  h.data
    .update(Some(&admin), &kit("k1", "Optimistic", "A-1"))
    .await
    .unwrap();
  assert_eq!(cached_kit(&h.data, "k1").unwrap().name, "Optimistic");

  h.store.put(
    "kits",
    "k1",
    json!({"id": "k1", "name": "Authoritative", "code": "A-1"}),
  );
  loop {
    let batch = next(&mut rx).await;
    if batch.first().map(|k| k.name.as_str()) == Some("Authoritative") {
      break;
    }
  }

  assert_eq!(cached_kit(&h.data, "k1").unwrap().name, "Authoritative");
  assert!(h.data.subscriptions().is_active(&key));
}

#[tokio::test]
async fn test_sign_out_clears_caches_and_subscriptions() {
  let h = harness();
  let admin = admin();
  h.data.list::<Kit>(Some(&admin), &ListQuery::all()).await.unwrap();
  h.data
    .subscribe::<Kit, _>(Some(&admin), None, |_| {})
    .await
    .unwrap();
  assert_eq!(h.data.subscriptions().count(), 1);

  h.data.sign_out();

  assert!(h.data.cache(EntityKind::Kit).get("k1").is_none());
  assert!(h.data.cache(EntityKind::Kit).is_empty());
  assert!(!h.data.cache(EntityKind::Kit).is_bulk_fresh());
  assert!(h.data.subscriptions().active_keys().is_empty());
  assert!(eventually(|| h.store.live_subscriptions() == 0).await);

  let fetches = h.store.fetch_calls();
  h.data.get::<Kit>(Some(&admin), "k1").await.unwrap();
  assert_eq!(h.store.fetch_calls(), fetches + 1);
}

#[tokio::test]
async fn test_unauthorized_calls_never_reach_remote() {
  let h = harness();
  let nobody = Actor::without_role("x1");
  let stranger = Actor::new("x2", "no-such-role");

  for actor in [None, Some(&nobody), Some(&stranger)] {
    let err = h.data.get::<Kit>(actor, "k1").await.unwrap_err();
    assert!(err.is_unauthorized());
  }

  let err = h
    .data
    .list_documents(Some(&viewer()), EntityKind::Base, &ListQuery::all(), ReadPolicy::default())
    .await
    .unwrap_err();
  assert!(matches!(
    err,
    DataError::Unauthorized {
      action: ActionKind::Read,
      entity: EntityKind::Base
    }
  ));

  let err = h.data.delete::<Kit>(Some(&ops()), "k1").await.unwrap_err();
  assert!(err.is_unauthorized());

  assert_eq!(h.store.fetch_calls(), 0);
  assert_eq!(h.store.fetch_many_calls(), 0);
  assert_eq!(h.store.delete_calls(), 0);
  assert!(h.store.get("kits", "k1").is_some());
}

#[tokio::test]
async fn test_subscribe_requires_read() {
  let h = harness();
  let err = h
    .data
    .subscribe_target::<Document, _>(
      Some(&viewer()),
      EntityKind::Base,
      SubscriptionTarget::collection("bases"),
      |_| {},
    )
    .await
    .unwrap_err();
  assert!(err.is_unauthorized());
  assert_eq!(h.store.subscribe_calls(), 0);
  assert_eq!(h.data.subscriptions().count(), 0);
}

#[tokio::test]
async fn test_missing_records() {
  let h = harness();
  let admin = admin();

  assert_eq!(h.data.get::<Kit>(Some(&admin), "nope").await.unwrap(), None);

  let err = h
    .data
    .update(Some(&admin), &kit("nope", "Ghost", "G-0"))
    .await
    .unwrap_err();
  assert!(err.is_not_found());
  assert_eq!(h.store.write_calls(), 0);

  let err = h.data.delete::<Kit>(Some(&admin), "nope").await.unwrap_err();
  assert!(err.is_not_found());
  assert_eq!(h.store.delete_calls(), 0);
}

#[tokio::test]
async fn test_delete_returns_record_and_forgets_it() {
  let h = harness();
  let admin = admin();
  h.data.get::<Kit>(Some(&admin), "k2").await.unwrap();

  let deleted = h.data.delete::<Kit>(Some(&admin), "k2").await.unwrap();
  assert_eq!(deleted.name, "Bravo");
  assert!(h.data.cache(EntityKind::Kit).entry("k2").is_none());
  assert!(h.store.get("kits", "k2").is_none());
  assert_eq!(h.data.get::<Kit>(Some(&admin), "k2").await.unwrap(), None);
}

#[tokio::test]
async fn test_undecodable_documents() {
  let h = harness();
  let admin = admin();
  h.store.put("kits", "bad", json!({"name": 5}));

  let err = h.data.get::<Kit>(Some(&admin), "bad").await.unwrap_err();
  assert!(matches!(err, DataError::Decode(_)));
  assert!(h.data.cache(EntityKind::Kit).entry("bad").is_none());

  let raw = h
    .data
    .get_document(Some(&admin), EntityKind::Kit, "bad", ReadPolicy::default())
    .await
    .unwrap()
    .unwrap();
  assert_eq!(raw.data.field("name"), Some(&json!(5)));

  h.data.cache(EntityKind::Kit).invalidate("bad");
  let kits = h.data.list::<Kit>(Some(&admin), &ListQuery::all()).await.unwrap();
  assert_eq!(kits.len(), 2);
  assert!(h.data.cache(EntityKind::Kit).entry("bad").is_none());
}

#[tokio::test]
async fn test_stale_served_only_when_offline_and_opted_in() {
  let h = harness();
  let admin = admin();
  let cached_at = h.clock.now();
  h.data.get::<Kit>(Some(&admin), "k1").await.unwrap();

  h.clock.advance(Duration::seconds(301));
  h.store.set_reachable(false);

  // Remote down but the platform still reports a path
  let result = h
    .data
    .get_with::<Kit>(Some(&admin), "k1", ReadPolicy::serve_stale_if_offline())
    .await;
  assert!(matches!(
    result,
    Err(DataError::Transport(RemoteError::Unreachable))
  ));

  h.monitor.observe(&RawPath::unsatisfied());

  let fetched = h
    .data
    .get_with::<Kit>(Some(&admin), "k1", ReadPolicy::serve_stale_if_offline())
    .await
    .unwrap()
    .unwrap();
  assert!(fetched.is_stale());
  assert_eq!(fetched.data.name, "Alpha");
  assert_eq!(fetched.cached_at, Some(cached_at));

  assert!(h.data.get::<Kit>(Some(&admin), "k1").await.is_err());
  assert!(h
    .data
    .get_with::<Kit>(Some(&admin), "k2", ReadPolicy::serve_stale_if_offline())
    .await
    .is_err());
}

#[tokio::test]
async fn test_fresh_cache_served_while_unreachable() {
  let h = harness();
  let admin = admin();
  h.data.get::<Kit>(Some(&admin), "k1").await.unwrap();
  h.store.set_reachable(false);

  let fetched = h
    .data
    .get_with::<Kit>(Some(&admin), "k1", ReadPolicy::default())
    .await
    .unwrap()
    .unwrap();
  assert_eq!(fetched.source, CacheSource::Cache);
  assert_eq!(h.store.fetch_calls(), 1);
}

#[tokio::test]
async fn test_stale_listing_when_offline() {
  let h = harness();
  let admin = admin();
  h.data.list::<Kit>(Some(&admin), &ListQuery::all()).await.unwrap();

  h.clock.advance(Duration::seconds(600));
  h.store.set_reachable(false);
  h.monitor.observe(&RawPath::unsatisfied());

  let fetched = h
    .data
    .list_with::<Kit>(Some(&admin), &ListQuery::all(), ReadPolicy::serve_stale_if_offline())
    .await
    .unwrap();
  assert!(fetched.is_stale());
  assert_eq!(fetched.data.len(), 2);
  assert!(fetched.cached_at.is_some());
}

#[tokio::test]
async fn test_filtered_list_uses_cache_only_after_full_listing() {
  let h = harness();
  let viewer = viewer();
  let by_code = ListQuery::all().filtered(Filter::new().eq("code", "B-2"));

  let found = h.data.list::<Kit>(Some(&viewer), &by_code).await.unwrap();
  assert_eq!(found, vec![kit("k2", "Bravo", "B-2")]);
  assert!(!h.data.cache(EntityKind::Kit).is_bulk_fresh());
  assert_eq!(h.store.fetch_many_calls(), 1);

  h.data.list::<Kit>(Some(&viewer), &ListQuery::all()).await.unwrap();
  assert_eq!(h.store.fetch_many_calls(), 2);

  let found = h.data.list::<Kit>(Some(&viewer), &by_code).await.unwrap();
  assert_eq!(found.len(), 1);
  assert_eq!(h.store.fetch_many_calls(), 2);
}

#[tokio::test]
async fn test_full_listing_prunes_removed_ids() {
  let h = harness();
  let viewer = viewer();
  h.data.list::<Kit>(Some(&viewer), &ListQuery::all()).await.unwrap();
  assert_eq!(h.data.cache(EntityKind::Kit).len(), 2);

  h.store.remove("kits", "k2");
  h.clock.advance(Duration::seconds(301));

  let kits = h.data.list::<Kit>(Some(&viewer), &ListQuery::all()).await.unwrap();
  assert_eq!(kits.len(), 1);
  assert!(h.data.cache(EntityKind::Kit).entry("k2").is_none());
}

#[tokio::test]
async fn test_failed_write_leaves_cache_untouched() {
  let h = harness();
  h.store.set_reachable(false);

  let err = h
    .data
    .create(Some(&admin()), &kit("k3", "Charlie", "C-3"))
    .await
    .unwrap_err();
  assert!(matches!(err, DataError::Transport(RemoteError::Unreachable)));
  assert!(h.data.cache(EntityKind::Kit).entry("k3").is_none());
}

#[tokio::test]
async fn test_create_then_read_hits_cache() {
  let h = harness();
  let admin = admin();
  let created = h
    .data
    .create(Some(&admin), &kit("k3", "Charlie", "C-3"))
    .await
    .unwrap();

  let read = h.data.get::<Kit>(Some(&admin), "k3").await.unwrap();
  assert_eq!(read, Some(created));
  assert_eq!(h.store.fetch_calls(), 0);
}

#[tokio::test]
async fn test_code_uniqueness_check_composes_from_list_and_create() {
  let h = harness();
  let admin = admin();

  async fn create_unique(data: &DataAccess, actor: &Actor, candidate: Kit) -> DataResult<Option<Kit>> {
    let query = ListQuery::all().filtered(Filter::new().eq("code", candidate.code.clone()));
    if !data.list::<Kit>(Some(actor), &query).await?.is_empty() {
      return Ok(None);
    }
    data.create(Some(actor), &candidate).await.map(Some)
  }

  assert_eq!(
    create_unique(&h.data, &admin, kit("k9", "Dup", "A-1")).await.unwrap(),
    None
  );
  assert!(create_unique(&h.data, &admin, kit("k3", "Charlie", "C-3"))
    .await
    .unwrap()
    .is_some());
  assert_eq!(h.store.write_calls(), 1);
}

#[tokio::test]
async fn test_collection_subscription_marks_listing_fresh() {
  let h = harness();
  let viewer = viewer();
  let (tx, mut rx) = mpsc::unbounded_channel();
  h.data
    .subscribe::<Kit, _>(Some(&viewer), None, move |kits| {
      let _ = tx.send(kits.len());
    })
    .await
    .unwrap();
  assert_eq!(next(&mut rx).await, 2);

  assert!(h.data.cache(EntityKind::Kit).is_bulk_fresh());
  let kits = h.data.list::<Kit>(Some(&viewer), &ListQuery::all()).await.unwrap();
  assert_eq!(kits.len(), 2);
  assert_eq!(h.store.fetch_many_calls(), 0);

  h.store.remove("kits", "k1");
  assert_eq!(next(&mut rx).await, 1);
  assert!(h.data.cache(EntityKind::Kit).entry("k1").is_none());
}

#[tokio::test]
async fn test_document_subscription_sees_deletion() {
  let h = harness();
  let (tx, mut rx) = mpsc::unbounded_channel();
  h.data
    .subscribe_document::<Kit, _>(Some(&viewer()), "k1", move |kits| {
      let _ = tx.send(kits);
    })
    .await
    .unwrap();
  assert_eq!(next(&mut rx).await.len(), 1);
  assert!(h.data.cache(EntityKind::Kit).get("k1").is_some());

  h.store.remove("kits", "k1");
  assert!(next(&mut rx).await.is_empty());
  assert!(h.data.cache(EntityKind::Kit).entry("k1").is_none());
}

#[tokio::test]
async fn test_same_target_shares_one_subscription() {
  let h = harness();
  let viewer = viewer();
  let filter = || Some(Filter::new().eq("code", "A-1"));
  let first = h
    .data
    .subscribe::<Kit, _>(Some(&viewer), filter(), |_| {})
    .await
    .unwrap();
  let second = h
    .data
    .subscribe::<Kit, _>(Some(&viewer), filter(), |_| {})
    .await
    .unwrap();

  assert_eq!(first, second);
  assert_eq!(h.data.subscriptions().count(), 1);
  assert!(h.data.unsubscribe(&first));
  assert_eq!(h.data.subscriptions().count(), 0);
}

#[tokio::test]
async fn test_refresh_roles_replaces_policies() {
  let h = harness();
  let ops = ops();
  let promoted = Role {
    id: "ops".into(),
    kind: RoleKind::Operator,
    display_name: "Operations".into(),
    policies: vec![policy(EntityKind::Kit, true, true, true, false)],
  };
  h.store.seed(
    "roles",
    vec![
      Document::encode("ops", &promoted).unwrap(),
      Document::new("broken", json!({"kind": "superuser"})),
    ],
  );

  assert!(!h.data.authorize(ActionKind::Create, EntityKind::Kit, Some(&ops)));
  assert_eq!(h.data.refresh_roles().await.unwrap(), 1);
  assert!(h.data.authorize(ActionKind::Create, EntityKind::Kit, Some(&ops)));
  assert!(h.data.policies().role("admin").is_none());
}

#[tokio::test]
async fn test_role_removal_applies_to_next_call() {
  let h = harness();
  let ops = ops();
  h.data.get::<Kit>(Some(&ops), "k1").await.unwrap();

  h.data.policies().remove("ops");
  let err = h.data.get::<Kit>(Some(&ops), "k1").await.unwrap_err();
  assert!(err.is_unauthorized());
}

#[tokio::test]
async fn test_admin_bypasses_policies() {
  let h = harness();
  for kind in EntityKind::ALL {
    for action in ActionKind::ALL {
      assert!(h.data.authorize(action, kind, Some(&admin())));
    }
  }
  assert!(!h.data.authorize(ActionKind::Delete, EntityKind::User, Some(&ops())));
  assert!(!h.data.authorize(ActionKind::Read, EntityKind::Kit, None));
}

#[tokio::test]
async fn test_warm_start_restores_snapshot() {
  let store = seeded_store();
  let clock = Arc::new(ManualClock::default());
  let snapshot: Arc<dyn CacheSnapshot> = Arc::new(SqliteSnapshot::open_in_memory().unwrap());
  let admin = admin();

  let first = DataAccess::builder(store.clone())
    .roles(roles())
    .clock(clock.clone())
    .snapshot(Arc::clone(&snapshot))
    .build();
  first.get::<Kit>(Some(&admin), "k1").await.unwrap();
  first.flush_snapshot().await;
  drop(first);

  let second = DataAccess::builder(store.clone())
    .roles(roles())
    .clock(clock.clone())
    .snapshot(Arc::clone(&snapshot))
    .build();
  assert_eq!(second.warm_start().await, 1);

  store.set_reachable(false);
  let fetched = second
    .get_with::<Kit>(Some(&admin), "k1", ReadPolicy::default())
    .await
    .unwrap()
    .unwrap();
  assert_eq!(fetched.source, CacheSource::Cache);
  assert_eq!(fetched.data.name, "Alpha");

  second.sign_out();
  second.flush_snapshot().await;
  assert!(snapshot.load(EntityKind::Kit).unwrap().is_empty());
}

/// Another client changes `kits/k1` while our write is in flight. The write
/// returns only after that change was pushed to us.
struct RacingStore {
  inner: Arc<MemoryStore>,
  rival: Value,
  pushed: Arc<Notify>,
}

#[async_trait]
impl RemoteStore for RacingStore {
  async fn fetch(&self, path: &DocumentPath) -> Result<Option<Document>, RemoteError> {
    self.inner.fetch(path).await
  }

  async fn fetch_many(&self, collection: &str, query: &ListQuery) -> Result<Vec<Document>, RemoteError> {
    self.inner.fetch_many(collection, query).await
  }

  async fn write(&self, path: &DocumentPath, data: Value) -> Result<(), RemoteError> {
    self.inner.write(path, data).await?;
    self.inner.put("kits", "k1", self.rival.clone());
    timeout(std::time::Duration::from_secs(2), self.pushed.notified())
      .await
      .expect("rival change was never pushed");
    Ok(())
  }

  async fn delete(&self, path: &DocumentPath) -> Result<(), RemoteError> {
    self.inner.delete(path).await
  }

  async fn subscribe(&self, target: &SubscriptionTarget) -> Result<DocumentStream, RemoteError> {
    self.inner.subscribe(target).await
  }
}

/// Holds every `fetch` until released.
struct GatedStore {
  inner: Arc<MemoryStore>,
  entered: Notify,
  release: Notify,
}

#[async_trait]
impl RemoteStore for GatedStore {
  async fn fetch(&self, path: &DocumentPath) -> Result<Option<Document>, RemoteError> {
    self.entered.notify_one();
    self.release.notified().await;
    self.inner.fetch(path).await
  }

  async fn fetch_many(&self, collection: &str, query: &ListQuery) -> Result<Vec<Document>, RemoteError> {
    self.inner.fetch_many(collection, query).await
  }

  async fn write(&self, path: &DocumentPath, data: Value) -> Result<(), RemoteError> {
    self.inner.write(path, data).await
  }

  async fn delete(&self, path: &DocumentPath) -> Result<(), RemoteError> {
    self.inner.delete(path).await
  }

  async fn subscribe(&self, target: &SubscriptionTarget) -> Result<DocumentStream, RemoteError> {
    self.inner.subscribe(target).await
  }
}

#[tokio::test]
async fn test_push_during_write_beats_optimistic_value() {
  let inner = seeded_store();
  let pushed = Arc::new(Notify::new());
  let remote = Arc::new(RacingStore {
    inner: inner.clone(),
    rival: json!({"id": "k1", "name": "Authoritative", "code": "A-1"}),
    pushed: pushed.clone(),
  });
  let data = DataAccess::builder(remote).roles(roles()).build();
  let admin = admin();

  data
    .subscribe_document::<Kit, _>(Some(&admin), "k1", move |kits| {
      if kits.iter().any(|kit| kit.name == "Authoritative") {
        pushed.notify_one();
      }
    })
    .await
    .unwrap();

  let written = data
    .update(Some(&admin), &kit("k1", "Optimistic", "A-1"))
    .await
    .unwrap();
  assert_eq!(written.name, "Optimistic");
  assert_eq!(inner.get("kits", "k1").unwrap()["name"], "Authoritative");
  assert_eq!(cached_kit(&data, "k1").unwrap().name, "Authoritative");
}

#[tokio::test]
async fn test_push_from_before_sign_out_is_dropped() {
  let h = harness();
  let store = h.data.kind_store(EntityKind::Kit);
  let ticket = store.ticket();
  h.data.sign_out();

  let docs = vec![kit_doc(&kit("k1", "Alpha", "A-1"))];
  assert!(!store.apply_push(ticket, None, true, docs.clone()));
  assert!(h.data.cache(EntityKind::Kit).is_empty());
  assert!(!h.data.cache(EntityKind::Kit).is_bulk_fresh());

  // A ticket from the new session applies normally
  assert!(store.apply_push(store.ticket(), None, true, docs));
  assert!(cached_kit(&h.data, "k1").is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sign_out_during_large_push_leaves_cache_empty() {
  let store = Arc::new(MemoryStore::new());
  store.seed(
    "kits",
    (0..20_000).map(|i| kit_doc(&kit(&format!("k{i}"), "Bulk", &format!("B-{i}")))),
  );
  let data = DataAccess::builder(store.clone()).roles(roles()).build();

  data
    .subscribe::<Kit, _>(Some(&admin()), None, |_| {})
    .await
    .unwrap();
  data.sign_out();

  assert!(eventually(|| store.live_subscriptions() == 0).await);
  tokio::time::sleep(std::time::Duration::from_millis(50)).await;
  assert!(data.cache(EntityKind::Kit).is_empty());
  assert!(!data.cache(EntityKind::Kit).is_bulk_fresh());
  assert!(data.subscriptions().active_keys().is_empty());
}

#[tokio::test]
async fn test_read_in_flight_during_sign_out_is_not_cached() {
  let remote = Arc::new(GatedStore {
    inner: seeded_store(),
    entered: Notify::new(),
    release: Notify::new(),
  });
  let data = Arc::new(DataAccess::builder(remote.clone()).roles(roles()).build());

  let reader = {
    let data = Arc::clone(&data);
    tokio::spawn(async move { data.get::<Kit>(Some(&admin()), "k1").await })
  };
  remote.entered.notified().await;
  data.sign_out();
  remote.release.notify_one();

  let kit = reader.await.unwrap().unwrap();
  assert_eq!(kit.map(|kit| kit.name), Some("Alpha".to_string()));
  assert!(data.cache(EntityKind::Kit).entry("k1").is_none());
}
