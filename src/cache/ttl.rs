//! Keyed in-memory cache with time-based freshness.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::clock::{Clock, SystemClock};

/// Default freshness window, in seconds.
pub const DEFAULT_TTL_SECS: i64 = 300;

/// A cached value and when it was stored.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<V> {
  pub key: String,
  pub value: V,
  pub inserted_at: DateTime<Utc>,
}

/// Position of the cache taken before an async read or write whose result
/// will be stored. The store is refused if the cache has moved on since.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTicket {
  generation: u64,
  push_seq: u64,
}

struct CacheState<V> {
  entries: HashMap<String, CacheEntry<V>>,
  /// When a full listing last populated the cache
  bulk_refreshed_at: Option<DateTime<Utc>>,
  /// Bumped by `invalidate_all`; older tickets can no longer write
  generation: u64,
  push_seq: u64,
  /// Sequence number of the last push per key
  last_push: HashMap<String, u64>,
}

impl<V> CacheState<V> {
  fn is_current(&self, ticket: CacheTicket) -> bool {
    self.generation == ticket.generation
  }

  fn pushed_since(&self, ticket: CacheTicket, key: &str) -> bool {
    self
      .last_push
      .get(key)
      .is_some_and(|seq| *seq > ticket.push_seq)
  }

  fn record_push(&mut self, key: &str) {
    self.push_seq += 1;
    self.last_push.insert(key.to_string(), self.push_seq);
  }
}

/// Thread-safe TTL cache.
///
/// Reads never evict: an expired entry simply stops being returned by
/// [`get`](Self::get) but stays available through [`entry`](Self::entry) so
/// it can be served when the device is offline. Every operation holds the
/// lock only for the map access itself.
///
/// Pushed values take precedence over the caller's own reads and writes:
/// [`put_fetched`](Self::put_fetched) is refused for a key that received a
/// push after the caller's [`ticket`](Self::ticket) was taken. Both kinds of
/// store are refused once [`invalidate_all`](Self::invalidate_all) has run
/// since the ticket.
pub struct TtlCache<V> {
  state: Mutex<CacheState<V>>,
  ttl: Duration,
  clock: Arc<dyn Clock>,
}

impl<V: Clone> TtlCache<V> {
  pub fn new(ttl: Duration) -> Self {
    Self::with_clock(ttl, Arc::new(SystemClock))
  }

  pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
    Self {
      state: Mutex::new(CacheState {
        entries: HashMap::new(),
        bulk_refreshed_at: None,
        generation: 0,
        push_seq: 0,
        last_push: HashMap::new(),
      }),
      ttl,
      clock,
    }
  }

  pub fn ttl(&self) -> Duration {
    self.ttl
  }

  fn lock(&self) -> MutexGuard<'_, CacheState<V>> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn is_fresh(&self, inserted_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now - inserted_at < self.ttl
  }

  /// The value under `key` if it was stored less than one TTL ago.
  pub fn get(&self, key: &str) -> Option<V> {
    self.fresh_entry(key).map(|entry| entry.value)
  }

  /// Like [`get`](Self::get) but keeps the insertion time.
  pub fn fresh_entry(&self, key: &str) -> Option<CacheEntry<V>> {
    let now = self.clock.now();
    let state = self.lock();
    state
      .entries
      .get(key)
      .filter(|entry| self.is_fresh(entry.inserted_at, now))
      .cloned()
  }

  /// The entry under `key` regardless of age.
  pub fn entry(&self, key: &str) -> Option<CacheEntry<V>> {
    self.lock().entries.get(key).cloned()
  }

  /// Store `value`, overwriting any previous entry and restarting its TTL.
  pub fn put(&self, key: impl Into<String>, value: V) {
    let now = self.clock.now();
    self.put_at(key, value, now);
  }

  /// Store `value` as if it had been inserted at `inserted_at`.
  pub fn put_at(&self, key: impl Into<String>, value: V, inserted_at: DateTime<Utc>) {
    let key = key.into();
    let entry = CacheEntry {
      key: key.clone(),
      value,
      inserted_at,
    };
    self.lock().entries.insert(key, entry);
  }

  /// Remove one entry. Returns whether anything was removed.
  pub fn invalidate(&self, key: &str) -> bool {
    self.lock().entries.remove(key).is_some()
  }

  /// Drop every entry and forget the last full listing. Outstanding tickets
  /// stop being able to write.
  pub fn invalidate_all(&self) {
    let mut state = self.lock();
    state.entries.clear();
    state.bulk_refreshed_at = None;
    state.last_push.clear();
    state.generation += 1;
  }

  pub fn ticket(&self) -> CacheTicket {
    let state = self.lock();
    CacheTicket {
      generation: state.generation,
      push_seq: state.push_seq,
    }
  }

  /// Whether nothing has cleared the cache since `ticket`.
  pub fn is_current(&self, ticket: CacheTicket) -> bool {
    self.lock().is_current(ticket)
  }

  /// Store the result of the caller's own read or write.
  ///
  /// Refused if the cache was cleared since `ticket` or a push for `key`
  /// landed since. `on_store` runs under the cache lock when accepted.
  pub fn put_fetched(
    &self,
    ticket: CacheTicket,
    key: impl Into<String>,
    value: V,
    inserted_at: DateTime<Utc>,
    on_store: impl FnOnce(&V),
  ) -> bool {
    let key = key.into();
    let mut state = self.lock();
    if !state.is_current(ticket) || state.pushed_since(ticket, &key) {
      return false;
    }
    on_store(&value);
    state.entries.insert(
      key.clone(),
      CacheEntry {
        key,
        value,
        inserted_at,
      },
    );
    true
  }

  /// Remove `key` on behalf of the caller's own read or write. Refused under
  /// the same conditions as [`put_fetched`](Self::put_fetched).
  pub fn invalidate_fetched(&self, ticket: CacheTicket, key: &str, on_remove: impl FnOnce()) -> bool {
    let mut state = self.lock();
    if !state.is_current(ticket) || state.pushed_since(ticket, key) {
      return false;
    }
    if state.entries.remove(key).is_some() {
      on_remove();
    }
    true
  }

  /// Store a pushed value. Refused only if the cache was cleared since
  /// `ticket`.
  pub fn put_pushed(
    &self,
    ticket: CacheTicket,
    key: impl Into<String>,
    value: V,
    inserted_at: DateTime<Utc>,
    on_store: impl FnOnce(&V),
  ) -> bool {
    let key = key.into();
    let mut state = self.lock();
    if !state.is_current(ticket) {
      return false;
    }
    state.record_push(&key);
    on_store(&value);
    state.entries.insert(
      key.clone(),
      CacheEntry {
        key,
        value,
        inserted_at,
      },
    );
    true
  }

  /// Remove `key` because a push says it is gone.
  pub fn invalidate_pushed(&self, ticket: CacheTicket, key: &str, on_remove: impl FnOnce()) -> bool {
    let mut state = self.lock();
    if !state.is_current(ticket) {
      return false;
    }
    state.record_push(key);
    if state.entries.remove(key).is_some() {
      on_remove();
    }
    true
  }

  /// Record that a full listing was just written into the cache.
  pub fn mark_bulk_fresh(&self) {
    let now = self.clock.now();
    self.lock().bulk_refreshed_at = Some(now);
  }

  /// Like [`mark_bulk_fresh`](Self::mark_bulk_fresh), unless the cache was
  /// cleared since `ticket`.
  pub fn mark_bulk_fresh_in(&self, ticket: CacheTicket) -> bool {
    let now = self.clock.now();
    let mut state = self.lock();
    if !state.is_current(ticket) {
      return false;
    }
    state.bulk_refreshed_at = Some(now);
    true
  }

  /// Whether a full listing was loaded within the TTL.
  pub fn is_bulk_fresh(&self) -> bool {
    let now = self.clock.now();
    self
      .lock()
      .bulk_refreshed_at
      .is_some_and(|at| self.is_fresh(at, now))
  }

  pub fn bulk_refreshed_at(&self) -> Option<DateTime<Utc>> {
    self.lock().bulk_refreshed_at
  }

  /// Keep only the entries whose key satisfies `keep`.
  pub fn retain_keys(&self, mut keep: impl FnMut(&str) -> bool) {
    self.lock().entries.retain(|key, _| keep(key));
  }

  /// All fresh values, in no particular order.
  pub fn values(&self) -> Vec<V> {
    let now = self.clock.now();
    self
      .lock()
      .entries
      .values()
      .filter(|entry| self.is_fresh(entry.inserted_at, now))
      .map(|entry| entry.value.clone())
      .collect()
  }

  /// Every key including expired ones.
  pub fn keys(&self) -> Vec<String> {
    self.lock().entries.keys().cloned().collect()
  }

  /// Every entry including expired ones.
  pub fn entries(&self) -> Vec<CacheEntry<V>> {
    self.lock().entries.values().cloned().collect()
  }

  /// Evict expired entries. Returns how many were removed.
  pub fn purge_expired(&self) -> usize {
    let now = self.clock.now();
    let mut state = self.lock();
    let before = state.entries.len();
    state
      .entries
      .retain(|_, entry| now - entry.inserted_at < self.ttl);
    before - state.entries.len()
  }

  pub fn len(&self) -> usize {
    self.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}
