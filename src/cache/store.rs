//! In-memory query cache with single-flight fetching and subscriber fan-out.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, warn};

use super::entry::{CacheEntry, EntryStatus, Snapshot, StaleTime};
use super::key::CacheKey;
use crate::error::{QueryError, QueryResult};
use crate::storage::KvStore;

/// Folds a fetched result into whatever the entry holds when the fetch lands.
pub(crate) type Merge<V> = Box<dyn FnOnce(Option<&V>) -> V + Send>;

/// A fetch that has not been launched yet.
pub(crate) type PendingFetch<V> = BoxFuture<'static, QueryResult<Merge<V>>>;

/// Handle on an in-flight fetch, shared by every caller that joined it.
pub(crate) type Flight<V> = Shared<BoxFuture<'static, QueryResult<V>>>;

type Callback<V> = Arc<dyn Fn(&CacheEntry<V>) + Send + Sync>;

struct InFlight<V> {
  request_id: u64,
  flight: Flight<V>,
}

struct Slot<V> {
  entry: CacheEntry<V>,
  stale_time: Option<StaleTime>,
  in_flight: Option<InFlight<V>>,
}

impl<V> Slot<V> {
  fn new(key: CacheKey) -> Self {
    Self {
      entry: CacheEntry::new(key),
      stale_time: None,
      in_flight: None,
    }
  }
}

struct State<V> {
  slots: HashMap<CacheKey, Slot<V>>,
  subscribers: HashMap<CacheKey, BTreeMap<u64, Callback<V>>>,
  next_subscriber: u64,
  next_request: u64,
}

impl<V> State<V> {
  fn slot_mut(&mut self, key: &CacheKey) -> &mut Slot<V> {
    self
      .slots
      .entry(key.clone())
      .or_insert_with(|| Slot::new(key.clone()))
  }
}

struct Inner<V> {
  state: Mutex<State<V>>,
  default_stale_time: StaleTime,
}

impl<V> Inner<V> {
  fn lock(&self) -> MutexGuard<'_, State<V>> {
    // Callbacks run outside the lock, so a poisoned state is still consistent.
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

/// Outcome of a get-or-fetch lookup.
enum Lookup<V> {
  Hit(V),
  Wait(Flight<V>),
}

/// Serialized form of a persisted entry.
#[derive(Serialize, Deserialize)]
struct PersistedEntry<V> {
  key: CacheKey,
  value: V,
  last_updated: Option<DateTime<Utc>>,
  /// Invalidated or errored when persisted; comes back `Stale`
  #[serde(default)]
  stale: bool,
}

/// Single source of truth for fetched values, addressed by [`CacheKey`].
///
/// Cloning is cheap and every clone shares the same entries. All writes go
/// through this API; subscribers of a key are notified synchronously, in
/// subscription order, before the writing call returns.
///
/// Fetches are spawned onto the tokio runtime, so the fetching methods must
/// be called from within one.
pub struct CacheStore<V> {
  inner: Arc<Inner<V>>,
}

impl<V> Clone for CacheStore<V> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<V: Clone + Send + Sync + 'static> Default for CacheStore<V> {
  fn default() -> Self {
    Self::new(StaleTime::default())
  }
}

impl<V: Clone + Send + Sync + 'static> CacheStore<V> {
  /// Create an empty store with a global default stale time.
  pub fn new(default_stale_time: StaleTime) -> Self {
    Self {
      inner: Arc::new(Inner {
        state: Mutex::new(State {
          slots: HashMap::new(),
          subscribers: HashMap::new(),
          next_subscriber: 0,
          next_request: 0,
        }),
        default_stale_time,
      }),
    }
  }

  /// Current entry for `key`, if one was ever created.
  pub fn get(&self, key: &CacheKey) -> Option<CacheEntry<V>> {
    let state = self.inner.lock();
    state.slots.get(key).map(|slot| slot.entry.clone())
  }

  /// Current value for `key`, if any.
  pub fn value(&self, key: &CacheKey) -> Option<V> {
    let state = self.inner.lock();
    state.slots.get(key).and_then(|slot| slot.entry.value.clone())
  }

  /// Overwrite the value and timestamp of `key` and notify its subscribers.
  pub fn set(&self, key: &CacheKey, value: V, status: EntryStatus) {
    let mut state = self.inner.lock();
    let entry = &mut state.slot_mut(key).entry;
    entry.value = Some(value);
    entry.status = status;
    entry.last_updated = Some(Utc::now());
    entry.error = None;
    debug!(key = %key, ?status, "cache set");
    self.notify(state, key);
  }

  /// Mark `key` stale, keeping its value visible until a fetch replaces it.
  ///
  /// In-flight fetches are left alone and still merge when they land.
  pub fn invalidate(&self, key: &CacheKey) {
    let mut state = self.inner.lock();
    let Some(slot) = state.slots.get_mut(key) else {
      return;
    };
    slot.entry.status = EntryStatus::Stale;
    debug!(key = %key, "cache invalidated");
    self.notify(state, key);
  }

  /// Invalidate every key that starts with `prefix`.
  pub fn invalidate_prefix(&self, prefix: &CacheKey) {
    let keys: Vec<CacheKey> = {
      let state = self.inner.lock();
      state
        .slots
        .keys()
        .filter(|k| k.starts_with(prefix))
        .cloned()
        .collect()
    };

    for key in &keys {
      self.invalidate(key);
    }
  }

  /// Whether `key` is stale under `stale_time`.
  ///
  /// Missing, valueless, invalidated and errored entries are always stale.
  pub fn is_stale(&self, key: &CacheKey, stale_time: StaleTime) -> bool {
    let state = self.inner.lock();
    match state.slots.get(key) {
      Some(slot) => slot.entry.is_stale(stale_time, Utc::now()),
      None => true,
    }
  }

  /// Override the stale time used by [`fetch`](Self::fetch) for one key.
  pub fn set_stale_time(&self, key: &CacheKey, stale_time: StaleTime) {
    let mut state = self.inner.lock();
    state.slot_mut(key).stale_time = Some(stale_time);
  }

  /// Stale time in effect for `key`: its override, else the global default.
  pub fn stale_time_for(&self, key: &CacheKey) -> StaleTime {
    let state = self.inner.lock();
    state
      .slots
      .get(key)
      .and_then(|slot| slot.stale_time)
      .unwrap_or(self.inner.default_stale_time)
  }

  /// Whether a fetch for `key` is currently in flight.
  pub fn is_fetching(&self, key: &CacheKey) -> bool {
    let state = self.inner.lock();
    state
      .slots
      .get(key)
      .map(|slot| slot.in_flight.is_some())
      .unwrap_or(false)
  }

  /// Return the cached value when fresh, otherwise fetch it.
  ///
  /// Concurrent calls for the same key share one in-flight fetch; `fetcher`
  /// is only invoked by the caller that starts it, once the fetch is first
  /// polled and outside the store lock, so it may read the store. A failed
  /// fetch marks the entry `Error`, keeps the last good value and returns
  /// the error.
  pub async fn fetch<F, Fut>(&self, key: &CacheKey, fetcher: F) -> QueryResult<V>
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = QueryResult<V>> + Send + 'static,
  {
    match self.lookup(key, fetcher) {
      Lookup::Hit(value) => Ok(value),
      Lookup::Wait(flight) => flight.await,
    }
  }

  fn lookup<F, Fut>(&self, key: &CacheKey, fetcher: F) -> Lookup<V>
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = QueryResult<V>> + Send + 'static,
  {
    let mut state = self.inner.lock();
    let default_stale_time = self.inner.default_stale_time;
    let slot = state.slot_mut(key);
    let stale_time = slot.stale_time.unwrap_or(default_stale_time);

    if !slot.entry.is_stale(stale_time, Utc::now()) {
      if let Some(value) = &slot.entry.value {
        return Lookup::Hit(value.clone());
      }
    }

    if let Some(in_flight) = &slot.in_flight {
      debug!(key = %key, request_id = in_flight.request_id, "joining in-flight fetch");
      return Lookup::Wait(in_flight.flight.clone());
    }

    // Deferred: the lock is released before anything polls this
    let pending = async move { fetcher().await }
      .map(|result| result.map(|value| Box::new(move |_: Option<&V>| value) as Merge<V>))
      .boxed();
    Lookup::Wait(self.launch(state, key, pending))
  }

  /// Launch a fetch planned from the current entry, unless one is in flight
  /// or `plan` declines. Returns `None` without side effects in those cases.
  pub(crate) fn try_launch<P>(&self, key: &CacheKey, plan: P) -> Option<Flight<V>>
  where
    P: FnOnce(&CacheEntry<V>) -> Option<PendingFetch<V>>,
  {
    let mut state = self.inner.lock();
    let slot = state.slot_mut(key);
    if slot.in_flight.is_some() {
      return None;
    }
    let pending = plan(&slot.entry)?;
    Some(self.launch(state, key, pending))
  }

  fn launch(
    &self,
    mut state: MutexGuard<'_, State<V>>,
    key: &CacheKey,
    pending: PendingFetch<V>,
  ) -> Flight<V> {
    state.next_request += 1;
    let request_id = state.next_request;

    let slot = state.slot_mut(key);
    let generation = slot.entry.generation;
    slot.entry.status = EntryStatus::Fetching;

    let store = self.clone();
    let flight_key = key.clone();
    let flight = async move {
      let result = pending.await;
      store.complete(&flight_key, request_id, generation, result)
    }
    .boxed()
    .shared();

    slot.in_flight = Some(InFlight {
      request_id,
      flight: flight.clone(),
    });
    debug!(key = %key, request_id, generation, "fetch started");
    self.notify(state, key);

    // Drive the fetch even if every caller stops waiting for it.
    tokio::spawn(flight.clone());
    flight
  }

  fn complete(
    &self,
    key: &CacheKey,
    request_id: u64,
    generation: u64,
    result: QueryResult<Merge<V>>,
  ) -> QueryResult<V> {
    let mut state = self.inner.lock();
    let Some(slot) = state.slots.get_mut(key) else {
      debug!(key = %key, request_id, "fetch landed on evicted key");
      return result.map(|merge| merge(None));
    };

    let current = slot
      .in_flight
      .as_ref()
      .map(|f| f.request_id == request_id)
      .unwrap_or(false);
    if current {
      slot.in_flight = None;
    }

    if !current || slot.entry.generation != generation {
      warn!(
        key = %key,
        request_id,
        generation,
        current_generation = slot.entry.generation,
        "discarding superseded fetch result"
      );
      return result.map(|merge| match &slot.entry.value {
        Some(value) => value.clone(),
        None => merge(None),
      });
    }

    let entry = &mut slot.entry;
    let outcome = match result {
      Ok(merge) => {
        let merged = merge(entry.value.as_ref());
        entry.value = Some(merged.clone());
        entry.status = EntryStatus::Fresh;
        entry.last_updated = Some(Utc::now());
        entry.error = None;
        debug!(key = %key, request_id, "fetch merged");
        Ok(merged)
      }
      Err(e) => {
        entry.status = EntryStatus::Error;
        entry.error = Some(e.clone());
        warn!(key = %key, request_id, error = %e, "fetch failed");
        Err(e)
      }
    };
    self.notify(state, key);
    outcome
  }

  /// Supersede any in-flight fetch for `key`: its result will be discarded.
  pub fn cancel_fetches(&self, key: &CacheKey) {
    let mut state = self.inner.lock();
    let Some(slot) = state.slots.get_mut(key) else {
      return;
    };
    slot.entry.generation += 1;
    if slot.in_flight.take().is_some() {
      debug!(key = %key, generation = slot.entry.generation, "in-flight fetch superseded");
      if slot.entry.status == EntryStatus::Fetching {
        slot.entry.status = if slot.entry.value.is_some() {
          EntryStatus::Stale
        } else {
          EntryStatus::Idle
        };
      }
      self.notify(state, key);
    }
  }

  /// Copy of the value and timestamp of `key`, for later [`restore`](Self::restore).
  pub fn snapshot(&self, key: &CacheKey) -> Snapshot<V> {
    let state = self.inner.lock();
    match state.slots.get(key) {
      Some(slot) => Snapshot {
        value: slot.entry.value.clone(),
        last_updated: slot.entry.last_updated,
      },
      None => Snapshot {
        value: None,
        last_updated: None,
      },
    }
  }

  /// Put back a snapshot exactly, annotating the entry with `error` if given.
  pub fn restore(&self, key: &CacheKey, snapshot: Snapshot<V>, error: Option<QueryError>) {
    let mut state = self.inner.lock();
    let entry = &mut state.slot_mut(key).entry;
    entry.value = snapshot.value;
    entry.last_updated = snapshot.last_updated;
    entry.status = if error.is_some() {
      EntryStatus::Error
    } else {
      EntryStatus::Fresh
    };
    entry.error = error;
    debug!(key = %key, "cache restored from snapshot");
    self.notify(state, key);
  }

  /// Remove the entry for `key`. Subscribers stay registered and observe an
  /// empty `Idle` entry.
  pub fn evict(&self, key: &CacheKey) {
    let mut state = self.inner.lock();
    if state.slots.remove(key).is_some() {
      debug!(key = %key, "cache evicted");
      self.notify_entry(state, CacheEntry::new(key.clone()));
    }
  }

  /// Register `callback` for changes to `key`. Dropping the returned
  /// [`Subscription`] unregisters it.
  pub fn subscribe<F>(&self, key: &CacheKey, callback: F) -> Subscription<V>
  where
    F: Fn(&CacheEntry<V>) + Send + Sync + 'static,
  {
    let mut state = self.inner.lock();
    state.next_subscriber += 1;
    let id = state.next_subscriber;
    state
      .subscribers
      .entry(key.clone())
      .or_default()
      .insert(id, Arc::new(callback));

    Subscription {
      key: key.clone(),
      id,
      inner: Arc::downgrade(&self.inner),
    }
  }

  fn notify(&self, state: MutexGuard<'_, State<V>>, key: &CacheKey) {
    let Some(entry) = state.slots.get(key).map(|slot| slot.entry.clone()) else {
      return;
    };
    self.notify_entry(state, entry);
  }

  fn notify_entry(&self, state: MutexGuard<'_, State<V>>, entry: CacheEntry<V>) {
    let callbacks: Vec<Callback<V>> = state
      .subscribers
      .get(&entry.key)
      .map(|subs| subs.values().cloned().collect())
      .unwrap_or_default();
    drop(state);

    for callback in callbacks {
      callback(&entry);
    }
  }
}

impl<V> CacheStore<V>
where
  V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
  /// Write the entry for `key` through `kv`, named by the key fingerprint.
  ///
  /// Returns `false` when there is no value to persist.
  pub fn persist(&self, key: &CacheKey, kv: &dyn KvStore) -> Result<bool> {
    let Some(entry) = self.get(key) else {
      return Ok(false);
    };
    let Some(value) = entry.value else {
      return Ok(false);
    };

    let persisted = PersistedEntry {
      key: key.clone(),
      value,
      last_updated: entry.last_updated,
      stale: entry.status != EntryStatus::Fresh,
    };
    let bytes =
      serde_json::to_vec(&persisted).map_err(|e| eyre!("Failed to serialize entry: {}", e))?;
    kv.save(&key.fingerprint(), &bytes)?;
    Ok(true)
  }

  /// Load a previously persisted entry for `key`, keeping its original
  /// timestamp so the usual staleness policy applies. An entry persisted
  /// while invalidated or errored is restored `Stale`.
  pub fn hydrate(&self, key: &CacheKey, kv: &dyn KvStore) -> Result<bool> {
    let Some(bytes) = kv.load(&key.fingerprint())? else {
      return Ok(false);
    };
    let persisted: PersistedEntry<V> =
      serde_json::from_slice(&bytes).map_err(|e| eyre!("Failed to deserialize entry: {}", e))?;
    if &persisted.key != key {
      return Err(eyre!("Persisted entry belongs to {}, not {}", persisted.key, key));
    }

    let mut state = self.inner.lock();
    let entry = &mut state.slot_mut(key).entry;
    entry.value = Some(persisted.value);
    entry.last_updated = persisted.last_updated;
    entry.status = if persisted.stale {
      EntryStatus::Stale
    } else {
      EntryStatus::Fresh
    };
    entry.error = None;
    debug!(key = %key, stale = persisted.stale, "cache hydrated");
    self.notify(state, key);
    Ok(true)
  }
}

/// Registration returned by [`CacheStore::subscribe`].
pub struct Subscription<V> {
  key: CacheKey,
  id: u64,
  inner: Weak<Inner<V>>,
}

impl<V> Drop for Subscription<V> {
  fn drop(&mut self) {
    let Some(inner) = self.inner.upgrade() else {
      return;
    };
    let mut state = inner.lock();
    if let Some(subs) = state.subscribers.get_mut(&self.key) {
      subs.remove(&self.id);
      if subs.is_empty() {
        state.subscribers.remove(&self.key);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::storage::MemoryStore;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;
  use tokio::sync::oneshot;

  fn key() -> CacheKey {
    CacheKey::of("comments")
  }

  #[test]
  fn test_get_missing_is_none() {
    let store: CacheStore<i32> = CacheStore::default();
    assert!(store.get(&key()).is_none());
  }

  #[test]
  fn test_set_then_get() {
    let store = CacheStore::default();
    store.set(&key(), vec![1, 2], EntryStatus::Fresh);

    let entry = store.get(&key()).unwrap();
    assert_eq!(entry.value, Some(vec![1, 2]));
    assert_eq!(entry.status, EntryStatus::Fresh);
    assert!(entry.last_updated.is_some());
    assert!(entry.error.is_none());
  }

  #[test]
  fn test_subscribers_notified_in_order() {
    let store = CacheStore::default();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let first = {
      let seen = seen.clone();
      store.subscribe(&key(), move |e: &CacheEntry<i32>| {
        seen.lock().unwrap().push(("first", e.value));
      })
    };
    let _second = {
      let seen = seen.clone();
      store.subscribe(&key(), move |e: &CacheEntry<i32>| {
        seen.lock().unwrap().push(("second", e.value));
      })
    };

    store.set(&key(), 7, EntryStatus::Fresh);
    assert_eq!(
      *seen.lock().unwrap(),
      vec![("first", Some(7)), ("second", Some(7))]
    );

    // Other keys don't notify
    store.set(&CacheKey::of("other"), 1, EntryStatus::Fresh);
    assert_eq!(seen.lock().unwrap().len(), 2);

    drop(first);
    store.set(&key(), 8, EntryStatus::Fresh);
    assert_eq!(seen.lock().unwrap().last(), Some(&("second", Some(8))));
    assert_eq!(seen.lock().unwrap().len(), 3);
  }

  #[test]
  fn test_subscriber_can_read_store() {
    let store: CacheStore<i32> = CacheStore::default();
    let observed = Arc::new(Mutex::new(None));

    let reader = store.clone();
    let sink = observed.clone();
    let _sub = store.subscribe(&key(), move |_| {
      *sink.lock().unwrap() = reader.value(&key());
    });

    store.set(&key(), 3, EntryStatus::Fresh);
    assert_eq!(*observed.lock().unwrap(), Some(3));
  }

  #[test]
  fn test_invalidate_keeps_value() {
    let store = CacheStore::default();
    store.set(&key(), "a".to_string(), EntryStatus::Fresh);
    store.invalidate(&key());

    let entry = store.get(&key()).unwrap();
    assert_eq!(entry.status, EntryStatus::Stale);
    assert_eq!(entry.value.as_deref(), Some("a"));

    // Absent keys stay absent
    store.invalidate(&CacheKey::of("missing"));
    assert!(store.get(&CacheKey::of("missing")).is_none());
  }

  #[test]
  fn test_invalidate_prefix() {
    let store = CacheStore::default();
    let done = CacheKey::of("todos").with("done");
    let open = CacheKey::of("todos").with("open");
    let other = CacheKey::of("comments");
    for k in [&done, &open, &other] {
      store.set(k, 1, EntryStatus::Fresh);
    }

    store.invalidate_prefix(&CacheKey::of("todos"));

    assert_eq!(store.get(&done).unwrap().status, EntryStatus::Stale);
    assert_eq!(store.get(&open).unwrap().status, EntryStatus::Stale);
    assert_eq!(store.get(&other).unwrap().status, EntryStatus::Fresh);
  }

  #[test]
  fn test_stale_time_override() {
    let store = CacheStore::new(StaleTime::zero());
    store.set(&key(), 1, EntryStatus::Fresh);
    assert!(store.is_stale(&key(), store.stale_time_for(&key())));

    store.set_stale_time(&key(), StaleTime::Never);
    assert_eq!(store.stale_time_for(&key()), StaleTime::Never);
    assert!(!store.is_stale(&key(), store.stale_time_for(&key())));
    assert_eq!(
      store.stale_time_for(&CacheKey::of("other")),
      StaleTime::zero()
    );
  }

  #[tokio::test]
  async fn test_fetch_fresh_hit_skips_transport() {
    let store = CacheStore::new(StaleTime::Never);
    store.set(&key(), 1, EntryStatus::Fresh);

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let value = store
      .fetch(&key(), move || {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok(2) }
      })
      .await
      .unwrap();

    assert_eq!(value, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_fetch_miss_stores_value() {
    let k = key();
    let store = CacheStore::default();
    let value = store.fetch(&k, || async { Ok(5) }).await.unwrap();

    assert_eq!(value, 5);
    let entry = store.get(&k).unwrap();
    assert_eq!(entry.value, Some(5));
    assert_eq!(entry.status, EntryStatus::Fresh);
    assert!(!store.is_fetching(&k));
  }

  #[tokio::test]
  async fn test_single_flight_dedup() {
    let k = key();
    let store: CacheStore<Vec<u32>> = CacheStore::default();
    let calls = Arc::new(AtomicUsize::new(0));

    let fetcher = |calls: Arc<AtomicUsize>| {
      move || {
        calls.fetch_add(1, Ordering::SeqCst);
        async {
          tokio::time::sleep(Duration::from_millis(20)).await;
          Ok(vec![1, 2, 3])
        }
      }
    };

    let (a, b) = tokio::join!(
      store.fetch(&k, fetcher(calls.clone())),
      store.fetch(&k, fetcher(calls.clone())),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(a.unwrap(), vec![1, 2, 3]);
    assert_eq!(b.unwrap(), vec![1, 2, 3]);
  }

  #[tokio::test]
  async fn test_fetch_error_keeps_last_value() {
    let store = CacheStore::default();
    store.set(&key(), 1, EntryStatus::Fresh);
    store.invalidate(&key());

    let result = store
      .fetch(&key(), || async { Err(QueryError::Network("down".into())) })
      .await;
    assert_eq!(result, Err(QueryError::Network("down".into())));

    let entry = store.get(&key()).unwrap();
    assert_eq!(entry.status, EntryStatus::Error);
    assert_eq!(entry.value, Some(1));
    assert_eq!(entry.error, Some(QueryError::Network("down".into())));
  }

  #[tokio::test]
  async fn test_superseded_fetch_is_discarded() {
    let k = key();
    let store = CacheStore::default();
    let (release, gate) = oneshot::channel::<()>();

    let mut pending = Box::pin(store.fetch(&k, move || async move {
      let _ = gate.await;
      Ok(99)
    }));
    assert!(futures::poll!(&mut pending).is_pending());
    assert!(store.is_fetching(&k));

    store.cancel_fetches(&k);
    store.set(&k, 1, EntryStatus::Fresh);
    release.send(()).unwrap();

    // Caller sees what the cache holds, the late result never lands
    assert_eq!(pending.await.unwrap(), 1);
    let entry = store.get(&k).unwrap();
    assert_eq!(entry.value, Some(1));
    assert_eq!(entry.generation, 1);
  }

  #[tokio::test]
  async fn test_invalidate_mid_fetch_still_merges() {
    let k = key();
    let store = CacheStore::default();
    store.set(&k, 1, EntryStatus::Fresh);
    let (release, gate) = oneshot::channel::<()>();

    let mut pending = Box::pin(store.fetch(&k, move || async move {
      let _ = gate.await;
      Ok(2)
    }));
    assert!(futures::poll!(&mut pending).is_pending());

    store.invalidate(&k);
    assert!(store.is_fetching(&k));
    assert_eq!(store.get(&k).unwrap().value, Some(1));

    release.send(()).unwrap();
    assert_eq!(pending.await.unwrap(), 2);
    assert_eq!(store.get(&k).unwrap().status, EntryStatus::Fresh);
  }

  #[tokio::test]
  async fn test_fetch_completes_without_waiters() {
    let k = key();
    let store = CacheStore::default();
    let (release, gate) = oneshot::channel::<()>();

    let mut pending = Box::pin(store.fetch(&k, move || async move {
      let _ = gate.await;
      Ok(4)
    }));
    assert!(futures::poll!(&mut pending).is_pending());
    drop(pending);

    release.send(()).unwrap();
    for _ in 0..50 {
      if !store.is_fetching(&k) {
        break;
      }
      tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert_eq!(store.get(&k).unwrap().value, Some(4));
  }

  #[test]
  fn test_snapshot_restore_is_exact() {
    let store = CacheStore::default();
    store.set(&key(), 1, EntryStatus::Fresh);
    let before = store.get(&key()).unwrap();

    let snapshot = store.snapshot(&key());
    store.set(&key(), 2, EntryStatus::Fresh);
    store.restore(&key(), snapshot, Some(QueryError::AuthExpired));

    let after = store.get(&key()).unwrap();
    assert_eq!(after.value, before.value);
    assert_eq!(after.last_updated, before.last_updated);
    assert_eq!(after.status, EntryStatus::Error);
    assert_eq!(after.error, Some(QueryError::AuthExpired));
  }

  #[test]
  fn test_evict_notifies_empty_entry() {
    let store = CacheStore::default();
    store.set(&key(), 1, EntryStatus::Fresh);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let _sub = {
      let seen = seen.clone();
      store.subscribe(&key(), move |e: &CacheEntry<i32>| {
        seen.lock().unwrap().push(e.status);
      })
    };

    store.evict(&key());
    assert!(store.get(&key()).is_none());
    assert_eq!(*seen.lock().unwrap(), vec![EntryStatus::Idle]);
  }

  #[test]
  fn test_persist_and_hydrate() {
    let kv = MemoryStore::new();
    let store = CacheStore::new(StaleTime::Never);
    let product = CacheKey::of("product").with(7);
    store.set(&product, "lamp".to_string(), EntryStatus::Fresh);
    assert!(store.persist(&product, &kv).unwrap());

    let restored: CacheStore<String> = CacheStore::new(StaleTime::Never);
    assert!(restored.hydrate(&product, &kv).unwrap());
    let entry = restored.get(&product).unwrap();
    assert_eq!(entry.value.as_deref(), Some("lamp"));
    assert_eq!(entry.last_updated, store.get(&product).unwrap().last_updated);

    assert!(!restored.hydrate(&CacheKey::of("missing"), &kv).unwrap());
  }

  #[test]
  fn test_invalidated_entry_hydrates_stale() {
    let kv = MemoryStore::new();
    let store = CacheStore::new(StaleTime::Never);
    store.set(&key(), 1, EntryStatus::Fresh);
    store.invalidate(&key());
    assert!(store.persist(&key(), &kv).unwrap());

    let restored: CacheStore<i32> = CacheStore::new(StaleTime::Never);
    assert!(restored.hydrate(&key(), &kv).unwrap());
    let entry = restored.get(&key()).unwrap();
    assert_eq!(entry.value, Some(1));
    assert_eq!(entry.status, EntryStatus::Stale);
    assert!(restored.is_stale(&key(), StaleTime::Never));
  }

  #[test]
  fn test_errored_entry_hydrates_stale() {
    let kv = MemoryStore::new();
    let store = CacheStore::new(StaleTime::Never);
    store.set(&key(), 1, EntryStatus::Fresh);
    let snapshot = store.snapshot(&key());
    store.restore(&key(), snapshot, Some(QueryError::Network("down".into())));
    store.persist(&key(), &kv).unwrap();

    let restored: CacheStore<i32> = CacheStore::new(StaleTime::Never);
    restored.hydrate(&key(), &kv).unwrap();
    assert_eq!(restored.get(&key()).unwrap().status, EntryStatus::Stale);
  }

  #[tokio::test]
  async fn test_fetcher_may_read_the_store() {
    let k = key();
    let store = CacheStore::default();
    store.set(&k, 1, EntryStatus::Fresh);
    store.invalidate(&k);

    let reader = store.clone();
    let read_key = k.clone();
    let value = store
      .fetch(&k, move || {
        let seen = reader.value(&read_key).unwrap_or(0);
        async move { Ok(seen + 1) }
      })
      .await
      .unwrap();

    assert_eq!(value, 2);
    assert_eq!(store.value(&k), Some(2));
  }
}
