//! Optimistic writes with exact rollback.
//!
//! A mutation runs in three phases against one cache entry:
//!
//! 1. [`MutationExecutor::begin`] supersedes in-flight fetches for the key,
//!    snapshots the entry and writes the optimistic value.
//! 2. The caller performs the real write.
//! 3. [`MutationExecutor::settle`] restores the snapshot if the write failed
//!    and always invalidates the key so the next read reconciles with the
//!    server.
//!
//! Mutations on the same key are serialized: a second `begin` waits until
//! the first mutation has settled, so its snapshot never contains another
//! mutation's unconfirmed value.

use chrono::Utc;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as TurnLock, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::cache::{CacheKey, CacheStore, EntryStatus, Snapshot};
use crate::error::QueryResult;

/// Set on every optimistic id; ids issued by the server never carry it.
pub const TEMP_ID_FLAG: u64 = 1 << 63;

/// Whether `id` was handed out by [`MutationExecutor::temp_id`].
pub fn is_temp_id(id: u64) -> bool {
  id & TEMP_ID_FLAG != 0
}

type Turns = Arc<Mutex<HashMap<CacheKey, Arc<TurnLock<()>>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MutationId(u64);

impl fmt::Display for MutationId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "m{}", self.0)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
  Pending,
  Committed,
  RolledBack,
}

#[derive(Debug, Clone)]
pub struct MutationRecord<V> {
  pub id: MutationId,
  pub target_key: CacheKey,
  pub snapshot: Snapshot<V>,
  pub status: MutationStatus,
}

/// A mutation whose optimistic value is applied but not yet settled.
///
/// Dropping it without calling [`MutationExecutor::settle`] rolls back as if
/// the write had failed, so a cancelled write never leaves its optimistic
/// value behind.
pub struct PendingMutation<V: Clone + Send + Sync + 'static> {
  key: CacheKey,
  record: Option<MutationRecord<V>>,
  store: CacheStore<V>,
  turn: Option<OwnedMutexGuard<()>>,
  turns: Turns,
}

impl<V: Clone + Send + Sync + 'static> PendingMutation<V> {
  pub fn record(&self) -> Option<&MutationRecord<V>> {
    self.record.as_ref()
  }
}

impl<V: Clone + Send + Sync + 'static> Drop for PendingMutation<V> {
  fn drop(&mut self) {
    if let Some(record) = self.record.take() {
      warn!(mutation = %record.id, key = %record.target_key, "mutation dropped before settling, rolling back");
      self.store.restore(&record.target_key, record.snapshot, None);
      self.store.invalidate(&record.target_key);
    }

    drop(self.turn.take());
    let mut turns = self.turns.lock().unwrap_or_else(PoisonError::into_inner);
    // Only the map still holds the lock: nobody is waiting for this key
    if turns
      .get(&self.key)
      .is_some_and(|turn| Arc::strong_count(turn) == 1)
    {
      turns.remove(&self.key);
    }
  }
}

/// Runs optimistic mutations against one [`CacheStore`].
pub struct MutationExecutor<V> {
  store: CacheStore<V>,
  turns: Turns,
  next_id: Arc<AtomicU64>,
  next_temp_id: Arc<AtomicU64>,
}

impl<V> Clone for MutationExecutor<V> {
  fn clone(&self) -> Self {
    Self {
      store: self.store.clone(),
      turns: Arc::clone(&self.turns),
      next_id: Arc::clone(&self.next_id),
      next_temp_id: Arc::clone(&self.next_temp_id),
    }
  }
}

impl<V: Clone + Send + Sync + 'static> MutationExecutor<V> {
  pub fn new(store: CacheStore<V>) -> Self {
    Self {
      store,
      turns: Arc::new(Mutex::new(HashMap::new())),
      next_id: Arc::new(AtomicU64::new(0)),
      // Seeded from the clock so separate runs don't reuse ids
      next_temp_id: Arc::new(AtomicU64::new(
        Utc::now().timestamp_millis().max(0) as u64 & !TEMP_ID_FLAG,
      )),
    }
  }

  pub fn store(&self) -> &CacheStore<V> {
    &self.store
  }

  /// Locally unique id for an optimistic item, replaced by the server id on
  /// the next refetch. Always has [`TEMP_ID_FLAG`] set.
  pub fn temp_id(&self) -> u64 {
    let n = self.next_temp_id.fetch_add(1, Ordering::Relaxed) + 1;
    TEMP_ID_FLAG | (n & !TEMP_ID_FLAG)
  }

  fn turn(&self, key: &CacheKey) -> Arc<TurnLock<()>> {
    let mut turns = self.turns.lock().unwrap_or_else(PoisonError::into_inner);
    Arc::clone(turns.entry(key.clone()).or_default())
  }

  /// Wait for this key's turn, then apply `patch` optimistically.
  ///
  /// The patched value is visible to readers before this returns.
  pub async fn begin<P>(&self, key: &CacheKey, patch: P) -> PendingMutation<V>
  where
    P: FnOnce(Option<&V>) -> V,
  {
    let turn = self.turn(key).lock_owned().await;
    self.apply(key, patch, turn)
  }

  fn apply<P>(&self, key: &CacheKey, patch: P, turn: OwnedMutexGuard<()>) -> PendingMutation<V>
  where
    P: FnOnce(Option<&V>) -> V,
  {
    // A fetch landing after this point would overwrite the optimistic value
    self.store.cancel_fetches(key);

    let snapshot = self.store.snapshot(key);
    let patched = patch(snapshot.value.as_ref());
    self.store.set(key, patched, EntryStatus::Fresh);

    let id = MutationId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
    debug!(mutation = %id, key = %key, "optimistic value applied");

    PendingMutation {
      key: key.clone(),
      record: Some(MutationRecord {
        id,
        target_key: key.clone(),
        snapshot,
        status: MutationStatus::Pending,
      }),
      store: self.store.clone(),
      turn: Some(turn),
      turns: Arc::clone(&self.turns),
    }
  }

  /// Finish a mutation: roll back on failure, then invalidate the key.
  ///
  /// Releases the key's turn only after the entry is settled.
  pub fn settle<T>(&self, mut pending: PendingMutation<V>, result: &QueryResult<T>) -> MutationRecord<V> {
    let Some(mut record) = pending.record.take() else {
      unreachable!("pending mutation settled twice");
    };

    match result {
      Ok(_) => {
        record.status = MutationStatus::Committed;
        debug!(mutation = %record.id, key = %record.target_key, "mutation committed");
      }
      Err(e) => {
        self
          .store
          .restore(&record.target_key, record.snapshot.clone(), Some(e.clone()));
        record.status = MutationStatus::RolledBack;
        warn!(mutation = %record.id, key = %record.target_key, error = %e, "mutation rolled back");
      }
    }

    self.store.invalidate(&record.target_key);
    drop(pending);
    record
  }

  /// Run all three phases. `perform` is only called after the optimistic
  /// value is in the cache. Errors are returned after rollback.
  pub async fn mutate<P, F, Fut, T>(&self, key: &CacheKey, patch: P, perform: F) -> QueryResult<T>
  where
    P: FnOnce(Option<&V>) -> V,
    F: FnOnce() -> Fut,
    Fut: Future<Output = QueryResult<T>>,
  {
    let pending = self.begin(key, patch).await;
    let result = perform().await;
    self.settle(pending, &result);
    result
  }
}
