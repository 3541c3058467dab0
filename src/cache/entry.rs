//! Cache entries and freshness policy.

use chrono::{DateTime, Duration, Utc};

use super::key::CacheKey;
use crate::error::QueryError;

/// Lifecycle status of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
  /// Created but never fetched
  Idle,
  /// A fetch for this key is in flight
  Fetching,
  /// Value confirmed by the last write or fetch
  Fresh,
  /// Value kept but must be reconciled with the server
  Stale,
  /// Last fetch failed; the previous value (if any) is kept
  Error,
}

/// One cached value with its metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
  pub key: CacheKey,
  pub value: Option<T>,
  pub status: EntryStatus,
  /// When `value` was last written (`None` until the first write)
  pub last_updated: Option<DateTime<Utc>>,
  pub error: Option<QueryError>,
  /// Bumped whenever in-flight fetches for this key are superseded
  pub generation: u64,
}

impl<T> CacheEntry<T> {
  pub(crate) fn new(key: CacheKey) -> Self {
    Self {
      key,
      value: None,
      status: EntryStatus::Idle,
      last_updated: None,
      error: None,
      generation: 0,
    }
  }

  /// Whether the entry should be refetched under the given stale time.
  ///
  /// Valueless, invalidated and errored entries are always stale.
  pub fn is_stale(&self, stale_time: StaleTime, now: DateTime<Utc>) -> bool {
    if self.value.is_none() || matches!(self.status, EntryStatus::Stale | EntryStatus::Error) {
      return true;
    }
    match self.last_updated {
      Some(updated) => stale_time.is_exceeded(now - updated),
      None => true,
    }
  }
}

/// How long a value is trusted without refetching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleTime {
  /// Stale once older than the duration; zero means always stale
  After(Duration),
  /// Never stale by age, only by explicit invalidation
  Never,
}

impl StaleTime {
  /// Always stale: every read refetches.
  pub fn zero() -> Self {
    StaleTime::After(Duration::zero())
  }

  pub fn seconds(secs: i64) -> Self {
    StaleTime::After(Duration::seconds(secs))
  }

  pub fn millis(ms: i64) -> Self {
    StaleTime::After(Duration::milliseconds(ms))
  }

  fn is_exceeded(&self, age: Duration) -> bool {
    match self {
      StaleTime::After(limit) if *limit <= Duration::zero() => true,
      StaleTime::After(limit) => age > *limit,
      StaleTime::Never => false,
    }
  }
}

impl Default for StaleTime {
  fn default() -> Self {
    StaleTime::zero()
  }
}

/// Pre-mutation copy of an entry's value, used for exact rollback.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot<T> {
  pub value: Option<T>,
  pub last_updated: Option<DateTime<Utc>>,
}
