//! Keyed query cache.
//!
//! This module provides the transport-agnostic cache that:
//! - Stores values under structural [`CacheKey`]s with per-key status
//! - Tracks staleness by age or explicit invalidation
//! - Deduplicates concurrent fetches of the same key (single-flight)
//! - Discards fetch results superseded by a mutation (per-key generation)
//! - Notifies subscribers synchronously, in subscription order

mod entry;
mod key;
mod store;

pub use entry::{CacheEntry, EntryStatus, Snapshot, StaleTime};
pub use key::{CacheKey, KeyPart};
pub use store::{CacheStore, Subscription};

pub(crate) use store::{Merge, PendingFetch};
