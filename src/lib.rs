//! Reactive query cache for REST backends.
//!
//! - [`cache`]: keyed store with staleness, single-flight fetches and
//!   subscriptions
//! - [`paginated`]: cursor pagination accumulated under one key
//! - [`mutation`]: optimistic writes with exact rollback
//! - [`session`]: auth session state and the background token refresher
//! - [`transport`]: the network seam plus the reqwest implementation

pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod mutation;
pub mod paginated;
pub mod session;
pub mod storage;
pub mod transport;

pub use error::{QueryError, QueryResult};
