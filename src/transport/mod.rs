//! Network boundary the cache depends on.
//!
//! The cache, paginator, mutation executor and scheduler only see these
//! traits; [`http::HttpTransport`] is the concrete REST implementation used
//! by the command line client.

pub mod http;

#[cfg(test)]
pub(crate) mod fake;

use async_trait::async_trait;

use crate::error::QueryResult;
use crate::paginated::Page;
use crate::session::{AuthSession, Credentials, LoginResponse};

/// Fetches one page of a paginated collection.
///
/// `cursor` is `None` for the first page.
#[async_trait]
pub trait PageFetcher<Item: Send, C: Send>: Send + Sync {
  async fn fetch_page(&self, cursor: Option<C>) -> QueryResult<Page<Item, C>>;
}

/// Fetches a single resource by id.
#[async_trait]
pub trait ResourceFetcher<Id: Send, T: Send>: Send + Sync {
  async fn fetch_one(&self, id: Id) -> QueryResult<T>;
}

/// Submits a write and returns the entity the server stored.
#[async_trait]
pub trait MutationTransport<P: Send, E: Send>: Send + Sync {
  async fn submit(&self, payload: P) -> QueryResult<E>;
}

/// Authentication endpoints.
#[async_trait]
pub trait SessionTransport: Send + Sync {
  async fn login(&self, credentials: &Credentials) -> QueryResult<LoginResponse>;

  /// Exchange a refresh token for new tokens.
  /// `Ok(None)` means the refresh token was rejected.
  async fn refresh(&self, refresh_token: &str) -> QueryResult<Option<AuthSession>>;

  async fn logout(&self, refresh_token: &str) -> QueryResult<()>;
}
