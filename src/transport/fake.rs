//! Scriptable in-memory transports for tests.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Semaphore;

use super::{MutationTransport, PageFetcher, SessionTransport};
use crate::error::{QueryError, QueryResult};
use crate::paginated::Page;
use crate::session::{AuthSession, Credentials, LoginResponse, User};

pub(crate) fn tokens_expiring_in(secs: i64) -> AuthSession {
  AuthSession {
    access_token: "access-token".into(),
    refresh_token: "refresh-token".into(),
    expires_at: Utc::now() + ChronoDuration::seconds(secs),
  }
}

/// Blocks callers until released. Once released it stays open.
struct Gate(Option<Semaphore>);

impl Gate {
  async fn pass(&self) {
    if let Some(semaphore) = &self.0 {
      // Permit goes back on drop so every later caller passes too
      let _permit = semaphore.acquire().await;
    }
  }

  fn release(&self) {
    if let Some(semaphore) = &self.0 {
      semaphore.add_permits(1);
    }
  }
}

/// Serves scripted pages by cursor; unknown cursors fail with 404.
pub(crate) struct FakeFeed<Item, C> {
  pages: Mutex<Vec<(Option<C>, Page<Item, C>)>>,
  requested: Mutex<Vec<Option<C>>>,
  gate: Gate,
}

impl<Item: Clone, C: Clone + PartialEq> FakeFeed<Item, C> {
  pub fn new(pages: Vec<(Option<C>, Page<Item, C>)>) -> Self {
    Self {
      pages: Mutex::new(pages),
      requested: Mutex::new(Vec::new()),
      gate: Gate(None),
    }
  }

  /// Hold every fetch until [`release`](Self::release) is called.
  pub fn gated(mut self) -> Self {
    self.gate = Gate(Some(Semaphore::new(0)));
    self
  }

  pub fn release(&self) {
    self.gate.release();
  }

  /// Replace (or add) the page served for `cursor`.
  pub fn script(&self, cursor: Option<C>, page: Page<Item, C>) {
    let mut pages = self.pages.lock().unwrap();
    pages.retain(|(c, _)| *c != cursor);
    pages.push((cursor, page));
  }

  pub fn requested(&self) -> Vec<Option<C>> {
    self.requested.lock().unwrap().clone()
  }

  pub fn calls(&self) -> usize {
    self.requested.lock().unwrap().len()
  }
}

#[async_trait]
impl<Item, C> PageFetcher<Item, C> for FakeFeed<Item, C>
where
  Item: Clone + Send + Sync,
  C: Clone + PartialEq + Send + Sync,
{
  async fn fetch_page(&self, cursor: Option<C>) -> QueryResult<Page<Item, C>> {
    self.requested.lock().unwrap().push(cursor.clone());
    self.gate.pass().await;

    let pages = self.pages.lock().unwrap();
    pages
      .iter()
      .find(|(c, _)| *c == cursor)
      .map(|(_, page)| page.clone())
      .ok_or_else(|| QueryError::server(404, "no such page"))
  }
}

/// Accepts or rejects writes according to a script; echoes the payload back.
pub(crate) struct FakeSubmit<P> {
  results: Mutex<VecDeque<QueryResult<()>>>,
  submitted: Mutex<Vec<P>>,
  gate: Gate,
}

impl<P: Clone> FakeSubmit<P> {
  /// Results are consumed in order; once exhausted every write succeeds.
  pub fn new(results: Vec<QueryResult<()>>) -> Self {
    Self {
      results: Mutex::new(results.into()),
      submitted: Mutex::new(Vec::new()),
      gate: Gate(None),
    }
  }

  pub fn gated(mut self) -> Self {
    self.gate = Gate(Some(Semaphore::new(0)));
    self
  }

  pub fn release(&self) {
    self.gate.release();
  }

  pub fn submitted(&self) -> Vec<P> {
    self.submitted.lock().unwrap().clone()
  }
}

#[async_trait]
impl<P: Clone + Send + Sync> MutationTransport<P, P> for FakeSubmit<P> {
  async fn submit(&self, payload: P) -> QueryResult<P> {
    self.submitted.lock().unwrap().push(payload.clone());
    self.gate.pass().await;

    let scripted = self.results.lock().unwrap().pop_front();
    scripted.unwrap_or(Ok(())).map(|_| payload)
  }
}

/// Session endpoints with scripted refresh results.
pub(crate) struct FakeAuth {
  refresh_results: Mutex<VecDeque<QueryResult<Option<AuthSession>>>>,
  refreshed_ttl_secs: i64,
  refresh_delay: Duration,
  fail_logout: bool,
  refresh_calls: AtomicUsize,
  logout_calls: AtomicUsize,
}

impl FakeAuth {
  pub fn new() -> Self {
    Self {
      refresh_results: Mutex::new(VecDeque::new()),
      refreshed_ttl_secs: 3600,
      refresh_delay: Duration::ZERO,
      fail_logout: false,
      refresh_calls: AtomicUsize::new(0),
      logout_calls: AtomicUsize::new(0),
    }
  }

  /// Results consumed in order before falling back to issuing new tokens.
  pub fn refresh_results(self, results: Vec<QueryResult<Option<AuthSession>>>) -> Self {
    *self.refresh_results.lock().unwrap() = results.into();
    self
  }

  /// Lifetime of tokens issued by the fallback refresh.
  pub fn refresh_expiring_in(mut self, secs: i64) -> Self {
    self.refreshed_ttl_secs = secs;
    self
  }

  pub fn refresh_delay(mut self, delay: Duration) -> Self {
    self.refresh_delay = delay;
    self
  }

  pub fn failing_logout(mut self) -> Self {
    self.fail_logout = true;
    self
  }

  pub fn refresh_calls(&self) -> usize {
    self.refresh_calls.load(Ordering::SeqCst)
  }

  pub fn logout_calls(&self) -> usize {
    self.logout_calls.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl SessionTransport for FakeAuth {
  async fn login(&self, credentials: &Credentials) -> QueryResult<LoginResponse> {
    Ok(LoginResponse {
      user: User {
        id: 1,
        username: credentials.username.clone(),
        email: None,
      },
      tokens: tokens_expiring_in(3600),
    })
  }

  async fn refresh(&self, _refresh_token: &str) -> QueryResult<Option<AuthSession>> {
    let call = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
    if !self.refresh_delay.is_zero() {
      tokio::time::sleep(self.refresh_delay).await;
    }

    let scripted = self.refresh_results.lock().unwrap().pop_front();
    scripted.unwrap_or_else(|| {
      let mut tokens = tokens_expiring_in(self.refreshed_ttl_secs);
      tokens.refresh_token = format!("refresh-token-{}", call);
      Ok(Some(tokens))
    })
  }

  async fn logout(&self, _refresh_token: &str) -> QueryResult<()> {
    self.logout_calls.fetch_add(1, Ordering::SeqCst);
    if self.fail_logout {
      return Err(QueryError::Network("connection reset".into()));
    }
    Ok(())
  }
}
