//! Authenticated session state and its persistence.

mod scheduler;

pub use scheduler::{RefreshOutcome, RevalidationScheduler, SchedulerConfig, SchedulerState};

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::storage::KvStore;
use crate::transport::SessionTransport;

/// Name the session is persisted under.
const SESSION_KEY: &str = "session";

/// Grace window before `expires_at` in which a token already counts as expired.
pub const DEFAULT_EXPIRY_SKEW_SECS: i64 = 60;

/// Access and refresh tokens with their expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
  pub access_token: String,
  pub refresh_token: String,
  pub expires_at: DateTime<Utc>,
}

impl AuthSession {
  /// `now > expires_at - skew`
  pub fn is_expired(&self, now: DateTime<Utc>, skew: Duration) -> bool {
    now > self.expires_at - skew
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
  pub id: u64,
  pub username: String,
  #[serde(default)]
  pub email: Option<String>,
}

#[derive(Clone, Serialize)]
pub struct Credentials {
  pub username: String,
  pub password: String,
}

impl fmt::Debug for Credentials {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Credentials")
      .field("username", &self.username)
      .field("password", &"<redacted>")
      .finish()
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginResponse {
  pub user: User,
  pub tokens: AuthSession,
}

/// Who is logged in, if anyone. Authenticated iff `tokens` is present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
  pub user: Option<User>,
  pub tokens: Option<AuthSession>,
}

impl SessionState {
  pub fn is_authenticated(&self) -> bool {
    self.tokens.is_some()
  }
}

/// Shared session state, observable through a watch channel and persisted
/// through a [`KvStore`] on every change.
#[derive(Clone)]
pub struct SessionStore {
  tx: Arc<watch::Sender<SessionState>>,
  kv: Arc<dyn KvStore>,
}

impl SessionStore {
  /// Start logged out.
  pub fn new(kv: Arc<dyn KvStore>) -> Self {
    let (tx, _rx) = watch::channel(SessionState::default());
    Self {
      tx: Arc::new(tx),
      kv,
    }
  }

  /// Start from the persisted session, if there is one.
  pub fn restore(kv: Arc<dyn KvStore>) -> Result<Self> {
    let state = match kv.load(SESSION_KEY)? {
      Some(bytes) => serde_json::from_slice(&bytes)
        .map_err(|e| eyre!("Failed to parse persisted session: {}", e))?,
      None => SessionState::default(),
    };

    let store = Self::new(kv);
    store.tx.send_replace(state);
    Ok(store)
  }

  pub fn current(&self) -> SessionState {
    self.tx.borrow().clone()
  }

  pub fn tokens(&self) -> Option<AuthSession> {
    self.tx.borrow().tokens.clone()
  }

  pub fn access_token(&self) -> Option<String> {
    self.tx.borrow().tokens.as_ref().map(|t| t.access_token.clone())
  }

  pub fn is_authenticated(&self) -> bool {
    self.tx.borrow().is_authenticated()
  }

  /// Observe session changes.
  pub fn subscribe(&self) -> watch::Receiver<SessionState> {
    self.tx.subscribe()
  }

  /// Replace the whole session (login).
  pub fn replace(&self, state: SessionState) -> Result<()> {
    self.tx.send_replace(state.clone());
    self.save(&state)
  }

  /// Swap in refreshed tokens, but only if the session still holds the
  /// refresh token they were issued for. Returns whether the swap happened.
  pub fn swap_tokens(&self, expected_refresh_token: &str, tokens: AuthSession) -> Result<bool> {
    let swapped = self.tx.send_if_modified(|state| match &state.tokens {
      Some(current) if current.refresh_token == expected_refresh_token => {
        state.tokens = Some(tokens);
        true
      }
      _ => false,
    });

    if swapped {
      self.save(&self.current())?;
    }
    Ok(swapped)
  }

  /// Drop user and tokens, in memory and on disk.
  pub fn clear(&self) -> Result<()> {
    self.tx.send_replace(SessionState::default());
    self.kv.remove(SESSION_KEY)
  }

  fn save(&self, state: &SessionState) -> Result<()> {
    let bytes =
      serde_json::to_vec(state).map_err(|e| eyre!("Failed to serialize session: {}", e))?;
    self.kv.save(SESSION_KEY, &bytes)
  }
}

/// Login and logout against a [`SessionTransport`].
pub struct Auth {
  session: SessionStore,
  transport: Arc<dyn SessionTransport>,
}

impl Auth {
  pub fn new(session: SessionStore, transport: Arc<dyn SessionTransport>) -> Self {
    Self { session, transport }
  }

  pub async fn login(&self, credentials: &Credentials) -> Result<User> {
    let response = self.transport.login(credentials).await?;
    info!(user = %response.user.username, expires_at = %response.tokens.expires_at, "logged in");

    self.session.replace(SessionState {
      user: Some(response.user.clone()),
      tokens: Some(response.tokens),
    })?;
    Ok(response.user)
  }

  /// Revoke the refresh token on the server (best effort) and clear the
  /// local session.
  pub async fn logout(&self) -> Result<()> {
    if let Some(tokens) = self.session.tokens() {
      if let Err(e) = self.transport.logout(&tokens.refresh_token).await {
        warn!(error = %e, "server logout failed, clearing local session anyway");
      }
    }
    self.session.clear()?;
    info!("logged out");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::storage::MemoryStore;
  use crate::transport::fake::{tokens_expiring_in, FakeAuth};

  fn kv() -> Arc<dyn KvStore> {
    Arc::new(MemoryStore::new())
  }

  #[test]
  fn test_is_expired_with_skew() {
    let now = Utc::now();
    let skew = Duration::seconds(DEFAULT_EXPIRY_SKEW_SECS);

    let inside_skew = tokens_expiring_in(50);
    assert!(inside_skew.is_expired(now, skew));

    let outside_skew = tokens_expiring_in(120);
    assert!(!outside_skew.is_expired(now, skew));

    let past = tokens_expiring_in(-5);
    assert!(past.is_expired(now, Duration::zero()));
  }

  #[test]
  fn test_credentials_debug_redacts_password() {
    let creds = Credentials {
      username: "ana".into(),
      password: "hunter2".into(),
    };
    let printed = format!("{:?}", creds);
    assert!(printed.contains("ana"));
    assert!(!printed.contains("hunter2"));
  }

  #[test]
  fn test_replace_persists_and_restores() {
    let kv = kv();
    let session = SessionStore::new(kv.clone());
    let state = SessionState {
      user: Some(User {
        id: 1,
        username: "ana".into(),
        email: None,
      }),
      tokens: Some(tokens_expiring_in(3600)),
    };
    session.replace(state.clone()).unwrap();

    let restored = SessionStore::restore(kv).unwrap();
    assert_eq!(restored.current(), state);
    assert!(restored.is_authenticated());
  }

  #[test]
  fn test_clear_removes_persisted_session() {
    let kv = kv();
    let session = SessionStore::new(kv.clone());
    session
      .replace(SessionState {
        user: None,
        tokens: Some(tokens_expiring_in(3600)),
      })
      .unwrap();

    session.clear().unwrap();
    assert!(!session.is_authenticated());
    assert_eq!(kv.load(SESSION_KEY).unwrap(), None);
    assert!(!SessionStore::restore(kv).unwrap().is_authenticated());
  }

  #[test]
  fn test_swap_tokens_requires_matching_refresh_token() {
    let session = SessionStore::new(kv());
    let original = tokens_expiring_in(10);
    session
      .replace(SessionState {
        user: None,
        tokens: Some(original.clone()),
      })
      .unwrap();

    let mut refreshed = tokens_expiring_in(3600);
    refreshed.refresh_token = "next".into();
    assert!(!session.swap_tokens("someone-else", refreshed.clone()).unwrap());
    assert_eq!(session.tokens(), Some(original.clone()));

    assert!(session
      .swap_tokens(&original.refresh_token, refreshed.clone())
      .unwrap());
    assert_eq!(session.tokens(), Some(refreshed));

    // Logged out sessions are never revived by a late refresh
    session.clear().unwrap();
    assert!(!session
      .swap_tokens("next", tokens_expiring_in(3600))
      .unwrap());
    assert!(!session.is_authenticated());
  }

  #[tokio::test]
  async fn test_login_and_logout() {
    let session = SessionStore::new(kv());
    let transport = Arc::new(FakeAuth::new());
    let auth = Auth::new(session.clone(), transport.clone());

    let user = auth
      .login(&Credentials {
        username: "ana".into(),
        password: "pw".into(),
      })
      .await
      .unwrap();
    assert_eq!(user.username, "ana");
    assert!(session.is_authenticated());

    auth.logout().await.unwrap();
    assert!(!session.is_authenticated());
    assert_eq!(transport.logout_calls(), 1);
  }

  #[tokio::test]
  async fn test_logout_clears_even_if_server_fails() {
    let session = SessionStore::new(kv());
    session
      .replace(SessionState {
        user: None,
        tokens: Some(tokens_expiring_in(3600)),
      })
      .unwrap();
    let transport = Arc::new(FakeAuth::new().failing_logout());
    let auth = Auth::new(session.clone(), transport);

    auth.logout().await.unwrap();
    assert_eq!(session.current(), SessionState::default());
  }
}
