//! Background token refresh.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::{SessionStore, DEFAULT_EXPIRY_SKEW_SECS};
use crate::error::QueryError;
use crate::transport::SessionTransport;

/// Timing knobs for the scheduler.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
  /// How often the expiry check runs while authenticated
  pub period: Duration,
  /// Tokens expiring within this window are refreshed early
  pub skew: chrono::Duration,
}

impl Default for SchedulerConfig {
  fn default() -> Self {
    Self {
      period: Duration::from_secs(5 * 60),
      skew: chrono::Duration::seconds(DEFAULT_EXPIRY_SKEW_SECS),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
  Stopped,
  Running,
}

/// What a single [`RevalidationScheduler::check_and_refresh`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
  /// Another check was already running
  Skipped,
  NotAuthenticated,
  /// Tokens are not close to expiry
  StillValid,
  Refreshed,
  /// The session changed while the refresh was in flight; result dropped
  Superseded,
  /// Refresh failed; the session was cleared
  LoggedOut(QueryError),
}

struct Inner {
  session: SessionStore,
  transport: Arc<dyn SessionTransport>,
  config: SchedulerConfig,
  timer: Mutex<Option<JoinHandle<()>>>,
  checking: AtomicBool,
}

/// Keeps exactly one refresh timer alive while started.
///
/// Cloning is cheap; clones control the same timer.
#[derive(Clone)]
pub struct RevalidationScheduler {
  inner: Arc<Inner>,
}

/// Clears the in-flight flag even if the check is cancelled mid-refresh.
struct CheckGuard<'a>(&'a AtomicBool);

impl Drop for CheckGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

impl RevalidationScheduler {
  pub fn new(
    session: SessionStore,
    transport: Arc<dyn SessionTransport>,
    config: SchedulerConfig,
  ) -> Self {
    Self {
      inner: Arc::new(Inner {
        session,
        transport,
        config,
        timer: Mutex::new(None),
        checking: AtomicBool::new(false),
      }),
    }
  }

  pub fn state(&self) -> SchedulerState {
    self.inner.state()
  }

  /// Check immediately, then every `period`. No-op if already running.
  pub fn start(&self) {
    self.inner.start();
  }

  /// Cancel the timer. No-op if already stopped.
  pub fn stop(&self) {
    self.inner.stop();
  }

  /// Refresh the tokens if they are (about to be) expired; force a logout
  /// if that fails. Never retried.
  pub async fn check_and_refresh(&self) -> RefreshOutcome {
    Inner::check_and_refresh(&self.inner).await
  }

  /// Start whenever the session becomes authenticated and stop when it
  /// stops being so. Runs until the returned task is aborted.
  pub fn follow(&self) -> JoinHandle<()> {
    let mut rx = self.inner.session.subscribe();
    let scheduler = self.clone();

    tokio::spawn(async move {
      loop {
        let authenticated = rx.borrow_and_update().is_authenticated();
        if authenticated {
          scheduler.start();
        } else {
          scheduler.stop();
        }

        if rx.changed().await.is_err() {
          break;
        }
      }
    })
  }
}

impl Inner {
  fn timer(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
    self.timer.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn state(&self) -> SchedulerState {
    match self.timer().as_ref() {
      Some(handle) if !handle.is_finished() => SchedulerState::Running,
      _ => SchedulerState::Stopped,
    }
  }

  fn start(self: &Arc<Self>) {
    let mut timer = self.timer();
    if matches!(timer.as_ref(), Some(handle) if !handle.is_finished()) {
      return;
    }

    let inner = Arc::clone(self);
    let period = self.config.period;
    *timer = Some(tokio::spawn(async move {
      let mut ticks = tokio::time::interval(period);
      ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
      loop {
        // First tick completes immediately
        ticks.tick().await;
        Inner::check_and_refresh(&inner).await;
      }
    }));
    info!(period_secs = period.as_secs(), "refresh scheduler started");
  }

  fn stop(&self) {
    if let Some(handle) = self.timer().take() {
      handle.abort();
      info!("refresh scheduler stopped");
    }
  }

  async fn check_and_refresh(self: &Arc<Self>) -> RefreshOutcome {
    if self
      .checking
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      debug!("refresh check already in flight, skipping");
      return RefreshOutcome::Skipped;
    }
    let _guard = CheckGuard(&self.checking);

    let Some(tokens) = self.session.tokens() else {
      return RefreshOutcome::NotAuthenticated;
    };
    if !tokens.is_expired(Utc::now(), self.config.skew) {
      return RefreshOutcome::StillValid;
    }

    debug!(expires_at = %tokens.expires_at, "access token expiring, refreshing");
    match self.transport.refresh(&tokens.refresh_token).await {
      Ok(Some(fresh)) => match self.session.swap_tokens(&tokens.refresh_token, fresh) {
        Ok(true) => {
          info!("access token refreshed");
          RefreshOutcome::Refreshed
        }
        Ok(false) => {
          debug!("session changed during refresh, dropping new tokens");
          RefreshOutcome::Superseded
        }
        Err(e) => {
          // In-memory tokens are already swapped; only persistence failed
          warn!(error = %e, "failed to persist refreshed session");
          RefreshOutcome::Refreshed
        }
      },
      Ok(None) => self.force_logout(QueryError::AuthExpired),
      Err(e) => self.force_logout(e),
    }
  }

  fn force_logout(&self, error: QueryError) -> RefreshOutcome {
    warn!(error = %error, "token refresh failed, logging out");
    if let Err(e) = self.session.clear() {
      warn!(error = %e, "failed to clear persisted session");
    }
    self.stop();
    RefreshOutcome::LoggedOut(error)
  }
}
