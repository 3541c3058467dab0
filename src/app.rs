use color_eyre::{eyre::eyre, Result};
use querykit::cache::{CacheKey, CacheStore, EntryStatus};
use querykit::config::Config;
use querykit::model::{Comment, NewComment};
use querykit::mutation::{is_temp_id, MutationExecutor};
use querykit::paginated::{PaginatedResource, PaginatedValue};
use querykit::session::{Auth, RefreshOutcome, RevalidationScheduler, SessionStore};
use querykit::storage::{KvStore, SqliteStore};
use querykit::transport::http::HttpTransport;
use querykit::transport::{MutationTransport, ResourceFetcher};
use std::sync::Arc;
use tracing::{info, warn};

type Feed = PaginatedValue<Comment, u64>;

/// Wires the cache, session and HTTP transport together for one command.
pub struct App {
  config: Config,
  kv: Arc<dyn KvStore>,
  session: SessionStore,
  transport: HttpTransport,
  feed: CacheStore<Feed>,
  feed_key: CacheKey,
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let db = match &config.cache.db_path {
      Some(path) => SqliteStore::open_at(path)?,
      None => SqliteStore::open()?,
    };
    let kv: Arc<dyn KvStore> = Arc::new(db);

    let session = SessionStore::restore(kv.clone())?;
    let transport =
      HttpTransport::new(&config.api.url, config.timeout())?.with_session(session.clone());

    let feed = CacheStore::new(config.stale_time());
    let feed_key = CacheKey::of("comments");
    if config.cache.persist && feed.hydrate(&feed_key, kv.as_ref())? {
      info!(key = %feed_key, "feed restored from local store");
    }

    Ok(Self {
      config,
      kv,
      session,
      transport,
      feed,
      feed_key,
    })
  }

  fn scheduler(&self) -> RevalidationScheduler {
    RevalidationScheduler::new(
      self.session.clone(),
      Arc::new(self.transport.clone()),
      self.config.scheduler(),
    )
  }

  fn resource(&self) -> PaginatedResource<Comment, u64> {
    PaginatedResource::new(
      self.feed.clone(),
      self.feed_key.clone(),
      Arc::new(self.transport.clone()),
    )
  }

  /// Refresh tokens ahead of an authenticated call if they are expiring.
  async fn ensure_session(&self) -> Result<()> {
    match self.scheduler().check_and_refresh().await {
      RefreshOutcome::LoggedOut(e) => Err(eyre!("Session expired ({}). Run `querykit login`.", e)),
      _ => Ok(()),
    }
  }

  fn save_feed(&self) {
    if !self.config.cache.persist {
      return;
    }
    if let Err(e) = self.feed.persist(&self.feed_key, self.kv.as_ref()) {
      warn!(error = %e, "failed to persist feed");
    }
  }

  /// Print the feed, loading up to `pages` pages.
  pub async fn feed(&self, pages: usize) -> Result<()> {
    self.ensure_session().await?;
    let resource = self.resource();

    let loaded = self
      .feed
      .value(&self.feed_key)
      .map(|v| v.fetched_pages())
      .unwrap_or(0);
    if loaded == 0 || self.feed.is_stale(&self.feed_key, self.feed.stale_time_for(&self.feed_key)) {
      resource.refetch().await?;
    }
    while resource.value().fetched_pages() < pages && resource.has_next_page() {
      resource.fetch_next().await?;
    }

    self.save_feed();
    print_feed(&resource.value(), resource.has_next_page());
    Ok(())
  }

  /// Post a comment optimistically, then reconcile with the server.
  pub async fn post(&self, body: String) -> Result<()> {
    self.ensure_session().await?;
    let exec = MutationExecutor::new(self.feed.clone());
    let author = self
      .session
      .current()
      .user
      .map(|u| u.username)
      .unwrap_or_else(|| "you".to_string());
    let placeholder = Comment::pending(exec.temp_id(), body.clone(), author);

    let result = exec
      .mutate(
        &self.feed_key,
        |current| current.cloned().unwrap_or_default().prepend(placeholder),
        || self.transport.submit(NewComment { body }),
      )
      .await;

    match result {
      Ok(comment) => {
        println!("posted #{}", comment.id);
        if let Err(e) = self.resource().refetch().await {
          // The optimistic item stays visible until the next successful fetch
          warn!(error = %e, "refetch after post failed");
        }
        self.save_feed();
        Ok(())
      }
      Err(e) => Err(eyre!("Failed to post comment: {}", e)),
    }
  }

  /// Fetch `collection/id` and print it as JSON.
  pub async fn show(&self, collection: &str, id: u64) -> Result<()> {
    self.ensure_session().await?;
    let store: CacheStore<serde_json::Value> = CacheStore::default();
    let key = CacheKey::of(collection).with(id.to_string());
    let fetcher = self.transport.resource::<serde_json::Value>(collection);

    let value = store
      .fetch(&key, move || async move { fetcher.fetch_one(id).await })
      .await?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
  }

  pub async fn login(&self) -> Result<()> {
    let credentials = Config::get_credentials()?;
    let auth = Auth::new(self.session.clone(), Arc::new(self.transport.clone()));
    let user = auth.login(&credentials).await?;
    println!("logged in as {}", user.username);
    Ok(())
  }

  pub async fn logout(&self) -> Result<()> {
    let auth = Auth::new(self.session.clone(), Arc::new(self.transport.clone()));
    auth.logout().await?;
    println!("logged out");
    Ok(())
  }

  /// Keep the session fresh and print the feed whenever it changes, until
  /// interrupted.
  pub async fn watch(&self) -> Result<()> {
    let scheduler = self.scheduler();
    let follower = scheduler.follow();

    let _subscription = self.feed.subscribe(&self.feed_key, |entry| match entry.status {
      EntryStatus::Fresh => {
        if let Some(value) = &entry.value {
          print_feed(value, value.has_next_page());
        }
      }
      EntryStatus::Error => {
        if let Some(e) = &entry.error {
          eprintln!("refresh failed: {}", e);
        }
      }
      _ => {}
    });

    let resource = self.resource();
    let mut ticks = tokio::time::interval(self.config.scheduler().period);
    loop {
      tokio::select! {
        _ = ticks.tick() => {
          if !self.session.is_authenticated() {
            println!("not logged in, waiting");
            continue;
          }
          if resource.refetch().await.is_ok() {
            self.save_feed();
          }
        }
        _ = tokio::signal::ctrl_c() => break,
      }
    }

    follower.abort();
    scheduler.stop();
    Ok(())
  }
}

fn print_feed(value: &Feed, more: bool) {
  if value.is_empty() {
    println!("(no comments)");
  }
  for comment in value.items() {
    let marker = if comment.pending { " (sending)" } else { "" };
    let id = if is_temp_id(comment.id) {
      "-".to_string()
    } else {
      comment.id.to_string()
    };
    println!(
      "#{:<6} {} {}: {}{}",
      id,
      comment.created_at.format("%Y-%m-%d %H:%M"),
      comment.author,
      comment.body,
      marker
    );
  }
  if more {
    println!("...");
  }
}
