//! Key/value persistence used to survive process restarts.
//!
//! The session and any explicitly persisted cache entries are stored as
//! JSON blobs under a name chosen by the caller.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Trait for key/value persistence backends.
pub trait KvStore: Send + Sync {
  /// Load the blob stored under `name`, if any.
  fn load(&self, name: &str) -> Result<Option<Vec<u8>>>;

  /// Store `bytes` under `name`, replacing any previous blob.
  fn save(&self, name: &str, bytes: &[u8]) -> Result<()>;

  /// Delete the blob stored under `name`. Missing names are not an error.
  fn remove(&self, name: &str) -> Result<()>;
}

/// Store that doesn't persist anything.
/// Used when persistence is disabled - all operations are no-ops.
pub struct NoopStore;

impl KvStore for NoopStore {
  fn load(&self, _name: &str) -> Result<Option<Vec<u8>>> {
    Ok(None) // Always miss
  }

  fn save(&self, _name: &str, _bytes: &[u8]) -> Result<()> {
    Ok(()) // Discard
  }

  fn remove(&self, _name: &str) -> Result<()> {
    Ok(())
  }
}

/// Process-local store, mostly useful in tests.
#[derive(Default)]
pub struct MemoryStore {
  blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl KvStore for MemoryStore {
  fn load(&self, name: &str) -> Result<Option<Vec<u8>>> {
    let blobs = self
      .blobs
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(blobs.get(name).cloned())
  }

  fn save(&self, name: &str, bytes: &[u8]) -> Result<()> {
    let mut blobs = self
      .blobs
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    blobs.insert(name.to_string(), bytes.to_vec());
    Ok(())
  }

  fn remove(&self, name: &str) -> Result<()> {
    let mut blobs = self
      .blobs
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    blobs.remove(name);
    Ok(())
  }
}

/// SQLite-based key/value store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open the store at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open (or create) the store at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create store directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open store at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a store that lives only as long as this value.
  pub fn in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory store: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("querykit").join("store.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(STORE_SCHEMA)
      .map_err(|e| eyre!("Failed to run store migrations: {}", e))?;

    Ok(())
  }
}

const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    name TEXT PRIMARY KEY,
    data BLOB NOT NULL,
    saved_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl KvStore for SqliteStore {
  fn load(&self, name: &str) -> Result<Option<Vec<u8>>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .query_row(
        "SELECT data FROM kv_store WHERE name = ?",
        params![name],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to load {}: {}", name, e))
  }

  fn save(&self, name: &str, bytes: &[u8]) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO kv_store (name, data, saved_at)
         VALUES (?, ?, datetime('now'))",
        params![name, bytes],
      )
      .map_err(|e| eyre!("Failed to save {}: {}", name, e))?;

    Ok(())
  }

  fn remove(&self, name: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM kv_store WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to remove {}: {}", name, e))?;

    Ok(())
  }
}
