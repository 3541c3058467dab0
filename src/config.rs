use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::StaleTime;
use crate::session::{Credentials, SchedulerConfig, DEFAULT_EXPIRY_SKEW_SECS};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub session: SessionConfig,
  /// Where log files go (defaults to the data directory)
  pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  pub url: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
  30
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfig {
  /// Seconds a fetched value counts as fresh. Unset means always stale
  pub stale_time_secs: Option<i64>,
  /// Keep cached pages in the local database between runs
  #[serde(default)]
  pub persist: bool,
  /// Database file (defaults to the data directory)
  pub db_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
  #[serde(default = "default_refresh_interval_secs")]
  pub refresh_interval_secs: u64,
  #[serde(default = "default_expiry_skew_secs")]
  pub expiry_skew_secs: i64,
}

fn default_refresh_interval_secs() -> u64 {
  300
}

fn default_expiry_skew_secs() -> i64 {
  DEFAULT_EXPIRY_SKEW_SECS
}

impl Default for SessionConfig {
  fn default() -> Self {
    Self {
      refresh_interval_secs: default_refresh_interval_secs(),
      expiry_skew_secs: default_expiry_skew_secs(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./querykit.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/querykit/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/querykit/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("querykit.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("querykit").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.session.refresh_interval_secs == 0 {
      return Err(eyre!("session.refresh_interval_secs must be greater than zero"));
    }
    Ok(config)
  }

  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.api.timeout_secs)
  }

  pub fn stale_time(&self) -> StaleTime {
    self
      .cache
      .stale_time_secs
      .map(StaleTime::seconds)
      .unwrap_or_default()
  }

  pub fn scheduler(&self) -> SchedulerConfig {
    SchedulerConfig {
      period: Duration::from_secs(self.session.refresh_interval_secs),
      skew: chrono::Duration::seconds(self.session.expiry_skew_secs),
    }
  }

  /// Directory for the database and logs.
  pub fn data_dir() -> Result<PathBuf> {
    dirs::data_dir()
      .map(|d| d.join("querykit"))
      .ok_or_else(|| eyre!("Could not determine data directory"))
  }

  /// Login credentials from QUERYKIT_USERNAME and QUERYKIT_PASSWORD.
  pub fn get_credentials() -> Result<Credentials> {
    let username = std::env::var("QUERYKIT_USERNAME")
      .map_err(|_| eyre!("Username not found. Set QUERYKIT_USERNAME environment variable."))?;
    let password = std::env::var("QUERYKIT_PASSWORD")
      .map_err(|_| eyre!("Password not found. Set QUERYKIT_PASSWORD environment variable."))?;
    Ok(Credentials { username, password })
  }
}
