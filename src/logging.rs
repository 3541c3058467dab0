//! Log to a daily rolling file so command output stays clean.

use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "querykit=info";

/// Install the global subscriber writing to `dir/querykit.log.YYYY-MM-DD`.
///
/// The filter comes from `QUERYKIT_LOG`, then `RUST_LOG`, then
/// `querykit=info`. Keep the returned guard alive for the lifetime of the
/// program or buffered lines are lost.
pub fn init(dir: &Path) -> Result<WorkerGuard> {
  std::fs::create_dir_all(dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(dir, "querykit.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::fmt()
    .with_env_filter(filter())
    .with_writer(writer)
    .with_ansi(false)
    .with_target(true)
    .try_init()
    .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;

  Ok(guard)
}

fn filter() -> EnvFilter {
  EnvFilter::try_from_env("QUERYKIT_LOG")
    .or_else(|_| EnvFilter::try_from_default_env())
    .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}
