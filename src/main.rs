mod app;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use querykit::config::Config;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "querykit")]
#[command(about = "Cached client for a comments REST API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/querykit/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show the comment feed
  Feed {
    /// Number of pages to load
    #[arg(short, long, default_value_t = 1)]
    pages: usize,
  },
  /// Post a comment
  Post { body: String },
  /// Fetch a single resource, e.g. `show comments 42`
  Show { collection: String, id: u64 },
  /// Log in with QUERYKIT_USERNAME / QUERYKIT_PASSWORD
  Login,
  /// Log out and forget the stored session
  Logout,
  /// Keep the session alive and print the feed as it changes
  Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;

  let log_dir = match &config.log_dir {
    Some(dir) => dir.clone(),
    None => Config::data_dir()?.join("logs"),
  };
  let _log_guard = querykit::logging::init(&log_dir)?;

  let app = app::App::new(config)?;
  match args.command {
    Command::Feed { pages } => app.feed(pages).await,
    Command::Post { body } => app.post(body).await,
    Command::Show { collection, id } => app.show(&collection, id).await,
    Command::Login => app.login().await,
    Command::Logout => app.logout().await,
    Command::Watch => app.watch().await,
  }
}
