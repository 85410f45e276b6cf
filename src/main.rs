mod cache;
mod classify;
mod config;
mod host;
mod lifecycle;
mod net;
mod outbox;
mod push;
mod registry;
mod sync;
mod task;
mod worker;

use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cache::store::CacheStore;
use crate::net::HttpNetwork;
use crate::outbox::Outbox;
use crate::registry::Registry;
use crate::worker::Worker;

#[derive(Parser, Debug)]
#[command(name = "shelf")]
#[command(about = "An offline-first caching gateway with background sync")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/shelf/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Cache version override; bumping it rolls every partition over
  #[arg(long)]
  cache_version: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = config::Config::load(args.config.as_deref())?;

  // Override the cache version if specified on the command line
  let config = if let Some(version) = args.cache_version {
    config::Config { version, ..config }
  } else {
    config
  };

  let data_dir = config::data_dir()?;
  let file_appender = tracing_appender::rolling::daily(data_dir.join("logs"), "shelf.log");
  let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);
  tracing_subscriber::registry()
    .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,shelf=debug")))
    .with(tracing_subscriber::fmt::layer())
    .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(file_writer))
    .init();

  let registry = Registry::from_config(&config)?;
  let store = CacheStore::open(&data_dir.join("cache.db"))?;
  let outbox = Outbox::open(&data_dir.join("outbox.db"))?;
  let network = HttpNetwork::new()?;

  let worker = Arc::new(Worker::new(registry, store, outbox, network));

  info!(version = config.version.as_str(), "installing");
  worker.install().await?;
  let dropped = worker.activate()?;
  info!(dropped = dropped.len(), "worker active");

  host::serve(
    worker,
    config.listen,
    Duration::from_secs(config.cleanup_interval_mins * 60),
  )
  .await
}
