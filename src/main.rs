use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use gallery_server::{
  api,
  catalog::Catalog,
  config::GalleryConfig,
  engine::SyncEngine,
  error,
  git::GitSyncer,
};

/// Serve a catalog of git exhibits with on-demand clone/update and live
/// progress streaming.
#[derive(Debug, Parser)]
#[command(name = "gallery-server", version)]
struct Args {
  /// Path to the TOML catalog config.
  #[arg(long, default_value = "gallery.toml")]
  config: PathBuf,

  /// Listen host.
  #[arg(long, default_value = "127.0.0.1")]
  host: String,

  /// Listen port.
  #[arg(long, default_value_t = 8787)]
  port: u16,

  /// Write JSON logs to daily-rotated files in this directory instead of
  /// stderr.
  #[arg(long)]
  log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let args = Args::parse();
  error::init_tracing(args.log_dir.as_deref())?;

  let config = GalleryConfig::load(&args.config)?;
  tracing::info!(
    config = %args.config.display(),
    exhibits = config.exhibits.len(),
    destination = %config.destination_dir().display(),
    "loaded gallery config"
  );

  let lock_timeout = Duration::from_secs(config.lock_timeout_secs);
  let catalog = Arc::new(Catalog::new(config));
  let engine = SyncEngine::new(Arc::new(GitSyncer::new(lock_timeout)), lock_timeout);
  engine.start_broadcaster();

  let addr: SocketAddr = format!("{}:{}", args.host, args.port)
    .parse()
    .context("invalid listen address")?;
  api::serve(addr, api::ApiState { catalog, engine }).await
}
