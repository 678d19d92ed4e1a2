use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use curvescope::clock::system_clock;
use curvescope::config::AppConfig;
use curvescope::feed::{FeedConnector, NdjsonTcpConnector, ReplayConnector};
use curvescope::persistence::SqliteStore;
use curvescope::pipeline;

#[derive(Parser, Debug)]
#[command(
    name = "curvescope",
    about = "Real-time ingestion and analytics pipeline for bonding-curve token launches"
)]
struct Cli {
    /// Path to a JSON config file; defaults plus environment otherwise
    #[arg(long)]
    config: Option<PathBuf>,

    /// Replay a capture file (JSON array of confirmed transactions) instead
    /// of connecting to the live feed
    #[arg(long)]
    replay: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;
    info!(
        "🚀 curvescope starting ({} feed connection(s), {} shard(s))",
        config.upstream.connections, config.pipeline.shards
    );

    let connector: Arc<dyn FeedConnector> = match &cli.replay {
        Some(path) => Arc::new(ReplayConnector::from_capture(path)?),
        None => Arc::new(NdjsonTcpConnector::new(
            config.upstream.endpoint.clone(),
            config.upstream.token.clone(),
            config.upstream.commitment.clone(),
        )),
    };

    let store = SqliteStore::open(&config.persistence.connection_string)?;
    let clock = system_clock();

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received ctrl-c"),
            Err(e) => warn!("ctrl-c handler failed, stopping: {e}"),
        }
        let _ = stop_tx.send(true);
    });

    pipeline::run(config, connector, store, clock, stop_rx).await
}
