//! stratad - Strata rollup daemon
//!
//! Connects the column store and blob store, then rolls every registered
//! agent rollup up on a fixed schedule until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use strata_core::telemetry::{init_tracing, level_for};
use strata_core::{MetricsRepository, RollupScheduler, StrataConfig, SystemClock};
use strata_store::{CappedBlobStore, MemoryRollupStore, RollupStore, SurrealRollupStore};
use tokio::sync::watch;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "stratad")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Multi-level rollup daemon for Strata", long_about = None)]
struct Cli {
    /// TOML configuration file (defaults apply when omitted)
    #[arg(short, long, env = "STRATA_CONFIG")]
    config: Option<PathBuf>,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Run a single rollup pass and exit
    #[arg(long)]
    once: bool,

    /// Keep all rows in memory instead of connecting to SurrealDB
    #[arg(long)]
    memory: bool,
}

fn load_config(path: Option<&PathBuf>) -> Result<StrataConfig> {
    match path {
        Some(path) => StrataConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(StrataConfig::default()),
    }
}

async fn connect_store(memory: bool, level_count: usize) -> Result<Arc<dyn RollupStore>> {
    if memory {
        info!("using in-memory column store");
        return Ok(Arc::new(MemoryRollupStore::new()));
    }
    let store = SurrealRollupStore::from_env(level_count)
        .await
        .context("failed to connect to SurrealDB")?;
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json, level_for(cli.verbose));

    let config = load_config(cli.config.as_ref())?;
    let levels = config.rollup_levels()?;
    let store = connect_store(cli.memory, levels.len()).await?;
    let blobs = Arc::new(CappedBlobStore::new(config.blob_capacity_bytes));
    let repository = Arc::new(MetricsRepository::new(
        store,
        blobs,
        &config,
        Arc::new(SystemClock),
    )?);
    let scheduler = RollupScheduler::new(Arc::clone(&repository), config.rollup_schedule());

    info!(
        levels = levels.len(),
        schedule_secs = config.rollup_schedule_secs,
        "stratad started"
    );

    if cli.once {
        let summary = scheduler.tick().await?;
        info!(
            agent_rollups = summary.agent_rollups,
            buckets_rolled_up = summary.buckets_rolled_up,
            failed_buckets = summary.failed_buckets,
            "single rollup pass finished"
        );
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = tokio::spawn(scheduler.run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");
    shutdown_tx.send(true).ok();
    worker.await.context("scheduler task panicked")?;
    Ok(())
}
