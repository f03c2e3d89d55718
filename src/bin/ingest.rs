use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use sysmon::{
    actions::ScriptDispatcher,
    config::load_config,
    ingest::IngestionLoop,
    storage::{StorageBackend, open_backend_or_memory},
    util::init_tracing,
};
use tracing::{info, trace, warn};

#[derive(Debug, Clone, Parser)]
#[command(about = "Read samples from the collector, store them and act on breaches")]
struct Args {
    /// Config file (defaults to $SYSMON_CONFIG, then built-in defaults)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("ingest");
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config = load_config(args.config.as_deref())?;

    let backend: Arc<dyn StorageBackend> = Arc::from(open_backend_or_memory(&config.storage).await);
    match backend.seed_default_thresholds().await {
        Ok(thresholds) => info!("thresholds: {thresholds:?}"),
        Err(e) => warn!("cannot seed default thresholds, using built-in limits: {e}"),
    }
    match backend.get_stats().await {
        Ok(stats) => info!("storage: {stats}"),
        Err(e) => warn!("cannot read storage stats: {e}"),
    }

    let dispatcher = Arc::new(ScriptDispatcher::new(&config.actions));

    IngestionLoop::new(
        config.collector.address(),
        config.ingester,
        backend,
        dispatcher,
    )
    .with_retention_days(config.storage.retention_days())
    .run()
    .await;

    Ok(())
}
