//! jobmon - performance monitoring backend for HPC jobs.

use clap::Parser;
use jobmon::{AppContext, ConfigWatcher, JanitorService, logging};
use jobmon_cli::Args;
use miette::{IntoDiagnostic, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.verbose);

    let ctx = Arc::new(AppContext::init(&args.config).await.into_diagnostic()?);

    match ctx.enrich_missing().await {
        Ok(0) => {}
        Ok(count) => tracing::info!(count, "Enriched stopped jobs without summaries"),
        Err(e) => tracing::error!("Error enriching stopped jobs: {}", e),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let janitor = JanitorService::new(Arc::clone(&ctx), args.janitor_interval(), shutdown_rx).start();

    let reloader = if args.no_watch {
        None
    } else {
        let watcher = ConfigWatcher::new(ctx.config_path())?;
        Some(watcher.spawn_reloader(Arc::clone(&ctx), Duration::from_millis(250)))
    };

    tokio::signal::ctrl_c().await.into_diagnostic()?;
    tracing::info!("Shutting down");

    let _ = shutdown_tx.send(true);
    if let Err(e) = janitor.await {
        tracing::error!("Janitor task failed: {}", e);
    }
    if let Some(reloader) = reloader {
        reloader.abort();
    }
    ctx.flush().await.into_diagnostic()?;
    Ok(())
}
