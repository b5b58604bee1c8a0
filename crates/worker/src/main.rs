mod bootstrap;
mod handlers;
mod http;

use std::time::Duration;

use anyhow::Result;
use stepledger_core::config::{AppConfig, LoadOptions};
use stepledger_core::{IntervalTicker, WorkerPool};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

fn init_logging(config: &AppConfig) {
    use stepledger_core::config::LogFormat::*;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

async fn run() -> Result<()> {
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;

    http::spawn(
        &app.config.server.bind_address,
        app.config.server.metrics_port,
        http::HttpState::new(app.db_pool.clone(), app.engine.clone()),
    )
    .await?;

    let (reaper_stop_tx, reaper_stop_rx) = watch::channel(false);
    let reaper = app.reaper();
    let reaper_ticker = IntervalTicker::new(app.config.reaper_interval());
    let reaper_task = tokio::spawn(async move { reaper.run(reaper_ticker, reaper_stop_rx).await });

    let pool = WorkerPool::spawn(app.workers());
    tracing::info!(
        event_name = "system.worker.started",
        workers = pool.len(),
        "stepledger-worker started"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!(event_name = "system.worker.stopping", "shutdown requested, draining workers");

    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
    let _ = reaper_stop_tx.send(true);
    match tokio::time::timeout(grace, pool.shutdown_and_join()).await {
        Ok(failures) => {
            for (worker_id, error) in failures {
                tracing::error!(
                    event_name = "system.worker.worker_failed",
                    worker_id = %worker_id,
                    error = %error,
                    "worker stopped with an error"
                );
            }
        }
        Err(_) => {
            tracing::warn!(
                event_name = "system.worker.shutdown_timeout",
                grace_secs = grace.as_secs(),
                "workers still busy after the grace period, their steps will be reclaimed"
            );
        }
    }
    if tokio::time::timeout(grace, reaper_task).await.is_err() {
        tracing::warn!(event_name = "system.worker.reaper_timeout", "reaper did not stop in time");
    }

    app.db_pool.close().await;
    tracing::info!(event_name = "system.worker.stopped", "stepledger-worker stopped");
    Ok(())
}
