use anyhow::Result;
use dripline_worker::{init_logging, AutomationRuntime, LogConfig, WorkerConfig};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    // Configure via environment variables:
    // - RUST_LOG or LOG_LEVEL: Log filter (default: "info")
    init_logging(LogConfig::from_env());

    tracing::info!("dripline-worker starting...");

    let config = WorkerConfig::from_env();
    tracing::info!(
        worker_id = %config.worker_id,
        max_concurrent = config.max_concurrent_jobs,
        job_timeout_secs = config.job_timeout.as_secs(),
        scheduler_interval_secs = config.scheduler_interval.as_secs(),
        "Starting automation worker"
    );

    let runtime = AutomationRuntime::in_memory(config);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        tracing::info!("Received shutdown signal");
        shutdown_tx.send_replace(true);
    });

    if let Err(e) = runtime.run(shutdown_rx).await {
        tracing::error!(error = %e, "Worker error");
        return Err(e);
    }

    tracing::info!("Worker shutdown complete");
    Ok(())
}
