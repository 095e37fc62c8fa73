//! jobrelay worker
//!
//! Runs the configured domain worker modules against the Redis broker and,
//! unless `PORT=0`, the ops HTTP server.

use dotenvy::dotenv;
use jobrelay::broker::{Broker, RedisBroker};
use jobrelay::config::{get_environment, get_redis_url, WorkerSettings};
use jobrelay::core::http::{start_server, AppState};
use jobrelay::core::QueueManager;
use jobrelay::domains::{build_modules, shutdown_modules};
use jobrelay::logging;
use jobrelay::metrics::Metrics;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env if present
    dotenv().ok();

    logging::init_logging();

    let settings = WorkerSettings::from_env();
    info!("Starting jobrelay worker");
    info!(environment = %get_environment(), "Environment");
    info!(
        concurrency = settings.concurrency,
        drain_timeout_secs = settings.drain_timeout.as_secs(),
        modules = ?settings.modules,
        "Worker settings"
    );

    let metrics = Arc::new(Metrics::new()?);

    info!("Connecting to Redis broker...");
    let redis_url = get_redis_url();
    let broker: Arc<dyn Broker> = match RedisBroker::connect(&redis_url, settings.queue_prefix.clone()).await {
        Ok(broker) => Arc::new(broker),
        Err(e) => {
            error!(error = %e, "Failed to connect to Redis - exiting");
            return Err(format!("Redis connection required for worker: {}", e).into());
        }
    };

    let manager = Arc::new(QueueManager::new(broker, settings.clone()).with_metrics(metrics));
    manager.initialize().await?;

    let modules = build_modules(&settings.modules, manager.clone())?;
    for module in &modules {
        module.initialize().await?;
        info!(module = module.name(), queues = ?module.queue_names(), "Module {} running", module.name());
    }

    let (stop_tx, mut stop_rx) = watch::channel(false);
    let server = if settings.port > 0 {
        let state = AppState::new(manager.clone(), &modules);
        let port = settings.port;
        Some(tokio::spawn(async move {
            let shutdown = async move {
                let _ = stop_rx.wait_for(|stop| *stop).await;
            };
            if let Err(e) = start_server(state, port, shutdown).await {
                error!(error = %e, "Ops server failed");
            }
        }))
    } else {
        info!("Ops server disabled (PORT=0)");
        None
    };

    info!("Worker started, waiting for shutdown signal...");
    wait_for_signal().await;
    info!("Shutting down worker...");

    let _ = stop_tx.send(true);
    let report = shutdown_modules(&modules, &manager, settings.drain_timeout).await;
    info!(report = ?report, "Workers drained");

    if let Some(server) = server {
        if let Err(e) = server.await {
            warn!(error = %e, "Ops server task ended abnormally");
        }
    }

    info!("Worker stopped");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable, listening for Ctrl-C only");
                let _ = signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }
}
