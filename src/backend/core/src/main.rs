//! Taskline worker process.
//!
//! Opens the configured job queue strategy, consumes the built-in queues and
//! answers worker messages until interrupted.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use taskline_core::{
    bridge::WorkerHost,
    config::Config,
    jobs::{build_strategy, create_remove_settled_jobs_queue, register_health, JobQueueService},
    telemetry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let started = Instant::now();

    let config = match std::env::var("TASKLINE_CONFIG") {
        Ok(path) => Config::from_file(&path),
        Err(_) => Config::load(),
    }
    .context("loading configuration")?;

    let telemetry = telemetry::init_telemetry(&config.telemetry)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        strategy = ?config.strategy,
        "Starting Taskline worker"
    );

    let strategy = build_strategy(&config).await?;
    let service = Arc::new(JobQueueService::new(&config, strategy));
    create_remove_settled_jobs_queue(&service).await?;

    let host = Arc::new(WorkerHost::new());
    register_health(&host, service.clone(), started)?;

    let listener = TcpListener::bind(config.worker.listen)
        .await
        .with_context(|| format!("binding worker listener on {}", config.worker.listen))?;
    let shutdown = CancellationToken::new();
    let server = tokio::spawn(host.clone().serve(listener, shutdown.clone()));

    service.open().await?;
    tracing::info!(
        worker_id = %service.context().worker_id,
        queues = ?service.queue_names(),
        "Worker ready"
    );

    shutdown_signal().await;

    shutdown.cancel();
    if let Err(e) = service.close().await {
        e.log();
    }
    match server.await {
        Ok(Err(e)) => e.log(),
        Err(e) => tracing::warn!(error = %e, "Worker host task failed"),
        Ok(Ok(())) => {}
    }

    telemetry.shutdown();
    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
