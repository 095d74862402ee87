//! Hookline server: ingestion endpoint and worker pool in one process.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{net::TcpListener, signal, sync::watch};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hookline::clock::{Clock, SystemClock};
use hookline::store::{MemoryEventStore, MemoryJobStore};
use hookline::web::router;
use hookline::worker::{run_pool, run_sweeper, WorkerSettings};
use hookline::{
    AppState, Config, DispatchQueue, HandlerRegistry, JobProcessor, RetryPolicy, WebhookRecorder,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("hookline_starting");

    let config = Config::from_env().context("Invalid configuration")?;
    let mut sources: Vec<&str> = config.sources.keys().map(String::as_str).collect();
    sources.sort_unstable();
    info!(
        port = config.port,
        sources = ?sources,
        worker_concurrency = config.worker_concurrency,
        max_attempts = config.max_attempts,
        ingest_timeout_ms = config.ingest_timeout.as_millis() as u64,
        "config_loaded"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let recorder = WebhookRecorder::new(
        Arc::new(MemoryEventStore::new()),
        clock.clone(),
        config.idempotency_window,
        config.retention,
    );
    let queue = DispatchQueue::new(
        Arc::new(MemoryJobStore::new()),
        recorder.clone(),
        clock,
        RetryPolicy::from_config(&config),
        config.visibility_timeout,
    );

    // Shared HTTP client for forwarding handlers
    let client = reqwest::Client::builder()
        .pool_max_idle_per_host(100)
        .build()
        .context("Failed to create HTTP client")?;
    let registry = HandlerRegistry::from_config(&config, client);
    info!(handlers = registry.len(), "handlers_registered");

    let processor = JobProcessor::new(
        registry,
        recorder.clone(),
        queue.clone(),
        config.handler_timeout,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = tokio::spawn(run_pool(
        processor,
        WorkerSettings::from_config(&config),
        shutdown_rx.clone(),
    ));
    let sweeper = tokio::spawn(run_sweeper(
        recorder.clone(),
        config.retention_sweep_interval,
        shutdown_rx,
    ));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let app = router(AppState::new(config, recorder, queue));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "web_server_listening");

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Stop leasing; in-flight batches finish first
    let _ = shutdown_tx.send(true);
    workers.await.context("Worker pool panicked")?;
    sweeper.await.context("Retention sweeper panicked")?;

    info!("hookline_shutdown_complete");

    Ok(())
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "ctrl_c_handler_failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "sigterm_handler_failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }

    info!("shutdown_requested");
}
