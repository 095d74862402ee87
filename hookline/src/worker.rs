//! Worker pool and retention sweeper.
//!
//! Each worker leases a batch, processes it job by job, and sleeps for the
//! poll interval when the queue is empty. Workers share nothing but the
//! queue. Shutdown is signalled through a `watch` channel; a worker finishes
//! the batch it holds before exiting.

use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tracing::{error, info};

use crate::config::Config;
use crate::processor::JobProcessor;
use crate::recorder::WebhookRecorder;

/// Sizing for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub batch_size: usize,
    pub poll_interval: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            concurrency: config.worker_concurrency.max(1),
            batch_size: config.lease_batch_size.max(1),
            poll_interval: config.poll_interval,
        }
    }
}

/// Run `settings.concurrency` workers until `shutdown` flips to `true`.
pub async fn run_pool(
    processor: JobProcessor,
    settings: WorkerSettings,
    shutdown: watch::Receiver<bool>,
) {
    info!(
        concurrency = settings.concurrency,
        batch_size = settings.batch_size,
        poll_interval_ms = settings.poll_interval.as_millis() as u64,
        "worker_pool_starting"
    );

    let workers = (0..settings.concurrency).map(|n| {
        let processor = processor.clone();
        let shutdown = shutdown.clone();
        let worker_id = format!("worker-{n}");
        let batch_size = settings.batch_size;
        let poll_interval = settings.poll_interval;
        tokio::spawn(async move {
            run_worker(processor, worker_id, batch_size, poll_interval, shutdown).await
        })
    });

    for result in join_all(workers).await {
        if let Err(e) = result {
            error!(error = %e, "worker_task_failed");
        }
    }

    info!("worker_pool_stopped");
}

/// One lease-process loop.
pub async fn run_worker(
    processor: JobProcessor,
    worker_id: String,
    batch_size: usize,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(worker_id = %worker_id, "worker_started");

    while !*shutdown.borrow() {
        let jobs = match processor.queue().lease(&worker_id, batch_size).await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(worker_id = %worker_id, error = %e, "job_lease_failed");
                Vec::new()
            }
        };

        if jobs.is_empty() {
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                changed = shutdown.changed() => {
                    // Sender dropped.
                    if changed.is_err() {
                        break;
                    }
                }
            }
            continue;
        }

        for job in &jobs {
            if let Err(e) = processor.handle_job(job).await {
                // The lease runs out and the job is delivered again.
                error!(
                    worker_id = %worker_id,
                    job_id = %job.id,
                    event_id = %job.event_id,
                    error = %e,
                    "job_outcome_not_recorded"
                );
            }
        }
    }

    info!(worker_id = %worker_id, "worker_stopped");
}

/// Periodically prune expired events and idempotency keys.
pub async fn run_sweeper(
    recorder: WebhookRecorder,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = recorder.prune_expired().await {
                    error!(error = %e, "retention_sweep_failed");
                }
            }
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
    }

    info!("retention_sweeper_stopped");
}
