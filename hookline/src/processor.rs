//! Job processing: run the handler for one leased job and report the
//! outcome back to the dispatch queue.
//!
//! The processor never writes event status itself; the queue does that when
//! it applies the outcome.

use std::time::Duration;

use tracing::{error, info, warn};

use crate::error::{HandlerError, StorageError};
use crate::handler::HandlerRegistry;
use crate::model::{QueueJob, WebhookEvent};
use crate::queue::{DispatchQueue, NackOutcome};
use crate::recorder::WebhookRecorder;

/// Result of running a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Retry {
        reason: String,
        retry_after: Option<Duration>,
    },
    Fatal(String),
}

/// Routes events to registered handlers with a time bound.
#[derive(Clone)]
pub struct JobProcessor {
    registry: HandlerRegistry,
    recorder: WebhookRecorder,
    queue: DispatchQueue,
    handler_timeout: Duration,
}

impl JobProcessor {
    pub fn new(
        registry: HandlerRegistry,
        recorder: WebhookRecorder,
        queue: DispatchQueue,
        handler_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            recorder,
            queue,
            handler_timeout,
        }
    }

    pub fn queue(&self) -> &DispatchQueue {
        &self.queue
    }

    /// Run the handler registered for the event's source and topic.
    pub async fn process(&self, event: &WebhookEvent) -> Outcome {
        let Some(handler) = self.registry.lookup(&event.source, event.topic.as_deref()) else {
            return Outcome::Fatal(format!(
                "unsupported topic: no handler for source '{}' topic {:?}",
                event.source, event.topic
            ));
        };

        match tokio::time::timeout(self.handler_timeout, handler.handle(event)).await {
            Ok(Ok(())) => Outcome::Success,
            Ok(Err(HandlerError::Retryable {
                reason,
                retry_after,
            })) => Outcome::Retry {
                reason,
                retry_after,
            },
            Ok(Err(HandlerError::Fatal(reason))) => Outcome::Fatal(reason),
            Err(_) => Outcome::Retry {
                reason: format!("timeout after {}ms", self.handler_timeout.as_millis()),
                retry_after: None,
            },
        }
    }

    /// Process one leased job end to end and apply the outcome to the queue.
    pub async fn handle_job(&self, job: &QueueJob) -> Result<Outcome, StorageError> {
        let Some(event) = self.recorder.get(job.event_id).await? else {
            let outcome = Outcome::Fatal(format!("event {} not found", job.event_id));
            error!(job_id = %job.id, event_id = %job.event_id, "job_event_missing");
            self.queue.dead_letter(job, "event not found").await?;
            return Ok(outcome);
        };

        let outcome = self.process(&event).await;

        match &outcome {
            Outcome::Success => {
                self.queue.ack(job).await?;
            }
            Outcome::Retry {
                reason,
                retry_after,
            } => match self.queue.nack(job, reason, *retry_after).await? {
                NackOutcome::Exhausted { attempts } => {
                    error!(
                        job_id = %job.id,
                        event_id = %event.id,
                        attempts = attempts,
                        "job_retries_exhausted"
                    );
                }
                NackOutcome::Retrying { .. } | NackOutcome::Stale => {}
            },
            Outcome::Fatal(reason) => {
                warn!(job_id = %job.id, event_id = %event.id, reason = %reason, "job_fatal");
                self.queue.dead_letter(job, reason).await?;
            }
        }

        info!(
            job_id = %job.id,
            event_id = %event.id,
            source = %event.source,
            attempt = job.attempt,
            outcome = ?outcome,
            "job_processed"
        );
        Ok(outcome)
    }
}
