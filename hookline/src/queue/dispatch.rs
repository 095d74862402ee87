//! Dispatch queue: decouples fast receipt from slow, fallible processing.
//!
//! Delivery is at-least-once. A leased job that is neither acked nor nacked
//! before its visibility deadline is handed out again, so handlers must be
//! idempotent. Every transition after a lease is fenced by the job's
//! [`LeaseId`](crate::model::LeaseId): a worker whose lease was taken over
//! can no longer ack, nack or dead-letter the job.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::error::StorageError;
use crate::model::{DeadLetter, DeadLetterReason, EventId, EventStatus, JobId, LeaseId, QueueJob};
use crate::queue::retry::RetryPolicy;
use crate::recorder::WebhookRecorder;
use crate::store::JobStore;

/// What a `nack` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NackOutcome {
    /// Scheduled for another attempt.
    Retrying {
        delay: Duration,
        available_at: DateTime<Utc>,
    },
    /// Attempt budget used up; the job is dead-lettered.
    Exhausted { attempts: u32 },
    /// The lease was no longer held; nothing changed.
    Stale,
}

/// Durable work queue of [`QueueJob`]s.
#[derive(Clone)]
pub struct DispatchQueue {
    store: Arc<dyn JobStore>,
    recorder: WebhookRecorder,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    visibility_timeout: Duration,
}

impl DispatchQueue {
    pub fn new(
        store: Arc<dyn JobStore>,
        recorder: WebhookRecorder,
        clock: Arc<dyn Clock>,
        policy: RetryPolicy,
        visibility_timeout: Duration,
    ) -> Self {
        Self {
            store,
            recorder,
            clock,
            policy,
            visibility_timeout,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Queue an event for processing. Re-enqueuing a live job returns its id.
    pub async fn enqueue(&self, event_id: EventId) -> Result<JobId, StorageError> {
        let job_id = self.store.enqueue(event_id, self.clock.now()).await?;
        info!(event_id = %event_id, job_id = %job_id, "job_enqueued");
        Ok(job_id)
    }

    /// Claim up to `max_jobs` jobs for `worker_id`.
    ///
    /// Jobs whose lease expired after their last permitted attempt are
    /// dead-lettered here instead of being handed out again.
    pub async fn lease(
        &self,
        worker_id: &str,
        max_jobs: usize,
    ) -> Result<Vec<QueueJob>, StorageError> {
        let now = self.clock.now();
        let claimed = self
            .store
            .claim(worker_id, max_jobs, now, self.visibility_timeout)
            .await?;

        let mut leased = Vec::with_capacity(claimed.len());
        for job in claimed {
            if job.attempt > self.policy.max_attempts {
                let attempts = job.attempt - 1;
                let last_error = job
                    .history
                    .iter()
                    .rev()
                    .find_map(|r| r.error.clone())
                    .unwrap_or_else(|| "lease expired".to_string());
                self.bury(
                    &job,
                    DeadLetterReason::RetriesExhausted {
                        attempts,
                        last_error,
                    },
                    attempts,
                )
                .await?;
                continue;
            }

            if let Err(e) = self
                .recorder
                .transition(job.event_id, EventStatus::Processing)
                .await
            {
                warn!(event_id = %job.event_id, error = %e, "event_status_update_failed");
            }
            info!(
                job_id = %job.id,
                event_id = %job.event_id,
                worker_id = %worker_id,
                attempt = job.attempt,
                "job_leased"
            );
            leased.push(job);
        }

        Ok(leased)
    }

    /// Mark the event `Succeeded`, then remove the job.
    ///
    /// Returns `false` without side effects if the lease is no longer held.
    /// If the status write fails the job stays leased and is delivered again
    /// once the lease runs out.
    pub async fn ack(&self, job: &QueueJob) -> Result<bool, StorageError> {
        let Some(lease_id) = job.lease_id() else {
            return Ok(false);
        };
        if self.current_lease(job.id, lease_id).await?.is_none() {
            warn!(job_id = %job.id, "job_ack_stale_lease");
            return Ok(false);
        }

        self.recorder
            .transition(job.event_id, EventStatus::Succeeded)
            .await?;

        let now = self.clock.now();
        match self.store.complete(job.id, lease_id, now).await? {
            Some(done) => {
                info!(
                    job_id = %done.id,
                    event_id = %done.event_id,
                    attempt = done.attempt,
                    "job_acked"
                );
                Ok(true)
            }
            None => {
                warn!(job_id = %job.id, "job_ack_stale_lease");
                Ok(false)
            }
        }
    }

    /// Schedule a retry, or dead-letter the job once its attempts are used up.
    ///
    /// The delay is the largest of `retry_after`, the policy's backoff and
    /// the delay used for the previous retry, so delays never shrink. The
    /// event goes back to `Pending` before the job becomes leasable again.
    pub async fn nack(
        &self,
        job: &QueueJob,
        error: &str,
        retry_after: Option<Duration>,
    ) -> Result<NackOutcome, StorageError> {
        let Some(lease_id) = job.lease_id() else {
            return Ok(NackOutcome::Stale);
        };

        if !self.policy.can_retry(job.attempt) {
            let reason = DeadLetterReason::RetriesExhausted {
                attempts: job.attempt,
                last_error: error.to_string(),
            };
            return Ok(if self.bury(job, reason, job.attempt).await? {
                NackOutcome::Exhausted {
                    attempts: job.attempt,
                }
            } else {
                NackOutcome::Stale
            });
        }

        let Some(current) = self.current_lease(job.id, lease_id).await? else {
            warn!(job_id = %job.id, "job_nack_stale_lease");
            return Ok(NackOutcome::Stale);
        };
        let delay = self
            .policy
            .delay_for(job.attempt)
            .max(retry_after.unwrap_or_default())
            .max(current.last_delay.unwrap_or_default());

        self.recorder
            .transition(job.event_id, EventStatus::Pending)
            .await?;

        let now = self.clock.now();
        match self
            .store
            .reschedule(job.id, lease_id, delay, error.to_string(), now)
            .await?
        {
            Some(ready) => {
                warn!(
                    job_id = %job.id,
                    event_id = %job.event_id,
                    attempt = job.attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "job_retry_scheduled"
                );
                Ok(NackOutcome::Retrying {
                    delay,
                    available_at: ready.available_at,
                })
            }
            None => {
                warn!(job_id = %job.id, "job_nack_stale_lease");
                Ok(NackOutcome::Stale)
            }
        }
    }

    /// Dead-letter immediately without consuming retry budget.
    pub async fn dead_letter(&self, job: &QueueJob, reason: &str) -> Result<bool, StorageError> {
        let reason = DeadLetterReason::Fatal {
            reason: reason.to_string(),
        };
        self.bury(job, reason, job.attempt).await
    }

    /// Mark the event `Failed`, then move the job to dead-letter.
    async fn bury(
        &self,
        job: &QueueJob,
        reason: DeadLetterReason,
        attempts: u32,
    ) -> Result<bool, StorageError> {
        let Some(lease_id) = job.lease_id() else {
            return Ok(false);
        };
        if self.current_lease(job.id, lease_id).await?.is_none() {
            warn!(job_id = %job.id, "job_dead_letter_stale_lease");
            return Ok(false);
        }

        self.recorder
            .transition(
                job.event_id,
                EventStatus::Failed {
                    attempts,
                    last_error: reason.describe().to_string(),
                },
            )
            .await?;

        let now = self.clock.now();
        if self
            .store
            .bury(job.id, lease_id, reason.clone(), now)
            .await?
            .is_none()
        {
            warn!(job_id = %job.id, "job_dead_letter_stale_lease");
            return Ok(false);
        }

        error!(
            job_id = %job.id,
            event_id = %job.event_id,
            attempts = attempts,
            reason = ?reason,
            "job_dead_lettered"
        );
        Ok(true)
    }

    /// The stored job, if it is still leased under `lease_id`.
    async fn current_lease(
        &self,
        job_id: JobId,
        lease_id: LeaseId,
    ) -> Result<Option<QueueJob>, StorageError> {
        Ok(self
            .store
            .get(job_id)
            .await?
            .filter(|job| job.lease_id() == Some(lease_id)))
    }

    pub async fn get(&self, job_id: JobId) -> Result<Option<QueueJob>, StorageError> {
        self.store.get(job_id).await
    }

    /// Dead-lettered jobs with their events, oldest first.
    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>, StorageError> {
        let jobs = self.store.list_dead_lettered().await?;
        let mut letters = Vec::with_capacity(jobs.len());
        for job in jobs {
            let event = self.recorder.get(job.event_id).await?;
            letters.push(DeadLetter { job, event });
        }
        Ok(letters)
    }
}
