//! Storage seams for events and jobs.
//!
//! Every method is a single atomic step against the backing store: the
//! idempotency check-and-insert, the lease claim and the fenced
//! ack/nack/dead-letter transitions never span two calls. The in-memory
//! implementations hold one lock per operation to get the same guarantee.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::clock::to_chrono;
use crate::error::StorageError;
use crate::model::{
    AttemptRecord, DeadLetterReason, EventId, EventStatus, JobId, JobState, LeaseId, QueueJob,
    WebhookEvent,
};

/// Result of an idempotent insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(EventId),
    /// A live record already holds the idempotency key.
    Duplicate(EventId),
}

/// Counts from a retention sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PruneStats {
    pub events_removed: usize,
    pub keys_expired: usize,
}

/// Persistence for webhook events, keyed by id and by idempotency key.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert `event` unless its idempotency key was seen within `window`
    /// of `event.received_at`.
    async fn insert_if_absent(
        &self,
        event: WebhookEvent,
        window: Duration,
    ) -> Result<InsertOutcome, StorageError>;

    async fn get(&self, id: EventId) -> Result<Option<WebhookEvent>, StorageError>;

    async fn set_status(&self, id: EventId, status: EventStatus) -> Result<(), StorageError>;

    async fn list_failed(&self) -> Result<Vec<WebhookEvent>, StorageError>;

    /// Remove succeeded events received before `events_before` and forget
    /// idempotency keys first seen before `keys_before`.
    async fn prune(
        &self,
        events_before: DateTime<Utc>,
        keys_before: DateTime<Utc>,
    ) -> Result<PruneStats, StorageError>;
}

/// Persistence for queue jobs.
///
/// Transitions that take a [`LeaseId`] return `Ok(None)` without changing
/// anything when the job is no longer leased under that id.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a job for `event_id`, or return the live job already holding it.
    async fn enqueue(&self, event_id: EventId, now: DateTime<Utc>) -> Result<JobId, StorageError>;

    /// Lease up to `max` jobs that are ready or whose lease has expired.
    async fn claim(
        &self,
        worker_id: &str,
        max: usize,
        now: DateTime<Utc>,
        visibility: Duration,
    ) -> Result<Vec<QueueJob>, StorageError>;

    /// Remove a leased job.
    async fn complete(
        &self,
        job_id: JobId,
        lease_id: LeaseId,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueJob>, StorageError>;

    /// Return a leased job to `Ready` once `delay` has passed, remembering
    /// `delay` as the job's `last_delay`.
    async fn reschedule(
        &self,
        job_id: JobId,
        lease_id: LeaseId,
        delay: Duration,
        error: String,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueJob>, StorageError>;

    /// Move a leased job to dead-letter.
    async fn bury(
        &self,
        job_id: JobId,
        lease_id: LeaseId,
        reason: DeadLetterReason,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueJob>, StorageError>;

    async fn get(&self, job_id: JobId) -> Result<Option<QueueJob>, StorageError>;

    async fn list_dead_lettered(&self) -> Result<Vec<QueueJob>, StorageError>;
}

// =============================================================================
// In-memory event store
// =============================================================================

#[derive(Default)]
struct EventTable {
    events: HashMap<EventId, WebhookEvent>,
    /// Idempotency key → (event, first seen).
    keys: HashMap<String, (EventId, DateTime<Utc>)>,
}

/// Event store held in process memory.
#[derive(Default)]
pub struct MemoryEventStore {
    inner: Mutex<EventTable>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.events.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn insert_if_absent(
        &self,
        event: WebhookEvent,
        window: Duration,
    ) -> Result<InsertOutcome, StorageError> {
        let mut table = self.inner.lock().await;

        if let Some((existing, seen_at)) = table.keys.get(&event.idempotency_key) {
            let live = *seen_at + to_chrono(window) > event.received_at;
            if live && table.events.contains_key(existing) {
                return Ok(InsertOutcome::Duplicate(*existing));
            }
        }

        let id = event.id;
        table
            .keys
            .insert(event.idempotency_key.clone(), (id, event.received_at));
        table.events.insert(id, event);
        Ok(InsertOutcome::Inserted(id))
    }

    async fn get(&self, id: EventId) -> Result<Option<WebhookEvent>, StorageError> {
        Ok(self.inner.lock().await.events.get(&id).cloned())
    }

    async fn set_status(&self, id: EventId, status: EventStatus) -> Result<(), StorageError> {
        let mut table = self.inner.lock().await;
        match table.events.get_mut(&id) {
            Some(event) => {
                event.status = status;
                Ok(())
            }
            None => Err(StorageError::NotFound(format!("event {id}"))),
        }
    }

    async fn list_failed(&self) -> Result<Vec<WebhookEvent>, StorageError> {
        let table = self.inner.lock().await;
        let mut failed: Vec<WebhookEvent> = table
            .events
            .values()
            .filter(|e| matches!(e.status, EventStatus::Failed { .. }))
            .cloned()
            .collect();
        failed.sort_by_key(|e| e.received_at);
        Ok(failed)
    }

    async fn prune(
        &self,
        events_before: DateTime<Utc>,
        keys_before: DateTime<Utc>,
    ) -> Result<PruneStats, StorageError> {
        let mut table = self.inner.lock().await;

        let before = table.events.len();
        table
            .events
            .retain(|_, e| !(e.status == EventStatus::Succeeded && e.received_at < events_before));
        let events_removed = before - table.events.len();

        let before = table.keys.len();
        table.keys.retain(|_, (_, seen_at)| *seen_at >= keys_before);
        let keys_expired = before - table.keys.len();

        Ok(PruneStats {
            events_removed,
            keys_expired,
        })
    }
}

// =============================================================================
// In-memory job store
// =============================================================================

#[derive(Default)]
struct JobTable {
    jobs: HashMap<JobId, QueueJob>,
    /// Event → its live (non-dead-lettered) job.
    live: HashMap<EventId, JobId>,
}

impl JobTable {
    /// Mutable access to a job only if it is leased under `lease_id`.
    fn leased_mut(&mut self, job_id: JobId, lease_id: LeaseId) -> Option<&mut QueueJob> {
        self.jobs
            .get_mut(&job_id)
            .filter(|job| job.lease_id() == Some(lease_id))
    }
}

/// Job store held in process memory.
#[derive(Default)]
pub struct MemoryJobStore {
    inner: Mutex<JobTable>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn finish_attempt(job: &mut QueueJob, now: DateTime<Utc>, error: Option<String>) {
    if let Some(record) = job.history.last_mut() {
        if record.finished_at.is_none() {
            record.finished_at = Some(now);
            record.error = error;
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(&self, event_id: EventId, now: DateTime<Utc>) -> Result<JobId, StorageError> {
        let mut table = self.inner.lock().await;

        if let Some(job_id) = table.live.get(&event_id) {
            return Ok(*job_id);
        }

        let job = QueueJob::new(event_id, now);
        let job_id = job.id;
        table.live.insert(event_id, job_id);
        table.jobs.insert(job_id, job);
        Ok(job_id)
    }

    async fn claim(
        &self,
        worker_id: &str,
        max: usize,
        now: DateTime<Utc>,
        visibility: Duration,
    ) -> Result<Vec<QueueJob>, StorageError> {
        let mut table = self.inner.lock().await;

        let mut eligible: Vec<(DateTime<Utc>, DateTime<Utc>, JobId)> = table
            .jobs
            .values()
            .filter(|job| match &job.state {
                JobState::Ready => job.available_at <= now,
                JobState::Leased { deadline, .. } => *deadline <= now,
                JobState::DeadLettered { .. } => false,
            })
            .map(|job| (job.available_at, job.enqueued_at, job.id))
            .collect();
        eligible.sort();
        eligible.truncate(max);

        let deadline = now + to_chrono(visibility);
        let mut claimed = Vec::with_capacity(eligible.len());
        for (_, _, job_id) in eligible {
            let Some(job) = table.jobs.get_mut(&job_id) else {
                continue;
            };
            if matches!(job.state, JobState::Leased { .. }) {
                finish_attempt(job, now, Some("lease expired".to_string()));
            }
            job.attempt += 1;
            job.state = JobState::Leased {
                lease_id: LeaseId::new(),
                worker_id: worker_id.to_string(),
                deadline,
            };
            job.history.push(AttemptRecord {
                attempt: job.attempt,
                worker_id: worker_id.to_string(),
                leased_at: now,
                finished_at: None,
                error: None,
            });
            claimed.push(job.clone());
        }

        Ok(claimed)
    }

    async fn complete(
        &self,
        job_id: JobId,
        lease_id: LeaseId,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueJob>, StorageError> {
        let mut table = self.inner.lock().await;

        let Some(job) = table.leased_mut(job_id, lease_id) else {
            return Ok(None);
        };
        finish_attempt(job, now, None);
        let event_id = job.event_id;

        table.live.remove(&event_id);
        Ok(table.jobs.remove(&job_id))
    }

    async fn reschedule(
        &self,
        job_id: JobId,
        lease_id: LeaseId,
        delay: Duration,
        error: String,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueJob>, StorageError> {
        let mut table = self.inner.lock().await;

        let Some(job) = table.leased_mut(job_id, lease_id) else {
            return Ok(None);
        };
        finish_attempt(job, now, Some(error));
        job.state = JobState::Ready;
        job.available_at = now + to_chrono(delay);
        job.last_delay = Some(delay);
        Ok(Some(job.clone()))
    }

    async fn bury(
        &self,
        job_id: JobId,
        lease_id: LeaseId,
        reason: DeadLetterReason,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueJob>, StorageError> {
        let mut table = self.inner.lock().await;

        let Some(job) = table.leased_mut(job_id, lease_id) else {
            return Ok(None);
        };
        finish_attempt(job, now, Some(reason.describe().to_string()));
        job.state = JobState::DeadLettered { reason };
        let job = job.clone();

        table.live.remove(&job.event_id);
        Ok(Some(job))
    }

    async fn get(&self, job_id: JobId) -> Result<Option<QueueJob>, StorageError> {
        Ok(self.inner.lock().await.jobs.get(&job_id).cloned())
    }

    async fn list_dead_lettered(&self) -> Result<Vec<QueueJob>, StorageError> {
        let table = self.inner.lock().await;
        let mut dead: Vec<QueueJob> = table
            .jobs
            .values()
            .filter(|job| job.is_dead_lettered())
            .cloned()
            .collect();
        dead.sort_by_key(|job| job.enqueued_at);
        Ok(dead)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::model::Payload;

    fn event(key: &str, received_at: DateTime<Utc>) -> WebhookEvent {
        WebhookEvent {
            id: EventId::new(),
            source: "default".to_string(),
            topic: None,
            idempotency_key: key.to_string(),
            headers: BTreeMap::new(),
            payload: Payload::from_raw(b"{}".to_vec(), None),
            received_at,
            status: EventStatus::Pending,
        }
    }

    const WINDOW: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_insert_collapses_duplicate_key_within_window() {
        let store = MemoryEventStore::new();
        let now = Utc::now();

        let first = store.insert_if_absent(event("k", now), WINDOW).await.unwrap();
        let second = store
            .insert_if_absent(event("k", now + chrono::Duration::seconds(10)), WINDOW)
            .await
            .unwrap();

        let InsertOutcome::Inserted(id) = first else {
            panic!("Expected Inserted, got {:?}", first);
        };
        assert_eq!(second, InsertOutcome::Duplicate(id));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_insert_after_window_creates_new_event() {
        let store = MemoryEventStore::new();
        let now = Utc::now();

        store.insert_if_absent(event("k", now), WINDOW).await.unwrap();
        let later = store
            .insert_if_absent(event("k", now + chrono::Duration::seconds(61)), WINDOW)
            .await
            .unwrap();

        assert!(matches!(later, InsertOutcome::Inserted(_)));
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_concurrent_duplicates_insert_once() {
        let store = std::sync::Arc::new(MemoryEventStore::new());
        let now = Utc::now();

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(
                    async move { store.insert_if_absent(event("same", now), WINDOW).await },
                )
            })
            .collect();

        let mut inserted = 0;
        for task in tasks {
            if let InsertOutcome::Inserted(_) = task.await.unwrap().unwrap() {
                inserted += 1;
            }
        }
        assert_eq!(inserted, 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_set_status_missing_event() {
        let store = MemoryEventStore::new();
        let result = store.set_status(EventId::new(), EventStatus::Succeeded).await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_prune_keeps_failed_and_recent_events() {
        let store = MemoryEventStore::new();
        let old = Utc::now() - chrono::Duration::days(40);

        let done = event("done", old);
        let done_id = done.id;
        let mut failed = event("failed", old);
        failed.status = EventStatus::Failed {
            attempts: 5,
            last_error: "boom".to_string(),
        };
        let failed_id = failed.id;
        store.insert_if_absent(done, WINDOW).await.unwrap();
        store.insert_if_absent(failed, WINDOW).await.unwrap();
        store.set_status(done_id, EventStatus::Succeeded).await.unwrap();

        let cutoff = Utc::now() - chrono::Duration::days(30);
        let stats = store.prune(cutoff, cutoff).await.unwrap();

        assert_eq!(stats.events_removed, 1);
        assert_eq!(stats.keys_expired, 2);
        assert!(store.get(done_id).await.unwrap().is_none());
        assert!(store.get(failed_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent_per_event() {
        let store = MemoryJobStore::new();
        let event_id = EventId::new();
        let now = Utc::now();

        let first = store.enqueue(event_id, now).await.unwrap();
        let second = store.enqueue(event_id, now).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_until_deadline() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        store.enqueue(EventId::new(), now).await.unwrap();

        let visibility = Duration::from_secs(30);
        let a = store.claim("a", 10, now, visibility).await.unwrap();
        let b = store.claim("b", 10, now, visibility).await.unwrap();
        assert_eq!(a.len(), 1);
        assert!(b.is_empty());

        let later = now + chrono::Duration::seconds(31);
        let c = store.claim("c", 10, later, visibility).await.unwrap();
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].attempt, 2);
        assert_eq!(c[0].history[0].error.as_deref(), Some("lease expired"));
    }

    #[tokio::test]
    async fn test_stale_lease_cannot_complete() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        store.enqueue(EventId::new(), now).await.unwrap();

        let visibility = Duration::from_secs(30);
        let first = store.claim("a", 1, now, visibility).await.unwrap().remove(0);
        let later = now + chrono::Duration::seconds(31);
        let second = store.claim("b", 1, later, visibility).await.unwrap().remove(0);

        let stale = store
            .complete(first.id, first.lease_id().unwrap(), later)
            .await
            .unwrap();
        assert!(stale.is_none());

        let fresh = store
            .complete(second.id, second.lease_id().unwrap(), later)
            .await
            .unwrap();
        assert!(fresh.is_some());
        assert!(store.get(second.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_orders_by_availability() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let first = store.enqueue(EventId::new(), now).await.unwrap();
        let second = store
            .enqueue(EventId::new(), now + chrono::Duration::milliseconds(1))
            .await
            .unwrap();

        let later = now + chrono::Duration::seconds(1);
        let claimed = store
            .claim("w", 10, later, Duration::from_secs(30))
            .await
            .unwrap();
        let ids: Vec<JobId> = claimed.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![first, second]);
    }

    #[tokio::test]
    async fn test_reschedule_remembers_delay() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        store.enqueue(EventId::new(), now).await.unwrap();

        let job = store
            .claim("w", 1, now, Duration::from_secs(30))
            .await
            .unwrap()
            .remove(0);
        let delay = Duration::from_secs(90);
        let ready = store
            .reschedule(job.id, job.lease_id().unwrap(), delay, "503".to_string(), now)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(ready.state, JobState::Ready);
        assert_eq!(ready.available_at, now + chrono::Duration::seconds(90));
        assert_eq!(ready.last_delay, Some(delay));
        assert_eq!(ready.history[0].error.as_deref(), Some("503"));
    }

    #[tokio::test]
    async fn test_bury_frees_event_for_new_job() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let event_id = EventId::new();
        let job_id = store.enqueue(event_id, now).await.unwrap();

        let job = store
            .claim("w", 1, now, Duration::from_secs(30))
            .await
            .unwrap()
            .remove(0);
        let reason = DeadLetterReason::Fatal {
            reason: "no handler".to_string(),
        };
        store
            .bury(job.id, job.lease_id().unwrap(), reason, now)
            .await
            .unwrap();

        let dead = store.list_dead_lettered().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].history[0].error.as_deref(), Some("no handler"));

        let replay = store.enqueue(event_id, now).await.unwrap();
        assert_ne!(replay, job_id);
    }
}
