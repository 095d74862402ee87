//! Records shared by the recorder, the dispatch queue and the processor.
//!
//! ## Lifecycle
//!
//! ```text
//! WebhookEvent: Pending → Processing → Succeeded
//!                  ↑          │
//!                  └──────────┴──→ Failed { attempts, last_error }
//!                                  (dead-letter)
//!
//! QueueJob:     Ready → Leased → (acked: removed) | Ready (nack) | DeadLettered
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

id_type!(
    /// Identifier assigned to a webhook event when it is first recorded.
    EventId
);
id_type!(
    /// Identifier of a unit of work in the dispatch queue.
    JobId
);
id_type!(
    /// Fencing token for one lease of one job.
    LeaseId
);

/// Processing status of a recorded event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Processing,
    Succeeded,
    Failed { attempts: u32, last_error: String },
}

impl EventStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Succeeded | EventStatus::Failed { .. })
    }
}

/// Request body as received, plus a best-effort JSON view of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Exact bytes the signature was computed over.
    #[serde(serialize_with = "to_base64", deserialize_with = "from_base64")]
    pub raw: Vec<u8>,
    pub parsed: Option<serde_json::Value>,
    /// `Content-Type` the sender declared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

impl Payload {
    /// Wrap raw bytes, parsing JSON or form fields when the content type
    /// allows it.
    ///
    /// A missing content type is treated as possibly-JSON; any other type is
    /// left unparsed. Form fields become a JSON object of strings, the last
    /// value winning for repeated names.
    pub fn from_raw(raw: Vec<u8>, content_type: Option<&str>) -> Self {
        let kind = content_type.map(str::to_ascii_lowercase);
        let parsed = match kind.as_deref() {
            None => serde_json::from_slice(&raw).ok(),
            Some(ct) if ct.contains("json") => serde_json::from_slice(&raw).ok(),
            Some(ct) if ct.starts_with("application/x-www-form-urlencoded") => parse_form(&raw),
            Some(_) => None,
        };
        Self {
            raw,
            parsed,
            content_type: content_type.map(str::to_string),
        }
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

fn parse_form(raw: &[u8]) -> Option<serde_json::Value> {
    let fields: Vec<(String, String)> = serde_urlencoded::from_bytes(raw).ok()?;
    let object = fields
        .into_iter()
        .map(|(name, value)| (name, serde_json::Value::String(value)))
        .collect();
    Some(serde_json::Value::Object(object))
}

fn to_base64<S: Serializer>(raw: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(raw))
}

fn from_base64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(serde::de::Error::custom)
}

/// One received webhook call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: EventId,
    /// Which configured source sent it.
    pub source: String,
    /// Routing key within the source, when one could be extracted.
    pub topic: Option<String>,
    /// Namespaced key used to collapse duplicate deliveries.
    pub idempotency_key: String,
    /// Allow-listed headers only, names lower-cased.
    pub headers: BTreeMap<String, String>,
    pub payload: Payload,
    pub received_at: DateTime<Utc>,
    pub status: EventStatus,
}

/// Where a job sits in the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for `available_at`.
    Ready,
    /// Claimed by a worker until `deadline`.
    Leased {
        lease_id: LeaseId,
        worker_id: String,
        deadline: DateTime<Utc>,
    },
    /// Terminal; kept for inspection.
    DeadLettered { reason: DeadLetterReason },
}

/// Why a job was moved to dead-letter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// Retryable failures used up the attempt budget.
    RetriesExhausted { attempts: u32, last_error: String },
    /// The handler (or routing) reported a failure retrying cannot fix.
    Fatal { reason: String },
}

impl DeadLetterReason {
    pub fn describe(&self) -> &str {
        match self {
            DeadLetterReason::RetriesExhausted { last_error, .. } => last_error,
            DeadLetterReason::Fatal { reason } => reason,
        }
    }
}

/// Outcome of one leased attempt, kept for operator inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub worker_id: String,
    pub leased_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// `None` while in flight or when the lease expired unacknowledged.
    pub error: Option<String>,
}

/// Durable unit of work referencing one event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueJob {
    pub id: JobId,
    pub event_id: EventId,
    /// Number of times the job has been leased.
    pub attempt: u32,
    pub available_at: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
    pub state: JobState,
    pub history: Vec<AttemptRecord>,
    /// Delay applied by the most recent reschedule; the next one never
    /// goes below it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_delay: Option<Duration>,
}

impl QueueJob {
    pub fn new(event_id: EventId, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            event_id,
            attempt: 0,
            available_at: now,
            enqueued_at: now,
            state: JobState::Ready,
            history: Vec::new(),
            last_delay: None,
        }
    }

    /// Lease id if the job is currently leased.
    pub fn lease_id(&self) -> Option<LeaseId> {
        match &self.state {
            JobState::Leased { lease_id, .. } => Some(*lease_id),
            _ => None,
        }
    }

    pub fn is_dead_lettered(&self) -> bool {
        matches!(self.state, JobState::DeadLettered { .. })
    }
}

/// A dead-lettered job joined with its event, as shown to operators.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub job: QueueJob,
    pub event: Option<WebhookEvent>,
}
