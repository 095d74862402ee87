//! Webhook recorder: turns a verified request into an immutable
//! [`WebhookEvent`] and stores it exactly once per idempotency key.
//!
//! The recorder is also the only component that writes event status; the
//! queue and processor report outcomes through [`WebhookRecorder::transition`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderMap};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::clock::{to_chrono, Clock};
use crate::config::{SigningScheme, SourceConfig};
use crate::error::StorageError;
use crate::model::{EventId, EventStatus, Payload, WebhookEvent};
use crate::store::{EventStore, InsertOutcome, PruneStats};

/// Fallback header for sender-supplied idempotency keys.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Headers that are never persisted, whatever the allow-list says.
const NEVER_STORED: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "cookie",
    "webhook-signature",
];

/// Result of [`WebhookRecorder::record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordResult {
    pub id: EventId,
    pub is_duplicate: bool,
}

/// Owns the `WebhookEvent` lifecycle.
#[derive(Clone)]
pub struct WebhookRecorder {
    store: Arc<dyn EventStore>,
    clock: Arc<dyn Clock>,
    idempotency_window: Duration,
    retention: Duration,
}

impl WebhookRecorder {
    pub fn new(
        store: Arc<dyn EventStore>,
        clock: Arc<dyn Clock>,
        idempotency_window: Duration,
        retention: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            idempotency_window,
            retention,
        }
    }

    /// Build the event for a verified request. Does not touch storage.
    pub fn capture(
        &self,
        source: &SourceConfig,
        store_headers: &[String],
        headers: &HeaderMap,
        body: Vec<u8>,
    ) -> WebhookEvent {
        let content_type = header_str(headers, header::CONTENT_TYPE.as_str());
        let payload = Payload::from_raw(body, content_type);
        let idempotency_key = idempotency_key(source, headers, &payload.raw);
        let topic = extract_topic(source, headers, &payload);

        WebhookEvent {
            id: EventId::new(),
            source: source.name.clone(),
            topic,
            idempotency_key,
            headers: filter_headers(source, store_headers, headers),
            payload,
            received_at: self.clock.now(),
            status: EventStatus::Pending,
        }
    }

    /// Persist `event` unless a live record already holds its idempotency key.
    pub async fn record(&self, event: WebhookEvent) -> Result<RecordResult, StorageError> {
        let source = event.source.clone();
        let size = event.payload.len();

        match self
            .store
            .insert_if_absent(event, self.idempotency_window)
            .await?
        {
            InsertOutcome::Inserted(id) => {
                info!(event_id = %id, source = %source, payload_size = size, "event_recorded");
                Ok(RecordResult {
                    id,
                    is_duplicate: false,
                })
            }
            InsertOutcome::Duplicate(id) => {
                info!(event_id = %id, source = %source, "event_duplicate");
                Ok(RecordResult {
                    id,
                    is_duplicate: true,
                })
            }
        }
    }

    pub async fn get(&self, id: EventId) -> Result<Option<WebhookEvent>, StorageError> {
        self.store.get(id).await
    }

    /// Move an event to a new status.
    pub async fn transition(&self, id: EventId, status: EventStatus) -> Result<(), StorageError> {
        debug!(event_id = %id, status = ?status, "event_status_changed");
        self.store.set_status(id, status).await
    }

    pub async fn list_failed(&self) -> Result<Vec<WebhookEvent>, StorageError> {
        self.store.list_failed().await
    }

    /// Drop succeeded events past retention and idempotency keys past the window.
    pub async fn prune_expired(&self) -> Result<PruneStats, StorageError> {
        let now = self.clock.now();
        let stats = self
            .store
            .prune(
                now - to_chrono(self.retention),
                now - to_chrono(self.idempotency_window),
            )
            .await?;
        info!(
            events_removed = stats.events_removed,
            keys_expired = stats.keys_expired,
            "retention_sweep_complete"
        );
        Ok(stats)
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Key that identifies one logical delivery from `source`.
///
/// Uses the sender's delivery id when present, otherwise a SHA-256 of the
/// source name and body.
pub fn idempotency_key(source: &SourceConfig, headers: &HeaderMap, body: &[u8]) -> String {
    let provided = source
        .idempotency_header
        .as_deref()
        .and_then(|name| header_str(headers, name))
        .or_else(|| header_str(headers, IDEMPOTENCY_KEY_HEADER))
        .or_else(|| match source.scheme {
            SigningScheme::StandardWebhooks => header_str(headers, "webhook-id"),
            _ => None,
        });

    match provided {
        Some(key) => format!("{}:{}", source.name, key),
        None => {
            let mut hasher = Sha256::new();
            hasher.update(source.name.as_bytes());
            hasher.update([0u8]);
            hasher.update(body);
            format!("{}:sha256:{}", source.name, hex::encode(hasher.finalize()))
        }
    }
}

fn extract_topic(source: &SourceConfig, headers: &HeaderMap, payload: &Payload) -> Option<String> {
    if let Some(topic) = source
        .topic_header
        .as_deref()
        .and_then(|name| header_str(headers, name))
    {
        return Some(topic.to_string());
    }

    let field = source.topic_field.as_deref()?;
    payload
        .parsed
        .as_ref()?
        .get(field)?
        .as_str()
        .map(str::to_string)
}

/// Keep only allow-listed headers, never the signature or credentials.
fn filter_headers(
    source: &SourceConfig,
    allow: &[String],
    headers: &HeaderMap,
) -> BTreeMap<String, String> {
    let allow_all = allow.iter().any(|h| h == "*");
    let signature_header = source.signature_header.to_ascii_lowercase();

    headers
        .iter()
        .filter_map(|(name, value)| {
            let name = name.as_str();
            if name == signature_header || NEVER_STORED.contains(&name) {
                return None;
            }
            if !allow_all && !allow.iter().any(|h| h.eq_ignore_ascii_case(name)) {
                return None;
            }
            let value = value.to_str().ok()?;
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}
