//! HTTP endpoints.
//!
//! The ingestion path only verifies, records and enqueues, all under
//! `Config::ingest_timeout`. Processing happens in the worker pool and the
//! response never waits on it.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::DEFAULT_SOURCE;
use crate::error::StorageError;
use crate::model::{DeadLetter, EventId, EventStatus, WebhookEvent};
use crate::queue::DispatchQueue;
use crate::recorder::WebhookRecorder;
use crate::web::signature::{verify, InvalidSignature, VerificationResult};
use crate::Config;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub recorder: WebhookRecorder,
    pub queue: DispatchQueue,
}

impl AppState {
    pub fn new(config: Config, recorder: WebhookRecorder, queue: DispatchQueue) -> Self {
        Self {
            config: Arc::new(config),
            recorder,
            queue,
        }
    }
}

/// Build the service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhook/:source", post(webhook))
        .route("/webhook-client", post(webhook_client))
        .route("/dead-letters", get(dead_letters))
        .route("/events/:id", get(event_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// =============================================================================
// Health Check
// =============================================================================

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// =============================================================================
// Ingestion
// =============================================================================

/// Body of a successful ingestion.
#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub status: &'static str,
    pub id: EventId,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub duplicate: bool,
}

/// Why a delivery was refused.
///
/// Senders only ever see the fixed status bodies; the details are logged.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("unknown source '{0}'")]
    UnknownSource(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(#[from] InvalidSignature),

    #[error("unsupported signing scheme '{0}'")]
    UnsupportedScheme(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("ingestion exceeded {0:?}")]
    Timeout(Duration),
}

impl IngestError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            IngestError::UnknownSource(_) | IngestError::InvalidSignature(_) => {
                StatusCode::UNAUTHORIZED
            }
            IngestError::UnsupportedScheme(_) => StatusCode::FORBIDDEN,
            IngestError::Storage(_) | IngestError::Timeout(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

#[derive(Serialize)]
struct StatusBody {
    status: &'static str,
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = if status.is_server_error() {
            "error"
        } else {
            "invalid_signature"
        };
        (status, Json(StatusBody { status: body })).into_response()
    }
}

/// `POST /webhook/{source}`.
pub async fn webhook(
    State(state): State<AppState>,
    Path(source): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, IngestError> {
    receive(&state, &source, &headers, body).await.map(Json)
}

/// `POST /webhook-client`, the default source's endpoint.
pub async fn webhook_client(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, IngestError> {
    receive(&state, DEFAULT_SOURCE, &headers, body).await.map(Json)
}

async fn receive(
    state: &AppState,
    source: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<WebhookResponse, IngestError> {
    info!(source = %source, body_length = body.len(), "webhook_received");

    let limit = state.config.ingest_timeout;
    let result = match tokio::time::timeout(limit, ingest(state, source, headers, body)).await {
        Ok(result) => result,
        Err(_) => Err(IngestError::Timeout(limit)),
    };

    match &result {
        Ok(response) => info!(
            source = %source,
            event_id = %response.id,
            duplicate = response.duplicate,
            "webhook_accepted"
        ),
        Err(e) if e.status_code().is_server_error() => {
            error!(source = %source, error = %e, "webhook_ingest_failed")
        }
        Err(e) => warn!(source = %source, error = %e, "webhook_rejected"),
    }
    result
}

/// Verify, record, enqueue. Each step short-circuits the response.
async fn ingest(
    state: &AppState,
    source_name: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<WebhookResponse, IngestError> {
    let source = state
        .config
        .source(source_name)
        .ok_or_else(|| IngestError::UnknownSource(source_name.to_string()))?;

    match verify(&body, headers, source) {
        VerificationResult::Valid => {}
        VerificationResult::Invalid(reason) => return Err(reason.into()),
        VerificationResult::Unsupported(scheme) => {
            return Err(IngestError::UnsupportedScheme(scheme))
        }
    }

    let store_headers = state.config.store_headers_for(source);
    let event = state
        .recorder
        .capture(source, store_headers, headers, body.to_vec());
    let recorded = state.recorder.record(event).await?;

    if recorded.is_duplicate {
        // An earlier delivery may have been recorded but failed to enqueue.
        // Enqueue is a no-op while a job for the event is live.
        let pending = matches!(
            state.recorder.get(recorded.id).await?,
            Some(WebhookEvent {
                status: EventStatus::Pending,
                ..
            })
        );
        if pending {
            state.queue.enqueue(recorded.id).await?;
        }
    } else {
        state.queue.enqueue(recorded.id).await?;
    }

    Ok(WebhookResponse {
        status: "accepted",
        id: recorded.id,
        duplicate: recorded.is_duplicate,
    })
}

// =============================================================================
// Inspection
// =============================================================================

#[derive(Serialize)]
pub struct DeadLettersResponse {
    pub count: usize,
    pub dead_letters: Vec<DeadLetter>,
}

/// `GET /dead-letters`: dead-lettered jobs with attempt history.
pub async fn dead_letters(State(state): State<AppState>) -> Response {
    match state.queue.dead_letters().await {
        Ok(dead_letters) => Json(DeadLettersResponse {
            count: dead_letters.len(),
            dead_letters,
        })
        .into_response(),
        Err(e) => {
            error!(error = %e, "dead_letters_list_failed");
            IngestError::Storage(e).into_response()
        }
    }
}

/// `GET /events/{id}`.
pub async fn event_status(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Ok(id) = id.parse::<EventId>() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match state.recorder.get(id).await {
        Ok(Some(event)) => Json(event).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            error!(event_id = %id, error = %e, "event_lookup_failed");
            IngestError::Storage(e).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use chrono::{DateTime, Utc};
    use hmac::{Hmac, Mac};
    use serde_json::Value;
    use sha2::Sha256;
    use tower::ServiceExt;

    use super::*;
    use crate::clock::{Clock, SystemClock};
    use crate::queue::RetryPolicy;
    use crate::store::{
        EventStore, InsertOutcome, MemoryEventStore, MemoryJobStore, PruneStats,
    };

    const SECRET: &str = "s3cret";

    fn sign(body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    fn config(extra: &[(&str, &str)]) -> Config {
        let mut vars: HashMap<String, String> = HashMap::new();
        vars.insert("WEBHOOK_SOURCES".into(), "default,stripe".into());
        vars.insert("WEBHOOK_DEFAULT_SECRET".into(), SECRET.into());
        vars.insert("WEBHOOK_STRIPE_SECRET".into(), SECRET.into());
        for (k, v) in extra {
            vars.insert(k.to_string(), v.to_string());
        }
        Config::from_lookup(|k| vars.get(k).cloned()).unwrap()
    }

    fn state_with(config: Config, store: Arc<dyn EventStore>) -> AppState {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let recorder = WebhookRecorder::new(
            store,
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
        AppState::new(config, recorder, queue)
    }

    fn state() -> (AppState, Arc<MemoryEventStore>) {
        let store = Arc::new(MemoryEventStore::new());
        (state_with(config(&[]), store.clone()), store)
    }

    async fn post_webhook(
        app: &AppState,
        uri: &str,
        body: &str,
        signature: Option<&str>,
    ) -> (StatusCode, Value) {
        let mut request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(signature) = signature {
            request = request.header("Signature", signature);
        }
        let response = router(app.clone())
            .oneshot(request.body(Body::from(body.to_string())).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    async fn get_json(app: &AppState, uri: &str) -> (StatusCode, Value) {
        let response = router(app.clone())
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = state();
        let (status, body) = get_json(&app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_valid_webhook_accepted_and_queued() {
        let (app, store) = state();
        let body = r#"{"type":"invoice.paid"}"#;
        let (status, json) = post_webhook(
            &app,
            "/webhook/stripe",
            body,
            Some(&sign(body.as_bytes())),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "accepted");
        assert!(json.get("duplicate").is_none());
        assert_eq!(store.len().await, 1);
        assert_eq!(app.queue.lease("w", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_legacy_route_uses_default_source() {
        let (app, _) = state();
        let body = r#"{"hello":"world"}"#;
        let (status, json) = post_webhook(
            &app,
            "/webhook-client",
            body,
            Some(&sign(body.as_bytes())),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let id: EventId = json["id"].as_str().unwrap().parse().unwrap();
        let event = app.recorder.get(id).await.unwrap().unwrap();
        assert_eq!(event.source, "default");
    }

    #[tokio::test]
    async fn test_invalid_signature_rejected_without_record() {
        let (app, store) = state();
        let body = r#"{"type":"invoice.paid"}"#;

        let (status, json) = post_webhook(&app, "/webhook/stripe", body, Some("deadbeef")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json, serde_json::json!({"status": "invalid_signature"}));

        let (status, _) = post_webhook(&app, "/webhook/stripe", body, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_unknown_source_rejected() {
        let (app, store) = state();
        let body = "{}";
        let (status, json) = post_webhook(
            &app,
            "/webhook/github",
            body,
            Some(&sign(body.as_bytes())),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["status"], "invalid_signature");
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_unsupported_scheme_forbidden() {
        let store = Arc::new(MemoryEventStore::new());
        let app = state_with(config(&[("WEBHOOK_STRIPE_SCHEME", "rsa-pss")]), store.clone());
        let body = "{}";
        let (status, json) = post_webhook(
            &app,
            "/webhook/stripe",
            body,
            Some(&sign(body.as_bytes())),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(json["status"], "invalid_signature");
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_not_requeued() {
        let (app, store) = state();
        let body = r#"{"id":"evt_1"}"#;
        let signature = sign(body.as_bytes());

        let (_, first) = post_webhook(&app, "/webhook/stripe", body, Some(&signature)).await;
        let (status, second) = post_webhook(&app, "/webhook/stripe", body, Some(&signature)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(second["duplicate"], true);
        assert_eq!(first["id"], second["id"]);
        assert_eq!(store.len().await, 1);
        assert_eq!(app.queue.lease("w", 10).await.unwrap().len(), 1);
    }

    struct BrokenStore;

    #[async_trait]
    impl EventStore for BrokenStore {
        async fn insert_if_absent(
            &self,
            _event: WebhookEvent,
            _window: Duration,
        ) -> Result<InsertOutcome, StorageError> {
            Err(StorageError::Unavailable("disk on fire".into()))
        }
        async fn get(&self, _id: EventId) -> Result<Option<WebhookEvent>, StorageError> {
            Err(StorageError::Unavailable("disk on fire".into()))
        }
        async fn set_status(&self, _id: EventId, _status: EventStatus) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("disk on fire".into()))
        }
        async fn list_failed(&self) -> Result<Vec<WebhookEvent>, StorageError> {
            Err(StorageError::Unavailable("disk on fire".into()))
        }
        async fn prune(
            &self,
            _events_before: DateTime<Utc>,
            _keys_before: DateTime<Utc>,
        ) -> Result<PruneStats, StorageError> {
            Err(StorageError::Unavailable("disk on fire".into()))
        }
    }

    struct StalledStore;

    #[async_trait]
    impl EventStore for StalledStore {
        async fn insert_if_absent(
            &self,
            event: WebhookEvent,
            _window: Duration,
        ) -> Result<InsertOutcome, StorageError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(InsertOutcome::Inserted(event.id))
        }
        async fn get(&self, _id: EventId) -> Result<Option<WebhookEvent>, StorageError> {
            Ok(None)
        }
        async fn set_status(&self, _id: EventId, _status: EventStatus) -> Result<(), StorageError> {
            Ok(())
        }
        async fn list_failed(&self) -> Result<Vec<WebhookEvent>, StorageError> {
            Ok(Vec::new())
        }
        async fn prune(
            &self,
            _events_before: DateTime<Utc>,
            _keys_before: DateTime<Utc>,
        ) -> Result<PruneStats, StorageError> {
            Ok(PruneStats::default())
        }
    }

    #[tokio::test]
    async fn test_storage_failure_is_500_without_detail() {
        let app = state_with(config(&[]), Arc::new(BrokenStore));
        let body = "{}";
        let (status, json) = post_webhook(
            &app,
            "/webhook/stripe",
            body,
            Some(&sign(body.as_bytes())),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json, serde_json::json!({"status": "error"}));
    }

    #[tokio::test]
    async fn test_slow_storage_times_out() {
        let app = state_with(config(&[("INGEST_TIMEOUT_MS", "50")]), Arc::new(StalledStore));
        let body = "{}";
        let (status, json) = post_webhook(
            &app,
            "/webhook/stripe",
            body,
            Some(&sign(body.as_bytes())),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["status"], "error");
    }

    #[tokio::test]
    async fn test_event_status_and_dead_letters() {
        let (app, _) = state();
        let body = r#"{"n":1}"#;
        let (_, json) = post_webhook(
            &app,
            "/webhook/stripe",
            body,
            Some(&sign(body.as_bytes())),
        )
        .await;
        let id = json["id"].as_str().unwrap().to_string();

        let (status, event) = get_json(&app, &format!("/events/{id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(event["status"]["state"], "pending");

        let (status, _) = get_json(&app, "/events/not-a-uuid").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let job = app.queue.lease("w", 1).await.unwrap().remove(0);
        app.queue.dead_letter(&job, "no handler").await.unwrap();

        let (status, letters) = get_json(&app, "/dead-letters").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(letters["count"], 1);
        assert_eq!(letters["dead_letters"][0]["event"]["id"], id.as_str());
    }
}
