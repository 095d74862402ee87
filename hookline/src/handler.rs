//! Handler registry and the built-in handlers.
//!
//! Handlers are looked up by `(source, topic)`, falling back to the
//! source-wide handler. Handlers run under at-least-once delivery and must
//! tolerate seeing the same event more than once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use tracing::info;

use crate::config::{Config, HandlerSpec};
use crate::error::HandlerError;
use crate::model::{Payload, WebhookEvent};

/// User-defined processing for one source or topic.
#[async_trait]
pub trait WebhookHandler: Send + Sync {
    async fn handle(&self, event: &WebhookEvent) -> Result<(), HandlerError>;
}

/// Handlers keyed by source and optional topic.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<(String, Option<String>), Arc<dyn WebhookHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for every topic of `source`.
    pub fn register(&mut self, source: impl Into<String>, handler: Arc<dyn WebhookHandler>) {
        self.handlers.insert((source.into(), None), handler);
    }

    /// Register `handler` for one topic of `source`.
    pub fn register_topic(
        &mut self,
        source: impl Into<String>,
        topic: impl Into<String>,
        handler: Arc<dyn WebhookHandler>,
    ) {
        self.handlers
            .insert((source.into(), Some(topic.into())), handler);
    }

    pub fn lookup(&self, source: &str, topic: Option<&str>) -> Option<Arc<dyn WebhookHandler>> {
        if let Some(topic) = topic {
            if let Some(h) = self
                .handlers
                .get(&(source.to_string(), Some(topic.to_string())))
            {
                return Some(h.clone());
            }
        }
        self.handlers.get(&(source.to_string(), None)).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Build the registry described by each source's `HANDLER` and `TOPICS`.
    pub fn from_config(config: &Config, client: Client) -> Self {
        let mut registry = Self::new();
        for source in config.sources.values() {
            let handler: Arc<dyn WebhookHandler> = match &source.handler {
                HandlerSpec::Log => Arc::new(LogHandler),
                HandlerSpec::Forward(url) => Arc::new(ForwardHandler::new(client.clone(), url)),
            };
            match &source.topics {
                Some(topics) => {
                    for topic in topics {
                        registry.register_topic(&source.name, topic, handler.clone());
                    }
                }
                None => registry.register(&source.name, handler),
            }
        }
        registry
    }
}

// =============================================================================
// Log handler
// =============================================================================

/// Logs the payload and succeeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHandler;

#[async_trait]
impl WebhookHandler for LogHandler {
    async fn handle(&self, event: &WebhookEvent) -> Result<(), HandlerError> {
        info!(
            event_id = %event.id,
            source = %event.source,
            topic = ?event.topic,
            payload = %event
                .payload
                .parsed
                .as_ref()
                .map(|v| v.to_string())
                .unwrap_or_else(|| String::from_utf8_lossy(&event.payload.raw).into_owned()),
            "webhook_processed"
        );
        Ok(())
    }
}

// =============================================================================
// Forward handler
// =============================================================================

/// Relays the raw body to a downstream URL.
///
/// 2xx succeeds, 408/429/5xx and transport errors are retryable (honouring
/// `Retry-After` in seconds), any other status is fatal.
#[derive(Debug, Clone)]
pub struct ForwardHandler {
    client: Client,
    url: String,
}

impl ForwardHandler {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// The sender's declared content type, or a guess from the parsed body.
fn forward_content_type(payload: &Payload) -> &str {
    match (&payload.content_type, &payload.parsed) {
        (Some(declared), _) => declared,
        (None, Some(_)) => "application/json",
        (None, None) => "application/octet-stream",
    }
}

#[async_trait]
impl WebhookHandler for ForwardHandler {
    async fn handle(&self, event: &WebhookEvent) -> Result<(), HandlerError> {
        let content_type = forward_content_type(&event.payload);

        let mut request = self
            .client
            .post(&self.url)
            .header(header::CONTENT_TYPE, content_type)
            .header("Idempotency-Key", event.id.to_string())
            .header("X-Webhook-Source", event.source.as_str())
            .body(event.payload.raw.clone());
        if let Some(topic) = &event.topic {
            request = request.header("X-Webhook-Topic", topic.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| HandlerError::retryable(format!("forward to {} failed: {e}", self.url)))?;

        let status = response.status();
        info!(
            event_id = %event.id,
            url = %self.url,
            status = status.as_u16(),
            "webhook_forwarded"
        );

        if status.is_success() {
            Ok(())
        } else if status.is_server_error()
            || status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
        {
            Err(HandlerError::Retryable {
                reason: format!("downstream responded {status}"),
                retry_after: retry_after(&response),
            })
        } else {
            Err(HandlerError::Fatal(format!("downstream responded {status}")))
        }
    }
}
