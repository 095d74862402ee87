//! Web server module.
//!
//! This module provides the HTTP surface of the pipeline:
//! - `POST /webhook/{source}` (and the `/webhook-client` alias) verify,
//!   record and enqueue a delivery, then answer immediately
//! - `GET /dead-letters` and `GET /events/{id}` for operators
//! - `GET /health`
//!
//! Processing happens in the worker pool, never on the request path.

pub mod handlers;
pub mod signature;

pub use handlers::{router, AppState, IngestError, WebhookResponse};
pub use signature::{verify, verify_at, InvalidSignature, VerificationResult};
