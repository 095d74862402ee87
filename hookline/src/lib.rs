//! Hookline - webhook intake with verified, idempotent, at-least-once processing.
//!
//! ## Architecture
//!
//! ```text
//! POST /webhook/{source} → verify → record (idempotent) → enqueue → 200
//!                                                            │
//!                       worker pool ← lease ─────────────────┘
//!                           │
//!                           └→ handler → ack | nack (backoff) | dead-letter
//! ```
//!
//! Storage sits behind [`store::EventStore`] and [`store::JobStore`]; the
//! binary wires the in-memory implementations.

pub mod clock;
pub mod config;
pub mod error;
pub mod handler;
pub mod model;
pub mod processor;
pub mod queue;
pub mod recorder;
pub mod store;
pub mod web;
pub mod worker;

// Re-export commonly used types
pub use config::{Config, SigningScheme, SourceConfig};
pub use error::{ConfigError, HandlerError, StorageError};
pub use handler::{HandlerRegistry, WebhookHandler};
pub use model::{EventId, EventStatus, QueueJob, WebhookEvent};
pub use processor::{JobProcessor, Outcome};
pub use queue::{DispatchQueue, RetryPolicy};
pub use recorder::WebhookRecorder;
pub use web::AppState;
