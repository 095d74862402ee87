//! Error taxonomy shared by the recorder, queue and processor.
//!
//! Verification failures are not errors here: the verifier returns a
//! [`VerificationResult`](crate::web::signature::VerificationResult) value.

use std::time::Duration;

use thiserror::Error;

/// Failure of the underlying event or job storage.
///
/// Always transient from the sender's point of view: the ingestion endpoint
/// maps it to a 5xx so the sender retries delivery.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("storage operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("record not found: {0}")]
    NotFound(String),
}

/// Error reported by a registered webhook handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler may succeed if tried again later.
    #[error("retryable handler failure: {reason}")]
    Retryable {
        reason: String,
        /// Minimum delay requested by the handler (e.g. from a `Retry-After` header).
        retry_after: Option<Duration>,
    },

    /// Retrying cannot help; the job goes straight to dead-letter.
    #[error("fatal handler failure: {0}")]
    Fatal(String),
}

impl HandlerError {
    pub fn retryable(reason: impl Into<String>) -> Self {
        HandlerError::Retryable {
            reason: reason.into(),
            retry_after: None,
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        HandlerError::Fatal(reason.into())
    }
}

/// Invalid startup configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("source '{source_name}': unknown handler '{value}' (expected 'log' or 'forward:<url>')")]
    UnknownHandler { source_name: String, value: String },

    #[error("source '{source_name}': forward handler requires an http(s) url, got '{value}'")]
    InvalidForwardUrl { source_name: String, value: String },

    #[error("no webhook sources configured")]
    NoSources,
}
