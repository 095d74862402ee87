//! Configuration module for environment variable parsing.
//!
//! Global settings and one block of `WEBHOOK_<NAME>_*` variables per source
//! listed in `WEBHOOK_SOURCES`.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;

use tracing::warn;

use crate::error::ConfigError;

/// Name of the source served by the legacy `/webhook-client` route.
pub const DEFAULT_SOURCE: &str = "default";

/// Header carrying the signature when a source does not override it.
pub const DEFAULT_SIGNATURE_HEADER: &str = "Signature";

/// How a source signs its requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SigningScheme {
    /// Hex HMAC-SHA256 of the raw body, optionally prefixed with `sha256=`.
    HmacSha256,
    /// `t=<unix>,v1=<hex>` header; HMAC-SHA256 of `"{t}.{body}"`.
    TimestampedHmacSha256,
    /// Standard Webhooks: `webhook-id`, `webhook-timestamp`, `webhook-signature`.
    StandardWebhooks,
    /// Shared token sent verbatim in the signature header.
    Token,
    /// Named in configuration but not implemented.
    Unsupported(String),
}

impl SigningScheme {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "hmac-sha256" | "hmac" => SigningScheme::HmacSha256,
            "timestamped-hmac-sha256" | "stripe" => SigningScheme::TimestampedHmacSha256,
            "standard-webhooks" | "svix" => SigningScheme::StandardWebhooks,
            "token" => SigningScheme::Token,
            other => SigningScheme::Unsupported(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            SigningScheme::HmacSha256 => "hmac-sha256",
            SigningScheme::TimestampedHmacSha256 => "timestamped-hmac-sha256",
            SigningScheme::StandardWebhooks => "standard-webhooks",
            SigningScheme::Token => "token",
            SigningScheme::Unsupported(name) => name,
        }
    }
}

/// Which built-in handler processes a source's events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerSpec {
    /// Log the payload and succeed.
    Log,
    /// Relay the raw body to a downstream URL.
    Forward(String),
}

impl HandlerSpec {
    fn parse(source: &str, raw: &str) -> Result<Self, ConfigError> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("log") {
            return Ok(HandlerSpec::Log);
        }
        match raw.split_once(':') {
            Some((kind, url)) if kind.eq_ignore_ascii_case("forward") => {
                let url = url.trim();
                if url.starts_with("http://") || url.starts_with("https://") {
                    Ok(HandlerSpec::Forward(url.to_string()))
                } else {
                    Err(ConfigError::InvalidForwardUrl {
                        source_name: source.to_string(),
                        value: url.to_string(),
                    })
                }
            }
            _ => Err(ConfigError::UnknownHandler {
                source_name: source.to_string(),
                value: raw.to_string(),
            }),
        }
    }
}

/// Per-source settings.
#[derive(Clone)]
pub struct SourceConfig {
    pub name: String,

    /// Signing secret; `None` means every request is rejected.
    pub secret: Option<String>,

    pub scheme: SigningScheme,

    /// Header holding the signature (or token) for this source.
    pub signature_header: String,

    /// Allowed clock skew for timestamped schemes.
    pub tolerance: Duration,

    /// Header carrying the sender's own delivery id, if any.
    pub idempotency_header: Option<String>,

    pub topic_header: Option<String>,

    /// Top-level JSON field holding the topic when no header is configured.
    pub topic_field: Option<String>,

    /// Overrides the global header allow-list when set.
    pub store_headers: Option<Vec<String>>,

    pub handler: HandlerSpec,

    /// When set, only these topics are routed to the handler.
    pub topics: Option<Vec<String>>,
}

impl SourceConfig {
    /// A source with the defaults used when no per-source variables are set.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            secret: None,
            scheme: SigningScheme::HmacSha256,
            signature_header: DEFAULT_SIGNATURE_HEADER.to_string(),
            tolerance: Duration::from_secs(300),
            idempotency_header: None,
            topic_header: None,
            topic_field: None,
            store_headers: None,
            handler: HandlerSpec::Log,
            topics: None,
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn with_scheme(mut self, scheme: SigningScheme) -> Self {
        self.scheme = scheme;
        self
    }

    pub fn with_signature_header(mut self, header: impl Into<String>) -> Self {
        self.signature_header = header.into();
        self
    }
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("name", &self.name)
            .field("secret", &self.secret.as_ref().map(|_| "<REDACTED>"))
            .field("scheme", &self.scheme)
            .field("signature_header", &self.signature_header)
            .field("tolerance", &self.tolerance)
            .field("idempotency_header", &self.idempotency_header)
            .field("topic_header", &self.topic_header)
            .field("topic_field", &self.topic_field)
            .field("store_headers", &self.store_headers)
            .field("handler", &self.handler)
            .field("topics", &self.topics)
            .finish()
    }
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port for the web server to listen on
    pub port: u16,

    /// Configured sources keyed by name
    pub sources: HashMap<String, SourceConfig>,

    /// Global header allow-list; `*` allows all
    pub store_headers: Vec<String>,

    /// How long an idempotency key collapses duplicate deliveries
    pub idempotency_window: Duration,

    /// Age after which succeeded events are pruned
    pub retention: Duration,

    /// How often the retention sweeper runs
    pub retention_sweep_interval: Duration,

    /// Strict bound on verify + record + enqueue for one request
    pub ingest_timeout: Duration,

    // =========================================================================
    // Worker pool
    // =========================================================================

    /// Number of concurrent workers
    pub worker_concurrency: usize,

    /// Maximum jobs leased per poll
    pub lease_batch_size: usize,

    /// Sleep between polls when the queue is empty
    pub poll_interval: Duration,

    /// Lease length before an unacked job becomes visible again
    pub visibility_timeout: Duration,

    /// Upper bound on a single handler execution
    pub handler_timeout: Duration,

    // =========================================================================
    // Retry policy
    // =========================================================================

    pub max_attempts: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub backoff_multiplier: f64,
    pub backoff_jitter: f64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let store_headers = parse_csv(&lookup, "STORE_HEADERS").unwrap_or_default();

        let names = parse_csv(&lookup, "WEBHOOK_SOURCES")
            .unwrap_or_else(|| vec![DEFAULT_SOURCE.to_string()]);
        if names.is_empty() {
            return Err(ConfigError::NoSources);
        }

        let mut sources = HashMap::new();
        for name in names {
            let source = parse_source(&lookup, &name)?;
            sources.insert(name, source);
        }

        Ok(Config {
            port: parse_or(&lookup, "PORT", 8080),
            sources,
            store_headers,
            idempotency_window: secs(&lookup, "IDEMPOTENCY_WINDOW_SECS", 86_400),
            retention: secs(&lookup, "RETENTION_SECS", 30 * 86_400),
            retention_sweep_interval: secs(&lookup, "RETENTION_SWEEP_SECS", 3_600),
            ingest_timeout: millis(&lookup, "INGEST_TIMEOUT_MS", 800),
            worker_concurrency: parse_or(&lookup, "WORKER_CONCURRENCY", 4usize).max(1),
            lease_batch_size: parse_or(&lookup, "LEASE_BATCH_SIZE", 10usize).max(1),
            poll_interval: millis(&lookup, "POLL_INTERVAL_MS", 500),
            visibility_timeout: secs(&lookup, "VISIBILITY_TIMEOUT_SECS", 30),
            handler_timeout: millis(&lookup, "HANDLER_TIMEOUT_MS", 10_000),
            max_attempts: parse_or(&lookup, "MAX_ATTEMPTS", 5u32).max(1),
            backoff_initial: millis(&lookup, "BACKOFF_INITIAL_MS", 1_000),
            backoff_max: millis(&lookup, "BACKOFF_MAX_MS", 300_000),
            backoff_multiplier: parse_or(&lookup, "BACKOFF_MULTIPLIER", 2.0),
            backoff_jitter: parse_or(&lookup, "BACKOFF_JITTER", 0.25),
        })
    }

    pub fn source(&self, name: &str) -> Option<&SourceConfig> {
        self.sources.get(name)
    }

    /// Header allow-list that applies to `source`.
    pub fn store_headers_for<'a>(&'a self, source: &'a SourceConfig) -> &'a [String] {
        source.store_headers.as_deref().unwrap_or(&self.store_headers)
    }
}

fn parse_source<F>(lookup: &F, name: &str) -> Result<SourceConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let prefix = format!(
        "WEBHOOK_{}_",
        name.to_ascii_uppercase().replace(['-', '.'], "_")
    );
    let var = |suffix: &str| {
        lookup(&format!("{prefix}{suffix}"))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    let mut source = SourceConfig::new(name);
    source.secret = var("SECRET");
    if let Some(scheme) = var("SCHEME") {
        source.scheme = SigningScheme::parse(&scheme);
    }
    if let Some(header) = var("SIGNATURE_HEADER") {
        source.signature_header = header;
    }
    source.tolerance = secs(lookup, &format!("{prefix}TOLERANCE_SECS"), 300);
    source.idempotency_header = var("IDEMPOTENCY_HEADER");
    source.topic_header = var("TOPIC_HEADER");
    source.topic_field = var("TOPIC_FIELD");
    source.store_headers = parse_csv(lookup, &format!("{prefix}STORE_HEADERS"));
    if let Some(handler) = var("HANDLER") {
        source.handler = HandlerSpec::parse(name, &handler)?;
    }
    source.topics = parse_csv(lookup, &format!("{prefix}TOPICS"));

    if source.secret.is_none() {
        warn!(source = %name, "source_secret_missing");
    }

    Ok(source)
}

/// Parse a variable, falling back to `default` when unset or malformed.
fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(name) {
        None => default,
        Some(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(env_var = name, value = %raw, "Invalid value, using default");
                default
            }
        },
    }
}

fn secs<F: Fn(&str) -> Option<String>>(lookup: &F, name: &str, default: u64) -> Duration {
    Duration::from_secs(parse_or(lookup, name, default))
}

fn millis<F: Fn(&str) -> Option<String>>(lookup: &F, name: &str, default: u64) -> Duration {
    Duration::from_millis(parse_or(lookup, name, default))
}

/// Parse a comma-separated list of strings.
fn parse_csv<F: Fn(&str) -> Option<String>>(lookup: &F, name: &str) -> Option<Vec<String>> {
    lookup(name).map(|raw| {
        raw.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}
