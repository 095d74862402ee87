//! Webhook signature verification.
//!
//! Verification is fail-closed and operates on the raw request bytes only:
//! a missing secret, a missing or malformed header, or a timestamp outside
//! the source's tolerance all produce [`VerificationResult::Invalid`].
//!
//! Supported schemes:
//! - `hmac-sha256`: hex HMAC-SHA256 of the body (`sha256=` prefix optional)
//! - `timestamped-hmac-sha256`: `t=<unix>,v1=<hex>[,v1=<hex>]`, signed over `"{t}.{body}"`
//! - `standard-webhooks`: base64 HMAC-SHA256 over `"{id}.{timestamp}.{body}"`
//!   (<https://www.standardwebhooks.com/>)
//! - `token`: header value equals the secret

use axum::http::HeaderMap;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::warn;

use crate::config::{SigningScheme, SourceConfig};

type HmacSha256 = Hmac<Sha256>;

const STANDARD_ID_HEADER: &str = "webhook-id";
const STANDARD_TIMESTAMP_HEADER: &str = "webhook-timestamp";
const STANDARD_SIGNATURE_HEADER: &str = "webhook-signature";

/// Why a request failed verification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidSignature {
    #[error("no secret configured for source")]
    MissingSecret,

    #[error("missing header '{0}'")]
    MissingHeader(String),

    #[error("malformed signature header")]
    MalformedHeader,

    #[error("timestamp outside tolerance ({age_secs}s > {tolerance_secs}s)")]
    StaleTimestamp { age_secs: u64, tolerance_secs: u64 },

    #[error("signature mismatch")]
    Mismatch,
}

/// Outcome of [`verify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationResult {
    Valid,
    Invalid(InvalidSignature),
    Unsupported(String),
}

impl VerificationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, VerificationResult::Valid)
    }
}

impl From<Result<(), InvalidSignature>> for VerificationResult {
    fn from(result: Result<(), InvalidSignature>) -> Self {
        match result {
            Ok(()) => VerificationResult::Valid,
            Err(reason) => VerificationResult::Invalid(reason),
        }
    }
}

/// Verify a request against its source's secret and scheme.
pub fn verify(raw_body: &[u8], headers: &HeaderMap, source: &SourceConfig) -> VerificationResult {
    verify_at(raw_body, headers, source, Utc::now())
}

/// [`verify`] with an explicit notion of "now" for timestamped schemes.
pub fn verify_at(
    raw_body: &[u8],
    headers: &HeaderMap,
    source: &SourceConfig,
    now: DateTime<Utc>,
) -> VerificationResult {
    let result = match &source.scheme {
        SigningScheme::Unsupported(name) => {
            warn!(source = %source.name, scheme = %name, "signature_scheme_unsupported");
            return VerificationResult::Unsupported(name.clone());
        }
        SigningScheme::HmacSha256 => {
            secret_for(source).and_then(|secret| verify_hmac_hex(secret, raw_body, headers, source))
        }
        SigningScheme::TimestampedHmacSha256 => secret_for(source)
            .and_then(|secret| verify_timestamped(secret, raw_body, headers, source, now)),
        SigningScheme::StandardWebhooks => secret_for(source)
            .and_then(|secret| verify_standard_webhooks(secret, raw_body, headers, source, now)),
        SigningScheme::Token => {
            secret_for(source).and_then(|secret| verify_token(secret, headers, source))
        }
    };

    if let Err(reason) = &result {
        warn!(
            source = %source.name,
            scheme = source.scheme.name(),
            reason = %reason,
            body_length = raw_body.len(),
            "signature_invalid"
        );
    }

    result.into()
}

fn secret_for(source: &SourceConfig) -> Result<&str, InvalidSignature> {
    match source.secret.as_deref().map(str::trim) {
        Some(secret) if !secret.is_empty() => Ok(secret),
        _ => Err(InvalidSignature::MissingSecret),
    }
}

fn required_header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, InvalidSignature> {
    let value = headers
        .get(name)
        .ok_or_else(|| InvalidSignature::MissingHeader(name.to_string()))?;
    let value = value
        .to_str()
        .map_err(|_| InvalidSignature::MalformedHeader)?
        .trim();
    if value.is_empty() {
        return Err(InvalidSignature::MissingHeader(name.to_string()));
    }
    Ok(value)
}

fn mac_for(secret: &[u8]) -> Result<HmacSha256, InvalidSignature> {
    HmacSha256::new_from_slice(secret).map_err(|_| InvalidSignature::MissingSecret)
}

fn verify_hmac_hex(
    secret: &str,
    body: &[u8],
    headers: &HeaderMap,
    source: &SourceConfig,
) -> Result<(), InvalidSignature> {
    let header = required_header(headers, &source.signature_header)?;
    let hex_sig = header.strip_prefix("sha256=").unwrap_or(header);
    let expected = hex::decode(hex_sig).map_err(|_| InvalidSignature::MalformedHeader)?;

    let mut mac = mac_for(secret.as_bytes())?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| InvalidSignature::Mismatch)
}

fn check_timestamp(
    raw: &str,
    now: DateTime<Utc>,
    source: &SourceConfig,
) -> Result<(), InvalidSignature> {
    let ts: i64 = raw.parse().map_err(|_| InvalidSignature::MalformedHeader)?;
    let age_secs = now.timestamp().abs_diff(ts);
    let tolerance_secs = source.tolerance.as_secs();
    if age_secs > tolerance_secs {
        return Err(InvalidSignature::StaleTimestamp {
            age_secs,
            tolerance_secs,
        });
    }
    Ok(())
}

fn verify_timestamped(
    secret: &str,
    body: &[u8],
    headers: &HeaderMap,
    source: &SourceConfig,
    now: DateTime<Utc>,
) -> Result<(), InvalidSignature> {
    let header = required_header(headers, &source.signature_header)?;

    let mut timestamp = None;
    let mut candidates = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", v)) => timestamp = Some(v),
            Some(("v1", v)) => candidates.push(v),
            Some(_) => {}
            None => return Err(InvalidSignature::MalformedHeader),
        }
    }
    let timestamp = timestamp.ok_or(InvalidSignature::MalformedHeader)?;
    if candidates.is_empty() {
        return Err(InvalidSignature::MalformedHeader);
    }
    check_timestamp(timestamp, now, source)?;

    let mut mac = mac_for(secret.as_bytes())?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);

    any_matches(mac, candidates.iter().filter_map(|c| hex::decode(c).ok()))
}

fn verify_standard_webhooks(
    secret: &str,
    body: &[u8],
    headers: &HeaderMap,
    source: &SourceConfig,
    now: DateTime<Utc>,
) -> Result<(), InvalidSignature> {
    let msg_id = required_header(headers, STANDARD_ID_HEADER)?;
    let timestamp = required_header(headers, STANDARD_TIMESTAMP_HEADER)?;
    let signatures = required_header(headers, STANDARD_SIGNATURE_HEADER)?;
    check_timestamp(timestamp, now, source)?;

    let engine = base64::engine::general_purpose::STANDARD;
    let key = engine
        .decode(secret.strip_prefix("whsec_").unwrap_or(secret))
        .map_err(|_| InvalidSignature::MissingSecret)?;

    let mut mac = mac_for(&key)?;
    mac.update(msg_id.as_bytes());
    mac.update(b".");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);

    let decoded = signatures
        .split_whitespace()
        .filter_map(|sig| sig.strip_prefix("v1,"))
        .filter_map(|sig| engine.decode(sig).ok());
    any_matches(mac, decoded)
}

/// Check each candidate against the same MAC in constant time.
fn any_matches<I>(mac: HmacSha256, candidates: I) -> Result<(), InvalidSignature>
where
    I: IntoIterator<Item = Vec<u8>>,
{
    let mut matched = false;
    for candidate in candidates {
        matched |= mac.clone().verify_slice(&candidate).is_ok();
    }
    if matched {
        Ok(())
    } else {
        Err(InvalidSignature::Mismatch)
    }
}

fn verify_token(
    secret: &str,
    headers: &HeaderMap,
    source: &SourceConfig,
) -> Result<(), InvalidSignature> {
    let provided = required_header(headers, &source.signature_header)?;
    if bool::from(provided.as_bytes().ct_eq(secret.as_bytes())) {
        Ok(())
    } else {
        Err(InvalidSignature::Mismatch)
    }
}
