//! # Webhook Signature Verification
//!
//! HMAC-SHA256 signature checks for inbound vendor webhooks, compared in
//! constant time.

use std::time::{SystemTime, UNIX_EPOCH};

use axum::http::{HeaderMap, StatusCode};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

pub const GITHUB_SIGNATURE_HEADER: &str = "x-hub-signature-256";
pub const SLACK_SIGNATURE_HEADER: &str = "x-slack-signature";
pub const SLACK_TIMESTAMP_HEADER: &str = "x-slack-request-timestamp";

/// Errors that can occur while accepting a webhook delivery
#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    #[error("Missing required signature header: {header}")]
    MissingSignature { header: String },

    #[error("Invalid signature format: {header}")]
    InvalidSignatureFormat { header: String },

    #[error("Signature verification failed")]
    VerificationFailed,

    #[error("Missing required timestamp header: {header}")]
    MissingTimestamp { header: String },

    #[error("Invalid timestamp format: {header}")]
    InvalidTimestamp { header: String },

    #[error("Timestamp too old: {seconds}s old, max allowed: {max_seconds}s")]
    TimestampTooOld { seconds: u64, max_seconds: u64 },

    #[error("Timestamp too far in future: {seconds}s in future, max allowed: {max_seconds}s")]
    TimestampTooFuture { seconds: u64, max_seconds: u64 },

    #[error("Unsupported connector: {connector}")]
    UnsupportedConnector { connector: String },

    #[error("Webhook verification not configured for connector: {connector}")]
    NotConfigured { connector: String },

    #[error("Malformed webhook payload: {details}")]
    MalformedPayload { details: String },

    #[error("Webhook receiver for {connector} is not accepting deliveries")]
    Unavailable { connector: String },
}

impl VerificationError {
    /// Returns the appropriate HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            VerificationError::MissingSignature { .. }
            | VerificationError::InvalidSignatureFormat { .. }
            | VerificationError::VerificationFailed
            | VerificationError::MissingTimestamp { .. }
            | VerificationError::InvalidTimestamp { .. }
            | VerificationError::TimestampTooOld { .. }
            | VerificationError::TimestampTooFuture { .. }
            | VerificationError::NotConfigured { .. } => StatusCode::UNAUTHORIZED,
            VerificationError::UnsupportedConnector { .. } => StatusCode::NOT_FOUND,
            VerificationError::MalformedPayload { .. } => StatusCode::BAD_REQUEST,
            VerificationError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Stable error code used in problem+json bodies
    pub fn code(&self) -> &'static str {
        match self.status_code() {
            StatusCode::NOT_FOUND => "NOT_FOUND",
            StatusCode::BAD_REQUEST => "VALIDATION_FAILED",
            StatusCode::SERVICE_UNAVAILABLE => "SERVICE_UNAVAILABLE",
            _ => "UNAUTHORIZED",
        }
    }
}

/// Result type for webhook verification
pub type VerificationResult<T> = Result<T, VerificationError>;

/// Read a header as a string, empty when absent or not ASCII.
pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("")
}

fn compute_hmac(secret: &str, parts: &[&[u8]]) -> VerificationResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| VerificationError::VerificationFailed)?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().to_vec())
}

fn compare(expected: &[u8], provided_hex: &str, header: &str) -> VerificationResult<()> {
    let provided =
        hex::decode(provided_hex).map_err(|_| VerificationError::InvalidSignatureFormat {
            header: format!("{} contains invalid hex", header),
        })?;

    if expected.ct_eq(&provided[..]).into() {
        Ok(())
    } else {
        Err(VerificationError::VerificationFailed)
    }
}

/// Verifies a GitHub `X-Hub-Signature-256` header (`sha256=<hex>`)
pub fn verify_github_signature(
    body: &[u8],
    signature_header: &str,
    secret: &str,
) -> VerificationResult<()> {
    debug!(body_size = body.len(), "Verifying GitHub webhook signature");

    if signature_header.is_empty() {
        return Err(VerificationError::MissingSignature {
            header: "X-Hub-Signature-256".to_string(),
        });
    }

    let provided_hex = signature_header.strip_prefix("sha256=").ok_or_else(|| {
        VerificationError::InvalidSignatureFormat {
            header: "X-Hub-Signature-256 must start with 'sha256='".to_string(),
        }
    })?;

    let expected = compute_hmac(secret, &[body])?;
    compare(&expected, provided_hex, "X-Hub-Signature-256")
}

/// Verifies a Slack `v0` request signature over `v0:{timestamp}:{body}`
pub fn verify_slack_signature(
    body: &[u8],
    signature_header: &str,
    timestamp_header: &str,
    secret: &str,
    tolerance_seconds: u64,
) -> VerificationResult<()> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| VerificationError::InvalidTimestamp {
            header: "Failed to get current time".to_string(),
        })?
        .as_secs();
    verify_slack_signature_at(
        body,
        signature_header,
        timestamp_header,
        secret,
        tolerance_seconds,
        now,
    )
}

pub fn verify_slack_signature_at(
    body: &[u8],
    signature_header: &str,
    timestamp_header: &str,
    secret: &str,
    tolerance_seconds: u64,
    now: u64,
) -> VerificationResult<()> {
    debug!(
        body_size = body.len(),
        tolerance_seconds, "Verifying Slack request signature"
    );

    if signature_header.is_empty() {
        return Err(VerificationError::MissingSignature {
            header: "X-Slack-Signature".to_string(),
        });
    }

    if timestamp_header.is_empty() {
        return Err(VerificationError::MissingTimestamp {
            header: "X-Slack-Request-Timestamp".to_string(),
        });
    }

    let timestamp =
        timestamp_header
            .parse::<u64>()
            .map_err(|_| VerificationError::InvalidTimestamp {
                header: "X-Slack-Request-Timestamp must be a valid Unix timestamp".to_string(),
            })?;

    let time_diff = now.abs_diff(timestamp);
    if time_diff > tolerance_seconds {
        return if now > timestamp {
            Err(VerificationError::TimestampTooOld {
                seconds: time_diff,
                max_seconds: tolerance_seconds,
            })
        } else {
            Err(VerificationError::TimestampTooFuture {
                seconds: time_diff,
                max_seconds: tolerance_seconds,
            })
        };
    }

    let provided_hex = signature_header.strip_prefix("v0=").ok_or_else(|| {
        VerificationError::InvalidSignatureFormat {
            header: "X-Slack-Signature must start with 'v0='".to_string(),
        }
    })?;

    let expected = compute_hmac(
        secret,
        &[
            b"v0:".as_slice(),
            timestamp_header.as_bytes(),
            b":".as_slice(),
            body,
        ],
    )?;
    compare(&expected, provided_hex, "X-Slack-Signature")
}

/// Hex HMAC-SHA256 of `body`, in the form vendors put in signature headers.
pub fn sign_hex(secret: &str, body: &[u8]) -> String {
    compute_hmac(secret, &[body]).map(hex::encode).unwrap_or_default()
}
