//! Authorization state codec
//!
//! Carries the caller's organization and user through a vendor redirect as
//! the OAuth `state` query parameter. The token is base64url-encoded JSON of
//! `{organization_id, user_id, timestamp}`. When a signing secret is
//! configured an HMAC-SHA256 tag is appended as `<payload>.<hex tag>` and a
//! maximum age is enforced on decode.

use std::borrow::Cow;
use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::config::AppConfig;

type HmacSha256 = Hmac<Sha256>;

/// Allowed clock skew for tokens stamped slightly in the future.
const FUTURE_SKEW_SECS: i64 = 60;

/// Reasons a state token is rejected. Each decoding stage fails with its own
/// variant so a tampered token can be told apart from a stale encoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("state token is empty")]
    Empty,
    #[error("state token is not valid URL encoding: {0}")]
    UrlEncoding(String),
    #[error("state token is not valid base64: {0}")]
    Base64(String),
    #[error("state token payload is not valid JSON: {0}")]
    Json(String),
    #[error("state token is missing '{0}'")]
    MissingField(&'static str),
    #[error("state token signature is missing or invalid")]
    Signature,
    #[error("state token expired {age_secs}s after issue (max {max_age_secs}s)")]
    Expired { age_secs: i64, max_age_secs: u64 },
}

/// Decoded identity carried by a state token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationState {
    pub organization_id: String,
    pub user_id: String,
    /// Seconds since the Unix epoch at which the token was issued
    #[serde(rename = "timestamp")]
    pub issued_at: i64,
}

#[derive(Deserialize)]
struct RawState {
    #[serde(default)]
    organization_id: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    timestamp: Option<i64>,
}

/// Encoder/decoder for authorization state tokens.
#[derive(Clone)]
pub struct StateCodec {
    signing_key: Option<Vec<u8>>,
    max_age: Option<Duration>,
}

impl std::fmt::Debug for StateCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateCodec")
            .field("signed", &self.signing_key.is_some())
            .field("max_age", &self.max_age)
            .finish()
    }
}

impl Default for StateCodec {
    fn default() -> Self {
        Self::unsigned()
    }
}

impl StateCodec {
    /// Plain base64 JSON tokens with no signature and no expiry.
    pub fn unsigned() -> Self {
        Self {
            signing_key: None,
            max_age: None,
        }
    }

    /// HMAC-signed tokens rejected once older than `max_age`.
    pub fn signed(secret: impl Into<Vec<u8>>, max_age: Duration) -> Self {
        Self {
            signing_key: Some(secret.into()),
            max_age: Some(max_age),
        }
    }

    /// Signed when a signing secret is configured, unsigned otherwise.
    pub fn from_config(config: &AppConfig) -> Self {
        match &config.state_signing_secret {
            Some(secret) => Self::signed(secret.as_bytes(), config.state_max_age()),
            None => Self::unsigned(),
        }
    }

    pub fn with_max_age(mut self, max_age: Option<Duration>) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn is_signed(&self) -> bool {
        self.signing_key.is_some()
    }

    pub fn encode(&self, organization_id: &str, user_id: &str) -> String {
        self.encode_at(organization_id, user_id, Utc::now().timestamp())
    }

    /// Encode with an explicit issue time.
    pub fn encode_at(&self, organization_id: &str, user_id: &str, issued_at: i64) -> String {
        let state = AuthorizationState {
            organization_id: organization_id.to_string(),
            user_id: user_id.to_string(),
            issued_at,
        };
        // Serializing a struct of strings and an integer cannot fail.
        let json = serde_json::to_vec(&state).unwrap_or_default();
        let payload = base64_url::encode(&json);

        match &self.signing_key {
            Some(key) => format!("{}.{}", payload, hex::encode(sign(key, &payload))),
            None => payload,
        }
    }

    pub fn decode(&self, token: &str) -> Result<AuthorizationState, StateError> {
        self.decode_at(token, Utc::now().timestamp())
    }

    /// Decode relative to an explicit clock reading.
    pub fn decode_at(&self, token: &str, now: i64) -> Result<AuthorizationState, StateError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(StateError::Empty);
        }

        // Browsers and proxies may re-encode the query parameter.
        let unescaped: Cow<'_, str> = percent_decode_str(token)
            .decode_utf8()
            .map_err(|e| StateError::UrlEncoding(e.to_string()))?;

        let payload = match &self.signing_key {
            Some(key) => {
                let (payload, tag) = unescaped.rsplit_once('.').ok_or(StateError::Signature)?;
                let tag = hex::decode(tag).map_err(|_| StateError::Signature)?;
                let expected = sign(key, payload);
                if !bool::from(expected.ct_eq(tag.as_slice())) {
                    return Err(StateError::Signature);
                }
                payload
            }
            None => unescaped.as_ref(),
        };

        let json = base64_url::decode(payload).map_err(|e| StateError::Base64(e.to_string()))?;
        let raw: RawState =
            serde_json::from_slice(&json).map_err(|e| StateError::Json(e.to_string()))?;

        let organization_id = raw
            .organization_id
            .filter(|v| !v.is_empty())
            .ok_or(StateError::MissingField("organization_id"))?;
        let user_id = raw
            .user_id
            .filter(|v| !v.is_empty())
            .ok_or(StateError::MissingField("user_id"))?;
        let issued_at = raw.timestamp.unwrap_or_default();

        if let Some(max_age) = self.max_age {
            let age_secs = now.saturating_sub(issued_at);
            let max_age_secs = i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX);
            if age_secs > max_age_secs || age_secs < -FUTURE_SKEW_SECS {
                return Err(StateError::Expired {
                    age_secs,
                    max_age_secs: max_age.as_secs(),
                });
            }
        }

        Ok(AuthorizationState {
            organization_id,
            user_id,
            issued_at,
        })
    }
}

fn sign(key: &[u8], payload: &str) -> Vec<u8> {
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(payload.as_bytes());
    mac.finalize().into_bytes().to_vec()
}
