//! Connector trait definition
//!
//! Defines the contract every vendor implementation follows. Connectors talk
//! to exactly one vendor and never write to the database: anything that must
//! change local state is returned to the service as data (credentials,
//! account identity, sync outcomes, event actions).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::connectors::inbox::WebhookInbox;
use crate::error::IntegrationError;
use crate::models::integration::Model as Integration;
use crate::models::{ConnectorType, CredentialData, CredentialType, IntegrationStatus};
use crate::webhook_verification::VerificationError;

const MAX_ERROR_BODY_CHARS: usize = 200;

/// Connector-specific error types for structured error handling
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorError {
    /// HTTP error from the vendor
    HttpError { status: u16, body: Option<String> },
    /// Vendor answered with something we could not interpret
    MalformedResponse { details: String },
    /// Network or connectivity error, including elapsed deadlines
    NetworkError { details: String, retryable: bool },
    /// Vendor rejected the credentials
    AuthenticationError {
        details: String,
        error_code: Option<String>,
    },
    /// Rate limiting error
    RateLimitError { retry_after: Option<u64> },
    /// Connector is missing platform-side settings
    ConfigurationError { details: String },
    /// Caller supplied incomplete or malformed authorization input
    InvalidInput { details: String },
    /// The connector does not implement this operation
    Unsupported { operation: &'static str },
}

impl ConnectorError {
    /// Classify a non-success vendor response.
    pub fn from_status(status: u16, body: Option<String>) -> Self {
        let body = body.map(truncate_body);
        match status {
            401 | 403 => ConnectorError::AuthenticationError {
                details: body.unwrap_or_else(|| format!("HTTP {}", status)),
                error_code: Some(status.to_string()),
            },
            429 => ConnectorError::RateLimitError { retry_after: None },
            _ => ConnectorError::HttpError { status, body },
        }
    }

    pub fn malformed(details: impl Into<String>) -> Self {
        ConnectorError::MalformedResponse {
            details: details.into(),
        }
    }

    pub fn configuration(details: impl Into<String>) -> Self {
        ConnectorError::ConfigurationError {
            details: details.into(),
        }
    }

    pub fn invalid_input(details: impl Into<String>) -> Self {
        ConnectorError::InvalidInput {
            details: details.into(),
        }
    }

    pub fn timeout(operation: &str) -> Self {
        ConnectorError::NetworkError {
            details: format!("{} timed out", operation),
            retryable: true,
        }
    }

    /// Whether retrying the same call later could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ConnectorError::NetworkError { retryable, .. } => *retryable,
            ConnectorError::RateLimitError { .. } => true,
            ConnectorError::HttpError { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

fn truncate_body(body: String) -> String {
    if body.chars().count() > MAX_ERROR_BODY_CHARS {
        let truncated: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
        format!("{}...", truncated)
    } else {
        body
    }
}

impl std::fmt::Display for ConnectorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectorError::HttpError { status, body } => {
                write!(
                    f,
                    "HTTP error {}: {}",
                    status,
                    body.as_deref().unwrap_or("No body")
                )
            }
            ConnectorError::MalformedResponse { details } => {
                write!(f, "Malformed response: {}", details)
            }
            ConnectorError::NetworkError { details, .. } => {
                write!(f, "Network error: {}", details)
            }
            ConnectorError::AuthenticationError { details, .. } => {
                write!(f, "Authentication error: {}", details)
            }
            ConnectorError::RateLimitError { retry_after } => {
                write!(f, "Rate limit exceeded")?;
                if let Some(after) = retry_after {
                    write!(f, " (retry after: {}s)", after)?;
                }
                Ok(())
            }
            ConnectorError::ConfigurationError { details } => {
                write!(f, "Configuration error: {}", details)
            }
            ConnectorError::InvalidInput { details } => {
                write!(f, "Invalid input: {}", details)
            }
            ConnectorError::Unsupported { operation } => {
                write!(f, "Operation '{}' is not supported", operation)
            }
        }
    }
}

impl std::error::Error for ConnectorError {}

impl From<reqwest::Error> for ConnectorError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            return ConnectorError::malformed(error.to_string());
        }
        if let Some(status) = error.status() {
            return ConnectorError::from_status(status.as_u16(), None);
        }
        ConnectorError::NetworkError {
            details: error.to_string(),
            retryable: error.is_timeout() || error.is_connect() || error.is_request(),
        }
    }
}

/// How a connector obtains credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationKind {
    /// Redirect to the vendor, exchange a code for tokens
    Oauth2,
    /// Install an app on the vendor side, then claim the installation
    Installation,
    /// Caller pastes an API key or service-account document
    ApiKey,
}

impl AuthorizationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthorizationKind::Oauth2 => "oauth2",
            AuthorizationKind::Installation => "installation",
            AuthorizationKind::ApiKey => "api_key",
        }
    }
}

/// Where to send the user to start authorizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct AuthorizationIntent {
    #[serde(rename = "type")]
    pub kind: AuthorizationKind,
    pub url: String,
}

/// Parameters for starting the authorization flow
#[derive(Debug, Clone)]
pub struct AuthorizeParams {
    pub organization_id: String,
    pub user_id: String,
    /// Encoded state token to embed in the redirect
    pub state: String,
}

/// Callback data handed back after the user finished the vendor flow.
#[derive(Clone, Default, Deserialize)]
pub struct AuthorizationData {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub installation_id: Option<String>,
    /// Directly supplied secrets for API-key connectors
    #[serde(default)]
    pub credentials: Option<CredentialData>,
}

impl std::fmt::Debug for AuthorizationData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationData")
            .field("code", &self.code.as_ref().map(|_| "<redacted>"))
            .field("state", &self.state)
            .field("installation_id", &self.installation_id)
            .field(
                "credentials",
                &self.credentials.as_ref().map(|c| c.keys().collect::<Vec<_>>()),
            )
            .finish()
    }
}

/// Decrypted credential material. `Debug` prints key names only.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub credential_type: CredentialType,
    pub data: CredentialData,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credentials {
    pub fn new(credential_type: CredentialType, data: CredentialData) -> Self {
        Self {
            credential_type,
            data,
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: Option<DateTime<Utc>>) -> Self {
        self.expires_at = expires_at;
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Fetch a required field or fail as invalid credentials.
    pub fn require(&self, key: &str) -> Result<&str, ConnectorError> {
        self.get(key).ok_or_else(|| ConnectorError::AuthenticationError {
            details: format!("credential field '{}' is missing", key),
            error_code: None,
        })
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("credential_type", &self.credential_type)
            .field("fields", &self.data.keys().collect::<Vec<_>>())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Vendor-side identity of the authorized account.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VendorAccount {
    /// Installation or app-instance id; empty when the vendor has none
    pub bot_id: String,
    pub connector_user_id: String,
    pub connector_organization_id: String,
    pub metadata: BTreeMap<String, String>,
}

/// Result of a completed authorization.
#[derive(Debug, Clone)]
pub struct Authorization {
    pub credentials: Credentials,
    pub account: VendorAccount,
}

/// Caller-supplied sync options
#[derive(Debug, Clone, Copy, Default, Deserialize, ToSchema)]
pub struct SyncRequest {
    /// Delete local resources that are no longer present upstream
    #[serde(default)]
    pub prune: bool,
}

/// Parameters for sync operation
#[derive(Debug, Clone)]
pub struct SyncParams {
    pub integration: Integration,
    pub credentials: Credentials,
    pub request: SyncRequest,
}

/// A vendor sub-resource with the permissions the installation holds on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteResource {
    pub external_id: i64,
    pub name: String,
    pub full_name: String,
    pub url: String,
    pub is_private: bool,
    pub default_branch: String,
    pub can_admin: bool,
    pub can_push: bool,
    pub can_pull: bool,
    pub metadata: Option<JsonValue>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub pushed_at: Option<DateTime<Utc>>,
}

/// What a sync found upstream
#[derive(Debug, Clone, Default)]
pub struct SyncOutcome {
    /// Complete resource listing; `None` when the connector has no side table
    pub resources: Option<Vec<RemoteResource>>,
    /// Refreshed descriptive metadata for the integration
    pub metadata: Option<BTreeMap<String, String>>,
    /// Credentials replaced during the sync (e.g. a rotated token)
    pub credentials: Option<Credentials>,
}

/// One typed inbound vendor event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InboundEvent {
    pub connector_type: ConnectorType,
    pub event_type: String,
    pub delivery_id: Option<String>,
    pub payload: JsonValue,
    pub received_at: DateTime<Utc>,
}

impl InboundEvent {
    pub fn new(connector_type: ConnectorType, event_type: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            connector_type,
            event_type: event_type.into(),
            delivery_id: None,
            payload,
            received_at: Utc::now(),
        }
    }

    pub fn with_delivery_id(mut self, delivery_id: Option<String>) -> Self {
        self.delivery_id = delivery_id;
        self
    }
}

/// Local state change requested by a processed event. The service applies
/// these so connectors never mutate repositories directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventAction {
    SetStatus {
        bot_id: String,
        status: IntegrationStatus,
    },
    Resync {
        bot_id: String,
    },
    RemoveResources {
        bot_id: String,
        external_ids: Vec<i64>,
    },
}

/// Result of accepting a webhook delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookDelivery {
    /// Handshake that must be echoed back to the vendor
    Challenge(String),
    Event(InboundEvent),
    /// Authentic but irrelevant delivery
    Ignored,
}

/// Receives events from a running subscription.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: InboundEvent) -> Result<(), IntegrationError>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    fn connector_type(&self) -> ConnectorType;

    fn authorization_kind(&self) -> AuthorizationKind;

    /// Type recorded for credentials this connector produces.
    fn credential_type(&self) -> CredentialType {
        match self.authorization_kind() {
            AuthorizationKind::Oauth2 => CredentialType::OAuth2,
            AuthorizationKind::Installation | AuthorizationKind::ApiKey => CredentialType::Token,
        }
    }

    /// Build the URL the user visits to start authorizing.
    async fn initiate_authorization(
        &self,
        params: AuthorizeParams,
    ) -> Result<AuthorizationIntent, ConnectorError>;

    /// Turn callback data (or directly supplied secrets) into credentials and
    /// the vendor account identity.
    async fn complete_authorization(
        &self,
        data: AuthorizationData,
    ) -> Result<Authorization, ConnectorError>;

    /// Live call confirming the credentials still work.
    async fn validate_credentials(&self, credentials: &Credentials) -> Result<(), ConnectorError>;

    /// Renew short-lived tokens. Non-expiring credentials come back unchanged.
    async fn refresh_credentials(
        &self,
        credentials: &Credentials,
    ) -> Result<Credentials, ConnectorError> {
        Ok(credentials.clone())
    }

    /// Best-effort vendor-side revocation.
    async fn revoke_credentials(&self, _credentials: &Credentials) -> Result<(), ConnectorError> {
        Ok(())
    }

    /// Ensure the vendor notifies this platform. Must be idempotent.
    async fn configure_webhooks(
        &self,
        _integration_id: Uuid,
        _credentials: &Credentials,
    ) -> Result<(), ConnectorError> {
        Ok(())
    }

    /// Pull current remote state for an integration.
    async fn sync(&self, _params: SyncParams) -> Result<SyncOutcome, ConnectorError> {
        Ok(SyncOutcome::default())
    }

    /// Long-lived event loop delivering each inbound event to `handler`
    /// until `shutdown` is cancelled. Webhook connectors drain their inbox.
    async fn subscribe(
        &self,
        shutdown: CancellationToken,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), ConnectorError> {
        match self.webhook_inbox() {
            Some(inbox) => inbox.drain(self.connector_type(), shutdown, handler).await,
            None => {
                shutdown.cancelled().await;
                Ok(())
            }
        }
    }

    /// Translate one received event into local state changes.
    async fn process_event(&self, _event: &InboundEvent) -> Result<Vec<EventAction>, ConnectorError> {
        Ok(Vec::new())
    }

    /// Vendor-specific shape checks on raw credential input, returning the
    /// normalized map or every problem found.
    fn normalize_credentials(&self, raw: &CredentialData) -> Result<CredentialData, Vec<String>> {
        Ok(raw.clone())
    }

    /// Authenticate and parse an inbound webhook delivery.
    fn verify_webhook(
        &self,
        _headers: &HeaderMap,
        _body: &[u8],
    ) -> Result<WebhookDelivery, VerificationError> {
        Err(VerificationError::UnsupportedConnector {
            connector: self.connector_type().to_string(),
        })
    }

    /// Queue feeding this connector's subscription, if it receives webhooks.
    fn webhook_inbox(&self) -> Option<&WebhookInbox> {
        None
    }
}
