//! # Error Handling
//!
//! [`IntegrationError`] is the service-level taxonomy every command returns.
//! [`ApiError`] maps it onto a problem+json HTTP response for the webhook
//! router and any HTTP layer built on top of the service.

use axum::{
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

use crate::connectors::ConnectorError;
use crate::crypto::CryptoError;
use crate::models::ConnectorType;
use crate::repositories::RepositoryError;
use crate::state::StateError;
use crate::telemetry;

/// Failures surfaced by the integration service.
#[derive(Debug, Error)]
pub enum IntegrationError {
    #[error("invalid authorization state: {0}")]
    InvalidState(#[from] StateError),

    #[error("{connector_type} is already connected for this organization")]
    AlreadyConnected { connector_type: ConnectorType },

    #[error("integration not found")]
    NotFound,

    #[error("unsupported connector '{0}'")]
    UnsupportedConnector(String),

    #[error("stored credential could not be decrypted: {0}")]
    CredentialCorrupted(String),

    #[error("credential encryption unavailable: {0}")]
    EncryptionUnavailable(String),

    #[error("{connector_type} vendor call failed: {source}")]
    VendorApi {
        connector_type: ConnectorType,
        #[source]
        source: ConnectorError,
    },

    #[error("integration conflicts with an existing record: {0}")]
    DuplicateIntegration(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

impl IntegrationError {
    pub fn vendor(connector_type: ConnectorType, source: ConnectorError) -> Self {
        match source {
            ConnectorError::InvalidInput { details } => IntegrationError::InvalidRequest(details),
            source => IntegrationError::VendorApi {
                connector_type,
                source,
            },
        }
    }

    pub fn decrypt(error: CryptoError) -> Self {
        IntegrationError::CredentialCorrupted(error.to_string())
    }

    pub fn encrypt(error: CryptoError) -> Self {
        IntegrationError::EncryptionUnavailable(error.to_string())
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            IntegrationError::InvalidState(_) => "INVALID_STATE",
            IntegrationError::AlreadyConnected { .. } => "ALREADY_CONNECTED",
            IntegrationError::NotFound => "NOT_FOUND",
            IntegrationError::UnsupportedConnector(_) => "UNSUPPORTED_CONNECTOR",
            IntegrationError::CredentialCorrupted(_) => "CREDENTIAL_CORRUPTED",
            IntegrationError::EncryptionUnavailable(_) => "ENCRYPTION_UNAVAILABLE",
            IntegrationError::VendorApi { .. } => "VENDOR_API_ERROR",
            IntegrationError::DuplicateIntegration(_) => "DUPLICATE_INTEGRATION",
            IntegrationError::InvalidRequest(_) => "VALIDATION_FAILED",
            IntegrationError::Storage(_) => "INTERNAL_SERVER_ERROR",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            IntegrationError::AlreadyConnected { .. }
            | IntegrationError::DuplicateIntegration(_) => StatusCode::CONFLICT,
            IntegrationError::NotFound => StatusCode::NOT_FOUND,
            IntegrationError::InvalidState(_)
            | IntegrationError::UnsupportedConnector(_)
            | IntegrationError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            IntegrationError::VendorApi { .. } => StatusCode::BAD_GATEWAY,
            IntegrationError::CredentialCorrupted(_)
            | IntegrationError::EncryptionUnavailable(_)
            | IntegrationError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<RepositoryError> for IntegrationError {
    fn from(error: RepositoryError) -> Self {
        match error {
            RepositoryError::Duplicate(details) => IntegrationError::DuplicateIntegration(details),
            RepositoryError::NotFound => IntegrationError::NotFound,
            RepositoryError::Db(err) => IntegrationError::Storage(err.to_string()),
        }
    }
}

/// Unified API error response structure
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiError {
    /// HTTP status code for the response
    #[serde(skip_serializing, skip_deserializing)]
    pub status: StatusCode,
    /// Error code for programmatic handling
    pub code: Box<str>,
    /// Human-readable error message
    pub message: Box<str>,
    /// Additional error details (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Box<serde_json::Value>>,
    /// Suggested retry delay in seconds (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    /// Correlation trace ID for debugging
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Box<str>>,
}

impl ApiError {
    /// Create a new API error with the given status code and message
    pub fn new<S: Into<String>>(status: StatusCode, code: S, message: S) -> Self {
        Self {
            status,
            code: code.into().into_boxed_str(),
            message: message.into().into_boxed_str(),
            details: None,
            retry_after: None,
            trace_id: Self::current_trace_id(),
        }
    }

    /// Add details to the error
    pub fn with_details<V: Into<serde_json::Value>>(mut self, details: V) -> Self {
        self.details = Some(Box::new(details.into()));
        self
    }

    /// Set retry after delay
    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    fn current_trace_id() -> Option<Box<str>> {
        telemetry::current_request_id()
            .map(|trace_id| trace_id.into_boxed_str())
            .or_else(|| {
                Some(format!("corr-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]).into_boxed_str())
            })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/problem+json"),
        );

        if let Some(retry_after) = self.retry_after
            && let Ok(header_value) = HeaderValue::from_str(&retry_after.to_string())
        {
            headers.insert("retry-after", header_value);
        }

        (self.status, headers, axum::Json(self)).into_response()
    }
}

impl From<IntegrationError> for ApiError {
    fn from(error: IntegrationError) -> Self {
        let status = error.status_code();
        if status.is_server_error() {
            tracing::error!(error = %error, "Integration operation failed");
        }

        // Internal failures keep their details in the logs only.
        let message = match &error {
            IntegrationError::Storage(_) => "An internal error occurred".to_string(),
            IntegrationError::CredentialCorrupted(_) => {
                "Stored credentials could not be read".to_string()
            }
            IntegrationError::EncryptionUnavailable(_) => {
                "Credential encryption is unavailable".to_string()
            }
            other => other.to_string(),
        };

        let mut api_error = ApiError::new(status, error.code().to_string(), message);
        if let IntegrationError::VendorApi {
            connector_type,
            source,
        } = &error
        {
            api_error = api_error.with_details(serde_json::json!({
                "connector": connector_type.as_str(),
                "retryable": source.is_retryable(),
            }));
            if let ConnectorError::RateLimitError {
                retry_after: Some(seconds),
            } = source
            {
                api_error = api_error.with_retry_after(*seconds);
            }
        }
        api_error
    }
}

impl From<crate::webhook_verification::VerificationError> for ApiError {
    fn from(error: crate::webhook_verification::VerificationError) -> Self {
        tracing::warn!(error = %error, "Webhook delivery rejected");
        ApiError::new(error.status_code(), error.code().to_string(), error.to_string())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        tracing::error!("Internal error: {:?}", error);

        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            "An internal error occurred",
        )
    }
}
