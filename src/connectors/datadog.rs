//! Datadog connector implementation
//!
//! API-key connector: there is no redirect, the caller supplies an API key
//! (and optionally an application key) which is checked against the
//! validation endpoint before it is stored.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use crate::config::AppConfig;
use crate::connectors::http::{endpoint, send_json};
use crate::connectors::trait_::{
    Authorization, AuthorizationData, AuthorizationIntent, AuthorizationKind, AuthorizeParams,
    Connector, ConnectorError, Credentials, VendorAccount,
};
use crate::models::{ConnectorType, CredentialData, CredentialType};

const API_KEY_LEN: usize = 32;
const APPLICATION_KEY_LEN: usize = 40;

#[derive(Debug, Clone)]
pub struct DatadogSettings {
    pub api_base: String,
    pub app_base: String,
}

impl DatadogSettings {
    pub fn from_config(config: &AppConfig) -> Option<Self> {
        config.datadog.enabled.then(|| Self {
            api_base: config.datadog.api_base.clone(),
            app_base: config.datadog.app_base.clone(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ValidateResponse {
    #[serde(default)]
    valid: bool,
}

pub struct DatadogConnector {
    settings: DatadogSettings,
    http: reqwest::Client,
}

impl DatadogConnector {
    pub fn new(settings: DatadogSettings, http: reqwest::Client) -> Self {
        Self { settings, http }
    }
}

fn check_key(
    raw: &CredentialData,
    field: &str,
    expected_len: usize,
    required: bool,
    errors: &mut Vec<String>,
) -> Option<String> {
    let value = raw.get(field).map(|v| v.trim()).filter(|v| !v.is_empty());
    match value {
        None if required => {
            errors.push(format!("{} is required", field));
            None
        }
        None => None,
        Some(value)
            if value.len() != expected_len || !value.chars().all(|c| c.is_ascii_hexdigit()) =>
        {
            errors.push(format!(
                "{} must be {} hexadecimal characters",
                field, expected_len
            ));
            None
        }
        Some(value) => Some(value.to_ascii_lowercase()),
    }
}

#[async_trait]
impl Connector for DatadogConnector {
    fn connector_type(&self) -> ConnectorType {
        ConnectorType::Datadog
    }

    fn authorization_kind(&self) -> AuthorizationKind {
        AuthorizationKind::ApiKey
    }

    async fn initiate_authorization(
        &self,
        _params: AuthorizeParams,
    ) -> Result<AuthorizationIntent, ConnectorError> {
        Ok(AuthorizationIntent {
            kind: AuthorizationKind::ApiKey,
            url: endpoint(&self.settings.app_base, "/organization-settings/api-keys"),
        })
    }

    async fn complete_authorization(
        &self,
        data: AuthorizationData,
    ) -> Result<Authorization, ConnectorError> {
        let raw = data
            .credentials
            .ok_or_else(|| ConnectorError::invalid_input("api_key is required"))?;
        let normalized = self
            .normalize_credentials(&raw)
            .map_err(|errors| ConnectorError::invalid_input(errors.join("; ")))?;
        let credentials = Credentials::new(CredentialType::Token, normalized);

        self.validate_credentials(&credentials).await?;

        let api_key = credentials.require("api_key")?;
        let mut account = VendorAccount::default();
        account.metadata.insert(
            "api_key_last4".to_string(),
            api_key[api_key.len().saturating_sub(4)..].to_string(),
        );
        account.metadata.insert(
            "has_application_key".to_string(),
            credentials.get("application_key").is_some().to_string(),
        );
        account
            .metadata
            .insert("site".to_string(), self.settings.api_base.clone());

        info!("Datadog API key validated");
        Ok(Authorization {
            credentials,
            account,
        })
    }

    async fn validate_credentials(&self, credentials: &Credentials) -> Result<(), ConnectorError> {
        let api_key = credentials.require("api_key")?;
        let mut request = self
            .http
            .get(endpoint(&self.settings.api_base, "/api/v1/validate"))
            .header("DD-API-KEY", api_key);
        if let Some(application_key) = credentials.get("application_key") {
            request = request.header("DD-APPLICATION-KEY", application_key);
        }

        let response: ValidateResponse = send_json(request).await?;
        if response.valid {
            Ok(())
        } else {
            Err(ConnectorError::AuthenticationError {
                details: "Datadog reported the API key as invalid".to_string(),
                error_code: None,
            })
        }
    }

    fn normalize_credentials(&self, raw: &CredentialData) -> Result<CredentialData, Vec<String>> {
        let mut errors = Vec::new();
        let api_key = check_key(raw, "api_key", API_KEY_LEN, true, &mut errors);
        let application_key =
            check_key(raw, "application_key", APPLICATION_KEY_LEN, false, &mut errors);
        if !errors.is_empty() {
            return Err(errors);
        }

        let mut normalized = CredentialData::new();
        if let Some(api_key) = api_key {
            normalized.insert("api_key".to_string(), api_key);
        }
        if let Some(application_key) = application_key {
            normalized.insert("application_key".to_string(), application_key);
        }
        Ok(normalized)
    }
}
