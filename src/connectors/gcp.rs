//! Google Cloud connector implementation
//!
//! Service-account connector. The caller uploads the service account JSON
//! key; authorization signs a JWT assertion with it and exchanges that for an
//! access token, which doubles as the live validation.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::info;

use crate::config::AppConfig;
use crate::connectors::http::{endpoint, send_json};
use crate::connectors::trait_::{
    Authorization, AuthorizationData, AuthorizationIntent, AuthorizationKind, AuthorizeParams,
    Connector, ConnectorError, Credentials, VendorAccount,
};
use crate::models::{ConnectorType, CredentialData, CredentialType};

pub const SERVICE_ACCOUNT_FIELD: &str = "service_account_json";
const SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform.read-only";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_TTL_SECS: i64 = 3600;
const CONSOLE_URL: &str = "https://console.cloud.google.com/iam-admin/serviceaccounts";

#[derive(Debug, Clone)]
pub struct GcpSettings {
    /// Token endpoint; the `token_uri` inside uploaded keys is ignored
    pub token_uri: String,
    pub api_base: String,
}

impl GcpSettings {
    pub fn from_config(config: &AppConfig) -> Option<Self> {
        config.gcp.enabled.then(|| Self {
            token_uri: config.gcp.token_uri.clone(),
            api_base: config.gcp.api_base.clone(),
        })
    }
}

#[derive(Deserialize)]
struct ServiceAccountKey {
    #[serde(rename = "type")]
    key_type: Option<String>,
    project_id: Option<String>,
    private_key: Option<String>,
    client_email: Option<String>,
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Project {
    #[serde(default)]
    name: Option<String>,
    #[serde(default, rename = "projectNumber")]
    project_number: Option<String>,
}

pub struct GcpConnector {
    settings: GcpSettings,
    http: reqwest::Client,
}

impl GcpConnector {
    pub fn new(settings: GcpSettings, http: reqwest::Client) -> Self {
        Self { settings, http }
    }

    /// Exchange a signed assertion for an access token
    async fn mint_token(&self, credentials: &Credentials) -> Result<Credentials, ConnectorError> {
        let key_json = credentials.require(SERVICE_ACCOUNT_FIELD)?;
        let key: ServiceAccountKey = serde_json::from_str(key_json)
            .map_err(|e| ConnectorError::invalid_input(format!("service account JSON: {}", e)))?;
        let client_email = key
            .client_email
            .as_deref()
            .ok_or_else(|| ConnectorError::invalid_input("client_email is missing"))?;
        let private_key = key
            .private_key
            .as_deref()
            .ok_or_else(|| ConnectorError::invalid_input("private_key is missing"))?;

        let signing_key = EncodingKey::from_rsa_pem(private_key.as_bytes())
            .map_err(|e| ConnectorError::invalid_input(format!("private_key is not RSA PEM: {}", e)))?;
        let now = Utc::now().timestamp();
        let claims = AssertionClaims {
            iss: client_email,
            scope: SCOPE,
            aud: &self.settings.token_uri,
            iat: now,
            exp: now + ASSERTION_TTL_SECS,
        };
        let assertion = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &signing_key)
            .map_err(|e| ConnectorError::invalid_input(format!("failed to sign assertion: {}", e)))?;

        let token: TokenResponse = send_json(
            self.http
                .post(&self.settings.token_uri)
                .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())]),
        )
        .await?;

        let mut data = credentials.data.clone();
        data.insert("access_token".to_string(), token.access_token);
        let expires_at = token
            .expires_in
            .filter(|secs| *secs > 0)
            .map(|secs| Utc::now() + Duration::seconds(secs));
        Ok(Credentials::new(CredentialType::ServiceAccount, data).with_expiry(expires_at))
    }

    async fn fetch_project(
        &self,
        access_token: &str,
        project_id: &str,
    ) -> Result<Project, ConnectorError> {
        send_json(
            self.http
                .get(endpoint(
                    &self.settings.api_base,
                    &format!("/v1/projects/{}", project_id),
                ))
                .bearer_auth(access_token),
        )
        .await
    }
}

#[async_trait]
impl Connector for GcpConnector {
    fn connector_type(&self) -> ConnectorType {
        ConnectorType::Gcp
    }

    fn authorization_kind(&self) -> AuthorizationKind {
        AuthorizationKind::ApiKey
    }

    fn credential_type(&self) -> CredentialType {
        CredentialType::ServiceAccount
    }

    async fn initiate_authorization(
        &self,
        _params: AuthorizeParams,
    ) -> Result<AuthorizationIntent, ConnectorError> {
        Ok(AuthorizationIntent {
            kind: AuthorizationKind::ApiKey,
            url: CONSOLE_URL.to_string(),
        })
    }

    async fn complete_authorization(
        &self,
        data: AuthorizationData,
    ) -> Result<Authorization, ConnectorError> {
        let raw = data.credentials.ok_or_else(|| {
            ConnectorError::invalid_input(format!("{} is required", SERVICE_ACCOUNT_FIELD))
        })?;
        let normalized = self
            .normalize_credentials(&raw)
            .map_err(|errors| ConnectorError::invalid_input(errors.join("; ")))?;

        let credentials = self
            .mint_token(&Credentials::new(CredentialType::ServiceAccount, normalized))
            .await?;
        let project_id = credentials.require("project_id")?.to_string();
        let client_email = credentials.require("client_email")?.to_string();
        let project = self
            .fetch_project(credentials.require("access_token")?, &project_id)
            .await?;

        let mut account = VendorAccount {
            connector_user_id: client_email,
            connector_organization_id: project_id.clone(),
            ..Default::default()
        };
        account
            .metadata
            .insert("project_id".to_string(), project_id.clone());
        if let Some(name) = project.name {
            account.metadata.insert("project_name".to_string(), name);
        }
        if let Some(number) = project.project_number {
            account.metadata.insert("project_number".to_string(), number);
        }

        info!(project_id = %project_id, "Google Cloud service account authorized");
        Ok(Authorization {
            credentials,
            account,
        })
    }

    async fn validate_credentials(&self, credentials: &Credentials) -> Result<(), ConnectorError> {
        let minted = self.mint_token(credentials).await?;
        self.fetch_project(
            minted.require("access_token")?,
            credentials.require("project_id")?,
        )
        .await?;
        Ok(())
    }

    async fn refresh_credentials(
        &self,
        credentials: &Credentials,
    ) -> Result<Credentials, ConnectorError> {
        self.mint_token(credentials).await
    }

    fn normalize_credentials(&self, raw: &CredentialData) -> Result<CredentialData, Vec<String>> {
        let Some(key_json) = raw.get(SERVICE_ACCOUNT_FIELD).filter(|v| !v.trim().is_empty()) else {
            return Err(vec![format!("{} is required", SERVICE_ACCOUNT_FIELD)]);
        };
        let value: JsonValue = serde_json::from_str(key_json)
            .map_err(|e| vec![format!("{} is not valid JSON: {}", SERVICE_ACCOUNT_FIELD, e)])?;
        let key: ServiceAccountKey = serde_json::from_value(value.clone())
            .map_err(|e| vec![format!("{} has an unexpected shape: {}", SERVICE_ACCOUNT_FIELD, e)])?;

        let mut errors = Vec::new();
        if key.key_type.as_deref() != Some("service_account") {
            errors.push("type must be \"service_account\"".to_string());
        }
        let required = [
            ("project_id", &key.project_id),
            ("client_email", &key.client_email),
            ("private_key", &key.private_key),
        ];
        for (field, value) in required {
            if value.as_deref().is_none_or(|v| v.trim().is_empty()) {
                errors.push(format!("{} is required in the service account key", field));
            }
        }
        if key
            .private_key
            .as_deref()
            .is_some_and(|pk| !pk.contains("PRIVATE KEY"))
        {
            errors.push("private_key must be a PEM-encoded key".to_string());
        }
        if !errors.is_empty() {
            return Err(errors);
        }

        let mut normalized = CredentialData::new();
        normalized.insert(SERVICE_ACCOUNT_FIELD.to_string(), value.to_string());
        if let Some(project_id) = key.project_id {
            normalized.insert("project_id".to_string(), project_id);
        }
        if let Some(client_email) = key.client_email {
            normalized.insert("client_email".to_string(), client_email);
        }
        Ok(normalized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TEST_KEY: &str = include_str!("../../tests/fixtures/test_rsa_key.pem");

    fn connector(base: &str) -> GcpConnector {
        GcpConnector::new(
            GcpSettings {
                token_uri: format!("{}/token", base),
                api_base: base.to_string(),
            },
            reqwest::Client::new(),
        )
    }

    fn key_json() -> String {
        json!({
            "type": "service_account",
            "project_id": "acme-prod",
            "private_key_id": "k1",
            "private_key": TEST_KEY,
            "client_email": "reader@acme-prod.iam.gserviceaccount.com",
            "token_uri": "https://attacker.example.com/token"
        })
        .to_string()
    }

    fn raw(json: String) -> CredentialData {
        let mut raw = CredentialData::new();
        raw.insert(SERVICE_ACCOUNT_FIELD.to_string(), json);
        raw
    }

    #[test]
    fn normalize_requires_service_account_json() {
        let errors = connector("http://localhost")
            .normalize_credentials(&CredentialData::new())
            .unwrap_err();
        assert_eq!(errors, vec!["service_account_json is required".to_string()]);

        let errors = connector("http://localhost")
            .normalize_credentials(&raw("{not json".to_string()))
            .unwrap_err();
        assert!(errors[0].contains("not valid JSON"));
    }

    #[test]
    fn normalize_lists_missing_fields() {
        let errors = connector("http://localhost")
            .normalize_credentials(&raw(json!({"type": "authorized_user"}).to_string()))
            .unwrap_err();
        assert_eq!(errors.len(), 4);
    }

    #[test]
    fn normalize_extracts_identity() {
        let normalized = connector("http://localhost")
            .normalize_credentials(&raw(key_json()))
            .unwrap();
        assert_eq!(normalized.get("project_id").map(String::as_str), Some("acme-prod"));
        assert_eq!(
            normalized.get("client_email").map(String::as_str),
            Some("reader@acme-prod.iam.gserviceaccount.com")
        );
    }

    #[tokio::test]
    async fn complete_authorization_exchanges_assertion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Ajwt-bearer"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "ya29.token",
                "expires_in": 3599,
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/projects/acme-prod"))
            .and(header("authorization", "Bearer ya29.token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "projectId": "acme-prod",
                "name": "Acme Production",
                "projectNumber": "4815162342"
            })))
            .mount(&server)
            .await;

        let authorization = connector(&server.uri())
            .complete_authorization(AuthorizationData {
                credentials: Some(raw(key_json())),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(authorization.account.connector_organization_id, "acme-prod");
        assert_eq!(
            authorization.account.metadata.get("project_name").map(String::as_str),
            Some("Acme Production")
        );
        assert_eq!(
            authorization.credentials.credential_type,
            CredentialType::ServiceAccount
        );
        assert_eq!(authorization.credentials.get("access_token"), Some("ya29.token"));
        assert!(authorization.credentials.expires_at.is_some());
    }

    #[tokio::test]
    async fn rejected_assertion_is_authentication_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(401).set_body_json(json!({"error": "invalid_grant"})),
            )
            .mount(&server)
            .await;

        let error = connector(&server.uri())
            .complete_authorization(AuthorizationData {
                credentials: Some(raw(key_json())),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(error, ConnectorError::AuthenticationError { .. }));
    }
}
