//! GitHub App connector implementation
//!
//! Installation-style connector: the user installs the app on a GitHub
//! account and the setup callback carries the installation id. The app
//! authenticates with an RS256 JWT and mints short-lived installation access
//! tokens, which are cached per installation.

use std::num::NonZeroUsize;

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::cache::TtlCache;
use crate::config::AppConfig;
use crate::connectors::http::{endpoint, send_empty, send_json};
use crate::connectors::inbox::WebhookInbox;
use crate::connectors::trait_::{
    Authorization, AuthorizationData, AuthorizationIntent, AuthorizationKind, AuthorizeParams,
    Connector, ConnectorError, Credentials, EventAction, InboundEvent, RemoteResource,
    SyncOutcome, SyncParams, VendorAccount, WebhookDelivery,
};
use crate::models::{ConnectorType, CredentialData, CredentialType, IntegrationStatus};
use crate::webhook_verification::{
    GITHUB_SIGNATURE_HEADER, VerificationError, header_str, verify_github_signature,
};

pub const GITHUB_EVENT_HEADER: &str = "x-github-event";
pub const GITHUB_DELIVERY_HEADER: &str = "x-github-delivery";

const ACCEPT: &str = "application/vnd.github+json";
const API_VERSION: &str = "2022-11-28";
const APP_JWT_TTL_SECS: i64 = 540;
const APP_JWT_BACKDATE_SECS: i64 = 60;
const PER_PAGE: usize = 100;
const MAX_PAGES: u32 = 100;
const TOKEN_CACHE_CAPACITY: usize = 1024;
const TOKEN_REFRESH_MARGIN_SECS: i64 = 300;

/// GitHub App identity and endpoints
#[derive(Clone)]
pub struct GitHubAppSettings {
    pub app_id: String,
    pub app_slug: String,
    /// PEM-encoded RSA private key
    pub private_key: String,
    pub webhook_secret: Option<String>,
    /// Public URL GitHub should deliver app webhooks to
    pub webhook_url: Option<String>,
    pub api_base: String,
    pub web_base: String,
}

impl GitHubAppSettings {
    pub fn from_config(config: &AppConfig) -> Option<Self> {
        let github = &config.github;
        Some(Self {
            app_id: github.app_id.clone()?,
            app_slug: github.app_slug.clone()?,
            private_key: github.private_key.clone()?,
            webhook_secret: github.webhook_secret.clone(),
            webhook_url: Some(format!(
                "{}/webhooks/github",
                config.public_base_url.trim_end_matches('/')
            )),
            api_base: github.api_base.clone(),
            web_base: github.web_base.clone(),
        })
    }
}

impl std::fmt::Debug for GitHubAppSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubAppSettings")
            .field("app_id", &self.app_id)
            .field("app_slug", &self.app_slug)
            .field("webhook_secret", &self.webhook_secret.as_ref().map(|_| "<redacted>"))
            .field("webhook_url", &self.webhook_url)
            .field("api_base", &self.api_base)
            .field("web_base", &self.web_base)
            .finish()
    }
}

#[derive(Debug, Serialize)]
struct AppClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

/// Installation access token as minted by GitHub
#[derive(Debug, Clone, Deserialize)]
pub struct InstallationToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct GitHubAccount {
    id: i64,
    login: String,
    #[serde(rename = "type")]
    account_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GitHubInstallation {
    id: i64,
    account: Option<GitHubAccount>,
    #[serde(default)]
    target_type: Option<String>,
    #[serde(default)]
    repository_selection: Option<String>,
    #[serde(default)]
    html_url: Option<String>,
    #[serde(default)]
    suspended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize)]
struct GitHubPermissions {
    #[serde(default)]
    admin: bool,
    #[serde(default)]
    push: bool,
    #[serde(default)]
    pull: bool,
}

#[derive(Debug, Deserialize)]
struct GitHubRepository {
    id: i64,
    name: String,
    full_name: String,
    html_url: String,
    #[serde(default)]
    private: bool,
    #[serde(default)]
    default_branch: Option<String>,
    #[serde(default)]
    permissions: Option<GitHubPermissions>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    archived: bool,
    #[serde(default)]
    visibility: Option<String>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    pushed_at: Option<DateTime<Utc>>,
}

impl From<GitHubRepository> for RemoteResource {
    fn from(repo: GitHubRepository) -> Self {
        let permissions = repo.permissions.unwrap_or_default();
        RemoteResource {
            external_id: repo.id,
            name: repo.name,
            full_name: repo.full_name,
            url: repo.html_url,
            is_private: repo.private,
            default_branch: repo.default_branch.unwrap_or_else(|| "main".to_string()),
            can_admin: permissions.admin,
            can_push: permissions.push,
            can_pull: permissions.pull,
            metadata: Some(json!({
                "description": repo.description,
                "language": repo.language,
                "archived": repo.archived,
                "visibility": repo.visibility,
            })),
            created_at: repo.created_at,
            updated_at: repo.updated_at,
            pushed_at: repo.pushed_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RepositoryPage {
    #[serde(default)]
    total_count: usize,
    #[serde(default)]
    repositories: Vec<GitHubRepository>,
}

#[derive(Debug, Deserialize)]
struct HookConfig {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    content_type: Option<String>,
}

/// GitHub App connector
pub struct GitHubConnector {
    settings: GitHubAppSettings,
    signing_key: EncodingKey,
    http: reqwest::Client,
    tokens: TtlCache<String, InstallationToken>,
    inbox: WebhookInbox,
}

impl GitHubConnector {
    /// Create a connector; fails when the private key is not a valid RSA PEM
    pub fn new(settings: GitHubAppSettings, http: reqwest::Client) -> Result<Self, ConnectorError> {
        let signing_key = EncodingKey::from_rsa_pem(settings.private_key.as_bytes())
            .map_err(|e| ConnectorError::configuration(format!("invalid GitHub App private key: {}", e)))?;
        let capacity = NonZeroUsize::new(TOKEN_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            settings,
            signing_key,
            http,
            tokens: TtlCache::new(capacity, Duration::seconds(TOKEN_REFRESH_MARGIN_SECS)),
            inbox: WebhookInbox::default(),
        })
    }

    pub fn with_inbox(mut self, inbox: WebhookInbox) -> Self {
        self.inbox = inbox;
        self
    }

    fn app_jwt(&self) -> Result<String, ConnectorError> {
        let now = Utc::now().timestamp();
        let claims = AppClaims {
            iat: now - APP_JWT_BACKDATE_SECS,
            exp: now + APP_JWT_TTL_SECS,
            iss: self.settings.app_id.clone(),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.signing_key)
            .map_err(|e| ConnectorError::configuration(format!("failed to sign app JWT: {}", e)))
    }

    fn request(&self, method: Method, path: &str, bearer: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, endpoint(&self.settings.api_base, path))
            .header(reqwest::header::ACCEPT, ACCEPT)
            .header("X-GitHub-Api-Version", API_VERSION)
            .bearer_auth(bearer)
    }

    fn install_url(&self, state: &str) -> Result<Url, ConnectorError> {
        let mut url = Url::parse(&format!(
            "{}/apps/{}/installations/new",
            self.settings.web_base.trim_end_matches('/'),
            self.settings.app_slug
        ))
        .map_err(|e| ConnectorError::configuration(format!("invalid GitHub web base: {}", e)))?;
        url.query_pairs_mut().append_pair("state", state);
        Ok(url)
    }

    async fn fetch_installation(
        &self,
        installation_id: &str,
    ) -> Result<GitHubInstallation, ConnectorError> {
        let jwt = self.app_jwt()?;
        send_json(self.request(
            Method::GET,
            &format!("/app/installations/{}", installation_id),
            &jwt,
        ))
        .await
    }

    /// Installation token for `installation_id`, served from cache until it
    /// gets close to expiry
    pub async fn installation_token(
        &self,
        installation_id: &str,
    ) -> Result<InstallationToken, ConnectorError> {
        if let Some(token) = self.tokens.get(&installation_id.to_string()) {
            debug!(installation_id, "Using cached installation token");
            return Ok(token);
        }

        let jwt = self.app_jwt()?;
        let token: InstallationToken = send_json(self.request(
            Method::POST,
            &format!("/app/installations/{}/access_tokens", installation_id),
            &jwt,
        ))
        .await?;

        self.tokens
            .insert(installation_id.to_string(), token.clone(), token.expires_at);
        Ok(token)
    }

    fn token_credentials(installation_id: &str, token: &InstallationToken) -> Credentials {
        let mut data = CredentialData::new();
        data.insert("installation_id".to_string(), installation_id.to_string());
        data.insert("access_token".to_string(), token.token.clone());
        Credentials::new(CredentialType::Token, data).with_expiry(Some(token.expires_at))
    }

    async fn list_repositories(
        &self,
        access_token: &str,
    ) -> Result<Vec<RemoteResource>, ConnectorError> {
        let mut resources = Vec::new();
        let mut page = 1u32;

        loop {
            let request = self
                .request(Method::GET, "/installation/repositories", access_token)
                .query(&[("per_page", PER_PAGE.to_string()), ("page", page.to_string())]);
            let batch: RepositoryPage = send_json(request).await?;
            let fetched = batch.repositories.len();
            resources.extend(batch.repositories.into_iter().map(RemoteResource::from));

            if fetched < PER_PAGE || resources.len() >= batch.total_count {
                break;
            }
            if page >= MAX_PAGES {
                warn!(pages = page, "Stopping repository listing at page limit");
                break;
            }
            page += 1;
        }

        Ok(resources)
    }
}

fn installation_id_of(payload: &JsonValue) -> Option<String> {
    payload
        .get("installation")
        .and_then(|installation| installation.get("id"))
        .and_then(JsonValue::as_i64)
        .map(|id| id.to_string())
}

fn repository_ids(payload: &JsonValue, field: &str) -> Vec<i64> {
    payload
        .get(field)
        .and_then(JsonValue::as_array)
        .map(|repos| {
            repos
                .iter()
                .filter_map(|repo| repo.get("id").and_then(JsonValue::as_i64))
                .collect()
        })
        .unwrap_or_default()
}

fn parse_installation_id(raw: Option<&str>) -> Result<String, ConnectorError> {
    let raw = raw
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ConnectorError::invalid_input("installation_id is required"))?;
    match raw.parse::<i64>() {
        Ok(id) if id > 0 => Ok(id.to_string()),
        _ => Err(ConnectorError::invalid_input(format!(
            "installation_id '{}' is not a positive integer",
            raw
        ))),
    }
}

#[async_trait]
impl Connector for GitHubConnector {
    fn connector_type(&self) -> ConnectorType {
        ConnectorType::Github
    }

    fn authorization_kind(&self) -> AuthorizationKind {
        AuthorizationKind::Installation
    }

    async fn initiate_authorization(
        &self,
        params: AuthorizeParams,
    ) -> Result<AuthorizationIntent, ConnectorError> {
        info!(
            organization_id = %params.organization_id,
            "Starting GitHub App installation"
        );
        let url = self.install_url(&params.state)?;
        Ok(AuthorizationIntent {
            kind: AuthorizationKind::Installation,
            url: url.to_string(),
        })
    }

    async fn complete_authorization(
        &self,
        data: AuthorizationData,
    ) -> Result<Authorization, ConnectorError> {
        let installation_id = parse_installation_id(data.installation_id.as_deref())?;

        let installation = self.fetch_installation(&installation_id).await?;
        let token = self.installation_token(&installation_id).await?;

        let mut account = VendorAccount {
            bot_id: installation.id.to_string(),
            ..Default::default()
        };
        if let Some(owner) = &installation.account {
            account.connector_user_id = owner.id.to_string();
            account.connector_organization_id = owner.login.clone();
            account
                .metadata
                .insert("account_login".to_string(), owner.login.clone());
            if let Some(account_type) = &owner.account_type {
                account
                    .metadata
                    .insert("account_type".to_string(), account_type.clone());
            }
        }
        let optional = [
            ("target_type", installation.target_type),
            ("repository_selection", installation.repository_selection),
            ("html_url", installation.html_url),
            ("suspended_at", installation.suspended_at.map(|at| at.to_rfc3339())),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                account.metadata.insert(key.to_string(), value);
            }
        }

        info!(installation_id = %installation_id, "GitHub installation authorized");
        Ok(Authorization {
            credentials: Self::token_credentials(&installation_id, &token),
            account,
        })
    }

    async fn validate_credentials(&self, credentials: &Credentials) -> Result<(), ConnectorError> {
        let access_token = credentials.require("access_token")?;
        let request = self
            .request(Method::GET, "/installation/repositories", access_token)
            .query(&[("per_page", "1")]);
        let _: RepositoryPage = send_json(request).await?;
        Ok(())
    }

    async fn refresh_credentials(
        &self,
        credentials: &Credentials,
    ) -> Result<Credentials, ConnectorError> {
        let installation_id = credentials.require("installation_id")?.to_string();
        self.tokens.invalidate(&installation_id);
        let token = self.installation_token(&installation_id).await?;
        Ok(Self::token_credentials(&installation_id, &token))
    }

    async fn revoke_credentials(&self, credentials: &Credentials) -> Result<(), ConnectorError> {
        let installation_id = credentials.require("installation_id")?.to_string();
        self.tokens.invalidate(&installation_id);

        let jwt = self.app_jwt()?;
        let result = send_empty(self.request(
            Method::DELETE,
            &format!("/app/installations/{}", installation_id),
            &jwt,
        ))
        .await;

        match result {
            Err(ConnectorError::HttpError { status: 404, .. }) => {
                debug!(installation_id = %installation_id, "Installation already removed");
                Ok(())
            }
            other => other,
        }
    }

    async fn configure_webhooks(
        &self,
        integration_id: Uuid,
        _credentials: &Credentials,
    ) -> Result<(), ConnectorError> {
        let (Some(url), Some(secret)) = (&self.settings.webhook_url, &self.settings.webhook_secret)
        else {
            debug!(%integration_id, "GitHub webhook delivery not configured; skipping");
            return Ok(());
        };

        let jwt = self.app_jwt()?;
        let current: HookConfig =
            send_json(self.request(Method::GET, "/app/hook/config", &jwt)).await?;
        if current.url.as_deref() == Some(url.as_str())
            && current.content_type.as_deref() == Some("json")
        {
            return Ok(());
        }

        send_empty(
            self.request(Method::PATCH, "/app/hook/config", &jwt)
                .json(&json!({
                    "url": url,
                    "content_type": "json",
                    "secret": secret,
                    "insecure_ssl": "0",
                })),
        )
        .await?;
        info!(%integration_id, "GitHub App webhook configuration updated");
        Ok(())
    }

    async fn sync(&self, params: SyncParams) -> Result<SyncOutcome, ConnectorError> {
        let installation_id = params.credentials.require("installation_id")?.to_string();

        let mut credentials = None;
        let access_token = match params.credentials.get("access_token") {
            Some(token) if !params.credentials.is_expired_at(Utc::now()) => token.to_string(),
            _ => {
                let refreshed = self.refresh_credentials(&params.credentials).await?;
                let token = refreshed.require("access_token")?.to_string();
                credentials = Some(refreshed);
                token
            }
        };

        let resources = self.list_repositories(&access_token).await?;
        info!(
            integration_id = %params.integration.id,
            installation_id = %installation_id,
            repositories = resources.len(),
            "Fetched GitHub installation repositories"
        );

        let mut metadata = params.integration.metadata_map();
        metadata.insert("repository_count".to_string(), resources.len().to_string());

        Ok(SyncOutcome {
            resources: Some(resources),
            metadata: Some(metadata),
            credentials,
        })
    }

    async fn process_event(&self, event: &InboundEvent) -> Result<Vec<EventAction>, ConnectorError> {
        let Some(bot_id) = installation_id_of(&event.payload) else {
            debug!(event_type = %event.event_type, "GitHub event without installation");
            return Ok(Vec::new());
        };
        let action = event
            .payload
            .get("action")
            .and_then(JsonValue::as_str)
            .unwrap_or_default();

        let actions = match (event.event_type.as_str(), action) {
            ("installation", "deleted") => vec![EventAction::SetStatus {
                bot_id,
                status: IntegrationStatus::Inactive,
            }],
            ("installation", "suspend") => vec![EventAction::SetStatus {
                bot_id,
                status: IntegrationStatus::Suspended,
            }],
            ("installation", "unsuspend") => vec![
                EventAction::SetStatus {
                    bot_id: bot_id.clone(),
                    status: IntegrationStatus::Active,
                },
                EventAction::Resync { bot_id },
            ],
            ("installation_repositories", "added") => vec![EventAction::Resync { bot_id }],
            ("installation_repositories", "removed") => {
                let external_ids = repository_ids(&event.payload, "repositories_removed");
                if external_ids.is_empty() {
                    Vec::new()
                } else {
                    vec![EventAction::RemoveResources {
                        bot_id,
                        external_ids,
                    }]
                }
            }
            ("repository", "deleted") => {
                let external_ids = event
                    .payload
                    .get("repository")
                    .and_then(|repo| repo.get("id"))
                    .and_then(JsonValue::as_i64)
                    .into_iter()
                    .collect::<Vec<_>>();
                vec![EventAction::RemoveResources {
                    bot_id,
                    external_ids,
                }]
            }
            ("repository", _) => vec![EventAction::Resync { bot_id }],
            _ => Vec::new(),
        };

        Ok(actions)
    }

    fn normalize_credentials(&self, raw: &CredentialData) -> Result<CredentialData, Vec<String>> {
        let installation_id = parse_installation_id(raw.get("installation_id").map(String::as_str))
            .map_err(|e| vec![e.to_string()])?;
        let mut normalized = raw.clone();
        normalized.insert("installation_id".to_string(), installation_id);
        Ok(normalized)
    }

    fn verify_webhook(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<WebhookDelivery, VerificationError> {
        let secret = self.settings.webhook_secret.as_deref().ok_or_else(|| {
            VerificationError::NotConfigured {
                connector: ConnectorType::Github.to_string(),
            }
        })?;
        verify_github_signature(body, header_str(headers, GITHUB_SIGNATURE_HEADER), secret)?;

        let event_type = header_str(headers, GITHUB_EVENT_HEADER);
        if event_type.is_empty() {
            return Err(VerificationError::MalformedPayload {
                details: "missing X-GitHub-Event header".to_string(),
            });
        }
        if event_type == "ping" {
            return Ok(WebhookDelivery::Ignored);
        }

        let payload: JsonValue =
            serde_json::from_slice(body).map_err(|e| VerificationError::MalformedPayload {
                details: e.to_string(),
            })?;
        let delivery_id = Some(header_str(headers, GITHUB_DELIVERY_HEADER))
            .filter(|id| !id.is_empty())
            .map(str::to_string);

        Ok(WebhookDelivery::Event(
            InboundEvent::new(ConnectorType::Github, event_type, payload)
                .with_delivery_id(delivery_id),
        ))
    }

    fn webhook_inbox(&self) -> Option<&WebhookInbox> {
        Some(&self.inbox)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webhook_verification::sign_hex;
    use axum::http::HeaderValue;
    use wiremock::matchers::{body_partial_json, header, header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TEST_KEY: &str = include_str!("../../tests/fixtures/test_rsa_key.pem");

    fn settings(api_base: &str) -> GitHubAppSettings {
        GitHubAppSettings {
            app_id: "4242".to_string(),
            app_slug: "acme-integrations".to_string(),
            private_key: TEST_KEY.to_string(),
            webhook_secret: Some("hook-secret".to_string()),
            webhook_url: Some("https://platform.example.com/webhooks/github".to_string()),
            api_base: api_base.to_string(),
            web_base: "https://github.com".to_string(),
        }
    }

    fn connector(api_base: &str) -> GitHubConnector {
        GitHubConnector::new(settings(api_base), reqwest::Client::new()).unwrap()
    }

    async fn mount_installation(server: &MockServer, id: i64) {
        Mock::given(method("GET"))
            .and(path(format!("/app/installations/{}", id)))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": id,
                "account": {"id": 9001, "login": "acme", "type": "Organization"},
                "target_type": "Organization",
                "repository_selection": "selected",
                "html_url": "https://github.com/organizations/acme/settings/installations/12345"
            })))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("/app/installations/{}/access_tokens", id)))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "token": "ghs_test_token",
                "expires_at": "2099-01-01T00:00:00Z"
            })))
            .expect(1)
            .mount(server)
            .await;
    }

    #[test]
    fn rejects_invalid_private_key() {
        let mut bad = settings("http://localhost");
        bad.private_key = "not a key".to_string();
        assert!(matches!(
            GitHubConnector::new(bad, reqwest::Client::new()),
            Err(ConnectorError::ConfigurationError { .. })
        ));
    }

    #[tokio::test]
    async fn install_url_carries_state() {
        let connector = connector("http://localhost");
        let intent = connector
            .initiate_authorization(AuthorizeParams {
                organization_id: "o1".to_string(),
                user_id: "u1".to_string(),
                state: "abc+/=".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(intent.kind, AuthorizationKind::Installation);
        let url = Url::parse(&intent.url).unwrap();
        assert_eq!(url.path(), "/apps/acme-integrations/installations/new");
        let state = url
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned());
        assert_eq!(state.as_deref(), Some("abc+/="));
    }

    #[tokio::test]
    async fn complete_authorization_maps_installation_account() {
        let server = MockServer::start().await;
        mount_installation(&server, 12345).await;
        let connector = connector(&server.uri());

        let authorization = connector
            .complete_authorization(AuthorizationData {
                installation_id: Some("12345".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(authorization.account.bot_id, "12345");
        assert_eq!(authorization.account.connector_user_id, "9001");
        assert_eq!(authorization.account.connector_organization_id, "acme");
        assert_eq!(
            authorization.account.metadata.get("account_type").map(String::as_str),
            Some("Organization")
        );
        assert_eq!(authorization.credentials.credential_type, CredentialType::Token);
        assert_eq!(authorization.credentials.get("access_token"), Some("ghs_test_token"));
        assert!(authorization.credentials.expires_at.is_some());

        // Second lookup is served from the cache (token endpoint expects one call)
        let token = connector.installation_token("12345").await.unwrap();
        assert_eq!(token.token, "ghs_test_token");
    }

    #[tokio::test]
    async fn missing_installation_id_is_invalid_input() {
        let connector = connector("http://localhost");
        let error = connector
            .complete_authorization(AuthorizationData::default())
            .await
            .unwrap_err();
        assert!(matches!(error, ConnectorError::InvalidInput { .. }));

        let error = connector
            .complete_authorization(AuthorizationData {
                installation_id: Some("-4".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(error, ConnectorError::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn sync_paginates_repositories() {
        let server = MockServer::start().await;
        let first_page: Vec<JsonValue> = (1..=100)
            .map(|id| {
                json!({
                    "id": id,
                    "name": format!("repo-{}", id),
                    "full_name": format!("acme/repo-{}", id),
                    "html_url": format!("https://github.com/acme/repo-{}", id),
                    "private": id % 2 == 0,
                    "default_branch": "main",
                    "permissions": {"admin": false, "push": true, "pull": true}
                })
            })
            .collect();
        Mock::given(method("GET"))
            .and(path("/installation/repositories"))
            .and(query_param("page", "1"))
            .and(header("authorization", "Bearer ghs_live"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "total_count": 101,
                "repositories": first_page
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/installation/repositories"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "total_count": 101,
                "repositories": [{
                    "id": 101,
                    "name": "last",
                    "full_name": "acme/last",
                    "html_url": "https://github.com/acme/last",
                    "private": true
                }]
            })))
            .mount(&server)
            .await;

        let connector = connector(&server.uri());
        let mut data = CredentialData::new();
        data.insert("installation_id".to_string(), "12345".to_string());
        data.insert("access_token".to_string(), "ghs_live".to_string());
        let credentials = Credentials::new(CredentialType::Token, data)
            .with_expiry(Some(Utc::now() + Duration::hours(1)));

        let integration = crate::models::integration::Model {
            id: Uuid::new_v4(),
            organization_id: "o1".to_string(),
            user_id: "u1".to_string(),
            connector_type: ConnectorType::Github,
            status: IntegrationStatus::Active,
            bot_id: "12345".to_string(),
            connector_user_id: "9001".to_string(),
            connector_organization_id: "acme".to_string(),
            metadata: None,
            created_at: Utc::now().into(),
            updated_at: Utc::now().into(),
            last_used_at: None,
        };

        let outcome = connector
            .sync(SyncParams {
                integration,
                credentials,
                request: Default::default(),
            })
            .await
            .unwrap();

        let resources = outcome.resources.unwrap();
        assert_eq!(resources.len(), 101);
        assert!(resources[1].is_private);
        assert!(resources[0].can_push);
        assert_eq!(resources[100].default_branch, "main");
        assert!(outcome.credentials.is_none());
        assert_eq!(
            outcome.metadata.unwrap().get("repository_count").map(String::as_str),
            Some("101")
        );
    }

    #[tokio::test]
    async fn revoke_treats_missing_installation_as_done() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/app/installations/777"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let mut data = CredentialData::new();
        data.insert("installation_id".to_string(), "777".to_string());
        let credentials = Credentials::new(CredentialType::Token, data);
        connector(&server.uri())
            .revoke_credentials(&credentials)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn configure_webhooks_patches_only_when_changed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/app/hook/config"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "url": "https://old.example.com/hook",
                "content_type": "form"
            })))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/app/hook/config"))
            .and(body_partial_json(json!({
                "url": "https://platform.example.com/webhooks/github",
                "content_type": "json"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let credentials = Credentials::new(CredentialType::Token, CredentialData::new());
        connector(&server.uri())
            .configure_webhooks(Uuid::new_v4(), &credentials)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn installation_events_become_actions() {
        let connector = connector("http://localhost");

        let deleted = InboundEvent::new(
            ConnectorType::Github,
            "installation",
            json!({"action": "deleted", "installation": {"id": 12345}}),
        );
        assert_eq!(
            connector.process_event(&deleted).await.unwrap(),
            vec![EventAction::SetStatus {
                bot_id: "12345".to_string(),
                status: IntegrationStatus::Inactive
            }]
        );

        let removed = InboundEvent::new(
            ConnectorType::Github,
            "installation_repositories",
            json!({
                "action": "removed",
                "installation": {"id": 12345},
                "repositories_removed": [{"id": 1}, {"id": 2}]
            }),
        );
        assert_eq!(
            connector.process_event(&removed).await.unwrap(),
            vec![EventAction::RemoveResources {
                bot_id: "12345".to_string(),
                external_ids: vec![1, 2]
            }]
        );

        let unrelated = InboundEvent::new(ConnectorType::Github, "push", json!({"ref": "main"}));
        assert!(connector.process_event(&unrelated).await.unwrap().is_empty());
    }

    #[test]
    fn verify_webhook_checks_signature_and_event() {
        let connector = connector("http://localhost");
        let body = br#"{"action":"suspend","installation":{"id":12345}}"#;

        let mut headers = HeaderMap::new();
        let signature = format!("sha256={}", sign_hex("hook-secret", body));
        headers.insert(GITHUB_SIGNATURE_HEADER, HeaderValue::from_str(&signature).unwrap());
        headers.insert(GITHUB_EVENT_HEADER, HeaderValue::from_static("installation"));
        headers.insert(GITHUB_DELIVERY_HEADER, HeaderValue::from_static("d-1"));

        match connector.verify_webhook(&headers, body).unwrap() {
            WebhookDelivery::Event(event) => {
                assert_eq!(event.event_type, "installation");
                assert_eq!(event.delivery_id.as_deref(), Some("d-1"));
            }
            other => panic!("unexpected delivery: {:?}", other),
        }

        headers.insert(GITHUB_SIGNATURE_HEADER, HeaderValue::from_static("sha256=00"));
        assert!(matches!(
            connector.verify_webhook(&headers, body),
            Err(VerificationError::VerificationFailed)
        ));
    }

    #[test]
    fn ping_is_ignored() {
        let connector = connector("http://localhost");
        let body = br#"{"zen":"Keep it logically awesome."}"#;
        let mut headers = HeaderMap::new();
        let signature = format!("sha256={}", sign_hex("hook-secret", body));
        headers.insert(GITHUB_SIGNATURE_HEADER, HeaderValue::from_str(&signature).unwrap());
        headers.insert(GITHUB_EVENT_HEADER, HeaderValue::from_static("ping"));
        assert_eq!(
            connector.verify_webhook(&headers, body).unwrap(),
            WebhookDelivery::Ignored
        );
    }
}
