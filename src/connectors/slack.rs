//! Slack connector implementation
//!
//! OAuth v2 app installation into a workspace. Slack answers API calls with
//! HTTP 200 and an `ok` flag, so every call goes through [`SlackConnector::call`]
//! which turns `ok: false` into a typed [`ConnectorError`].

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tracing::{debug, info};
use url::Url;

use crate::config::AppConfig;
use crate::connectors::http::{endpoint, send_json};
use crate::connectors::inbox::WebhookInbox;
use crate::connectors::trait_::{
    Authorization, AuthorizationData, AuthorizationIntent, AuthorizationKind, AuthorizeParams,
    Connector, ConnectorError, Credentials, EventAction, InboundEvent, VendorAccount,
    WebhookDelivery,
};
use crate::models::{ConnectorType, CredentialData, CredentialType, IntegrationStatus};
use crate::webhook_verification::{
    SLACK_SIGNATURE_HEADER, SLACK_TIMESTAMP_HEADER, VerificationError, header_str,
    verify_slack_signature,
};

/// Slack error codes meaning the token is already unusable
const DEAD_TOKEN_ERRORS: &[&str] = &["invalid_auth", "token_revoked", "account_inactive"];

#[derive(Clone)]
pub struct SlackSettings {
    pub client_id: String,
    pub client_secret: String,
    pub signing_secret: Option<String>,
    pub scopes: Vec<String>,
    pub redirect_uri: String,
    pub oauth_base: String,
    pub api_base: String,
    pub tolerance_seconds: u64,
}

impl SlackSettings {
    pub fn from_config(config: &AppConfig) -> Option<Self> {
        let slack = &config.slack;
        Some(Self {
            client_id: slack.client_id.clone()?,
            client_secret: slack.client_secret.clone()?,
            signing_secret: slack.signing_secret.clone(),
            scopes: slack.scopes.clone(),
            redirect_uri: slack.redirect_uri.clone().unwrap_or_else(|| {
                format!(
                    "{}/integrations/slack/callback",
                    config.public_base_url.trim_end_matches('/')
                )
            }),
            oauth_base: slack.oauth_base.clone(),
            api_base: slack.api_base.clone(),
            tolerance_seconds: config.webhook_slack_tolerance_seconds,
        })
    }
}

impl std::fmt::Debug for SlackSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlackSettings")
            .field("client_id", &self.client_id)
            .field("scopes", &self.scopes)
            .field("redirect_uri", &self.redirect_uri)
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct SlackTeam {
    id: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SlackAuthedUser {
    id: String,
}

#[derive(Debug, Deserialize)]
struct OAuthAccess {
    access_token: String,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    bot_user_id: Option<String>,
    #[serde(default)]
    app_id: Option<String>,
    #[serde(default)]
    team: Option<SlackTeam>,
    #[serde(default)]
    enterprise: Option<SlackTeam>,
    #[serde(default)]
    authed_user: Option<SlackAuthedUser>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct AuthTest {
    #[serde(default)]
    team_id: Option<String>,
}

/// Slack OAuth v2 connector
pub struct SlackConnector {
    settings: SlackSettings,
    http: reqwest::Client,
    inbox: WebhookInbox,
}

impl SlackConnector {
    pub fn new(settings: SlackSettings, http: reqwest::Client) -> Self {
        Self {
            settings,
            http,
            inbox: WebhookInbox::default(),
        }
    }

    pub fn with_inbox(mut self, inbox: WebhookInbox) -> Self {
        self.inbox = inbox;
        self
    }

    /// Invoke a Web API method and decode the body of an `ok` response
    async fn call<T: DeserializeOwned>(
        &self,
        api_method: &str,
        token: Option<&str>,
        form: &[(&str, &str)],
    ) -> Result<T, ConnectorError> {
        let mut request = self
            .http
            .post(endpoint(&self.settings.api_base, &format!("/{}", api_method)))
            .form(form);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let body: JsonValue = send_json(request).await?;
        if !body.get("ok").and_then(JsonValue::as_bool).unwrap_or(false) {
            let code = body
                .get("error")
                .and_then(JsonValue::as_str)
                .unwrap_or("unknown_error")
                .to_string();
            return Err(slack_error(api_method, code));
        }
        serde_json::from_value(body).map_err(|e| ConnectorError::malformed(e.to_string()))
    }

    fn credentials_from(access: &OAuthAccess) -> Credentials {
        let mut data = CredentialData::new();
        data.insert("access_token".to_string(), access.access_token.clone());
        let optional = [
            ("refresh_token", access.refresh_token.clone()),
            ("bot_user_id", access.bot_user_id.clone()),
            ("scope", access.scope.clone()),
            ("team_id", access.team.as_ref().map(|t| t.id.clone())),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                data.insert(key.to_string(), value);
            }
        }
        let expires_at = access
            .expires_in
            .filter(|secs| *secs > 0)
            .map(|secs| Utc::now() + Duration::seconds(secs));
        Credentials::new(CredentialType::OAuth2, data).with_expiry(expires_at)
    }
}

fn slack_error(api_method: &str, code: String) -> ConnectorError {
    match code.as_str() {
        "ratelimited" => ConnectorError::RateLimitError { retry_after: None },
        "invalid_code" | "code_already_used" | "invalid_auth" | "not_authed"
        | "token_revoked" | "token_expired" | "account_inactive" | "invalid_refresh_token" => {
            ConnectorError::AuthenticationError {
                details: format!("{} rejected: {}", api_method, code),
                error_code: Some(code),
            }
        }
        "bad_redirect_uri" | "invalid_client_id" | "bad_client_secret" => {
            ConnectorError::configuration(format!("{} rejected: {}", api_method, code))
        }
        _ => ConnectorError::HttpError {
            status: 200,
            body: Some(format!("{}: {}", api_method, code)),
        },
    }
}

#[async_trait]
impl Connector for SlackConnector {
    fn connector_type(&self) -> ConnectorType {
        ConnectorType::Slack
    }

    fn authorization_kind(&self) -> AuthorizationKind {
        AuthorizationKind::Oauth2
    }

    async fn initiate_authorization(
        &self,
        params: AuthorizeParams,
    ) -> Result<AuthorizationIntent, ConnectorError> {
        let mut url = Url::parse(&endpoint(&self.settings.oauth_base, "/oauth/v2/authorize"))
            .map_err(|e| ConnectorError::configuration(format!("invalid Slack OAuth base: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.settings.client_id)
            .append_pair("scope", &self.settings.scopes.join(","))
            .append_pair("redirect_uri", &self.settings.redirect_uri)
            .append_pair("state", &params.state);

        Ok(AuthorizationIntent {
            kind: AuthorizationKind::Oauth2,
            url: url.to_string(),
        })
    }

    async fn complete_authorization(
        &self,
        data: AuthorizationData,
    ) -> Result<Authorization, ConnectorError> {
        let code = data
            .code
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| ConnectorError::invalid_input("authorization code is required"))?;

        let access: OAuthAccess = self
            .call(
                "oauth.v2.access",
                None,
                &[
                    ("client_id", self.settings.client_id.as_str()),
                    ("client_secret", self.settings.client_secret.as_str()),
                    ("code", code),
                    ("redirect_uri", self.settings.redirect_uri.as_str()),
                ],
            )
            .await?;

        let team = access
            .team
            .as_ref()
            .ok_or_else(|| ConnectorError::malformed("oauth.v2.access response lacks team"))?;

        let mut account = VendorAccount {
            bot_id: team.id.clone(),
            connector_user_id: access
                .authed_user
                .as_ref()
                .map(|u| u.id.clone())
                .unwrap_or_default(),
            connector_organization_id: team.id.clone(),
            ..Default::default()
        };
        let optional = [
            ("team_name", team.name.clone()),
            ("app_id", access.app_id.clone()),
            ("bot_user_id", access.bot_user_id.clone()),
            ("scope", access.scope.clone()),
            ("enterprise_id", access.enterprise.as_ref().map(|e| e.id.clone())),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                account.metadata.insert(key.to_string(), value);
            }
        }

        info!(team_id = %team.id, "Slack workspace authorized");
        Ok(Authorization {
            credentials: Self::credentials_from(&access),
            account,
        })
    }

    async fn validate_credentials(&self, credentials: &Credentials) -> Result<(), ConnectorError> {
        let token = credentials.require("access_token")?;
        let result: AuthTest = self.call("auth.test", Some(token), &[]).await?;
        debug!(team_id = ?result.team_id, "Slack token valid");
        Ok(())
    }

    async fn refresh_credentials(
        &self,
        credentials: &Credentials,
    ) -> Result<Credentials, ConnectorError> {
        let Some(refresh_token) = credentials.get("refresh_token") else {
            // Token rotation disabled: bot tokens do not expire
            return Ok(credentials.clone());
        };

        let access: OAuthAccess = self
            .call(
                "oauth.v2.access",
                None,
                &[
                    ("client_id", self.settings.client_id.as_str()),
                    ("client_secret", self.settings.client_secret.as_str()),
                    ("grant_type", "refresh_token"),
                    ("refresh_token", refresh_token),
                ],
            )
            .await?;

        let mut refreshed = Self::credentials_from(&access);
        for key in ["bot_user_id", "team_id", "scope"] {
            if !refreshed.data.contains_key(key)
                && let Some(previous) = credentials.get(key)
            {
                refreshed.data.insert(key.to_string(), previous.to_string());
            }
        }
        Ok(refreshed)
    }

    async fn revoke_credentials(&self, credentials: &Credentials) -> Result<(), ConnectorError> {
        let token = credentials.require("access_token")?;
        match self.call::<JsonValue>("auth.revoke", Some(token), &[]).await {
            Err(ConnectorError::AuthenticationError {
                error_code: Some(code),
                ..
            }) if DEAD_TOKEN_ERRORS.contains(&code.as_str()) => {
                debug!(error_code = %code, "Slack token already unusable");
                Ok(())
            }
            other => other.map(|_| ()),
        }
    }

    async fn process_event(&self, event: &InboundEvent) -> Result<Vec<EventAction>, ConnectorError> {
        let Some(team_id) = event
            .payload
            .get("team_id")
            .and_then(JsonValue::as_str)
            .filter(|id| !id.is_empty())
        else {
            return Ok(Vec::new());
        };

        let deactivate = || EventAction::SetStatus {
            bot_id: team_id.to_string(),
            status: IntegrationStatus::Inactive,
        };

        let actions = match event.event_type.as_str() {
            "app_uninstalled" => vec![deactivate()],
            "tokens_revoked" => {
                let bot_tokens_revoked = event
                    .payload
                    .pointer("/event/tokens/bot")
                    .and_then(JsonValue::as_array)
                    .is_some_and(|bots| !bots.is_empty());
                if bot_tokens_revoked {
                    vec![deactivate()]
                } else {
                    Vec::new()
                }
            }
            _ => Vec::new(),
        };
        Ok(actions)
    }

    fn normalize_credentials(&self, raw: &CredentialData) -> Result<CredentialData, Vec<String>> {
        let mut errors = Vec::new();
        let token = raw.get("access_token").map(|t| t.trim()).unwrap_or_default();
        if token.is_empty() {
            errors.push("access_token is required".to_string());
        } else if !token.starts_with("xox") {
            errors.push("access_token must be a Slack token (xox...)".to_string());
        }
        if !errors.is_empty() {
            return Err(errors);
        }

        let mut normalized = raw.clone();
        normalized.insert("access_token".to_string(), token.to_string());
        Ok(normalized)
    }

    fn verify_webhook(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<WebhookDelivery, VerificationError> {
        let secret = self.settings.signing_secret.as_deref().ok_or_else(|| {
            VerificationError::NotConfigured {
                connector: ConnectorType::Slack.to_string(),
            }
        })?;
        verify_slack_signature(
            body,
            header_str(headers, SLACK_SIGNATURE_HEADER),
            header_str(headers, SLACK_TIMESTAMP_HEADER),
            secret,
            self.settings.tolerance_seconds,
        )?;

        let payload: JsonValue =
            serde_json::from_slice(body).map_err(|e| VerificationError::MalformedPayload {
                details: e.to_string(),
            })?;

        match payload.get("type").and_then(JsonValue::as_str) {
            Some("url_verification") => {
                let challenge = payload
                    .get("challenge")
                    .and_then(JsonValue::as_str)
                    .ok_or_else(|| VerificationError::MalformedPayload {
                        details: "url_verification without challenge".to_string(),
                    })?;
                Ok(WebhookDelivery::Challenge(challenge.to_string()))
            }
            Some("event_callback") => {
                let event_type = payload
                    .pointer("/event/type")
                    .and_then(JsonValue::as_str)
                    .ok_or_else(|| VerificationError::MalformedPayload {
                        details: "event_callback without event.type".to_string(),
                    })?
                    .to_string();
                let delivery_id = payload
                    .get("event_id")
                    .and_then(JsonValue::as_str)
                    .map(str::to_string);
                Ok(WebhookDelivery::Event(
                    InboundEvent::new(ConnectorType::Slack, event_type, payload)
                        .with_delivery_id(delivery_id),
                ))
            }
            _ => Ok(WebhookDelivery::Ignored),
        }
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
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings(api_base: &str) -> SlackSettings {
        SlackSettings {
            client_id: "123.456".to_string(),
            client_secret: "shh".to_string(),
            signing_secret: Some("signing".to_string()),
            scopes: vec!["channels:read".to_string(), "chat:write".to_string()],
            redirect_uri: "https://platform.example.com/integrations/slack/callback".to_string(),
            oauth_base: "https://slack.com".to_string(),
            api_base: api_base.to_string(),
            tolerance_seconds: 300,
        }
    }

    fn connector(api_base: &str) -> SlackConnector {
        SlackConnector::new(settings(api_base), reqwest::Client::new())
    }

    fn signed_headers(body: &[u8]) -> HeaderMap {
        let timestamp = Utc::now().timestamp().to_string();
        let mut base = format!("v0:{}:", timestamp).into_bytes();
        base.extend_from_slice(body);
        let signature = format!("v0={}", sign_hex("signing", &base));

        let mut headers = HeaderMap::new();
        headers.insert(SLACK_SIGNATURE_HEADER, HeaderValue::from_str(&signature).unwrap());
        headers.insert(SLACK_TIMESTAMP_HEADER, HeaderValue::from_str(&timestamp).unwrap());
        headers
    }

    #[tokio::test]
    async fn authorize_url_includes_scopes_and_state() {
        let intent = connector("http://localhost")
            .initiate_authorization(AuthorizeParams {
                organization_id: "o1".to_string(),
                user_id: "u1".to_string(),
                state: "opaque".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(intent.kind, AuthorizationKind::Oauth2);
        let url = Url::parse(&intent.url).unwrap();
        assert_eq!(url.path(), "/oauth/v2/authorize");
        let pairs: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs.get("scope").map(String::as_str), Some("channels:read,chat:write"));
        assert_eq!(pairs.get("state").map(String::as_str), Some("opaque"));
        assert_eq!(pairs.get("client_id").map(String::as_str), Some("123.456"));
    }

    #[tokio::test]
    async fn exchanges_code_for_workspace_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth.v2.access"))
            .and(body_string_contains("code=abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "access_token": "xoxb-1",
                "token_type": "bot",
                "scope": "channels:read,chat:write",
                "bot_user_id": "U0BOT",
                "app_id": "A01",
                "team": {"id": "T123", "name": "Acme"},
                "enterprise": null,
                "authed_user": {"id": "U777"}
            })))
            .mount(&server)
            .await;

        let authorization = connector(&server.uri())
            .complete_authorization(AuthorizationData {
                code: Some("abc".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(authorization.account.bot_id, "T123");
        assert_eq!(authorization.account.connector_user_id, "U777");
        assert_eq!(
            authorization.account.metadata.get("team_name").map(String::as_str),
            Some("Acme")
        );
        assert_eq!(authorization.credentials.get("access_token"), Some("xoxb-1"));
        assert!(authorization.credentials.expires_at.is_none());
    }

    #[tokio::test]
    async fn not_ok_response_is_authentication_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth.v2.access"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"ok": false, "error": "invalid_code"})),
            )
            .mount(&server)
            .await;

        let error = connector(&server.uri())
            .complete_authorization(AuthorizationData {
                code: Some("stale".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            ConnectorError::AuthenticationError { error_code: Some(ref c), .. } if c == "invalid_code"
        ));
    }

    #[tokio::test]
    async fn validate_uses_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth.test"))
            .and(header("authorization", "Bearer xoxb-live"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"ok": true, "team_id": "T1"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let mut data = CredentialData::new();
        data.insert("access_token".to_string(), "xoxb-live".to_string());
        connector(&server.uri())
            .validate_credentials(&Credentials::new(CredentialType::OAuth2, data))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn revoke_tolerates_dead_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth.revoke"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"ok": false, "error": "token_revoked"})),
            )
            .mount(&server)
            .await;

        let mut data = CredentialData::new();
        data.insert("access_token".to_string(), "xoxb-dead".to_string());
        connector(&server.uri())
            .revoke_credentials(&Credentials::new(CredentialType::OAuth2, data))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn refresh_without_rotation_is_noop() {
        let mut data = CredentialData::new();
        data.insert("access_token".to_string(), "xoxb-static".to_string());
        let credentials = Credentials::new(CredentialType::OAuth2, data);
        let refreshed = connector("http://localhost")
            .refresh_credentials(&credentials)
            .await
            .unwrap();
        assert_eq!(refreshed, credentials);
    }

    #[test]
    fn url_verification_returns_challenge() {
        let body = br#"{"type":"url_verification","challenge":"3eZbrw1a"}"#;
        let delivery = connector("http://localhost")
            .verify_webhook(&signed_headers(body), body)
            .unwrap();
        assert_eq!(delivery, WebhookDelivery::Challenge("3eZbrw1a".to_string()));
    }

    #[test]
    fn event_callback_becomes_inbound_event() {
        let body = br#"{"type":"event_callback","team_id":"T1","event_id":"Ev1","event":{"type":"app_uninstalled"}}"#;
        let delivery = connector("http://localhost")
            .verify_webhook(&signed_headers(body), body)
            .unwrap();
        let WebhookDelivery::Event(event) = delivery else {
            panic!("expected event delivery");
        };
        assert_eq!(event.event_type, "app_uninstalled");
        assert_eq!(event.delivery_id.as_deref(), Some("Ev1"));
    }

    #[test]
    fn tampered_body_is_rejected() {
        let body = br#"{"type":"event_callback"}"#;
        let headers = signed_headers(body);
        assert!(matches!(
            connector("http://localhost").verify_webhook(&headers, br#"{"type":"other"}"#),
            Err(VerificationError::VerificationFailed)
        ));
    }

    #[tokio::test]
    async fn uninstall_deactivates_workspace() {
        let event = InboundEvent::new(
            ConnectorType::Slack,
            "app_uninstalled",
            json!({"team_id": "T1", "event": {"type": "app_uninstalled"}}),
        );
        assert_eq!(
            connector("http://localhost").process_event(&event).await.unwrap(),
            vec![EventAction::SetStatus {
                bot_id: "T1".to_string(),
                status: IntegrationStatus::Inactive
            }]
        );

        let user_only = InboundEvent::new(
            ConnectorType::Slack,
            "tokens_revoked",
            json!({"team_id": "T1", "event": {"tokens": {"oauth": ["U1"], "bot": []}}}),
        );
        assert!(
            connector("http://localhost")
                .process_event(&user_only)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn normalize_rejects_non_slack_tokens() {
        let mut raw = CredentialData::new();
        raw.insert("access_token".to_string(), "ghp_wrong".to_string());
        let errors = connector("http://localhost")
            .normalize_credentials(&raw)
            .unwrap_err();
        assert_eq!(errors.len(), 1);
    }
}
