//! Router-level tests for the webhook and health endpoints.

mod test_utils;

use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use integrations::connectors::github::{GITHUB_EVENT_HEADER, GitHubAppSettings, GitHubConnector};
use integrations::connectors::{Connector, Registry};
use integrations::server::{AppState, create_app};
use integrations::webhook_verification::{GITHUB_SIGNATURE_HEADER, sign_hex};
use serde_json::{Value, json};
use tower::ServiceExt;

const TEST_KEY: &str = include_str!("fixtures/test_rsa_key.pem");
const WEBHOOK_SECRET: &str = "hook-secret";

async fn app_with(connectors: Vec<Arc<dyn Connector>>) -> Router {
    let db = test_utils::setup_test_db_arc().await.unwrap();
    let mut registry = Registry::new();
    for connector in connectors {
        registry.register_connector(connector);
    }
    create_app(AppState {
        db,
        registry: Arc::new(registry),
        supervisor: None,
    })
}

fn github() -> Arc<dyn Connector> {
    Arc::new(
        GitHubConnector::new(
            GitHubAppSettings {
                app_id: "4242".to_string(),
                app_slug: "acme-integrations".to_string(),
                private_key: TEST_KEY.to_string(),
                webhook_secret: Some(WEBHOOK_SECRET.to_string()),
                webhook_url: None,
                api_base: "http://127.0.0.1:9".to_string(),
                web_base: "https://github.com".to_string(),
            },
            reqwest::Client::new(),
        )
        .unwrap(),
    )
}

fn github_delivery(event: &str, body: &str, signature: String) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/webhooks/github")
        .header(GITHUB_SIGNATURE_HEADER, signature)
        .header(GITHUB_EVENT_HEADER, event)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn signed_delivery_is_accepted() {
    let app = app_with(vec![github()]).await;
    let body = json!({"action": "added", "installation": {"id": 1}}).to_string();
    let signature = format!("sha256={}", sign_hex(WEBHOOK_SECRET, body.as_bytes()));

    let response = app
        .oneshot(github_delivery("installation_repositories", &body, signature))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(json_body(response).await["status"], "accepted");
}

#[tokio::test]
async fn bad_signature_is_unauthorized() {
    let app = app_with(vec![github()]).await;
    let body = json!({"action": "added"}).to_string();
    let signature = format!("sha256={}", sign_hex("wrong-secret", body.as_bytes()));

    let response = app
        .oneshot(github_delivery("installation", &body, signature))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn ping_is_acknowledged_without_queueing() {
    let app = app_with(vec![github()]).await;
    let body = json!({"zen": "Design for failure."}).to_string();
    let signature = format!("sha256={}", sign_hex(WEBHOOK_SECRET, body.as_bytes()));

    let response = app
        .oneshot(github_delivery("ping", &body, signature))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "ignored");
}

#[tokio::test]
async fn unknown_connector_is_not_found() {
    let app = app_with(vec![github()]).await;
    for uri in ["/webhooks/unknown", "/webhooks/slack"] {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
    }
}

#[tokio::test]
async fn health_reports_database_and_echoes_request_id() {
    let app = app_with(Vec::new()).await;
    let response = app
        .oneshot(
            Request::builder()
                .uri("/healthz")
                .header("x-request-id", "req-42")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok()),
        Some("req-42")
    );
    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["database"], true);
    assert_eq!(body["connectors"], json!([]));
}

#[tokio::test]
async fn health_lists_registered_connectors() {
    let app = app_with(vec![github()]).await;
    let response = app
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    let connectors = body["connectors"].as_array().unwrap();
    assert_eq!(connectors.len(), 1);
    assert_eq!(connectors[0]["connector_type"], "github");
    assert_eq!(connectors[0]["authorization_kind"], "installation");
    assert_eq!(connectors[0]["webhooks"], true);
}
