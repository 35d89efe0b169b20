//! # Server Configuration
//!
//! Inbound HTTP surface: one webhook endpoint per connector feeding the
//! connector's subscription inbox, plus a health endpoint reporting database
//! reachability and subscription state.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

use crate::config::AppConfig;
use crate::connectors::{ConnectorMetadata, Registry, WebhookDelivery};
use crate::db;
use crate::error::ApiError;
use crate::models::ConnectorType;
use crate::supervisor::{SubscriptionState, SubscriptionStatus, SubscriptionSupervisor};
use crate::telemetry;
use crate::webhook_verification::VerificationError;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub registry: Arc<Registry>,
    pub supervisor: Option<Arc<SubscriptionSupervisor>>,
}

/// Webhook accept response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct WebhookAcceptResponse {
    /// `accepted` or `ignored`
    pub status: String,
}

/// Slack URL verification answer
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ChallengeResponse {
    pub challenge: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// `ok` when the database answers and no subscription has failed
    pub status: String,
    pub database: bool,
    /// Registered connectors, sorted by type
    pub connectors: Vec<ConnectorMetadata>,
    pub subscriptions: BTreeMap<ConnectorType, SubscriptionStatus>,
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/webhooks/{connector}", post(receive_webhook))
        .route("/healthz", get(health))
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(middleware::from_fn(request_id))
        .layer(TraceLayer::new_for_http())
}

/// Scope each request under its `x-request-id` (or a fresh one) so error
/// bodies carry a trace id.
async fn request_id(request: Request, next: Next) -> Response {
    let trace_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

    let mut response = telemetry::scope_request(trace_id.clone(), next.run(request)).await;
    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Verify and enqueue one vendor webhook delivery
#[utoipa::path(
    post,
    path = "/webhooks/{connector}",
    params(
        ("connector" = String, Path, description = "Connector type, e.g. `github` or `slack`"),
        ("X-Hub-Signature-256" = Option<String>, Header, description = "GitHub HMAC-SHA256 signature"),
        ("X-Slack-Signature" = Option<String>, Header, description = "Slack HMAC-SHA256 signature"),
        ("X-Slack-Request-Timestamp" = Option<String>, Header, description = "Slack request timestamp"),
    ),
    request_body(content = String, description = "Raw vendor payload", content_type = "application/json"),
    responses(
        (status = 200, description = "Authentic delivery that needs no processing, or a URL verification challenge", body = WebhookAcceptResponse),
        (status = 202, description = "Event queued", body = WebhookAcceptResponse),
        (status = 400, description = "Malformed payload", body = ApiError),
        (status = 401, description = "Missing or invalid signature", body = ApiError),
        (status = 404, description = "Connector unknown or not receiving webhooks", body = ApiError),
        (status = 503, description = "Inbox full; the vendor should retry", body = ApiError)
    ),
    tag = "webhooks"
)]
pub async fn receive_webhook(
    State(state): State<AppState>,
    Path(connector): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let connector = state
        .registry
        .get_by_name(&connector)
        .map_err(|_| VerificationError::UnsupportedConnector { connector })?;
    let connector_type = connector.connector_type();

    match connector.verify_webhook(&headers, &body)? {
        WebhookDelivery::Challenge(challenge) => {
            debug!(connector_type = %connector_type, "Answering URL verification challenge");
            Ok(Json(ChallengeResponse { challenge }).into_response())
        }
        WebhookDelivery::Ignored => Ok(Json(WebhookAcceptResponse {
            status: "ignored".to_string(),
        })
        .into_response()),
        WebhookDelivery::Event(event) => {
            let inbox = connector
                .webhook_inbox()
                .ok_or_else(|| VerificationError::UnsupportedConnector {
                    connector: connector_type.to_string(),
                })?;
            debug!(
                connector_type = %connector_type,
                event_type = %event.event_type,
                delivery_id = ?event.delivery_id,
                "Webhook accepted"
            );
            inbox.push(event)?;
            Ok((
                StatusCode::ACCEPTED,
                Json(WebhookAcceptResponse {
                    status: "accepted".to_string(),
                }),
            )
                .into_response())
        }
    }
}

/// Liveness plus dependency state
#[utoipa::path(
    get,
    path = "/healthz",
    responses(
        (status = 200, description = "Service healthy", body = HealthResponse),
        (status = 503, description = "Database unreachable or a subscription failed", body = HealthResponse)
    ),
    tag = "operations"
)]
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let database = db::health_check(&state.db).await.is_ok();
    let subscriptions = match &state.supervisor {
        Some(supervisor) => supervisor.snapshot().await,
        None => BTreeMap::new(),
    };
    let healthy = database
        && subscriptions
            .values()
            .all(|status| status.state != SubscriptionState::Failed);

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthResponse {
            status: if healthy { "ok" } else { "degraded" }.to_string(),
            database,
            connectors: state.registry.list_metadata(),
            subscriptions,
        }),
    )
}

/// Serve the router until `shutdown` fires
pub async fn run_server(
    config: &AppConfig,
    state: AppState,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr = config.bind_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, profile = %config.profile, "Server listening");

    axum::serve(listener, create_app(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(receive_webhook, health),
    components(schemas(
        WebhookAcceptResponse,
        ChallengeResponse,
        HealthResponse,
        ConnectorMetadata,
        SubscriptionStatus,
        SubscriptionState,
        ConnectorType,
        ApiError,
    )),
    info(
        title = "Integrations Service",
        description = "Inbound webhooks and operational endpoints",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
