//! # Integrations Service Entry Point
//!
//! Loads configuration, wires storage, the vault and the connector registry
//! into the integration service, then runs subscriptions, the credential
//! refresher and the webhook server until Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use integrations::{
    config::ConfigLoader,
    connectors::Registry,
    credential_refresh::CredentialRefresher,
    crypto::CredentialVault,
    db,
    server::{AppState, run_server},
    service::IntegrationService,
    state::StateCodec,
    telemetry,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from layered env files and variables
    let config = ConfigLoader::new().load().context("loading configuration")?;
    telemetry::init_tracing(&config).context("initializing telemetry")?;

    info!(profile = %config.profile, "Loaded configuration");
    if let Ok(redacted_json) = config.redacted_json() {
        info!(config = %redacted_json, "Effective configuration");
    }

    let db = Arc::new(db::init_pool(&config).await?);
    if config.run_migrations {
        db::run_migrations(&db).await?;
    }

    let vault = Arc::new(CredentialVault::from_config(&config.vault).context("loading vault keys")?);
    let state_codec = StateCodec::from_config(&config);
    if !state_codec.is_signed() {
        warn!("State tokens are unsigned; configure INTEGRATIONS_STATE_SIGNING_SECRET outside local profiles");
    }
    let registry = Arc::new(Registry::from_config(&config)?);

    let service = IntegrationService::new(db.clone(), registry.clone(), vault, state_codec)
        .with_vendor_timeout(config.vendor_timeout());

    let shutdown = CancellationToken::new();
    let supervisor = Arc::new(service.subscribe(shutdown.child_token(), &config.subscriptions));

    let refresher = config.credential_refresh.enabled.then(|| {
        let refresher = CredentialRefresher::new(config.credential_refresh.clone(), service.clone());
        let token = shutdown.child_token();
        tokio::spawn(async move { refresher.run(token).await })
    });

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Shutdown signal received"),
                Err(err) => error!(error = %err, "Failed to listen for shutdown signal"),
            }
            shutdown.cancel();
        });
    }

    let state = AppState {
        db,
        registry,
        supervisor: Some(supervisor.clone()),
    };
    let served = run_server(&config, state, shutdown.clone()).await;

    shutdown.cancel();
    supervisor.shutdown().await;
    if let Some(refresher) = refresher
        && let Err(err) = refresher.await
    {
        warn!(error = %err, "Credential refresher did not exit cleanly");
    }

    info!("Shutdown complete");
    served
}
