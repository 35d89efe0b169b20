//! Re-seal stored credentials under the vault's current default key id.
//!
//! Run after adding a new `INTEGRATIONS_VAULT_DEFAULT_KEY_ID` and moving the
//! old id into `INTEGRATIONS_VAULT_PREVIOUS_KEY_IDS`. Once every row is
//! rotated the old id can be dropped from configuration.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use integrations::{
    config::ConfigLoader, connectors::Registry, crypto::CredentialVault, db,
    service::IntegrationService, state::StateCodec, telemetry,
};

#[derive(Parser)]
#[command(name = "rotate-credential-keys")]
#[command(about = "Re-encrypt integration credentials under the default key id", long_about = None)]
#[command(version)]
struct Cli {
    /// Report what would be rotated without writing anything
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ConfigLoader::new()
        .load()
        .context("loading configuration")?;
    telemetry::init_tracing(&config).context("initializing telemetry")?;

    let vault = CredentialVault::from_config(&config.vault).context("loading vault keys")?;
    let db = db::init_pool(&config)
        .await
        .context("initializing database connection pool")?;

    // Rotation never calls a vendor, so no connectors are registered.
    let service = IntegrationService::new(
        Arc::new(db),
        Arc::new(Registry::new()),
        Arc::new(vault),
        StateCodec::from_config(&config),
    );

    let report = service
        .rotate_credential_keys(cli.dry_run)
        .await
        .context("rotating credential keys")?;

    println!(
        "{} credential(s) examined, {} {}, {} failed",
        report.examined,
        report.rotated,
        if report.dry_run { "would be rotated" } else { "rotated" },
        report.failed
    );
    if report.failed > 0 {
        anyhow::bail!("{} credential(s) could not be decrypted", report.failed);
    }
    Ok(())
}
