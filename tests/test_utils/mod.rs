//! Test utilities shared by the integration test crates.
//!
//! Provides an in-memory SQLite database with migrations applied, a vault
//! with a fixed test secret, and a scripted installation connector whose
//! vendor answers each test controls.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use integrations::connectors::{
    Authorization, AuthorizationData, AuthorizationIntent, AuthorizationKind, AuthorizeParams,
    Connector, ConnectorError, Credentials, EventAction, InboundEvent, Registry, RemoteResource,
    SyncOutcome, SyncParams, VendorAccount,
};
use integrations::crypto::CredentialVault;
use integrations::models::{ConnectorType, CredentialData, CredentialType};
use integrations::service::IntegrationService;
use integrations::state::StateCodec;
use migration::{Migrator, MigratorTrait};
use sea_orm::{ConnectionTrait, Database, DatabaseConnection, Statement};

pub const TEST_MASTER_SECRET: &[u8; 32] = b"integration-tests-master-secret!";
pub const TEST_KEY_ID: &str = "v1";

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;

    Migrator::up(&db, None).await?;

    db.execute(Statement::from_string(
        db.get_database_backend(),
        "PRAGMA foreign_keys = ON".to_string(),
    ))
    .await?;

    Ok(db)
}

pub async fn setup_test_db_arc() -> Result<Arc<DatabaseConnection>> {
    Ok(Arc::new(setup_test_db().await?))
}

pub fn test_vault() -> CredentialVault {
    CredentialVault::new(TEST_MASTER_SECRET, TEST_KEY_ID, Vec::<String>::new())
        .expect("test vault")
}

/// Service over `db` with the given connectors and an unsigned state codec.
pub fn build_service(
    db: Arc<DatabaseConnection>,
    connectors: Vec<Arc<dyn Connector>>,
) -> IntegrationService {
    build_service_with_vault(db, connectors, test_vault())
}

pub fn build_service_with_vault(
    db: Arc<DatabaseConnection>,
    connectors: Vec<Arc<dyn Connector>>,
    vault: CredentialVault,
) -> IntegrationService {
    let mut registry = Registry::new();
    for connector in connectors {
        registry.register_connector(connector);
    }
    IntegrationService::new(
        db,
        Arc::new(registry),
        Arc::new(vault),
        StateCodec::unsigned(),
    )
    .with_vendor_timeout(Duration::from_secs(5))
}

/// Callback data as the vendor would hand it back after installing.
pub fn installation_callback(
    service: &IntegrationService,
    organization_id: &str,
    user_id: &str,
    installation_id: &str,
) -> AuthorizationData {
    AuthorizationData {
        state: Some(service.state_codec().encode(organization_id, user_id)),
        installation_id: Some(installation_id.to_string()),
        ..Default::default()
    }
}

pub fn resource(external_id: i64, name: &str) -> RemoteResource {
    RemoteResource {
        external_id,
        name: name.to_string(),
        full_name: format!("acme/{}", name),
        url: format!("https://github.com/acme/{}", name),
        is_private: false,
        default_branch: "main".to_string(),
        can_admin: false,
        can_push: true,
        can_pull: true,
        metadata: None,
        created_at: None,
        updated_at: None,
        pushed_at: None,
    }
}

/// Installation-style connector with scripted vendor answers.
///
/// `complete_authorization` binds the installation id as the bot id, `sync`
/// returns the configured resources and `process_event` returns the queued
/// actions.
pub struct ScriptedInstallation {
    pub connector_type: ConnectorType,
    pub resources: Mutex<Vec<RemoteResource>>,
    pub actions: Mutex<Vec<EventAction>>,
    pub fail_revoke: AtomicBool,
    pub authorization_delay: Mutex<Duration>,
    pub authorizations: AtomicUsize,
    pub syncs: AtomicUsize,
    pub revocations: AtomicUsize,
}

impl ScriptedInstallation {
    pub fn new() -> Arc<Self> {
        Self::for_type(ConnectorType::Github)
    }

    pub fn for_type(connector_type: ConnectorType) -> Arc<Self> {
        Arc::new(Self {
            connector_type,
            resources: Mutex::new(Vec::new()),
            actions: Mutex::new(Vec::new()),
            fail_revoke: AtomicBool::new(false),
            authorization_delay: Mutex::new(Duration::ZERO),
            authorizations: AtomicUsize::new(0),
            syncs: AtomicUsize::new(0),
            revocations: AtomicUsize::new(0),
        })
    }

    pub fn set_resources(&self, resources: Vec<RemoteResource>) {
        *self.resources.lock().unwrap() = resources;
    }

    pub fn queue_actions(&self, actions: Vec<EventAction>) {
        *self.actions.lock().unwrap() = actions;
    }

    pub fn set_authorization_delay(&self, delay: Duration) {
        *self.authorization_delay.lock().unwrap() = delay;
    }

    /// Wait until at least `count` syncs have run, including background ones.
    pub async fn wait_for_syncs(&self, count: usize) {
        for _ in 0..400 {
            if self.syncs.load(Ordering::SeqCst) >= count {
                // Let the service finish persisting the last outcome.
                tokio::time::sleep(Duration::from_millis(20)).await;
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {count} syncs");
    }
}

#[async_trait]
impl Connector for ScriptedInstallation {
    fn connector_type(&self) -> ConnectorType {
        self.connector_type
    }

    fn authorization_kind(&self) -> AuthorizationKind {
        AuthorizationKind::Installation
    }

    async fn initiate_authorization(
        &self,
        params: AuthorizeParams,
    ) -> Result<AuthorizationIntent, ConnectorError> {
        Ok(AuthorizationIntent {
            kind: AuthorizationKind::Installation,
            url: format!(
                "https://vendor.test/apps/acme/installations/new?state={}",
                params.state
            ),
        })
    }

    async fn complete_authorization(
        &self,
        data: AuthorizationData,
    ) -> Result<Authorization, ConnectorError> {
        self.authorizations.fetch_add(1, Ordering::SeqCst);
        let delay = *self.authorization_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let installation_id = data
            .installation_id
            .ok_or_else(|| ConnectorError::invalid_input("installation_id is required"))?;
        let mut credentials = CredentialData::new();
        credentials.insert("installation_id".into(), installation_id.clone());
        credentials.insert("access_token".into(), format!("tok-{}", installation_id));

        Ok(Authorization {
            credentials: Credentials::new(CredentialType::Token, credentials),
            account: VendorAccount {
                bot_id: installation_id,
                connector_user_id: "9001".into(),
                connector_organization_id: "acme".into(),
                ..Default::default()
            },
        })
    }

    async fn validate_credentials(&self, credentials: &Credentials) -> Result<(), ConnectorError> {
        credentials.require("access_token").map(|_| ())
    }

    async fn revoke_credentials(&self, _credentials: &Credentials) -> Result<(), ConnectorError> {
        self.revocations.fetch_add(1, Ordering::SeqCst);
        if self.fail_revoke.load(Ordering::SeqCst) {
            return Err(ConnectorError::from_status(502, Some("bad gateway".into())));
        }
        Ok(())
    }

    async fn sync(&self, params: SyncParams) -> Result<SyncOutcome, ConnectorError> {
        let resources = self.resources.lock().unwrap().clone();
        let mut metadata = params.integration.metadata_map();
        metadata.insert("repository_count".into(), resources.len().to_string());
        self.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(SyncOutcome {
            resources: Some(resources),
            metadata: Some(metadata),
            credentials: None,
        })
    }

    async fn process_event(&self, _event: &InboundEvent) -> Result<Vec<EventAction>, ConnectorError> {
        Ok(std::mem::take(&mut *self.actions.lock().unwrap()))
    }
}
