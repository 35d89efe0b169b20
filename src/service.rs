//! # Integration Service
//!
//! Orchestrates connectors, the credential vault and the repositories. Every
//! command an outer layer issues goes through [`IntegrationService`], which
//! keeps the "one active integration per organization and connector type"
//! invariant and the encryption boundary in one place. Connectors never
//! write to storage; whatever they need persisted comes back as data and is
//! applied here.
//!
//! Each vendor call is bounded by the configured vendor timeout.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::SubscriptionConfig;
use crate::connectors::{
    Authorization, AuthorizationData, AuthorizationIntent, AuthorizationKind, AuthorizeParams,
    Connector, ConnectorError, Credentials, EventAction, EventHandler, InboundEvent, Registry,
    SyncParams, SyncRequest,
};
use crate::crypto::CredentialVault;
use crate::error::IntegrationError;
use crate::events::{BroadcastEventSink, DispatchedEvent, EventSink};
use crate::models::credential;
use crate::models::integration::Model as Integration;
use crate::models::{ConnectorType, CredentialData, IntegrationStatus};
use crate::repositories::{
    CredentialRepository, IntegrationQuery, IntegrationRepository, NewIntegration,
    ReconcileSummary, ResourceRepository, SealedCredential,
};
use crate::state::{StateCodec, StateError};
use crate::supervisor::{RestartPolicy, SubscriptionSupervisor};

const DEFAULT_VENDOR_TIMEOUT: Duration = Duration::from_secs(30);

pub type ServiceResult<T> = Result<T, IntegrationError>;

/// Pre-flight credential check result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ValidationResult {
    fn valid() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }

    fn invalid(errors: Vec<String>) -> Self {
        Self {
            valid: false,
            errors,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RevokeOutcome {
    pub integration_id: Uuid,
    /// Whether the vendor confirmed the revocation; local rows are deleted
    /// either way
    pub vendor_revoked: bool,
}

#[derive(Debug, Clone)]
pub struct SyncReport {
    pub integration: Integration,
    /// `None` when the connector keeps no side table
    pub resources: Option<ReconcileSummary>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RotationReport {
    pub examined: u64,
    pub rotated: u64,
    pub failed: u64,
    pub dry_run: bool,
}

#[derive(Clone)]
pub struct IntegrationService {
    integrations: Arc<IntegrationRepository>,
    credentials: Arc<CredentialRepository>,
    resources: Arc<ResourceRepository>,
    registry: Arc<Registry>,
    vault: Arc<CredentialVault>,
    state_codec: StateCodec,
    events: Arc<dyn EventSink>,
    vendor_timeout: Duration,
}

impl IntegrationService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        registry: Arc<Registry>,
        vault: Arc<CredentialVault>,
        state_codec: StateCodec,
    ) -> Self {
        Self {
            integrations: Arc::new(IntegrationRepository::new(db.clone())),
            credentials: Arc::new(CredentialRepository::new(db.clone())),
            resources: Arc::new(ResourceRepository::new(db)),
            registry,
            vault,
            state_codec,
            events: Arc::new(BroadcastEventSink::default()),
            vendor_timeout: DEFAULT_VENDOR_TIMEOUT,
        }
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_vendor_timeout(mut self, vendor_timeout: Duration) -> Self {
        self.vendor_timeout = vendor_timeout;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn state_codec(&self) -> &StateCodec {
        &self.state_codec
    }

    /// Start the authorization flow for an organization.
    #[instrument(skip(self), fields(connector_type = %connector_type))]
    pub async fn new_integration(
        &self,
        organization_id: &str,
        user_id: &str,
        connector_type: ConnectorType,
    ) -> ServiceResult<AuthorizationIntent> {
        require_identity(organization_id, user_id)?;
        let connector = self.connector(connector_type)?;

        if !self
            .integrations
            .find_active(organization_id, connector_type)
            .await?
            .is_empty()
        {
            return Err(IntegrationError::AlreadyConnected { connector_type });
        }

        let params = AuthorizeParams {
            organization_id: organization_id.to_string(),
            user_id: user_id.to_string(),
            state: self.state_codec.encode(organization_id, user_id),
        };
        self.vendor_call(
            connector_type,
            "initiate_authorization",
            connector.initiate_authorization(params),
        )
        .await
    }

    /// Complete the flow from callback data. Installation connectors are
    /// reconciled against existing rows instead of always creating one.
    #[instrument(skip(self, data), fields(connector_type = %connector_type))]
    pub async fn authorize_integration(
        &self,
        connector_type: ConnectorType,
        data: AuthorizationData,
    ) -> ServiceResult<Integration> {
        let connector = self.connector(connector_type)?;
        let token = data
            .state
            .as_deref()
            .filter(|state| !state.is_empty())
            .ok_or(IntegrationError::InvalidState(StateError::Empty))?;
        let state = self.state_codec.decode(token)?;
        require_identity(&state.organization_id, &state.user_id)?;

        if connector.authorization_kind() == AuthorizationKind::Installation {
            return self
                .claim_installation(connector, &state.organization_id, &state.user_id, data)
                .await;
        }

        if !self
            .integrations
            .find_active(&state.organization_id, connector_type)
            .await?
            .is_empty()
        {
            return Err(IntegrationError::AlreadyConnected { connector_type });
        }

        let authorization = self
            .vendor_call(
                connector_type,
                "complete_authorization",
                connector.complete_authorization(data),
            )
            .await?;
        let credentials = authorization.credentials.clone();
        let integration = self
            .bind_authorization(
                connector_type,
                &state.organization_id,
                &state.user_id,
                authorization,
            )
            .await?;

        counter!("integration_authorizations_total", "connector" => connector_type.as_str())
            .increment(1);
        info!(
            integration_id = %integration.id,
            organization_id = %integration.organization_id,
            "Integration authorized"
        );

        self.spawn_configure_webhooks(connector, integration.id, credentials);
        Ok(integration)
    }

    /// Connect an API-key or service-account connector from directly
    /// supplied secrets.
    pub async fn connect_with_credentials(
        &self,
        organization_id: &str,
        user_id: &str,
        connector_type: ConnectorType,
        raw: CredentialData,
    ) -> ServiceResult<Integration> {
        require_identity(organization_id, user_id)?;
        let connector = self.connector(connector_type)?;
        if connector.authorization_kind() != AuthorizationKind::ApiKey {
            return Err(IntegrationError::InvalidRequest(format!(
                "{} does not accept directly supplied credentials",
                connector_type
            )));
        }

        let data = AuthorizationData {
            state: Some(self.state_codec.encode(organization_id, user_id)),
            credentials: Some(raw),
            ..Default::default()
        };
        self.authorize_integration(connector_type, data).await
    }

    /// Persist a completed OAuth or API-key authorization. A row already
    /// bound to the same vendor account in this organization is reactivated
    /// with the new credential; otherwise inactive leftovers are removed and
    /// a fresh row is created.
    async fn bind_authorization(
        &self,
        connector_type: ConnectorType,
        organization_id: &str,
        user_id: &str,
        authorization: Authorization,
    ) -> ServiceResult<Integration> {
        let bot_id = authorization.account.bot_id.as_str();
        if !bot_id.is_empty()
            && let Some(existing) = self.integrations.find_by_bot_id(connector_type, bot_id).await?
        {
            if existing.organization_id != organization_id {
                warn!(
                    integration_id = %existing.id,
                    bot_id = %existing.bot_id,
                    "Vendor account is already connected by another organization"
                );
                return Err(IntegrationError::DuplicateIntegration(format!(
                    "{} account {} belongs to another organization",
                    connector_type, existing.bot_id
                )));
            }
            if existing.is_active() {
                return Err(IntegrationError::AlreadyConnected { connector_type });
            }

            let sealed = self.seal(existing.id, &authorization.credentials)?;
            let reactivated = self
                .integrations
                .reassign_with_credential(existing.id, user_id, authorization.account, sealed)
                .await?;
            info!(
                integration_id = %reactivated.id,
                previous_status = existing.status.as_str(),
                "Integration reactivated"
            );
            return Ok(reactivated);
        }

        let removed = self
            .integrations
            .delete_inactive_for(organization_id, connector_type)
            .await?;
        if removed > 0 {
            debug!(removed, "Removed inactive integrations before authorization");
        }
        self.create_integration(connector_type, organization_id, user_id, authorization)
            .await
    }

    /// Bind a vendor installation to an organization.
    ///
    /// 1. A row already bound to the installation is returned, reactivating
    ///    it if needed.
    /// 2. Otherwise an active row for the organization is re-pointed at the
    ///    new installation.
    /// 3. Otherwise inactive leftovers are removed and a fresh row created.
    ///
    /// Cases 2 and 3 queue a background resource sync whose failure is only
    /// logged.
    async fn claim_installation(
        &self,
        connector: Arc<dyn Connector>,
        organization_id: &str,
        user_id: &str,
        data: AuthorizationData,
    ) -> ServiceResult<Integration> {
        let connector_type = connector.connector_type();
        let installation_id = data
            .installation_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| IntegrationError::InvalidRequest("installation_id is required".into()))?
            .to_string();

        if let Some(existing) = self
            .integrations
            .find_by_bot_id(connector_type, &installation_id)
            .await?
        {
            return self.reclaim(existing, organization_id).await;
        }

        let authorization = self
            .vendor_call(
                connector_type,
                "complete_authorization",
                connector.complete_authorization(data),
            )
            .await?;
        let credentials = authorization.credentials.clone();

        let active = self
            .integrations
            .find_active(organization_id, connector_type)
            .await?;
        let integration = match active.split_first() {
            // A concurrent claim of this installation committed first.
            Some((current, _)) if current.bot_id == installation_id => {
                counter!("integration_claims_total", "outcome" => "conflict").increment(1);
                return Err(IntegrationError::DuplicateIntegration(format!(
                    "installation {} was claimed concurrently",
                    installation_id
                )));
            }
            Some((current, others)) => {
                if !others.is_empty() {
                    warn!(
                        organization_id = %organization_id,
                        connector_type = %connector_type,
                        active_rows = active.len(),
                        "Multiple active integrations found; re-pointing the most recent"
                    );
                }
                let sealed = self.seal(current.id, &authorization.credentials)?;
                let previous_bot_id = current.bot_id.clone();
                let updated = self
                    .integrations
                    .reassign_with_credential(current.id, user_id, authorization.account, sealed)
                    .await?;
                counter!("integration_claims_total", "outcome" => "reassigned").increment(1);
                info!(
                    integration_id = %updated.id,
                    previous_bot_id = %previous_bot_id,
                    bot_id = %updated.bot_id,
                    "Integration re-pointed at new installation"
                );
                updated
            }
            None => {
                let removed = self
                    .integrations
                    .delete_inactive_for(organization_id, connector_type)
                    .await?;
                if removed > 0 {
                    debug!(removed, "Removed inactive integrations before claim");
                }
                let created = self
                    .create_integration(connector_type, organization_id, user_id, authorization)
                    .await?;
                counter!("integration_claims_total", "outcome" => "created").increment(1);
                info!(
                    integration_id = %created.id,
                    organization_id = %organization_id,
                    bot_id = %created.bot_id,
                    "Installation claimed"
                );
                created
            }
        };

        self.spawn_configure_webhooks(connector, integration.id, credentials);
        self.spawn_sync(integration.id, organization_id);
        Ok(integration)
    }

    async fn reclaim(
        &self,
        existing: Integration,
        organization_id: &str,
    ) -> ServiceResult<Integration> {
        if existing.organization_id != organization_id {
            counter!("integration_claims_total", "outcome" => "conflict").increment(1);
            warn!(
                integration_id = %existing.id,
                bot_id = %existing.bot_id,
                "Installation is already claimed by another organization"
            );
            return Err(IntegrationError::DuplicateIntegration(format!(
                "installation {} belongs to another organization",
                existing.bot_id
            )));
        }

        if existing.is_active() {
            counter!("integration_claims_total", "outcome" => "unchanged").increment(1);
            return Ok(existing);
        }

        let connector_type = existing.connector_type;
        if !self
            .integrations
            .find_active(organization_id, connector_type)
            .await?
            .is_empty()
        {
            return Err(IntegrationError::AlreadyConnected { connector_type });
        }

        let reactivated = self
            .integrations
            .set_status(existing.id, IntegrationStatus::Active)
            .await?;
        counter!("integration_claims_total", "outcome" => "reactivated").increment(1);
        info!(
            integration_id = %reactivated.id,
            previous_status = existing.status.as_str(),
            "Integration reactivated"
        );
        self.spawn_sync(reactivated.id, organization_id);
        Ok(reactivated)
    }

    /// Revoke vendor-side when possible, then delete the credential and the
    /// integration. Vendor failures never keep the local rows alive.
    #[instrument(skip(self))]
    pub async fn revoke_integration(
        &self,
        integration_id: Uuid,
        organization_id: &str,
    ) -> ServiceResult<RevokeOutcome> {
        let integration = self
            .integrations
            .find_for_organization(integration_id, organization_id)
            .await?
            .ok_or(IntegrationError::NotFound)?;
        let connector_type = integration.connector_type;

        let vendor_revoked = match self.registry.get(connector_type) {
            Err(_) => {
                warn!(connector_type = %connector_type, "Connector not registered; skipping vendor revocation");
                false
            }
            Ok(connector) => match self.load_credentials(integration_id).await {
                Err(error) => {
                    warn!(%error, "Stored credential unreadable; skipping vendor revocation");
                    false
                }
                Ok(credentials) => match self
                    .vendor_call(
                        connector_type,
                        "revoke_credentials",
                        connector.revoke_credentials(&credentials),
                    )
                    .await
                {
                    Ok(()) => true,
                    Err(error) => {
                        warn!(%error, "Vendor revocation failed; deleting locally");
                        false
                    }
                },
            },
        };

        self.integrations
            .delete_with_credential(integration_id)
            .await?;

        counter!(
            "integration_revocations_total",
            "connector" => connector_type.as_str(),
            "vendor_revoked" => if vendor_revoked { "true" } else { "false" }
        )
        .increment(1);
        info!(
            integration_id = %integration_id,
            organization_id = %organization_id,
            vendor_revoked,
            "Integration revoked"
        );

        Ok(RevokeOutcome {
            integration_id,
            vendor_revoked,
        })
    }

    /// Pull remote state and reconcile side tables.
    #[instrument(skip(self))]
    pub async fn sync_integration(
        &self,
        integration_id: Uuid,
        organization_id: &str,
        request: SyncRequest,
    ) -> ServiceResult<SyncReport> {
        self.sync_internal(integration_id, organization_id, request)
            .await
    }

    async fn sync_internal(
        &self,
        integration_id: Uuid,
        organization_id: &str,
        request: SyncRequest,
    ) -> ServiceResult<SyncReport> {
        let integration = self
            .integrations
            .find_for_organization(integration_id, organization_id)
            .await?
            .ok_or(IntegrationError::NotFound)?;
        if !integration.is_active() {
            return Err(IntegrationError::InvalidRequest(format!(
                "integration is {}; only active integrations can be synced",
                integration.status.as_str()
            )));
        }

        let connector_type = integration.connector_type;
        let connector = self.connector(connector_type)?;
        let mut credentials = self.load_credentials(integration_id).await?;
        if credentials.is_expired_at(Utc::now()) {
            credentials = self
                .vendor_call(
                    connector_type,
                    "refresh_credentials",
                    connector.refresh_credentials(&credentials),
                )
                .await?;
            self.credentials
                .replace(integration_id, self.seal(integration_id, &credentials)?)
                .await?;
        }

        let outcome = self
            .vendor_call(
                connector_type,
                "sync",
                connector.sync(SyncParams {
                    integration,
                    credentials,
                    request,
                }),
            )
            .await?;

        if let Some(rotated) = &outcome.credentials {
            self.credentials
                .replace(integration_id, self.seal(integration_id, rotated)?)
                .await?;
        }

        let now = Utc::now();
        let resources = match &outcome.resources {
            Some(remote) => Some(
                self.resources
                    .reconcile(integration_id, remote, request.prune, now)
                    .await?,
            ),
            None => None,
        };
        let integration = self
            .integrations
            .record_sync(integration_id, outcome.metadata.as_ref(), now)
            .await?;

        counter!("integration_syncs_total", "connector" => connector_type.as_str()).increment(1);
        info!(
            integration_id = %integration_id,
            created = resources.map(|r| r.created),
            updated = resources.map(|r| r.updated),
            removed = resources.map(|r| r.removed),
            "Integration synced"
        );

        Ok(SyncReport {
            integration,
            resources,
        })
    }

    /// Organization-scoped listing
    pub async fn integrations(&self, query: &IntegrationQuery) -> ServiceResult<Vec<Integration>> {
        if query.organization_id.is_empty() {
            return Err(IntegrationError::InvalidRequest(
                "organization_id is required".into(),
            ));
        }
        Ok(self.integrations.query(query).await?)
    }

    /// First integration matching the query
    pub async fn integration(&self, query: &IntegrationQuery) -> ServiceResult<Integration> {
        self.integrations(query)
            .await?
            .into_iter()
            .next()
            .ok_or(IntegrationError::NotFound)
    }

    /// Normalize and live-check credentials without persisting anything.
    /// Problems are reported in the result; only an unknown connector or an
    /// infrastructure failure is an error.
    #[instrument(skip(self, raw), fields(connector_type = %connector_type))]
    pub async fn validate_credentials(
        &self,
        connector_type: ConnectorType,
        raw: &CredentialData,
    ) -> ServiceResult<ValidationResult> {
        let connector = self.connector(connector_type)?;
        let normalized = match connector.normalize_credentials(raw) {
            Ok(normalized) => normalized,
            Err(errors) => return Ok(ValidationResult::invalid(errors)),
        };

        let credentials = Credentials::new(connector.credential_type(), normalized);
        match self
            .vendor_call(
                connector_type,
                "validate_credentials",
                connector.validate_credentials(&credentials),
            )
            .await
        {
            Ok(()) => Ok(ValidationResult::valid()),
            Err(IntegrationError::VendorApi { source, .. }) => {
                Ok(ValidationResult::invalid(vec![source.to_string()]))
            }
            Err(IntegrationError::InvalidRequest(details)) => {
                Ok(ValidationResult::invalid(vec![details]))
            }
            Err(other) => Err(other),
        }
    }

    /// Re-seal every credential stored under a non-default key id.
    #[instrument(skip(self))]
    pub async fn rotate_credential_keys(&self, dry_run: bool) -> ServiceResult<RotationReport> {
        let target = self.vault.default_key_id().to_string();
        let rows = self.credentials.list_not_under_key(&target).await?;
        let mut report = RotationReport {
            examined: rows.len() as u64,
            dry_run,
            ..Default::default()
        };

        for row in rows {
            let credentials = match self.open(&row) {
                Ok(credentials) => credentials,
                Err(error) => {
                    error!(
                        integration_id = %row.integration_id,
                        key_id = %row.encryption_key_id,
                        %error,
                        "Credential cannot be decrypted for rotation"
                    );
                    report.failed += 1;
                    continue;
                }
            };

            if !dry_run {
                let sealed = self.seal(row.integration_id, &credentials)?;
                self.credentials.replace(row.integration_id, sealed).await?;
            }
            report.rotated += 1;
        }

        info!(
            examined = report.examined,
            rotated = report.rotated,
            failed = report.failed,
            dry_run,
            key_id = %target,
            "Credential key rotation finished"
        );
        Ok(report)
    }

    /// Integrations whose stored credentials expire before `cutoff`
    pub async fn due_for_refresh(&self, cutoff: DateTime<Utc>) -> ServiceResult<Vec<Uuid>> {
        Ok(self
            .credentials
            .list_expiring_before(cutoff)
            .await?
            .into_iter()
            .map(|row| row.integration_id)
            .collect())
    }

    /// Refresh and persist one integration's credentials. Returns whether
    /// anything changed.
    pub async fn refresh_credentials_for(&self, integration_id: Uuid) -> ServiceResult<bool> {
        let integration = self
            .integrations
            .find_by_id(integration_id)
            .await?
            .ok_or(IntegrationError::NotFound)?;
        if !integration.is_active() {
            debug!(integration_id = %integration_id, "Skipping refresh of inactive integration");
            return Ok(false);
        }

        let connector_type = integration.connector_type;
        let connector = self.connector(connector_type)?;
        let credentials = self.load_credentials(integration_id).await?;
        let refreshed = self
            .vendor_call(
                connector_type,
                "refresh_credentials",
                connector.refresh_credentials(&credentials),
            )
            .await?;
        if refreshed == credentials {
            return Ok(false);
        }

        self.credentials
            .replace(integration_id, self.seal(integration_id, &refreshed)?)
            .await?;
        Ok(true)
    }

    /// Mark an integration inactive after its credentials were rejected
    pub async fn deactivate(&self, integration_id: Uuid) -> ServiceResult<Integration> {
        let integration = self
            .integrations
            .set_status(integration_id, IntegrationStatus::Inactive)
            .await?;
        warn!(integration_id = %integration_id, "Integration deactivated");
        Ok(integration)
    }

    /// Apply one inbound event and publish it to the event sink.
    #[instrument(
        skip_all,
        fields(connector_type = %event.connector_type, event_type = %event.event_type)
    )]
    pub async fn process_event(&self, event: InboundEvent) -> ServiceResult<DispatchedEvent> {
        let connector_type = event.connector_type;
        let connector = self.connector(connector_type)?;
        let actions = self
            .vendor_call(
                connector_type,
                "process_event",
                connector.process_event(&event),
            )
            .await?;

        let mut dispatched = DispatchedEvent::from_inbound(event);
        for action in actions {
            match self.apply_action(connector_type, action).await {
                Ok(Some(integration)) => {
                    dispatched.integration_id = Some(integration.id);
                    dispatched.organization_id = Some(integration.organization_id);
                    dispatched.actions_applied += 1;
                }
                Ok(None) => {}
                Err(error) => warn!(%error, "Event action failed"),
            }
        }

        counter!("integration_events_total", "connector" => connector_type.as_str()).increment(1);
        self.events.publish(dispatched.clone()).await;
        Ok(dispatched)
    }

    async fn apply_action(
        &self,
        connector_type: ConnectorType,
        action: EventAction,
    ) -> ServiceResult<Option<Integration>> {
        let bot_id = match &action {
            EventAction::SetStatus { bot_id, .. }
            | EventAction::Resync { bot_id }
            | EventAction::RemoveResources { bot_id, .. } => bot_id.clone(),
        };
        let Some(integration) = self
            .integrations
            .find_by_bot_id(connector_type, &bot_id)
            .await?
        else {
            debug!(bot_id = %bot_id, "Event refers to an unknown installation");
            return Ok(None);
        };

        match action {
            EventAction::SetStatus { status, .. } => {
                if integration.status == status {
                    return Ok(Some(integration));
                }
                let updated = self.integrations.set_status(integration.id, status).await?;
                info!(
                    integration_id = %updated.id,
                    from = integration.status.as_str(),
                    to = status.as_str(),
                    "Integration status changed by vendor event"
                );
                Ok(Some(updated))
            }
            EventAction::Resync { .. } => {
                let report = self
                    .sync_internal(
                        integration.id,
                        &integration.organization_id,
                        SyncRequest { prune: true },
                    )
                    .await?;
                Ok(Some(report.integration))
            }
            EventAction::RemoveResources { external_ids, .. } => {
                let removed = self
                    .resources
                    .delete_by_external_ids(integration.id, &external_ids)
                    .await?;
                debug!(integration_id = %integration.id, removed, "Removed resources");
                Ok(Some(integration))
            }
        }
    }

    /// Start one supervised subscription per registered connector. Returns
    /// immediately; the loops run until `shutdown` fires.
    pub fn subscribe(
        &self,
        shutdown: CancellationToken,
        config: &SubscriptionConfig,
    ) -> SubscriptionSupervisor {
        SubscriptionSupervisor::start(
            self.registry.connectors(),
            Arc::new(self.clone()),
            shutdown,
            RestartPolicy::from_config(config),
        )
    }

    fn connector(&self, connector_type: ConnectorType) -> ServiceResult<Arc<dyn Connector>> {
        self.registry
            .get(connector_type)
            .map_err(|_| IntegrationError::UnsupportedConnector(connector_type.to_string()))
    }

    async fn vendor_call<T, F>(
        &self,
        connector_type: ConnectorType,
        operation: &'static str,
        call: F,
    ) -> ServiceResult<T>
    where
        F: Future<Output = Result<T, ConnectorError>>,
    {
        match tokio::time::timeout(self.vendor_timeout, call).await {
            Ok(result) => result.map_err(|source| IntegrationError::vendor(connector_type, source)),
            Err(_) => {
                warn!(
                    connector_type = %connector_type,
                    operation,
                    timeout_ms = self.vendor_timeout.as_millis() as u64,
                    "Vendor call timed out"
                );
                Err(IntegrationError::vendor(
                    connector_type,
                    ConnectorError::timeout(operation),
                ))
            }
        }
    }

    async fn create_integration(
        &self,
        connector_type: ConnectorType,
        organization_id: &str,
        user_id: &str,
        authorization: Authorization,
    ) -> ServiceResult<Integration> {
        let id = Uuid::new_v4();
        let sealed = self.seal(id, &authorization.credentials)?;
        let integration = self
            .integrations
            .create_with_credential(
                NewIntegration {
                    id,
                    organization_id: organization_id.to_string(),
                    user_id: user_id.to_string(),
                    connector_type,
                    status: IntegrationStatus::Active,
                    account: authorization.account,
                },
                sealed,
            )
            .await?;
        Ok(integration)
    }

    fn seal(&self, integration_id: Uuid, credentials: &Credentials) -> ServiceResult<SealedCredential> {
        let (ciphertext, encryption_key_id) = self
            .vault
            .encrypt(&credentials.data, None, integration_id)
            .map_err(IntegrationError::encrypt)?;
        Ok(SealedCredential {
            credential_type: credentials.credential_type,
            ciphertext,
            encryption_key_id,
            expires_at: credentials.expires_at,
        })
    }

    fn open(&self, row: &credential::Model) -> ServiceResult<Credentials> {
        let data = self
            .vault
            .decrypt(
                &row.credential_data_encrypted,
                &row.encryption_key_id,
                row.integration_id,
            )
            .map_err(IntegrationError::decrypt)?;
        Ok(Credentials::new(row.credential_type, data)
            .with_expiry(row.expires_at.map(|at| at.with_timezone(&Utc))))
    }

    async fn load_credentials(&self, integration_id: Uuid) -> ServiceResult<Credentials> {
        let row = self
            .credentials
            .find_by_integration(integration_id)
            .await?
            .ok_or_else(|| {
                IntegrationError::CredentialCorrupted(format!(
                    "no credential stored for integration {}",
                    integration_id
                ))
            })?;
        self.open(&row)
    }

    fn spawn_configure_webhooks(
        &self,
        connector: Arc<dyn Connector>,
        integration_id: Uuid,
        credentials: Credentials,
    ) {
        let service = self.clone();
        let connector_type = connector.connector_type();
        tokio::spawn(async move {
            if let Err(error) = service
                .vendor_call(
                    connector_type,
                    "configure_webhooks",
                    connector.configure_webhooks(integration_id, &credentials),
                )
                .await
            {
                warn!(integration_id = %integration_id, %error, "Webhook configuration failed");
            }
        });
    }

    fn spawn_sync(&self, integration_id: Uuid, organization_id: &str) {
        let service = self.clone();
        let organization_id = organization_id.to_string();
        tokio::spawn(async move {
            if let Err(error) = service
                .sync_internal(integration_id, &organization_id, SyncRequest { prune: true })
                .await
            {
                warn!(integration_id = %integration_id, %error, "Background sync failed");
            }
        });
    }
}

#[async_trait]
impl EventHandler for IntegrationService {
    async fn handle_event(&self, event: InboundEvent) -> Result<(), IntegrationError> {
        self.process_event(event).await.map(|_| ())
    }
}

fn require_identity(organization_id: &str, user_id: &str) -> ServiceResult<()> {
    if organization_id.trim().is_empty() {
        return Err(IntegrationError::InvalidRequest(
            "organization_id is required".into(),
        ));
    }
    if user_id.trim().is_empty() {
        return Err(IntegrationError::InvalidRequest("user_id is required".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_required() {
        assert!(matches!(
            require_identity("", "u1"),
            Err(IntegrationError::InvalidRequest(_))
        ));
        assert!(matches!(
            require_identity("o1", "  "),
            Err(IntegrationError::InvalidRequest(_))
        ));
        assert!(require_identity("o1", "u1").is_ok());
    }

    #[test]
    fn validation_result_shape() {
        let result = ValidationResult::invalid(vec!["api_key is required".into()]);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["valid"], false);
        assert_eq!(json["errors"][0], "api_key is required");
        assert!(ValidationResult::valid().errors.is_empty());
    }
}
