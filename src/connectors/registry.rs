//! Connector registry
//!
//! Maps each connector type to the implementation serving it. Built once at
//! startup from configuration and shared read-only afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::AppConfig;
use crate::connectors::datadog::{DatadogConnector, DatadogSettings};
use crate::connectors::gcp::{GcpConnector, GcpSettings};
use crate::connectors::github::{GitHubAppSettings, GitHubConnector};
use crate::connectors::http::build_client;
use crate::connectors::inbox::WebhookInbox;
use crate::connectors::slack::{SlackConnector, SlackSettings};
use crate::connectors::{AuthorizationKind, Connector, ConnectorError, ConnectorMetadata};
use crate::models::ConnectorType;

/// Error type for registry operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("Connector '{name}' not found")]
    ConnectorNotFound { name: String },
    #[error("Connector '{connector_type}' could not be initialized: {source}")]
    Initialization {
        connector_type: ConnectorType,
        #[source]
        source: ConnectorError,
    },
}

/// Connector registry keyed by connector type
#[derive(Clone, Default)]
pub struct Registry {
    connectors: HashMap<ConnectorType, Arc<dyn Connector>>,
    metadata: HashMap<ConnectorType, ConnectorMetadata>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("connectors", &self.connector_types())
            .finish()
    }
}

impl Registry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry with every connector the configuration enables
    pub fn from_config(config: &AppConfig) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        let http = build_client(config.vendor_timeout()).map_err(|source| {
            RegistryError::Initialization {
                connector_type: ConnectorType::Github,
                source,
            }
        })?;
        let inbox = || WebhookInbox::new(config.webhook_inbox_capacity);

        match GitHubAppSettings::from_config(config) {
            Some(settings) => {
                let connector = GitHubConnector::new(settings, http.clone())
                    .map_err(|source| RegistryError::Initialization {
                        connector_type: ConnectorType::Github,
                        source,
                    })?
                    .with_inbox(inbox());
                registry.register(
                    Arc::new(connector),
                    ConnectorMetadata::new(
                        ConnectorType::Github,
                        AuthorizationKind::Installation,
                        Vec::new(),
                        config.github.webhook_secret.is_some(),
                    ),
                );
            }
            None => warn!("GitHub connector not registered: missing GitHub App settings"),
        }

        match SlackSettings::from_config(config) {
            Some(settings) => {
                let scopes = settings.scopes.clone();
                let webhooks = settings.signing_secret.is_some();
                registry.register(
                    Arc::new(SlackConnector::new(settings, http.clone()).with_inbox(inbox())),
                    ConnectorMetadata::new(
                        ConnectorType::Slack,
                        AuthorizationKind::Oauth2,
                        scopes,
                        webhooks,
                    ),
                );
            }
            None => warn!("Slack connector not registered: missing Slack client credentials"),
        }

        if let Some(settings) = DatadogSettings::from_config(config) {
            registry.register(
                Arc::new(DatadogConnector::new(settings, http.clone())),
                ConnectorMetadata::minimal(
                    ConnectorType::Datadog,
                    AuthorizationKind::ApiKey,
                ),
            );
        }

        if let Some(settings) = GcpSettings::from_config(config) {
            registry.register(
                Arc::new(GcpConnector::new(settings, http)),
                ConnectorMetadata::minimal(
                    ConnectorType::Gcp,
                    AuthorizationKind::ApiKey,
                ),
            );
        }

        info!(connectors = ?registry.connector_types(), "Connector registry initialized");
        Ok(registry)
    }

    /// Register a connector with its metadata, replacing any previous one
    /// for the same type
    pub fn register(&mut self, connector: Arc<dyn Connector>, metadata: ConnectorMetadata) {
        let connector_type = connector.connector_type();
        self.connectors.insert(connector_type, connector);
        self.metadata.insert(connector_type, metadata);
    }

    /// Register a connector with metadata derived from the trait
    pub fn register_connector(&mut self, connector: Arc<dyn Connector>) {
        let metadata = ConnectorMetadata::new(
            connector.connector_type(),
            connector.authorization_kind(),
            Vec::new(),
            connector.webhook_inbox().is_some(),
        );
        self.register(connector, metadata);
    }

    /// Get a connector by type
    pub fn get(&self, connector_type: ConnectorType) -> Result<Arc<dyn Connector>, RegistryError> {
        self.connectors
            .get(&connector_type)
            .cloned()
            .ok_or_else(|| RegistryError::ConnectorNotFound {
                name: connector_type.to_string(),
            })
    }

    /// Resolve a connector from its wire name
    pub fn get_by_name(&self, name: &str) -> Result<Arc<dyn Connector>, RegistryError> {
        let connector_type =
            name.parse::<ConnectorType>()
                .map_err(|_| RegistryError::ConnectorNotFound {
                    name: name.to_string(),
                })?;
        self.get(connector_type)
    }

    /// Registered connectors, sorted by type name for stable ordering
    pub fn connectors(&self) -> Vec<Arc<dyn Connector>> {
        let mut connectors: Vec<_> = self.connectors.values().cloned().collect();
        connectors.sort_by_key(|c| c.connector_type().as_str());
        connectors
    }

    pub fn connector_types(&self) -> Vec<ConnectorType> {
        let mut types: Vec<_> = self.connectors.keys().copied().collect();
        types.sort_by_key(|t| t.as_str());
        types
    }

    /// Get metadata for all connectors, sorted by type name
    pub fn list_metadata(&self) -> Vec<ConnectorMetadata> {
        let mut metadata: Vec<_> = self.metadata.values().cloned().collect();
        metadata.sort_by_key(|m| m.connector_type.as_str());
        metadata
    }

    pub fn get_metadata(&self, connector_type: ConnectorType) -> Option<&ConnectorMetadata> {
        self.metadata.get(&connector_type)
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }
}
