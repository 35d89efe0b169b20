//! Connector metadata types
//!
//! Static description of a registered connector, used for discovery and
//! operator diagnostics.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::connectors::trait_::AuthorizationKind;
use crate::models::ConnectorType;

/// Metadata about a connector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ConnectorMetadata {
    /// Connector type served by the implementation
    #[schema(value_type = String)]
    pub connector_type: ConnectorType,
    /// How credentials are obtained
    pub authorization_kind: AuthorizationKind,
    /// Vendor scopes requested during authorization (if applicable)
    pub scopes: Vec<String>,
    /// Whether the connector receives webhooks
    pub webhooks: bool,
}

impl ConnectorMetadata {
    pub fn new(
        connector_type: ConnectorType,
        authorization_kind: AuthorizationKind,
        scopes: Vec<String>,
        webhooks: bool,
    ) -> Self {
        Self {
            connector_type,
            authorization_kind,
            scopes,
            webhooks,
        }
    }

    /// Metadata for a connector without scopes or webhooks
    pub fn minimal(connector_type: ConnectorType, authorization_kind: AuthorizationKind) -> Self {
        Self::new(connector_type, authorization_kind, Vec::new(), false)
    }
}
