//! Integration entity model
//!
//! One organization's connection to one connector type.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use utoipa::ToSchema;
use uuid::Uuid;

/// Lifecycle status of an integration.
///
/// `not_started -> pending -> active <-> inactive -> deleted`, with
/// `suspended` reachable from `active` when the vendor puts the
/// installation on hold.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
pub enum IntegrationStatus {
    #[sea_orm(string_value = "not_started")]
    NotStarted,
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "active")]
    Active,
    #[sea_orm(string_value = "inactive")]
    Inactive,
    #[sea_orm(string_value = "suspended")]
    Suspended,
    #[sea_orm(string_value = "deleted")]
    Deleted,
}

impl IntegrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrationStatus::NotStarted => "not_started",
            IntegrationStatus::Pending => "pending",
            IntegrationStatus::Active => "active",
            IntegrationStatus::Inactive => "inactive",
            IntegrationStatus::Suspended => "suspended",
            IntegrationStatus::Deleted => "deleted",
        }
    }
}

impl fmt::Display for IntegrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connector types known to the platform.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
pub enum ConnectorType {
    /// Source control (GitHub App installation)
    #[sea_orm(string_value = "github")]
    Github,
    /// Chat (Slack OAuth v2)
    #[sea_orm(string_value = "slack")]
    Slack,
    /// Cloud (Google Cloud service account)
    #[sea_orm(string_value = "gcp")]
    Gcp,
    /// Monitoring (Datadog API key)
    #[sea_orm(string_value = "datadog")]
    Datadog,
}

impl ConnectorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorType::Github => "github",
            ConnectorType::Slack => "slack",
            ConnectorType::Gcp => "gcp",
            ConnectorType::Datadog => "datadog",
        }
    }

    /// Broad category the connector belongs to
    pub fn category(&self) -> &'static str {
        match self {
            ConnectorType::Github => "source_control",
            ConnectorType::Slack => "chat",
            ConnectorType::Gcp => "cloud",
            ConnectorType::Datadog => "monitoring",
        }
    }
}

impl fmt::Display for ConnectorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a connector type string does not name a known connector.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown connector type '{0}'")]
pub struct UnknownConnectorType(pub String);

impl FromStr for ConnectorType {
    type Err = UnknownConnectorType;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "github" => Ok(ConnectorType::Github),
            "slack" => Ok(ConnectorType::Slack),
            "gcp" | "google_cloud" => Ok(ConnectorType::Gcp),
            "datadog" => Ok(ConnectorType::Datadog),
            _ => Err(UnknownConnectorType(value.to_string())),
        }
    }
}

/// Integration entity
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "integrations")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Owning organization (opaque platform identifier)
    pub organization_id: String,

    /// Platform user that started the integration
    pub user_id: String,

    pub connector_type: ConnectorType,

    pub status: IntegrationStatus,

    /// Vendor-side installation/app id, empty when the connector has none
    pub bot_id: String,

    /// Vendor account identifiers
    pub connector_user_id: String,
    pub connector_organization_id: String,

    /// Vendor-specific descriptive fields (string to string map)
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub metadata: Option<JsonValue>,

    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
    pub last_used_at: Option<DateTimeWithTimeZone>,
}

impl Model {
    /// Metadata as a string map; non-string values are skipped.
    pub fn metadata_map(&self) -> BTreeMap<String, String> {
        metadata_from_json(self.metadata.as_ref())
    }

    pub fn is_active(&self) -> bool {
        self.status == IntegrationStatus::Active
    }
}

/// Convert a string map into the JSON stored in the `metadata` column.
pub fn metadata_to_json(metadata: &BTreeMap<String, String>) -> Option<JsonValue> {
    if metadata.is_empty() {
        return None;
    }
    Some(JsonValue::Object(
        metadata
            .iter()
            .map(|(k, v)| (k.clone(), JsonValue::String(v.clone())))
            .collect(),
    ))
}

pub fn metadata_from_json(value: Option<&JsonValue>) -> BTreeMap<String, String> {
    value
        .and_then(|v| v.as_object())
        .map(|object| {
            object
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_one = "super::credential::Entity")]
    Credential,
    #[sea_orm(has_many = "super::repository_resource::Entity")]
    RepositoryResources,
}

impl Related<super::credential::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Credential.def()
    }
}

impl Related<super::repository_resource::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::RepositoryResources.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
