//! Integration credential entity model
//!
//! Encrypted secret material belonging to exactly one integration.

use std::collections::BTreeMap;

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Plaintext credential payload. Never logged.
pub type CredentialData = BTreeMap<String, String>;

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
pub enum CredentialType {
    #[sea_orm(string_value = "oauth2")]
    OAuth2,
    #[sea_orm(string_value = "token")]
    Token,
    #[sea_orm(string_value = "service_account")]
    ServiceAccount,
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "integration_credentials")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[sea_orm(unique)]
    pub integration_id: Uuid,

    pub credential_type: CredentialType,

    /// AES-256-GCM sealed JSON of the credential data map
    pub credential_data_encrypted: Vec<u8>,

    pub expires_at: Option<DateTimeWithTimeZone>,

    /// Vault key generation used to seal `credential_data_encrypted`
    pub encryption_key_id: String,

    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::integration::Entity",
        from = "Column::IntegrationId",
        to = "super::integration::Column::Id",
        on_delete = "Cascade"
    )]
    Integration,
}

impl Related<super::integration::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Integration.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
