//! Credential repository
//!
//! Stores only sealed credential blobs; sealing and opening happens in the
//! service through the vault.

use chrono::{DateTime, Utc};
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use std::sync::Arc;
use uuid::Uuid;

use super::{RepositoryError, RepositoryResult};
use crate::models::CredentialType;
use crate::models::credential::{self, Entity as IntegrationCredential};

/// An encrypted credential ready to be written.
#[derive(Clone)]
pub struct SealedCredential {
    pub credential_type: CredentialType,
    pub ciphertext: Vec<u8>,
    pub encryption_key_id: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for SealedCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealedCredential")
            .field("credential_type", &self.credential_type)
            .field("ciphertext_len", &self.ciphertext.len())
            .field("encryption_key_id", &self.encryption_key_id)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

pub(super) async fn insert_credential<C: ConnectionTrait>(
    conn: &C,
    integration_id: Uuid,
    sealed: SealedCredential,
    now: DateTimeWithTimeZone,
) -> RepositoryResult<credential::Model> {
    Ok(credential::ActiveModel {
        id: Set(Uuid::new_v4()),
        integration_id: Set(integration_id),
        credential_type: Set(sealed.credential_type),
        credential_data_encrypted: Set(sealed.ciphertext),
        expires_at: Set(sealed.expires_at.map(Into::into)),
        encryption_key_id: Set(sealed.encryption_key_id),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(conn)
    .await?)
}

/// Repository for sealed credential rows
#[derive(Debug, Clone)]
pub struct CredentialRepository {
    pub db: Arc<DatabaseConnection>,
}

impl CredentialRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn find_by_integration(
        &self,
        integration_id: Uuid,
    ) -> RepositoryResult<Option<credential::Model>> {
        Ok(IntegrationCredential::find()
            .filter(credential::Column::IntegrationId.eq(integration_id))
            .one(&*self.db)
            .await?)
    }

    /// Overwrites the sealed data of an integration's credential in place
    pub async fn replace(
        &self,
        integration_id: Uuid,
        sealed: SealedCredential,
    ) -> RepositoryResult<credential::Model> {
        let existing = self
            .find_by_integration(integration_id)
            .await?
            .ok_or(RepositoryError::NotFound)?;

        let mut active: credential::ActiveModel = existing.into();
        active.credential_type = Set(sealed.credential_type);
        active.credential_data_encrypted = Set(sealed.ciphertext);
        active.encryption_key_id = Set(sealed.encryption_key_id);
        active.expires_at = Set(sealed.expires_at.map(Into::into));
        active.updated_at = Set(Utc::now().into());
        Ok(active.update(&*self.db).await?)
    }

    /// Rows sealed under any key other than `key_id`
    pub async fn list_not_under_key(&self, key_id: &str) -> RepositoryResult<Vec<credential::Model>> {
        Ok(IntegrationCredential::find()
            .filter(credential::Column::EncryptionKeyId.ne(key_id))
            .order_by_asc(credential::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }

    /// Rows whose expiry falls before `cutoff`, soonest first
    pub async fn list_expiring_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> RepositoryResult<Vec<credential::Model>> {
        let cutoff: DateTimeWithTimeZone = cutoff.into();
        Ok(IntegrationCredential::find()
            .filter(credential::Column::ExpiresAt.is_not_null())
            .filter(credential::Column::ExpiresAt.lte(cutoff))
            .order_by_asc(credential::Column::ExpiresAt)
            .all(&*self.db)
            .await?)
    }
}
