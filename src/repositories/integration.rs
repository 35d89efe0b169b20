//! Integration repository for database operations
//!
//! Every query is organization-scoped unless it is explicitly a lookup by
//! vendor identity (bot id), which reconciliation needs across organizations.

use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use super::credential::{SealedCredential, insert_credential};
use super::{RepositoryError, RepositoryResult};
use crate::connectors::VendorAccount;
use crate::models::credential::{self, Entity as IntegrationCredential};
use crate::models::integration::{self, Entity as Integration, metadata_to_json};
use crate::models::repository_resource::{self, Entity as RepositoryResource};
use crate::models::{ConnectorType, IntegrationStatus};

/// Organization-scoped read filter.
#[derive(Debug, Clone)]
pub struct IntegrationQuery {
    pub organization_id: String,
    pub id: Option<Uuid>,
    pub connector_type: Option<ConnectorType>,
    pub status: Option<IntegrationStatus>,
}

impl IntegrationQuery {
    pub fn for_organization(organization_id: impl Into<String>) -> Self {
        Self {
            organization_id: organization_id.into(),
            id: None,
            connector_type: None,
            status: None,
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_connector_type(mut self, connector_type: ConnectorType) -> Self {
        self.connector_type = Some(connector_type);
        self
    }

    pub fn with_status(mut self, status: IntegrationStatus) -> Self {
        self.status = Some(status);
        self
    }
}

/// Values for a brand-new integration row.
#[derive(Debug, Clone)]
pub struct NewIntegration {
    pub id: Uuid,
    pub organization_id: String,
    pub user_id: String,
    pub connector_type: ConnectorType,
    pub status: IntegrationStatus,
    pub account: VendorAccount,
}

/// Repository for integration database operations
#[derive(Debug, Clone)]
pub struct IntegrationRepository {
    /// Database connection pool
    pub db: Arc<DatabaseConnection>,
}

impl IntegrationRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Lists integrations matching `query`, newest first
    pub async fn query(&self, query: &IntegrationQuery) -> RepositoryResult<Vec<integration::Model>> {
        let mut select =
            Integration::find().filter(integration::Column::OrganizationId.eq(query.organization_id.as_str()));
        if let Some(id) = query.id {
            select = select.filter(integration::Column::Id.eq(id));
        }
        if let Some(connector_type) = query.connector_type {
            select = select.filter(integration::Column::ConnectorType.eq(connector_type));
        }
        if let Some(status) = query.status {
            select = select.filter(integration::Column::Status.eq(status));
        }

        Ok(select
            .order_by_desc(integration::Column::CreatedAt)
            .order_by_asc(integration::Column::Id)
            .all(&*self.db)
            .await?)
    }

    /// Finds an integration by id within an organization
    pub async fn find_for_organization(
        &self,
        id: Uuid,
        organization_id: &str,
    ) -> RepositoryResult<Option<integration::Model>> {
        Ok(Integration::find_by_id(id)
            .filter(integration::Column::OrganizationId.eq(organization_id))
            .one(&*self.db)
            .await?)
    }

    /// Retrieves an integration by id without organization scoping
    pub async fn find_by_id(&self, id: Uuid) -> RepositoryResult<Option<integration::Model>> {
        Ok(Integration::find_by_id(id).one(&*self.db).await?)
    }

    /// Finds the integration bound to a vendor installation
    pub async fn find_by_bot_id(
        &self,
        connector_type: ConnectorType,
        bot_id: &str,
    ) -> RepositoryResult<Option<integration::Model>> {
        if bot_id.is_empty() {
            return Ok(None);
        }
        Ok(Integration::find()
            .filter(integration::Column::ConnectorType.eq(connector_type))
            .filter(integration::Column::BotId.eq(bot_id))
            .one(&*self.db)
            .await?)
    }

    /// All active rows for the pair, most recently updated first. More than
    /// one row means the uniqueness index is missing or was bypassed.
    pub async fn find_active(
        &self,
        organization_id: &str,
        connector_type: ConnectorType,
    ) -> RepositoryResult<Vec<integration::Model>> {
        Ok(Integration::find()
            .filter(integration::Column::OrganizationId.eq(organization_id))
            .filter(integration::Column::ConnectorType.eq(connector_type))
            .filter(integration::Column::Status.eq(IntegrationStatus::Active))
            .order_by_desc(integration::Column::UpdatedAt)
            .all(&*self.db)
            .await?)
    }

    /// Inserts the integration and its credential in one transaction
    pub async fn create_with_credential(
        &self,
        new: NewIntegration,
        sealed: SealedCredential,
    ) -> RepositoryResult<integration::Model> {
        let now: sea_orm::prelude::DateTimeWithTimeZone = Utc::now().into();
        let integration_id = new.id;

        let txn = self.db.begin().await?;

        integration::ActiveModel {
            id: Set(new.id),
            organization_id: Set(new.organization_id),
            user_id: Set(new.user_id),
            connector_type: Set(new.connector_type),
            status: Set(new.status),
            bot_id: Set(new.account.bot_id),
            connector_user_id: Set(new.account.connector_user_id),
            connector_organization_id: Set(new.account.connector_organization_id),
            metadata: Set(metadata_to_json(&new.account.metadata)),
            created_at: Set(now),
            updated_at: Set(now),
            last_used_at: Set(None),
        }
        .insert(&txn)
        .await?;

        insert_credential(&txn, integration_id, sealed, now).await?;

        txn.commit().await?;

        // Query the record directly since we already know the id
        self.find_by_id(integration_id)
            .await?
            .ok_or(RepositoryError::NotFound)
    }

    /// Re-points an existing integration at a different vendor account and
    /// replaces its credential, atomically
    pub async fn reassign_with_credential(
        &self,
        id: Uuid,
        user_id: &str,
        account: VendorAccount,
        sealed: SealedCredential,
    ) -> RepositoryResult<integration::Model> {
        let now: sea_orm::prelude::DateTimeWithTimeZone = Utc::now().into();
        let txn = self.db.begin().await?;

        let existing = Integration::find_by_id(id)
            .one(&txn)
            .await?
            .ok_or(RepositoryError::NotFound)?;

        let mut active: integration::ActiveModel = existing.into();
        active.user_id = Set(user_id.to_string());
        active.status = Set(IntegrationStatus::Active);
        active.bot_id = Set(account.bot_id);
        active.connector_user_id = Set(account.connector_user_id);
        active.connector_organization_id = Set(account.connector_organization_id);
        active.metadata = Set(metadata_to_json(&account.metadata));
        active.updated_at = Set(now);
        let updated = active.update(&txn).await?;

        // Resources belonged to the previous installation
        RepositoryResource::delete_many()
            .filter(repository_resource::Column::IntegrationId.eq(id))
            .exec(&txn)
            .await?;
        IntegrationCredential::delete_many()
            .filter(credential::Column::IntegrationId.eq(id))
            .exec(&txn)
            .await?;
        insert_credential(&txn, id, sealed, now).await?;

        txn.commit().await?;
        Ok(updated)
    }

    /// Updates status and bumps `updated_at`
    pub async fn set_status(
        &self,
        id: Uuid,
        status: IntegrationStatus,
    ) -> RepositoryResult<integration::Model> {
        let existing = self.find_by_id(id).await?.ok_or(RepositoryError::NotFound)?;
        let mut active: integration::ActiveModel = existing.into();
        active.status = Set(status);
        active.updated_at = Set(Utc::now().into());
        Ok(active.update(&*self.db).await?)
    }

    /// Stamps `last_used_at`/`updated_at`, optionally replacing metadata
    pub async fn record_sync(
        &self,
        id: Uuid,
        metadata: Option<&BTreeMap<String, String>>,
        at: DateTime<Utc>,
    ) -> RepositoryResult<integration::Model> {
        let existing = self.find_by_id(id).await?.ok_or(RepositoryError::NotFound)?;
        let mut active: integration::ActiveModel = existing.into();
        if let Some(metadata) = metadata {
            active.metadata = Set(metadata_to_json(metadata));
        }
        active.last_used_at = Set(Some(at.into()));
        active.updated_at = Set(at.into());
        Ok(active.update(&*self.db).await?)
    }

    /// Deletes non-active leftovers for the pair (and their children).
    /// Returns the number of integrations removed.
    pub async fn delete_inactive_for(
        &self,
        organization_id: &str,
        connector_type: ConnectorType,
    ) -> RepositoryResult<u64> {
        let txn = self.db.begin().await?;

        let stale: Vec<Uuid> = Integration::find()
            .filter(integration::Column::OrganizationId.eq(organization_id))
            .filter(integration::Column::ConnectorType.eq(connector_type))
            .filter(integration::Column::Status.ne(IntegrationStatus::Active))
            .all(&txn)
            .await?
            .into_iter()
            .map(|row| row.id)
            .collect();

        if stale.is_empty() {
            txn.rollback().await?;
            return Ok(0);
        }

        delete_children(&txn, &stale).await?;
        let result = Integration::delete_many()
            .filter(integration::Column::Id.is_in(stale))
            .exec(&txn)
            .await?;

        txn.commit().await?;
        Ok(result.rows_affected)
    }

    /// Deletes the credential, side-table rows and the integration itself
    pub async fn delete_with_credential(&self, id: Uuid) -> RepositoryResult<()> {
        let txn = self.db.begin().await?;

        delete_children(&txn, &[id]).await?;
        let result = Integration::delete_by_id(id).exec(&txn).await?;
        if result.rows_affected == 0 {
            txn.rollback().await?;
            return Err(RepositoryError::NotFound);
        }

        txn.commit().await?;
        Ok(())
    }
}

async fn delete_children<C: ConnectionTrait>(conn: &C, ids: &[Uuid]) -> RepositoryResult<()> {
    RepositoryResource::delete_many()
        .filter(repository_resource::Column::IntegrationId.is_in(ids.to_vec()))
        .exec(conn)
        .await?;
    IntegrationCredential::delete_many()
        .filter(credential::Column::IntegrationId.is_in(ids.to_vec()))
        .exec(conn)
        .await?;
    Ok(())
}
