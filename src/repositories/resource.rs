//! Repository resource side table
//!
//! Keeps the local copy of which vendor repositories an installation can
//! reach, keyed by `(integration_id, external_resource_id)`.

use chrono::{DateTime, Utc};
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

use super::RepositoryResult;
use crate::connectors::RemoteResource;
use crate::models::repository_resource::{self, Entity as RepositoryResource};

/// Counts of what a reconcile pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub created: u64,
    pub updated: u64,
    pub removed: u64,
}

#[derive(Debug, Clone)]
pub struct ResourceRepository {
    pub db: Arc<DatabaseConnection>,
}

impl ResourceRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Lists resources of an integration ordered by full name
    pub async fn list(&self, integration_id: Uuid) -> RepositoryResult<Vec<repository_resource::Model>> {
        Ok(RepositoryResource::find()
            .filter(repository_resource::Column::IntegrationId.eq(integration_id))
            .order_by_asc(repository_resource::Column::FullName)
            .all(&*self.db)
            .await?)
    }

    /// Upserts `remote` and, with `prune`, deletes local rows absent upstream.
    pub async fn reconcile(
        &self,
        integration_id: Uuid,
        remote: &[RemoteResource],
        prune: bool,
        synced_at: DateTime<Utc>,
    ) -> RepositoryResult<ReconcileSummary> {
        let synced_at: DateTimeWithTimeZone = synced_at.into();
        let txn = self.db.begin().await?;

        let existing: HashMap<i64, repository_resource::Model> = RepositoryResource::find()
            .filter(repository_resource::Column::IntegrationId.eq(integration_id))
            .all(&txn)
            .await?
            .into_iter()
            .map(|row| (row.external_resource_id, row))
            .collect();

        let mut summary = ReconcileSummary::default();
        let mut seen = HashSet::with_capacity(remote.len());

        for resource in remote {
            if !seen.insert(resource.external_id) {
                continue;
            }
            match existing.get(&resource.external_id) {
                Some(row) => {
                    let mut active: repository_resource::ActiveModel = row.clone().into();
                    apply_remote(&mut active, resource, synced_at);
                    active.update(&txn).await?;
                    summary.updated += 1;
                }
                None => {
                    let mut active = repository_resource::ActiveModel {
                        id: Set(Uuid::new_v4()),
                        integration_id: Set(integration_id),
                        external_resource_id: Set(resource.external_id),
                        ..Default::default()
                    };
                    apply_remote(&mut active, resource, synced_at);
                    active.insert(&txn).await?;
                    summary.created += 1;
                }
            }
        }

        if prune {
            let stale: Vec<i64> = existing
                .keys()
                .filter(|id| !seen.contains(*id))
                .copied()
                .collect();
            if !stale.is_empty() {
                let result = RepositoryResource::delete_many()
                    .filter(repository_resource::Column::IntegrationId.eq(integration_id))
                    .filter(repository_resource::Column::ExternalResourceId.is_in(stale))
                    .exec(&txn)
                    .await?;
                summary.removed = result.rows_affected;
            }
        }

        txn.commit().await?;
        Ok(summary)
    }

    /// Bulk-deletes resources unlinked upstream
    pub async fn delete_by_external_ids(
        &self,
        integration_id: Uuid,
        external_ids: &[i64],
    ) -> RepositoryResult<u64> {
        if external_ids.is_empty() {
            return Ok(0);
        }
        let result = RepositoryResource::delete_many()
            .filter(repository_resource::Column::IntegrationId.eq(integration_id))
            .filter(repository_resource::Column::ExternalResourceId.is_in(external_ids.to_vec()))
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected)
    }
}

fn apply_remote(
    active: &mut repository_resource::ActiveModel,
    resource: &RemoteResource,
    synced_at: DateTimeWithTimeZone,
) {
    active.name = Set(resource.name.clone());
    active.full_name = Set(resource.full_name.clone());
    active.url = Set(resource.url.clone());
    active.is_private = Set(resource.is_private);
    active.default_branch = Set(resource.default_branch.clone());
    active.can_admin = Set(resource.can_admin);
    active.can_push = Set(resource.can_push);
    active.can_pull = Set(resource.can_pull);
    active.metadata = Set(resource.metadata.clone());
    active.last_synced_at = Set(synced_at);
    active.remote_created_at = Set(resource.created_at.map(Into::into));
    active.remote_updated_at = Set(resource.updated_at.map(Into::into));
    active.remote_pushed_at = Set(resource.pushed_at.map(Into::into));
}
