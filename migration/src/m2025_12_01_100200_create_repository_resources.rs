//! Migration to create the repository_resources table.
//!
//! Connector side table tracking per-repository permissions for source
//! control integrations.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(RepositoryResources::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(RepositoryResources::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(RepositoryResources::IntegrationId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RepositoryResources::ExternalResourceId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(RepositoryResources::Name).text().not_null())
                    .col(
                        ColumnDef::new(RepositoryResources::FullName)
                            .text()
                            .not_null(),
                    )
                    .col(ColumnDef::new(RepositoryResources::Url).text().not_null())
                    .col(
                        ColumnDef::new(RepositoryResources::IsPrivate)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(RepositoryResources::DefaultBranch)
                            .text()
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(RepositoryResources::CanAdmin)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(RepositoryResources::CanPush)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(RepositoryResources::CanPull)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(RepositoryResources::Metadata)
                            .json_binary()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(RepositoryResources::LastSyncedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(RepositoryResources::RemoteCreatedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(RepositoryResources::RemoteUpdatedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(RepositoryResources::RemotePushedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_repository_resources_integration_id")
                            .from(
                                RepositoryResources::Table,
                                RepositoryResources::IntegrationId,
                            )
                            .to(Integrations::Table, Integrations::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_repository_resources_integration_external")
                    .table(RepositoryResources::Table)
                    .col(RepositoryResources::IntegrationId)
                    .col(RepositoryResources::ExternalResourceId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_repository_resources_integration_external")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(RepositoryResources::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum RepositoryResources {
    Table,
    Id,
    IntegrationId,
    ExternalResourceId,
    Name,
    FullName,
    Url,
    IsPrivate,
    DefaultBranch,
    CanAdmin,
    CanPush,
    CanPull,
    Metadata,
    LastSyncedAt,
    RemoteCreatedAt,
    RemoteUpdatedAt,
    RemotePushedAt,
}

#[derive(DeriveIden)]
enum Integrations {
    Table,
    Id,
}
