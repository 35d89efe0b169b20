//! Migration to create the integration_credentials table.
//!
//! Holds the encrypted secret material for an integration (1:1).

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(IntegrationCredentials::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(IntegrationCredentials::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(IntegrationCredentials::IntegrationId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(IntegrationCredentials::CredentialType)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(IntegrationCredentials::CredentialDataEncrypted)
                            .binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(IntegrationCredentials::ExpiresAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(IntegrationCredentials::EncryptionKeyId)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(IntegrationCredentials::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(IntegrationCredentials::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_integration_credentials_integration_id")
                            .from(
                                IntegrationCredentials::Table,
                                IntegrationCredentials::IntegrationId,
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
                    .name("idx_integration_credentials_integration_id")
                    .table(IntegrationCredentials::Table)
                    .col(IntegrationCredentials::IntegrationId)
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
                    .name("idx_integration_credentials_integration_id")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(
                Table::drop()
                    .table(IntegrationCredentials::Table)
                    .to_owned(),
            )
            .await
    }
}

#[derive(DeriveIden)]
enum IntegrationCredentials {
    Table,
    Id,
    IntegrationId,
    CredentialType,
    CredentialDataEncrypted,
    ExpiresAt,
    EncryptionKeyId,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Integrations {
    Table,
    Id,
}
