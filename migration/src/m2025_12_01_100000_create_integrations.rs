//! Migration to create the integrations table.
//!
//! One row per organization connection to a connector. The "one active
//! integration per (organization, connector type)" rule and the "one row per
//! vendor installation" rule are enforced by partial unique indexes so that
//! historical inactive rows may coexist with the live one.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Integrations::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Integrations::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Integrations::OrganizationId)
                            .text()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Integrations::UserId).text().not_null())
                    .col(
                        ColumnDef::new(Integrations::ConnectorType)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Integrations::Status)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(Integrations::BotId)
                            .text()
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(Integrations::ConnectorUserId)
                            .text()
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(Integrations::ConnectorOrganizationId)
                            .text()
                            .not_null()
                            .default(""),
                    )
                    .col(ColumnDef::new(Integrations::Metadata).json_binary().null())
                    .col(
                        ColumnDef::new(Integrations::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Integrations::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Integrations::LastUsedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_integrations_organization_id")
                    .table(Integrations::Table)
                    .col(Integrations::OrganizationId)
                    .to_owned(),
            )
            .await?;

        // Partial indexes are not expressible through the index builder; the
        // statements below are valid for both Postgres and SQLite.
        let db = manager.get_connection();
        db.execute_unprepared(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_integrations_active_org_connector \
             ON integrations (organization_id, connector_type) WHERE status = 'active'",
        )
        .await?;
        db.execute_unprepared(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_integrations_connector_bot \
             ON integrations (connector_type, bot_id) WHERE bot_id <> ''",
        )
        .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        for name in [
            "idx_integrations_connector_bot",
            "idx_integrations_active_org_connector",
            "idx_integrations_organization_id",
        ] {
            manager
                .drop_index(Index::drop().name(name).to_owned())
                .await?;
        }

        manager
            .drop_table(Table::drop().table(Integrations::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Integrations {
    Table,
    Id,
    OrganizationId,
    UserId,
    ConnectorType,
    Status,
    BotId,
    ConnectorUserId,
    ConnectorOrganizationId,
    Metadata,
    CreatedAt,
    UpdatedAt,
    LastUsedAt,
}
