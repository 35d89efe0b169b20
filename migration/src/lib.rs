//! Database migrations for the integrations service.
//!
//! Creates the integration, credential and repository resource tables.

pub use sea_orm_migration::prelude::*;

mod m2025_12_01_100000_create_integrations;
mod m2025_12_01_100100_create_integration_credentials;
mod m2025_12_01_100200_create_repository_resources;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_12_01_100000_create_integrations::Migration),
            Box::new(m2025_12_01_100100_create_integration_credentials::Migration),
            Box::new(m2025_12_01_100200_create_repository_resources::Migration),
        ]
    }
}
