//! # Data Models
//!
//! SeaORM entities for integrations, their credentials and connector side
//! tables, plus the enums shared by the service and the connectors.

pub mod credential;
pub mod integration;
pub mod repository_resource;

pub use credential::{CredentialData, CredentialType, Entity as IntegrationCredential};
pub use integration::{ConnectorType, Entity as Integration, IntegrationStatus};
pub use repository_resource::Entity as RepositoryResource;
