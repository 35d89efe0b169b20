//! Connectors module
//!
//! This module provides the connector layer including:
//! - The `Connector` trait every vendor implementation follows
//! - Connector metadata and the registry resolving a type to its implementation
//! - The webhook inbox feeding webhook-driven subscriptions
//! - Individual vendor implementations

pub mod datadog;
pub mod gcp;
pub mod github;
pub mod http;
pub mod inbox;
pub mod metadata;
pub mod registry;
pub mod slack;
pub mod trait_;

pub use metadata::ConnectorMetadata;
pub use registry::{Registry, RegistryError};
pub use trait_::{
    Authorization, AuthorizationData, AuthorizationIntent, AuthorizationKind, AuthorizeParams,
    Connector, ConnectorError, Credentials, EventAction, EventHandler, InboundEvent,
    RemoteResource, SyncOutcome, SyncParams, SyncRequest, VendorAccount, WebhookDelivery,
};

pub use datadog::DatadogConnector;
pub use gcp::GcpConnector;
pub use github::GitHubConnector;
pub use inbox::WebhookInbox;
pub use slack::SlackConnector;
