//! # Integrations Library
//!
//! Connects organizations to third-party vendors (GitHub, Slack, Datadog,
//! Google Cloud): authorization flows, encrypted credential storage,
//! installation reconciliation, resource sync and inbound vendor events.

pub mod cache;
pub mod config;
pub mod connectors;
pub mod credential_refresh;
pub mod crypto;
pub mod db;
pub mod error;
pub mod events;
pub mod models;
pub mod repositories;
pub mod server;
pub mod service;
pub mod state;
pub mod supervisor;
pub mod telemetry;
pub mod webhook_verification;
pub use migration;
