//! Event fan-out
//!
//! Once the service has applied an inbound event's actions, the event is
//! published to an [`EventSink`] so downstream consumers can react to it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::connectors::InboundEvent;
use crate::models::ConnectorType;

const DEFAULT_SINK_CAPACITY: usize = 1024;

/// An inbound vendor event after local state changes were applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchedEvent {
    pub connector_type: ConnectorType,
    pub event_type: String,
    pub delivery_id: Option<String>,
    /// Integration the event resolved to, if any
    pub integration_id: Option<Uuid>,
    pub organization_id: Option<String>,
    pub payload: JsonValue,
    pub received_at: DateTime<Utc>,
    pub actions_applied: usize,
}

impl DispatchedEvent {
    pub fn from_inbound(event: InboundEvent) -> Self {
        Self {
            connector_type: event.connector_type,
            event_type: event.event_type,
            delivery_id: event.delivery_id,
            integration_id: None,
            organization_id: None,
            payload: event.payload,
            received_at: event.received_at,
            actions_applied: 0,
        }
    }
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: DispatchedEvent);
}

/// In-process sink backed by a broadcast channel. Publishing with no
/// subscribers drops the event.
#[derive(Clone)]
pub struct BroadcastEventSink {
    sender: broadcast::Sender<DispatchedEvent>,
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new(DEFAULT_SINK_CAPACITY)
    }
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatchedEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl EventSink for BroadcastEventSink {
    async fn publish(&self, event: DispatchedEvent) {
        let event_type = event.event_type.clone();
        if self.sender.send(event).is_err() {
            debug!(event_type = %event_type, "No event subscribers; dropping event");
        }
    }
}
