//! Webhook inbox
//!
//! Bounded queue between the HTTP webhook receiver and a connector's
//! subscription loop. The receiving half sits behind an async mutex so a
//! restarted subscription picks up where the failed one stopped.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::trait_::{ConnectorError, EventHandler, InboundEvent};
use crate::models::ConnectorType;
use crate::webhook_verification::VerificationError;

pub const DEFAULT_INBOX_CAPACITY: usize = 256;

pub struct WebhookInbox {
    sender: mpsc::Sender<InboundEvent>,
    receiver: Arc<Mutex<mpsc::Receiver<InboundEvent>>>,
}

impl Default for WebhookInbox {
    fn default() -> Self {
        Self::new(DEFAULT_INBOX_CAPACITY)
    }
}

impl WebhookInbox {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }

    /// Queue a verified event without waiting; a full inbox rejects the
    /// delivery so the vendor retries it later.
    pub fn push(&self, event: InboundEvent) -> Result<(), VerificationError> {
        let connector = event.connector_type.to_string();
        self.sender.try_send(event).map_err(|error| {
            warn!(connector = %connector, %error, "Webhook inbox rejected delivery");
            VerificationError::Unavailable { connector }
        })
    }

    /// Deliver queued events to `handler` until `shutdown` fires. Handler
    /// failures are logged and do not stop the loop.
    pub async fn drain(
        &self,
        connector_type: ConnectorType,
        shutdown: CancellationToken,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), ConnectorError> {
        let mut receiver = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            guard = self.receiver.lock() => guard,
        };

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                event = receiver.recv() => event,
            };

            let Some(event) = event else {
                return Err(ConnectorError::NetworkError {
                    details: format!("{} webhook inbox closed", connector_type),
                    retryable: false,
                });
            };

            debug!(
                connector_type = %connector_type,
                event_type = %event.event_type,
                "Dispatching inbound event"
            );
            if let Err(error) = handler.handle_event(event).await {
                warn!(connector_type = %connector_type, %error, "Event handling failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IntegrationError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    struct Collect(tokio::sync::mpsc::UnboundedSender<String>);

    #[async_trait]
    impl EventHandler for Collect {
        async fn handle_event(&self, event: InboundEvent) -> Result<(), IntegrationError> {
            let _ = self.0.send(event.event_type);
            Ok(())
        }
    }

    #[tokio::test]
    async fn drains_until_cancelled() {
        let inbox = Arc::new(WebhookInbox::new(8));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let task = {
            let inbox = inbox.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                inbox
                    .drain(ConnectorType::Github, shutdown, Arc::new(Collect(tx)))
                    .await
            })
        };

        inbox
            .push(InboundEvent::new(ConnectorType::Github, "installation", json!({})))
            .unwrap();
        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(received.as_deref(), Some("installation"));

        shutdown.cancel();
        assert!(task.await.unwrap().is_ok());
    }

    #[test]
    fn full_inbox_rejects_delivery() {
        let inbox = WebhookInbox::new(1);
        let event = InboundEvent::new(ConnectorType::Slack, "event_callback", json!({}));
        inbox.push(event.clone()).unwrap();
        assert!(matches!(
            inbox.push(event),
            Err(VerificationError::Unavailable { .. })
        ));
    }
}
