//! # Subscription Supervisor
//!
//! Runs each connector's `subscribe` loop as its own task and restarts it
//! with capped exponential backoff when it fails, exits early or panics.
//! Per-connector state is kept in a shared map so operators can see a
//! crashed subscription through the health endpoint.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::counter;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use utoipa::ToSchema;

use crate::config::SubscriptionConfig;
use crate::connectors::{Connector, ConnectorError, EventHandler};
use crate::models::ConnectorType;

/// Lifecycle of one supervised subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Running,
    Restarting,
    Stopped,
    /// Gave up after a failure that restarting cannot fix
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct SubscriptionStatus {
    pub state: SubscriptionState,
    pub restarts: u64,
    pub last_error: Option<String>,
    #[schema(value_type = String, format = DateTime)]
    pub since: DateTime<Utc>,
}

impl SubscriptionStatus {
    fn new(state: SubscriptionState) -> Self {
        Self {
            state,
            restarts: 0,
            last_error: None,
            since: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RestartPolicy {
    pub fn from_config(config: &SubscriptionConfig) -> Self {
        Self {
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Delay before restart number `attempt` (zero based). Doubles per
    /// attempt up to `max_backoff`, minus up to 10% jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponential = self
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt.min(20)));
        let capped = exponential.min(self.max_backoff);
        let jitter_ceiling = capped.as_millis() as u64 / 10;
        if jitter_ceiling == 0 {
            return capped;
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_ceiling);
        capped.saturating_sub(Duration::from_millis(jitter))
    }
}

type StatusMap = Arc<RwLock<BTreeMap<ConnectorType, SubscriptionStatus>>>;

pub struct SubscriptionSupervisor {
    statuses: StatusMap,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl SubscriptionSupervisor {
    /// Spawn one supervised task per connector and return immediately.
    pub fn start(
        connectors: Vec<Arc<dyn Connector>>,
        handler: Arc<dyn EventHandler>,
        shutdown: CancellationToken,
        policy: RestartPolicy,
    ) -> Self {
        let initial = connectors
            .iter()
            .map(|connector| {
                (
                    connector.connector_type(),
                    SubscriptionStatus::new(SubscriptionState::Running),
                )
            })
            .collect();
        let statuses: StatusMap = Arc::new(RwLock::new(initial));

        let tasks = connectors
            .into_iter()
            .map(|connector| {
                tokio::spawn(supervise(
                    connector,
                    handler.clone(),
                    shutdown.clone(),
                    policy,
                    statuses.clone(),
                ))
            })
            .collect();

        Self {
            statuses,
            tasks: Mutex::new(tasks),
            shutdown,
        }
    }

    pub async fn snapshot(&self) -> BTreeMap<ConnectorType, SubscriptionStatus> {
        self.statuses.read().await.clone()
    }

    /// Cancel every subscription and wait for the tasks to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(error) = task.await {
                warn!(%error, "Subscription task did not exit cleanly");
            }
        }
    }
}

async fn supervise(
    connector: Arc<dyn Connector>,
    handler: Arc<dyn EventHandler>,
    shutdown: CancellationToken,
    policy: RestartPolicy,
    statuses: StatusMap,
) {
    let connector_type = connector.connector_type();
    let mut attempt: u32 = 0;

    loop {
        info!(connector_type = %connector_type, "Starting subscription");
        let started = Instant::now();
        let run = {
            let connector = connector.clone();
            let handler = handler.clone();
            let token = shutdown.child_token();
            tokio::spawn(async move { connector.subscribe(token, handler).await })
        };

        let failure = match run.await {
            _ if shutdown.is_cancelled() => None,
            Ok(Ok(())) => Some("subscription exited before shutdown".to_string()),
            Ok(Err(ConnectorError::ConfigurationError { details })) => {
                error!(connector_type = %connector_type, %details, "Subscription misconfigured; not restarting");
                update(&statuses, connector_type, |status| {
                    status.state = SubscriptionState::Failed;
                    status.last_error = Some(details);
                })
                .await;
                return;
            }
            Ok(Err(error)) => Some(error.to_string()),
            Err(join_error) => Some(format!("subscription task panicked: {}", join_error)),
        };

        let Some(failure) = failure else {
            info!(connector_type = %connector_type, "Subscription stopped");
            update(&statuses, connector_type, |status| {
                status.state = SubscriptionState::Stopped;
            })
            .await;
            return;
        };

        // A loop that ran for a while earns a fresh backoff sequence.
        if started.elapsed() > policy.max_backoff {
            attempt = 0;
        }
        let delay = policy.backoff(attempt);
        attempt = attempt.saturating_add(1);

        counter!("subscription_restarts_total", "connector" => connector_type.as_str())
            .increment(1);
        error!(
            connector_type = %connector_type,
            error = %failure,
            delay_ms = delay.as_millis() as u64,
            "Subscription failed; restarting"
        );
        update(&statuses, connector_type, |status| {
            status.state = SubscriptionState::Restarting;
            status.restarts += 1;
            status.last_error = Some(failure);
        })
        .await;

        tokio::select! {
            _ = shutdown.cancelled() => {
                update(&statuses, connector_type, |status| {
                    status.state = SubscriptionState::Stopped;
                })
                .await;
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        update(&statuses, connector_type, |status| {
            status.state = SubscriptionState::Running;
        })
        .await;
    }
}

async fn update<F>(statuses: &StatusMap, connector_type: ConnectorType, apply: F)
where
    F: FnOnce(&mut SubscriptionStatus),
{
    let mut statuses = statuses.write().await;
    let status = statuses
        .entry(connector_type)
        .or_insert_with(|| SubscriptionStatus::new(SubscriptionState::Running));
    apply(status);
    status.since = Utc::now();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::{
        Authorization, AuthorizationData, AuthorizationIntent, AuthorizationKind,
        AuthorizeParams, Credentials, InboundEvent,
    };
    use crate::error::IntegrationError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails its first `failures` subscriptions, then runs until cancelled.
    struct Flaky {
        failures: u32,
        attempts: AtomicU32,
        error: ConnectorError,
    }

    #[async_trait]
    impl Connector for Flaky {
        fn connector_type(&self) -> ConnectorType {
            ConnectorType::Slack
        }

        fn authorization_kind(&self) -> AuthorizationKind {
            AuthorizationKind::Oauth2
        }

        async fn initiate_authorization(
            &self,
            _params: AuthorizeParams,
        ) -> Result<AuthorizationIntent, ConnectorError> {
            Err(ConnectorError::Unsupported { operation: "initiate_authorization" })
        }

        async fn complete_authorization(
            &self,
            _data: AuthorizationData,
        ) -> Result<Authorization, ConnectorError> {
            Err(ConnectorError::Unsupported { operation: "complete_authorization" })
        }

        async fn validate_credentials(&self, _credentials: &Credentials) -> Result<(), ConnectorError> {
            Ok(())
        }

        async fn subscribe(
            &self,
            shutdown: CancellationToken,
            _handler: Arc<dyn EventHandler>,
        ) -> Result<(), ConnectorError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                return Err(self.error.clone());
            }
            shutdown.cancelled().await;
            Ok(())
        }
    }

    struct Ignore;

    #[async_trait]
    impl EventHandler for Ignore {
        async fn handle_event(&self, _event: InboundEvent) -> Result<(), IntegrationError> {
            Ok(())
        }
    }

    fn policy() -> RestartPolicy {
        RestartPolicy {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        }
    }

    async fn wait_for_state(
        supervisor: &SubscriptionSupervisor,
        state: SubscriptionState,
    ) -> SubscriptionStatus {
        for _ in 0..200 {
            if let Some(status) = supervisor.snapshot().await.get(&ConnectorType::Slack)
                && status.state == state
            {
                return status.clone();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("subscription never reached {state:?}");
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RestartPolicy {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1_000),
        };
        let first = policy.backoff(0);
        assert!(first <= Duration::from_millis(100) && first >= Duration::from_millis(90));
        let third = policy.backoff(2);
        assert!(third <= Duration::from_millis(400) && third >= Duration::from_millis(360));
        assert!(policy.backoff(30) <= Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn failed_subscription_is_restarted() {
        let connector = Arc::new(Flaky {
            failures: 2,
            attempts: AtomicU32::new(0),
            error: ConnectorError::NetworkError {
                details: "socket closed".into(),
                retryable: true,
            },
        });
        let shutdown = CancellationToken::new();
        let supervisor = SubscriptionSupervisor::start(
            vec![connector.clone() as Arc<dyn Connector>],
            Arc::new(Ignore),
            shutdown.clone(),
            policy(),
        );

        // Wait until the third attempt is live.
        for _ in 0..200 {
            if connector.attempts.load(Ordering::SeqCst) >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let status = wait_for_state(&supervisor, SubscriptionState::Running).await;
        assert_eq!(status.restarts, 2);
        assert!(status.last_error.unwrap().contains("socket closed"));

        supervisor.shutdown().await;
        let status = wait_for_state(&supervisor, SubscriptionState::Stopped).await;
        assert_eq!(status.restarts, 2);
    }

    #[tokio::test]
    async fn configuration_errors_are_not_retried() {
        let connector = Arc::new(Flaky {
            failures: u32::MAX,
            attempts: AtomicU32::new(0),
            error: ConnectorError::configuration("signing secret missing"),
        });
        let supervisor = SubscriptionSupervisor::start(
            vec![connector.clone() as Arc<dyn Connector>],
            Arc::new(Ignore),
            CancellationToken::new(),
            policy(),
        );

        let status = wait_for_state(&supervisor, SubscriptionState::Failed).await;
        assert_eq!(status.restarts, 0);
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
        supervisor.shutdown().await;
    }
}
