//! # Credential Refresh Service
//!
//! Background task that periodically finds credentials nearing expiry and
//! renews them through their connector. Credentials a vendor rejects outright
//! deactivate their integration so the organization can reconnect.

use std::sync::Arc;

use chrono::{Duration, Utc};
use metrics::{counter, histogram};
use rand::Rng;
use tokio::sync::Semaphore;
use tokio::time::{Duration as TokioDuration, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::CredentialRefreshConfig;
use crate::connectors::ConnectorError;
use crate::error::IntegrationError;
use crate::service::IntegrationService;

/// Classification of refresh errors for appropriate handling
#[derive(Debug, PartialEq, Eq)]
pub enum RefreshErrorClassification {
    /// Vendor rejected the credentials; retrying cannot help
    Permanent,
    Transient,
    RateLimited,
}

pub fn classify_refresh_error(error: &IntegrationError) -> RefreshErrorClassification {
    match error {
        IntegrationError::VendorApi { source, .. } => match source {
            ConnectorError::AuthenticationError { .. } => RefreshErrorClassification::Permanent,
            ConnectorError::RateLimitError { .. } => RefreshErrorClassification::RateLimited,
            _ => RefreshErrorClassification::Transient,
        },
        IntegrationError::CredentialCorrupted(_) => RefreshErrorClassification::Permanent,
        _ => RefreshErrorClassification::Transient,
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RefreshStats {
    pub due: u64,
    pub refreshed: u64,
    pub unchanged: u64,
    pub failed: u64,
    pub deactivated: u64,
}

enum RefreshOutcome {
    Refreshed,
    Unchanged,
    Failed,
    Deactivated,
}

#[derive(Clone)]
pub struct CredentialRefresher {
    config: CredentialRefreshConfig,
    service: IntegrationService,
}

impl CredentialRefresher {
    pub fn new(config: CredentialRefreshConfig, service: IntegrationService) -> Self {
        Self { config, service }
    }

    /// Run the refresh loop until the provided shutdown token fires
    #[instrument(skip_all)]
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("Starting credential refresh service");
        let tick_interval = TokioDuration::from_secs(self.config.tick_seconds);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Credential refresh service shutdown requested");
                    break;
                }
                _ = sleep(tick_interval) => {
                    let tick_started = std::time::Instant::now();
                    if let Err(err) = self.tick().await {
                        error!(error = %err, "Credential refresh tick failed");
                    }
                    histogram!("credential_refresh_tick_duration_ms")
                        .record(tick_started.elapsed().as_secs_f64() * 1_000.0);
                }
            }
        }

        info!("Credential refresh service stopped");
    }

    /// Execute one pass over every credential expiring within the lead time
    #[instrument(skip_all)]
    pub async fn tick(&self) -> Result<RefreshStats, IntegrationError> {
        let cutoff = Utc::now() + Duration::seconds(self.config.lead_time_seconds as i64);
        let due = self.service.due_for_refresh(cutoff).await?;
        let mut stats = RefreshStats {
            due: due.len() as u64,
            ..Default::default()
        };
        if due.is_empty() {
            return Ok(stats);
        }

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1) as usize));
        let mut handles = Vec::with_capacity(due.len());
        for integration_id in due {
            let semaphore = semaphore.clone();
            let refresher = self.clone();
            handles.push(tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return RefreshOutcome::Failed;
                };
                refresher.refresh_with_jitter(integration_id).await
            }));
        }

        for handle in handles {
            match handle.await {
                Ok(RefreshOutcome::Refreshed) => stats.refreshed += 1,
                Ok(RefreshOutcome::Unchanged) => stats.unchanged += 1,
                Ok(RefreshOutcome::Failed) => stats.failed += 1,
                Ok(RefreshOutcome::Deactivated) => {
                    stats.failed += 1;
                    stats.deactivated += 1;
                }
                Err(e) => {
                    stats.failed += 1;
                    error!(error = ?e, "Refresh task panicked or was cancelled");
                }
            }
        }

        counter!("credential_refresh_success_total").increment(stats.refreshed);
        counter!("credential_refresh_failure_total").increment(stats.failed);
        debug!(
            due = stats.due,
            refreshed = stats.refreshed,
            unchanged = stats.unchanged,
            failed = stats.failed,
            deactivated = stats.deactivated,
            "Credential refresh tick completed"
        );
        Ok(stats)
    }

    async fn refresh_with_jitter(&self, integration_id: Uuid) -> RefreshOutcome {
        let jitter_seconds = self.compute_jitter();
        if jitter_seconds > 0 {
            debug!(integration_id = %integration_id, jitter_seconds, "Applying jitter before refresh");
            sleep(TokioDuration::from_secs(jitter_seconds)).await;
        }
        self.refresh_one(integration_id).await
    }

    #[instrument(skip(self))]
    async fn refresh_one(&self, integration_id: Uuid) -> RefreshOutcome {
        let started = std::time::Instant::now();
        let result = self.service.refresh_credentials_for(integration_id).await;
        histogram!("credential_refresh_latency_ms").record(started.elapsed().as_secs_f64() * 1_000.0);

        let error = match result {
            Ok(true) => {
                info!(integration_id = %integration_id, "Credentials refreshed");
                return RefreshOutcome::Refreshed;
            }
            Ok(false) => return RefreshOutcome::Unchanged,
            Err(error) => error,
        };

        match classify_refresh_error(&error) {
            RefreshErrorClassification::Permanent => {
                error!(integration_id = %integration_id, %error, "Credentials rejected; deactivating integration");
                counter!("credential_refresh_permanent_failure_total").increment(1);
                match self.service.deactivate(integration_id).await {
                    Ok(_) => RefreshOutcome::Deactivated,
                    Err(err) => {
                        error!(integration_id = %integration_id, error = %err, "Failed to deactivate integration");
                        RefreshOutcome::Failed
                    }
                }
            }
            RefreshErrorClassification::RateLimited => {
                warn!(integration_id = %integration_id, %error, "Rate limited during refresh");
                counter!("credential_refresh_rate_limited_total").increment(1);
                RefreshOutcome::Failed
            }
            RefreshErrorClassification::Transient => {
                warn!(integration_id = %integration_id, %error, "Transient refresh failure; will retry");
                counter!("credential_refresh_transient_failure_total").increment(1);
                RefreshOutcome::Failed
            }
        }
    }

    fn compute_jitter(&self) -> u64 {
        if self.config.jitter_factor <= 0.0 {
            return 0;
        }
        let max_delay_seconds =
            (self.config.tick_seconds as f64 * self.config.jitter_factor) as u64;
        rand::thread_rng().gen_range(0..=max_delay_seconds)
    }
}
