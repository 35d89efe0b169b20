//! Tracing setup and request correlation.
//!
//! [`init_tracing`] installs the process-wide subscriber. Requests entering
//! the router run inside [`scope_request`], which opens a `request` span
//! carrying the caller's `x-request-id` and keeps the id reachable for error
//! bodies through [`current_request_id`].

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tokio::task_local;
use tracing::Instrument;
use tracing::subscriber::SetGlobalDefaultError;
use tracing_log::{AsLog, LogTracer};
use tracing_subscriber::filter::{EnvFilter, ParseError};
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};

use crate::config::AppConfig;

task_local! {
    static REQUEST_ID: String;
}

#[derive(Debug, Error)]
pub enum TelemetryInitError {
    #[error("invalid log filter {filter:?}: {source}")]
    Filter {
        filter: String,
        #[source]
        source: ParseError,
    },
    #[error("a global tracing subscriber is already installed: {0}")]
    Subscriber(#[from] SetGlobalDefaultError),
    #[error("a `log` logger is already installed: {0}")]
    LogBridge(#[from] log::SetLoggerError),
}

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Install the global subscriber. Calls after the first successful one are
/// no-ops.
///
/// `RUST_LOG` overrides the configured level. Output is JSON unless
/// `log_format` is `pretty`.
pub fn init_tracing(config: &AppConfig) -> Result<(), TelemetryInitError> {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }
    install(config).inspect_err(|_| INSTALLED.store(false, Ordering::SeqCst))
}

fn install(config: &AppConfig) -> Result<(), TelemetryInitError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log_level).map_err(|source| {
            TelemetryInitError::Filter {
                filter: config.log_level.clone(),
                source,
            }
        })?,
    };
    // sea-orm and sqlx still emit through `log`; forward no more than the
    // filter can let through.
    let log_level = filter
        .max_level_hint()
        .map(|level| level.as_log())
        .unwrap_or(log::LevelFilter::Trace);

    let output = if config.log_format == "pretty" {
        fmt::layer().pretty().boxed()
    } else {
        fmt::layer().json().with_current_span(true).boxed()
    };

    tracing::subscriber::set_global_default(
        tracing_subscriber::registry().with(filter).with(output),
    )?;
    LogTracer::builder().with_max_level(log_level).init()?;
    Ok(())
}

/// Run `future` as part of the request identified by `request_id`.
pub async fn scope_request<F>(request_id: String, future: F) -> F::Output
where
    F: Future,
{
    let span = tracing::info_span!("request", request_id = %request_id);
    REQUEST_ID.scope(request_id, future.instrument(span)).await
}

/// The id of the request the current task is serving, if any.
pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(Clone::clone).ok()
}
