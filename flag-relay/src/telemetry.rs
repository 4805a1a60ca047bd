//! Logging and metrics setup for the process.

use crate::config::CommonConfig;
use metrics_exporter_statsd::{StatsdBuilder, StatsdError};
use shared::metrics_defs::{MetricDef, describe_all};
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const METRICS_PREFIX: &str = "flag_relay";

#[derive(thiserror::Error, Debug)]
pub enum TelemetryError {
    #[error("invalid sentry dsn: {0}")]
    SentryDsn(#[from] sentry::types::ParseDsnError),
    #[error("could not install tracing subscriber: {0}")]
    Subscriber(#[from] TryInitError),
    #[error("could not create statsd recorder: {0}")]
    Statsd(#[from] StatsdError),
    #[error("a metrics recorder is already installed")]
    RecorderInstalled,
}

/// Keeps the sentry client alive. Dropping it flushes pending events.
pub struct TelemetryGuard {
    _sentry: Option<sentry::ClientInitGuard>,
}

pub fn init(
    config: &CommonConfig,
    metric_defs: &[MetricDef],
) -> Result<TelemetryGuard, TelemetryError> {
    let sentry_guard = match &config.logging {
        Some(logging) => {
            let dsn: sentry::types::Dsn = logging.sentry_dsn.parse()?;
            Some(sentry::init(sentry::ClientOptions {
                dsn: Some(dsn),
                release: sentry::release_name!(),
                ..Default::default()
            }))
        }
        None => None,
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_guard.is_some().then(|| sentry::integrations::tracing::layer()))
        .try_init()?;

    if let Some(metrics_config) = &config.metrics {
        let recorder = StatsdBuilder::from(
            metrics_config.statsd_host.as_str(),
            metrics_config.statsd_port,
        )
        .build(Some(METRICS_PREFIX))?;
        metrics::set_global_recorder(recorder).map_err(|_| TelemetryError::RecorderInstalled)?;
        describe_all(metric_defs);

        tracing::info!(
            host = %metrics_config.statsd_host,
            port = metrics_config.statsd_port,
            "Reporting metrics to statsd"
        );
    }

    Ok(TelemetryGuard {
        _sentry: sentry_guard,
    })
}
