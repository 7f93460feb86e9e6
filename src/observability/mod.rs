// src/observability/mod.rs
//! Logging, metrics and performance counters

pub mod counters;

pub use counters::{MetricsCounters, NoopCounters, PerfCounters};

use crate::utils::config::ObservabilityConfig;
use crate::utils::errors::{Result, RuntimeError};
use std::sync::Once;
use tracing_subscriber::EnvFilter;

static INIT_TRACING: Once = Once::new();

/// Install the global tracing subscriber
///
/// `RUST_LOG` overrides the configured level. Calling this more than once is
/// harmless.
pub fn init_tracing(config: &ObservabilityConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log_level)
            .map_err(|e| RuntimeError::Observability(e.to_string()))?,
    };
    let json = config.json_logs;

    INIT_TRACING.call_once(move || {
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_thread_names(true);
        // A subscriber may already be installed by a test harness
        let _ = if json {
            builder.json().try_init()
        } else {
            builder.try_init()
        };
    });
    Ok(())
}

/// Install the Prometheus recorder behind the `metrics` facade
///
/// Returns the handle used to render the scrape output, or `None` when
/// metrics are disabled.
pub fn init_metrics(
    config: &ObservabilityConfig,
) -> Result<Option<metrics_exporter_prometheus::PrometheusHandle>> {
    if !config.metrics {
        return Ok(None);
    }
    let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| RuntimeError::Observability(e.to_string()))?;
    counters::describe_metrics();
    Ok(Some(handle))
}
