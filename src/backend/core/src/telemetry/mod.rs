//! Telemetry: logging, tracing and metrics.
//!
//! - **Logging**: structured JSON/pretty logging with per-module filters
//! - **Tracing**: OpenTelemetry OTLP export when an endpoint is configured
//! - **Metrics**: Prometheus counters, gauges and histograms for jobs
//!
//! # Example
//!
//! ```rust,no_run
//! use taskline_core::telemetry::{TelemetryConfig, init_telemetry};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let handle = init_telemetry(&TelemetryConfig::default())?;
//! // ...
//! handle.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod logging;
pub mod metrics;
pub mod tracing;

pub use context::{RequestContext, SerializedRequestContext};
pub use logging::{init_logging, LogFormat, LoggingConfig};
pub use metrics::{init_metrics, JobMetrics, MetricsConfig, MetricsRegistry, WorkerMetrics};
pub use tracing::{init_tracing, current_trace_id, shutdown_tracing, TracingConfig};

use serde::Deserialize;

/// Unified telemetry configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// Service name for identification in traces and metrics
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Environment (development, staging, production)
    #[serde(default = "default_environment")]
    pub environment: String,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub tracing: TracingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            environment: default_environment(),
            logging: LoggingConfig::default(),
            tracing: TracingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

fn default_service_name() -> String {
    "taskline-worker".to_string()
}

fn default_environment() -> String {
    std::env::var("TASKLINE_ENVIRONMENT").unwrap_or_else(|_| "development".to_string())
}

/// Initialize the complete telemetry stack.
///
/// Call once at process startup, from inside the Tokio runtime.
pub fn init_telemetry(config: &TelemetryConfig) -> anyhow::Result<TelemetryHandle> {
    let tracer = init_tracing(&config.tracing, &config.service_name)?;
    let exporting = tracer.is_some();

    init_logging(&config.logging, &config.environment, tracer)?;

    // After logging so the exporter's startup line is visible.
    let metrics = init_metrics(&config.metrics, &config.service_name)?;

    Ok(TelemetryHandle { metrics, exporting })
}

/// Handle for managing telemetry lifecycle.
#[derive(Debug)]
pub struct TelemetryHandle {
    pub metrics: MetricsRegistry,
    exporting: bool,
}

impl TelemetryHandle {
    /// Flush exported spans.
    pub fn shutdown(self) {
        if self.exporting {
            shutdown_tracing();
        }
        ::tracing::info!("Telemetry shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_config_defaults() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "taskline-worker");
        assert!(config.tracing.endpoint.is_none());
    }
}
