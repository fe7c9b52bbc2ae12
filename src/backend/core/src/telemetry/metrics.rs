//! Prometheus metrics for job throughput, latency and recovery.
//!
//! # Example
//!
//! ```rust,no_run
//! use taskline_core::telemetry::metrics::JobMetrics;
//!
//! JobMetrics::added("emails");
//! JobMetrics::settled("emails", "COMPLETED", 0.125);
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Address for the Prometheus scrape endpoint (e.g. "0.0.0.0:9090").
    /// When unset the recorder is installed without a listener.
    #[serde(default)]
    pub listen: Option<SocketAddr>,

    /// Histogram buckets for job durations (in seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,

    /// Global labels to add to all metrics
    #[serde(default)]
    pub global_labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: None,
            duration_buckets: default_duration_buckets(),
            global_labels: HashMap::new(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_duration_buckets() -> Vec<f64> {
    vec![
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0,
    ]
}

/// Handle to the installed recorder.
pub struct MetricsRegistry {
    prometheus_handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("prometheus_handle", &self.prometheus_handle.is_some())
            .finish()
    }
}

impl MetricsRegistry {
    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.prometheus_handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

/// Initialize the metrics subsystem.
///
/// # Errors
///
/// Returns an error if the recorder cannot be installed.
pub fn init_metrics(config: &MetricsConfig, service_name: &str) -> anyhow::Result<MetricsRegistry> {
    if !config.enabled {
        return Ok(MetricsRegistry {
            prometheus_handle: None,
        });
    }

    let mut builder = PrometheusBuilder::new();
    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }
    builder = builder.set_buckets(&config.duration_buckets)?;

    let prometheus_handle = match config.listen {
        Some(addr) => {
            builder.with_http_listener(addr).install()?;
            None
        }
        None => Some(builder.install_recorder()?),
    };

    register_metric_descriptions();

    tracing::info!(
        service_name = %service_name,
        listen = ?config.listen,
        "Metrics initialized"
    );

    Ok(MetricsRegistry { prometheus_handle })
}

fn register_metric_descriptions() {
    describe_counter!("taskline_jobs_added_total", "Jobs persisted by add()");
    describe_counter!(
        "taskline_jobs_settled_total",
        "Jobs that reached a terminal state, by state"
    );
    describe_counter!(
        "taskline_jobs_retried_total",
        "Handler rejections that were scheduled for another attempt"
    );
    describe_counter!(
        "taskline_jobs_recovered_total",
        "Orphaned jobs handled by stale-lock recovery, by outcome"
    );
    describe_gauge!("taskline_jobs_running", "Jobs currently executing in this process");
    describe_histogram!(
        "taskline_job_duration_seconds",
        "Wall time of a single job attempt in seconds"
    );
    describe_counter!(
        "taskline_worker_requests_total",
        "Worker bridge requests, by pattern and outcome"
    );
    describe_counter!("taskline_errors_total", "Errors by code");
}

/// Job lifecycle metrics.
pub struct JobMetrics;

impl JobMetrics {
    pub fn added(queue: &str) {
        counter!("taskline_jobs_added_total", "queue" => queue.to_string()).increment(1);
    }

    /// Record an attempt that finished with a terminal state.
    pub fn settled(queue: &str, state: &str, duration_seconds: f64) {
        counter!(
            "taskline_jobs_settled_total",
            "queue" => queue.to_string(),
            "state" => state.to_string(),
        )
        .increment(1);
        histogram!("taskline_job_duration_seconds", "queue" => queue.to_string())
            .record(duration_seconds);
    }

    /// Record an attempt that ended in a scheduled retry.
    pub fn retried(queue: &str, duration_seconds: f64) {
        counter!("taskline_jobs_retried_total", "queue" => queue.to_string()).increment(1);
        histogram!("taskline_job_duration_seconds", "queue" => queue.to_string())
            .record(duration_seconds);
    }

    pub fn recovered(queue: &str, outcome: &str) {
        counter!(
            "taskline_jobs_recovered_total",
            "queue" => queue.to_string(),
            "outcome" => outcome.to_string(),
        )
        .increment(1);
    }

    pub fn running_inc(queue: &str) {
        gauge!("taskline_jobs_running", "queue" => queue.to_string()).increment(1.0);
    }

    pub fn running_dec(queue: &str) {
        gauge!("taskline_jobs_running", "queue" => queue.to_string()).decrement(1.0);
    }
}

/// Worker bridge metrics.
pub struct WorkerMetrics;

impl WorkerMetrics {
    pub fn request(pattern: &str, outcome: &'static str) {
        counter!(
            "taskline_worker_requests_total",
            "pattern" => pattern.to_string(),
            "outcome" => outcome,
        )
        .increment(1);
    }
}
