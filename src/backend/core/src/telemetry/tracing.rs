//! Distributed tracing with OpenTelemetry.
//!
//! Builds an OTLP batch pipeline when an endpoint is configured. The returned
//! tracer is handed to [`super::logging::init_logging`], which wires it into
//! the subscriber through `tracing-opentelemetry`.

use opentelemetry::trace::TraceContextExt;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{self as sdktrace, Sampler};
use opentelemetry_sdk::Resource;
use tracing_opentelemetry::OpenTelemetrySpanExt;
use serde::Deserialize;
use std::collections::HashMap;

/// Tracing configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TracingConfig {
    /// OTLP endpoint (e.g. `http://localhost:4317`). Export is off when unset.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Ratio of traces to sample (0.0 to 1.0). Parent decisions are honored.
    #[serde(default)]
    pub sample_ratio: Option<f64>,

    /// Additional resource attributes
    #[serde(default)]
    pub resource_attributes: HashMap<String, String>,
}

/// Build and install the OTLP tracer pipeline.
///
/// Returns `None` when no endpoint is configured.
pub fn init_tracing(
    config: &TracingConfig,
    service_name: &str,
) -> anyhow::Result<Option<sdktrace::Tracer>> {
    let Some(endpoint) = config.endpoint.as_deref() else {
        return Ok(None);
    };

    let mut resource_attrs = vec![
        opentelemetry::KeyValue::new("service.name", service_name.to_string()),
        opentelemetry::KeyValue::new("service.version", env!("CARGO_PKG_VERSION").to_string()),
    ];
    for (key, value) in &config.resource_attributes {
        resource_attrs.push(opentelemetry::KeyValue::new(key.clone(), value.clone()));
    }

    let sampler = match config.sample_ratio {
        Some(ratio) => Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(ratio))),
        None => Sampler::AlwaysOn,
    };

    let trace_config = sdktrace::Config::default()
        .with_resource(Resource::new(resource_attrs))
        .with_sampler(sampler);

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .with_trace_config(trace_config)
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    opentelemetry::global::set_text_map_propagator(
        opentelemetry_sdk::propagation::TraceContextPropagator::new(),
    );

    Ok(Some(tracer))
}

/// Flush remaining spans.
pub fn shutdown_tracing() {
    opentelemetry::global::shutdown_tracer_provider();
}

/// Trace id of the span active on this task, when it is being sampled.
pub fn current_trace_id() -> Option<String> {
    let ctx = ::tracing::Span::current().context();
    let span = ctx.span();
    let span_ctx = span.span_context();
    span_ctx.is_valid().then(|| span_ctx.trace_id().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_without_endpoint() {
        let config = TracingConfig::default();
        let tracer = init_tracing(&config, "taskline-test").unwrap();
        assert!(tracer.is_none());
    }

    #[test]
    fn test_no_trace_outside_span() {
        assert!(current_trace_id().is_none());
    }
}
