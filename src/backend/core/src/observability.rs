//! Observability: distributed tracing, metrics, and logging.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry_otlp::WithExportConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ObservabilityConfig;

/// Initialize the observability stack.
pub fn init(service_name: &str, config: &ObservabilityConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    // Set up OpenTelemetry tracing if an endpoint is provided
    if let Some(endpoint) = config.otlp_endpoint.as_deref() {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .tonic()
                    .with_endpoint(endpoint),
            )
            .with_trace_config(
                opentelemetry_sdk::trace::config()
                    .with_resource(opentelemetry_sdk::Resource::new(vec![
                        opentelemetry::KeyValue::new("service.name", service_name.to_string()),
                    ])),
            )
            .install_batch(opentelemetry_sdk::runtime::Tokio)?;

        let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);

        if config.json_logging {
            tracing_subscriber::registry()
                .with(filter)
                .with(telemetry_layer)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            tracing_subscriber::registry()
                .with(filter)
                .with(telemetry_layer)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    } else if config.json_logging {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    Ok(())
}

/// Shutdown OpenTelemetry.
pub fn shutdown() {
    opentelemetry::global::shutdown_tracer_provider();
}

/// Install the Prometheus recorder and register metric descriptions.
///
/// The returned handle renders the scrape text for `/metrics`.
pub fn install_metrics() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    metrics::register_metrics();
    Ok(handle)
}

/// Metrics registry and helpers.
pub mod metrics {
    use metrics::{describe_counter, describe_histogram, histogram};

    /// Register all metric descriptions.
    pub fn register_metrics() {
        // Counters
        describe_counter!(
            "intake_submissions_total",
            "Submissions created, by intake"
        );
        describe_counter!(
            "intake_transitions_total",
            "Committed state transitions, by event type and resulting state"
        );
        describe_counter!(
            "intake_stale_tokens_total",
            "Mutations rejected for presenting a superseded resume token"
        );
        describe_counter!(
            "intake_errors_total",
            "Errors returned to callers, by code and category"
        );
        describe_counter!(
            "intake_deliveries_enqueued_total",
            "Delivery records created for accepted submissions"
        );
        describe_counter!(
            "intake_delivery_attempts_total",
            "Outbound delivery attempts dispatched"
        );
        describe_counter!(
            "intake_deliveries_total",
            "Delivery attempt outcomes, by outcome"
        );

        // Histograms
        describe_histogram!(
            "intake_http_request_duration_seconds",
            "HTTP request duration in seconds, by method and path"
        );
    }

    /// Record an HTTP request duration.
    pub fn record_http_request(method: &str, path: &str, duration_secs: f64) {
        histogram!(
            "intake_http_request_duration_seconds",
            "method" => method.to_string(),
            "path" => path.to_string(),
        )
        .record(duration_secs);
    }
}
