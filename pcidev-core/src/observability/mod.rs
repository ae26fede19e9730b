//! Observability infrastructure: tracing, metrics, health checks.

use crate::config::Config;
use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{self, RandomIdGenerator, Sampler};
use opentelemetry_sdk::Resource;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod health;
pub mod metrics;

/// Check if OTLP tracing is enabled via environment variable.
/// Set PCIDEV_OTLP_ENABLED=1 or OTEL_EXPORTER_OTLP_ENDPOINT to enable.
fn otlp_enabled() -> bool {
    std::env::var("PCIDEV_OTLP_ENABLED").is_ok()
        || std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok()
}

/// Get the OTLP endpoint (default: http://localhost:4317)
fn otlp_endpoint() -> String {
    std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4317".to_string())
}

/// Level used when `RUST_LOG` is not set.
fn default_level(configured: &str, debug_logging: Option<&str>) -> String {
    match debug_logging {
        Some(v) if v.eq_ignore_ascii_case("true") => "debug".to_string(),
        _ => configured.to_string(),
    }
}

/// Initialize the global observability infrastructure.
///
/// Must be called once at startup, from within the Tokio runtime.
pub fn init(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let level = default_level(&config.log_level, std::env::var("DEBUG_LOGGING").ok().as_deref());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));

    // Build the base subscriber
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true));

    // Conditionally add OTLP tracing layer
    if otlp_enabled() {
        let endpoint = otlp_endpoint();

        let exporter = opentelemetry_otlp::new_exporter().tonic().with_endpoint(&endpoint);

        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(
                trace::config()
                    .with_sampler(Sampler::AlwaysOn)
                    .with_id_generator(RandomIdGenerator::default())
                    .with_resource(Resource::new(vec![
                        opentelemetry::KeyValue::new("service.name", "pcidevd"),
                        opentelemetry::KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                        opentelemetry::KeyValue::new("host.name", config.node_name.clone()),
                    ])),
            )
            .install_batch(opentelemetry_sdk::runtime::Tokio)?;

        let telemetry = tracing_opentelemetry::layer().with_tracer(tracer);
        subscriber.with(telemetry).init();
        tracing::info!("Observability initialized with OTLP tracing (endpoint: {})", endpoint);
    } else {
        subscriber.init();
        tracing::info!("Observability initialized (OTLP disabled)");
    }

    // Port 0 turns the exporter off
    if config.metrics_port != 0 {
        PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], config.metrics_port))
            .install()?;
    }

    metrics::register_core_metrics();

    Ok(())
}

/// Shutdown observability infrastructure gracefully.
pub fn shutdown() {
    opentelemetry::global::shutdown_tracer_provider();
}
