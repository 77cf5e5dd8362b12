//! Telemetry setup for dyndns.
//!
//! Logs go through `tracing` with an `EnvFilter` (`RUST_LOG` wins over the
//! configured level). A bare configured level applies to dyndns itself;
//! the HTTP and DNS stacks underneath stay at `warn` so a `debug` client
//! does not log every resolver query. The `prometheus` feature serves the
//! metrics facade over HTTP, the `otel` feature exports spans over OTLP.

#[cfg(feature = "prometheus")]
use std::net::SocketAddr;
#[cfg(any(feature = "prometheus", feature = "otel"))]
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::TelemetryConfig;
use crate::error::DyndnsError;

#[cfg(feature = "otel")]
use std::sync::OnceLock;
#[cfg(feature = "otel")]
static TRACER_PROVIDER: OnceLock<opentelemetry_sdk::trace::SdkTracerProvider> = OnceLock::new();

/// Install the subscriber and exporters for one process.
pub fn init(config: &TelemetryConfig) -> Result<(), DyndnsError> {
    init_tracing(config)?;

    #[cfg(feature = "prometheus")]
    if let Some(addr) = config.prometheus_addr {
        start_prometheus_exporter(addr)?;
    }

    crate::metrics::describe();
    Ok(())
}

/// Level for crates other than dyndns when only a bare level is configured.
const DEPENDENCY_LEVEL: &str = "warn";

/// Expand the configured level into filter directives.
///
/// Full directive lists (`"dyndns=debug,hyper=info"`) pass through untouched.
fn filter_directives(log_level: &str) -> String {
    let log_level = log_level.trim();
    if log_level.is_empty() {
        return format!("{},{}=info", DEPENDENCY_LEVEL, env!("CARGO_CRATE_NAME"));
    }
    if log_level.contains('=') || log_level.contains(',') {
        return log_level.to_string();
    }
    format!("{},{}={}", DEPENDENCY_LEVEL, env!("CARGO_CRATE_NAME"), log_level)
}

fn env_filter(config: &TelemetryConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(&config.log_level)))
}

fn telemetry_error(e: impl std::fmt::Display) -> DyndnsError {
    DyndnsError::Config(format!("telemetry setup failed: {}", e))
}

fn init_tracing(config: &TelemetryConfig) -> Result<(), DyndnsError> {
    #[cfg(feature = "otel")]
    if let Some(ref otel_config) = config.opentelemetry {
        use opentelemetry::trace::TracerProvider;
        use opentelemetry::KeyValue;
        use opentelemetry_otlp::WithExportConfig;
        use opentelemetry_sdk as otlp_sdk;

        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(&otel_config.endpoint)
            .build()
            .map_err(telemetry_error)?;

        let resource = otlp_sdk::Resource::builder()
            .with_attributes([
                KeyValue::new(
                    opentelemetry_semantic_conventions::resource::SERVICE_NAME,
                    otel_config.service_name.clone(),
                ),
                KeyValue::new(
                    opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
                    env!("CARGO_PKG_VERSION"),
                ),
            ])
            .build();

        let provider = otlp_sdk::trace::SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_resource(resource)
            .build();
        let tracer = provider.tracer("dyndns");
        let _ = TRACER_PROVIDER.set(provider);

        tracing_subscriber::registry()
            .with(env_filter(config))
            .with(tracing_subscriber::fmt::layer())
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .try_init()
            .map_err(telemetry_error)?;

        info!(endpoint = %otel_config.endpoint, "OpenTelemetry tracing enabled");
        return Ok(());
    }

    tracing_subscriber::registry()
        .with(env_filter(config))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(telemetry_error)
}

#[cfg(feature = "prometheus")]
fn start_prometheus_exporter(addr: SocketAddr) -> Result<(), DyndnsError> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(telemetry_error)?;

    info!(%addr, "Prometheus metrics exporter started");
    Ok(())
}

/// Flush pending OTLP spans.
pub fn shutdown() {
    #[cfg(feature = "otel")]
    {
        if let Some(provider) = TRACER_PROVIDER.get() {
            if let Err(e) = provider.shutdown() {
                tracing::warn!("Error shutting down tracer provider: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_level_scopes_to_dyndns() {
        assert_eq!(filter_directives("info"), "warn,dyndns=info");
        assert_eq!(filter_directives(" debug "), "warn,dyndns=debug");
        assert_eq!(filter_directives(""), "warn,dyndns=info");
    }

    #[test]
    fn test_directive_lists_pass_through() {
        assert_eq!(filter_directives("dyndns=trace"), "dyndns=trace");
        assert_eq!(filter_directives("debug,hyper=info"), "debug,hyper=info");
    }

    #[test]
    fn test_default_config_filter_parses() {
        let directives = filter_directives(&TelemetryConfig::default().log_level);
        assert!(EnvFilter::try_new(directives).is_ok());
    }
}
