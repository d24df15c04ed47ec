//! Logger provider bootstrap and the `tracing` bridge.
use crate::error::MiddlewareError;
use crate::options::MwOptions;
use opentelemetry::otel_warn;
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{Compression, WithExportConfig, WithTonicConfig};
use opentelemetry_sdk::logs::{LogExporter, SdkLoggerProvider};
use opentelemetry_sdk::Resource;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{prelude::*, EnvFilter};

/// OTLP/gRPC log exporter for the configured target, gzip compressed.
///
/// Must be called from within a Tokio runtime.
pub(crate) fn otlp_log_exporter(
    options: &MwOptions,
) -> Result<opentelemetry_otlp::LogExporter, MiddlewareError> {
    opentelemetry_otlp::LogExporter::builder()
        .with_tonic()
        .with_endpoint(options.target.clone())
        .with_compression(Compression::Gzip)
        .build()
        .map_err(|source| MiddlewareError::ExporterBuild {
            signal: "log",
            source,
        })
}

/// Logger provider batching records to `exporter`, and printing them to
/// stdout as well when the console exporter is enabled.
pub(crate) fn build_logger_provider<E>(
    options: &MwOptions,
    resource: Resource,
    exporter: E,
) -> SdkLoggerProvider
where
    E: LogExporter + 'static,
{
    let mut builder = SdkLoggerProvider::builder()
        .with_resource(resource)
        .with_batch_exporter(exporter);
    if options.console_exporter {
        builder = builder.with_simple_exporter(opentelemetry_stdout::LogExporter::default());
    }
    builder.build()
}

/// Forwards events at or above `level`. Events from the exporters' transport
/// stack and from OpenTelemetry itself are never forwarded, or exporting a
/// batch would produce more logs to export.
pub(crate) fn bridge_filter(level: LevelFilter) -> EnvFilter {
    EnvFilter::new(format!(
        "{level},hyper=off,tonic=off,h2=off,tower=off,reqwest=off,opentelemetry=off"
    ))
}

/// Install a global `tracing` subscriber forwarding events to `provider`.
/// Leaves an already installed subscriber in place.
pub(crate) fn install_tracing_bridge(provider: &SdkLoggerProvider, level: LevelFilter) {
    let layer = OpenTelemetryTracingBridge::new(provider).with_filter(bridge_filter(level));
    if let Err(err) = tracing_subscriber::registry().with(layer).try_init() {
        otel_warn!(
            name: "Middleware.TracingBridgeNotInstalled",
            reason = err.to_string()
        );
    }
}
