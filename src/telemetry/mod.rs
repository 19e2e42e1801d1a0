//! Tracing and OpenTelemetry setup for task-logger.
//!
//! Diagnostics always go to stderr so they never mix with the summaries the
//! CLI prints on stdout. With an OTLP endpoint the same spans, the attempt
//! metrics and the log events are exported as well.

pub mod attempt;
pub mod metrics;

use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig as _;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use crate::config::Config;
use crate::error::{Error, Result};

pub struct TelemetryConfig {
    /// OTLP gRPC endpoint (e.g. "http://localhost:4317"). `None` logs to stderr only.
    pub endpoint: Option<String>,
    /// Reported as `service.name` and used as the tracer name.
    pub service_name: String,
    /// Filter used when `RUST_LOG` is unset (e.g. "info", "task_logger=debug").
    pub log_level: String,
}

impl TelemetryConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            endpoint: config.otel_endpoint.clone(),
            service_name: metrics::METER_NAME.to_string(),
            log_level: config.log_level.clone(),
        }
    }
}

/// Keeps the OTLP pipelines alive; dropping it flushes and shuts them down.
pub struct TelemetryGuard {
    exporters: Option<Exporters>,
}

struct Exporters {
    tracer: SdkTracerProvider,
    meter: SdkMeterProvider,
    logger: SdkLoggerProvider,
}

impl TelemetryGuard {
    /// Whether spans, metrics and logs are being exported over OTLP.
    pub fn is_exporting(&self) -> bool {
        self.exporters.is_some()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        let Some(exporters) = self.exporters.take() else {
            return;
        };
        // Logs first so shutdown events from the other providers are not lost.
        let _ = exporters.logger.shutdown();
        let _ = exporters.meter.shutdown();
        let _ = exporters.tracer.shutdown();
    }
}

/// Install the global tracing subscriber and, with an endpoint, the OTLP
/// providers. The attempt metrics in [`metrics`] report through the meter
/// provider installed here.
///
/// Fails if an exporter cannot be built or a global subscriber is already
/// set (e.g. a second call in the same process).
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let stderr = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stderr);

    let exporters = match &config.endpoint {
        Some(endpoint) => Some(build_exporters(endpoint, &config.service_name)?),
        None => None,
    };

    let trace_layer = exporters.as_ref().map(|e| {
        tracing_opentelemetry::layer().with_tracer(e.tracer.tracer(config.service_name.clone()))
    });
    let log_layer = exporters.as_ref().map(|e| {
        opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge::new(&e.logger)
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr)
        .with(trace_layer)
        .with(log_layer)
        .try_init()
        .map_err(|e| Error::Telemetry(format!("failed to init tracing subscriber: {e}")))?;

    if let Some(endpoint) = &config.endpoint {
        tracing::debug!(%endpoint, service = %config.service_name, "exporting telemetry over OTLP");
    }
    Ok(TelemetryGuard { exporters })
}

fn build_exporters(endpoint: &str, service_name: &str) -> Result<Exporters> {
    let resource = Resource::builder()
        .with_service_name(service_name.to_string())
        .with_attribute(KeyValue::new("service.version", env!("CARGO_PKG_VERSION")))
        .build();

    let spans = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| exporter_error("span", e))?;
    let tracer = SdkTracerProvider::builder()
        .with_batch_exporter(spans)
        .with_resource(resource.clone())
        .build();

    let metrics = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| exporter_error("metric", e))?;
    let meter = SdkMeterProvider::builder()
        .with_periodic_exporter(metrics)
        .with_resource(resource.clone())
        .build();
    opentelemetry::global::set_meter_provider(meter.clone());

    let logs = opentelemetry_otlp::LogExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| exporter_error("log", e))?;
    let logger = SdkLoggerProvider::builder()
        .with_batch_exporter(logs)
        .with_resource(resource)
        .build();

    Ok(Exporters {
        tracer,
        meter,
        logger,
    })
}

fn exporter_error(signal: &str, err: impl std::fmt::Display) -> Error {
    Error::Telemetry(format!("failed to create OTLP {signal} exporter: {err}"))
}
