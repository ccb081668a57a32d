//! Process telemetry: console logging, optional OTLP log export and optional OTLP metrics.
//!
//! Exchange spans are not configured here; they belong to the
//! [`TracerProvider`](crate::tracer::TracerProvider) and are only produced when tracing is
//! enabled.

use doku::Document;
use opentelemetry::{global, KeyValue};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{ExporterBuildError, LogExporter, MetricExporter, WithExportConfig};
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::Resource;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt as _, Snafu};
use tracing_subscriber::filter::{Directive, ParseError};
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::EnvFilter;

use crate::ServiceInfo;

/// Crates whose events are never exported over OTLP, since exporting them would feed the
/// exporter its own traffic.
const EXPORTER_TARGETS: [&str; 5] = ["hyper", "opentelemetry", "tonic", "h2", "reqwest"];

/// Telemetry initialization errors.
#[derive(Debug, Snafu)]
pub enum Error {
    /// The OTLP log exporter could not be built
    #[snafu(display("Could not initialize logging: {source}"))]
    InitLog {
        /// exporter error
        source: ExporterBuildError,
    },

    /// The OTLP metric exporter could not be built
    #[snafu(display("Could not initialize metrics: {source}"))]
    InitMetric {
        /// exporter error
        source: ExporterBuildError,
    },

    /// A log level directive is malformed
    #[snafu(display("Invalid log filter {directive:?}: {source}"))]
    Filter {
        /// the offending directive
        directive: String,
        /// parse error
        source: ParseError,
    },

    /// A global subscriber is already installed
    #[snafu(display("Could not install the log subscriber: {source}"))]
    Subscriber {
        /// init error
        source: TryInitError,
    },
}

/// Metrics export settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize, Document)]
pub struct MetricSettings {
    /// OTLP/gRPC metrics endpoint. Metrics are not exported when unset.
    #[doku(example = "http://localhost:4317")]
    pub endpoint: Option<String>,
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize, Document)]
pub struct LogSettings {
    /// Console filter directives
    #[doku(example = "info,tracegate=debug")]
    pub console_level: String,
    /// Filter directives for logs exported over OTLP
    #[doku(example = "warn,tracegate=info")]
    pub otel_level: String,
    /// OTLP/gRPC logs endpoint. Logs are only written to the console when unset.
    #[doku(example = "http://localhost:4317")]
    pub endpoint: Option<String>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            console_level: "info".to_string(),
            otel_level: "warn".to_string(),
            endpoint: None,
        }
    }
}

/// The `[telemetry]` configuration section.
#[derive(Clone, Debug, Default, Serialize, Deserialize, Document)]
pub struct TelemetrySettings {
    /// Log settings
    #[serde(default)]
    pub log: LogSettings,
    /// Metric settings
    #[serde(default)]
    pub metric: MetricSettings,
}

/// Keeps telemetry providers alive; flushes and stops them on drop.
pub struct Telemetry {
    meter_provider: Option<SdkMeterProvider>,
    logger_provider: Option<SdkLoggerProvider>,
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(meter_provider) = self.meter_provider.take() {
            if let Err(err) = meter_provider.shutdown() {
                eprintln!("Error shutting down Telemetry meter provider: {err}");
            }
        }
        if let Some(logger_provider) = self.logger_provider.take() {
            if let Err(err) = logger_provider.shutdown() {
                eprintln!("Error shutting down Telemetry logger provider: {err}");
            }
        }
    }
}

fn resource(service_info: &ServiceInfo) -> Resource {
    Resource::builder()
        .with_service_name(service_info.name_in_metrics.clone())
        .with_attribute(KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
            service_info.version,
        ))
        .build()
}

fn filter(directives: &str) -> Result<EnvFilter, Error> {
    EnvFilter::try_new(directives).context(FilterSnafu { directive: directives })
}

/// An OTLP export filter that never lets exporter crates through.
fn export_filter(directives: &str) -> Result<EnvFilter, Error> {
    EXPORTER_TARGETS.iter().try_fold(filter(directives)?, |filter, target| {
        let directive = format!("{target}=off");
        let parsed = directive.parse::<Directive>().context(FilterSnafu {
            directive: directive.as_str(),
        })?;
        Ok(filter.add_directive(parsed))
    })
}

fn init_metrics(
    service_info: &ServiceInfo,
    settings: &MetricSettings,
) -> Result<Option<SdkMeterProvider>, ExporterBuildError> {
    let Some(endpoint) = &settings.endpoint else {
        return Ok(None);
    };
    let exporter = MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;
    Ok(Some(
        SdkMeterProvider::builder()
            .with_periodic_exporter(exporter)
            .with_resource(resource(service_info))
            .build(),
    ))
}

fn init_logs(
    service_info: &ServiceInfo,
    settings: &LogSettings,
) -> Result<Option<SdkLoggerProvider>, ExporterBuildError> {
    let Some(endpoint) = &settings.endpoint else {
        return Ok(None);
    };
    let exporter = LogExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;
    Ok(Some(
        SdkLoggerProvider::builder()
            .with_resource(resource(service_info))
            .with_batch_exporter(exporter)
            .build(),
    ))
}

/// Install the global log subscriber and, when configured, OTLP log and metric export.
///
/// The meter provider becomes the global one, so the `tracegate.tracing.failures` counter is
/// exported with it.
///
/// # Errors
/// - `InitLog`/`InitMetric` if an OTLP exporter cannot be built.
/// - `Filter` if a level directive does not parse.
/// - `Subscriber` if a global subscriber is already installed.
pub fn init(service_info: &ServiceInfo, settings: &TelemetrySettings) -> Result<Telemetry, Error> {
    let logger_provider = init_logs(service_info, &settings.log).context(InitLogSnafu)?;

    let otel_layer = match &logger_provider {
        Some(provider) => Some(
            OpenTelemetryTracingBridge::new(provider)
                .with_filter(export_filter(&settings.log.otel_level)?),
        ),
        None => None,
    };
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_thread_names(true)
        .with_filter(filter(&settings.log.console_level)?);

    tracing_subscriber::registry()
        .with(otel_layer)
        .with(fmt_layer)
        .try_init()
        .context(SubscriberSnafu)?;

    let meter_provider = init_metrics(service_info, &settings.metric).context(InitMetricSnafu)?;
    if let Some(meter_provider) = &meter_provider {
        global::set_meter_provider(meter_provider.clone());
    }

    Ok(Telemetry {
        meter_provider,
        logger_provider,
    })
}
