//! # Tracer Provider
//!
//! [`TracerProvider`] builds one [`TracerHandle`] per service name and hands out the same
//! handle on every later request. The handle wraps an opentelemetry SDK tracer and is safe to
//! share between workers; each span it starts is owned by a [`ScopedSpan`] guard that ends the
//! span on every exit path.
//!
//! How spans leave the process is decided by the pipeline the provider was built with. The
//! default pipeline exports over OTLP/gRPC through a batch processor when an endpoint is
//! configured, and keeps spans local otherwise.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use doku::Document;
use opentelemetry::trace::{Span as _, SpanKind, Status, Tracer as _, TracerProvider as _};
use opentelemetry::KeyValue;
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::Resource;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt as _, Snafu};

use crate::registry::Component;
use crate::{BoxError, Error, InitializationSnafu, ServiceInfo};

/// Span attribute carrying the exchange correlation id.
pub const EXCHANGE_ID: &str = "exchange.id";
/// Span attribute carrying the route that processed the exchange.
pub const ROUTE_ID: &str = "route.id";
/// Span attribute carrying how the exchange finished.
pub const EXCHANGE_STATUS: &str = "exchange.status";

/// Where spans are exported to.
#[derive(Clone, Debug, Default, Serialize, Deserialize, Document)]
pub struct ExporterSettings {
    /// OTLP/gRPC collector endpoint. Spans stay in-process when unset.
    #[doku(example = "http://localhost:4317")]
    pub endpoint: Option<String>,
}

/// Non-fatal, per-exchange tracing failures.
///
/// These are logged by the caller and never interrupt exchange processing.
#[derive(Debug, Snafu)]
pub enum TracingFailure {
    /// The tracer was shut down and no longer creates spans.
    #[snafu(display("Tracer for service {service_name:?} has been shut down"))]
    TracerShutdown {
        /// service the tracer belongs to
        service_name: String,
    },
}

type SdkTracer = <SdkTracerProvider as opentelemetry::trace::TracerProvider>::Tracer;
type SdkSpan = <SdkTracer as opentelemetry::trace::Tracer>::Span;

type Pipeline = dyn Fn(Resource) -> Result<SdkTracerProvider, BoxError> + Send + Sync;

/// Builds and memoizes tracers, one per service name.
pub struct TracerProvider {
    service_version: String,
    pipeline: Box<Pipeline>,
    tracers: Mutex<HashMap<String, Arc<TracerHandle>>>,
}

impl TracerProvider {
    /// A provider using the OTLP pipeline described by `settings`.
    pub fn from_settings(service_info: &ServiceInfo, settings: &ExporterSettings) -> Self {
        let endpoint = settings.endpoint.clone();
        Self::with_pipeline(service_info, move |resource| {
            otlp_pipeline(endpoint.as_deref(), resource)
        })
    }

    /// A provider with a custom pipeline that turns a [`Resource`] into an SDK tracer provider.
    ///
    /// The resource already carries `service.name` and `service.version`.
    pub fn with_pipeline<F>(service_info: &ServiceInfo, pipeline: F) -> Self
    where
        F: Fn(Resource) -> Result<SdkTracerProvider, BoxError> + Send + Sync + 'static,
    {
        Self {
            service_version: service_info.version.to_owned(),
            pipeline: Box::new(pipeline),
            tracers: Mutex::default(),
        }
    }

    /// The tracer for `service_name`, building it on first use.
    ///
    /// Concurrent first calls for the same name build the tracer once.
    ///
    /// # Errors
    /// - `Initialization` if the pipeline cannot build the backend.
    pub fn get_tracer(&self, service_name: &str) -> Result<Arc<TracerHandle>, Error> {
        let mut tracers = self.tracers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tracer) = tracers.get(service_name) {
            return Ok(Arc::clone(tracer));
        }

        let resource = Resource::builder()
            .with_service_name(service_name.to_owned())
            .with_attribute(KeyValue::new(
                opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
                self.service_version.clone(),
            ))
            .build();
        let provider = (self.pipeline)(resource).context(InitializationSnafu { service_name })?;

        let tracer = Arc::new(TracerHandle::new(service_name, provider));
        tracers.insert(service_name.to_owned(), Arc::clone(&tracer));
        tracing::info!(service_name, "tracer initialized");
        Ok(tracer)
    }

    /// Forget the tracer for `service_name`. The next [`TracerProvider::get_tracer`] builds a
    /// new one.
    pub fn evict(&self, service_name: &str) -> Option<Arc<TracerHandle>> {
        self.tracers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(service_name)
    }
}

impl fmt::Debug for TracerProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tracers = self.tracers.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("TracerProvider")
            .field("service_version", &self.service_version)
            .field("tracers", &tracers.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn otlp_pipeline(endpoint: Option<&str>, resource: Resource) -> Result<SdkTracerProvider, BoxError> {
    let builder = SdkTracerProvider::builder().with_resource(resource);
    match endpoint {
        Some(endpoint) => {
            let exporter = SpanExporter::builder()
                .with_tonic()
                .with_endpoint(endpoint)
                .build()?;
            Ok(builder.with_batch_exporter(exporter).build())
        }
        None => Ok(builder.build()),
    }
}

/// Number of spans a tracer opened and closed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SpanStats {
    /// spans started
    pub opened: u64,
    /// spans ended, on any path
    pub closed: u64,
}

impl SpanStats {
    /// Spans that were started and not yet ended.
    pub fn in_flight(&self) -> u64 {
        self.opened.saturating_sub(self.closed)
    }
}

/// A tracer bound to one service name.
pub struct TracerHandle {
    service_name: String,
    provider: SdkTracerProvider,
    tracer: SdkTracer,
    opened: AtomicU64,
    closed: AtomicU64,
    shut_down: AtomicBool,
}

impl TracerHandle {
    fn new(service_name: &str, provider: SdkTracerProvider) -> Self {
        let tracer = provider.tracer(env!("CARGO_PKG_NAME"));
        Self {
            service_name: service_name.to_owned(),
            provider,
            tracer,
            opened: AtomicU64::new(0),
            closed: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
        }
    }

    /// The service this tracer reports as.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Open/close counters since the tracer was built.
    pub fn stats(&self) -> SpanStats {
        SpanStats {
            opened: self.opened.load(Ordering::Acquire),
            closed: self.closed.load(Ordering::Acquire),
        }
    }

    /// Whether [`TracerHandle::shutdown`] has been called.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Start a consumer span named `name`.
    ///
    /// # Errors
    /// - `TracerShutdown` once the tracer has been shut down.
    pub fn start_span(
        self: &Arc<Self>,
        name: impl Into<String>,
        attributes: Vec<KeyValue>,
    ) -> Result<ScopedSpan, TracingFailure> {
        if self.is_shut_down() {
            return TracerShutdownSnafu {
                service_name: self.service_name.as_str(),
            }
            .fail();
        }

        let span = self
            .tracer
            .span_builder(name.into())
            .with_kind(SpanKind::Consumer)
            .with_attributes(attributes)
            .start(&self.tracer);
        self.opened.fetch_add(1, Ordering::AcqRel);

        Ok(ScopedSpan {
            span,
            tracer: Arc::clone(self),
            ended: false,
        })
    }

    /// Export every finished span that is still buffered.
    pub fn flush(&self) {
        if let Err(err) = self.provider.force_flush() {
            tracing::warn!(service_name = %self.service_name, %err, "could not flush spans");
        }
    }

    /// Flush and stop the backend. Later [`TracerHandle::start_span`] calls fail.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(err) = self.provider.shutdown() {
            tracing::warn!(service_name = %self.service_name, %err, "error shutting down tracer");
        }
    }
}

impl Component for TracerHandle {
    fn component_id(&self) -> &str {
        &self.service_name
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl fmt::Debug for TracerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracerHandle")
            .field("service_name", &self.service_name)
            .field("stats", &self.stats())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

/// An open span that is ended exactly once.
///
/// Dropping the guard without calling one of the `end_*` methods ends the span as abandoned,
/// with an error status and `exchange.status = "cancelled"`.
pub struct ScopedSpan {
    span: SdkSpan,
    tracer: Arc<TracerHandle>,
    ended: bool,
}

impl ScopedSpan {
    /// Add an attribute to the open span.
    pub fn set_attribute(&mut self, attribute: KeyValue) {
        self.span.set_attribute(attribute);
    }

    /// Record a timestamped event on the open span.
    pub fn add_event(&mut self, name: &'static str, attributes: Vec<KeyValue>) {
        self.span.add_event(name, attributes);
    }

    /// End the span successfully.
    pub fn end_ok(mut self) {
        self.span.set_attribute(KeyValue::new(EXCHANGE_STATUS, "completed"));
        self.span.set_status(Status::Ok);
        self.end();
    }

    /// End the span as failed with `message`.
    pub fn end_with_error(mut self, message: impl Into<String>) {
        let message = message.into();
        self.span.set_attribute(KeyValue::new(EXCHANGE_STATUS, "failed"));
        self.span.add_event(
            "exception",
            vec![KeyValue::new(
                opentelemetry_semantic_conventions::attribute::EXCEPTION_MESSAGE,
                message.clone(),
            )],
        );
        self.span.set_status(Status::error(message));
        self.end();
    }

    /// End the span as cancelled.
    pub fn end_cancelled(mut self) {
        self.cancel();
    }

    fn cancel(&mut self) {
        self.span.set_attribute(KeyValue::new(EXCHANGE_STATUS, "cancelled"));
        self.span.set_status(Status::error("cancelled"));
        self.end();
    }

    fn end(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;
        self.span.end();
        self.tracer.closed.fetch_add(1, Ordering::AcqRel);
    }
}

impl Drop for ScopedSpan {
    fn drop(&mut self) {
        if !self.ended {
            tracing::debug!(service_name = %self.tracer.service_name, "span abandoned, closing");
            self.cancel();
        }
    }
}

impl fmt::Debug for ScopedSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedSpan")
            .field("service_name", &self.tracer.service_name)
            .field("ended", &self.ended)
            .finish()
    }
}
