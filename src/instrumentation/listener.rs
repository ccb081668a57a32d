use std::any::Any;
use std::sync::Arc;

use opentelemetry::metrics::Counter;
use opentelemetry::KeyValue;

use crate::context::{Exchange, ExchangeListener, ExchangeObserver, Outcome};
use crate::registry::Component;
use crate::tracer::{ScopedSpan, TracerHandle, EXCHANGE_ID, ROUTE_ID};

/// Opens one span per exchange and closes it when the exchange finishes.
///
/// Tracing is best effort: when a span cannot be started the exchange is processed untraced and
/// the failure is logged and counted in `tracegate.tracing.failures`.
pub struct TracingLogListener {
    tracer: Arc<TracerHandle>,
    failures: Counter<u64>,
}

impl TracingLogListener {
    /// Component id of every tracing listener.
    pub const ID: &'static str = "tracing-log-listener";

    /// A listener reporting through `tracer`.
    pub fn new(tracer: Arc<TracerHandle>) -> Self {
        let failures = opentelemetry::global::meter(env!("CARGO_PKG_NAME"))
            .u64_counter("tracegate.tracing.failures")
            .with_description("Exchanges processed without a span because tracing failed")
            .build();
        Self { tracer, failures }
    }

    /// The tracer spans are created with.
    pub fn tracer(&self) -> &Arc<TracerHandle> {
        &self.tracer
    }
}

impl std::fmt::Debug for TracingLogListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TracingLogListener")
            .field("tracer", &self.tracer)
            .finish_non_exhaustive()
    }
}

impl Component for TracingLogListener {
    fn component_id(&self) -> &str {
        Self::ID
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl ExchangeListener for TracingLogListener {
    fn on_exchange_event(&self, exchange: &Exchange) -> Box<dyn ExchangeObserver> {
        let attributes = vec![
            KeyValue::new(EXCHANGE_ID, exchange.id().to_owned()),
            KeyValue::new(ROUTE_ID, exchange.route_id().to_owned()),
        ];
        match self.tracer.start_span(exchange.route_id(), attributes) {
            Ok(span) => Box::new(SpanObserver { span }),
            Err(err) => {
                tracing::warn!(exchange_id = exchange.id(), %err, "exchange will not be traced");
                self.failures.add(
                    1,
                    &[KeyValue::new("service.name", self.tracer.service_name().to_owned())],
                );
                Box::new(Untraced)
            }
        }
    }
}

struct SpanObserver {
    span: ScopedSpan,
}

impl ExchangeObserver for SpanObserver {
    fn on_complete(self: Box<Self>, exchange: &Exchange, outcome: Outcome<'_>) {
        let mut span = self.span;
        for message in exchange.messages() {
            span.add_event("log", vec![KeyValue::new("message", message.clone())]);
        }
        match outcome {
            Outcome::Completed => span.end_ok(),
            Outcome::Failed(err) => span.end_with_error(err.to_string()),
            Outcome::Cancelled => span.end_cancelled(),
        }
    }
}

struct Untraced;

impl ExchangeObserver for Untraced {
    fn on_complete(self: Box<Self>, _exchange: &Exchange, _outcome: Outcome<'_>) {}
}
