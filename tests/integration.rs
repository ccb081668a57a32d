//! Integration tests for the tracegate crate.
//!
//! These tests start whole runtimes through the public API and check what ends up registered,
//! attached and exported.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracerProvider, SpanData};
use tracegate::context::{
    ContextConfiguration, Exchange, ProcessError, Processor, RuntimeContext,
};
use tracegate::gate::{GateDecision, ServiceSettings, TracingConfig};
use tracegate::instrumentation::{TracingContextConfiguration, TracingLogListener};
use tracegate::registry::{Capability, Component, Registry};
use tracegate::runtime::{IntegrationRuntime, RuntimeNamingConfiguration, State};
use tracegate::tracer::{ExporterSettings, TracerHandle, TracerProvider, EXCHANGE_ID, ROUTE_ID};

fn in_memory_provider() -> (TracerProvider, InMemorySpanExporter) {
    let exporter = InMemorySpanExporter::default();
    let pipeline_exporter = exporter.clone();
    let provider = TracerProvider::with_pipeline(&tracegate::service_info!(), move |resource| {
        Ok(SdkTracerProvider::builder()
            .with_resource(resource)
            .with_simple_exporter(pipeline_exporter.clone())
            .build())
    });
    (provider, exporter)
}

fn traced_runtime(service_name: &str, workers: usize) -> (IntegrationRuntime, InMemorySpanExporter) {
    let (provider, exporter) = in_memory_provider();
    let runtime = IntegrationRuntime::builder(tracegate::service_info!())
        .tracing(TracingConfig::enabled_for(service_name))
        .workers(workers)
        .tracer_provider(provider)
        .build()
        .expect("runtime should build");
    (runtime, exporter)
}

fn attribute(span: &SpanData, key: &str) -> Option<String> {
    span.attributes
        .iter()
        .find(|kv| kv.key.as_str() == key)
        .map(|kv| kv.value.to_string())
}

struct Echo;

impl Processor for Echo {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessError> {
        tokio::task::yield_now().await;
        exchange.log(format!("echo {}", exchange.body()));
        Ok(())
    }
}

/// Fails every exchange whose body is `fail`.
struct Picky;

impl Processor for Picky {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessError> {
        if exchange.body() == "fail" {
            return Err(ProcessError::failed("picky"));
        }
        Ok(())
    }
}

/// Never finishes.
struct Stuck;

impl Processor for Stuck {
    async fn process(&self, _exchange: &mut Exchange) -> Result<(), ProcessError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

/// Records the shutdown call order, and what the tracer looked like at that moment.
struct ShutdownRecorder {
    id: &'static str,
    log: Arc<Mutex<Vec<String>>>,
    tracer: Arc<TracerHandle>,
    exporter: InMemorySpanExporter,
}

impl Component for ShutdownRecorder {
    fn component_id(&self) -> &str {
        self.id
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl ContextConfiguration for ShutdownRecorder {
    fn before_start(
        &self,
        _context: &mut RuntimeContext,
        _registry: &Registry,
    ) -> Result<(), tracegate::Error> {
        Ok(())
    }

    fn on_shutdown(&self) {
        let exported = self.exporter.get_finished_spans().unwrap().len();
        self.log.lock().unwrap().push(format!(
            "{} exported={} stopped={}",
            self.id,
            exported,
            self.tracer.is_shut_down()
        ));
    }
}

// ============================================================================
// Wiring Tests
// ============================================================================

#[test]
fn test_tracing_enabled_wires_hook_tracer_and_listener() {
    let (mut runtime, _exporter) = traced_runtime("svc", 2);

    let decision = runtime.start().expect("start should succeed");

    assert_eq!(
        decision,
        GateDecision::Enabled {
            service_name: "svc".to_string()
        }
    );
    let registry = runtime.registry();
    assert!(registry.contains::<TracingContextConfiguration>(Capability::ContextConfiguration));
    assert!(registry.contains::<RuntimeNamingConfiguration>(Capability::ContextConfiguration));
    assert_eq!(registry.count(Capability::ContextConfiguration), 2);
    assert_eq!(registry.count(Capability::Tracer), 1);
    assert!(runtime.context().has_listener::<TracingLogListener>());
    assert_eq!(runtime.context().listeners().len(), 1);
    assert_eq!(runtime.state(), State::Started);
}

#[test]
fn test_tracing_disabled_wires_nothing() {
    let (provider, _exporter) = in_memory_provider();
    let mut runtime = IntegrationRuntime::builder(tracegate::service_info!())
        .tracing(TracingConfig::disabled())
        .tracer_provider(provider)
        .build()
        .unwrap();

    let decision = runtime.start().unwrap();

    assert_eq!(decision, GateDecision::Disabled);
    let registry = runtime.registry();
    assert!(!registry.contains::<TracingContextConfiguration>(Capability::ContextConfiguration));
    assert_eq!(registry.count(Capability::ContextConfiguration), 1);
    assert_eq!(registry.count(Capability::Tracer), 0);
    assert!(!runtime.context().has_listener::<TracingLogListener>());
}

#[test]
fn test_repeated_start_registers_nothing_twice() {
    let (mut runtime, _exporter) = traced_runtime("svc", 2);

    for _ in 0..3 {
        runtime.start().unwrap();
    }

    assert_eq!(runtime.registry().count(Capability::ContextConfiguration), 2);
    assert_eq!(runtime.registry().count(Capability::Tracer), 1);
    assert_eq!(runtime.context().listeners().len(), 1);
}

#[test]
fn test_enabled_without_service_name_fails_at_startup() {
    let (provider, _exporter) = in_memory_provider();
    let mut runtime = IntegrationRuntime::builder(tracegate::service_info!())
        .tracing(TracingConfig {
            enabled: true,
            service: ServiceSettings { name: None },
            exporter: ExporterSettings::default(),
        })
        .tracer_provider(provider)
        .build()
        .unwrap();

    let err = runtime.start().unwrap_err();

    assert!(matches!(err, tracegate::Error::Configuration { .. }));
    assert_eq!(runtime.registry().count(Capability::Tracer), 0);
    assert!(runtime.context().listeners().is_empty());
    assert_eq!(runtime.state(), State::Stopped);
}

#[test]
fn test_hook_registered_without_tracer_aborts_startup() {
    let mut runtime = IntegrationRuntime::builder(tracegate::service_info!())
        .hook(Arc::new(TracingContextConfiguration::new("svc")))
        .build()
        .unwrap();

    let err = runtime.start().unwrap_err();

    assert!(matches!(err, tracegate::Error::Configuration { .. }));
    assert!(runtime.context().listeners().is_empty());
    assert_eq!(runtime.state(), State::Stopped);
}

#[test]
fn test_before_start_twice_attaches_listener_once() {
    let (provider, _exporter) = in_memory_provider();
    let mut registry = Registry::new();
    tracegate::gate::apply(&TracingConfig::enabled_for("svc"), &mut registry, &provider).unwrap();
    let mut context = RuntimeContext::new("ctx");

    for hook in registry.hooks() {
        hook.before_start(&mut context, &registry).unwrap();
        hook.before_start(&mut context, &registry).unwrap();
    }

    let tracing_listeners = context
        .listeners()
        .iter()
        .filter(|l| l.component_id() == TracingLogListener::ID)
        .count();
    assert_eq!(tracing_listeners, 1);
}

#[test]
fn test_builder_listeners_are_attached_on_start() {
    let (provider, _exporter) = in_memory_provider();
    let tracer = provider.get_tracer("side").unwrap();
    let mut runtime = IntegrationRuntime::builder(tracegate::service_info!())
        .listener(Arc::new(TracingLogListener::new(tracer)))
        .tracer_provider(provider)
        .build()
        .unwrap();

    runtime.start().unwrap();

    assert_eq!(runtime.registry().count(Capability::ExchangeListener), 1);
    assert!(runtime.context().has_listener::<TracingLogListener>());
}

// ============================================================================
// Span Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_exchanges_each_get_one_span() {
    let (mut runtime, exporter) = traced_runtime("svc", 8);
    runtime.start().unwrap();

    let exchanges: Vec<_> = (0..64)
        .map(|i| Exchange::with_id(format!("ID-{i}"), format!("route-{i}"), format!("{i}")))
        .collect();
    let results = runtime.dispatch(exchanges, Arc::new(Echo)).await;

    assert_eq!(results.len(), 64);
    assert!(results.iter().all(|(_, result)| result.is_ok()));

    let spans = exporter.get_finished_spans().unwrap();
    assert_eq!(spans.len(), 64);

    let mut per_exchange: HashMap<String, usize> = HashMap::new();
    for span in &spans {
        let id = attribute(span, EXCHANGE_ID).expect("exchange id attribute");
        let route = attribute(span, ROUTE_ID).expect("route id attribute");
        let n = id.trim_start_matches("ID-");
        assert_eq!(route, format!("route-{n}"));
        assert_eq!(span.name, route);
        let message = &span.events.events[0];
        assert_eq!(
            message.attributes[0].value.to_string(),
            format!("echo {n}")
        );
        *per_exchange.entry(id).or_default() += 1;
    }
    assert_eq!(per_exchange.len(), 64);
    assert!(per_exchange.values().all(|&count| count == 1));

    let tracer = runtime.registry().tracer("svc").unwrap();
    assert_eq!(tracer.stats().opened, 64);
    assert_eq!(tracer.stats().closed, 64);
}

#[tokio::test]
async fn test_failed_exchanges_still_close_their_spans() {
    let (mut runtime, exporter) = traced_runtime("svc", 2);
    runtime.start().unwrap();

    let exchanges = vec![
        Exchange::with_id("ID-ok", "orders", "ok"),
        Exchange::with_id("ID-fail", "orders", "fail"),
    ];
    let results = runtime.dispatch(exchanges, Arc::new(Picky)).await;

    let failed: Vec<_> = results
        .iter()
        .filter(|(_, result)| result.is_err())
        .map(|(exchange, _)| exchange.id())
        .collect();
    assert_eq!(failed, ["ID-fail"]);

    let spans = exporter.get_finished_spans().unwrap();
    assert_eq!(spans.len(), 2);
    let failed_span = spans
        .iter()
        .find(|span| attribute(span, EXCHANGE_ID).as_deref() == Some("ID-fail"))
        .unwrap();
    assert_eq!(
        attribute(failed_span, tracegate::tracer::EXCHANGE_STATUS).as_deref(),
        Some("failed")
    );
}

#[tokio::test]
async fn test_cancelled_exchange_closes_its_span() {
    let (mut runtime, exporter) = traced_runtime("svc", 1);
    runtime.start().unwrap();

    let mut exchange = Exchange::with_id("ID-stuck", "orders", "");
    let outcome = tokio::time::timeout(
        Duration::from_millis(20),
        runtime.context().process(&mut exchange, &Stuck),
    )
    .await;
    assert!(outcome.is_err(), "processing should have been cancelled");

    let tracer = runtime.registry().tracer("svc").unwrap();
    assert_eq!(tracer.stats().opened, 1);
    assert_eq!(tracer.stats().closed, 1);
    let spans = exporter.get_finished_spans().unwrap();
    assert_eq!(
        attribute(&spans[0], tracegate::tracer::EXCHANGE_STATUS).as_deref(),
        Some("cancelled")
    );
}

#[tokio::test]
async fn test_exchanges_after_shutdown_are_processed_untraced() {
    let (mut runtime, exporter) = traced_runtime("svc", 2);
    runtime.start().unwrap();
    let tracer = runtime.registry().tracer("svc").unwrap();
    let listener = Arc::clone(&runtime.context().listeners()[0]);

    runtime.shutdown();
    assert_eq!(runtime.state(), State::Stopped);
    assert!(tracer.is_shut_down());
    assert!(runtime.context().listeners().is_empty());

    // a listener that outlives shutdown must not break processing
    let mut context = RuntimeContext::new("late");
    context.add_listener(listener);
    let mut exchange = Exchange::with_id("ID-late", "orders", "x");
    context.process(&mut exchange, &Echo).await.unwrap();

    assert_eq!(exchange.messages(), ["echo x"]);
    assert_eq!(tracer.stats().opened, 0);
    assert!(exporter.get_finished_spans().unwrap().is_empty());
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

#[tokio::test]
async fn test_restart_after_shutdown_traces_with_a_fresh_tracer() {
    let (mut runtime, exporter) = traced_runtime("svc", 2);
    runtime.start().unwrap();
    let first = runtime.registry().tracer("svc").unwrap();

    runtime.shutdown();
    assert!(first.is_shut_down());
    assert_eq!(runtime.registry().count(Capability::Tracer), 0);

    let decision = runtime.start().unwrap();
    assert!(matches!(decision, GateDecision::Enabled { .. }));
    assert_eq!(runtime.registry().count(Capability::Tracer), 1);
    assert_eq!(runtime.registry().count(Capability::ContextConfiguration), 2);
    assert_eq!(runtime.context().listeners().len(), 1);

    let second = runtime.registry().tracer("svc").unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert!(!second.is_shut_down());

    let exchanges = vec![
        Exchange::with_id("ID-r1", "orders", "a"),
        Exchange::with_id("ID-r2", "orders", "b"),
    ];
    let results = runtime.dispatch(exchanges, Arc::new(Echo)).await;

    assert_eq!(results.len(), 2);
    assert_eq!(second.stats().opened, 2);
    assert_eq!(second.stats().closed, 2);
    assert_eq!(first.stats().opened, 0);
    assert_eq!(exporter.get_finished_spans().unwrap().len(), 2);
}

#[tokio::test]
async fn test_shutdown_runs_hooks_in_reverse_then_stops_tracers() {
    let exporter = InMemorySpanExporter::default();
    let pipeline_exporter = exporter.clone();
    let provider = TracerProvider::with_pipeline(&tracegate::service_info!(), move |resource| {
        Ok(SdkTracerProvider::builder()
            .with_resource(resource)
            .with_batch_exporter(pipeline_exporter.clone())
            .build())
    });
    let tracer = provider.get_tracer("svc").unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let recorder = |id| {
        Arc::new(ShutdownRecorder {
            id,
            log: Arc::clone(&log),
            tracer: Arc::clone(&tracer),
            exporter: exporter.clone(),
        })
    };
    let mut runtime = IntegrationRuntime::builder(tracegate::service_info!())
        .tracing(TracingConfig::enabled_for("svc"))
        .tracer_provider(provider)
        .hook(recorder("first"))
        .hook(recorder("second"))
        .build()
        .unwrap();
    runtime.start().unwrap();

    let hooks: Vec<_> = runtime
        .registry()
        .hooks()
        .iter()
        .map(|hook| hook.component_id().to_owned())
        .collect();
    assert_eq!(
        hooks,
        [
            RuntimeNamingConfiguration::ID,
            "first",
            "second",
            TracingContextConfiguration::ID
        ]
    );

    let exchanges = vec![Exchange::with_id("ID-s1", "orders", "x")];
    runtime.dispatch(exchanges, Arc::new(Echo)).await;

    runtime.shutdown();

    // the tracing hook runs first and flushes; the tracer is only stopped after every hook
    assert_eq!(
        *log.lock().unwrap(),
        ["second exported=1 stopped=false", "first exported=1 stopped=false"]
    );
    assert!(tracer.is_shut_down());
    assert!(runtime.context().listeners().is_empty());
    assert_eq!(runtime.registry().count(Capability::Tracer), 0);
}

// ============================================================================
// Config Tests
// ============================================================================

#[test]
fn test_settings_drive_the_runtime() {
    let settings: tracegate::config::Settings = tracegate::config::Sources::new()
        .toml(
            r#"
[runtime]
workers = 3

[tracing]
enabled = true

[tracing.service]
name = "from-config"
"#,
        )
        .load()
        .unwrap();
    let (provider, _exporter) = in_memory_provider();

    let mut runtime = IntegrationRuntime::builder(tracegate::service_info!())
        .tracing(settings.tracing)
        .workers(settings.runtime.workers)
        .tracer_provider(provider)
        .build()
        .unwrap();
    runtime.start().unwrap();

    assert_eq!(runtime.workers(), 3);
    assert!(runtime.registry().tracer("from-config").is_some());
}

#[test]
fn test_config_generation() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("tracegate.toml");

    tracegate::config::create_config_file::<tracegate::config::Settings>(&config_path)
        .expect("Failed to create config file");

    let content = std::fs::read_to_string(&config_path).expect("Failed to read config file");
    assert!(content.contains("[runtime]"), "Missing [runtime] section");
    assert!(content.contains("[tracing"), "Missing tracing section");
    assert!(content.contains("[telemetry"), "Missing telemetry section");
    assert!(content.contains("enabled"));
    assert!(content.contains("orders-integration"), "Missing example service name");
}

// ============================================================================
// ServiceInfo & Error Tests
// ============================================================================

#[test]
fn test_service_info_macro() {
    let info = tracegate::service_info!();

    assert_eq!(info.name, "tracegate");
    assert_eq!(info.name_in_metrics, "tracegate");
    assert!(!info.version.is_empty());
}

#[test]
fn test_error_display() {
    let err = tracegate::Error::ConfigFileWrite {
        path: std::path::PathBuf::from("/test/path"),
        source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "test error"),
    };
    assert!(err.to_string().contains("/test/path"));

    let err = tracegate::Error::Configuration {
        message: "tracing.service.name is missing".to_string(),
    };
    assert!(err.to_string().contains("tracing.service.name"));
}
