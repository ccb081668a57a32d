//! # Integration Runtime
//!
//! Owns the [`Registry`], the [`RuntimeContext`] and the [`TracerProvider`], and drives them
//! through their lifecycle:
//!
//! ```text
//! start:     enablement gate → registry listeners into the context
//!            → before_start on every hook → after_start on every hook
//! dispatch:  exchanges → bounded pool of tokio tasks → RuntimeContext::process
//! shutdown:  on_shutdown on every hook (reverse order) → detach listeners → stop and drop
//!            tracers
//! ```
//!
//! Startup is single-threaded and happens before any worker runs. A startup pass that fails
//! leaves no listeners attached to the context.

use std::any::Any;
use std::sync::Arc;

use snafu::OptionExt as _;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::context::{
    ContextConfiguration, Exchange, ExchangeListener, ProcessError, Processor, RuntimeContext,
};
use crate::gate::{self, GateDecision, TracingConfig};
use crate::registry::{Component, Registry};
use crate::tracer::TracerProvider;
use crate::{ConfigurationSnafu, ContextBusySnafu, Error, ServiceInfo};

/// Workers used when none are configured.
pub const DEFAULT_WORKERS: usize = 4;

/// The runtime's own startup hook. Names the context after the service.
#[derive(Debug)]
pub struct RuntimeNamingConfiguration {
    name: String,
}

impl RuntimeNamingConfiguration {
    /// Component id of the naming hook.
    pub const ID: &'static str = "runtime-naming-configuration";

    /// A hook naming the context `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Component for RuntimeNamingConfiguration {
    fn component_id(&self) -> &str {
        Self::ID
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl ContextConfiguration for RuntimeNamingConfiguration {
    fn before_start(&self, context: &mut RuntimeContext, _registry: &Registry) -> Result<(), Error> {
        context.set_name(self.name.as_str());
        Ok(())
    }
}

/// Lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Built, or shut down.
    Stopped,
    /// A startup pass completed.
    Started,
}

/// Builder for [`IntegrationRuntime`].
pub struct IntegrationRuntimeBuilder {
    service_info: ServiceInfo,
    tracing: TracingConfig,
    workers: usize,
    tracer_provider: Option<TracerProvider>,
    hooks: Vec<Arc<dyn ContextConfiguration>>,
    listeners: Vec<Arc<dyn ExchangeListener>>,
}

impl IntegrationRuntimeBuilder {
    /// Tracing configuration. Tracing is disabled unless this is set.
    pub fn tracing(mut self, tracing: TracingConfig) -> Self {
        self.tracing = tracing;
        self
    }

    /// Number of exchanges processed concurrently.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Tracer provider to use instead of the one described by the tracing configuration.
    pub fn tracer_provider(mut self, provider: TracerProvider) -> Self {
        self.tracer_provider = Some(provider);
        self
    }

    /// An additional startup hook.
    pub fn hook(mut self, hook: Arc<dyn ContextConfiguration>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// An additional listener, attached on startup.
    pub fn listener(mut self, listener: Arc<dyn ExchangeListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Build the runtime. Nothing is started yet.
    ///
    /// # Errors
    /// - `Configuration` if `workers` is zero.
    pub fn build(self) -> Result<IntegrationRuntime, Error> {
        if self.workers == 0 {
            return ConfigurationSnafu {
                message: "runtime.workers must be at least 1",
            }
            .fail();
        }

        let tracer_provider = self.tracer_provider.unwrap_or_else(|| {
            TracerProvider::from_settings(&self.service_info, &self.tracing.exporter)
        });

        let mut registry = Registry::new();
        registry.register_hook(Arc::new(RuntimeNamingConfiguration::new(
            self.service_info.name,
        )));
        for hook in self.hooks {
            registry.register_hook(hook);
        }
        for listener in self.listeners {
            registry.register_listener(listener);
        }

        Ok(IntegrationRuntime {
            context: Arc::new(RuntimeContext::new(self.service_info.name)),
            service_info: self.service_info,
            tracing: self.tracing,
            workers: self.workers,
            registry,
            tracer_provider,
            state: State::Stopped,
        })
    }
}

/// A message integration runtime with optional exchange tracing.
pub struct IntegrationRuntime {
    service_info: ServiceInfo,
    tracing: TracingConfig,
    workers: usize,
    registry: Registry,
    tracer_provider: TracerProvider,
    context: Arc<RuntimeContext>,
    state: State,
}

impl IntegrationRuntime {
    /// Start building a runtime for `service_info`.
    pub fn builder(service_info: ServiceInfo) -> IntegrationRuntimeBuilder {
        IntegrationRuntimeBuilder {
            service_info,
            tracing: TracingConfig::disabled(),
            workers: DEFAULT_WORKERS,
            tracer_provider: None,
            hooks: Vec::new(),
            listeners: Vec::new(),
        }
    }

    /// Run the enablement gate and the startup pass.
    ///
    /// Calling `start` again repeats the pass; hooks and the gate are idempotent, so nothing is
    /// registered twice.
    ///
    /// # Errors
    /// - `Configuration` or `Initialization` from the gate or a hook. No listener stays attached.
    /// - `ContextBusy` if exchanges are still being dispatched.
    pub fn start(&mut self) -> Result<GateDecision, Error> {
        let decision = gate::apply(&self.tracing, &mut self.registry, &self.tracer_provider)?;

        let context = Arc::get_mut(&mut self.context).context(ContextBusySnafu)?;
        if let Err(err) = Self::startup_pass(context, &self.registry) {
            context.clear_listeners();
            self.state = State::Stopped;
            tracing::error!(%err, "runtime startup failed");
            return Err(err);
        }

        self.state = State::Started;
        tracing::info!(
            context = %self.context.name(),
            version = self.service_info.version,
            listeners = self.context.listeners().len(),
            ?decision,
            "runtime started"
        );
        Ok(decision)
    }

    fn startup_pass(context: &mut RuntimeContext, registry: &Registry) -> Result<(), Error> {
        for listener in registry.listeners() {
            context.add_listener(Arc::clone(listener));
        }
        for hook in registry.hooks() {
            tracing::debug!(hook = hook.component_id(), "before start");
            hook.before_start(context, registry)?;
        }
        for hook in registry.hooks() {
            hook.after_start(context, registry)?;
        }
        Ok(())
    }

    /// Process `exchanges` concurrently, at most `workers` at a time.
    ///
    /// Returns every exchange with its result; the order follows completion, not submission.
    /// Exchanges whose task panicked are logged and omitted.
    pub async fn dispatch<P>(
        &self,
        exchanges: Vec<Exchange>,
        processor: Arc<P>,
    ) -> Vec<(Exchange, Result<(), ProcessError>)>
    where
        P: Processor + 'static,
    {
        if self.state != State::Started {
            tracing::warn!("dispatching exchanges on a runtime that has not been started");
        }

        let permits = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();
        for mut exchange in exchanges {
            let context = Arc::clone(&self.context);
            let processor = Arc::clone(&processor);
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let result = context.process(&mut exchange, processor.as_ref()).await;
                (exchange, result)
            });
        }

        let mut results = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(done) => results.push(done),
                Err(err) => tracing::error!(%err, "exchange task did not complete"),
            }
        }
        results
    }

    /// Shut down: hooks in reverse registration order, then listeners, then tracers.
    ///
    /// Stopped tracers are removed from the registry and from the provider, so a later
    /// [`IntegrationRuntime::start`] builds fresh ones. Errors from the tracing backend are
    /// logged.
    pub fn shutdown(&mut self) {
        for hook in self.registry.hooks().iter().rev() {
            hook.on_shutdown();
        }
        match Arc::get_mut(&mut self.context) {
            Some(context) => context.clear_listeners(),
            None => tracing::warn!("runtime context still in use during shutdown"),
        }
        for tracer in self.registry.take_tracers() {
            tracer.shutdown();
            self.tracer_provider.evict(tracer.service_name());
        }
        self.state = State::Stopped;
        tracing::info!("runtime stopped");
    }

    /// Lifecycle state.
    pub fn state(&self) -> State {
        self.state
    }

    /// The component registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The live execution context.
    pub fn context(&self) -> &RuntimeContext {
        &self.context
    }

    /// Configured worker count.
    pub fn workers(&self) -> usize {
        self.workers
    }
}

impl std::fmt::Debug for IntegrationRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrationRuntime")
            .field("service", &self.service_info.name)
            .field("workers", &self.workers)
            .field("state", &self.state)
            .field("registry", &self.registry)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}
