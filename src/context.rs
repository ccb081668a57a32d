//! # Runtime Context
//!
//! The live execution context of the integration runtime and the extension points around it:
//!
//! - [`ContextConfiguration`] hooks run during the single startup pass and at shutdown, and may
//!   reconfigure the context while it is still exclusively owned.
//! - [`ExchangeListener`]s are called for every exchange the context processes. A listener
//!   returns an [`ExchangeObserver`] that is completed with the exchange's [`Outcome`]. An
//!   observer that is dropped without being completed belongs to an exchange that never
//!   finished (its processing future was cancelled or panicked).
//! - [`Processor`]s hold the business logic.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use snafu::Snafu;

use crate::registry::{Component, ComponentSet, Registration, Registry};
use crate::Error;

static EXCHANGE_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// One unit of work flowing through a route.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Exchange {
    id: String,
    route_id: String,
    body: String,
    messages: Vec<String>,
}

impl Exchange {
    /// A new exchange for `route_id` with a generated correlation id (`ID-<n>`).
    pub fn new(route_id: impl Into<String>, body: impl Into<String>) -> Self {
        let sequence = EXCHANGE_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        Self::with_id(format!("ID-{sequence}"), route_id, body)
    }

    /// A new exchange with a caller supplied correlation id.
    pub fn with_id(
        id: impl Into<String>,
        route_id: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            route_id: route_id.into(),
            body: body.into(),
            messages: Vec::new(),
        }
    }

    /// Correlation id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Route the exchange belongs to.
    pub fn route_id(&self) -> &str {
        &self.route_id
    }

    /// Message payload.
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Replace the payload.
    pub fn set_body(&mut self, body: impl Into<String>) {
        self.body = body.into();
    }

    /// Append a log line to the exchange. Listeners see these when the exchange completes.
    pub fn log(&mut self, message: impl Into<String>) {
        self.messages.push(message.into());
    }

    /// Log lines in the order they were written.
    pub fn messages(&self) -> &[String] {
        &self.messages
    }
}

/// Why a processor did not complete an exchange.
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum ProcessError {
    /// The business logic failed.
    #[snafu(display("{message}"))]
    Failed {
        /// failure description
        message: String,
    },

    /// The exchange was aborted before it completed.
    #[snafu(display("exchange was cancelled"))]
    Cancelled,
}

impl ProcessError {
    /// A [`ProcessError::Failed`] with `message`.
    pub fn failed(message: impl Into<String>) -> Self {
        ProcessError::Failed {
            message: message.into(),
        }
    }
}

/// How an exchange finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome<'a> {
    /// The processor succeeded.
    Completed,
    /// The processor failed.
    Failed(&'a ProcessError),
    /// The exchange was aborted.
    Cancelled,
}

impl<'a> Outcome<'a> {
    /// The outcome matching a processor result.
    pub fn of(result: &'a Result<(), ProcessError>) -> Self {
        match result {
            Ok(()) => Outcome::Completed,
            Err(ProcessError::Cancelled) => Outcome::Cancelled,
            Err(err) => Outcome::Failed(err),
        }
    }
}

/// Business logic applied to an exchange.
pub trait Processor: Send + Sync {
    /// Process `exchange` in place.
    fn process(
        &self,
        exchange: &mut Exchange,
    ) -> impl Future<Output = Result<(), ProcessError>> + Send;
}

/// A startup/shutdown extension point of the runtime.
pub trait ContextConfiguration: Component {
    /// Called once per startup pass, before the context accepts exchanges.
    ///
    /// Startup passes can repeat within one process lifetime, so implementations must be
    /// idempotent.
    ///
    /// # Errors
    /// Any error aborts startup.
    fn before_start(&self, context: &mut RuntimeContext, registry: &Registry) -> Result<(), Error>;

    /// Called after every hook's `before_start` succeeded.
    ///
    /// # Errors
    /// Any error aborts startup.
    fn after_start(&self, _context: &RuntimeContext, _registry: &Registry) -> Result<(), Error> {
        Ok(())
    }

    /// Called when the runtime shuts down, in reverse registration order.
    fn on_shutdown(&self) {}
}

/// Receives every exchange processed by the context.
///
/// Listeners are shared by all workers and must not keep per-exchange state themselves; that
/// belongs in the returned observer.
pub trait ExchangeListener: Component {
    /// An exchange is about to be processed.
    fn on_exchange_event(&self, exchange: &Exchange) -> Box<dyn ExchangeObserver>;
}

/// Per-exchange state created by an [`ExchangeListener`].
pub trait ExchangeObserver: Send {
    /// The exchange finished with `outcome`.
    fn on_complete(self: Box<Self>, exchange: &Exchange, outcome: Outcome<'_>);
}

/// The live execution context: a name and the listeners attached to it.
pub struct RuntimeContext {
    name: String,
    listeners: ComponentSet<dyn ExchangeListener>,
}

impl RuntimeContext {
    /// An empty context called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            listeners: ComponentSet::default(),
        }
    }

    /// Context name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rename the context.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Attach a listener. A listener whose id is already attached is ignored.
    pub fn add_listener(&mut self, listener: Arc<dyn ExchangeListener>) -> Registration {
        let id = listener.component_id().to_owned();
        let registration = self.listeners.insert(listener);
        tracing::debug!(context = %self.name, listener = %id, ?registration, "listener attached");
        registration
    }

    /// Attached listeners in the order they were added.
    pub fn listeners(&self) -> &[Arc<dyn ExchangeListener>] {
        self.listeners.as_slice()
    }

    /// Whether a listener of concrete type `L` is attached.
    pub fn has_listener<L: Any>(&self) -> bool {
        self.listeners.contains_type::<L>()
    }

    /// Detach the listener with component id `id`.
    pub fn remove_listener(&mut self, id: &str) -> Option<Arc<dyn ExchangeListener>> {
        self.listeners.remove(id)
    }

    /// Detach every listener.
    pub fn clear_listeners(&mut self) {
        self.listeners.clear();
    }

    /// Run `exchange` through `processor`, notifying every listener.
    ///
    /// Each listener observes the exchange from before the processor runs until the result is
    /// known. If this future is dropped before completing, the observers are dropped with it.
    ///
    /// # Errors
    /// Returns the processor's error unchanged.
    pub async fn process<P>(&self, exchange: &mut Exchange, processor: &P) -> Result<(), ProcessError>
    where
        P: Processor,
    {
        let observers: Vec<_> = self
            .listeners
            .as_slice()
            .iter()
            .map(|listener| listener.on_exchange_event(exchange))
            .collect();

        let result = processor.process(exchange).await;

        let outcome = Outcome::of(&result);
        for observer in observers {
            observer.on_complete(exchange, outcome);
        }
        result
    }
}

impl fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners: Vec<_> = self
            .listeners
            .as_slice()
            .iter()
            .map(|l| l.component_id())
            .collect();
        f.debug_struct("RuntimeContext")
            .field("name", &self.name)
            .field("listeners", &listeners)
            .finish()
    }
}
