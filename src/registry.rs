//! # Runtime Registry
//!
//! The composition point of the runtime: a typed set per capability (context-configuration
//! hooks, exchange listeners, tracers), populated by explicit calls during startup and queried
//! by enumeration.
//!
//! Registration is idempotent. Every component has an id, and a second component with an id
//! that is already present is never stored; the caller is told so through
//! [`Registration::AlreadyPresent`].

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::context::{ContextConfiguration, ExchangeListener};
use crate::tracer::TracerHandle;

/// Something that can be registered with the runtime.
pub trait Component: Send + Sync + 'static {
    /// Identity used to reject duplicate registrations.
    fn component_id(&self) -> &str;

    /// Access to the concrete type, for enumeration by type.
    fn as_any(&self) -> &dyn Any;
}

/// The capability a component is registered under.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Startup/shutdown hooks, see [`ContextConfiguration`].
    ContextConfiguration,
    /// Per-exchange callbacks, see [`ExchangeListener`].
    ExchangeListener,
    /// Span-creation handles, see [`TracerHandle`].
    Tracer,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::ContextConfiguration => "context-configuration",
            Capability::ExchangeListener => "exchange-listener",
            Capability::Tracer => "tracer",
        };
        f.write_str(name)
    }
}

/// Result of a registration attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Registration {
    /// The component was stored.
    Added,
    /// A component with the same id was already registered; nothing changed.
    AlreadyPresent,
}

impl Registration {
    /// `true` when the component was newly stored.
    pub fn is_added(self) -> bool {
        self == Registration::Added
    }
}

/// An insertion-ordered set of components, unique by [`Component::component_id`].
pub struct ComponentSet<T: ?Sized> {
    items: Vec<Arc<T>>,
}

impl<T: ?Sized> Default for ComponentSet<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T> ComponentSet<T>
where
    T: Component + ?Sized,
{
    /// Store `item` unless a component with the same id is already present.
    pub fn insert(&mut self, item: Arc<T>) -> Registration {
        if self.get(item.component_id()).is_some() {
            return Registration::AlreadyPresent;
        }
        self.items.push(item);
        Registration::Added
    }

    /// Look up a component by id.
    pub fn get(&self, id: &str) -> Option<&Arc<T>> {
        self.items.iter().find(|item| item.component_id() == id)
    }

    /// Whether any member is of the concrete type `C`.
    pub fn contains_type<C: Any>(&self) -> bool {
        self.items.iter().any(|item| item.as_any().is::<C>())
    }

    /// Members in registration order.
    pub fn as_slice(&self) -> &[Arc<T>] {
        &self.items
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// `true` when there are no members.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Remove the member with `id`.
    pub fn remove(&mut self, id: &str) -> Option<Arc<T>> {
        let index = self.items.iter().position(|item| item.component_id() == id)?;
        Some(self.items.remove(index))
    }

    /// Remove every member.
    pub fn clear(&mut self) {
        self.items.clear();
    }
}

/// Typed registry of every component known to the runtime.
#[derive(Default)]
pub struct Registry {
    hooks: ComponentSet<dyn ContextConfiguration>,
    listeners: ComponentSet<dyn ExchangeListener>,
    tracers: ComponentSet<TracerHandle>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a context-configuration hook.
    pub fn register_hook(&mut self, hook: Arc<dyn ContextConfiguration>) -> Registration {
        let registration = self.hooks.insert(hook);
        tracing::trace!(capability = %Capability::ContextConfiguration, ?registration);
        registration
    }

    /// Register an exchange listener that the runtime attaches to its context on startup.
    pub fn register_listener(&mut self, listener: Arc<dyn ExchangeListener>) -> Registration {
        let registration = self.listeners.insert(listener);
        tracing::trace!(capability = %Capability::ExchangeListener, ?registration);
        registration
    }

    /// Register a tracer. Tracers are identified by their service name.
    pub fn register_tracer(&mut self, tracer: Arc<TracerHandle>) -> Registration {
        let registration = self.tracers.insert(tracer);
        tracing::trace!(capability = %Capability::Tracer, ?registration);
        registration
    }

    /// Hooks in registration order.
    pub fn hooks(&self) -> &[Arc<dyn ContextConfiguration>] {
        self.hooks.as_slice()
    }

    /// Listeners in registration order.
    pub fn listeners(&self) -> &[Arc<dyn ExchangeListener>] {
        self.listeners.as_slice()
    }

    /// Tracers in registration order.
    pub fn tracers(&self) -> &[Arc<TracerHandle>] {
        self.tracers.as_slice()
    }

    /// Remove and return every tracer, in registration order.
    pub fn take_tracers(&mut self) -> Vec<Arc<TracerHandle>> {
        std::mem::take(&mut self.tracers).items
    }

    /// The tracer registered for `service_name`, if any.
    pub fn tracer(&self, service_name: &str) -> Option<Arc<TracerHandle>> {
        self.tracers.get(service_name).cloned()
    }

    /// Number of components registered under `capability`.
    pub fn count(&self, capability: Capability) -> usize {
        match capability {
            Capability::ContextConfiguration => self.hooks.len(),
            Capability::ExchangeListener => self.listeners.len(),
            Capability::Tracer => self.tracers.len(),
        }
    }

    /// Whether a component of concrete type `C` is registered under `capability`.
    pub fn contains<C: Any>(&self, capability: Capability) -> bool {
        match capability {
            Capability::ContextConfiguration => self.hooks.contains_type::<C>(),
            Capability::ExchangeListener => self.listeners.contains_type::<C>(),
            Capability::Tracer => self.tracers.contains_type::<C>(),
        }
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn ids<T: Component + ?Sized>(set: &ComponentSet<T>) -> Vec<&str> {
            set.as_slice().iter().map(|item| item.component_id()).collect()
        }

        f.debug_struct("Registry")
            .field("hooks", &ids(&self.hooks))
            .field("listeners", &ids(&self.listeners))
            .field("tracers", &ids(&self.tracers))
            .finish()
    }
}
