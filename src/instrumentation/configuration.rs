use std::any::Any;
use std::sync::{Arc, Mutex, PoisonError};

use snafu::OptionExt as _;

use crate::context::{ContextConfiguration, RuntimeContext};
use crate::instrumentation::TracingLogListener;
use crate::registry::{Component, Registry};
use crate::{ConfigurationSnafu, Error};

/// Startup hook that attaches the [`TracingLogListener`] to the runtime context.
///
/// The listener is created on the first startup pass and reused by later passes while its
/// tracer is still the registered one. Shutdown releases it, so a restart picks up the tracer
/// registered for the new pass.
#[derive(Debug)]
pub struct TracingContextConfiguration {
    service_name: String,
    listener: Mutex<Option<Arc<TracingLogListener>>>,
}

impl TracingContextConfiguration {
    /// Component id of every tracing hook.
    pub const ID: &'static str = "tracing-context-configuration";

    /// A hook for `service_name`. The tracer for that service must be registered before the
    /// runtime starts.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            listener: Mutex::new(None),
        }
    }

    /// The traced service.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// The listener, between `before_start` and `on_shutdown`.
    pub fn listener(&self) -> Option<Arc<TracingLogListener>> {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Component for TracingContextConfiguration {
    fn component_id(&self) -> &str {
        Self::ID
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl ContextConfiguration for TracingContextConfiguration {
    fn before_start(&self, context: &mut RuntimeContext, registry: &Registry) -> Result<(), Error> {
        let tracer = registry
            .tracer(&self.service_name)
            .with_context(|| ConfigurationSnafu {
                message: format!(
                    "no tracer registered for service {:?}; tracing hooks must be registered by the enablement gate",
                    self.service_name
                ),
            })?;

        let mut current = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
        let reusable = current
            .as_ref()
            .filter(|listener| Arc::ptr_eq(listener.tracer(), &tracer))
            .cloned();
        let listener = match reusable {
            Some(listener) => listener,
            None => {
                if current.is_some() {
                    context.remove_listener(TracingLogListener::ID);
                }
                let listener = Arc::new(TracingLogListener::new(tracer));
                *current = Some(Arc::clone(&listener));
                listener
            }
        };
        let registration = context.add_listener(listener);
        if registration.is_added() {
            tracing::debug!(service_name = %self.service_name, context = %context.name(), "tracing listener attached");
        }
        Ok(())
    }

    fn on_shutdown(&self) {
        let released = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(listener) = released {
            listener.tracer().flush();
        }
    }
}
