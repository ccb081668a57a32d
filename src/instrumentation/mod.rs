//! Tracing instrumentation for the runtime.
//!
//! [`TracingContextConfiguration`] is registered by the [`gate`](crate::gate) when tracing is
//! enabled. During startup it attaches a [`TracingLogListener`], which opens one span per
//! exchange through the service's [`TracerHandle`](crate::tracer::TracerHandle).

mod configuration;
mod listener;

pub use configuration::TracingContextConfiguration;
pub use listener::TracingLogListener;
