/*!
Tracegate wires distributed tracing into a message integration runtime, but only when
configuration asks for it.

A single flag, `tracing.enabled`, drives an enablement gate. When the flag is set the gate
registers one tracer bound to `tracing.service.name` and one tracing context-configuration
hook. During the runtime's startup pass that hook attaches a log listener to the live
[`context::RuntimeContext`], and from then on every exchange processed by the runtime produces
exactly one span. The span is closed on success, on failure and when the exchange is
cancelled.

It provides:
 * an explicit component [`registry::Registry`] that can be enumerated and counted
 * the [`gate`] that turns configuration into registrations
 * a memoized [`tracer::TracerProvider`] backed by opentelemetry (OTLP export optional)
 * the tracing hook and listener in [`instrumentation`]
 * an [`runtime::IntegrationRuntime`] that starts, dispatches exchanges on async workers and
   shuts down
 * command line parsing, config loading (via Figment & Doku) and process telemetry

### Starting a traced runtime

```rust,no_run
use std::sync::Arc;

use tracegate::context::{Exchange, ProcessError, Processor};
use tracegate::gate::TracingConfig;
use tracegate::runtime::IntegrationRuntime;

struct Echo;

impl Processor for Echo {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessError> {
        exchange.log(format!("echo {}", exchange.body()));
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let service_info = tracegate::service_info!();
    let tracing = TracingConfig::enabled_for("orders");

    let mut runtime = IntegrationRuntime::builder(service_info)
        .tracing(tracing)
        .workers(4)
        .build()?;
    runtime.start()?;

    let exchanges = vec![Exchange::new("orders-in", "{}")];
    let _results = runtime.dispatch(exchanges, Arc::new(Echo)).await;

    runtime.shutdown();
    Ok(())
}
```

### Configuration

```toml
[runtime]
workers = 8

[tracing]
enabled = true

[tracing.service]
name = "orders"

[tracing.exporter]
endpoint = "http://localhost:4317"
```

Any value can be overridden from the environment, replacing the dot (`.`) with double
underscores (`__`):
```sh
TRACEGATE_TRACING__ENABLED=false tracegate --config ./tracegate.toml
```
*/
#![deny(
    future_incompatible,
    deprecated_safe,
    rust_2018_compatibility,
    rust_2018_idioms,
    rust_2021_compatibility
)]
// Document ALL THE THINGS!
#![deny(missing_docs)]

pub mod cli;
pub mod config;
pub mod context;
pub mod gate;
pub mod instrumentation;
pub mod registry;
pub mod runtime;
pub mod telemetry;
pub mod tracer;

/// Boxed error used where a pluggable backend reports failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Startup, configuration and initialization errors.
///
/// Every variant is fatal: the runtime refuses to start rather than run with partial tracing
/// state. Per-exchange tracing problems are reported through [`tracer::TracingFailure`] and
/// never surface here.
#[derive(Debug, snafu::Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// The tracing configuration is inconsistent, e.g. enabled without a service name.
    #[snafu(display("Invalid tracing configuration: {message}"))]
    Configuration {
        /// What is wrong with the configuration
        message: String,
    },

    /// The tracing backend could not be set up while tracing is required.
    #[snafu(display("Could not initialize the tracer for service {service_name:?}: {source}"))]
    Initialization {
        /// service the tracer was requested for
        service_name: String,
        /// the backend error
        source: BoxError,
    },

    /// The runtime context is still shared with running workers and cannot be reconfigured.
    #[snafu(display("The runtime context is in use by workers and cannot be started"))]
    ContextBusy,

    /// Figment could not extract a config from the file with env overrides
    #[snafu(display("Could not load application configuration: {source}"))]
    ConfigLoad {
        /// The source figment error
        source: Box<figment::Error>,
    },

    /// Writing to the config file was not possible
    #[snafu(display("Could not write to the config file at {path:?}: {source}"))]
    ConfigFileWrite {
        /// path where the config file was trying to be written to
        path: std::path::PathBuf,
        /// the IO error that occurred
        source: std::io::Error,
    },
}

/// Service information collected from the build.
#[derive(Clone, Debug, Default)]
pub struct ServiceInfo {
    /// The name of the service.
    pub name: &'static str,

    /// The service identifier as used in metrics.
    ///
    /// Usually the same as [`ServiceInfo::name`], with hyphens (`-`) replaced by underscores `_`.
    pub name_in_metrics: String,

    /// The version of the service.
    pub version: &'static str,

    /// Service author.
    pub author: &'static str,
    /// The description of the service.
    pub description: &'static str,
}

/**
Creates [`ServiceInfo`] from the information in `Cargo.toml` manifest of the service.

ServiceInfo names the runtime context, tags the tracer resource with `service.version` and
populates the CLI help.

```rust
let service_info = tracegate::service_info!();
assert_eq!(service_info.name, "tracegate");
```

[`ServiceInfo::name_in_metrics`] is the same as the package name, with hyphens (`-`) replaced
by underscores (`_`).
*/
#[macro_export]
macro_rules! service_info {
    () => {
        $crate::ServiceInfo {
            name: env!("CARGO_PKG_NAME"),
            name_in_metrics: env!("CARGO_PKG_NAME").replace("-", "_"),
            version: env!("CARGO_PKG_VERSION"),
            author: env!("CARGO_PKG_AUTHORS"),
            description: env!("CARGO_PKG_DESCRIPTION"),
        }
    };
}
