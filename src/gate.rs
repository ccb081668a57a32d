//! # Enablement Gate
//!
//! Turns the `[tracing]` configuration section into registrations. With tracing disabled
//! nothing is registered. With tracing enabled the gate registers exactly one tracer and one
//! [`TracingContextConfiguration`] for the configured service, and calling it again registers
//! nothing new.
//!
//! All validation and backend setup happens before the first registration, so a failing gate
//! leaves the registry untouched.

use std::sync::Arc;

use doku::Document;
use serde::{Deserialize, Serialize};
use snafu::OptionExt as _;

use crate::instrumentation::TracingContextConfiguration;
use crate::registry::Registry;
use crate::tracer::{ExporterSettings, TracerProvider};
use crate::{ConfigurationSnafu, Error};

/// Identity of the traced service.
#[derive(Clone, Debug, Default, Serialize, Deserialize, Document)]
pub struct ServiceSettings {
    /// Service name reported on every span. Required when tracing is enabled.
    #[doku(example = "orders-integration")]
    pub name: Option<String>,
}

/// The `[tracing]` configuration section.
#[derive(Clone, Debug, Default, Serialize, Deserialize, Document)]
pub struct TracingConfig {
    /// Turns tracing of exchanges on.
    #[serde(default)]
    #[doku(example = "false")]
    pub enabled: bool,

    /// Traced service identity.
    #[serde(default)]
    pub service: ServiceSettings,

    /// Span export settings.
    #[serde(default)]
    pub exporter: ExporterSettings,
}

impl TracingConfig {
    /// Tracing switched off.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Tracing switched on for `service_name`, exporting nowhere.
    pub fn enabled_for(service_name: impl Into<String>) -> Self {
        Self {
            enabled: true,
            service: ServiceSettings {
                name: Some(service_name.into()),
            },
            exporter: ExporterSettings::default(),
        }
    }

    /// The configured service name, trimmed. `None` when missing or blank.
    pub fn service_name(&self) -> Option<&str> {
        self.service
            .name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }
}

/// What the gate decided.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GateDecision {
    /// Tracing is off; nothing was registered.
    Disabled,
    /// Tracing is on for `service_name`.
    Enabled {
        /// the traced service
        service_name: String,
    },
}

/// Register the tracing components `config` asks for.
///
/// # Errors
/// - `Configuration` if tracing is enabled without a service name.
/// - `Initialization` if the tracer backend cannot be built.
pub fn apply(
    config: &TracingConfig,
    registry: &mut Registry,
    provider: &TracerProvider,
) -> Result<GateDecision, Error> {
    if !config.enabled {
        tracing::debug!("tracing disabled");
        return Ok(GateDecision::Disabled);
    }

    let service_name = config.service_name().context(ConfigurationSnafu {
        message: "tracing.enabled is true but tracing.service.name is missing or blank",
    })?;
    let tracer = provider.get_tracer(service_name)?;

    let tracer_registration = registry.register_tracer(tracer);
    let hook_registration =
        registry.register_hook(Arc::new(TracingContextConfiguration::new(service_name)));
    tracing::info!(
        service_name,
        tracer = ?tracer_registration,
        hook = ?hook_registration,
        "tracing enabled"
    );

    Ok(GateDecision::Enabled {
        service_name: service_name.to_owned(),
    })
}
