//! # Configuration
//!
//! Settings are merged from, lowest precedence first:
//!
//! 1. serde defaults of the settings struct
//! 2. a TOML file
//! 3. environment variables with a prefix, nesting with `__`
//!    (`TRACEGATE_TRACING__SERVICE__NAME=orders`)
//!
//! After merging, string values of the form `${VAR}` or `$VAR` are replaced by the value of the
//! environment variable `VAR` when it is set.
//!
//! Loading is built on [figment](https://docs.rs/figment); [doku](https://docs.rs/doku) renders
//! a commented sample file from the settings types.

use std::path::{Path, PathBuf};

use doku::Document;
use figment::{
    providers::{Env, Format as _, Toml},
    value::{Dict, Map, Value},
    Figment, Metadata, Profile, Provider,
};
use serde::{Deserialize, Serialize};
use snafu::ResultExt as _;

use crate::gate::TracingConfig;
use crate::runtime::DEFAULT_WORKERS;
use crate::telemetry::TelemetrySettings;
use crate::{ConfigFileWriteSnafu, ConfigLoadSnafu, Error};

/// Environment prefix used by the `tracegate` binary.
pub const ENV_PREFIX: &str = "TRACEGATE_";

/// Runtime settings.
#[derive(Clone, Debug, Serialize, Deserialize, Document)]
pub struct RuntimeSettings {
    /// Number of exchanges processed concurrently
    #[doku(example = "4")]
    pub workers: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
        }
    }
}

/// Top level settings of the `tracegate` binary.
#[derive(Debug, Default, Serialize, Deserialize, Document)]
pub struct Settings {
    /// Integration runtime settings
    #[serde(default)]
    pub runtime: RuntimeSettings,

    /// Exchange tracing settings
    #[serde(default)]
    pub tracing: TracingConfig,

    /// Process logging and metrics settings
    #[serde(default)]
    pub telemetry: TelemetrySettings,
}

/// Resolve a `${VAR}` or `$VAR` placeholder.
///
/// Anything else, and placeholders naming unset variables, is returned unchanged.
///
/// ```
/// use tracegate::config::resolve_placeholder;
///
/// assert_eq!(resolve_placeholder("orders"), "orders");
/// assert_eq!(
///     resolve_placeholder("${TRACEGATE_DOC_UNSET_VARIABLE}"),
///     "${TRACEGATE_DOC_UNSET_VARIABLE}"
/// );
/// ```
pub fn resolve_placeholder(value: &str) -> String {
    let name = value
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
        .or_else(|| value.strip_prefix('$'));
    name.and_then(|name| std::env::var(name).ok())
        .unwrap_or_else(|| value.to_owned())
}

fn resolve_value(value: Value) -> Value {
    match value {
        Value::String(tag, s) => Value::String(tag, resolve_placeholder(&s)),
        Value::Dict(tag, dict) => Value::Dict(tag, resolve_dict(dict)),
        Value::Array(tag, items) => Value::Array(tag, items.into_iter().map(resolve_value).collect()),
        other => other,
    }
}

fn resolve_dict(dict: Dict) -> Dict {
    dict.into_iter().map(|(k, v)| (k, resolve_value(v))).collect()
}

/// Figment provider serving already-merged data with placeholders resolved.
struct Resolved {
    data: Map<Profile, Dict>,
}

impl Resolved {
    fn new(figment: &Figment) -> Result<Self, figment::Error> {
        let data = figment
            .data()?
            .into_iter()
            .map(|(profile, dict)| (profile, resolve_dict(dict)))
            .collect();
        Ok(Self { data })
    }
}

impl Provider for Resolved {
    fn metadata(&self) -> Metadata {
        Metadata::named("placeholder-resolver")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, figment::Error> {
        Ok(self.data.clone())
    }
}

/// Write a commented sample configuration for `C` to `config_path`.
///
/// # Errors
/// - `ConfigFileWrite` if the file cannot be written.
pub fn create_config_file<C>(config_path: impl Into<PathBuf>) -> Result<(), Error>
where
    C: doku::Document,
{
    let path = config_path.into();
    std::fs::write(&path, doku::to_toml::<C>()).context(ConfigFileWriteSnafu { path })?;
    Ok(())
}

/// Where settings are read from.
#[derive(Debug, Default, Clone)]
pub struct Sources {
    file: Option<PathBuf>,
    toml: Option<String>,
    env_prefix: Option<String>,
}

impl Sources {
    /// No sources; only serde defaults apply.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a TOML file. The file must exist.
    pub fn file(mut self, path: impl AsRef<Path>) -> Self {
        self.file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Read inline TOML, merged after the file.
    pub fn toml(mut self, toml: impl Into<String>) -> Self {
        self.toml = Some(toml.into());
        self
    }

    /// Read environment variables starting with `prefix`.
    pub fn env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = Some(prefix.into());
        self
    }

    fn figment(&self) -> Figment {
        let mut figment = Figment::new();
        if let Some(file) = &self.file {
            figment = figment.merge(Toml::file_exact(file));
        }
        if let Some(toml) = &self.toml {
            figment = figment.merge(Toml::string(toml));
        }
        if let Some(prefix) = &self.env_prefix {
            figment = figment.merge(Env::prefixed(prefix).split("__"));
        }
        figment
    }

    /// Merge every source and deserialize `C`.
    ///
    /// # Errors
    /// - `ConfigLoad` if a source cannot be read or the result does not fit `C`.
    pub fn load<C>(&self) -> Result<C, Error>
    where
        C: for<'de> Deserialize<'de>,
    {
        let resolved = Resolved::new(&self.figment())
            .map_err(Box::new)
            .context(ConfigLoadSnafu)?;
        Figment::from(resolved)
            .extract()
            .map_err(Box::new)
            .context(ConfigLoadSnafu)
    }
}
