//! Command line argument and config file tools.
//!
//! [`Cli`] merges an application's own clap arguments with two options of its own:
//!
//! - `--config <file>` loads the settings `C` from a TOML file plus environment overrides.
//! - `--generate <file>` writes a documented sample configuration for `C` instead.

use std::ffi::OsString;
use std::marker::PhantomData;
use std::path::PathBuf;

use clap::{Arg, ArgAction, Command, FromArgMatches as _, Parser};
use serde::Deserialize;
use snafu::{ResultExt as _, Snafu};

use crate::config::Sources;
use crate::ServiceInfo;

const GENERATE_CONFIG_OPT_ID: &str = "generate";
const USE_CONFIG_OPT_ID: &str = "config";

/// Command line errors.
#[derive(Debug, Snafu)]
pub enum Error {
    /// Arguments did not parse, or help/version was requested.
    #[snafu(display("{source}"))]
    ArgParse {
        /// clap's error; call `exit()` on it to print the message clap intends
        source: clap::Error,
    },

    /// The configuration file could not be generated or loaded.
    #[snafu(display("{source}"))]
    Config {
        /// the configuration error
        source: crate::Error,
    },
}

/// Default generic argument for `Cli` to be used when you do not need custom CLI arguments.
#[derive(clap::Parser, Debug)]
pub struct NoArguments {}

/// What the command line asked for.
#[derive(Debug)]
pub enum Invocation<C, A = NoArguments> {
    /// Run with the loaded configuration.
    Run(Cli<C, A>),
    /// A sample configuration was written to this path; nothing else to do.
    Generated(PathBuf),
}

/// Parsed command line arguments and the configuration they point at.
#[derive(Debug)]
pub struct Cli<C, A = NoArguments> {
    /// parsed command line arguments
    pub args: A,

    /// parsed TOML config file with the structure of `C`
    pub config: C,
}

/// Parser for a service's command line.
pub struct CliParser<'a, C, A = NoArguments> {
    service_info: &'a ServiceInfo,
    env_prefix: String,
    _types: PhantomData<fn() -> (C, A)>,
}

impl<'a, C, A> CliParser<'a, C, A>
where
    A: Parser,
    C: for<'de> Deserialize<'de> + doku::Document,
{
    /// A parser for `service_info` reading overrides from variables starting with `env_prefix`.
    pub fn new(service_info: &'a ServiceInfo, env_prefix: impl Into<String>) -> Self {
        Self {
            service_info,
            env_prefix: env_prefix.into(),
            _types: PhantomData,
        }
    }

    fn command(&self) -> Command {
        let arg_command = A::command();

        Command::new(self.service_info.name)
            .version(self.service_info.version)
            .author(self.service_info.author)
            .about(
                arg_command
                    .get_about()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| self.service_info.description.to_owned()),
            )
            .args(arg_command.get_arguments())
            .arg(
                Arg::new(USE_CONFIG_OPT_ID)
                    .required_unless_present(GENERATE_CONFIG_OPT_ID)
                    .action(ArgAction::Set)
                    .long("config")
                    .short('c')
                    .help("Specifies the toml config file to run the service with"),
            )
            .arg(
                Arg::new(GENERATE_CONFIG_OPT_ID)
                    .action(ArgAction::Set)
                    .long("generate")
                    .short('g')
                    .help("Generates a new default toml config file for the service"),
            )
    }

    /// Parse the process arguments.
    ///
    /// # Errors
    /// See [`CliParser::parse_from`].
    pub fn parse(&self) -> Result<Invocation<C, A>, Error> {
        self.parse_from(std::env::args_os())
    }

    /// Parse `args`, whose first item is the program name.
    ///
    /// # Errors
    /// - `ArgParse` for invalid arguments and for `--help`/`--version`.
    /// - `Config` if the sample cannot be written or the configuration cannot be loaded.
    pub fn parse_from<I, T>(&self, args: I) -> Result<Invocation<C, A>, Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let mut arg_matches = self
            .command()
            .try_get_matches_from(args)
            .context(ArgParseSnafu)?;

        if let Some(path) = arg_matches.remove_one::<String>(GENERATE_CONFIG_OPT_ID) {
            let path = PathBuf::from(path);
            crate::config::create_config_file::<C>(&path).context(ConfigSnafu)?;
            return Ok(Invocation::Generated(path));
        }

        let args = A::from_arg_matches_mut(&mut arg_matches).context(ArgParseSnafu)?;

        // `required_unless_present` guarantees a config path at this point
        let config_path = arg_matches
            .remove_one::<String>(USE_CONFIG_OPT_ID)
            .unwrap_or_default();
        let config = Sources::new()
            .file(config_path)
            .env_prefix(self.env_prefix.as_str())
            .load()
            .context(ConfigSnafu)?;

        Ok(Invocation::Run(Cli { args, config }))
    }
}
