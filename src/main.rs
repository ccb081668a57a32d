use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracegate::cli::{CliParser, Invocation};
use tracegate::config::{Settings, ENV_PREFIX};
use tracegate::context::{Exchange, ProcessError, Processor};
use tracegate::runtime::IntegrationRuntime;

/// Runs sample exchanges through an integration runtime, tracing them when
/// `tracing.enabled` is set.
#[derive(Parser, Debug)]
struct Arguments {
    /// Number of sample exchanges to dispatch
    #[arg(short = 'n', long, default_value_t = 16)]
    exchanges: usize,
}

/// Uppercases the body. Bodies containing `fail` are rejected.
struct Uppercase;

impl Processor for Uppercase {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessError> {
        if exchange.body().contains("fail") {
            return Err(ProcessError::failed(format!(
                "refusing body of exchange {}",
                exchange.id()
            )));
        }
        let body = exchange.body().to_uppercase();
        exchange.log(format!("uppercased {} bytes", body.len()));
        exchange.set_body(body);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let service_info = tracegate::service_info!();
    let parser = CliParser::<Settings, Arguments>::new(&service_info, ENV_PREFIX);

    let cli = match parser.parse() {
        Ok(Invocation::Run(cli)) => cli,
        Ok(Invocation::Generated(path)) => {
            println!("Wrote sample configuration to {}", path.display());
            return ExitCode::SUCCESS;
        }
        Err(tracegate::cli::Error::ArgParse { source }) => source.exit(),
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let _telemetry = match tracegate::telemetry::init(&service_info, &cli.config.telemetry) {
        Ok(telemetry) => telemetry,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let runtime = IntegrationRuntime::builder(service_info)
        .tracing(cli.config.tracing)
        .workers(cli.config.runtime.workers)
        .build();
    let mut runtime = match runtime {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!(%err, "invalid runtime configuration");
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = runtime.start() {
        eprintln!("{err}");
        return ExitCode::FAILURE;
    }

    let exchanges = (0..cli.args.exchanges)
        .map(|i| {
            let body = if i % 5 == 4 { "please fail" } else { "hello" };
            Exchange::new(format!("route-{}", i % 3), body)
        })
        .collect();
    let results = runtime.dispatch(exchanges, Arc::new(Uppercase)).await;

    let failed = results.iter().filter(|(_, result)| result.is_err()).count();
    tracing::info!(
        processed = results.len(),
        failed,
        "dispatch finished"
    );

    runtime.shutdown();
    ExitCode::SUCCESS
}
