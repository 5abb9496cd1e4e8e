//! Command line interface of the `faasbench` binary.

use std::path::PathBuf;

use anyhow::Result;
use argh::FromArgs;

use crate::config::Config;
use crate::{observability, runner};

/// Cold start and load benchmarks for serverless functions.
#[derive(Debug, FromArgs)]
struct Args {
    /// path to the YAML configuration file
    #[argh(option, short = 'c')]
    pub config: Option<PathBuf>,

    #[argh(subcommand)]
    pub command: Command,
}

#[derive(Debug, FromArgs)]
#[argh(subcommand)]
enum Command {
    Run(RunCommand),
    Estimate(EstimateCommand),
    Validate(ValidateCommand),
    Version(VersionCommand),
}

/// benchmark all configured targets
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "run")]
struct RunCommand {}

/// estimate the cold start cost of a single endpoint
///
/// The endpoint is probed immediately, so it must have been idle for long enough.
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "estimate")]
struct EstimateCommand {
    /// URL of the endpoint
    #[argh(positional)]
    url: String,
}

/// validate the configuration and print the estimated duration
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "validate")]
struct ValidateCommand {}

/// print the faasbench version
#[derive(Default, Debug, FromArgs)]
#[argh(subcommand, name = "version")]
struct VersionCommand {}

/// Bootstrap the runtime and execute the CLI command.
pub fn execute() -> Result<()> {
    let args: Args = argh::from_env();

    // Special switch to just print the version and exit.
    if let Command::Version(_) = args.command {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = Config::load(args.config.as_deref())?;

    if let Command::Validate(ValidateCommand {}) = args.command {
        return runner::validate(&config);
    }

    // Sentry should be initialized before creating the async runtime.
    let _sentry_guard = observability::init_sentry(&config);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("main-rt")
        .enable_all()
        .worker_threads(config.runtime.worker_threads)
        .build()?;
    let _runtime_guard = runtime.enter();

    observability::init_tracing(&config);
    tracing::debug!(?config);

    let metrics_guard = observability::init_metrics(&config)?;

    let result = runtime.block_on(async move {
        match args.command {
            Command::Run(RunCommand {}) => runner::run(config).await,
            Command::Estimate(EstimateCommand { url }) => runner::estimate(config, &url).await,
            Command::Validate(_) | Command::Version(_) => Ok(()),
        }
    });

    // Flush metrics unconditionally before shutdown, even on error.
    runtime.block_on(async {
        if let Some(metrics_guard) = metrics_guard {
            metrics_guard.flush(None).await.ok();
        }
    });

    result
}
