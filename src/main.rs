/*!
`ecs-deploy` performs a single release action against Amazon ECS.

Currently implemented:
* registering a new task definition from a template, with the image tag injected into
  container definitions
* running configured one-off tasks against the new definition, treating an empty launch
  result as failure
* updating configured services and EventBridge targets to the new definition
* deregistering active definitions beyond a retention count
* rolling services and event targets back to the previous active definition
* dumping the parsed configuration for inspection
* best-effort SNS notifications after control plane calls

Configuration comes from:
* command-line parameters, for the config path, region, and subcommand
* a TOML deployment config holding the task definition template, service/task/target
  specs, retention count, and notification topic
*/

mod client;
mod config;
mod notify;
mod orchestrator;

use clap::Parser;
use client::AwsControlPlane;
use config::DeployConfig;
use orchestrator::Orchestrator;
use simplelog::{CombinedLogger, Config as LogConfig, ConfigBuilder, LevelFilter, SimpleLogger};
use snafu::ResultExt;
use std::path::PathBuf;
use std::process;
use tokio::runtime::Runtime;

fn run() -> Result<()> {
    // Parse and store the args passed to the program
    let args = Args::parse();

    // SimpleLogger will send errors to stderr and anything less to stdout.
    // To reduce verbosity of messages related to the AWS SDK for Rust we need
    // to spin up two loggers, setting different levels for each. This allows
    // us to retain the mixed logging of stdout/stderr in simplelog.
    match args.log_level {
        LevelFilter::Info => {
            CombinedLogger::init(vec![
                SimpleLogger::new(
                    LevelFilter::Info,
                    ConfigBuilder::new()
                        .add_filter_ignore_str("aws_config")
                        .add_filter_ignore_str("aws_credential_types")
                        .add_filter_ignore_str("aws_smithy")
                        .add_filter_ignore_str("tracing::span")
                        .build(),
                ),
                SimpleLogger::new(
                    LevelFilter::Warn,
                    ConfigBuilder::new()
                        .add_filter_allow_str("aws_config")
                        .add_filter_allow_str("aws_credential_types")
                        .add_filter_allow_str("aws_smithy")
                        .add_filter_allow_str("tracing::span")
                        .build(),
                ),
            ])
            .context(error::LoggerSnafu)?;
        }
        _ => {
            SimpleLogger::init(args.log_level, LogConfig::default()).context(error::LoggerSnafu)?
        }
    }

    let config =
        DeployConfig::from_path(&args.deploy_config_path).context(error::ConfigSnafu)?;

    match args.subcommand {
        SubCommands::Deploy(ref deploy_args) => {
            let rt = Runtime::new().context(error::RuntimeSnafu)?;
            rt.block_on(async {
                let plane = AwsControlPlane::new(args.region.clone()).await;
                let mut orchestrator = Orchestrator::new(config, Box::new(plane));
                orchestrator
                    .deploy(&deploy_args.image_tag)
                    .await
                    .context(error::DeploySnafu)
            })
        }
        SubCommands::Rollback => {
            let rt = Runtime::new().context(error::RuntimeSnafu)?;
            rt.block_on(async {
                let plane = AwsControlPlane::new(args.region.clone()).await;
                let mut orchestrator = Orchestrator::new(config, Box::new(plane));
                orchestrator.rollback().await.context(error::RollbackSnafu)
            })
        }
        SubCommands::Debug => {
            // Pure introspection; no clients are built and no calls are made.
            let dump = config.dump().context(error::ConfigSnafu)?;
            println!("{}", dump);
            Ok(())
        }
    }
}

fn main() {
    if let Err(e) = run() {
        eprintln!("{}", e);
        process::exit(1);
    }
}

/// Registers ECS task definitions and updates the services, tasks, and event targets that use
/// them
#[derive(Debug, Parser)]
pub struct Args {
    #[arg(global = true, long, default_value = "INFO")]
    /// How much detail to log; from least to most: ERROR, WARN, INFO, DEBUG, TRACE
    log_level: LevelFilter,

    #[arg(long)]
    /// Path to the deployment config TOML (NOTE: must be specified before subcommand)
    deploy_config_path: PathBuf,

    #[arg(global = true, long)]
    /// Region to call; defaults to the SDK's region provider chain
    region: Option<String>,

    #[command(subcommand)]
    subcommand: SubCommands,
}

#[derive(Debug, Parser)]
enum SubCommands {
    /// Register a new task definition using `image_tag` and update the configured services,
    /// event targets, and one-off tasks
    Deploy(DeployArgs),

    /// Deactivate the current task definition and roll services and event targets back to the
    /// previous active definition
    Rollback,

    /// Dump the parsed deployment config as JSON
    Debug,
}

#[derive(Debug, Parser)]
struct DeployArgs {
    /// Image tag to use for updating task container definitions
    image_tag: String,
}

mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub(super) enum Error {
        #[snafu(display("Error reading deployment config: {}", source))]
        Config { source: crate::config::Error },

        #[snafu(display("Failed to deploy: {}", source))]
        Deploy {
            source: crate::orchestrator::Error,
        },

        #[snafu(display("Logger setup error: {}", source))]
        Logger { source: log::SetLoggerError },

        #[snafu(display("Failed to roll back: {}", source))]
        Rollback {
            source: crate::orchestrator::Error,
        },

        #[snafu(display("Failed to create async runtime: {}", source))]
        Runtime { source: std::io::Error },
    }
}
type Result<T> = std::result::Result<T, error::Error>;
