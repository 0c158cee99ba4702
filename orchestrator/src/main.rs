//! risectl entry point

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{debug, error};

use risectl::commands;
use risectl::config::DEFAULT_CONFIG_FILE;
use risectl::logs::{init_logging, LogLevel, LogOptions};
use risectl::utils::version_info;

#[derive(Parser)]
#[command(
    name = "risectl",
    version,
    about = "Deployment orchestrator for containerized web services"
)]
struct Cli {
    /// Path to the environment spec file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE, env = "RISECTL_SPEC")]
    spec: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "RISECTL_LOG")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show what apply would change, without changing anything
    Plan,

    /// Converge live infrastructure onto the spec
    Apply {
        /// Write minted deployer credentials to this file instead of stdout
        #[arg(long)]
        credentials_out: Option<PathBuf>,
    },

    /// Tear down everything the spec manages, dependents first
    Destroy,

    /// Build the container image and push it to the app repository
    Release {
        /// Build context directory
        #[arg(long, default_value = ".")]
        context: PathBuf,

        /// Source revision override; defaults to git HEAD of the context
        #[arg(long, env = "RISECTL_SOURCE_REVISION")]
        revision: Option<String>,

        /// Registry URI override; defaults to the applied repository
        #[arg(long, env = "RISECTL_REGISTRY_URI")]
        registry: Option<String>,
    },

    /// Point the service at a released image and watch the rollout
    Deploy {
        /// Image tag; defaults to the last released tag
        #[arg(long)]
        tag: Option<String>,

        /// Start the rollout without waiting for it to stabilize
        #[arg(long)]
        no_wait: bool,
    },

    /// Show live resources, service health, and the public endpoint
    Status {
        /// Issue one HTTP request against the endpoint
        #[arg(long)]
        probe: bool,
    },

    /// List recorded releases and deployments
    History,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level: LogLevel = match cli.log_level.parse() {
        Ok(level) => level,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = init_logging(LogOptions {
        log_level,
        stderr: true,
        json_format: cli.log_json,
    }) {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    let version = version_info();
    debug!("risectl {} ({}, built {})", version.version, version.git_hash, version.build_time);

    let result = match cli.command {
        Command::Plan => commands::plan::run(&cli.spec).await,
        Command::Apply { credentials_out } => {
            commands::apply::run(&cli.spec, credentials_out.as_deref()).await
        }
        Command::Destroy => commands::destroy::run(&cli.spec).await,
        Command::Release { context, revision, registry } => {
            commands::release::run(&cli.spec, &context, revision, registry).await
        }
        Command::Deploy { tag, no_wait } => commands::deploy::run(&cli.spec, tag, no_wait).await,
        Command::Status { probe } => commands::status::run(&cli.spec, probe).await,
        Command::History => commands::history::run(&cli.spec).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
