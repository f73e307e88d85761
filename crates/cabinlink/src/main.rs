//! cabinlink -- long-running edge agent that bridges a cabin's
//! home-automation hub to the cloud portal: electricity metrics, camera
//! rosters, config backups, remote commands, and camera streaming.

use std::path::PathBuf;

use clap::Parser;
use miette::Diagnostic;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use cabinlink_config::{ConfigError, load_options, options_path};
use cabinlink_core::{Agent, AgentError};

#[derive(Debug, Parser)]
#[command(
    name = "cabinlink",
    version,
    about = "Cabin edge agent: syncs sensors and cameras to the portal and executes remote commands"
)]
struct Cli {
    /// Path to the options file (defaults to the platform config dir)
    #[arg(long, short = 'c', env = "CABINLINK_OPTIONS")]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Error, Diagnostic)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("signal handler failed")]
    Signal(#[from] std::io::Error),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(err) = run(cli).await {
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(1);
    }
}

fn init_tracing(verbosity: u8) {
    let filter = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let path = cli.config.unwrap_or_else(options_path);
    tracing::debug!(path = %path.display(), "loading options");
    let options = load_options(&path)?;

    let agent = Agent::new(options)?;
    agent.start().await?;

    shutdown_signal().await?;
    tracing::info!("shutdown signal received");
    agent.shutdown().await;
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
