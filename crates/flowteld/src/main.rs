//! flowteld entry point.
//!
//! Loads the configuration, starts the collector, the rule manager and
//! their listeners, and runs until SIGINT.

use anyhow::Context;
use clap::Parser;
use flowteld::{Daemon, FlowtelConfig, DEFAULT_CONFIG_PATH};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Flow telemetry collector and switch manager
#[derive(Parser, Debug)]
#[command(name = "flowteld")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Start in-process simulated switches
    #[arg(long)]
    simulate: bool,

    /// Number of simulated switches
    #[arg(long, default_value = "3", requires = "simulate")]
    simulated_switches: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level)?;

    info!("flowteld: Starting flow telemetry daemon");

    let config = FlowtelConfig::load_or_default(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let daemon = Daemon::bind(config).await.context("starting daemon")?;

    if args.simulate {
        daemon
            .start_simulation(args.simulated_switches)
            .await
            .context("starting simulated switches")?;
    }

    match daemon.run(shutdown_signal()).await {
        Ok(()) => {
            info!("flowteld: Daemon exiting normally");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "flowteld: Daemon exiting with error");
            Err(e.into())
        }
    }
}

/// Initialize structured logging
fn init_logging(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("invalid log level {:?}", level))?;

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("failed to set logger")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "flowteld: Failed to listen for SIGINT");
        std::future::pending::<()>().await;
    }
    info!("flowteld: Received SIGINT, shutting down");
}
