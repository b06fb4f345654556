// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # herd CLI
//!
//! The `herd` binary starts supervisors and drives running ones.
//!
//! ## Architecture
//!
//! - **Supervisor mode**: `herd run` hosts an orchestrator in the foreground;
//!   `herd start` re-executes itself as `herd run` in the background
//! - **Client mode**: every other command discovers supervisors through the
//!   run directory and talks to them over their control sockets
//!
//! ## Commands
//!
//! - `herd start|run` - Launch a supervisor
//! - `herd list|state|scale|restart|stop` - Inspect and drive supervisors
//! - `herd clean` - Remove dead sockets and stale PID files

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

use herd_cli::commands::{self, RestartArgs, ScaleArgs, StartArgs, StateArgs, StopArgs};

/// herd - keep processes alive and under control
#[derive(Parser)]
#[command(name = "herd")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Directory holding control sockets and PID files
    #[arg(long, global = true, env = "HERD_RUN_DIR", value_name = "DIR")]
    run_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "HERD_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Serve Prometheus metrics on this address
    #[arg(long, global = true, env = "HERD_METRICS_ADDR", value_name = "ADDR")]
    metrics_addr: Option<SocketAddr>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a supervisor in the background
    Start(StartArgs),

    /// Run a supervisor in the foreground (config from HERD_CONFIG)
    #[command(hide = true)]
    Run,

    /// List running supervisors and their workers
    List,

    /// Show or update worker state
    State(StateArgs),

    /// Set the number of workers
    Scale(ScaleArgs),

    /// Restart workers
    Restart(RestartArgs),

    /// Stop workers, or the whole supervisor
    Stop(StopArgs),

    /// Remove dead sockets and stale PID files
    Clean,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    if let Some(addr) = cli.metrics_addr {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
    }

    let run_dir = cli.run_dir;
    match cli.command {
        Commands::Start(args) => commands::start::start(args, run_dir).await,
        Commands::Run => commands::start::run(run_dir).await,
        Commands::List => commands::control::list(run_dir).await,
        Commands::State(args) => commands::control::state(args, run_dir).await,
        Commands::Scale(args) => commands::control::scale(args, run_dir).await,
        Commands::Restart(args) => commands::control::restart(args, run_dir).await,
        Commands::Stop(args) => commands::control::stop(args, run_dir).await,
        Commands::Clean => commands::control::clean(run_dir).await,
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();

    Ok(())
}
