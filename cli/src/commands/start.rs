// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Supervisor launch commands
//!
//! Commands: start, run

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use std::path::PathBuf;
use tracing::info;

use crate::daemon::{self, server};
use herd_core::SupervisorConfig;

#[derive(Args, Debug, Default)]
pub struct StartArgs {
    /// Program or script to supervise
    pub entry: Option<PathBuf>,

    /// Supervisor config file (YAML or JSON)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Supervisor name (default: entry file stem)
    #[arg(short, long)]
    pub name: Option<String>,

    /// Number of workers
    #[arg(short, long)]
    pub instances: Option<usize>,

    /// Interpreter the entry is handed to (sh, node, python3, ...)
    #[arg(long)]
    pub interpreter: Option<String>,

    /// Respawns allowed before a crash-looping worker is put to sleep
    #[arg(long)]
    pub max_restarts: Option<u32>,

    /// Restart workers when these paths change
    #[arg(long, value_name = "PATH")]
    pub watch: Vec<PathBuf>,

    /// Stay attached instead of detaching
    #[arg(long)]
    pub foreground: bool,

    /// Arguments passed to the entry
    #[arg(last = true)]
    pub args: Vec<String>,
}

impl StartArgs {
    /// Merge the config file (if any) with command-line overrides.
    pub fn build_config(&self, run_dir: Option<PathBuf>) -> Result<SupervisorConfig> {
        let mut config = match (&self.config, &self.entry) {
            (Some(path), _) => SupervisorConfig::load(path)
                .with_context(|| format!("Failed to load {}", path.display()))?,
            (None, Some(entry)) => SupervisorConfig::new(entry),
            (None, None) => anyhow::bail!("Either an entry or --config is required"),
        };

        if let (Some(_), Some(entry)) = (&self.config, &self.entry) {
            config.entry = entry.clone();
        }
        if let Some(name) = &self.name {
            config = config.with_name(name.clone());
        }
        if let Some(instances) = self.instances {
            config = config.with_instances(instances);
        }
        if let Some(interpreter) = &self.interpreter {
            config = config.with_interpreter(interpreter.clone());
        }
        if let Some(max_restarts) = self.max_restarts {
            config = config.with_max_restarts(max_restarts);
        }
        for path in &self.watch {
            config = config.with_watch(path.clone());
        }
        if !self.args.is_empty() {
            config = config.with_args(self.args.iter().cloned());
        }
        if let Some(run_dir) = run_dir {
            config = config.with_run_dir(run_dir);
        }

        config.validate().context("Invalid supervisor configuration")?;
        Ok(config)
    }
}

pub async fn start(args: StartArgs, run_dir: Option<PathBuf>) -> Result<()> {
    let config = args.build_config(run_dir)?;

    if args.foreground {
        return server::run_supervisor(config).await;
    }

    info!("Starting '{}' in the background", config.name);
    let detached = daemon::spawn_detached(&config).await?;

    println!(
        "{}",
        format!(
            "✓ Supervisor '{}' started (PID: {}, {} workers)",
            config.name, detached.pid, config.instances
        )
        .green()
    );
    println!("  Socket: {}", detached.socket_path.display());
    println!("  Logs:   {}", detached.stdout.display());
    println!("Check status with: herd list");
    Ok(())
}

pub async fn run(run_dir: Option<PathBuf>) -> Result<()> {
    let mut config =
        SupervisorConfig::from_env().context("herd run expects its configuration in HERD_CONFIG")?;
    if let Some(run_dir) = run_dir {
        config = config.with_run_dir(run_dir);
    }
    server::run_supervisor(config).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_entry_defaults() {
        let args = StartArgs {
            entry: Some(PathBuf::from("/srv/app.sh")),
            instances: Some(3),
            interpreter: Some("sh".into()),
            args: vec!["--port".into(), "3010".into()],
            ..StartArgs::default()
        };
        let config = args.build_config(Some(PathBuf::from("/tmp/herd"))).unwrap();
        assert_eq!(config.name, "app");
        assert_eq!(config.instances, 3);
        assert_eq!(config.run_dir, Some(PathBuf::from("/tmp/herd")));
        let (program, argv) = config.command_line();
        assert_eq!(program, "sh");
        assert_eq!(argv, vec!["/srv/app.sh", "--port", "3010"]);
    }

    #[test]
    fn test_entry_or_config_required() {
        assert!(StartArgs::default().build_config(None).is_err());
    }

    #[test]
    fn test_zero_instances_rejected() {
        let args = StartArgs {
            entry: Some(PathBuf::from("app")),
            instances: Some(0),
            ..StartArgs::default()
        };
        assert!(args.build_config(None).is_err());
    }
}
