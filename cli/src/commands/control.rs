// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Commands that drive running supervisors
//!
//! Commands: list, state, scale, restart, stop, clean

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;
use colored::Colorize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

use crate::daemon::format_duration;
use herd_core::domain::config::default_run_dir;
use herd_core::domain::worker::fields;
use herd_core::infrastructure::paths::sanitize_key;
use herd_sdk::{Connection, ConnectionOptions};

#[derive(Args, Debug)]
pub struct StateArgs {
    /// Supervisor name or key
    pub name: String,

    /// Only this worker
    #[arg(short, long)]
    pub instance: Option<u32>,

    /// Merge KEY=VALUE into worker state (VALUE parsed as JSON when possible)
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_assignment)]
    pub set: Vec<(String, Value)>,
}

#[derive(Args, Debug)]
pub struct ScaleArgs {
    /// Supervisor name or key
    pub name: String,

    /// Desired number of workers
    pub count: usize,
}

#[derive(Args, Debug)]
pub struct RestartArgs {
    /// Supervisor name or key
    pub name: String,

    /// Only this worker
    #[arg(short, long)]
    pub instance: Option<u32>,
}

#[derive(Args, Debug)]
pub struct StopArgs {
    /// Supervisor name or key
    pub name: String,

    /// Only this worker; the supervisor exits after its last one
    #[arg(short, long)]
    pub instance: Option<u32>,
}

fn resolve(run_dir: Option<PathBuf>) -> Result<PathBuf> {
    match run_dir {
        Some(dir) => Ok(dir),
        None => default_run_dir().context("Failed to resolve run directory"),
    }
}

/// Match by worker name first, then by socket key.
async fn find(run_dir: &Path, name: &str) -> Result<Connection> {
    let options = ConnectionOptions::default().keep_alive(true);
    let mut found = Connection::get_by_name(run_dir, name, options.clone()).await?;
    if found.is_empty() {
        found = Connection::get_by_key(run_dir, &sanitize_key(name), options).await?;
    }
    let mut found = found.into_iter();
    let Some(connection) = found.next() else {
        anyhow::bail!("No running supervisor named '{}' in {}", name, run_dir.display());
    };
    for mut extra in found {
        extra.close().await;
    }
    Ok(connection)
}

pub async fn list(run_dir: Option<PathBuf>) -> Result<()> {
    let run_dir = resolve(run_dir)?;
    let mut connections = Connection::get_all(&run_dir, ConnectionOptions::default().keep_alive(true)).await?;

    if connections.is_empty() {
        println!("{}", "No supervisors running".yellow());
        return Ok(());
    }

    println!(
        "{:<20} {:<9} {:<8} {:<10} {:<8} {}",
        "NAME", "INSTANCE", "PID", "STATUS", "CRASHES", "UPTIME"
    );

    for connection in connections.iter_mut() {
        let workers = match connection.get_state().await {
            Ok(workers) => workers,
            Err(e) => {
                println!("{:<20} {}", connection.key().bold(), format!("unreachable: {:#}", e).red());
                continue;
            }
        };

        for worker in &workers {
            let instance = worker.get(fields::INSTANCE_NUM).and_then(Value::as_u64);
            let monitor = worker.get(fields::MONITOR);
            let status = monitor
                .and_then(|m| m.get("status"))
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            let crashes = monitor
                .and_then(|m| m.get("crashes"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            let pid = worker
                .get(fields::PID)
                .and_then(Value::as_u64)
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string());
            let uptime = instance
                .and_then(|n| connection.records().iter().find(|r| u64::from(r.instance_num) == n))
                .map(|r| {
                    let secs = (Utc::now() - r.started_at).num_seconds().max(0) as u64;
                    format_duration(secs)
                })
                .unwrap_or_else(|| "-".to_string());

            let name = worker
                .get(fields::NAME)
                .and_then(Value::as_str)
                .unwrap_or(connection.key());

            println!(
                "{:<20} {:<9} {:<8} {:<10} {:<8} {}",
                name.bold(),
                instance.map(|n| n.to_string()).unwrap_or_else(|| "-".to_string()),
                pid,
                colour_status(status),
                crashes,
                uptime
            );
        }
        connection.close().await;
    }

    Ok(())
}

fn colour_status(status: &str) -> colored::ColoredString {
    match status {
        "running" => status.green(),
        "starting" => status.cyan(),
        "sleeping" | "crashed" => status.red(),
        _ => status.yellow(),
    }
}

pub async fn state(args: StateArgs, run_dir: Option<PathBuf>) -> Result<()> {
    let run_dir = resolve(run_dir)?;
    let mut connection = find(&run_dir, &args.name).await?;

    let patch: Map<String, Value> = args.set.into_iter().collect();
    let workers = match (args.instance, patch.is_empty()) {
        (Some(n), true) => connection.instance(n).get_state().await?.into_iter().collect(),
        (Some(n), false) => connection.instance(n).set_state(patch).await?.into_iter().collect(),
        (None, true) => connection.get_state().await?,
        (None, false) => connection.set_state(patch).await?,
    };
    connection.close().await;

    if workers.is_empty() {
        println!("{}", "No matching workers".yellow());
        return Ok(());
    }
    let output = serde_json::to_string_pretty(&workers).context("Failed to format state")?;
    println!("{}", output);
    Ok(())
}

pub async fn scale(args: ScaleArgs, run_dir: Option<PathBuf>) -> Result<()> {
    let run_dir = resolve(run_dir)?;
    let mut connection = find(&run_dir, &args.name).await?;
    let report = connection.scale(args.count).await?;
    connection.close().await;

    for error in &report.errors {
        println!("{}", format!("✗ {}", error).red());
    }
    if !report.ok {
        anyhow::bail!("Scaling '{}' to {} failed", args.name, args.count);
    }

    println!("{}", format!("✓ '{}' scaled to {}", args.name, args.count).green());
    if let Some(added) = report.added.as_ref().filter(|a| !a.is_empty()) {
        println!("  Added:   {}", added.len());
    }
    if let Some(removed) = report.removed.as_ref().filter(|r| !r.is_empty()) {
        println!("  Removed: {}", removed.len());
    }
    Ok(())
}

pub async fn restart(args: RestartArgs, run_dir: Option<PathBuf>) -> Result<()> {
    let run_dir = resolve(run_dir)?;
    let mut connection = find(&run_dir, &args.name).await?;

    let restarted = match args.instance {
        Some(n) => usize::from(connection.instance(n).restart().await?),
        None => connection.restart().await?,
    };
    connection.close().await;

    if restarted == 0 {
        println!("{}", "No matching workers".yellow());
    } else {
        println!("{}", format!("✓ Restarted {} worker(s) of '{}'", restarted, args.name).green());
    }
    Ok(())
}

pub async fn stop(args: StopArgs, run_dir: Option<PathBuf>) -> Result<()> {
    let run_dir = resolve(run_dir)?;
    let mut connection = find(&run_dir, &args.name).await?;

    match args.instance {
        Some(n) => {
            connection.instance(n).shut_down().await?;
            connection.close().await;
            println!("{}", format!("✓ Stopped instance {} of '{}'", n, args.name).green());
        }
        None => {
            connection.request_stop_server().await?;
            println!("{}", format!("✓ Stop requested for '{}'", args.name).green());
        }
    }
    Ok(())
}

pub async fn clean(run_dir: Option<PathBuf>) -> Result<()> {
    let run_dir = resolve(run_dir)?;
    let before = count_artifacts(&run_dir);
    let mut connections = Connection::get_all(&run_dir, ConnectionOptions::default()).await?;
    for connection in connections.iter_mut() {
        connection.close().await;
    }
    let after = count_artifacts(&run_dir);

    println!(
        "{}",
        format!(
            "✓ Removed {} stale file(s); {} supervisor(s) alive",
            before.saturating_sub(after),
            connections.len()
        )
        .green()
    );
    Ok(())
}

fn count_artifacts(run_dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(run_dir) else {
        return 0;
    };
    entries
        .filter_map(|e| e.ok())
        .filter(|e| {
            matches!(
                e.path().extension().and_then(|x| x.to_str()),
                Some("sock") | Some("pid")
            )
        })
        .count()
}

/// `KEY=VALUE`, with VALUE taken as JSON when it parses and as a string otherwise.
fn parse_assignment(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))?;
    if key.is_empty() {
        return Err(format!("empty key in '{}'", raw));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}
