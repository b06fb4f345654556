// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Supervisor process management
//!
//! Handles:
//! - Detaching a supervisor into the background
//! - Log file placement in the run directory
//! - Waiting for the control socket to come up

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

use herd_core::infrastructure::control_channel::probe;
use herd_core::infrastructure::paths::{ensure_run_dir, sanitize_key, socket_path};
use herd_core::{SupervisorConfig, CONFIG_ENV_VAR};

pub mod server;

const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// A supervisor launched by [`spawn_detached`].
#[derive(Debug, Clone)]
pub struct Detached {
    pub pid: u32,
    pub socket_path: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

/// Where a detached supervisor's own stdout/stderr go.
pub fn log_paths(run_dir: &Path, key: &str) -> (PathBuf, PathBuf) {
    (
        run_dir.join(format!("{}.out", key)),
        run_dir.join(format!("{}.err", key)),
    )
}

/// Re-exec this binary as `herd run` in its own process group and wait
/// until its control socket answers.
pub async fn spawn_detached(config: &SupervisorConfig) -> Result<Detached> {
    let run_dir = config
        .resolve_run_dir()
        .context("Failed to resolve run directory")?;
    ensure_run_dir(&run_dir).context("Failed to create run directory")?;

    let key = sanitize_key(&config.name);
    let socket = socket_path(&run_dir, &key);
    if probe(&socket).await {
        anyhow::bail!(
            "Supervisor '{}' is already running on {}",
            config.name,
            socket.display()
        );
    }

    // The child must agree on the run directory even if HERD_HOME differs.
    let config = config.clone().with_run_dir(&run_dir);
    let serialized = serde_json::to_string(&config).context("Failed to serialize configuration")?;

    let current_exe = std::env::current_exe().context("Failed to get current executable path")?;
    let mut cmd = std::process::Command::new(current_exe);
    cmd.arg("run").env(CONFIG_ENV_VAR, serialized);

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let (stdout_path, stderr_path) = log_paths(&run_dir, &key);
    let stdout_file = std::fs::File::create(&stdout_path).context("Failed to create stdout log file")?;
    let stderr_file = std::fs::File::create(&stderr_path).context("Failed to create stderr log file")?;

    cmd.stdin(std::process::Stdio::null())
        .stdout(stdout_file)
        .stderr(stderr_file);

    let mut child = cmd.spawn().context("Failed to spawn supervisor process")?;
    info!("Supervisor process spawned (PID: {})", child.id());

    let started = Instant::now();
    while started.elapsed() < STARTUP_TIMEOUT {
        if probe(&socket).await {
            return Ok(Detached {
                pid: child.id(),
                socket_path: socket,
                stdout: stdout_path,
                stderr: stderr_path,
            });
        }
        if let Some(status) = child.try_wait().context("Failed to poll supervisor process")? {
            anyhow::bail!(
                "Supervisor exited during startup ({}); see {}",
                status,
                stderr_path.display()
            );
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    anyhow::bail!(
        "Supervisor did not open {} within {:?}; see {}",
        socket.display(),
        STARTUP_TIMEOUT,
        stderr_path.display()
    )
}

pub fn format_duration(secs: u64) -> String {
    let days = secs / 86400;
    let hours = (secs % 86400) / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if days > 0 {
        format!("{}d {}h {}m", days, hours, minutes)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
