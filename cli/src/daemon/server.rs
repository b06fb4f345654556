// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Foreground supervisor host
//!
//! Runs an orchestrator until its last worker is shut down over the control
//! socket, until the process receives SIGINT/SIGTERM, or until any thread
//! panics. The last two stop every worker before returning.

use std::future::Future;

use anyhow::{Context, Result};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use herd_core::{exec, SupervisorConfig, SupervisorHandle};

pub async fn run_supervisor(config: SupervisorConfig) -> Result<()> {
    let fatal = install_panic_guard();
    let name = config.name.clone();
    let handle = exec(config)
        .await
        .with_context(|| format!("Failed to start supervisor '{}'", name))?;

    info!(
        "Supervisor '{}' running (PID: {}, socket: {:?})",
        name,
        std::process::id(),
        handle.socket_path()
    );

    host(handle, &name, fatal, shutdown_signal()).await
}

enum Exit {
    Drained,
    Signal,
    Fatal,
}

async fn host(
    handle: SupervisorHandle,
    name: &str,
    fatal: CancellationToken,
    signal: impl Future<Output = ()>,
) -> Result<()> {
    let exit = tokio::select! {
        _ = handle.wait_drained() => Exit::Drained,
        _ = signal => Exit::Signal,
        _ = fatal.cancelled() => Exit::Fatal,
    };

    match exit {
        Exit::Drained => {
            info!("Supervisor '{}' shutting down", name);
            Ok(())
        }
        Exit::Signal => {
            info!("Signal received, stopping '{}'", name);
            handle.shutdown().await;
            Ok(())
        }
        Exit::Fatal => {
            error!("Fatal error in supervisor '{}', stopping all workers", name);
            handle.shutdown().await;
            anyhow::bail!("Supervisor '{}' stopped after a fatal error", name)
        }
    }
}

/// Chain a panic hook that cancels the returned token after the default
/// report is printed.
fn install_panic_guard() -> CancellationToken {
    let fatal = CancellationToken::new();
    let trigger = fatal.clone();
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        previous(info);
        trigger.cancel();
    }));
    fatal
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn start(dir: &std::path::Path) -> SupervisorHandle {
        let entry = dir.join("svc.sh");
        std::fs::write(&entry, "trap 'exit 0' TERM\nwhile true; do sleep 1; done\n").unwrap();
        let config = SupervisorConfig::new(&entry)
            .with_interpreter("sh")
            .with_run_dir(dir.join("run"))
            .with_kill_timeout(Duration::from_secs(2));
        exec(config).await.unwrap()
    }

    #[test]
    fn test_panic_guard_fires_on_any_thread() {
        let fatal = install_panic_guard();
        let joined = std::thread::spawn(|| panic!("boom")).join();
        assert!(joined.is_err());
        assert!(fatal.is_cancelled());
    }

    #[tokio::test]
    async fn test_fatal_error_stops_workers_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let handle = start(dir.path()).await;
        let socket = handle.socket_path().to_path_buf();
        let pid_file = dir.path().join("run").join("svc.1.pid");
        assert!(socket.exists());
        assert!(pid_file.exists());

        let fatal = CancellationToken::new();
        fatal.cancel();
        let result = host(handle, "svc", fatal, std::future::pending()).await;

        assert!(result.is_err());
        assert!(!socket.exists());
        assert!(!pid_file.exists());
    }

    #[tokio::test]
    async fn test_signal_stops_workers_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let handle = start(dir.path()).await;
        let socket = handle.socket_path().to_path_buf();

        let result = host(handle, "svc", CancellationToken::new(), async {}).await;

        assert!(result.is_ok());
        assert!(!socket.exists());
    }
}
