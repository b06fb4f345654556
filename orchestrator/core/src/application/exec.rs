// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! In-process entry point: configure, spawn, watch.

use std::path::Path;
use std::sync::{Arc, Weak};

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::application::orchestrator::{Orchestrator, OrchestratorError, SupervisorContext};
use crate::domain::config::{ConfigError, SupervisorConfig};
use crate::domain::protocol::BatchReport;
use crate::infrastructure::watcher::{ChangeWatcher, WatchError};

#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error("workers failed to start: {}", .0.join("; "))]
    Bootstrap(Vec<String>),
}

/// A running supervisor started by [`exec`].
pub struct SupervisorHandle {
    orchestrator: Arc<Orchestrator>,
    report: BatchReport,
    watcher: Option<JoinHandle<()>>,
}

impl SupervisorHandle {
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Outcome of the initial spawn.
    pub fn report(&self) -> &BatchReport {
        &self.report
    }

    pub fn socket_path(&self) -> &Path {
        self.orchestrator.socket_path()
    }

    /// Resolves once the last worker has been shut down.
    pub async fn wait_drained(&self) {
        self.orchestrator.drained().cancelled().await;
    }

    /// Stop every worker and close the control socket.
    pub async fn shutdown(mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        self.orchestrator.shutdown_all_best_effort().await;
    }
}

impl Drop for SupervisorHandle {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

/// Validate `config`, start its workers and, when `watch` is set, restart
/// them on file changes.
pub async fn exec(config: SupervisorConfig) -> Result<SupervisorHandle, ExecError> {
    let context = SupervisorContext::for_config(&config)?;
    exec_with(config, context).await
}

/// [`exec`] with explicit collaborators.
pub async fn exec_with(
    config: SupervisorConfig,
    context: SupervisorContext,
) -> Result<SupervisorHandle, ExecError> {
    config.validate()?;
    let instances = config.instances;
    let watch = config.watch.clone();

    let orchestrator = Orchestrator::new(config, context);
    let report = orchestrator.spawn(instances).await;
    if !report.ok {
        orchestrator.shutdown_all_best_effort().await;
        return Err(ExecError::Bootstrap(report.errors));
    }

    let watcher = if watch.is_empty() {
        None
    } else {
        match ChangeWatcher::new(&watch) {
            Ok(watcher) => Some(tokio::spawn(watch_loop(watcher, Arc::downgrade(&orchestrator)))),
            Err(e) => {
                orchestrator.shutdown_all_best_effort().await;
                return Err(e.into());
            }
        }
    };

    info!(
        "'{}' supervising {} workers on {:?}",
        orchestrator.name(),
        orchestrator.worker_count(),
        orchestrator.socket_path()
    );

    Ok(SupervisorHandle {
        orchestrator,
        report,
        watcher,
    })
}

async fn watch_loop(mut watcher: ChangeWatcher, orchestrator: Weak<Orchestrator>) {
    while let Some(paths) = watcher.changed().await {
        let Some(orchestrator) = orchestrator.upgrade() else {
            break;
        };
        if orchestrator.is_terminated() {
            break;
        }
        info!("{} watched paths changed, reloading", paths.len());
        let restarted = orchestrator.rolling_restart().await;
        if restarted < orchestrator.worker_count() {
            warn!(
                "Rolling restart of '{}' left {} workers behind",
                orchestrator.name(),
                orchestrator.worker_count() - restarted
            );
        }
    }
}
