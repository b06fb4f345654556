// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Master Orchestrator
//!
//! Owns every [`WorkerMonitor`] of one named supervisor and the control
//! socket other processes use to drive it.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** spawn-at-scale, scale up/down, broadcast restart, rolling
//!   restart, per-instance and full shutdown
//! - **Collaborators:** [`PidStore`], [`ControlServer`], [`EventBus`]
//!
//! ## Lifecycle
//!
//! The control socket is bound lazily by the first [`Orchestrator::spawn`].
//! Workers are kept sorted by instance number. When the last worker is shut
//! down the orchestrator closes its socket and cancels its `drained` token;
//! an orchestrator with zero workers does not linger.
//!
//! ## Events
//!
//! Monitors report on a single mpsc channel. A pump task logs each event and
//! republishes it on the [`EventBus`], where the hook runner and subscribed
//! control connections pick it up.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::hooks::HookRunner;
use crate::application::worker_monitor::{WorkerEnvelope, WorkerError, WorkerMonitor, WorkerOptions};
use crate::domain::config::{ConfigError, SupervisorConfig};
use crate::domain::events::{LifecycleEvent, WorkerEvent};
use crate::domain::protocol::{BatchReport, StateList};
use crate::domain::repository::{PidRecord, PidStore, PidStoreError};
use crate::domain::worker::{fields, InstanceNum};
use crate::infrastructure::control_channel::{ChannelError, ControlServer};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::paths::{ensure_run_dir, sanitize_key, socket_path};
use crate::infrastructure::pid_store::FilePidStore;
use crate::presentation::control::ControlDispatcher;

/// A full rolling restart is spread over this window regardless of fleet size.
pub const ROLLING_RESTART_WINDOW: Duration = Duration::from_millis(2000);

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("run directory error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    PidStore(#[from] PidStoreError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("supervisor has shut down")]
    Terminated,
}

/// Process-level collaborators handed to an orchestrator at construction.
#[derive(Clone)]
pub struct SupervisorContext {
    pub run_dir: PathBuf,
    pub pid_store: Arc<dyn PidStore>,
}

impl SupervisorContext {
    pub fn new(run_dir: impl Into<PathBuf>, pid_store: Arc<dyn PidStore>) -> Self {
        Self {
            run_dir: run_dir.into(),
            pid_store,
        }
    }

    /// Resolve the run directory from `config` and store PID records there.
    pub fn for_config(config: &SupervisorConfig) -> Result<Self, OrchestratorError> {
        let run_dir = config.resolve_run_dir()?;
        let pid_store = Arc::new(FilePidStore::new(&run_dir));
        Ok(Self::new(run_dir, pid_store))
    }
}

pub struct Orchestrator {
    config: SupervisorConfig,
    key: String,
    run_dir: PathBuf,
    socket_path: PathBuf,
    options: Arc<WorkerOptions>,
    template: Map<String, Value>,
    pid_store: Arc<dyn PidStore>,
    workers: parking_lot::Mutex<Vec<Arc<WorkerMonitor>>>,
    server: tokio::sync::Mutex<Option<ControlServer>>,
    events_tx: mpsc::UnboundedSender<WorkerEnvelope>,
    event_bus: EventBus,
    drained: CancellationToken,
    muted: Arc<AtomicBool>,
    terminated: AtomicBool,
    next_worker_id: AtomicU64,
    self_ref: Weak<Orchestrator>,
}

impl Orchestrator {
    /// Build an orchestrator. Must be called inside a Tokio runtime; no
    /// worker is started and no socket is bound yet.
    pub fn new(config: SupervisorConfig, context: SupervisorContext) -> Arc<Self> {
        let key = sanitize_key(&config.name);
        let socket_path = socket_path(&context.run_dir, &key);
        let options = Arc::new(WorkerOptions::from_config(&config));
        let template = config.to_data();
        let event_bus = EventBus::with_default_capacity();
        let muted = Arc::new(AtomicBool::new(false));

        if !config.hooks.is_empty() {
            HookRunner::new(config.name.clone(), config.hooks.clone()).spawn(event_bus.subscribe());
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump_events(
            config.name.clone(),
            events_rx,
            event_bus.clone(),
            muted.clone(),
        ));

        Arc::new_cyclic(|self_ref| Self {
            config,
            key,
            run_dir: context.run_dir,
            socket_path,
            options,
            template,
            pid_store: context.pid_store,
            workers: parking_lot::Mutex::new(Vec::new()),
            server: tokio::sync::Mutex::new(None),
            events_tx,
            event_bus,
            drained: CancellationToken::new(),
            muted,
            terminated: AtomicBool::new(false),
            next_worker_id: AtomicU64::new(1),
            self_ref: self_ref.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Cancelled once the last worker is gone and the socket is closed.
    pub fn drained(&self) -> CancellationToken {
        self.drained.clone()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Instance numbers in ascending order.
    pub fn instance_nums(&self) -> Vec<InstanceNum> {
        self.workers
            .lock()
            .iter()
            .filter_map(|w| w.instance_num())
            .collect()
    }

    /// Start `count` new workers concurrently. Never fails as a whole; each
    /// worker's bootstrap error lands in `errors`.
    pub async fn spawn(&self, count: usize) -> BatchReport {
        if count == 0 {
            return BatchReport {
                ok: true,
                added: Some(Vec::new()),
                ..BatchReport::default()
            };
        }
        if let Err(e) = self.ensure_server().await {
            error!("Cannot spawn workers for '{}': {}", self.name(), e);
            return BatchReport::failed(vec![e.to_string()]);
        }

        let monitors: Vec<_> = (0..count).map(|_| self.new_monitor()).collect();
        let results = join_all(monitors.into_iter().map(|m| self.bootstrap(m))).await;

        let mut added = Vec::new();
        let mut errors = Vec::new();
        for result in results {
            match result {
                Ok(snapshot) => added.push(snapshot),
                Err(e) => {
                    warn!("Worker of '{}' failed to start: {}", self.name(), e);
                    errors.push(e.to_string());
                }
            }
        }

        BatchReport {
            ok: added.len() > errors.len(),
            errors,
            added: Some(added),
            removed: None,
        }
    }

    /// Converge on `target` workers. Scale-down removes the highest
    /// instance numbers first.
    pub async fn scale(&self, target: usize) -> BatchReport {
        let descending: Vec<InstanceNum> = self.instance_nums().into_iter().rev().collect();
        let current = descending.len();
        if target > current {
            return self.spawn(target - current).await;
        }
        if target == current {
            debug!("'{}' already runs {} workers", self.name(), current);
            return BatchReport {
                ok: true,
                ..BatchReport::default()
            };
        }
        let victims: Vec<InstanceNum> = descending.into_iter().take(current - target).collect();

        info!(
            "Scaling '{}' down by {} (instances {:?})",
            self.name(),
            victims.len(),
            victims
        );
        let results = join_all(victims.iter().map(|n| self.shut_down_instance(*n))).await;

        let mut removed = Vec::new();
        let mut errors = Vec::new();
        for (n, result) in victims.into_iter().zip(results) {
            match result {
                Ok(()) => removed.push(Value::from(n)),
                Err(e) => errors.push(format!("instance {}: {}", n, e)),
            }
        }

        BatchReport {
            ok: errors.is_empty(),
            errors,
            added: None,
            removed: Some(removed),
        }
    }

    /// Merge `new_state` into the selected workers (all when `instance_num`
    /// is `None`) and return their snapshots.
    pub fn state(
        &self,
        new_state: Option<&Map<String, Value>>,
        instance_num: Option<InstanceNum>,
    ) -> StateList {
        let workers = self.select(instance_num);
        if let Some(patch) = new_state {
            for worker in &workers {
                worker.merge_data(patch);
            }
        }
        StateList {
            state_list: workers.iter().map(|w| w.to_json()).collect(),
        }
    }

    /// Restart all workers concurrently, or just one. Returns how many
    /// restarted; an unknown instance affects zero.
    pub async fn restart(&self, instance_num: Option<InstanceNum>) -> usize {
        let workers = self.select(instance_num);
        if workers.is_empty() {
            if let Some(n) = instance_num {
                info!("No instance {} of '{}' to restart", n, self.name());
            }
            return 0;
        }

        let results = join_all(workers.iter().map(|w| self.restart_worker(w))).await;
        results.into_iter().filter(|ok| *ok).count()
    }

    /// Restart workers one after another, pausing `2s / N` between them so
    /// at most one is down at a time.
    pub async fn rolling_restart(&self) -> usize {
        let workers = self.select(None);
        let total = workers.len();
        if total == 0 {
            return 0;
        }
        let pause = ROLLING_RESTART_WINDOW / total as u32;
        info!("Rolling restart of {} workers of '{}'", total, self.name());

        let mut restarted = 0;
        for (i, worker) in workers.iter().enumerate() {
            if self.restart_worker(worker).await {
                restarted += 1;
            }
            if i + 1 < total {
                tokio::time::sleep(pause).await;
            }
        }
        restarted
    }

    /// Shut one instance down, or all of them. Shutting down an instance that
    /// no longer exists is a no-op.
    pub async fn shut_down(&self, instance_num: Option<InstanceNum>) -> Result<(), OrchestratorError> {
        if let Some(n) = instance_num {
            return self.shut_down_instance(n).await;
        }

        let all = self.instance_nums();
        if all.is_empty() {
            self.terminate().await;
            return Ok(());
        }
        let results = join_all(all.iter().map(|n| self.shut_down_instance(*n))).await;
        results.into_iter().collect::<Result<Vec<_>, _>>().map(|_| ())
    }

    /// Host-signal path: silence child output, stop everything, never fail.
    pub async fn shutdown_all_best_effort(&self) {
        self.muted.store(true, Ordering::SeqCst);
        if let Err(e) = self.shut_down(None).await {
            debug!("Ignoring shutdown error for '{}': {}", self.name(), e);
        }
        self.terminate().await;
    }

    fn new_monitor(&self) -> Arc<WorkerMonitor> {
        let id = self.next_worker_id.fetch_add(1, Ordering::SeqCst);
        WorkerMonitor::new(
            id,
            self.options.clone(),
            self.template.clone(),
            self.events_tx.clone(),
        )
    }

    /// Reserve the next instance number, then launch. The number is assigned
    /// before the child starts so its first SPAWN/START already carry it.
    async fn bootstrap(&self, monitor: Arc<WorkerMonitor>) -> Result<Value, OrchestratorError> {
        let instance_num = {
            let mut workers = self.workers.lock();
            let n = workers
                .iter()
                .filter_map(|w| w.instance_num())
                .max()
                .unwrap_or(0)
                + 1;
            monitor.assign(n, &self.derived_fields(n));
            let at = workers.partition_point(|w| w.instance_num() < Some(n));
            workers.insert(at, monitor.clone());
            metrics::gauge!("herd_workers").set(workers.len() as f64);
            n
        };

        if let Err(e) = monitor.start().await {
            let mut workers = self.workers.lock();
            workers.retain(|w| !Arc::ptr_eq(w, &monitor));
            metrics::gauge!("herd_workers").set(workers.len() as f64);
            return Err(e.into());
        }

        self.persist(&monitor, instance_num).await;
        info!("Started {}:{} (pid {:?})", self.name(), instance_num, monitor.child_pid());
        Ok(monitor.to_json())
    }

    async fn restart_worker(&self, worker: &Arc<WorkerMonitor>) -> bool {
        match worker.restart().await {
            Ok(_) => {
                if let Some(n) = worker.instance_num() {
                    self.persist(worker, n).await;
                }
                true
            }
            Err(e) => {
                warn!("Restart of worker {} of '{}' failed: {}", worker.id(), self.name(), e);
                false
            }
        }
    }

    async fn shut_down_instance(&self, n: InstanceNum) -> Result<(), OrchestratorError> {
        let monitor = self
            .workers
            .lock()
            .iter()
            .find(|w| w.instance_num() == Some(n))
            .cloned();
        let Some(monitor) = monitor else {
            info!("Instance {} of '{}' is already gone", n, self.name());
            return Ok(());
        };

        monitor.stop().await;
        let removed = self.pid_store.remove(&self.key, n).await;

        let now_empty = {
            let mut workers = self.workers.lock();
            workers.retain(|w| !Arc::ptr_eq(w, &monitor));
            metrics::gauge!("herd_workers").set(workers.len() as f64);
            workers.is_empty()
        };
        info!("Stopped {}:{}", self.name(), n);

        if now_empty {
            self.terminate().await;
        }
        removed.map_err(Into::into)
    }

    async fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(server) = self.server.lock().await.take() {
            server.close().await;
        }
        info!("'{}' has no workers left, closing", self.name());
        self.drained.cancel();
    }

    async fn ensure_server(&self) -> Result<(), OrchestratorError> {
        let mut server = self.server.lock().await;
        if self.is_terminated() {
            return Err(OrchestratorError::Terminated);
        }
        if server.is_some() {
            return Ok(());
        }
        ensure_run_dir(&self.run_dir)?;
        let handler = Arc::new(ControlDispatcher::new(self.self_ref.clone()));
        *server = Some(ControlServer::bind(&self.socket_path, handler, self.event_bus.clone()).await?);
        Ok(())
    }

    async fn persist(&self, monitor: &WorkerMonitor, instance_num: InstanceNum) {
        let record = PidRecord {
            key: self.key.clone(),
            instance_num,
            pid: std::process::id(),
            child_pid: monitor.child_pid(),
            socket_path: self.socket_path.clone(),
            started_at: Utc::now(),
        };
        if let Err(e) = self.pid_store.write(&record).await {
            warn!("Failed to persist pid record for {}:{}: {}", self.name(), instance_num, e);
        }
    }

    fn derived_fields(&self, n: InstanceNum) -> Map<String, Value> {
        let mut derived = Map::new();
        derived.insert(fields::INSTANCE_NUM.into(), Value::from(n));
        derived.insert(
            fields::PID_FILE.into(),
            Value::from(self.pid_store.record_path(&self.key, n).to_string_lossy().into_owned()),
        );
        derived.insert(
            fields::SOCKET_PATH.into(),
            Value::from(self.socket_path.to_string_lossy().into_owned()),
        );
        derived.insert(
            fields::DISPLAY_NAME.into(),
            Value::from(format!("{}:{}", self.name(), n)),
        );
        derived
    }

    fn select(&self, instance_num: Option<InstanceNum>) -> Vec<Arc<WorkerMonitor>> {
        let workers = self.workers.lock();
        match instance_num {
            Some(n) => workers
                .iter()
                .filter(|w| w.instance_num() == Some(n))
                .cloned()
                .collect(),
            None => workers.clone(),
        }
    }
}

async fn pump_events(
    name: String,
    mut rx: mpsc::UnboundedReceiver<WorkerEnvelope>,
    bus: EventBus,
    muted: Arc<AtomicBool>,
) {
    while let Some(envelope) = rx.recv().await {
        let label = match envelope.instance_num {
            Some(n) => format!("{}:{}", name, n),
            None => format!("{}#{}", name, envelope.worker_id),
        };
        let quiet = muted.load(Ordering::Relaxed);

        match &envelope.event {
            WorkerEvent::Stdout { line } if !quiet => info!(worker = %label, "{}", line),
            WorkerEvent::Stderr { line } if !quiet => warn!(worker = %label, "{}", line),
            WorkerEvent::Stdout { .. } | WorkerEvent::Stderr { .. } => {}
            WorkerEvent::Crash {
                exit_code,
                signal,
                crashes,
            } => warn!(
                worker = %label,
                "CRASH #{} (code {:?}, signal {:?})",
                crashes, exit_code, signal
            ),
            WorkerEvent::Sleep { crashes } => warn!(
                worker = %label,
                "SLEEP after {} crashes, not respawning", crashes
            ),
            WorkerEvent::Warn { message } => warn!(worker = %label, "{}", message),
            other => debug!(worker = %label, "{}", other.kind()),
        }

        bus.publish(LifecycleEvent {
            name: name.clone(),
            instance_num: envelope.instance_num,
            event: envelope.event,
            at: Utc::now(),
        });
    }
}
