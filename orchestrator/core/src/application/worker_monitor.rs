// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Worker Monitor
//!
//! Owns exactly one supervised child process slot.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Spawn, crash detection, bounded respawn, explicit
//!   restart/stop, lifecycle event emission
//!
//! Each run of a monitor is a background supervise task that launches the
//! child, waits for it to exit, and decides whether to respawn:
//!
//! ```text
//! starting ──▶ running ──exit──▶ crashed ──budget left──▶ starting
//!                 │                  │
//!                 │                  └──budget spent──▶ sleeping
//!                 └──stop()──▶ stopped
//! ```
//!
//! Events go to a single consumer (the orchestrator) over an unbounded
//! channel; the monitor knows nothing about its siblings.

use std::collections::BTreeMap;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::config::{StdioMode, SupervisorConfig, CONFIG_ENV_VAR};
use crate::domain::events::WorkerEvent;
use crate::domain::worker::{self, CrashState, InstanceNum, WorkerStatus};
use crate::infrastructure::process::send_signal;

/// Longest child output line forwarded as one event.
const MAX_LINE_LEN: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to launch '{program}': {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize worker configuration: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("worker task ended before the process started")]
    Aborted,
}

/// Launch template shared by every monitor of one orchestrator.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub stdio: StdioMode,
    pub max_restarts: u32,
    pub min_uptime: Duration,
    pub kill_timeout: Duration,
}

impl WorkerOptions {
    pub fn from_config(config: &SupervisorConfig) -> Self {
        let (program, args) = config.command_line();
        Self {
            program,
            args,
            env: config.env.clone(),
            stdio: config.stdio,
            max_restarts: config.max_restarts,
            min_uptime: config.min_uptime,
            kill_timeout: config.kill_timeout,
        }
    }
}

/// A worker event as seen by the orchestrator's event pump.
#[derive(Debug, Clone)]
pub struct WorkerEnvelope {
    pub worker_id: u64,
    pub instance_num: Option<InstanceNum>,
    pub event: WorkerEvent,
}

struct MonitorState {
    data: Map<String, Value>,
    crash: CrashState,
    child_pid: Option<u32>,
    instance_num: Option<InstanceNum>,
}

struct RunHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

enum Verdict {
    Respawn,
    Sleep,
    GiveUp,
}

pub struct WorkerMonitor {
    id: u64,
    options: Arc<WorkerOptions>,
    state: parking_lot::Mutex<MonitorState>,
    events: mpsc::UnboundedSender<WorkerEnvelope>,
    // Serializes start/stop/restart; held across the await on the task.
    run: tokio::sync::Mutex<Option<RunHandle>>,
}

impl WorkerMonitor {
    pub fn new(
        id: u64,
        options: Arc<WorkerOptions>,
        data: Map<String, Value>,
        events: mpsc::UnboundedSender<WorkerEnvelope>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            options,
            state: parking_lot::Mutex::new(MonitorState {
                data,
                crash: CrashState::default(),
                child_pid: None,
                instance_num: None,
            }),
            events,
            run: tokio::sync::Mutex::new(None),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn instance_num(&self) -> Option<InstanceNum> {
        self.state.lock().instance_num
    }

    pub fn child_pid(&self) -> Option<u32> {
        self.state.lock().child_pid
    }

    pub fn status(&self) -> WorkerStatus {
        self.state.lock().crash.status
    }

    pub fn crash_state(&self) -> CrashState {
        self.state.lock().crash.clone()
    }

    /// Snapshot of `data` with `monitor` and `pid` folded in.
    pub fn to_json(&self) -> Value {
        let state = self.state.lock();
        worker::snapshot(&state.data, &state.crash, state.child_pid)
    }

    pub fn merge_data(&self, patch: &Map<String, Value>) {
        worker::merge_data(&mut self.state.lock().data, patch);
    }

    /// Record the instance number and derived fields chosen by the orchestrator.
    pub fn assign(&self, instance_num: InstanceNum, derived: &Map<String, Value>) {
        let mut state = self.state.lock();
        state.instance_num = Some(instance_num);
        worker::merge_data(&mut state.data, derived);
    }

    /// Launch the child and resolve once it is live. A second call while the
    /// worker is supervised returns the current snapshot.
    pub async fn start(self: &Arc<Self>) -> Result<Value, WorkerError> {
        let mut run = self.run.lock().await;
        if let Some(handle) = run.as_ref() {
            if !handle.task.is_finished() {
                return Ok(self.to_json());
            }
        }
        self.start_locked(&mut run).await
    }

    /// Stop the current process and start a new one. Does not touch the
    /// crash counter.
    pub async fn restart(self: &Arc<Self>) -> Result<Value, WorkerError> {
        let mut run = self.run.lock().await;
        self.emit(WorkerEvent::Restart);
        metrics::counter!("herd_worker_restarts_total").increment(1);
        self.halt(&mut run).await;
        self.start_locked(&mut run).await
    }

    /// Terminate the process and disable respawn. Resolves after the OS
    /// process is gone.
    pub async fn stop(&self) {
        let mut run = self.run.lock().await;
        self.halt(&mut run).await;
        self.state.lock().crash.status = WorkerStatus::Stopped;
        self.emit(WorkerEvent::Stop);
    }

    async fn start_locked(self: &Arc<Self>, run: &mut Option<RunHandle>) -> Result<Value, WorkerError> {
        self.state.lock().crash.status = WorkerStatus::Starting;

        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(self.clone().supervise(cancel.clone(), ready_tx));
        *run = Some(RunHandle { cancel, task });

        match ready_rx.await {
            Ok(Ok(())) => Ok(self.to_json()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(WorkerError::Aborted),
        }
    }

    async fn halt(&self, run: &mut Option<RunHandle>) {
        let Some(handle) = run.take() else {
            return;
        };
        handle.cancel.cancel();
        if let Err(e) = handle.task.await {
            warn!("Worker {} supervise task failed: {}", self.id, e);
        }
    }

    async fn supervise(
        self: Arc<Self>,
        cancel: CancellationToken,
        ready: oneshot::Sender<Result<(), WorkerError>>,
    ) {
        let mut ready = Some(ready);

        loop {
            if cancel.is_cancelled() {
                return;
            }

            let mut child = match self.launch() {
                Ok(child) => child,
                Err(e) => {
                    self.launch_failed(&e);
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(Err(e));
                    }
                    return;
                }
            };

            let pid = child.id().unwrap_or_default();
            self.forward_output(&mut child);
            self.state.lock().child_pid = Some(pid);
            metrics::counter!("herd_worker_spawns_total").increment(1);
            self.emit(WorkerEvent::Spawn { pid });

            self.state.lock().crash.status = WorkerStatus::Running;
            self.emit(WorkerEvent::Start { pid });
            if let Some(ready) = ready.take() {
                let _ = ready.send(Ok(()));
            }

            let started = Instant::now();
            let healthy = tokio::time::sleep(self.options.min_uptime);
            tokio::pin!(healthy);
            let mut proven = false;

            let exited = loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break None,
                    status = child.wait() => break Some(status),
                    _ = &mut healthy, if !proven => {
                        proven = true;
                        self.state.lock().crash.crashes = 0;
                    }
                }
            };

            let Some(status) = exited else {
                let status = self.terminate(&mut child, pid).await;
                let (exit_code, signal) = status.as_ref().map(exit_parts).unwrap_or((None, None));
                self.state.lock().child_pid = None;
                self.emit(WorkerEvent::Exit { exit_code, signal });
                return;
            };

            let (exit_code, signal) = match &status {
                Ok(status) => exit_parts(status),
                Err(e) => {
                    warn!("Failed to wait on worker {} (pid {}): {}", self.id, pid, e);
                    (None, None)
                }
            };

            if cancel.is_cancelled() {
                // Exit raced an explicit stop; not a crash.
                self.state.lock().child_pid = None;
                self.emit(WorkerEvent::Exit { exit_code, signal });
                return;
            }

            let uptime = started.elapsed();
            let (crashes, verdict) = self.record_crash(exit_code, signal);
            self.emit(WorkerEvent::Exit { exit_code, signal });
            metrics::counter!("herd_worker_crashes_total").increment(1);
            self.emit(WorkerEvent::Crash {
                exit_code,
                signal,
                crashes,
            });
            if uptime < self.options.min_uptime {
                debug!(
                    "Worker {} died after {:?} (crash {} of {} allowed)",
                    self.id, uptime, crashes, self.options.max_restarts
                );
            }

            match verdict {
                Verdict::Respawn => {
                    self.state.lock().crash.status = WorkerStatus::Starting;
                }
                Verdict::Sleep => {
                    self.state.lock().crash.status = WorkerStatus::Sleeping;
                    self.emit(WorkerEvent::Sleep { crashes });
                    return;
                }
                Verdict::GiveUp => return,
            }
        }
    }

    fn record_crash(&self, exit_code: Option<i32>, signal: Option<i32>) -> (u32, Verdict) {
        let mut state = self.state.lock();
        state.child_pid = None;
        state.crash.last_exit_code = exit_code;
        state.crash.last_signal = signal;
        state.crash.crashes += 1;
        state.crash.status = WorkerStatus::Crashed;

        let crashes = state.crash.crashes;
        let max = self.options.max_restarts;
        let verdict = if crashes <= max {
            Verdict::Respawn
        } else if max == 0 {
            Verdict::GiveUp
        } else {
            Verdict::Sleep
        };
        (crashes, verdict)
    }

    fn launch_failed(&self, error: &WorkerError) {
        self.emit(WorkerEvent::Warn {
            message: error.to_string(),
        });
        let crashes = {
            let mut state = self.state.lock();
            state.child_pid = None;
            state.crash.crashes += 1;
            state.crash.last_exit_code = None;
            state.crash.last_signal = None;
            state.crash.status = WorkerStatus::Crashed;
            state.crash.crashes
        };
        metrics::counter!("herd_worker_crashes_total").increment(1);
        self.emit(WorkerEvent::Crash {
            exit_code: None,
            signal: None,
            crashes,
        });
        self.emit(WorkerEvent::Exit {
            exit_code: None,
            signal: None,
        });
    }

    fn launch(&self) -> Result<Child, WorkerError> {
        let serialized = serde_json::to_string(&self.state.lock().data)?;

        let mut cmd = Command::new(&self.options.program);
        cmd.args(&self.options.args)
            .envs(&self.options.env)
            .env(CONFIG_ENV_VAR, serialized)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        match self.options.stdio {
            StdioMode::Pipe => {
                cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
            }
            StdioMode::Inherit => {
                cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
            }
            StdioMode::Null => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        cmd.spawn().map_err(|source| WorkerError::Launch {
            program: self.options.program.clone(),
            source,
        })
    }

    fn forward_output(self: &Arc<Self>, child: &mut Child) {
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(self.clone(), stdout, |line| WorkerEvent::Stdout { line }));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(self.clone(), stderr, |line| WorkerEvent::Stderr { line }));
        }
    }

    /// SIGTERM, then SIGKILL once `kill_timeout` has passed.
    async fn terminate(&self, child: &mut Child, pid: u32) -> Option<ExitStatus> {
        if let Err(e) = send_signal(pid, libc::SIGTERM) {
            debug!("SIGTERM to pid {} failed: {}", pid, e);
        }
        match tokio::time::timeout(self.options.kill_timeout, child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                warn!("Failed to wait on pid {}: {}", pid, e);
                None
            }
            Err(_) => {
                warn!(
                    "Worker {} (pid {}) ignored SIGTERM for {:?}, killing",
                    self.id, pid, self.options.kill_timeout
                );
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill pid {}: {}", pid, e);
                }
                child.try_wait().ok().flatten()
            }
        }
    }

    fn emit(&self, event: WorkerEvent) {
        let instance_num = self.state.lock().instance_num;
        let _ = self.events.send(WorkerEnvelope {
            worker_id: self.id,
            instance_num,
            event,
        });
    }
}

/// Drain a child pipe until EOF. The read end stays open for the child's
/// whole life: invalid UTF-8 is replaced and over-long lines are split at
/// `MAX_LINE_LEN` bytes.
async fn forward_lines<R>(monitor: Arc<WorkerMonitor>, pipe: R, wrap: fn(String) -> WorkerEvent)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match (&mut reader).take(MAX_LINE_LEN as u64).read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                while matches!(buf.last(), Some(b'\n') | Some(b'\r')) {
                    buf.pop();
                }
                monitor.emit(wrap(String::from_utf8_lossy(&buf).into_owned()));
            }
            Err(e) => {
                debug!("Output pipe of worker {} failed: {}", monitor.id, e);
                break;
            }
        }
    }
}

fn exit_parts(status: &ExitStatus) -> (Option<i32>, Option<i32>) {
    use std::os::unix::process::ExitStatusExt;
    (status.code(), status.signal())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(script: &str, max_restarts: u32) -> Arc<WorkerOptions> {
        Arc::new(WorkerOptions {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: BTreeMap::new(),
            stdio: StdioMode::Pipe,
            max_restarts,
            min_uptime: Duration::from_secs(1),
            kill_timeout: Duration::from_secs(2),
        })
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<WorkerEnvelope>) -> Vec<&'static str> {
        let mut kinds = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            kinds.push(envelope.event.kind());
        }
        kinds
    }

    async fn wait_for_status(monitor: &WorkerMonitor, wanted: WorkerStatus) {
        for _ in 0..100 {
            if monitor.status() == wanted {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("worker never reached {}", wanted);
    }

    #[cfg_attr(miri, ignore)]
    #[tokio::test]
    async fn test_start_then_stop() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = WorkerMonitor::new(1, options("sleep 30", 3), Map::new(), tx);

        let snapshot = monitor.start().await.unwrap();
        assert_eq!(snapshot["monitor"]["status"], "running");
        assert!(snapshot["pid"].is_u64());

        // Second start is a no-op while supervised.
        let again = monitor.start().await.unwrap();
        assert_eq!(again["pid"], snapshot["pid"]);

        monitor.stop().await;
        assert_eq!(monitor.status(), WorkerStatus::Stopped);
        assert_eq!(monitor.child_pid(), None);
        assert_eq!(monitor.crash_state().crashes, 0);

        let kinds = drain(&mut rx);
        assert_eq!(kinds, vec!["SPAWN", "START", "EXIT", "STOP"]);
    }

    #[cfg_attr(miri, ignore)]
    #[tokio::test]
    async fn test_crash_loop_exhausts_budget() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = WorkerMonitor::new(1, options("exit 3", 1), Map::new(), tx);

        monitor.start().await.unwrap();
        wait_for_status(&monitor, WorkerStatus::Sleeping).await;

        let crash = monitor.crash_state();
        assert_eq!(crash.crashes, 2);
        assert_eq!(crash.last_exit_code, Some(3));

        let kinds = drain(&mut rx);
        assert_eq!(kinds.iter().filter(|k| **k == "SPAWN").count(), 2);
        assert_eq!(kinds.last(), Some(&"SLEEP"));
    }

    #[cfg_attr(miri, ignore)]
    #[tokio::test]
    async fn test_restart_replaces_process_without_counting_a_crash() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let monitor = WorkerMonitor::new(1, options("sleep 30", 3), Map::new(), tx);

        let first = monitor.start().await.unwrap();
        let second = monitor.restart().await.unwrap();
        assert_ne!(first["pid"], second["pid"]);
        assert_eq!(second["monitor"]["crashes"], 0);
        assert_eq!(monitor.status(), WorkerStatus::Running);

        monitor.stop().await;
    }

    #[cfg_attr(miri, ignore)]
    #[tokio::test]
    async fn test_unlaunchable_program_reports_crash() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let opts = Arc::new(WorkerOptions {
            program: "/nonexistent/herd-worker".to_string(),
            ..(*options("", 3)).clone()
        });
        let monitor = WorkerMonitor::new(1, opts, Map::new(), tx);

        let err = monitor.start().await.unwrap_err();
        assert!(matches!(err, WorkerError::Launch { .. }));
        assert_eq!(monitor.status(), WorkerStatus::Crashed);
        assert_eq!(drain(&mut rx), vec!["WARN", "CRASH", "EXIT"]);
    }

    #[cfg_attr(miri, ignore)]
    #[tokio::test]
    async fn test_stdout_lines_become_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = WorkerMonitor::new(1, options("echo hello; sleep 30", 3), Map::new(), tx);
        monitor.start().await.unwrap();

        let line = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(envelope) = rx.recv().await {
                if let WorkerEvent::Stdout { line } = envelope.event {
                    return line;
                }
            }
            String::new()
        })
        .await
        .unwrap();
        assert_eq!(line, "hello");
        monitor.stop().await;
    }

    #[cfg_attr(miri, ignore)]
    #[tokio::test]
    async fn test_invalid_utf8_output_keeps_worker_alive() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let script = "printf '\\377\\n'; sleep 0.3; while true; do echo after; sleep 0.2; done";
        let monitor = WorkerMonitor::new(1, options(script, 0), Map::new(), tx);
        monitor.start().await.unwrap();

        let lines = tokio::time::timeout(Duration::from_secs(5), async {
            let mut lines = Vec::new();
            while let Some(envelope) = rx.recv().await {
                if let WorkerEvent::Stdout { line } = envelope.event {
                    lines.push(line);
                    if lines.len() == 3 {
                        break;
                    }
                }
            }
            lines
        })
        .await
        .unwrap();
        assert_eq!(lines, vec!["\u{FFFD}", "after", "after"]);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(monitor.status(), WorkerStatus::Running);
        assert_eq!(monitor.crash_state().crashes, 0);
        monitor.stop().await;
    }

    #[cfg_attr(miri, ignore)]
    #[tokio::test]
    async fn test_child_receives_serialized_data() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut data = Map::new();
        data.insert("name".into(), Value::from("probe"));
        let monitor = WorkerMonitor::new(
            1,
            options("printf '%s\\n' \"$HERD_CONFIG\"; sleep 30", 3),
            data,
            tx,
        );
        monitor.start().await.unwrap();

        let line = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(envelope) = rx.recv().await {
                if let WorkerEvent::Stdout { line } = envelope.event {
                    return line;
                }
            }
            String::new()
        })
        .await
        .unwrap();
        let seen: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(seen["name"], "probe");
        monitor.stop().await;
    }
}
