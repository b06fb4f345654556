// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Lifecycle hooks: shell commands run on worker transitions.

use std::collections::BTreeMap;
use std::process::{ExitStatus, Stdio};

use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::domain::events::{LifecycleEvent, WorkerEvent};
use crate::infrastructure::event_bus::{EventBusError, EventReceiver};

pub struct HookRunner {
    name: String,
    hooks: BTreeMap<String, String>,
}

impl HookRunner {
    pub fn new(name: impl Into<String>, hooks: BTreeMap<String, String>) -> Self {
        Self {
            name: name.into(),
            hooks,
        }
    }

    /// Consume events until the bus closes. Each hook runs in its own task so
    /// a slow script never delays the next event.
    pub fn spawn(self, mut receiver: EventReceiver) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        if let Some(command) = self.command_for(&event) {
                            let label = format!("{} hook of '{}'", event.event.kind(), self.name);
                            tokio::spawn(async move {
                                if let Err(e) = run(command, &label).await {
                                    warn!("{} failed to run: {}", label, e);
                                }
                            });
                        }
                    }
                    Err(EventBusError::Lagged(_)) => continue,
                    Err(_) => break,
                }
            }
            debug!("Hook runner for '{}' stopped", self.name);
        })
    }

    /// The command configured for this event, if any.
    pub fn command_for(&self, event: &LifecycleEvent) -> Option<Command> {
        let hook = event.event.hook_name()?;
        let script = self.hooks.get(hook)?;

        let pid = match event.event {
            WorkerEvent::Spawn { pid } | WorkerEvent::Start { pid } => pid.to_string(),
            _ => String::new(),
        };
        let instance = event.instance_num.map(|n| n.to_string()).unwrap_or_default();

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(script)
            .env("HERD_EVENT", hook)
            .env("HERD_NAME", &self.name)
            .env("HERD_INSTANCE", instance)
            .env("HERD_PID", pid)
            .stdin(Stdio::null())
            .stdout(Stdio::null());
        Some(cmd)
    }
}

async fn run(mut command: Command, label: &str) -> std::io::Result<ExitStatus> {
    let status = command.status().await?;
    if !status.success() {
        warn!("{} exited with {}", label, status);
    }
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(event: WorkerEvent) -> LifecycleEvent {
        LifecycleEvent {
            name: "api".into(),
            instance_num: Some(2),
            event,
            at: Utc::now(),
        }
    }

    #[test]
    fn test_no_command_without_hook() {
        let mut hooks = BTreeMap::new();
        hooks.insert("crash".to_string(), "true".to_string());
        let runner = HookRunner::new("api", hooks);

        assert!(runner.command_for(&event(WorkerEvent::Restart)).is_none());
        assert!(runner
            .command_for(&event(WorkerEvent::Stdout { line: "x".into() }))
            .is_none());
        assert!(runner
            .command_for(&event(WorkerEvent::Crash {
                exit_code: Some(1),
                signal: None,
                crashes: 1
            }))
            .is_some());
    }

    #[cfg_attr(miri, ignore)]
    #[tokio::test]
    async fn test_hook_sees_event_environment() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("hook.out");
        let mut hooks = BTreeMap::new();
        hooks.insert(
            "start".to_string(),
            format!(
                "echo \"$HERD_EVENT $HERD_NAME $HERD_INSTANCE $HERD_PID\" > {}",
                out.display()
            ),
        );
        let runner = HookRunner::new("api", hooks);

        let command = runner.command_for(&event(WorkerEvent::Start { pid: 77 })).unwrap();
        let status = run(command, "start hook").await.unwrap();
        assert!(status.success());
        assert_eq!(std::fs::read_to_string(&out).unwrap().trim(), "start api 2 77");
    }
}
