// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Worker state types.
//!
//! A worker is one supervised OS process slot. Its observable state is the
//! mutable `data` bag (configuration plus caller-set fields), the crash
//! bookkeeping in [`CrashState`] and the current child PID. [`snapshot`]
//! folds the three into the JSON object returned by `getState`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Position of a worker among its siblings, assigned as `max + 1` on start.
pub type InstanceNum = u32;

/// Keys the orchestrator derives into a worker's `data` on start.
pub mod fields {
    pub const NAME: &str = "name";
    pub const INSTANCE_NUM: &str = "instanceNum";
    pub const PID_FILE: &str = "pidFile";
    pub const SOCKET_PATH: &str = "socketPath";
    pub const DISPLAY_NAME: &str = "displayName";
    pub const MONITOR: &str = "monitor";
    pub const PID: &str = "pid";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Starting,
    Running,
    Sleeping,
    Crashed,
    Stopped,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Sleeping => "sleeping",
            Self::Crashed => "crashed",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrashState {
    pub status: WorkerStatus,
    pub crashes: u32,
    pub last_exit_code: Option<i32>,
    pub last_signal: Option<i32>,
}

impl Default for CrashState {
    fn default() -> Self {
        Self {
            status: WorkerStatus::Starting,
            crashes: 0,
            last_exit_code: None,
            last_signal: None,
        }
    }
}

impl CrashState {
    fn to_value(&self) -> Value {
        json!({
            "status": self.status.as_str(),
            "crashes": self.crashes,
            "lastExitCode": self.last_exit_code,
            "lastSignal": self.last_signal,
        })
    }
}

/// Build the `getState` payload: `data` with `monitor` and `pid` folded in.
pub fn snapshot(data: &Map<String, Value>, crash: &CrashState, pid: Option<u32>) -> Value {
    let mut out = data.clone();
    out.insert(fields::MONITOR.to_string(), crash.to_value());
    out.insert(
        fields::PID.to_string(),
        pid.map(Value::from).unwrap_or(Value::Null),
    );
    Value::Object(out)
}

/// Shallow merge: every key in `patch` replaces the key in `target`.
pub fn merge_data(target: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, value) in patch {
        target.insert(key.clone(), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_folds_monitor_and_pid() {
        let mut data = Map::new();
        data.insert("name".into(), json!("hello"));
        let crash = CrashState {
            status: WorkerStatus::Running,
            ..Default::default()
        };

        let state = snapshot(&data, &crash, Some(4242));
        assert_eq!(state["name"], "hello");
        assert_eq!(state["pid"], 4242);
        assert_eq!(state["monitor"]["status"], "running");
        assert_eq!(state["monitor"]["crashes"], 0);
        assert!(state["monitor"]["lastExitCode"].is_null());
    }

    #[test]
    fn test_merge_is_shallow() {
        let mut data = Map::new();
        data.insert("env".into(), json!({"A": "1", "B": "2"}));
        let mut patch = Map::new();
        patch.insert("env".into(), json!({"A": "3"}));

        merge_data(&mut data, &patch);
        assert_eq!(data["env"], json!({"A": "3"}));
    }
}
