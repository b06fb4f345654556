// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::worker::InstanceNum;

/// Lifecycle event names that may carry a hook command.
pub const HOOK_EVENTS: &[&str] = &["spawn", "start", "stop", "crash", "sleep", "exit", "restart"];

/// One transition of a worker's lifecycle, emitted by its monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum WorkerEvent {
    /// The OS accepted the spawn request.
    Spawn { pid: u32 },
    /// The process is live.
    Start { pid: u32 },
    /// Explicit stop completed.
    Stop,
    /// Unexpected exit, counted against the restart budget.
    Crash {
        exit_code: Option<i32>,
        signal: Option<i32>,
        crashes: u32,
    },
    /// Restart budget exhausted; no further respawn.
    Sleep { crashes: u32 },
    /// The OS process is gone (or could not be launched).
    Exit {
        exit_code: Option<i32>,
        signal: Option<i32>,
    },
    Restart,
    Stdout { line: String },
    Stderr { line: String },
    Warn { message: String },
}

impl WorkerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Spawn { .. } => "SPAWN",
            Self::Start { .. } => "START",
            Self::Stop => "STOP",
            Self::Crash { .. } => "CRASH",
            Self::Sleep { .. } => "SLEEP",
            Self::Exit { .. } => "EXIT",
            Self::Restart => "RESTART",
            Self::Stdout { .. } => "STDOUT",
            Self::Stderr { .. } => "STDERR",
            Self::Warn { .. } => "WARN",
        }
    }

    /// Name used to look up a hook command, `None` for output events.
    pub fn hook_name(&self) -> Option<&'static str> {
        match self {
            Self::Spawn { .. } => Some("spawn"),
            Self::Start { .. } => Some("start"),
            Self::Stop => Some("stop"),
            Self::Crash { .. } => Some("crash"),
            Self::Sleep { .. } => Some("sleep"),
            Self::Exit { .. } => Some("exit"),
            Self::Restart => Some("restart"),
            Self::Stdout { .. } | Self::Stderr { .. } | Self::Warn { .. } => None,
        }
    }
}

/// A worker event tagged with the supervisor and instance it came from.
///
/// `instance_num` is `None` for events emitted before the worker reached
/// `START` for the first time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
    pub name: String,
    pub instance_num: Option<InstanceNum>,
    pub event: WorkerEvent,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let event = WorkerEvent::Crash {
            exit_code: Some(1),
            signal: None,
            crashes: 2,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "CRASH");
        assert_eq!(value["exitCode"], 1);
        assert_eq!(value["crashes"], 2);
        assert_eq!(event.kind(), "CRASH");
        assert_eq!(event.hook_name(), Some("crash"));
    }

    #[test]
    fn test_output_events_have_no_hook() {
        let event = WorkerEvent::Stdout {
            line: "listening".into(),
        };
        assert_eq!(event.hook_name(), None);
        for name in HOOK_EVENTS {
            assert_eq!(name.to_lowercase(), *name);
        }
    }
}
