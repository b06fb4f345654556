// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Control protocol
//!
//! Frames exchanged over the control socket and the closed set of control
//! requests an orchestrator understands.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Wire vocabulary shared by the control server and its clients
//!
//! Every frame is one JSON object on its own line. A `request` carries an id
//! and expects exactly one `reply` (or `error`) with the same id; a `publish`
//! never gets an answer. Servers also push `publish` frames with method
//! `event` to connections that subscribed to lifecycle events.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::domain::worker::InstanceNum;

/// Method name of server-pushed lifecycle event frames.
pub const EVENT_METHOD: &str = "event";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Frame {
    Request {
        id: u64,
        method: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    Publish {
        method: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    Reply {
        id: u64,
        method: String,
        #[serde(default)]
        result: Value,
    },
    Error {
        id: u64,
        method: String,
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unknown method '{0}'")]
    UnknownMethod(String),

    #[error("invalid arguments for '{method}': {reason}")]
    InvalidArgs { method: String, reason: String },
}

/// The operations an orchestrator exposes over its control socket.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlRequest {
    /// `spawn({instances})`
    Spawn { instances: usize },
    /// `scale(target)`
    Scale { target: usize },
    /// `state(newState?, instanceNum?)`; merge then snapshot.
    State {
        new_state: Option<Map<String, Value>>,
        instance_num: Option<InstanceNum>,
    },
    /// `restart(instanceNum?)`
    Restart { instance_num: Option<InstanceNum> },
    /// `shutDown(instanceNum?)`
    ShutDown { instance_num: Option<InstanceNum> },
    /// Start receiving lifecycle event publishes on this connection.
    Subscribe,
}

impl ControlRequest {
    pub fn method(&self) -> &'static str {
        match self {
            Self::Spawn { .. } => "spawn",
            Self::Scale { .. } => "scale",
            Self::State { .. } => "state",
            Self::Restart { .. } => "restart",
            Self::ShutDown { .. } => "shutDown",
            Self::Subscribe => "subscribe",
        }
    }

    pub fn parse(method: &str, args: &[Value]) -> Result<Self, ProtocolError> {
        match method {
            "spawn" => {
                let instances = match args.first() {
                    None | Some(Value::Null) => 1,
                    Some(Value::Object(obj)) => match obj.get("instances") {
                        None | Some(Value::Null) => 1,
                        Some(v) => as_count(method, v)?,
                    },
                    Some(v) => as_count(method, v)?,
                };
                Ok(Self::Spawn { instances })
            }
            "scale" => {
                let target = match args.first() {
                    Some(v) => as_count(method, v)?,
                    None => return Err(invalid(method, "missing target instance count")),
                };
                Ok(Self::Scale { target })
            }
            "state" => {
                let new_state = match args.first() {
                    None | Some(Value::Null) => None,
                    Some(Value::Object(obj)) => Some(obj.clone()),
                    Some(_) => return Err(invalid(method, "new state must be an object")),
                };
                let instance_num = optional_instance(method, args.get(1))?;
                Ok(Self::State {
                    new_state,
                    instance_num,
                })
            }
            "restart" => Ok(Self::Restart {
                instance_num: optional_instance(method, args.first())?,
            }),
            "shutDown" => Ok(Self::ShutDown {
                instance_num: optional_instance(method, args.first())?,
            }),
            "subscribe" => Ok(Self::Subscribe),
            other => Err(ProtocolError::UnknownMethod(other.to_string())),
        }
    }

    pub fn to_args(&self) -> Vec<Value> {
        match self {
            Self::Spawn { instances } => {
                let mut obj = Map::new();
                obj.insert("instances".into(), Value::from(*instances));
                vec![Value::Object(obj)]
            }
            Self::Scale { target } => vec![Value::from(*target)],
            Self::State {
                new_state,
                instance_num,
            } => {
                let state = new_state.clone().map(Value::Object).unwrap_or(Value::Null);
                match instance_num {
                    Some(n) => vec![state, Value::from(*n)],
                    None if new_state.is_some() => vec![state],
                    None => Vec::new(),
                }
            }
            Self::Restart { instance_num } | Self::ShutDown { instance_num } => {
                instance_num.map(|n| vec![Value::from(n)]).unwrap_or_default()
            }
            Self::Subscribe => Vec::new(),
        }
    }
}

fn invalid(method: &str, reason: &str) -> ProtocolError {
    ProtocolError::InvalidArgs {
        method: method.to_string(),
        reason: reason.to_string(),
    }
}

fn as_count(method: &str, value: &Value) -> Result<usize, ProtocolError> {
    value
        .as_u64()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| invalid(method, "expected a non-negative integer"))
}

fn optional_instance(method: &str, value: Option<&Value>) -> Result<Option<InstanceNum>, ProtocolError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .and_then(|n| InstanceNum::try_from(n).ok())
            .filter(|n| *n > 0)
            .map(Some)
            .ok_or_else(|| invalid(method, "instanceNum must be a positive integer")),
    }
}

/// Summary returned by batch operations (`spawn`, `scale`).
///
/// Callers must check `ok`/`errors`; per-item failures never abort siblings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub ok: bool,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed: Option<Vec<Value>>,
}

impl BatchReport {
    pub fn failed(errors: Vec<String>) -> Self {
        Self {
            ok: false,
            errors,
            added: None,
            removed: None,
        }
    }
}

/// Result of `state`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateList {
    #[serde(rename = "stateList")]
    pub state_list: Vec<Value>,
}
