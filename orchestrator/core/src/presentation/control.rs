// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Maps decoded control requests onto [`Orchestrator`] operations.

use std::sync::Weak;

use async_trait::async_trait;
use serde_json::Value;

use crate::application::orchestrator::Orchestrator;
use crate::domain::protocol::ControlRequest;
use crate::infrastructure::control_channel::ControlHandler;

/// Holds the orchestrator weakly so the bound server never keeps it alive.
pub struct ControlDispatcher {
    orchestrator: Weak<Orchestrator>,
}

impl ControlDispatcher {
    pub fn new(orchestrator: Weak<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl ControlHandler for ControlDispatcher {
    async fn handle(&self, request: ControlRequest) -> anyhow::Result<Value> {
        let orchestrator = self
            .orchestrator
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("orchestrator is shutting down"))?;

        let result = match request {
            ControlRequest::Spawn { instances } => {
                serde_json::to_value(orchestrator.spawn(instances).await)?
            }
            ControlRequest::Scale { target } => serde_json::to_value(orchestrator.scale(target).await)?,
            ControlRequest::State {
                new_state,
                instance_num,
            } => serde_json::to_value(orchestrator.state(new_state.as_ref(), instance_num))?,
            ControlRequest::Restart { instance_num } => {
                Value::from(orchestrator.restart(instance_num).await)
            }
            ControlRequest::ShutDown { instance_num } => {
                orchestrator.shut_down(instance_num).await?;
                Value::Null
            }
            // The channel starts forwarding events itself.
            ControlRequest::Subscribe => Value::Bool(true),
        };
        Ok(result)
    }
}
