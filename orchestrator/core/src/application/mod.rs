// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod exec;
pub mod hooks;
pub mod orchestrator;
pub mod worker_monitor;

pub use exec::{exec, exec_with, ExecError, SupervisorHandle};
pub use orchestrator::{Orchestrator, OrchestratorError, SupervisorContext};
pub use worker_monitor::{WorkerError, WorkerMonitor, WorkerOptions};
