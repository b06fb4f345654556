// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # herd-core
//!
//! Process supervision for the `herd` supervisor: keeps N copies of a
//! program alive, exposes a local control socket for inspecting and driving
//! them, and lets separate processes discover running supervisors through
//! the run directory.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Worker lifecycle, orchestration, control channel, discovery
//!
//! | Layer | Contents |
//! |-------|----------|
//! | [`domain`] | configuration, worker state, lifecycle events, wire protocol, PID records |
//! | [`application`] | [`WorkerMonitor`](application::WorkerMonitor), [`Orchestrator`], hooks, [`exec`] |
//! | [`infrastructure`] | control socket, event bus, PID file store, reconciler, file watcher |
//! | [`presentation`] | control request dispatch |
//!
//! ```no_run
//! # async fn demo() -> Result<(), herd_core::ExecError> {
//! use herd_core::{exec, SupervisorConfig};
//!
//! let config = SupervisorConfig::new("server.sh")
//!     .with_interpreter("sh")
//!     .with_instances(2);
//! let handle = exec(config).await?;
//! handle.wait_drained().await;
//! # Ok(())
//! # }
//! ```

pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod presentation;

pub use application::{exec, exec_with, ExecError, Orchestrator, SupervisorContext, SupervisorHandle};
pub use domain::config::{SupervisorConfig, CONFIG_ENV_VAR, HOME_ENV_VAR};
pub use domain::events::{LifecycleEvent, WorkerEvent};
pub use domain::protocol::{BatchReport, ControlRequest, StateList};
pub use domain::worker::{InstanceNum, WorkerStatus};
