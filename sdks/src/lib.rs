// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

/// herd Rust SDK
///
/// Discover supervisors running on this host and drive them over their
/// control sockets.

pub mod client;

pub use client::{Connection, ConnectionOptions, RemoteInstance};
pub use herd_core::{BatchReport, LifecycleEvent, WorkerEvent};
