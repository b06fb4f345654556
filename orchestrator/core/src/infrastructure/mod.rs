// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod control_channel;
pub mod event_bus;
pub mod paths;
pub mod pid_store;
pub mod process;
pub mod reconciler;
pub mod watcher;

pub use control_channel::{ChannelError, ControlClient, ControlHandler, ControlServer};
pub use pid_store::FilePidStore;
pub use reconciler::{ConnectionRef, DiscoveryError, Reconciler};
