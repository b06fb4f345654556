// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for herd CLI

pub mod control;
pub mod start;

pub use self::control::{RestartArgs, ScaleArgs, StateArgs, StopArgs};
pub use self::start::StartArgs;
