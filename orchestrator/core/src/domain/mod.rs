// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain
//!
//! Plain data types shared by every layer: configuration, worker state,
//! lifecycle events, the control wire vocabulary and PID records.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Types with no I/O

pub mod config;
pub mod events;
pub mod protocol;
pub mod repository;
pub mod worker;
