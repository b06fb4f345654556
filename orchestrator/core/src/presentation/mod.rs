// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Presentation Layer (`herd-core`)
//!
//! Control-socket surface that translates decoded requests into
//! orchestrator calls. **No business logic lives here**; all real work is
//! delegated to [`crate::application::orchestrator`].
//!
//! | Module | Transport | Description |
//! |--------|-----------|-------------|
//! | [`control`] | Unix socket (NDJSON) | `spawn`, `scale`, `state`, `restart`, `shutDown`, `subscribe` |

pub mod control;
