// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::domain::worker::InstanceNum;

/// On-disk record of one running worker, keyed by `(key, instance_num)`.
///
/// `pid` is the owning supervisor's PID; it is what liveness checks probe.
/// `child_pid` is informational and goes stale across respawns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PidRecord {
    pub key: String,
    pub instance_num: InstanceNum,
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_pid: Option<u32>,
    pub socket_path: PathBuf,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum PidStoreError {
    #[error("pid store I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode pid record: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait PidStore: Send + Sync {
    /// Persist a record, returning the path it was written to.
    async fn write(&self, record: &PidRecord) -> Result<PathBuf, PidStoreError>;

    /// All records whose owner still looks alive. Stale records are removed.
    async fn read_all(&self) -> Result<Vec<PidRecord>, PidStoreError>;

    /// Remove a record. Removing a missing record is not an error.
    async fn remove(&self, key: &str, instance_num: InstanceNum) -> Result<(), PidStoreError>;

    /// Where the record for `(key, instance_num)` lives.
    fn record_path(&self, key: &str, instance_num: InstanceNum) -> PathBuf;
}
