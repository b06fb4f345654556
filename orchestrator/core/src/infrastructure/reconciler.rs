// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Run Directory Reconciler
//!
//! Discovers running orchestrators without a central registry by matching
//! PID records against control socket files in the run directory.
//!
//! Every socket that answers becomes exactly one [`ConnectionRef`]. Sockets
//! nobody answers on are deleted; PID records whose owner died are deleted by
//! the [`PidStore`] while reading. Discovery therefore heals the run
//! directory as a side effect and never fails because of leftovers.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::protocol::{ControlRequest, StateList};
use crate::domain::repository::{PidRecord, PidStore, PidStoreError};
use crate::domain::worker::fields;
use crate::infrastructure::control_channel::{ChannelError, ControlClient, DEFAULT_REQUEST_TIMEOUT};
use crate::infrastructure::paths::{socket_path, SOCKET_EXTENSION};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error(transparent)]
    PidStore(#[from] PidStoreError),

    #[error("invalid socket glob: {0}")]
    Glob(#[from] glob::PatternError),
}

/// A live orchestrator found in the run directory.
pub struct ConnectionRef {
    pub key: String,
    pub socket_path: PathBuf,
    /// PID records of this key; empty when only the socket was found.
    pub records: Vec<PidRecord>,
    pub client: ControlClient,
}

impl ConnectionRef {
    /// PID of the owning supervisor, when a record for it survives.
    pub fn pid(&self) -> Option<u32> {
        self.records.first().map(|r| r.pid)
    }

    pub async fn close(self) {
        self.client.close().await;
    }
}

impl std::fmt::Debug for ConnectionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRef")
            .field("key", &self.key)
            .field("socket_path", &self.socket_path)
            .field("records", &self.records.len())
            .finish()
    }
}

pub struct Reconciler {
    run_dir: PathBuf,
    pid_store: Arc<dyn PidStore>,
    timeout: Duration,
}

impl Reconciler {
    pub fn new(run_dir: impl Into<PathBuf>, pid_store: Arc<dyn PidStore>) -> Self {
        Self {
            run_dir: run_dir.into(),
            pid_store,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Request timeout applied to every client this reconciler opens.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn pid_store(&self) -> &Arc<dyn PidStore> {
        &self.pid_store
    }

    /// Connect to every live orchestrator, cleaning up dead artifacts.
    pub async fn get_all(&self) -> Result<Vec<ConnectionRef>, DiscoveryError> {
        let mut by_key: BTreeMap<String, Vec<PidRecord>> = BTreeMap::new();
        for record in self.pid_store.read_all().await? {
            by_key.entry(record.key.clone()).or_default().push(record);
        }

        let mut seen: HashSet<PathBuf> = HashSet::new();
        let mut found = Vec::new();

        for (key, records) in by_key {
            let path = socket_path(&self.run_dir, &key);
            if !seen.insert(path.clone()) {
                continue;
            }
            match self.connect(&path).await {
                Ok(client) => found.push(ConnectionRef {
                    key,
                    socket_path: path,
                    records,
                    client,
                }),
                Err(e) if e.is_dead_socket() => {
                    info!("Removing dead control socket {:?} for '{}'", path, key);
                    remove_quietly(&path).await;
                }
                Err(e) => warn!("Skipping '{}': {}", key, e),
            }
        }

        for path in self.socket_files()? {
            if seen.contains(&path) {
                continue;
            }
            seen.insert(path.clone());
            match self.connect(&path).await {
                Ok(client) => {
                    let key = path
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    debug!("Found orchestrator '{}' without pid records", key);
                    found.push(ConnectionRef {
                        key,
                        socket_path: path,
                        records: Vec::new(),
                        client,
                    });
                }
                Err(e) if e.is_dead_socket() => {
                    info!("Removing zombie control socket {:?}", path);
                    remove_quietly(&path).await;
                }
                Err(e) => warn!("Skipping socket {:?}: {}", path, e),
            }
        }

        Ok(found)
    }

    /// Orchestrators whose workers report `name`.
    pub async fn get_by_name(&self, name: &str) -> Result<Vec<ConnectionRef>, DiscoveryError> {
        let mut matches = Vec::new();
        for mut conn in self.get_all().await? {
            let state = conn
                .client
                .request(&ControlRequest::State {
                    new_state: None,
                    instance_num: None,
                })
                .await;
            let is_match = match state {
                Ok(value) => reports_name(&value, name),
                Err(e) => {
                    debug!("State fetch from {:?} failed: {}", conn.socket_path, e);
                    false
                }
            };
            if is_match {
                matches.push(conn);
            } else {
                conn.close().await;
            }
        }
        Ok(matches)
    }

    /// Orchestrators whose socket key equals `key`.
    pub async fn get_by_key(&self, key: &str) -> Result<Vec<ConnectionRef>, DiscoveryError> {
        let mut matches = Vec::new();
        for conn in self.get_all().await? {
            if conn.key == key {
                matches.push(conn);
            } else {
                conn.close().await;
            }
        }
        Ok(matches)
    }

    async fn connect(&self, path: &Path) -> Result<ControlClient, ChannelError> {
        Ok(ControlClient::connect(path).await?.with_timeout(self.timeout))
    }

    fn socket_files(&self) -> Result<Vec<PathBuf>, DiscoveryError> {
        let pattern = format!(
            "{}/*.{}",
            glob::Pattern::escape(&self.run_dir.to_string_lossy()),
            SOCKET_EXTENSION
        );
        let mut paths: Vec<PathBuf> = glob::glob(&pattern)?.filter_map(Result::ok).collect();
        paths.sort();
        Ok(paths)
    }
}

fn reports_name(state: &Value, name: &str) -> bool {
    let Ok(list) = serde_json::from_value::<StateList>(state.clone()) else {
        return false;
    };
    list.state_list
        .iter()
        .any(|worker| worker.get(fields::NAME).and_then(Value::as_str) == Some(name))
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {:?}: {}", path, e);
        }
    }
}
