// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! File-backed [`PidStore`]: one JSON file per worker in the run directory.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::domain::repository::{PidRecord, PidStore, PidStoreError};
use crate::domain::worker::InstanceNum;
use crate::infrastructure::paths::PID_EXTENSION;
use crate::infrastructure::process::process_exists;

pub struct FilePidStore {
    dir: PathBuf,
}

impl FilePidStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn discard(&self, path: &Path, reason: &str) {
        debug!("Removing {} pid record {:?}", reason, path);
        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove pid record {:?}: {}", path, e);
            }
        }
    }
}

#[async_trait]
impl PidStore for FilePidStore {
    async fn write(&self, record: &PidRecord) -> Result<PathBuf, PidStoreError> {
        let path = self.record_path(&record.key, record.instance_num);
        let body = serde_json::to_vec_pretty(record)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| PidStoreError::Io {
                path: self.dir.clone(),
                source,
            })?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|source| PidStoreError::Io {
                path: path.clone(),
                source,
            })?;
        Ok(path)
    }

    async fn read_all(&self) -> Result<Vec<PidRecord>, PidStoreError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(PidStoreError::Io {
                    path: self.dir.clone(),
                    source,
                })
            }
        };

        let mut records = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(source) => {
                    return Err(PidStoreError::Io {
                        path: self.dir.clone(),
                        source,
                    })
                }
            };
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(PID_EXTENSION) {
                continue;
            }

            let raw = match tokio::fs::read(&path).await {
                Ok(raw) => raw,
                Err(e) => {
                    debug!("Skipping unreadable pid record {:?}: {}", path, e);
                    continue;
                }
            };
            let record: PidRecord = match serde_json::from_slice(&raw) {
                Ok(record) => record,
                Err(_) => {
                    self.discard(&path, "unparsable").await;
                    continue;
                }
            };
            if !process_exists(record.pid) {
                self.discard(&path, "stale").await;
                continue;
            }
            records.push(record);
        }

        records.sort_by(|a, b| a.key.cmp(&b.key).then(a.instance_num.cmp(&b.instance_num)));
        Ok(records)
    }

    async fn remove(&self, key: &str, instance_num: InstanceNum) -> Result<(), PidStoreError> {
        let path = self.record_path(key, instance_num);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(PidStoreError::Io { path, source }),
        }
    }

    fn record_path(&self, key: &str, instance_num: InstanceNum) -> PathBuf {
        self.dir
            .join(format!("{}.{}.{}", key, instance_num, PID_EXTENSION))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(key: &str, instance_num: InstanceNum, pid: u32) -> PidRecord {
        PidRecord {
            key: key.to_string(),
            instance_num,
            pid,
            child_pid: None,
            socket_path: PathBuf::from(format!("/tmp/{}.sock", key)),
            started_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_write_read_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePidStore::new(dir.path());
        let me = std::process::id();

        store.write(&record("api", 2, me)).await.unwrap();
        store.write(&record("api", 1, me)).await.unwrap();

        let records = store.read_all().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].instance_num, 1);

        store.remove("api", 1).await.unwrap();
        store.remove("api", 1).await.unwrap();
        assert_eq!(store.read_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_read_all_discards_stale_and_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePidStore::new(dir.path());

        // PID 0 is never a live owner.
        store.write(&record("ghost", 1, 0)).await.unwrap();
        std::fs::write(dir.path().join("junk.1.pid"), b"not json").unwrap();

        assert!(store.read_all().await.unwrap().is_empty());
        assert!(!store.record_path("ghost", 1).exists());
        assert!(!dir.path().join("junk.1.pid").exists());
    }

    #[tokio::test]
    async fn test_missing_dir_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePidStore::new(dir.path().join("absent"));
        assert!(store.read_all().await.unwrap().is_empty());
    }
}
