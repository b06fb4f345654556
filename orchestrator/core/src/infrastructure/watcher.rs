// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! File-system watch that triggers rolling restarts.

use std::path::PathBuf;
use std::time::Duration;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Bursts of changes closer together than this collapse into one.
pub const COALESCE_WINDOW: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to create file watcher: {0}")]
    Create(#[source] notify::Error),

    #[error("failed to watch {path:?}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

pub struct ChangeWatcher {
    // Dropping the notify watcher stops delivery.
    _watcher: RecommendedWatcher,
    rx: mpsc::UnboundedReceiver<Vec<PathBuf>>,
}

impl ChangeWatcher {
    pub fn new(paths: &[PathBuf]) -> Result<Self, WatchError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) if is_change(&event.kind) => {
                    let _ = tx.send(event.paths);
                }
                Ok(_) => {}
                Err(e) => debug!("File watcher error: {}", e),
            }
        })
        .map_err(WatchError::Create)?;

        for path in paths {
            watcher
                .watch(path, RecursiveMode::Recursive)
                .map_err(|source| WatchError::Watch {
                    path: path.clone(),
                    source,
                })?;
            info!("Watching {:?} for changes", path);
        }

        Ok(Self {
            _watcher: watcher,
            rx,
        })
    }

    /// Wait for the next batch of changes. Returns the changed paths, or
    /// `None` when the watcher has shut down.
    pub async fn changed(&mut self) -> Option<Vec<PathBuf>> {
        let mut paths = self.rx.recv().await?;
        loop {
            match tokio::time::timeout(COALESCE_WINDOW, self.rx.recv()).await {
                Ok(Some(more)) => paths.extend(more),
                Ok(None) | Err(_) => break,
            }
        }
        paths.sort();
        paths.dedup();
        Some(paths)
    }
}

fn is_change(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_mutations_count_as_changes() {
        assert!(is_change(&EventKind::Create(notify::event::CreateKind::File)));
        assert!(is_change(&EventKind::Remove(notify::event::RemoveKind::Any)));
        assert!(!is_change(&EventKind::Access(notify::event::AccessKind::Any)));
    }

    #[test]
    fn test_missing_path_fails_to_watch() {
        let dir = tempfile::tempdir().unwrap();
        let result = ChangeWatcher::new(&[dir.path().join("missing")]);
        assert!(matches!(result, Err(WatchError::Watch { .. })));
    }
}
