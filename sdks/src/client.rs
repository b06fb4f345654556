// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use herd_core::domain::protocol::{BatchReport, ControlRequest, StateList};
use herd_core::domain::repository::PidRecord;
use herd_core::infrastructure::control_channel::{ChannelError, ControlClient, DEFAULT_REQUEST_TIMEOUT};
use herd_core::infrastructure::{ConnectionRef, FilePidStore, Reconciler};
use herd_core::{InstanceNum, LifecycleEvent};
use serde_json::{Map, Value};
use tracing::debug;

/// How a [`Connection`] treats its socket between calls.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Keep the socket open after each reply instead of reconnecting per call.
    pub keep_alive: bool,
    /// Per-request timeout. The server may never answer a failed call.
    pub timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            keep_alive: false,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl ConnectionOptions {
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Handle on one running supervisor.
pub struct Connection {
    key: String,
    socket_path: PathBuf,
    records: Vec<PidRecord>,
    client: Option<ControlClient>,
    options: ConnectionOptions,
    subscribed: bool,
}

impl Connection {
    /// Every live supervisor in `run_dir`. Dead sockets and stale PID files
    /// are removed along the way.
    pub async fn get_all(run_dir: &Path, options: ConnectionOptions) -> Result<Vec<Self>> {
        let found = reconciler(run_dir, &options)
            .get_all()
            .await
            .with_context(|| format!("Failed to scan {:?}", run_dir))?;
        Ok(Self::wrap(found, options))
    }

    /// Supervisors whose workers carry `name`.
    pub async fn get_by_name(run_dir: &Path, name: &str, options: ConnectionOptions) -> Result<Vec<Self>> {
        let found = reconciler(run_dir, &options)
            .get_by_name(name)
            .await
            .with_context(|| format!("Failed to look up '{}' in {:?}", name, run_dir))?;
        Ok(Self::wrap(found, options))
    }

    pub async fn get_by_key(run_dir: &Path, key: &str, options: ConnectionOptions) -> Result<Vec<Self>> {
        let found = reconciler(run_dir, &options)
            .get_by_key(key)
            .await
            .with_context(|| format!("Failed to look up key '{}' in {:?}", key, run_dir))?;
        Ok(Self::wrap(found, options))
    }

    /// Connect to a known socket path without discovery.
    pub async fn open(socket_path: &Path, options: ConnectionOptions) -> Result<Self> {
        let client = ControlClient::connect(socket_path)
            .await
            .with_context(|| format!("Failed to connect to {:?}", socket_path))?
            .with_timeout(options.timeout);
        let key = socket_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            key,
            socket_path: socket_path.to_path_buf(),
            records: Vec::new(),
            client: Some(client),
            options,
            subscribed: false,
        })
    }

    fn wrap(found: Vec<ConnectionRef>, options: ConnectionOptions) -> Vec<Self> {
        found
            .into_iter()
            .map(|found| Self {
                key: found.key,
                socket_path: found.socket_path,
                records: found.records,
                client: Some(found.client),
                options: options.clone(),
                subscribed: false,
            })
            .collect()
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn records(&self) -> &[PidRecord] {
        &self.records
    }

    /// PID of the supervisor process, when its PID records survive.
    pub fn pid(&self) -> Option<u32> {
        self.records.first().map(|r| r.pid)
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    /// Snapshots of every worker.
    pub async fn get_state(&mut self) -> Result<Vec<Value>> {
        self.state(None, None).await
    }

    /// Merge `patch` into every worker and return the new snapshots.
    pub async fn set_state(&mut self, patch: Map<String, Value>) -> Result<Vec<Value>> {
        self.state(Some(patch), None).await
    }

    /// Restart every worker; returns how many restarted.
    pub async fn restart(&mut self) -> Result<usize> {
        let value = self.call(&ControlRequest::Restart { instance_num: None }).await?;
        count(&value)
    }

    pub async fn scale(&mut self, target: usize) -> Result<BatchReport> {
        let value = self.call(&ControlRequest::Scale { target }).await?;
        serde_json::from_value(value).context("Unexpected scale reply")
    }

    pub async fn spawn(&mut self, instances: usize) -> Result<BatchReport> {
        let value = self.call(&ControlRequest::Spawn { instances }).await?;
        serde_json::from_value(value).context("Unexpected spawn reply")
    }

    /// Ask the supervisor to shut down all workers. Fire-and-forget.
    pub async fn request_stop_server(&mut self) -> Result<()> {
        let mut client = self.take_client().await?;
        let sent = client
            .publish(&ControlRequest::ShutDown { instance_num: None })
            .await;
        client.close().await;
        self.subscribed = false;
        sent.with_context(|| format!("Failed to request shutdown of '{}'", self.key))
    }

    /// Wait for the next lifecycle event. Subscribes on first use and keeps
    /// the socket open regardless of `keep_alive`. `None` once the
    /// supervisor hangs up.
    pub async fn next_event(&mut self) -> Result<Option<LifecycleEvent>> {
        if !self.subscribed {
            let mut client = self.take_client().await?;
            client
                .request(&ControlRequest::Subscribe)
                .await
                .with_context(|| format!("Failed to subscribe to '{}'", self.key))?;
            self.client = Some(client);
            self.subscribed = true;
        }
        let Some(client) = self.client.as_mut() else {
            return Ok(None);
        };
        let event = client.next_event().await?;
        if event.is_none() {
            self.subscribed = false;
            self.client = None;
        }
        Ok(event)
    }

    /// Session bound to one worker.
    pub fn instance(&mut self, instance_num: InstanceNum) -> RemoteInstance<'_> {
        RemoteInstance {
            connection: self,
            instance_num,
        }
    }

    pub async fn close(&mut self) {
        if let Some(client) = self.client.take() {
            client.close().await;
        }
        self.subscribed = false;
    }

    async fn state(
        &mut self,
        new_state: Option<Map<String, Value>>,
        instance_num: Option<InstanceNum>,
    ) -> Result<Vec<Value>> {
        let value = self
            .call(&ControlRequest::State {
                new_state,
                instance_num,
            })
            .await?;
        let list: StateList = serde_json::from_value(value).context("Unexpected state reply")?;
        Ok(list.state_list)
    }

    async fn call(&mut self, request: &ControlRequest) -> Result<Value> {
        self.call_raw(request)
            .await
            .with_context(|| format!("'{}' request to '{}' failed", request.method(), self.key))
    }

    async fn call_raw(&mut self, request: &ControlRequest) -> Result<Value, ChannelError> {
        let mut client = match self.client.take() {
            Some(client) => client,
            None => ControlClient::connect(&self.socket_path)
                .await?
                .with_timeout(self.options.timeout),
        };
        let result = client.request(request).await;

        let reusable = !matches!(&result, Err(e) if e.is_dead_socket());
        if reusable && (self.options.keep_alive || self.subscribed) {
            self.client = Some(client);
        } else {
            debug!("Closing connection to {:?}", self.socket_path);
            client.close().await;
            self.subscribed = false;
        }
        result
    }

    async fn take_client(&mut self) -> Result<ControlClient> {
        match self.client.take() {
            Some(client) => Ok(client),
            None => Ok(ControlClient::connect(&self.socket_path)
                .await
                .with_context(|| format!("Failed to connect to {:?}", self.socket_path))?
                .with_timeout(self.options.timeout)),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("key", &self.key)
            .field("socket_path", &self.socket_path)
            .field("connected", &self.client.is_some())
            .field("subscribed", &self.subscribed)
            .finish()
    }
}

/// A [`Connection`] narrowed to a single worker.
pub struct RemoteInstance<'a> {
    connection: &'a mut Connection,
    instance_num: InstanceNum,
}

impl RemoteInstance<'_> {
    pub fn instance_num(&self) -> InstanceNum {
        self.instance_num
    }

    /// Snapshot of this worker, `None` if it no longer exists.
    pub async fn get_state(&mut self) -> Result<Option<Value>> {
        let list = self.connection.state(None, Some(self.instance_num)).await?;
        Ok(list.into_iter().next())
    }

    pub async fn set_state(&mut self, patch: Map<String, Value>) -> Result<Option<Value>> {
        let list = self
            .connection
            .state(Some(patch), Some(self.instance_num))
            .await?;
        Ok(list.into_iter().next())
    }

    /// Returns `false` if the worker is gone.
    pub async fn restart(&mut self) -> Result<bool> {
        let value = self
            .connection
            .call(&ControlRequest::Restart {
                instance_num: Some(self.instance_num),
            })
            .await?;
        Ok(count(&value)? > 0)
    }

    /// Shut this worker down. The supervisor exits after its last worker, so
    /// a connection dropped mid-reply counts as success.
    pub async fn shut_down(&mut self) -> Result<()> {
        let request = ControlRequest::ShutDown {
            instance_num: Some(self.instance_num),
        };
        match self.connection.call_raw(&request).await {
            Ok(_) => Ok(()),
            Err(ChannelError::Closed) => Ok(()),
            Err(e) => Err(e).with_context(|| {
                format!(
                    "Failed to shut down instance {} of '{}'",
                    self.instance_num, self.connection.key
                )
            }),
        }
    }
}

fn reconciler(run_dir: &Path, options: &ConnectionOptions) -> Reconciler {
    Reconciler::new(run_dir, Arc::new(FilePidStore::new(run_dir))).with_timeout(options.timeout)
}

fn count(value: &Value) -> Result<usize> {
    value
        .as_u64()
        .map(|n| n as usize)
        .with_context(|| format!("Expected a count, got {}", value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_count_parses_numbers_only() {
        assert_eq!(count(&json!(3)).unwrap(), 3);
        assert!(count(&json!("3")).is_err());
    }

    #[test]
    fn test_default_options_close_after_each_call() {
        let options = ConnectionOptions::default();
        assert!(!options.keep_alive);
        assert_eq!(options.timeout, DEFAULT_REQUEST_TIMEOUT);
        assert!(options.keep_alive(true).keep_alive);
    }

    #[tokio::test]
    async fn test_open_missing_socket_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = Connection::open(&dir.path().join("none.sock"), ConnectionOptions::default()).await;
        assert!(result.is_err());
    }
}
