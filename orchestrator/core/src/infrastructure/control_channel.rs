// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Control Channel
//!
//! Local request/publish RPC over a Unix domain socket.
//!
//! The server side ([`ControlServer`]) accepts any number of connections.
//! Each connection is split into a reader, which decodes frames and
//! dispatches requests to a [`ControlHandler`] concurrently, and a single
//! writer fed by an mpsc queue, so replies and pushed lifecycle events never
//! interleave mid-line.
//!
//! The client side ([`ControlClient`]) owns one connection, correlates replies
//! by request id and buffers any event publishes that arrive while it is
//! waiting for a reply. Every request is bounded by the client's own timeout.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::events::LifecycleEvent;
use crate::domain::protocol::{ControlRequest, Frame, EVENT_METHOD};
use crate::infrastructure::event_bus::{EventBus, EventBusError, EventReceiver};

/// Upper bound for a single frame.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("control socket I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("another supervisor is already listening on {0:?}")]
    AddrInUse(PathBuf),

    #[error("frame codec error: {0}")]
    Codec(String),

    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("'{method}' got no reply within {after:?}")]
    Timeout { method: String, after: Duration },

    #[error("connection closed by peer")]
    Closed,

    #[error("'{method}' failed remotely: {message}")]
    Remote { method: String, message: String },
}

impl From<LinesCodecError> for ChannelError {
    fn from(e: LinesCodecError) -> Self {
        match e {
            LinesCodecError::Io(io) => Self::Io(io),
            other => Self::Codec(other.to_string()),
        }
    }
}

impl ChannelError {
    /// Whether this error means nobody owns the socket any more.
    pub fn is_dead_socket(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::NotFound
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::TimedOut
            ),
            Self::Closed => true,
            _ => false,
        }
    }
}

/// Executes decoded control requests on behalf of the server.
#[async_trait]
pub trait ControlHandler: Send + Sync + 'static {
    async fn handle(&self, request: ControlRequest) -> anyhow::Result<Value>;
}

/// A bound control socket. Dropping it without [`ControlServer::close`]
/// leaves the accept loop running until the runtime shuts down.
pub struct ControlServer {
    path: PathBuf,
    cancel: CancellationToken,
    accept_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ControlServer {
    /// Bind `path`, replacing a stale socket file but refusing to steal one
    /// that a live supervisor still answers on.
    pub async fn bind(
        path: &Path,
        handler: Arc<dyn ControlHandler>,
        events: EventBus,
    ) -> Result<Self, ChannelError> {
        if path.exists() {
            if probe(path).await {
                return Err(ChannelError::AddrInUse(path.to_path_buf()));
            }
            warn!("Removing stale control socket {:?}", path);
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let listener = UnixListener::bind(path)?;
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
        }
        info!("Control channel listening on {:?}", path);

        let cancel = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(listener, handler, events, cancel.clone()));

        Ok(Self {
            path: path.to_path_buf(),
            cancel,
            accept_task: parking_lot::Mutex::new(Some(accept_task)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop accepting connections and remove the socket file. Connections
    /// already accepted finish their in-flight requests.
    pub async fn close(&self) {
        self.cancel.cancel();
        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => debug!("Removed control socket {:?}", self.path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove control socket {:?}: {}", self.path, e),
        }
    }
}

async fn accept_loop(
    listener: UnixListener,
    handler: Arc<dyn ControlHandler>,
    events: EventBus,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    tokio::spawn(serve_connection(stream, handler.clone(), events.clone()));
                }
                Err(e) => {
                    warn!("Control channel accept failed: {}", e);
                }
            },
        }
    }
    debug!("Control channel accept loop stopped");
}

async fn serve_connection(stream: UnixStream, handler: Arc<dyn ControlHandler>, events: EventBus) {
    let framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LEN));
    let (mut sink, mut lines) = framed.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let closed = CancellationToken::new();

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let line = match serde_json::to_string(&frame) {
                Ok(line) => line,
                Err(e) => {
                    error!("Failed to encode control frame: {}", e);
                    continue;
                }
            };
            if let Err(e) = sink.send(line).await {
                debug!("Control connection write failed: {}", e);
                break;
            }
        }
    });

    let mut subscribed = false;
    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                debug!("Control connection read failed: {}", e);
                break;
            }
        };
        let frame: Frame = match serde_json::from_str(&line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping malformed control frame: {}", e);
                continue;
            }
        };

        let (id, method, args) = match frame {
            Frame::Request { id, method, args } => (Some(id), method, args),
            Frame::Publish { method, args } => (None, method, args),
            Frame::Reply { .. } | Frame::Error { .. } => {
                debug!("Ignoring reply frame sent to the server");
                continue;
            }
        };

        let request = match ControlRequest::parse(&method, &args) {
            Ok(request) => request,
            Err(e) => {
                warn!("Rejecting control call: {}", e);
                if let Some(id) = id {
                    let _ = tx.send(Frame::Error {
                        id,
                        method,
                        error: e.to_string(),
                    });
                }
                continue;
            }
        };

        if request == ControlRequest::Subscribe && !subscribed {
            subscribed = true;
            tokio::spawn(forward_events(events.subscribe(), tx.clone(), closed.clone()));
        }

        let handler = handler.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            match handler.handle(request).await {
                Ok(result) => {
                    if let Some(id) = id {
                        let _ = tx.send(Frame::Reply { id, method, result });
                    }
                }
                Err(e) => {
                    error!("Control handler '{}' failed: {:#}", method, e);
                    if let Some(id) = id {
                        let _ = tx.send(Frame::Error {
                            id,
                            method,
                            error: e.to_string(),
                        });
                    }
                }
            }
        });
    }

    // Reader is done: stop event forwarding, let in-flight handlers finish.
    closed.cancel();
    drop(tx);
    let _ = writer.await;
}

async fn forward_events(mut receiver: EventReceiver, tx: mpsc::UnboundedSender<Frame>, closed: CancellationToken) {
    loop {
        let event = tokio::select! {
            _ = closed.cancelled() => break,
            event = receiver.recv() => event,
        };
        match event {
            Ok(event) => {
                let Ok(value) = serde_json::to_value(&event) else {
                    continue;
                };
                let frame = Frame::Publish {
                    method: EVENT_METHOD.to_string(),
                    args: vec![value],
                };
                if tx.send(frame).is_err() {
                    break;
                }
            }
            Err(EventBusError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
}

/// Whether something answers on `path`.
pub async fn probe(path: &Path) -> bool {
    matches!(
        tokio::time::timeout(CONNECT_TIMEOUT, UnixStream::connect(path)).await,
        Ok(Ok(_))
    )
}

/// One client connection to a control socket.
pub struct ControlClient {
    path: PathBuf,
    framed: Framed<UnixStream, LinesCodec>,
    next_id: u64,
    timeout: Duration,
    events: VecDeque<LifecycleEvent>,
}

impl ControlClient {
    pub async fn connect(path: &Path) -> Result<Self, ChannelError> {
        let stream = match tokio::time::timeout(CONNECT_TIMEOUT, UnixStream::connect(path)).await {
            Ok(stream) => stream?,
            Err(_) => {
                return Err(ChannelError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connect timed out",
                )))
            }
        };
        Ok(Self {
            path: path.to_path_buf(),
            framed: Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LEN)),
            next_id: 1,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            events: VecDeque::new(),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Send a request and wait for its reply.
    pub async fn request(&mut self, request: &ControlRequest) -> Result<Value, ChannelError> {
        let id = self.next_id;
        self.next_id += 1;
        let method = request.method();

        self.send(&Frame::Request {
            id,
            method: method.to_string(),
            args: request.to_args(),
        })
        .await?;

        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            let frame = match tokio::time::timeout_at(deadline, self.read_frame()).await {
                Ok(frame) => frame?,
                Err(_) => {
                    return Err(ChannelError::Timeout {
                        method: method.to_string(),
                        after: self.timeout,
                    })
                }
            };
            match frame {
                Frame::Reply { id: reply_id, result, .. } if reply_id == id => return Ok(result),
                Frame::Error {
                    id: reply_id,
                    method,
                    error,
                } if reply_id == id => {
                    return Err(ChannelError::Remote {
                        method,
                        message: error,
                    })
                }
                other => self.buffer(other),
            }
        }
    }

    /// Fire-and-forget.
    pub async fn publish(&mut self, request: &ControlRequest) -> Result<(), ChannelError> {
        self.send(&Frame::Publish {
            method: request.method().to_string(),
            args: request.to_args(),
        })
        .await
    }

    /// Next lifecycle event pushed by the server, `None` once it hangs up.
    /// Only arrives after a `subscribe` request on this connection.
    pub async fn next_event(&mut self) -> Result<Option<LifecycleEvent>, ChannelError> {
        loop {
            if let Some(event) = self.events.pop_front() {
                return Ok(Some(event));
            }
            match self.read_frame().await {
                Ok(frame) => self.buffer(frame),
                Err(ChannelError::Closed) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn close(self) {
        let mut stream = self.framed.into_inner();
        let _ = tokio::io::AsyncWriteExt::shutdown(&mut stream).await;
    }

    async fn send(&mut self, frame: &Frame) -> Result<(), ChannelError> {
        let line = serde_json::to_string(frame)?;
        self.framed.send(line).await?;
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<Frame, ChannelError> {
        loop {
            match self.framed.next().await {
                None => return Err(ChannelError::Closed),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(line)) => match serde_json::from_str::<Frame>(&line) {
                    Ok(frame) => return Ok(frame),
                    Err(e) => warn!("Dropping malformed frame from {:?}: {}", self.path, e),
                },
            }
        }
    }

    fn buffer(&mut self, frame: Frame) {
        match frame {
            Frame::Publish { method, mut args } if method == EVENT_METHOD && !args.is_empty() => {
                match serde_json::from_value::<LifecycleEvent>(args.swap_remove(0)) {
                    Ok(event) => self.events.push_back(event),
                    Err(e) => debug!("Dropping undecodable event: {}", e),
                }
            }
            other => debug!("Ignoring unexpected frame: {:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl ControlHandler for Echo {
        async fn handle(&self, request: ControlRequest) -> anyhow::Result<Value> {
            match request {
                ControlRequest::State { new_state, .. } => {
                    Ok(json!({"stateList": [new_state.map(Value::Object).unwrap_or(Value::Null)]}))
                }
                ControlRequest::Restart { .. } => anyhow::bail!("restart exploded"),
                ControlRequest::Subscribe => Ok(Value::Bool(true)),
                other => Ok(json!(other.method())),
            }
        }
    }

    async fn server(dir: &Path) -> (ControlServer, PathBuf) {
        let path = dir.join("echo.sock");
        let server = ControlServer::bind(&path, Arc::new(Echo), EventBus::new(16))
            .await
            .unwrap();
        (server, path)
    }

    #[tokio::test]
    async fn test_request_reply_preserves_non_ascii() {
        let dir = tempfile::tempdir().unwrap();
        let (server, path) = server(dir.path()).await;

        let mut client = ControlClient::connect(&path).await.unwrap();
        let mut patch = serde_json::Map::new();
        patch.insert("test".into(), json!("掂"));
        let result = client
            .request(&ControlRequest::State {
                new_state: Some(patch),
                instance_num: None,
            })
            .await
            .unwrap();
        assert_eq!(result["stateList"][0]["test"], "掂");

        client.close().await;
        server.close().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_handler_failure_becomes_error_frame() {
        let dir = tempfile::tempdir().unwrap();
        let (server, path) = server(dir.path()).await;

        let mut client = ControlClient::connect(&path).await.unwrap();
        let err = client
            .request(&ControlRequest::Restart { instance_num: None })
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Remote { ref method, .. } if method == "restart"));

        // The connection survives a failed call.
        let ok = client.request(&ControlRequest::Scale { target: 1 }).await.unwrap();
        assert_eq!(ok, json!("scale"));
        server.close().await;
    }

    #[tokio::test]
    async fn test_unknown_method_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (server, path) = server(dir.path()).await;

        let stream = UnixStream::connect(&path).await.unwrap();
        let mut framed = Framed::new(stream, LinesCodec::new());
        framed
            .send(r#"{"kind":"request","id":9,"method":"reboot","args":[]}"#.to_string())
            .await
            .unwrap();
        let line = framed.next().await.unwrap().unwrap();
        let frame: Frame = serde_json::from_str(&line).unwrap();
        assert!(matches!(frame, Frame::Error { id: 9, .. }));
        server.close().await;
    }

    #[tokio::test]
    async fn test_bind_refuses_live_socket_and_replaces_stale_one() {
        let dir = tempfile::tempdir().unwrap();
        let (server, path) = server(dir.path()).await;

        let second = ControlServer::bind(&path, Arc::new(Echo), EventBus::new(4)).await;
        assert!(matches!(second, Err(ChannelError::AddrInUse(_))));
        server.close().await;

        // A leftover file with no listener is garbage.
        std::fs::write(&path, b"").unwrap();
        let replacement = ControlServer::bind(&path, Arc::new(Echo), EventBus::new(4))
            .await
            .unwrap();
        assert!(probe(&path).await);
        replacement.close().await;
    }

    #[tokio::test]
    async fn test_subscribed_connection_receives_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.sock");
        let bus = EventBus::new(16);
        let server = ControlServer::bind(&path, Arc::new(Echo), bus.clone()).await.unwrap();

        let mut client = ControlClient::connect(&path).await.unwrap();
        client.request(&ControlRequest::Subscribe).await.unwrap();

        bus.publish(LifecycleEvent {
            name: "echo".into(),
            instance_num: Some(1),
            event: crate::domain::events::WorkerEvent::Restart,
            at: chrono::Utc::now(),
        });

        let event = tokio::time::timeout(Duration::from_secs(2), client.next_event())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(event.instance_num, Some(1));
        server.close().await;
    }

    #[tokio::test]
    async fn test_connect_to_missing_socket_is_dead() {
        let dir = tempfile::tempdir().unwrap();
        let err = match ControlClient::connect(&dir.path().join("none.sock")).await {
            Err(e) => e,
            Ok(_) => panic!("connect should fail"),
        };
        assert!(err.is_dead_socket());
    }
}
