//! Client side of the worker bridge.
//!
//! All sends share one connection. Callers that find no live connection
//! serialize on `connect_lock` and re-check after acquiring it, so a burst of
//! first sends opens exactly one connection.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::wire::{self, Frame};
use super::WorkerMessage;
use crate::config::WorkerConfig;
use crate::error::{ErrorCode, Result, TasklineError};
use crate::telemetry::WorkerMetrics;

/// Opens transports to the worker process.
#[async_trait]
pub trait WorkerConnector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    async fn connect(&self) -> Result<Self::Stream>;
}

/// TCP transport.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl WorkerConnector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self) -> Result<TcpStream> {
        let stream = TcpStream::connect(&self.addr).await.map_err(|e| {
            TasklineError::with_internal(
                ErrorCode::WorkerUnreachable,
                "The worker process could not be reached",
                format!("{}: {}", self.addr, e),
            )
        })?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

type Reply = oneshot::Sender<Result<serde_json::Value>>;

struct Connection {
    outbound: mpsc::UnboundedSender<Frame>,
    pending: Mutex<HashMap<u64, Reply>>,
    dead: CancellationToken,
}

impl Connection {
    fn spawn<S>(io: S, shutdown: CancellationToken) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (mut sink, mut stream) = wire::framed(io).split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();
        let conn = Arc::new(Self {
            outbound,
            pending: Mutex::new(HashMap::new()),
            dead: CancellationToken::new(),
        });

        let dead = conn.dead.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = dead.cancelled() => break,
                    frame = outbound_rx.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };
                let bytes = match wire::encode(&frame) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        e.log();
                        continue;
                    }
                };
                if let Err(e) = sink.send(bytes).await {
                    warn!(error = %e, "Writing to worker failed");
                    dead.cancel();
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader = conn.clone();
        tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break "worker service closed".to_string(),
                    _ = reader.dead.cancelled() => break "connection write failed".to_string(),
                    next = stream.next() => match next {
                        Some(Ok(bytes)) => reader.dispatch(&bytes),
                        Some(Err(e)) => break e.to_string(),
                        None => break "connection closed by worker".to_string(),
                    },
                }
            };
            reader.fail_all(&reason);
        });

        conn
    }

    fn dispatch(&self, bytes: &[u8]) {
        match wire::decode(bytes) {
            Ok(Frame::Response { id, outcome }) => match self.pending.lock().remove(&id) {
                Some(reply) => {
                    let _ = reply.send(outcome.into_result());
                }
                None => debug!(request_id = id, "Response for an abandoned request"),
            },
            Ok(Frame::Request { pattern, .. }) => warn!(%pattern, "Ignoring request frame sent by worker"),
            Err(e) => e.log(),
        }
    }

    fn is_alive(&self) -> bool {
        !self.dead.is_cancelled()
    }

    /// Mark dead and reject every pending request.
    fn fail_all(&self, reason: &str) {
        self.dead.cancel();
        let pending: Vec<Reply> = self.pending.lock().drain().map(|(_, reply)| reply).collect();
        if !pending.is_empty() {
            warn!(pending = pending.len(), %reason, "Worker connection lost with requests in flight");
        }
        for reply in pending {
            let _ = reply.send(Err(TasklineError::worker_disconnected(reason.to_string())));
        }
    }
}

/// Sends [`WorkerMessage`]s to the worker process.
pub struct WorkerService<C: WorkerConnector = TcpConnector> {
    connector: C,
    current: RwLock<Option<Arc<Connection>>>,
    connect_lock: tokio::sync::Mutex<()>,
    next_id: AtomicU64,
    request_timeout: Option<Duration>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl WorkerService<TcpConnector> {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(TcpConnector::new(config.connect.clone())).with_request_timeout(config.request_timeout)
    }
}

impl<C: WorkerConnector> WorkerService<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            current: RwLock::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            next_id: AtomicU64::new(1),
            request_timeout: None,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.live().is_some()
    }

    fn live(&self) -> Option<Arc<Connection>> {
        self.current.read().as_ref().filter(|c| c.is_alive()).cloned()
    }

    fn closed_error() -> TasklineError {
        TasklineError::new(ErrorCode::WorkerUnreachable, "The worker service has been closed")
    }

    async fn connection(&self) -> Result<Arc<Connection>> {
        if let Some(conn) = self.live() {
            return Ok(conn);
        }

        let _guard = self.connect_lock.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(Self::closed_error());
        }
        if let Some(conn) = self.live() {
            return Ok(conn);
        }

        let io = self.connector.connect().await?;
        let conn = Connection::spawn(io, self.shutdown.child_token());
        *self.current.write() = Some(conn.clone());
        info!("Connected to worker");
        Ok(conn)
    }

    /// Send a message and wait for the worker's response.
    pub async fn send<M: WorkerMessage>(&self, message: M) -> Result<M::Response> {
        let outcome = self.request::<M>(message).await;
        let label = match &outcome {
            Ok(_) => "ok",
            Err(e) if e.code() == ErrorCode::WorkerHandlerFailed => "handler_error",
            Err(_) => "transport_error",
        };
        WorkerMetrics::request(M::PATTERN, label);
        outcome
    }

    async fn request<M: WorkerMessage>(&self, message: M) -> Result<M::Response> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Self::closed_error());
        }
        let data = serde_json::to_value(message.into_data()).map_err(|e| {
            TasklineError::with_internal(ErrorCode::SerializationError, "Worker message could not be serialized", e.to_string())
        })?;

        let conn = self.connection().await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, response) = oneshot::channel();
        conn.pending.lock().insert(id, reply);

        let frame = Frame::Request {
            id,
            pattern: M::PATTERN.to_string(),
            data,
        };
        let sent = conn.outbound.send(frame).is_ok() && conn.is_alive();
        if !sent && conn.pending.lock().remove(&id).is_some() {
            return Err(TasklineError::worker_disconnected("connection closed before the request was sent"));
        }

        let value = match self.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, response).await {
                Ok(received) => received,
                Err(_) => {
                    conn.pending.lock().remove(&id);
                    return Err(TasklineError::new(
                        ErrorCode::Timeout,
                        format!("Worker did not answer '{}' within {:?}", M::PATTERN, limit),
                    ));
                }
            },
            None => response.await,
        }
        .map_err(|_| TasklineError::worker_disconnected("response channel dropped"))??;

        serde_json::from_value(value).map_err(|e| {
            TasklineError::with_internal(
                ErrorCode::DeserializationError,
                "Worker response could not be decoded",
                e.to_string(),
            )
        })
    }

    /// Tear down the connection. In-flight sends fail with
    /// `WorkerDisconnected`, later sends with `WorkerUnreachable`.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _guard = self.connect_lock.lock().await;
        let current = self.current.write().take();
        if let Some(conn) = current {
            conn.fail_all("worker service closed");
        }
        self.shutdown.cancel();
        info!("Worker service closed");
    }
}
