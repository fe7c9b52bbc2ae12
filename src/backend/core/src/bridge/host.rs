//! Worker side of the bridge: dispatches requests by pattern.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn, Instrument};

use super::wire::{self, Frame, Outcome};
use super::WorkerMessage;
use crate::error::{ErrorCode, Result, TasklineError};

type Handler = Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, Result<serde_json::Value>> + Send + Sync>;

/// Registry of message handlers plus the server loop.
#[derive(Default)]
pub struct WorkerHost {
    handlers: DashMap<&'static str, Handler>,
}

impl WorkerHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `M::PATTERN`. A pattern can be registered once.
    pub fn register<M, F, Fut>(&self, handler: F) -> Result<()>
    where
        M: WorkerMessage,
        F: Fn(M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<M::Response>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: Handler = Arc::new(move |value: serde_json::Value| -> BoxFuture<'static, Result<serde_json::Value>> {
            let handler = handler.clone();
            async move {
                let data: M::Data = serde_json::from_value(value)?;
                let response = handler(M::new(data)).await?;
                Ok(serde_json::to_value(response)?)
            }
            .boxed()
        });

        match self.handlers.entry(M::PATTERN) {
            Entry::Occupied(_) => Err(TasklineError::pattern_conflict(M::PATTERN)),
            Entry::Vacant(slot) => {
                slot.insert(erased);
                debug!(pattern = M::PATTERN, "Worker handler registered");
                Ok(())
            }
        }
    }

    pub fn patterns(&self) -> Vec<&'static str> {
        let mut patterns: Vec<&'static str> = self.handlers.iter().map(|h| *h.key()).collect();
        patterns.sort_unstable();
        patterns
    }

    /// Answer one request.
    pub async fn dispatch(&self, pattern: &str, data: serde_json::Value) -> Outcome {
        let handler = self.handlers.get(pattern).map(|h| h.value().clone());
        let Some(handler) = handler else {
            return Outcome::failure(&TasklineError::pattern_not_registered(pattern));
        };

        match AssertUnwindSafe(handler(data)).catch_unwind().await {
            Ok(Ok(value)) => Outcome::Ok { value },
            Ok(Err(e)) => {
                warn!(%pattern, error = %e, "Worker handler failed");
                Outcome::failure(&TasklineError::worker_handler_failed(pattern, e.user_message()))
            }
            Err(_) => {
                warn!(%pattern, "Worker handler panicked");
                Outcome::failure(&TasklineError::worker_handler_failed(pattern, "handler panicked"))
            }
        }
    }

    /// Accept connections until `shutdown`, then wait for open connections to finish.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let connections = TaskTracker::new();
        info!(addr = ?listener.local_addr().ok(), patterns = ?self.patterns(), "Worker host listening");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(error = %e, "Could not set TCP_NODELAY");
                        }
                        connections.spawn(
                            self.clone()
                                .serve_connection(stream, shutdown.child_token())
                                .instrument(tracing::info_span!("worker_connection", %peer)),
                        );
                    }
                    Err(e) => warn!(error = %e, "Accepting worker connection failed"),
                },
            }
        }

        connections.close();
        connections.wait().await;
        info!("Worker host stopped");
        Ok(())
    }

    /// Serve one connection. Requests run concurrently; responses go back in
    /// completion order.
    pub async fn serve_connection<S>(self: Arc<Self>, io: S, shutdown: CancellationToken)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (mut sink, mut stream) = wire::framed(io).split();
        let (responses, mut responses_rx) = mpsc::unbounded_channel::<Frame>();

        let writer = tokio::spawn(async move {
            while let Some(frame) = responses_rx.recv().await {
                let bytes = match wire::encode(&frame) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        e.log();
                        continue;
                    }
                };
                if let Err(e) = sink.send(bytes).await {
                    debug!(error = %e, "Client went away before its response");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let requests = TaskTracker::new();
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = stream.next() => next,
            };
            let bytes = match next {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => {
                    warn!(error = %e, "Reading worker request failed");
                    break;
                }
                None => break,
            };

            match wire::decode(&bytes) {
                Ok(Frame::Request { id, pattern, data }) => {
                    let host = self.clone();
                    let responses = responses.clone();
                    requests.spawn(async move {
                        let outcome = host.dispatch(&pattern, data).await;
                        let _ = responses.send(Frame::Response { id, outcome });
                    });
                }
                Ok(Frame::Response { id, .. }) => {
                    warn!(request_id = id, "Ignoring response frame sent by client");
                }
                Err(e) => {
                    e.log();
                    break;
                }
            }
        }

        requests.close();
        requests.wait().await;
        drop(responses);
        let _ = writer.await;
    }
}

impl std::fmt::Debug for WorkerHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHost").field("patterns", &self.patterns()).finish()
    }
}

/// Shorthand for an error a handler returns for bad input.
pub fn invalid_request(message: impl Into<String>) -> TasklineError {
    TasklineError::new(ErrorCode::InvalidInput, message.into())
}
