//! Worker bridge behavior over in-memory pipes and real TCP.
//!
//! Tests cover:
//! - One connection under racing first sends
//! - Pattern and handler errors
//! - Disconnects, reconnects and timeouts

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio_util::sync::CancellationToken;

use taskline_core::bridge::{
    invalid_request, TcpConnector, WorkerConnector, WorkerHost, WorkerMessage, WorkerService,
};
use taskline_core::error::{ErrorCode, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sum {
    pub a: i64,
    pub b: i64,
}

taskline_core::worker_message! {
    #[derive(Debug)]
    pub struct Add(Sum) -> i64 = "math.add";
}

taskline_core::worker_message! {
    #[derive(Debug)]
    pub struct Divide(Sum) -> i64 = "math.divide";
}

taskline_core::worker_message! {
    #[derive(Debug)]
    pub struct Unregistered(()) -> () = "math.unregistered";
}

fn host() -> Arc<WorkerHost> {
    let host = WorkerHost::new();
    host.register::<Add, _, _>(|m| async move { Ok(m.0.a + m.0.b) }).unwrap();
    host.register::<Divide, _, _>(|m| async move {
        if m.0.b == 0 {
            return Err(invalid_request("division by zero"));
        }
        Ok(m.0.a / m.0.b)
    })
    .unwrap();
    Arc::new(host)
}

/// Duplex transport that counts connections. Without a host the server half
/// is parked so tests can sever it.
struct CountingConnector {
    host: Option<Arc<WorkerHost>>,
    opened: Arc<AtomicUsize>,
    connect_delay: Duration,
    parked: Arc<Mutex<Vec<DuplexStream>>>,
}

impl CountingConnector {
    fn serving(host: Arc<WorkerHost>) -> Self {
        Self {
            host: Some(host),
            opened: Arc::new(AtomicUsize::new(0)),
            connect_delay: Duration::from_millis(20),
            parked: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn silent() -> Self {
        Self {
            host: None,
            opened: Arc::new(AtomicUsize::new(0)),
            connect_delay: Duration::ZERO,
            parked: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl WorkerConnector for CountingConnector {
    type Stream = DuplexStream;

    async fn connect(&self) -> Result<DuplexStream> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.connect_delay).await;
        let (client, server) = tokio::io::duplex(64 * 1024);
        match &self.host {
            Some(host) => {
                tokio::spawn(host.clone().serve_connection(server, CancellationToken::new()));
            }
            None => self.parked.lock().push(server),
        }
        Ok(client)
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

// ============================================================================
// Connection Discipline
// ============================================================================

#[tokio::test]
async fn test_racing_first_sends_share_one_connection() {
    let connector = CountingConnector::serving(host());
    let opened = connector.opened.clone();
    let service = Arc::new(WorkerService::new(connector));

    let mut handles = Vec::new();
    for i in 0..32 {
        let service = service.clone();
        handles.push(tokio::spawn(async move { service.send(Add::new(Sum { a: i, b: 1 })).await }));
    }
    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.await.unwrap().unwrap(), i as i64 + 1);
    }

    assert_eq!(opened.load(Ordering::SeqCst), 1);
    assert!(service.is_connected());
}

#[tokio::test]
async fn test_disconnect_rejects_pending_and_next_send_reconnects() {
    let connector = CountingConnector::silent();
    let opened = connector.opened.clone();
    let parked = connector.parked.clone();
    let service = Arc::new(WorkerService::new(connector));

    let pending = {
        let service = service.clone();
        tokio::spawn(async move { service.send(Add::new(Sum { a: 1, b: 2 })).await })
    };
    wait_for(|| !parked.lock().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    parked.lock().clear();

    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err.code(), ErrorCode::WorkerDisconnected);
    wait_for(|| !service.is_connected()).await;

    let retry = {
        let service = service.clone();
        tokio::spawn(async move { service.send(Add::new(Sum { a: 1, b: 2 })).await })
    };
    wait_for(|| !parked.lock().is_empty()).await;
    assert_eq!(opened.load(Ordering::SeqCst), 2);
    parked.lock().clear();
    assert_eq!(retry.await.unwrap().unwrap_err().code(), ErrorCode::WorkerDisconnected);
}

#[tokio::test]
async fn test_close_rejects_in_flight_and_later_sends() {
    let connector = CountingConnector::silent();
    let parked = connector.parked.clone();
    let service = Arc::new(WorkerService::new(connector));

    let pending = {
        let service = service.clone();
        tokio::spawn(async move { service.send(Add::new(Sum { a: 1, b: 2 })).await })
    };
    wait_for(|| !parked.lock().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    service.close().await;
    assert_eq!(pending.await.unwrap().unwrap_err().code(), ErrorCode::WorkerDisconnected);

    let err = service.send(Add::new(Sum { a: 1, b: 2 })).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::WorkerUnreachable);
}

#[tokio::test]
async fn test_request_timeout() {
    let service = WorkerService::new(CountingConnector::silent()).with_request_timeout(Some(Duration::from_millis(50)));
    let err = service.send(Add::new(Sum { a: 1, b: 2 })).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::Timeout);
}

// ============================================================================
// Failure Semantics
// ============================================================================

#[tokio::test]
async fn test_unknown_pattern_is_reported() {
    let service = WorkerService::new(CountingConnector::serving(host()));
    let err = service.send(Unregistered::new(())).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::WorkerPatternNotRegistered);
}

#[tokio::test]
async fn test_handler_error_is_a_business_failure() {
    let service = WorkerService::new(CountingConnector::serving(host()));
    let err = service.send(Divide::new(Sum { a: 1, b: 0 })).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::WorkerHandlerFailed);
    assert!(err.user_message().contains("division by zero"));

    // The connection survives business failures.
    assert_eq!(service.send(Divide::new(Sum { a: 9, b: 3 })).await.unwrap(), 3);
}

#[tokio::test]
async fn test_duplicate_registration_conflicts() {
    let host = host();
    let err = host.register::<Add, _, _>(|_m| async move { Ok(0) }).unwrap_err();
    assert_eq!(err.code(), ErrorCode::WorkerPatternConflict);
    assert_eq!(host.patterns(), vec!["math.add", "math.divide"]);
}

// ============================================================================
// TCP
// ============================================================================

#[tokio::test]
async fn test_round_trip_over_tcp() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let server = tokio::spawn(host().serve(listener, shutdown.clone()));

    let service = WorkerService::new(TcpConnector::new(addr.to_string()));
    assert_eq!(service.send(Add::new(Sum { a: 40, b: 2 })).await.unwrap(), 42);
    assert_eq!(service.send(Divide::new(Sum { a: 40, b: 2 })).await.unwrap(), 20);

    service.close().await;
    shutdown.cancel();
    server.await.unwrap().unwrap();
}
