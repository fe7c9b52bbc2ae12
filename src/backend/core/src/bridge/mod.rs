//! Request/response bridge between an application process and a worker process.
//!
//! ```text
//! WorkerService::send(M) ──Frame::Request{id, M::PATTERN, data}──▶ WorkerHost
//!                        ◀──Frame::Response{id, outcome}────────── handler(M)
//! ```

pub mod client;
pub mod host;
pub mod message;
pub mod wire;

pub use client::{TcpConnector, WorkerConnector, WorkerService};
pub use host::{invalid_request, WorkerHost};
pub use message::WorkerMessage;
pub use wire::{Frame, Outcome};
