#![allow(clippy::result_large_err)]
//! # Taskline Core
//!
//! Asynchronous job queues with durable state, bounded concurrency, retries
//! and crash recovery.
//!
//! ## Architecture
//!
//! - **Jobs**: typed queues over a pluggable strategy (in-memory, PostgreSQL, Redis)
//! - **Recovery**: heartbeat leases and a stale-lock scan for jobs orphaned by crashes
//! - **Bridge**: typed request/response messages to a separate worker process
//! - **Telemetry**: structured logging, OpenTelemetry export and Prometheus metrics

pub mod bridge;
pub mod config;
pub mod error;
pub mod jobs;
pub mod telemetry;

pub use error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, Result, TasklineError};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::bridge::{WorkerHost, WorkerMessage, WorkerService};
    pub use crate::config::Config;
    pub use crate::error::{ErrorCode, ErrorContext, Result, TasklineError};
    pub use crate::jobs::{
        build_strategy, Job, JobError, JobId, JobOptions, JobQueue, JobQueueService, JobState, RunningJob,
        SubscribableJob, UpdatesOptions,
    };
    pub use crate::telemetry::{RequestContext, SerializedRequestContext};
    pub use crate::worker_message;
}
