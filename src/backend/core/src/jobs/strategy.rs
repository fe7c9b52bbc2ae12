//! The backend contract every job queue strategy implements.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::recovery::RecoveryReport;
use super::service::QueueContext;
use super::{JobError, JobId, JobRecord, JobState};
use crate::error::Result;

/// Future returned by a type-erased process function.
pub type ProcessFuture = BoxFuture<'static, std::result::Result<serde_json::Value, JobError>>;

/// Type-erased process function bound to a queue.
pub type ProcessFn = Arc<dyn Fn(ActiveJob) -> ProcessFuture + Send + Sync>;

/// A job to persist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub queue_name: String,
    pub data: serde_json::Value,
    pub retries: u32,
}

/// Filter and page for admin listings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobListOptions {
    /// Empty means every queue
    #[serde(default)]
    pub queue_names: Vec<String>,
    /// Empty means every state
    #[serde(default)]
    pub states: Vec<JobState>,
    #[serde(default)]
    pub skip: usize,
    #[serde(default)]
    pub take: Option<usize>,
}

impl JobListOptions {
    pub fn matches(&self, record: &JobRecord) -> bool {
        (self.queue_names.is_empty() || self.queue_names.iter().any(|q| q == &record.queue_name))
            && (self.states.is_empty() || self.states.contains(&record.state))
    }
}

/// A page of jobs plus the total number matching the filter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobList {
    pub items: Vec<JobRecord>,
    pub total: usize,
}

/// A claimed job as seen by its process function.
pub struct ActiveJob {
    pub record: JobRecord,
    progress: watch::Sender<u8>,
    cancel: CancellationToken,
}

impl ActiveJob {
    pub fn new(record: JobRecord, progress: watch::Sender<u8>, cancel: CancellationToken) -> Self {
        Self {
            record,
            progress,
            cancel,
        }
    }

    /// Report progress (clamped to 100). Only the latest value is persisted.
    pub fn set_progress(&self, progress: u8) {
        self.progress.send_replace(progress.min(100));
    }

    /// Whether cancellation was requested while this job was running.
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

impl std::fmt::Debug for ActiveJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveJob")
            .field("id", &self.record.id)
            .field("queue_name", &self.record.queue_name)
            .field("attempts", &self.record.attempts)
            .finish()
    }
}

/// Wrap a process function so a panic becomes a rejection instead of
/// tearing down the task that runs it.
pub fn catch_panics(process: ProcessFn) -> ProcessFn {
    Arc::new(move |job: ActiveJob| {
        let process = process.clone();
        match std::panic::catch_unwind(AssertUnwindSafe(move || process(job))) {
            Ok(fut) => AssertUnwindSafe(fut)
                .catch_unwind()
                .map(|outcome| outcome.unwrap_or_else(|panic| Err(panic_error(panic))))
                .boxed(),
            Err(panic) => futures::future::ready(Err(panic_error(panic))).boxed(),
        }
    })
}

fn panic_error(panic: Box<dyn std::any::Any + Send>) -> JobError {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    JobError::new(format!("process function panicked: {}", message)).with_code("PANIC")
}

/// Backend contract for job queues.
///
/// Delivery is at least once: every delivery is claimed with exactly one
/// `Pending -> Running` write, and process functions must be idempotent.
#[async_trait]
pub trait JobQueueStrategy: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &'static str;

    /// Connect, run crash recovery and activate buffered `start` calls.
    /// Calling it again is a no-op.
    async fn init(&self, ctx: &QueueContext) -> Result<()>;

    /// Persist a `Pending` job. Never waits for processing.
    async fn add(&self, job: NewJob) -> Result<JobRecord>;

    /// Start consuming a queue. Buffered until `init` when called before it.
    async fn start(&self, queue_name: &str, process: ProcessFn) -> Result<()>;

    /// Stop claiming from a queue and wait (bounded) for in-flight jobs.
    async fn stop(&self, queue_name: &str) -> Result<()>;

    /// Stop every queue and release backend resources.
    async fn destroy(&self) -> Result<()>;

    async fn find_job(&self, id: JobId) -> Result<Option<JobRecord>>;

    async fn list_jobs(&self, options: &JobListOptions) -> Result<JobList>;

    /// Cancel a job. Running jobs are flagged and settle when their handler returns.
    async fn cancel_job(&self, id: JobId) -> Result<JobRecord>;

    /// Move a `Failed` job back to `Pending` for one more attempt.
    async fn retry_job(&self, id: JobId) -> Result<JobRecord>;

    /// Delete settled jobs older than `older_than`. Empty `queue_names` means every queue.
    async fn remove_settled_jobs(&self, queue_names: &[String], older_than: DateTime<Utc>) -> Result<u64>;

    /// Resolve running jobs whose lease expired before `now - stale_after`.
    async fn recover_stale(&self, stale_after: std::time::Duration, now: DateTime<Utc>) -> Result<RecoveryReport>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active() -> ActiveJob {
        let (tx, _rx) = watch::channel(0);
        ActiveJob::new(
            JobRecord::new("q", serde_json::json!(null), 0, Utc::now()),
            tx,
            CancellationToken::new(),
        )
    }

    async fn explode() -> std::result::Result<serde_json::Value, JobError> {
        panic!("kaboom")
    }

    #[tokio::test]
    async fn test_catch_panics_inside_future() {
        let process: ProcessFn = Arc::new(|_job: ActiveJob| -> ProcessFuture { explode().boxed() });
        let err = catch_panics(process)(active()).await.unwrap_err();
        assert!(err.message.contains("kaboom"));
        assert_eq!(err.code.as_deref(), Some("PANIC"));
    }

    #[tokio::test]
    async fn test_catch_panics_before_future() {
        let process: ProcessFn = Arc::new(|_job: ActiveJob| -> ProcessFuture { panic!("eager") });
        let err = catch_panics(process)(active()).await.unwrap_err();
        assert!(err.message.contains("eager"));
    }

    #[tokio::test]
    async fn test_catch_panics_passes_through() {
        let process: ProcessFn = Arc::new(|_job: ActiveJob| -> ProcessFuture {
            async { Ok(serde_json::json!(7)) }.boxed()
        });
        assert_eq!(catch_panics(process)(active()).await.unwrap(), serde_json::json!(7));
    }

    #[test]
    fn test_list_options_matching() {
        let record = JobRecord::new("emails", serde_json::json!(null), 0, Utc::now());
        assert!(JobListOptions::default().matches(&record));
        let by_queue = JobListOptions {
            queue_names: vec!["other".into()],
            ..Default::default()
        };
        assert!(!by_queue.matches(&record));
        let by_state = JobListOptions {
            states: vec![JobState::Pending],
            ..Default::default()
        };
        assert!(by_state.matches(&record));
    }

    #[test]
    fn test_progress_is_clamped() {
        let (tx, rx) = watch::channel(0);
        let job = ActiveJob::new(
            JobRecord::new("q", serde_json::json!(null), 0, Utc::now()),
            tx,
            CancellationToken::new(),
        );
        job.set_progress(180);
        assert_eq!(*rx.borrow(), 100);
        assert!(!job.is_cancel_requested());
    }
}
