//! Persistence for the polling strategy.
//!
//! A store only moves records in and out. State changes are computed by the
//! transition methods on [`JobRecord`] and written back with [`JobStore::update`],
//! which is a compare-and-swap on `version`.
//!
//! Stores that deliver through a broker (a ready list plus an in-flight list)
//! also get told when a claim ends or a job goes back to `Pending`; row-based
//! stores ignore those calls.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use super::{JobId, JobList, JobListOptions, JobRecord};
use crate::error::Result;

pub mod memory;
pub mod postgres;

pub use memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;

#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Backend name for logs.
    fn name(&self) -> &'static str;

    /// Prepare the backend (schema, connections). Idempotent.
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn insert(&self, record: &JobRecord) -> Result<()>;

    /// Atomically claim the oldest claimable job of a queue and return it in
    /// `Running` state. Two concurrent callers never get the same job.
    async fn claim_next(&self, queue_name: &str, worker_id: &str, now: DateTime<Utc>) -> Result<Option<JobRecord>>;

    /// Wait a bounded time for `queue_name` to have claimable work. Nothing is
    /// reserved; the caller claims with [`JobStore::claim_next`] afterwards.
    /// Returning early is always allowed. Stores that cannot block sleep for
    /// `hint`, the configured poll interval.
    async fn wait_for_work(&self, _queue_name: &str, hint: Duration) -> Result<()> {
        tokio::time::sleep(hint).await;
        Ok(())
    }

    async fn find(&self, id: JobId) -> Result<Option<JobRecord>>;

    async fn list(&self, options: &JobListOptions) -> Result<JobList>;

    /// Persist `record` if the stored version still equals `record.version`.
    /// On success the version is bumped in place and `true` is returned.
    async fn update(&self, record: &mut JobRecord) -> Result<bool>;

    /// Running jobs whose lease (`heartbeat_at`) is older than `cutoff`.
    async fn find_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<JobRecord>>;

    /// Delete settled jobs that settled before `older_than`.
    async fn remove_settled(&self, queue_names: &[String], older_than: DateTime<Utc>) -> Result<u64>;

    /// The claim on `record` ended: it settled, or is `Retrying` until `retry_at`.
    async fn released(&self, _record: &JobRecord) -> Result<()> {
        Ok(())
    }

    /// `record` went back to `Pending` (orphan recovery or admin retry).
    async fn requeued(&self, _record: &JobRecord) -> Result<()> {
        Ok(())
    }

    /// Put back deliveries stranded between dequeue and claim. Returns how
    /// many were put back.
    async fn sweep(&self) -> Result<usize> {
        Ok(0)
    }
}
