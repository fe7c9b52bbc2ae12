//! Crash and stale-lock recovery.
//!
//! A job left `Running` by a dead worker stops getting heartbeats. Once its
//! lease is older than `stale_after` it is requeued, or failed as orphaned when
//! no attempts remain. The write is a compare-and-swap on `version`, so an
//! owner that heartbeats concurrently wins and the job is skipped.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::store::JobStore;
use super::{JobRecord, JobState};
use crate::error::{Result, TasklineError};
use crate::telemetry::JobMetrics;

/// Outcome of a recovery pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    /// Jobs put back to `Pending`
    pub requeued: usize,
    /// Jobs failed as orphaned
    pub failed: usize,
    /// Jobs whose pending cancellation was applied
    pub cancelled: usize,
    /// Jobs that changed under us (their owner is alive)
    pub skipped: usize,
    /// Snapshots of every job written by this pass
    #[serde(skip)]
    pub recovered: Vec<JobRecord>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.requeued == 0 && self.failed == 0 && self.cancelled == 0
    }

    /// Count one resolved job.
    pub fn record(&mut self, record: JobRecord) {
        let outcome = match record.state {
            JobState::Pending => {
                self.requeued += 1;
                "requeued"
            }
            JobState::Failed => {
                self.failed += 1;
                "failed"
            }
            _ => {
                self.cancelled += 1;
                "cancelled"
            }
        };
        JobMetrics::recovered(&record.queue_name, outcome);
        self.recovered.push(record);
    }
}

/// Recovery pass over a [`JobStore`].
pub struct StaleJobRecovery<S> {
    store: Arc<S>,
    stale_after: Duration,
}

impl<S: JobStore> StaleJobRecovery<S> {
    pub fn new(store: Arc<S>, stale_after: Duration) -> Self {
        Self { store, stale_after }
    }

    pub async fn run(&self, now: DateTime<Utc>) -> Result<RecoveryReport> {
        let cutoff = chrono::Duration::from_std(self.stale_after)
            .ok()
            .and_then(|stale_after| now.checked_sub_signed(stale_after))
            .ok_or_else(|| {
                TasklineError::configuration(format!("recovery.stale_after {:?} is out of range", self.stale_after))
            })?;
        let stale = self.store.find_stale(cutoff).await?;

        let mut report = RecoveryReport::default();
        report.requeued += self.store.sweep().await?;
        for record in stale {
            let mut next = record.clone();
            if let Err(e) = next.recover_orphan(now) {
                warn!(job_id = %record.id, error = %e, "Skipping unrecoverable stale job");
                report.skipped += 1;
                continue;
            }
            if self.store.update(&mut next).await? {
                info!(
                    job_id = %next.id,
                    queue = %next.queue_name,
                    worker_id = ?record.worker_id,
                    attempts = next.attempts,
                    state = %next.state,
                    "Recovered orphaned job"
                );
                if next.state == JobState::Pending {
                    self.store.requeued(&next).await?;
                } else {
                    self.store.released(&next).await?;
                }
                if let Some(failure) = next.failure() {
                    failure.log();
                }
                report.record(next);
            } else {
                report.skipped += 1;
            }
        }

        if !report.is_empty() || report.skipped > 0 {
            info!(
                store = self.store.name(),
                requeued = report.requeued,
                failed = report.failed,
                cancelled = report.cancelled,
                skipped = report.skipped,
                "Stale job recovery finished"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobStore;
    use crate::error::ErrorCode;
    use crate::jobs::{JobErrorKind, ORPHANED_ERROR_MESSAGE};

    #[tokio::test]
    async fn test_requeues_then_fails() {
        let store = Arc::new(InMemoryJobStore::new());
        let long_ago = Utc::now() - chrono::Duration::minutes(10);
        let job = JobRecord::new("q", serde_json::json!({}), 1, long_ago);
        store.insert(&job).await.unwrap();
        store.claim_next("q", "dead-worker", long_ago).await.unwrap();

        let recovery = StaleJobRecovery::new(store.clone(), Duration::from_secs(60));
        let report = recovery.run(Utc::now()).await.unwrap();
        assert_eq!(report.requeued, 1);
        let stored = store.find(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Pending);
        assert_eq!(stored.attempts, 1);

        store.claim_next("q", "dead-worker", long_ago).await.unwrap();
        let report = recovery.run(Utc::now()).await.unwrap();
        assert_eq!(report.failed, 1);
        let stored = store.find(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert_eq!(stored.error.as_deref(), Some(ORPHANED_ERROR_MESSAGE));
        assert_eq!(stored.error_kind, Some(JobErrorKind::Orphaned));
        assert_eq!(report.recovered[0].failure().unwrap().code(), ErrorCode::JobOrphaned);
    }

    #[tokio::test]
    async fn test_out_of_range_stale_after_is_a_configuration_error() {
        let store = Arc::new(InMemoryJobStore::new());
        let recovery = StaleJobRecovery::new(store, Duration::from_secs(u64::MAX / 2));
        let err = recovery.run(Utc::now()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidConfiguration);
    }

    #[tokio::test]
    async fn test_fresh_lease_is_left_alone() {
        let store = Arc::new(InMemoryJobStore::new());
        let job = JobRecord::new("q", serde_json::json!({}), 0, Utc::now());
        store.insert(&job).await.unwrap();
        store.claim_next("q", "live-worker", Utc::now()).await.unwrap();

        let report = StaleJobRecovery::new(store.clone(), Duration::from_secs(60))
            .run(Utc::now())
            .await
            .unwrap();
        assert!(report.is_empty());
        assert_eq!(store.find(job.id).await.unwrap().unwrap().state, JobState::Running);
    }
}
