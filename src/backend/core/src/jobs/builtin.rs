//! Built-in queues and worker messages registered by the worker binary.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

use super::queue::{JobQueue, RunningJob};
use super::service::JobQueueService;
use super::{JobError, JobListOptions, JobState};
use crate::bridge::WorkerHost;
use crate::error::Result;

/// Name of the housekeeping queue that deletes old settled jobs.
pub const REMOVE_SETTLED_JOBS_QUEUE: &str = "remove-settled-jobs";

/// Payload of a `remove-settled-jobs` job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveSettledJobs {
    /// Empty means every queue
    #[serde(default)]
    pub queue_names: Vec<String>,

    /// Settled jobs older than this are deleted
    #[serde(default = "default_retention", with = "humantime_serde")]
    pub older_than: Duration,
}

impl Default for RemoveSettledJobs {
    fn default() -> Self {
        Self {
            queue_names: Vec::new(),
            older_than: default_retention(),
        }
    }
}

fn default_retention() -> Duration {
    Duration::from_secs(7 * 24 * 60 * 60)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovedJobs {
    pub removed: u64,
}

/// Register the `remove-settled-jobs` queue. Interval triggers are up to the caller.
pub async fn create_remove_settled_jobs_queue(
    service: &JobQueueService,
) -> Result<JobQueue<RemoveSettledJobs, RemovedJobs>> {
    let strategy = service.strategy().clone();
    service
        .create_queue(REMOVE_SETTLED_JOBS_QUEUE, move |job: RunningJob<RemoveSettledJobs>| {
            let strategy = strategy.clone();
            async move {
                let request = job.data();
                let cutoff = chrono::Duration::from_std(request.older_than)
                    .ok()
                    .and_then(|retention| Utc::now().checked_sub_signed(retention))
                    .ok_or_else(|| {
                        JobError::new(format!("retention {:?} is out of range", request.older_than))
                            .with_code("INVALID_INPUT")
                    })?;
                let removed = strategy.remove_settled_jobs(&request.queue_names, cutoff).await?;
                job.set_progress(100);
                info!(removed, queues = ?request.queue_names, "Removed settled jobs");
                Ok::<_, JobError>(RemovedJobs { removed })
            }
        })
        .await
}

/// Empty health check request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthRequest {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub worker_id: String,
    pub strategy: String,
    pub queues: Vec<String>,
    pub pending: usize,
    pub running: usize,
    pub uptime_secs: u64,
}

crate::worker_message! {
    /// Liveness check answered by the worker process.
    #[derive(Debug, Clone)]
    pub struct HealthCheck(HealthRequest) -> HealthReport = "taskline.health";
}

/// Answer [`HealthCheck`] with the state of `service`.
pub fn register_health(host: &WorkerHost, service: Arc<JobQueueService>, started: Instant) -> Result<()> {
    host.register::<HealthCheck, _, _>(move |_request| {
        let service = service.clone();
        async move {
            let pending = count(&service, JobState::Pending).await?;
            let running = count(&service, JobState::Running).await?;
            Ok(HealthReport {
                status: "ok".to_string(),
                worker_id: service.context().worker_id.to_string(),
                strategy: service.strategy().name().to_string(),
                queues: service.queue_names(),
                pending,
                running,
                uptime_secs: started.elapsed().as_secs(),
            })
        }
    })
}

async fn count(service: &JobQueueService, state: JobState) -> Result<usize> {
    let options = JobListOptions {
        states: vec![state],
        take: Some(0),
        ..Default::default()
    };
    Ok(service.list_jobs(&options).await?.total)
}
