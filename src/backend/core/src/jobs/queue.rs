//! Typed queue handles.

use futures::stream::{self, BoxStream, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use super::service::QueueContext;
use super::strategy::{ActiveJob, JobQueueStrategy, NewJob};
use super::{Job, JobId, JobRecord};
use crate::error::{ErrorCode, Result, TasklineError};

/// Per-job options for [`JobQueue::add`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Retries after the first attempt. Falls back to `queue.default_retries`.
    pub retries: Option<u32>,
}

impl JobOptions {
    pub fn retries(retries: u32) -> Self {
        Self { retries: Some(retries) }
    }
}

/// Handle to a named queue. Cheap to clone.
pub struct JobQueue<D, R = serde_json::Value> {
    name: Arc<str>,
    strategy: Arc<dyn JobQueueStrategy>,
    ctx: QueueContext,
    _types: PhantomData<fn() -> (D, R)>,
}

impl<D, R> Clone for JobQueue<D, R> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            strategy: self.strategy.clone(),
            ctx: self.ctx.clone(),
            _types: PhantomData,
        }
    }
}

impl<D, R> std::fmt::Debug for JobQueue<D, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("name", &self.name)
            .field("strategy", &self.strategy.name())
            .finish()
    }
}

impl<D, R> JobQueue<D, R>
where
    D: Serialize + DeserializeOwned + Send + Sync + 'static,
    R: DeserializeOwned + Send + Sync + 'static,
{
    pub(crate) fn new(name: String, strategy: Arc<dyn JobQueueStrategy>, ctx: QueueContext) -> Self {
        Self {
            name: name.into(),
            strategy,
            ctx,
            _types: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Persist a new job. Returns once the backend has stored it.
    ///
    /// Data that fails to serialize is rejected before anything is written.
    /// Transient backend errors are retried `add_retry_attempts` times.
    pub async fn add(&self, data: D, options: JobOptions) -> Result<SubscribableJob<D, R>> {
        let data = serde_json::to_value(&data).map_err(|e| {
            TasklineError::with_internal(ErrorCode::SerializationError, "Job data could not be serialized", e.to_string())
                .with_context("queue", self.name.as_ref())
        })?;
        let job = NewJob {
            queue_name: self.name.to_string(),
            data,
            retries: options.retries.unwrap_or(self.ctx.queue.default_retries),
        };

        let max_retries = self.ctx.queue.add_retry_attempts;
        let mut retried = 0;
        let record = loop {
            match self.strategy.add(job.clone()).await {
                Ok(record) => break record,
                Err(e) if e.is_retryable() && retried < max_retries => {
                    retried += 1;
                    warn!(queue = %self.name, attempt = retried, error = %e, "Adding job failed; retrying");
                    tokio::time::sleep(self.ctx.queue.add_retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        };

        Ok(SubscribableJob::new(record, self.strategy.clone(), self.ctx.clone()))
    }

    /// Current typed snapshot of a job of this queue.
    pub async fn get_job(&self, id: JobId) -> Result<Option<Job<D, R>>> {
        match self.strategy.find_job(id).await? {
            Some(record) if record.queue_name == *self.name => Ok(Some(Job::from_record(record)?)),
            _ => Ok(None),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Subscriptions
// ═══════════════════════════════════════════════════════════════════════════════

/// Options for [`SubscribableJob::updates`].
#[derive(Debug, Clone, Default)]
pub struct UpdatesOptions {
    /// How often to re-read the store between events (defaults to one second).
    /// Covers jobs processed by another process.
    pub poll_interval: Option<Duration>,
    /// Give up with `ErrorCode::Timeout` after this long.
    pub timeout: Option<Duration>,
}

const DEFAULT_UPDATES_POLL: Duration = Duration::from_secs(1);

/// A job just added, with ways to follow it.
pub struct SubscribableJob<D, R = serde_json::Value> {
    record: JobRecord,
    strategy: Arc<dyn JobQueueStrategy>,
    ctx: QueueContext,
    _types: PhantomData<fn() -> (D, R)>,
}

impl<D, R> std::fmt::Debug for SubscribableJob<D, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscribableJob")
            .field("id", &self.record.id)
            .field("queue_name", &self.record.queue_name)
            .finish()
    }
}

struct Follow {
    id: JobId,
    strategy: Arc<dyn JobQueueStrategy>,
    events: Option<broadcast::Receiver<JobRecord>>,
    poll_interval: Duration,
    deadline: Option<tokio::time::Instant>,
    last_version: Option<i64>,
    loaded: bool,
    done: bool,
}

enum Wake {
    Changed(JobRecord),
    Reload,
    TimedOut,
}

impl<D, R> SubscribableJob<D, R>
where
    D: DeserializeOwned + Send + 'static,
    R: DeserializeOwned + Send + 'static,
{
    fn new(record: JobRecord, strategy: Arc<dyn JobQueueStrategy>, ctx: QueueContext) -> Self {
        Self {
            record,
            strategy,
            ctx,
            _types: PhantomData,
        }
    }

    pub fn id(&self) -> JobId {
        self.record.id
    }

    /// The job as it was when added.
    pub fn snapshot(&self) -> Result<Job<D, R>> {
        Job::from_record(self.record.clone())
    }

    /// Stream of snapshots, one per observed change, ending after the settled
    /// one. Each call is an independent subscription. A job that is already
    /// settled yields exactly one snapshot.
    pub fn updates(&self, options: UpdatesOptions) -> BoxStream<'static, Result<Job<D, R>>> {
        // Subscribe before the first read so no change slips between them.
        let follow = Follow {
            id: self.record.id,
            strategy: self.strategy.clone(),
            events: Some(self.ctx.events.subscribe()),
            poll_interval: options.poll_interval.unwrap_or(DEFAULT_UPDATES_POLL),
            deadline: options.timeout.map(|t| tokio::time::Instant::now() + t),
            last_version: None,
            loaded: false,
            done: false,
        };

        stream::unfold(follow, |mut follow| async move {
            if follow.done {
                return None;
            }
            loop {
                let candidate = if !follow.loaded {
                    follow.loaded = true;
                    match follow.reload().await {
                        Ok(record) => record,
                        Err(e) => {
                            follow.done = true;
                            return Some((Err(e), follow));
                        }
                    }
                } else {
                    let wake = tokio::select! {
                        changed = next_change(&mut follow.events, follow.id) => match changed {
                            Some(record) => Wake::Changed(record),
                            None => Wake::Reload,
                        },
                        _ = tokio::time::sleep(follow.poll_interval) => Wake::Reload,
                        _ = until(follow.deadline) => Wake::TimedOut,
                    };
                    match wake {
                        Wake::Changed(record) => record,
                        Wake::Reload => match follow.reload().await {
                            Ok(record) => record,
                            Err(e) if e.is_retryable() => {
                                debug!(job_id = %follow.id, error = %e, "Reloading job failed; will retry");
                                continue;
                            }
                            Err(e) => {
                                follow.done = true;
                                return Some((Err(e), follow));
                            }
                        },
                        Wake::TimedOut => {
                            follow.done = true;
                            let err = TasklineError::new(
                                ErrorCode::Timeout,
                                format!("Timed out waiting for job {} to change", follow.id),
                            );
                            return Some((Err(err), follow));
                        }
                    }
                };

                if follow.last_version.is_some_and(|seen| candidate.version <= seen) {
                    continue;
                }
                follow.last_version = Some(candidate.version);
                follow.done = candidate.is_settled();
                return Some((Job::from_record(candidate), follow));
            }
        })
        .boxed()
    }

    /// Follow the job until it settles and return the settled snapshot.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<Job<D, R>> {
        let mut updates = self.updates(UpdatesOptions {
            timeout,
            ..Default::default()
        });
        let mut last = None;
        while let Some(job) = updates.next().await {
            last = Some(job?);
        }
        last.ok_or_else(|| TasklineError::job_not_found(self.record.id))
    }
}

impl Follow {
    async fn reload(&self) -> Result<JobRecord> {
        self.strategy
            .find_job(self.id)
            .await?
            .ok_or_else(|| TasklineError::job_not_found(self.id))
    }
}

/// Next event for `id`. `None` means events were missed and the store must be
/// re-read. Never resolves once the hub is gone.
async fn next_change(events: &mut Option<broadcast::Receiver<JobRecord>>, id: JobId) -> Option<JobRecord> {
    let Some(receiver) = events.as_mut() else {
        return std::future::pending().await;
    };
    loop {
        match receiver.recv().await {
            Ok(record) if record.id == id => return Some(record),
            Ok(_) => continue,
            Err(RecvError::Lagged(_)) => return None,
            Err(RecvError::Closed) => {
                *events = None;
                return None;
            }
        }
    }
}

async fn until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Running Job
// ═══════════════════════════════════════════════════════════════════════════════

/// What a process function receives: the decoded payload plus controls for
/// the running attempt.
pub struct RunningJob<D> {
    data: D,
    active: ActiveJob,
}

impl<D> RunningJob<D> {
    pub(crate) fn new(data: D, active: ActiveJob) -> Self {
        Self { data, active }
    }

    pub fn data(&self) -> &D {
        &self.data
    }

    pub fn into_data(self) -> D {
        self.data
    }

    pub fn id(&self) -> JobId {
        self.active.record.id
    }

    pub fn queue_name(&self) -> &str {
        &self.active.record.queue_name
    }

    /// 1-based number of the current attempt.
    pub fn attempts(&self) -> u32 {
        self.active.record.attempts
    }

    pub fn retries(&self) -> u32 {
        self.active.record.retries
    }

    pub fn set_progress(&self, progress: u8) {
        self.active.set_progress(progress);
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.active.is_cancel_requested()
    }

    pub async fn cancelled(&self) {
        self.active.cancelled().await
    }
}

impl<D: std::fmt::Debug> std::fmt::Debug for RunningJob<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningJob")
            .field("data", &self.data)
            .field("job", &self.active)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::jobs::{InMemoryJobStore, JobError, JobQueueService, JobState, PollingJobQueueStrategy};
    use serde::ser::Error as _;

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: serde::Serializer>(&self, _serializer: S) -> std::result::Result<S::Ok, S::Error> {
            Err(S::Error::custom("live handle"))
        }
    }

    impl<'de> Deserialize<'de> for Unserializable {
        fn deserialize<De: serde::Deserializer<'de>>(_deserializer: De) -> std::result::Result<Self, De::Error> {
            Ok(Unserializable)
        }
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.queue.poll_interval = Duration::from_millis(10);
        config
    }

    #[tokio::test]
    async fn test_serialization_error_persists_nothing() {
        let store = Arc::new(InMemoryJobStore::new());
        let strategy = Arc::new(PollingJobQueueStrategy::from_arc(store.clone()));
        let service = JobQueueService::new(&config(), strategy);
        let queue = service
            .create_queue("live", |_job: RunningJob<Unserializable>| async { Ok::<_, JobError>(()) })
            .await
            .unwrap();

        let err = queue.add(Unserializable, JobOptions::default()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::SerializationError);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_updates_end_after_settled_snapshot() {
        let service = JobQueueService::new(&config(), Arc::new(PollingJobQueueStrategy::new(InMemoryJobStore::new())));
        let queue = service
            .create_queue("echo", |job: RunningJob<u32>| async move {
                job.set_progress(50);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok::<_, JobError>(*job.data())
            })
            .await
            .unwrap();
        service.open().await.unwrap();

        let job = queue.add(7, JobOptions::default()).await.unwrap();
        let snapshots: Vec<Job<u32, u32>> = job
            .updates(UpdatesOptions::default())
            .map(|s| s.unwrap())
            .collect()
            .await;

        let last = snapshots.last().unwrap();
        assert_eq!(last.state, JobState::Completed);
        assert_eq!(last.result, Some(7));
        assert!(snapshots[..snapshots.len() - 1].iter().all(|s| !s.is_settled()));

        let again: Vec<_> = job.updates(UpdatesOptions::default()).collect().await;
        assert_eq!(again.len(), 1);
        service.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_updates_time_out() {
        let service = JobQueueService::new(&config(), Arc::new(PollingJobQueueStrategy::new(InMemoryJobStore::new())));
        service.open().await.unwrap();
        // No consumer for this queue, so the job stays pending.
        let queue: JobQueue<u32, u32> = JobQueue::new("idle".into(), service.strategy().clone(), service.context().clone());
        let job = queue.add(1, JobOptions::default()).await.unwrap();

        let err = job.wait(Some(Duration::from_millis(50))).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Timeout);
        service.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_default_retries_come_from_config() {
        let mut config = config();
        config.queue.default_retries = 4;
        let service = JobQueueService::new(&config, Arc::new(PollingJobQueueStrategy::new(InMemoryJobStore::new())));
        let queue: JobQueue<u32, u32> = JobQueue::new("q".into(), service.strategy().clone(), service.context().clone());

        let job = queue.add(1, JobOptions::default()).await.unwrap();
        assert_eq!(job.snapshot().unwrap().retries, 4);
        let job = queue.add(1, JobOptions::retries(0)).await.unwrap();
        assert_eq!(job.snapshot().unwrap().retries, 0);
    }
}
