//! Process-wide queue registry and lifecycle.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::events::JobEvents;
use super::queue::{JobQueue, RunningJob};
use super::recovery::RecoveryReport;
use super::strategy::{catch_panics, ActiveJob, JobList, JobListOptions, JobQueueStrategy, ProcessFn, ProcessFuture};
use super::{JobError, JobId, JobRecord};
use crate::config::{Config, QueueConfig, RecoveryConfig, StrategyKind};
use crate::error::Result;

/// Process-wide state shared by the service and its strategy.
///
/// Built once per process and handed to [`JobQueueStrategy::init`].
#[derive(Clone)]
pub struct QueueContext {
    pub queue: Arc<QueueConfig>,
    pub recovery: Arc<RecoveryConfig>,
    pub events: JobEvents,
    /// Process-wide cap on running jobs across all queues
    pub global_limit: Arc<Semaphore>,
    /// Identity written into the lease of every job this process claims
    pub worker_id: Arc<str>,
}

/// Floor for timer periods taken from configuration that skipped `validate`.
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(10);

impl QueueContext {
    pub fn new(config: &Config) -> Self {
        let worker_id = config.queue.worker_id.clone().unwrap_or_else(default_worker_id);
        let mut recovery = config.recovery.clone();
        recovery.heartbeat_interval = recovery.heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL);
        Self {
            queue: Arc::new(config.queue.clone()),
            recovery: Arc::new(recovery),
            events: JobEvents::new(),
            global_limit: Arc::new(Semaphore::new(config.queue.global_concurrency.max(1))),
            worker_id: worker_id.into(),
        }
    }
}

impl std::fmt::Debug for QueueContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueContext")
            .field("worker_id", &self.worker_id)
            .field("global_available", &self.global_limit.available_permits())
            .finish()
    }
}

fn default_worker_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("worker-{}-{}", std::process::id(), &suffix[..8])
}

/// Build the strategy selected by configuration.
pub async fn build_strategy(config: &Config) -> Result<Arc<dyn JobQueueStrategy>> {
    let strategy: Arc<dyn JobQueueStrategy> = match config.strategy {
        StrategyKind::InMemory => Arc::new(super::PollingJobQueueStrategy::new(super::InMemoryJobStore::new())),
        StrategyKind::Postgres => {
            let store = super::PostgresJobStore::connect(&config.database).await?;
            Arc::new(super::PollingJobQueueStrategy::new(store))
        }
        StrategyKind::Redis => Arc::new(super::RedisJobQueueStrategy::connect(&config.redis).await?),
    };
    info!(strategy = strategy.name(), "Job queue strategy selected");
    Ok(strategy)
}

/// Owns the strategy and the registry of named queues.
pub struct JobQueueService {
    strategy: Arc<dyn JobQueueStrategy>,
    ctx: QueueContext,
    /// Queue name to whether this process consumes it
    queues: DashMap<String, bool>,
    closed: AtomicBool,
}

impl JobQueueService {
    pub fn new(config: &Config, strategy: Arc<dyn JobQueueStrategy>) -> Self {
        Self::with_context(QueueContext::new(config), strategy)
    }

    pub fn with_context(ctx: QueueContext, strategy: Arc<dyn JobQueueStrategy>) -> Self {
        Self {
            strategy,
            ctx,
            queues: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn context(&self) -> &QueueContext {
        &self.ctx
    }

    pub fn strategy(&self) -> &Arc<dyn JobQueueStrategy> {
        &self.strategy
    }

    pub fn events(&self) -> &JobEvents {
        &self.ctx.events
    }

    /// Registered queue names.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.iter().map(|q| q.key().clone()).collect();
        names.sort();
        names
    }

    /// Initialize the strategy: recovery, then buffered consumers.
    #[instrument(skip(self), fields(strategy = self.strategy.name()))]
    pub async fn open(&self) -> Result<()> {
        self.strategy.init(&self.ctx).await
    }

    /// Stop every queue, then release the strategy.
    #[instrument(skip(self), fields(strategy = self.strategy.name()))]
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let consuming: Vec<String> = self
            .queues
            .iter()
            .filter(|q| *q.value())
            .map(|q| q.key().clone())
            .collect();
        for name in consuming {
            if let Err(e) = self.strategy.stop(&name).await {
                warn!(queue = %name, error = %e, "Failed to stop queue cleanly");
            }
        }
        self.strategy.destroy().await?;
        info!("Job queue service closed");
        Ok(())
    }

    /// Register a named queue bound to `process`.
    ///
    /// The payload is decoded into `D` before `process` runs; a payload that no
    /// longer decodes is a handler rejection. A panicking `process` is a
    /// rejection too.
    pub async fn create_queue<D, R, F, Fut>(&self, name: impl Into<String>, process: F) -> Result<JobQueue<D, R>>
    where
        D: Serialize + DeserializeOwned + Send + Sync + 'static,
        R: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: Fn(RunningJob<D>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, JobError>> + Send + 'static,
    {
        let name = name.into();
        let consume = self.ctx.queue.consume;
        match self.queues.entry(name.clone()) {
            Entry::Occupied(_) => return Err(crate::error::TasklineError::queue_already_registered(name)),
            Entry::Vacant(slot) => {
                slot.insert(consume);
            }
        }

        if consume {
            if let Err(e) = self.strategy.start(&name, erase(process)).await {
                self.queues.remove(&name);
                return Err(e);
            }
        }
        info!(queue = %name, consume, "Job queue created");
        Ok(JobQueue::new(name, self.strategy.clone(), self.ctx.clone()))
    }

    pub async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>> {
        self.strategy.find_job(id).await
    }

    pub async fn list_jobs(&self, options: &JobListOptions) -> Result<JobList> {
        self.strategy.list_jobs(options).await
    }

    pub async fn cancel_job(&self, id: JobId) -> Result<JobRecord> {
        self.strategy.cancel_job(id).await
    }

    pub async fn retry_job(&self, id: JobId) -> Result<JobRecord> {
        self.strategy.retry_job(id).await
    }

    pub async fn remove_settled_jobs(&self, queue_names: &[String], older_than: DateTime<Utc>) -> Result<u64> {
        self.strategy.remove_settled_jobs(queue_names, older_than).await
    }

    /// Run a recovery pass with the configured staleness threshold.
    pub async fn recover_stale(&self) -> Result<RecoveryReport> {
        self.strategy.recover_stale(self.ctx.recovery.stale_after, Utc::now()).await
    }
}

/// Erase a typed process function into a [`ProcessFn`].
fn erase<D, R, F, Fut>(process: F) -> ProcessFn
where
    D: DeserializeOwned + Send + Sync + 'static,
    R: Serialize + Send + Sync + 'static,
    F: Fn(RunningJob<D>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<R, JobError>> + Send + 'static,
{
    let process = Arc::new(process);
    catch_panics(Arc::new(move |active: ActiveJob| -> ProcessFuture {
        let process = process.clone();
        async move {
            let data: D = serde_json::from_value(active.record.data.clone()).map_err(|e| {
                JobError::new(format!("job data could not be decoded: {}", e)).with_code("DESERIALIZATION_ERROR")
            })?;
            let result = process(RunningJob::new(data, active)).await?;
            serde_json::to_value(result).map_err(|e| {
                JobError::new(format!("job result could not be encoded: {}", e)).with_code("SERIALIZATION_ERROR")
            })
        }
        .boxed()
    }))
}
