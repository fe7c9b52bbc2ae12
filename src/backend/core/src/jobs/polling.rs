//! Polling strategy over a [`JobStore`].
//!
//! One consumer task per started queue. Before each claim the consumer takes a
//! per-queue permit and a process-wide permit, so at most
//! `min(concurrency, global_concurrency)` jobs of a queue run at once. Each
//! claimed job runs on the queue's `TaskTracker`; `stop` waits for the tracker
//! so in-flight jobs finish while pending ones stay stored.
//!
//! The owner of a running job refreshes its lease every `heartbeat_interval`.
//! Every write is a compare-and-swap on `version`; a failed swap reloads the
//! record, which is how a running job notices cancellation requested from
//! another process or loses ownership to recovery.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn, Instrument};

use super::recovery::{RecoveryReport, StaleJobRecovery};
use super::service::QueueContext;
use super::store::JobStore;
use super::strategy::{ActiveJob, JobList, JobListOptions, JobQueueStrategy, NewJob, ProcessFn};
use super::{JobError, JobId, JobRecord, JobState};
use crate::error::{ErrorCode, Result, TasklineError};
use crate::telemetry::JobMetrics;

/// Compare-and-swap attempts before an admin write gives up.
const MAX_CAS_ATTEMPTS: usize = 8;

/// Delay between attempts to commit a job outcome against a failing store.
const COMMIT_RETRY_DELAY: Duration = Duration::from_millis(200);

struct Consumer {
    token: CancellationToken,
    tracker: TaskTracker,
    wake: Arc<Notify>,
    handle: JoinHandle<()>,
}

struct Inner<S> {
    store: Arc<S>,
    ctx: OnceLock<QueueContext>,
    init_lock: tokio::sync::Mutex<()>,
    buffered: Mutex<Vec<(String, ProcessFn)>>,
    consumers: DashMap<String, Consumer>,
    /// Cancellation flags of jobs running in this process.
    running: DashMap<JobId, CancellationToken>,
    shutdown: CancellationToken,
    maintenance: TaskTracker,
    destroyed: AtomicBool,
}

/// Job queue strategy that polls a [`JobStore`] for claimable jobs.
pub struct PollingJobQueueStrategy<S: JobStore> {
    inner: Arc<Inner<S>>,
}

impl<S: JobStore> Clone for PollingJobQueueStrategy<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: JobStore> PollingJobQueueStrategy<S> {
    pub fn new(store: S) -> Self {
        Self::from_arc(Arc::new(store))
    }

    pub fn from_arc(store: Arc<S>) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                ctx: OnceLock::new(),
                init_lock: tokio::sync::Mutex::new(()),
                buffered: Mutex::new(Vec::new()),
                consumers: DashMap::new(),
                running: DashMap::new(),
                shutdown: CancellationToken::new(),
                maintenance: TaskTracker::new(),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.inner.store
    }

    /// Names of queues with an active consumer.
    pub fn active_queues(&self) -> Vec<String> {
        self.inner.consumers.iter().map(|c| c.key().clone()).collect()
    }
}

impl<S: JobStore> Inner<S> {
    fn ctx(&self) -> Result<&QueueContext> {
        self.ctx.get().ok_or_else(|| {
            TasklineError::new(
                ErrorCode::StrategyNotInitialized,
                "The job queue strategy has not been initialized",
            )
        })
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(TasklineError::strategy_shut_down());
        }
        Ok(())
    }

    fn publish(&self, record: &JobRecord) {
        if let Some(ctx) = self.ctx.get() {
            ctx.events.publish(record.clone());
        }
    }

    fn wake(&self, queue_name: &str) {
        if let Some(consumer) = self.consumers.get(queue_name) {
            consumer.wake.notify_one();
        }
    }

    fn wake_all(&self) {
        for consumer in self.consumers.iter() {
            consumer.wake.notify_one();
        }
    }

    fn activate(self: &Arc<Self>, queue_name: String, process: ProcessFn) -> Result<()> {
        let ctx = self.ctx()?.clone();
        match self.consumers.entry(queue_name.clone()) {
            Entry::Occupied(_) => Err(TasklineError::queue_already_registered(queue_name)),
            Entry::Vacant(slot) => {
                let concurrency = ctx.queue.concurrency_for(&queue_name).max(1);
                let token = self.shutdown.child_token();
                let tracker = TaskTracker::new();
                let wake = Arc::new(Notify::new());

                let handle = tokio::spawn(
                    self.clone()
                        .consume(ctx, queue_name.clone(), process, concurrency, token.clone(), tracker.clone(), wake.clone())
                        .instrument(tracing::info_span!("consumer", queue = %queue_name)),
                );

                slot.insert(Consumer {
                    token,
                    tracker,
                    wake,
                    handle,
                });
                info!(queue = %queue_name, concurrency, store = self.store.name(), "Queue consumer started");
                Ok(())
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn consume(
        self: Arc<Self>,
        ctx: QueueContext,
        queue_name: String,
        process: ProcessFn,
        concurrency: usize,
        token: CancellationToken,
        tracker: TaskTracker,
        wake: Arc<Notify>,
    ) {
        let local_limit = Arc::new(Semaphore::new(concurrency));
        let poll_interval = ctx.queue.poll_interval;

        loop {
            let local = tokio::select! {
                _ = token.cancelled() => break,
                permit = local_limit.clone().acquire_owned() => permit,
            };
            let global = tokio::select! {
                _ = token.cancelled() => break,
                permit = ctx.global_limit.clone().acquire_owned() => permit,
            };
            let (Ok(local), Ok(global)) = (local, global) else {
                error!(queue = %queue_name, "Concurrency limiter closed");
                break;
            };

            // Permits are held only across the non-blocking claim. Waiting for
            // work happens after they are released.
            match self.store.claim_next(&queue_name, &ctx.worker_id, Utc::now()).await {
                Ok(Some(record)) => {
                    let span = tracing::info_span!(
                        "job",
                        job_id = %record.id,
                        queue = %record.queue_name,
                        attempt = record.attempts,
                    );
                    tracker.spawn(
                        self.clone()
                            .run_job(ctx.clone(), process.clone(), record, (local, global))
                            .instrument(span),
                    );
                }
                Ok(None) => {
                    drop((local, global));
                    let waited = tokio::select! {
                        _ = token.cancelled() => break,
                        _ = wake.notified() => Ok(()),
                        waited = self.store.wait_for_work(&queue_name, poll_interval) => waited,
                    };
                    if let Err(e) = waited {
                        e.log();
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = tokio::time::sleep(poll_interval) => {}
                        }
                    }
                }
                Err(e) => {
                    e.log();
                    drop((local, global));
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(poll_interval) => {}
                    }
                }
            }
        }
        debug!(queue = %queue_name, "Queue consumer stopped claiming");
    }

    async fn run_job(
        self: Arc<Self>,
        ctx: QueueContext,
        process: ProcessFn,
        mut record: JobRecord,
        _permits: (OwnedSemaphorePermit, OwnedSemaphorePermit),
    ) {
        let queue_name = record.queue_name.clone();
        JobMetrics::running_inc(&queue_name);
        self.publish(&record);

        let cancel = CancellationToken::new();
        self.running.insert(record.id, cancel.clone());

        let (progress_tx, mut progress_rx) = watch::channel(0u8);
        let started = Instant::now();
        let handler = process(ActiveJob::new(record.clone(), progress_tx, cancel.clone()));
        tokio::pin!(handler);

        let mut heartbeat = tokio::time::interval(ctx.recovery.heartbeat_interval);
        heartbeat.tick().await;
        let mut progress_open = true;

        let outcome = loop {
            tokio::select! {
                outcome = &mut handler => break outcome,
                changed = progress_rx.changed(), if progress_open => match changed {
                    Ok(()) => {
                        let progress = *progress_rx.borrow_and_update();
                        self.touch(&mut record, Some(progress), &cancel).await;
                    }
                    Err(_) => progress_open = false,
                },
                _ = heartbeat.tick() => self.touch(&mut record, None, &cancel).await,
            }
        };

        self.running.remove(&record.id);
        self.commit(&ctx, record, outcome, started.elapsed()).await;
        JobMetrics::running_dec(&queue_name);
    }

    /// Refresh the lease, optionally with new progress.
    async fn touch(&self, record: &mut JobRecord, progress: Option<u8>, cancel: &CancellationToken) {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let mut next = record.clone();
            let now = Utc::now();
            let applied = match progress {
                Some(p) => next.set_progress(p, now),
                None => next.heartbeat(now),
            };
            if applied.is_err() {
                return;
            }

            match self.store.update(&mut next).await {
                Ok(true) => {
                    *record = next;
                    if progress.is_some() {
                        self.publish(record);
                    }
                    return;
                }
                Ok(false) => match self.store.find(record.id).await {
                    Ok(Some(fresh)) => {
                        if fresh.cancel_requested {
                            cancel.cancel();
                        }
                        let still_ours = is_same_claim(&fresh, record);
                        *record = fresh;
                        if !still_ours {
                            warn!(job_id = %record.id, state = %record.state, "Lost ownership of running job");
                            return;
                        }
                    }
                    Ok(None) => return,
                    Err(e) => {
                        e.log();
                        return;
                    }
                },
                Err(e) => {
                    e.log();
                    return;
                }
            }
        }
    }

    /// Commit the handler outcome, retrying on version conflicts and store errors.
    async fn commit(
        &self,
        ctx: &QueueContext,
        claimed: JobRecord,
        outcome: std::result::Result<serde_json::Value, JobError>,
        elapsed: Duration,
    ) {
        let mut current = claimed.clone();
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            if !is_same_claim(&current, &claimed) {
                warn!(
                    job_id = %claimed.id,
                    state = %current.state,
                    "Job changed owner while running; dropping its outcome"
                );
                return;
            }

            let mut next = current.clone();
            let now = Utc::now();
            let transition = match &outcome {
                Ok(value) => next.complete(value.clone(), now),
                Err(e) => next.fail_attempt(e, &ctx.queue.backoff, now),
            };
            let state = match transition {
                Ok(state) => state,
                Err(e) => {
                    e.log();
                    return;
                }
            };

            match self.store.update(&mut next).await {
                Ok(true) => {
                    self.report(&next, state, outcome.as_ref().err(), elapsed);
                    if let Err(e) = self.store.released(&next).await {
                        e.log();
                    }
                    self.publish(&next);
                    if state == JobState::Retrying {
                        self.wake(&next.queue_name);
                    }
                    return;
                }
                Ok(false) => {}
                Err(e) => {
                    e.log();
                    tokio::time::sleep(COMMIT_RETRY_DELAY * attempt as u32).await;
                }
            }

            match self.store.find(claimed.id).await {
                Ok(Some(fresh)) => current = fresh,
                Ok(None) => {
                    warn!(job_id = %claimed.id, "Job was removed while running");
                    return;
                }
                Err(e) => e.log(),
            }
        }
        error!(job_id = %claimed.id, "Giving up on committing job outcome; recovery will resolve it");
    }

    fn report(&self, record: &JobRecord, state: JobState, error: Option<&JobError>, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        match state {
            JobState::Retrying => {
                JobMetrics::retried(&record.queue_name, secs);
                warn!(
                    attempts = record.attempts,
                    retries = record.retries,
                    retry_at = ?record.retry_at,
                    error = %error.map(|e| e.message.as_str()).unwrap_or_default(),
                    "Job attempt failed; retry scheduled"
                );
            }
            JobState::Failed => {
                JobMetrics::settled(&record.queue_name, state.as_str(), secs);
                warn!(attempts = record.attempts, error = ?record.error, "Job failed");
            }
            _ => {
                JobMetrics::settled(&record.queue_name, state.as_str(), secs);
                info!(state = %state, attempts = record.attempts, elapsed_ms = elapsed.as_millis() as u64, "Job settled");
            }
        }
    }

    /// Read-modify-write with compare-and-swap.
    async fn modify<F>(&self, id: JobId, mutate: F) -> Result<JobRecord>
    where
        F: Fn(&mut JobRecord) -> Result<()> + Send + Sync,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some(mut next) = self.store.find(id).await? else {
                return Err(TasklineError::job_not_found(id));
            };
            mutate(&mut next)?;
            if self.store.update(&mut next).await? {
                self.publish(&next);
                return Ok(next);
            }
        }
        Err(TasklineError::concurrent_modification(id))
    }

    async fn recover(&self, stale_after: Duration, now: DateTime<Utc>) -> Result<RecoveryReport> {
        let report = StaleJobRecovery::new(self.store.clone(), stale_after).run(now).await?;
        for record in &report.recovered {
            self.publish(record);
        }
        if report.requeued > 0 {
            self.wake_all();
        }
        Ok(report)
    }

    fn spawn_recovery_loop(self: &Arc<Self>, ctx: &QueueContext) {
        let stale_after = ctx.recovery.stale_after;
        let period = (stale_after / 2).max(ctx.recovery.heartbeat_interval);
        let inner = self.clone();
        self.maintenance.spawn(async move {
            loop {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(period) => {
                        if let Err(e) = inner.recover(stale_after, Utc::now()).await {
                            e.log();
                        }
                    }
                }
            }
        });
    }
}

/// True when `current` is still the claim described by `claimed`.
fn is_same_claim(current: &JobRecord, claimed: &JobRecord) -> bool {
    current.state == JobState::Running
        && current.attempts == claimed.attempts
        && current.worker_id == claimed.worker_id
}

#[async_trait]
impl<S: JobStore> JobQueueStrategy for PollingJobQueueStrategy<S> {
    fn name(&self) -> &'static str {
        self.inner.store.name()
    }

    async fn init(&self, ctx: &QueueContext) -> Result<()> {
        let _guard = self.inner.init_lock.lock().await;
        if self.inner.ctx.get().is_some() {
            return Ok(());
        }
        self.inner.ensure_alive()?;

        self.inner.store.init().await?;
        if ctx.recovery.enabled {
            let report = self.inner.recover(ctx.recovery.stale_after, Utc::now()).await?;
            if !report.is_empty() {
                info!(requeued = report.requeued, failed = report.failed, "Recovered jobs from a previous run");
            }
        }

        let buffered = {
            let mut buffered = self.inner.buffered.lock();
            let _ = self.inner.ctx.set(ctx.clone());
            std::mem::take(&mut *buffered)
        };
        for (queue_name, process) in buffered {
            self.inner.activate(queue_name, process)?;
        }

        if ctx.recovery.enabled {
            self.inner.spawn_recovery_loop(ctx);
        }
        info!(store = self.inner.store.name(), worker_id = %ctx.worker_id, "Job queue strategy initialized");
        Ok(())
    }

    async fn add(&self, job: NewJob) -> Result<JobRecord> {
        self.inner.ensure_alive()?;
        let record = JobRecord::new(job.queue_name, job.data, job.retries, Utc::now());
        self.inner.store.insert(&record).await?;

        JobMetrics::added(&record.queue_name);
        debug!(job_id = %record.id, queue = %record.queue_name, "Job added");
        self.inner.publish(&record);
        self.inner.wake(&record.queue_name);
        Ok(record)
    }

    async fn start(&self, queue_name: &str, process: ProcessFn) -> Result<()> {
        self.inner.ensure_alive()?;
        {
            let mut buffered = self.inner.buffered.lock();
            if self.inner.ctx.get().is_none() {
                if buffered.iter().any(|(name, _)| name == queue_name) {
                    return Err(TasklineError::queue_already_registered(queue_name));
                }
                buffered.push((queue_name.to_string(), process));
                debug!(queue = %queue_name, "Queue start buffered until init");
                return Ok(());
            }
        }
        self.inner.activate(queue_name.to_string(), process)
    }

    async fn stop(&self, queue_name: &str) -> Result<()> {
        self.inner.buffered.lock().retain(|(name, _)| name != queue_name);
        let Some((_, consumer)) = self.inner.consumers.remove(queue_name) else {
            return Ok(());
        };

        consumer.token.cancel();
        if let Err(e) = consumer.handle.await {
            error!(queue = %queue_name, error = %e, "Queue consumer task failed");
        }

        consumer.tracker.close();
        let timeout = self.inner.ctx()?.queue.shutdown_timeout;
        if tokio::time::timeout(timeout, consumer.tracker.wait()).await.is_err() {
            warn!(
                queue = %queue_name,
                in_flight = consumer.tracker.len(),
                "Timed out waiting for in-flight jobs; recovery will resolve them"
            );
        }
        info!(queue = %queue_name, "Queue consumer stopped");
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let queues: Vec<String> = self.inner.consumers.iter().map(|c| c.key().clone()).collect();
        for queue_name in queues {
            self.stop(&queue_name).await?;
        }
        self.inner.buffered.lock().clear();
        self.inner.shutdown.cancel();
        self.inner.maintenance.close();
        self.inner.maintenance.wait().await;
        info!(store = self.inner.store.name(), "Job queue strategy destroyed");
        Ok(())
    }

    async fn find_job(&self, id: JobId) -> Result<Option<JobRecord>> {
        self.inner.store.find(id).await
    }

    async fn list_jobs(&self, options: &JobListOptions) -> Result<JobList> {
        self.inner.store.list(options).await
    }

    async fn cancel_job(&self, id: JobId) -> Result<JobRecord> {
        let record = self.inner.modify(id, |r| r.cancel(Utc::now()).map(|_| ())).await?;
        if record.state == JobState::Running {
            if let Some(token) = self.inner.running.get(&id) {
                token.cancel();
            }
        }
        info!(job_id = %id, state = %record.state, "Job cancellation requested");
        Ok(record)
    }

    async fn retry_job(&self, id: JobId) -> Result<JobRecord> {
        let record = self.inner.modify(id, |r| r.reset_for_retry()).await?;
        self.inner.store.requeued(&record).await?;
        self.inner.wake(&record.queue_name);
        info!(job_id = %id, attempts = record.attempts, retries = record.retries, "Job requeued by admin");
        Ok(record)
    }

    async fn remove_settled_jobs(&self, queue_names: &[String], older_than: DateTime<Utc>) -> Result<u64> {
        let removed = self.inner.store.remove_settled(queue_names, older_than).await?;
        info!(removed, ?queue_names, %older_than, "Removed settled jobs");
        Ok(removed)
    }

    async fn recover_stale(&self, stale_after: Duration, now: DateTime<Utc>) -> Result<RecoveryReport> {
        self.inner.recover(stale_after, now).await
    }
}
