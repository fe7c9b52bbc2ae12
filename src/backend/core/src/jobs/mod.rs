//! Asynchronous job queues.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                            JobQueueService                               │
//! │   create_queue(name, process) ──▶ JobQueue<D, R> ──add──▶ SubscribableJob│
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │                      dyn JobQueueStrategy                                │
//! │  ┌──────────────────────────────┐    ┌────────────────────────────────┐  │
//! │  │ PollingJobQueueStrategy<S>   │    │ JobEvents (broadcast)          │  │
//! │  │  consumer per queue          │───▶│  every committed transition    │  │
//! │  │  heartbeat / commit / cancel │    └────────────────────────────────┘  │
//! │  └──────────────┬───────────────┘                                        │
//! │                 ▼                                                        │
//! │        JobStore: InMemoryJobStore | PostgresJobStore | RedisJobStore     │
//! │                 ▲                                                        │
//! │        StaleJobRecovery (startup + periodic)                             │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use taskline_core::jobs::{build_strategy, JobError, JobOptions, JobQueueService, RunningJob};
//!
//! let strategy = build_strategy(&config).await?;
//! let service = JobQueueService::new(&config, strategy);
//!
//! let resize = service
//!     .create_queue("resize", |job: RunningJob<ResizeRequest>| async move {
//!         job.set_progress(50);
//!         Ok::<_, JobError>(resize(job.data()).await?)
//!     })
//!     .await?;
//! service.open().await?;
//!
//! let job = resize.add(request, JobOptions::retries(2)).await?;
//! let done = job.wait(None).await?;
//! ```

pub mod builtin;
pub mod events;
pub mod job;
pub mod polling;
pub mod queue;
pub mod recovery;
pub mod redis;
pub mod service;
pub mod store;
pub mod strategy;

pub use builtin::{
    create_remove_settled_jobs_queue, register_health, HealthCheck, HealthReport, HealthRequest, RemoveSettledJobs,
    RemovedJobs, REMOVE_SETTLED_JOBS_QUEUE,
};
pub use events::JobEvents;
pub use job::{
    BackoffStrategy, Job, JobError, JobErrorKind, JobId, JobRecord, JobState, ORPHANED_ERROR_MESSAGE,
};
pub use polling::PollingJobQueueStrategy;
pub use queue::{JobOptions, JobQueue, RunningJob, SubscribableJob, UpdatesOptions};
pub use recovery::{RecoveryReport, StaleJobRecovery};
pub use self::redis::{RedisJobQueueStrategy, RedisJobStore};
pub use service::{build_strategy, JobQueueService, QueueContext};
pub use store::{InMemoryJobStore, JobStore, PostgresJobStore};
pub use strategy::{
    catch_panics, ActiveJob, JobList, JobListOptions, JobQueueStrategy, NewJob, ProcessFn, ProcessFuture,
};
