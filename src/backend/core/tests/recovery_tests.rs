//! Crash recovery across process restarts.
//!
//! A shared in-memory store stands in for the durable backend: one "process"
//! claims a job and dies, the next one opens a service over the same store.

use chrono::Utc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use taskline_core::config::Config;
use taskline_core::jobs::{
    InMemoryJobStore, JobError, JobErrorKind, JobOptions, JobQueueService, JobRecord, JobState, JobStore,
    PollingJobQueueStrategy, RunningJob, ORPHANED_ERROR_MESSAGE,
};

fn config() -> Config {
    let mut config = Config::default();
    config.queue.poll_interval = Duration::from_millis(10);
    config.recovery.stale_after = Duration::from_secs(60);
    config.recovery.heartbeat_interval = Duration::from_secs(10);
    config
}

/// Insert a job and claim it as a worker that then vanished.
async fn orphan(store: &InMemoryJobStore, queue: &str, retries: u32) -> JobRecord {
    let crashed_at = Utc::now() - chrono::Duration::minutes(5);
    let record = JobRecord::new(queue, serde_json::json!({"n": 1}), retries, crashed_at);
    store.insert(&record).await.unwrap();
    let claimed = store.claim_next(queue, "dead-worker", crashed_at).await.unwrap().unwrap();
    assert_eq!(claimed.state, JobState::Running);
    claimed
}

fn counting_service(
    store: Arc<InMemoryJobStore>,
    config: &Config,
) -> (JobQueueService, Arc<AtomicUsize>) {
    let strategy = Arc::new(PollingJobQueueStrategy::from_arc(store));
    (JobQueueService::new(config, strategy), Arc::new(AtomicUsize::new(0)))
}

async fn wait_settled(store: &InMemoryJobStore, record: &JobRecord) -> JobRecord {
    for _ in 0..500 {
        let current = store.find(record.id).await.unwrap().unwrap();
        if current.is_settled() {
            return current;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {} never settled", record.id);
}

#[tokio::test]
async fn test_orphan_with_attempts_left_runs_again_after_restart() {
    let store = Arc::new(InMemoryJobStore::new());
    let orphaned = orphan(&store, "reports", 1).await;

    let (service, calls) = counting_service(store.clone(), &config());
    let counter = calls.clone();
    service
        .create_queue("reports", move |job: RunningJob<serde_json::Value>| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, JobError>(job.attempts())
            }
        })
        .await
        .unwrap();
    service.open().await.unwrap();

    let settled = wait_settled(&store, &orphaned).await;
    assert_eq!(settled.state, JobState::Completed);
    assert_eq!(settled.attempts, 2);
    assert_eq!(settled.result, Some(serde_json::json!(2)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    service.close().await.unwrap();
}

#[tokio::test]
async fn test_orphan_without_attempts_left_fails_as_orphaned() {
    let store = Arc::new(InMemoryJobStore::new());
    let orphaned = orphan(&store, "reports", 0).await;

    let (service, calls) = counting_service(store.clone(), &config());
    let counter = calls.clone();
    let queue = service
        .create_queue("reports", move |_job: RunningJob<serde_json::Value>| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, JobError>(())
            }
        })
        .await
        .unwrap();
    service.open().await.unwrap();

    let settled = store.find(orphaned.id).await.unwrap().unwrap();
    assert_eq!(settled.state, JobState::Failed);
    assert_eq!(settled.error.as_deref(), Some(ORPHANED_ERROR_MESSAGE));
    assert_eq!(settled.error_kind, Some(JobErrorKind::Orphaned));

    // New work on the same queue is unaffected.
    let fresh = queue.add(serde_json::json!({}), JobOptions::default()).await.unwrap();
    assert_eq!(
        fresh.wait(Some(Duration::from_secs(5))).await.unwrap().state,
        JobState::Completed
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    service.close().await.unwrap();
}

#[tokio::test]
async fn test_cancel_requested_before_crash_settles_cancelled() {
    let store = Arc::new(InMemoryJobStore::new());
    let mut orphaned = orphan(&store, "reports", 3).await;
    orphaned.cancel(Utc::now()).unwrap();
    assert!(store.update(&mut orphaned).await.unwrap());

    let (service, _) = counting_service(store.clone(), &config());
    service.open().await.unwrap();

    let report = service.recover_stale().await.unwrap();
    assert!(report.is_empty());
    let settled = store.find(orphaned.id).await.unwrap().unwrap();
    assert_eq!(settled.state, JobState::Cancelled);
    service.close().await.unwrap();
}

#[tokio::test]
async fn test_live_lease_is_not_recovered() {
    let store = Arc::new(InMemoryJobStore::new());
    let record = JobRecord::new("reports", serde_json::json!(null), 0, Utc::now());
    store.insert(&record).await.unwrap();
    store.claim_next("reports", "live-worker", Utc::now()).await.unwrap();

    let (service, _) = counting_service(store.clone(), &config());
    service.open().await.unwrap();
    let report = service.recover_stale().await.unwrap();

    assert!(report.is_empty());
    let current = store.find(record.id).await.unwrap().unwrap();
    assert_eq!(current.state, JobState::Running);
    assert_eq!(current.worker_id.as_deref(), Some("live-worker"));
    service.close().await.unwrap();
}

#[tokio::test]
async fn test_lease_refreshed_after_scan_wins() {
    let store = Arc::new(InMemoryJobStore::new());
    let mut claimed = orphan(&store, "reports", 0).await;

    // The owner heartbeats between the stale scan and the recovery write.
    let stale = store.find_stale(Utc::now() - chrono::Duration::minutes(1)).await.unwrap();
    assert_eq!(stale.len(), 1);
    claimed.heartbeat(Utc::now()).unwrap();
    assert!(store.update(&mut claimed).await.unwrap());

    let mut recovering = stale.into_iter().next().unwrap();
    recovering.recover_orphan(Utc::now()).unwrap();
    assert!(!store.update(&mut recovering).await.unwrap());

    let current = store.find(claimed.id).await.unwrap().unwrap();
    assert_eq!(current.state, JobState::Running);
}
