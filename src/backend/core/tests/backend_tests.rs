//! Durable backend tests. They need live services and are ignored by default:
//!
//! ```text
//! DATABASE_URL=postgres://... REDIS_URL=redis://... cargo test --test backend_tests -- --ignored
//! ```

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use taskline_core::config::{Config, DatabaseConfig, RedisConfig};
use taskline_core::jobs::{
    BackoffStrategy, JobError, JobListOptions, JobOptions, JobQueueService, JobQueueStrategy, JobRecord, JobState,
    JobStore, PollingJobQueueStrategy, PostgresJobStore, RedisJobQueueStrategy, RedisJobStore, RunningJob,
};

const WAIT: Option<Duration> = Some(Duration::from_secs(20));

fn config() -> Config {
    let mut config = Config::default();
    config.queue.poll_interval = Duration::from_millis(20);
    config.queue.backoff = BackoffStrategy::none();
    config
}

fn unique(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4().simple())
}

async fn postgres_store() -> PostgresJobStore {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let config = DatabaseConfig {
        url,
        ..Default::default()
    };
    let store = PostgresJobStore::connect(&config).await.unwrap();
    store.init().await.unwrap();
    store
}

fn redis_config() -> RedisConfig {
    RedisConfig {
        url: std::env::var("REDIS_URL").expect("REDIS_URL must be set"),
        key_prefix: unique("taskline-test"),
        block_timeout: Duration::from_secs(1),
    }
}

/// Success, retry-then-fail and admin listing on any strategy.
async fn exercise(strategy: Arc<dyn JobQueueStrategy>) {
    let service = JobQueueService::new(&config(), strategy);
    let name = unique("backend");
    let queue = service
        .create_queue(name.clone(), |job: RunningJob<i64>| async move {
            if *job.data() < 0 {
                return Err(JobError::new("negative"));
            }
            job.set_progress(50);
            Ok::<_, JobError>(*job.data() * 2)
        })
        .await
        .unwrap();
    service.open().await.unwrap();

    let ok = queue.add(21, JobOptions::default()).await.unwrap();
    let bad = queue.add(-1, JobOptions::retries(1)).await.unwrap();

    let ok = ok.wait(WAIT).await.unwrap();
    assert_eq!(ok.state, JobState::Completed);
    assert_eq!(ok.result, Some(42));

    let bad = bad.wait(WAIT).await.unwrap();
    assert_eq!(bad.state, JobState::Failed);
    assert_eq!(bad.attempts, 2);
    assert_eq!(bad.error.as_deref(), Some("negative"));

    let listed = service
        .list_jobs(&JobListOptions {
            queue_names: vec![name.clone()],
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(listed.total, 2);

    let removed = service
        .remove_settled_jobs(&[name], Utc::now() + chrono::Duration::seconds(5))
        .await
        .unwrap();
    assert_eq!(removed, 2);
    service.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_postgres_strategy_end_to_end() {
    exercise(Arc::new(PollingJobQueueStrategy::new(postgres_store().await))).await;
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_postgres_claim_is_exclusive() {
    let store = Arc::new(postgres_store().await);
    let queue = unique("claims");
    for i in 0..20 {
        store
            .insert(&JobRecord::new(queue.clone(), serde_json::json!(i), 0, Utc::now()))
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for w in 0..4 {
        let store = store.clone();
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(record) = store.claim_next(&queue, &format!("w{w}"), Utc::now()).await.unwrap() {
                claimed.push(record.id);
            }
            claimed
        }));
    }
    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    all.sort();
    all.dedup();
    assert_eq!(all.len(), 20);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_postgres_stale_write_is_rejected() {
    let store = postgres_store().await;
    let record = JobRecord::new(unique("cas"), serde_json::json!(null), 0, Utc::now());
    store.insert(&record).await.unwrap();

    let mut first = store.find(record.id).await.unwrap().unwrap();
    let mut second = first.clone();
    first.cancel(Utc::now()).unwrap();
    assert!(store.update(&mut first).await.unwrap());
    second.start("late", Utc::now()).unwrap();
    assert!(!store.update(&mut second).await.unwrap());
}

#[tokio::test]
#[ignore = "requires REDIS_URL"]
async fn test_redis_strategy_end_to_end() {
    let strategy = RedisJobQueueStrategy::connect(&redis_config()).await.unwrap();
    exercise(Arc::new(strategy)).await;
}

#[tokio::test]
#[ignore = "requires REDIS_URL"]
async fn test_redis_sweep_returns_stranded_deliveries() {
    let store = RedisJobStore::connect(&redis_config()).await.unwrap();
    let queue = unique("stranded");
    let record = JobRecord::new(queue.clone(), serde_json::json!(null), 0, Utc::now());
    store.insert(&record).await.unwrap();

    // Claim and then pretend the worker died before starting the job: put the
    // record back to Pending without touching the in-flight list.
    let mut claimed = store.claim_next(&queue, "w", Utc::now()).await.unwrap().unwrap();
    claimed.recover_orphan(Utc::now()).unwrap();
    assert!(store.update(&mut claimed).await.unwrap());

    // First sweep only marks suspects, the second requeues them.
    store.sweep().await.unwrap();
    assert_eq!(store.sweep().await.unwrap(), 1);
    let again = store.claim_next(&queue, "w2", Utc::now()).await.unwrap().unwrap();
    assert_eq!(again.id, record.id);
    assert_eq!(again.attempts, 2);
}
