//! Redis reliable-queue backend.
//!
//! Layout under `{prefix}`:
//!
//! ```text
//! {prefix}:job:{id}          hash   record (JSON), version
//! {prefix}:queue:{name}      list   ready ids, LPUSH in, popped from the right
//! {prefix}:inflight:{name}   list   ids popped by a consumer and not yet acked
//! {prefix}:delayed:{name}    zset   Retrying ids scored by retry_at (ms)
//! {prefix}:index:{name}      zset   every id of the queue scored by created_at (ms)
//! {prefix}:queues            set    known queue names
//! ```
//!
//! A claim moves an id from the ready list to the in-flight list with
//! `RPOPLPUSH`, then compare-and-swaps the record to `Running`. An idle
//! consumer blocks on the ready list with `BLMOVE` (Redis 6.2+) without
//! popping, so it holds no concurrency permit while it waits. The record's
//! `attempts` is the only retry counter: a failed attempt acks the message and
//! schedules the id in the delayed set. Broker redelivery only happens for ids
//! left in the in-flight list by a dead consumer, through recovery.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::Script;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::polling::PollingJobQueueStrategy;
use super::store::JobStore;
use super::{JobId, JobList, JobListOptions, JobRecord, JobState};
use crate::config::RedisConfig;
use crate::error::Result;

/// Compare-and-swap of a record on its version.
const CAS_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'version')
if current == false or tonumber(current) ~= tonumber(ARGV[1]) then
  return 0
end
redis.call('HSET', KEYS[1], 'record', ARGV[2], 'version', ARGV[3])
return 1
"#;

/// Move due ids from the delayed set to the ready list.
const PROMOTE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[1], id)
  redis.call('LPUSH', KEYS[2], id)
end
return #due
"#;

const PROMOTE_BATCH: usize = 100;

/// Unclaimable ids (cancelled, removed) skipped per claim call.
const MAX_SKIPPED_PER_CLAIM: usize = 16;

const CLAIM_CAS_ATTEMPTS: usize = 4;

/// Strategy over Redis.
pub type RedisJobQueueStrategy = PollingJobQueueStrategy<RedisJobStore>;

impl PollingJobQueueStrategy<RedisJobStore> {
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        Ok(Self::new(RedisJobStore::connect(config).await?))
    }
}

#[derive(Debug, Clone)]
struct Keys {
    prefix: String,
}

impl Keys {
    fn job(&self, id: impl std::fmt::Display) -> String {
        format!("{}:job:{}", self.prefix, id)
    }

    fn ready(&self, queue: &str) -> String {
        format!("{}:queue:{}", self.prefix, queue)
    }

    fn inflight(&self, queue: &str) -> String {
        format!("{}:inflight:{}", self.prefix, queue)
    }

    fn delayed(&self, queue: &str) -> String {
        format!("{}:delayed:{}", self.prefix, queue)
    }

    fn index(&self, queue: &str) -> String {
        format!("{}:index:{}", self.prefix, queue)
    }

    fn queues(&self) -> String {
        format!("{}:queues", self.prefix)
    }
}

/// Job store over Redis lists.
pub struct RedisJobStore {
    client: redis::Client,
    conn: ConnectionManager,
    /// One connection per queue for blocking waits, so they never stall other commands.
    blocking: DashMap<String, MultiplexedConnection>,
    keys: Keys,
    block_timeout: Duration,
    cas: Script,
    promote: Script,
    /// In-flight ids seen unclaimed by the previous sweep.
    suspects: Mutex<HashSet<JobId>>,
}

impl RedisJobStore {
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        let conn = ConnectionManager::new(client.clone()).await?;
        info!(prefix = %config.key_prefix, "Connected to Redis");

        Ok(Self {
            client,
            conn,
            blocking: DashMap::new(),
            keys: Keys {
                prefix: config.key_prefix.clone(),
            },
            block_timeout: config.block_timeout,
            cas: Script::new(CAS_SCRIPT),
            promote: Script::new(PROMOTE_SCRIPT),
            suspects: Mutex::new(HashSet::new()),
        })
    }

    async fn blocking_conn(&self, queue_name: &str) -> Result<MultiplexedConnection> {
        if let Some(conn) = self.blocking.get(queue_name) {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_tokio_connection().await?;
        self.blocking.insert(queue_name.to_string(), conn.clone());
        Ok(conn)
    }

    async fn queue_names(&self, filter: &[String]) -> Result<Vec<String>> {
        if !filter.is_empty() {
            return Ok(filter.to_vec());
        }
        let mut conn = self.conn.clone();
        let mut names: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.keys.queues())
            .query_async(&mut conn)
            .await?;
        names.sort();
        Ok(names)
    }

    async fn load_many(&self, ids: &[String]) -> Result<Vec<JobRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for id in ids {
            pipe.cmd("HGET").arg(self.keys.job(id)).arg("record");
        }
        let mut conn = self.conn.clone();
        let raw: Vec<Option<String>> = pipe.query_async(&mut conn).await?;
        raw.into_iter()
            .flatten()
            .map(|json| serde_json::from_str(&json).map_err(Into::into))
            .collect()
    }

    async fn promote_due(&self, queue_name: &str, now: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn.clone();
        let promoted: usize = self
            .promote
            .key(self.keys.delayed(queue_name))
            .key(self.keys.ready(queue_name))
            .arg(now.timestamp_millis())
            .arg(PROMOTE_BATCH)
            .invoke_async(&mut conn)
            .await?;
        if promoted > 0 {
            debug!(queue = %queue_name, promoted, "Promoted due retries");
        }
        Ok(())
    }

    async fn ack(&self, queue_name: &str, id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("LREM")
            .arg(self.keys.inflight(queue_name))
            .arg(1)
            .arg(id)
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn schedule_retry(&self, record: &JobRecord) -> Result<()> {
        let at = record.retry_at.unwrap_or_else(Utc::now).timestamp_millis();
        let id = record.id.to_string();
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .cmd("ZADD")
            .arg(self.keys.delayed(&record.queue_name))
            .arg(at)
            .arg(&id)
            .ignore()
            .cmd("LREM")
            .arg(self.keys.inflight(&record.queue_name))
            .arg(1)
            .arg(&id)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn push_ready(&self, record: &JobRecord) -> Result<()> {
        let id = record.id.to_string();
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .cmd("LREM")
            .arg(self.keys.inflight(&record.queue_name))
            .arg(0)
            .arg(&id)
            .ignore()
            .cmd("LPUSH")
            .arg(self.keys.ready(&record.queue_name))
            .arg(&id)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Turn a popped id into a claim, or ack it when it is no longer claimable.
    async fn claim_popped(
        &self,
        queue_name: &str,
        raw_id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>> {
        let Ok(id) = raw_id.parse::<JobId>() else {
            warn!(queue = %queue_name, id = %raw_id, "Dropping malformed queue entry");
            self.ack(queue_name, raw_id).await?;
            return Ok(None);
        };

        for _ in 0..CLAIM_CAS_ATTEMPTS {
            let Some(mut record) = self.find(id).await? else {
                self.ack(queue_name, raw_id).await?;
                return Ok(None);
            };
            if !record.is_claimable(now) {
                if record.state == JobState::Retrying {
                    self.schedule_retry(&record).await?;
                } else {
                    self.ack(queue_name, raw_id).await?;
                }
                debug!(job_id = %id, state = %record.state, "Skipped unclaimable queue entry");
                return Ok(None);
            }
            record.start(worker_id, now)?;
            if self.update(&mut record).await? {
                return Ok(Some(record));
            }
        }
        // Left in flight; the next sweep puts it back.
        Ok(None)
    }

    async fn pop(&self, queue_name: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let id: Option<String> = redis::cmd("RPOPLPUSH")
            .arg(self.keys.ready(queue_name))
            .arg(self.keys.inflight(queue_name))
            .query_async(&mut conn)
            .await?;
        Ok(id)
    }

    async fn claim(&self, queue_name: &str, worker_id: &str) -> Result<Option<JobRecord>> {
        self.promote_due(queue_name, Utc::now()).await?;
        for _ in 0..MAX_SKIPPED_PER_CLAIM {
            let Some(raw_id) = self.pop(queue_name).await? else {
                return Ok(None);
            };
            if let Some(record) = self.claim_popped(queue_name, &raw_id, worker_id, Utc::now()).await? {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Block until the ready list is non-empty or `block_timeout` passes.
    /// `BLMOVE` from the tail back onto the tail leaves the list unchanged.
    async fn wait_ready(&self, queue_name: &str) -> Result<()> {
        let mut conn = self.blocking_conn(queue_name).await?;
        let ready = self.keys.ready(queue_name);
        let waited = redis::cmd("BLMOVE")
            .arg(&ready)
            .arg(&ready)
            .arg("RIGHT")
            .arg("RIGHT")
            .arg(self.block_timeout.as_secs().max(1))
            .query_async::<_, Option<String>>(&mut conn)
            .await;
        if waited.is_err() {
            self.blocking.remove(queue_name);
        }
        waited?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn insert(&self, record: &JobRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        let id = record.id.to_string();
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("HSET")
            .arg(self.keys.job(&id))
            .arg("record")
            .arg(&json)
            .arg("version")
            .arg(record.version)
            .ignore()
            .cmd("ZADD")
            .arg(self.keys.index(&record.queue_name))
            .arg(record.created_at.timestamp_millis())
            .arg(&id)
            .ignore()
            .cmd("SADD")
            .arg(self.keys.queues())
            .arg(&record.queue_name)
            .ignore();
        if record.state == JobState::Pending {
            pipe.cmd("LPUSH").arg(self.keys.ready(&record.queue_name)).arg(&id).ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn claim_next(&self, queue_name: &str, worker_id: &str, _now: DateTime<Utc>) -> Result<Option<JobRecord>> {
        self.claim(queue_name, worker_id).await
    }

    /// Due retries are promoted first so they count as ready work.
    async fn wait_for_work(&self, queue_name: &str, _hint: Duration) -> Result<()> {
        self.promote_due(queue_name, Utc::now()).await?;
        self.wait_ready(queue_name).await
    }

    async fn find(&self, id: JobId) -> Result<Option<JobRecord>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("HGET")
            .arg(self.keys.job(id))
            .arg("record")
            .query_async(&mut conn)
            .await?;
        Ok(raw.map(|json| serde_json::from_str(&json)).transpose()?)
    }

    async fn list(&self, options: &JobListOptions) -> Result<JobList> {
        let mut matching = Vec::new();
        for queue_name in self.queue_names(&options.queue_names).await? {
            let mut conn = self.conn.clone();
            let ids: Vec<String> = redis::cmd("ZRANGE")
                .arg(self.keys.index(&queue_name))
                .arg(0)
                .arg(-1)
                .query_async(&mut conn)
                .await?;
            matching.extend(self.load_many(&ids).await?.into_iter().filter(|r| options.matches(r)));
        }
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.0.cmp(&b.id.0)));

        let total = matching.len();
        let items = matching
            .into_iter()
            .skip(options.skip)
            .take(options.take.unwrap_or(usize::MAX))
            .collect();
        Ok(JobList { items, total })
    }

    async fn update(&self, record: &mut JobRecord) -> Result<bool> {
        let mut next = record.clone();
        next.version += 1;
        let json = serde_json::to_string(&next)?;

        let mut conn = self.conn.clone();
        let swapped: i32 = self
            .cas
            .key(self.keys.job(record.id))
            .arg(record.version)
            .arg(json)
            .arg(next.version)
            .invoke_async(&mut conn)
            .await?;

        if swapped == 1 {
            record.version = next.version;
            return Ok(true);
        }
        Ok(false)
    }

    async fn find_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<JobRecord>> {
        let mut stale = Vec::new();
        let mut seen = HashSet::new();
        for queue_name in self.queue_names(&[]).await? {
            let mut conn = self.conn.clone();
            let ids: Vec<String> = redis::cmd("LRANGE")
                .arg(self.keys.inflight(&queue_name))
                .arg(0)
                .arg(-1)
                .query_async(&mut conn)
                .await?;
            for record in self.load_many(&ids).await? {
                let expired = record.heartbeat_at.map_or(true, |at| at < cutoff);
                if record.state == JobState::Running && expired && seen.insert(record.id) {
                    stale.push(record);
                }
            }
        }
        Ok(stale)
    }

    async fn remove_settled(&self, queue_names: &[String], older_than: DateTime<Utc>) -> Result<u64> {
        let mut removed = 0u64;
        for queue_name in self.queue_names(queue_names).await? {
            let mut conn = self.conn.clone();
            let ids: Vec<String> = redis::cmd("ZRANGE")
                .arg(self.keys.index(&queue_name))
                .arg(0)
                .arg(-1)
                .query_async(&mut conn)
                .await?;

            let expired: Vec<String> = self
                .load_many(&ids)
                .await?
                .into_iter()
                .filter(|r| r.is_settled() && r.settled_at.is_some_and(|at| at < older_than))
                .map(|r| r.id.to_string())
                .collect();
            if expired.is_empty() {
                continue;
            }

            let mut pipe = redis::pipe();
            pipe.atomic();
            for id in &expired {
                pipe.cmd("DEL").arg(self.keys.job(id)).ignore();
                pipe.cmd("ZREM").arg(self.keys.index(&queue_name)).arg(id).ignore();
            }
            pipe.query_async::<_, ()>(&mut conn).await?;
            removed += expired.len() as u64;
        }
        Ok(removed)
    }

    async fn released(&self, record: &JobRecord) -> Result<()> {
        match record.state {
            JobState::Retrying => self.schedule_retry(record).await,
            state if state.is_settled() => self.ack(&record.queue_name, &record.id.to_string()).await,
            _ => Ok(()),
        }
    }

    async fn requeued(&self, record: &JobRecord) -> Result<()> {
        self.push_ready(record).await
    }

    /// Ids stay in flight without a `Running` record when a consumer died
    /// between pop and claim. An id is put back only when two consecutive
    /// sweeps find it, which rules out consumers that are mid-claim.
    async fn sweep(&self) -> Result<usize> {
        let mut unclaimed = HashSet::new();
        let mut returned = 0;

        for queue_name in self.queue_names(&[]).await? {
            let mut conn = self.conn.clone();
            let ids: Vec<String> = redis::cmd("LRANGE")
                .arg(self.keys.inflight(&queue_name))
                .arg(0)
                .arg(-1)
                .query_async(&mut conn)
                .await?;

            for record in self.load_many(&ids).await? {
                let suspected = self.suspects.lock().contains(&record.id);
                match record.state {
                    JobState::Running => {}
                    state if state.is_settled() => self.ack(&queue_name, &record.id.to_string()).await?,
                    _ if suspected => {
                        if record.state == JobState::Retrying {
                            self.schedule_retry(&record).await?;
                        } else {
                            self.push_ready(&record).await?;
                        }
                        warn!(job_id = %record.id, queue = %queue_name, "Returned stranded delivery");
                        returned += 1;
                    }
                    _ => {
                        unclaimed.insert(record.id);
                    }
                }
            }
        }

        *self.suspects.lock() = unclaimed;
        Ok(returned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = Keys {
            prefix: "taskline".into(),
        };
        let id = JobId::new();
        assert_eq!(keys.job(id), format!("taskline:job:{}", id));
        assert_eq!(keys.ready("emails"), "taskline:queue:emails");
        assert_eq!(keys.inflight("emails"), "taskline:inflight:emails");
        assert_eq!(keys.delayed("emails"), "taskline:delayed:emails");
        assert_eq!(keys.index("emails"), "taskline:index:emails");
        assert_eq!(keys.queues(), "taskline:queues");
    }

    #[test]
    fn test_scripts_reference_expected_keys() {
        assert!(CAS_SCRIPT.contains("HGET"));
        assert!(PROMOTE_SCRIPT.contains("ZRANGEBYSCORE"));
    }
}
