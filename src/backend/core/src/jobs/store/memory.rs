//! In-process job store. Jobs are lost when the process exits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};

use super::JobStore;
use crate::error::Result;
use crate::jobs::{JobId, JobList, JobListOptions, JobRecord, JobState};

/// Claimable jobs of one queue, keyed by insertion sequence.
#[derive(Default)]
struct QueueIndex {
    pending: BTreeSet<(u64, JobId)>,
    retrying: BTreeSet<(DateTime<Utc>, u64, JobId)>,
}

impl QueueIndex {
    fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.retrying.is_empty()
    }

    /// Oldest pending job or earliest due retry, whichever was inserted first.
    fn next(&self, now: DateTime<Utc>) -> Option<JobId> {
        let pending = self.pending.first().copied();
        let retry = self
            .retrying
            .first()
            .filter(|(at, _, _)| *at <= now)
            .map(|&(_, seq, id)| (seq, id));
        match (pending, retry) {
            (Some(p), Some(r)) => Some(if p.0 <= r.0 { p.1 } else { r.1 }),
            (p, r) => p.or(r).map(|(_, id)| id),
        }
    }
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, JobRecord>,
    /// Insertion order, used for listings.
    order: Vec<JobId>,
    seqs: HashMap<JobId, u64>,
    next_seq: u64,
    claimable: HashMap<String, QueueIndex>,
}

impl Inner {
    fn index(&mut self, job: &JobRecord) {
        let Some(&seq) = self.seqs.get(&job.id) else {
            return;
        };
        match job.state {
            JobState::Pending => {
                self.claimable
                    .entry(job.queue_name.clone())
                    .or_default()
                    .pending
                    .insert((seq, job.id));
            }
            JobState::Retrying => {
                let at = job.retry_at.unwrap_or(DateTime::<Utc>::MIN_UTC);
                self.claimable
                    .entry(job.queue_name.clone())
                    .or_default()
                    .retrying
                    .insert((at, seq, job.id));
            }
            _ => {}
        }
    }

    fn unindex(&mut self, job: &JobRecord) {
        let Some(&seq) = self.seqs.get(&job.id) else {
            return;
        };
        let Some(index) = self.claimable.get_mut(&job.queue_name) else {
            return;
        };
        match job.state {
            JobState::Pending => {
                index.pending.remove(&(seq, job.id));
            }
            JobState::Retrying => {
                let at = job.retry_at.unwrap_or(DateTime::<Utc>::MIN_UTC);
                index.retrying.remove(&(at, seq, job.id));
            }
            _ => {}
        }
        if index.is_empty() {
            self.claimable.remove(&job.queue_name);
        }
    }
}

/// Job store backed by a mutex-guarded map.
#[derive(Default)]
pub struct InMemoryJobStore {
    inner: Mutex<Inner>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn claimable_len(&self) -> usize {
        self.inner
            .lock()
            .claimable
            .values()
            .map(|index| index.pending.len() + index.retrying.len())
            .sum()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    fn name(&self) -> &'static str {
        "in_memory"
    }

    async fn insert(&self, record: &JobRecord) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.jobs.insert(record.id, record.clone()) {
            Some(previous) => inner.unindex(&previous),
            None => {
                let seq = inner.next_seq;
                inner.next_seq += 1;
                inner.seqs.insert(record.id, seq);
                inner.order.push(record.id);
            }
        }
        inner.index(record);
        Ok(())
    }

    async fn claim_next(&self, queue_name: &str, worker_id: &str, now: DateTime<Utc>) -> Result<Option<JobRecord>> {
        let mut inner = self.inner.lock();
        let Some(id) = inner.claimable.get(queue_name).and_then(|index| index.next(now)) else {
            return Ok(None);
        };
        let Some(mut job) = inner.jobs.get(&id).cloned() else {
            return Ok(None);
        };

        job.start(worker_id, now)?;
        job.version += 1;
        if let Some(stored) = inner.jobs.get(&id).cloned() {
            inner.unindex(&stored);
        }
        inner.jobs.insert(id, job.clone());
        Ok(Some(job))
    }

    async fn find(&self, id: JobId) -> Result<Option<JobRecord>> {
        Ok(self.inner.lock().jobs.get(&id).cloned())
    }

    async fn list(&self, options: &JobListOptions) -> Result<JobList> {
        let inner = self.inner.lock();
        let matching: Vec<&JobRecord> = inner
            .order
            .iter()
            .filter_map(|id| inner.jobs.get(id))
            .filter(|job| options.matches(job))
            .collect();

        let total = matching.len();
        let items = matching
            .into_iter()
            .skip(options.skip)
            .take(options.take.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(JobList { items, total })
    }

    async fn update(&self, record: &mut JobRecord) -> Result<bool> {
        let mut inner = self.inner.lock();
        let previous = match inner.jobs.get(&record.id) {
            Some(stored) if stored.version == record.version => stored.clone(),
            _ => return Ok(false),
        };
        record.version += 1;
        inner.unindex(&previous);
        inner.jobs.insert(record.id, record.clone());
        inner.index(record);
        Ok(true)
    }

    async fn find_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<JobRecord>> {
        let inner = self.inner.lock();
        Ok(inner
            .order
            .iter()
            .filter_map(|id| inner.jobs.get(id))
            .filter(|job| job.state == JobState::Running && job.heartbeat_at.map_or(true, |at| at < cutoff))
            .cloned()
            .collect())
    }

    async fn remove_settled(&self, queue_names: &[String], older_than: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock();
        let Inner { jobs, order, seqs, .. } = &mut *inner;

        // Settled jobs are never in the claimable index.
        let before = jobs.len();
        jobs.retain(|_, job| {
            let in_scope = queue_names.is_empty() || queue_names.contains(&job.queue_name);
            let expired = job.is_settled() && job.settled_at.is_some_and(|at| at < older_than);
            !(in_scope && expired)
        });
        order.retain(|id| jobs.contains_key(id));
        seqs.retain(|id, _| jobs.contains_key(id));
        Ok((before - jobs.len()) as u64)
    }
}
