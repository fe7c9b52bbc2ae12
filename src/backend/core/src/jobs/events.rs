//! In-process job event hub.
//!
//! Every committed write to a job record is published here. Subscribers use it
//! to follow a job without polling the backend; jobs executed by another
//! process are still picked up by the poll fallback in
//! [`super::queue::SubscribableJob::updates`].

use tokio::sync::broadcast;

use super::JobRecord;

const DEFAULT_CAPACITY: usize = 1024;

/// Broadcast hub for job snapshots.
#[derive(Debug, Clone)]
pub struct JobEvents {
    sender: broadcast::Sender<JobRecord>,
}

impl JobEvents {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Slow subscribers lag past `capacity` and fall back to polling.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish a committed snapshot. Having no subscribers is not an error.
    pub fn publish(&self, record: JobRecord) {
        let _ = self.sender.send(record);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobRecord> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for JobEvents {
    fn default() -> Self {
        Self::new()
    }
}
