//! Job records and the job state machine.
//!
//! - **JobRecord**: the persisted, type-erased job (payload and result as JSON)
//! - **Job<D, R>**: the typed snapshot handed to callers
//! - **JobState**: the lifecycle states and the legal transitions between them
//! - **BackoffStrategy**: delay before a failed attempt becomes claimable again
//!
//! Every mutation of a record goes through a transition method on
//! [`JobRecord`]. Backends never assign `state` directly.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{ErrorCode, Result, TasklineError};

/// Error recorded on jobs abandoned by a crashed or stalled worker.
pub const ORPHANED_ERROR_MESSAGE: &str = "orphaned by process restart";

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for JobId {
    type Err = TasklineError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| TasklineError::new(ErrorCode::InvalidInput, format!("Invalid job id '{}': {}", s, e)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job State
// ═══════════════════════════════════════════════════════════════════════════════

/// Lifecycle state of a job.
///
/// ```text
/// Pending  -> Running
/// Running  -> Completed | Failed | Retrying | Pending (orphan recovery)
/// Retrying -> Running
/// Pending | Running | Retrying -> Cancelled
/// Failed   -> Pending (admin retry)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Retrying,
    Cancelled,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        Self::Pending,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Retrying,
        Self::Cancelled,
    ];

    /// True for terminal states.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Retrying => "RETRYING",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Whether the state machine has an edge from `self` to `to`.
    pub fn can_transition_to(&self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Retrying)
                | (Running, Pending)
                | (Retrying, Running)
                | (Pending, Cancelled)
                | (Running, Cancelled)
                | (Retrying, Cancelled)
                | (Failed, Pending)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = TasklineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| TasklineError::new(ErrorCode::InvalidInput, format!("Unknown job state '{}'", s)))
    }
}

/// Why a job ended up `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobErrorKind {
    /// The process function rejected on its last attempt.
    Handler,
    /// The owning worker died or stopped heartbeating.
    Orphaned,
}

impl JobErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Handler => "handler",
            Self::Orphaned => "orphaned",
        }
    }
}

impl FromStr for JobErrorKind {
    type Err = TasklineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "handler" => Ok(Self::Handler),
            "orphaned" => Ok(Self::Orphaned),
            other => Err(TasklineError::new(
                ErrorCode::DeserializationError,
                format!("Unknown job error kind '{}'", other),
            )),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Rejection returned by a process function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl JobError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            context: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_context(mut self, context: impl Serialize) -> Self {
        self.context = serde_json::to_value(context).ok();
        self
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (code: {})", code)?;
        }
        Ok(())
    }
}

impl std::error::Error for JobError {}

impl From<TasklineError> for JobError {
    fn from(error: TasklineError) -> Self {
        Self {
            message: error.user_message().to_string(),
            code: Some(error.code().to_string()),
            context: None,
        }
    }
}

impl From<&str> for JobError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for JobError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Backoff Strategy
// ═══════════════════════════════════════════════════════════════════════════════

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay after every failed attempt
    Fixed {
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },
    /// `initial + increment * (attempt - 1)`, capped at `max`
    Linear {
        #[serde(with = "humantime_serde")]
        initial: Duration,
        #[serde(with = "humantime_serde")]
        increment: Duration,
        #[serde(with = "humantime_serde")]
        max: Duration,
    },
    /// `initial * multiplier^(attempt - 1)`, capped at `max`
    Exponential {
        #[serde(with = "humantime_serde")]
        initial: Duration,
        #[serde(with = "humantime_serde")]
        max: Duration,
        multiplier: f64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(300),
            multiplier: 2.0,
        }
    }
}

impl BackoffStrategy {
    /// Retry immediately.
    pub fn none() -> Self {
        Self::Fixed { delay: Duration::ZERO }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed { delay }
    }

    /// Longest delay this strategy can produce.
    pub fn max_delay(&self) -> Duration {
        match self {
            Self::Fixed { delay } => *delay,
            Self::Linear { max, .. } | Self::Exponential { max, .. } => *max,
        }
    }

    /// Delay after the given failed attempt (1-based, as counted in `attempts`).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let index = attempt.saturating_sub(1);
        match self {
            Self::Fixed { delay } => *delay,
            Self::Linear { initial, increment, max } => increment
                .checked_mul(index)
                .and_then(|step| initial.checked_add(step))
                .map_or(*max, |delay| delay.min(*max)),
            Self::Exponential { initial, max, multiplier } => {
                let secs = initial.as_secs_f64() * multiplier.powi(index.min(i32::MAX as u32) as i32);
                if !secs.is_finite() || secs < 0.0 || secs >= max.as_secs_f64() {
                    *max
                } else {
                    Duration::from_secs_f64(secs)
                }
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Record
// ═══════════════════════════════════════════════════════════════════════════════

/// The persisted form of a job.
///
/// `version` is bumped by the store on every successful write; stores reject
/// writes whose version no longer matches (optimistic concurrency).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub queue_name: String,
    pub data: serde_json::Value,
    pub state: JobState,
    pub progress: u8,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub error_kind: Option<JobErrorKind>,
    pub attempts: u32,
    pub retries: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub settled_at: Option<DateTime<Utc>>,
    pub retry_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub cancel_requested: bool,
    pub version: i64,
}

impl JobRecord {
    /// Create a new `Pending` record.
    pub fn new(queue_name: impl Into<String>, data: serde_json::Value, retries: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            queue_name: queue_name.into(),
            data,
            state: JobState::Pending,
            progress: 0,
            result: None,
            error: None,
            error_kind: None,
            attempts: 0,
            retries,
            created_at: now,
            started_at: None,
            settled_at: None,
            retry_at: None,
            heartbeat_at: None,
            worker_id: None,
            cancel_requested: false,
            version: 0,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.state.is_settled()
    }

    /// `settled_at - started_at`, when both exist.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.settled_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    /// The error of a `Failed` record: `JobOrphaned` when recovery failed it,
    /// `JobFailed` when its handler rejected the last attempt.
    pub fn failure(&self) -> Option<TasklineError> {
        failure_of(self.id, self.state, self.error_kind, self.error.as_deref())
    }

    /// Whether another attempt fits within `retries + 1`.
    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.retries.saturating_add(1)
    }

    /// Whether a consumer may claim this record at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            JobState::Pending => true,
            JobState::Retrying => self.retry_at.map_or(true, |at| at <= now),
            _ => false,
        }
    }

    fn guard(&self, to: JobState) -> Result<()> {
        if self.is_settled() && !(self.state == JobState::Failed && to == JobState::Pending) {
            return Err(TasklineError::job_already_settled(self.id, self.state));
        }
        if !self.state.can_transition_to(to) {
            return Err(TasklineError::invalid_state_transition(self.id, self.state, to));
        }
        Ok(())
    }

    fn settle(&mut self, state: JobState, now: DateTime<Utc>) {
        self.state = state;
        self.settled_at = Some(now);
        self.retry_at = None;
        self.heartbeat_at = None;
        self.worker_id = None;
    }

    /// Claim: `Pending | Retrying -> Running`.
    ///
    /// Counts the attempt. `started_at` is only set on the first claim.
    pub fn start(&mut self, worker_id: &str, now: DateTime<Utc>) -> Result<()> {
        self.guard(JobState::Running)?;
        self.state = JobState::Running;
        self.attempts = self.attempts.saturating_add(1);
        self.started_at.get_or_insert(now);
        self.progress = 0;
        self.retry_at = None;
        self.heartbeat_at = Some(now);
        self.worker_id = Some(worker_id.to_string());
        Ok(())
    }

    /// Handler resolved. Settles `Cancelled` instead if cancellation was
    /// requested while running.
    pub fn complete(&mut self, result: serde_json::Value, now: DateTime<Utc>) -> Result<JobState> {
        self.guard(JobState::Completed)?;
        if self.cancel_requested {
            self.settle(JobState::Cancelled, now);
            return Ok(JobState::Cancelled);
        }
        self.result = Some(result);
        self.progress = 100;
        self.settle(JobState::Completed, now);
        Ok(JobState::Completed)
    }

    /// Handler rejected. Moves to `Retrying` while attempts remain, otherwise
    /// `Failed`.
    pub fn fail_attempt(&mut self, error: &JobError, backoff: &BackoffStrategy, now: DateTime<Utc>) -> Result<JobState> {
        self.guard(JobState::Failed)?;
        if self.cancel_requested {
            self.settle(JobState::Cancelled, now);
            return Ok(JobState::Cancelled);
        }
        if self.has_attempts_left() {
            let delay = backoff.delay_for_attempt(self.attempts);
            let retry_at = chrono::Duration::from_std(delay)
                .ok()
                .and_then(|delay| now.checked_add_signed(delay))
                .ok_or_else(|| {
                    TasklineError::configuration(format!("Retry delay {:?} is out of range", delay))
                })?;
            self.state = JobState::Retrying;
            self.retry_at = Some(retry_at);
            self.heartbeat_at = None;
            self.worker_id = None;
            return Ok(JobState::Retrying);
        }
        self.error = Some(error.message.clone());
        self.error_kind = Some(JobErrorKind::Handler);
        self.settle(JobState::Failed, now);
        Ok(JobState::Failed)
    }

    /// Cancel. Immediate for `Pending | Retrying`; for `Running` only the
    /// request flag is set and the outcome is decided when the handler returns.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<JobState> {
        self.guard(JobState::Cancelled)?;
        if self.state == JobState::Running {
            self.cancel_requested = true;
            return Ok(JobState::Running);
        }
        self.settle(JobState::Cancelled, now);
        Ok(JobState::Cancelled)
    }

    /// Resolve a `Running` job whose owner is gone. The attempt was already
    /// counted at claim time, so requeueing does not count it again.
    pub fn recover_orphan(&mut self, now: DateTime<Utc>) -> Result<JobState> {
        self.guard(JobState::Pending)?;
        if self.state != JobState::Running {
            return Err(TasklineError::invalid_state_transition(self.id, self.state, JobState::Pending));
        }
        if self.cancel_requested {
            self.settle(JobState::Cancelled, now);
            return Ok(JobState::Cancelled);
        }
        if self.has_attempts_left() {
            self.state = JobState::Pending;
            self.progress = 0;
            self.heartbeat_at = None;
            self.worker_id = None;
            return Ok(JobState::Pending);
        }
        self.error = Some(ORPHANED_ERROR_MESSAGE.to_string());
        self.error_kind = Some(JobErrorKind::Orphaned);
        self.settle(JobState::Failed, now);
        Ok(JobState::Failed)
    }

    /// Admin retry: `Failed -> Pending`. Attempts are preserved and `retries`
    /// is raised so exactly one more attempt fits.
    pub fn reset_for_retry(&mut self) -> Result<()> {
        if self.state != JobState::Failed {
            if self.is_settled() {
                return Err(TasklineError::job_already_settled(self.id, self.state));
            }
            return Err(TasklineError::invalid_state_transition(self.id, self.state, JobState::Pending));
        }
        self.state = JobState::Pending;
        self.retries = self.retries.max(self.attempts);
        self.progress = 0;
        self.result = None;
        self.error = None;
        self.error_kind = None;
        self.settled_at = None;
        self.cancel_requested = false;
        Ok(())
    }

    /// Refresh the lease of a running job.
    pub fn heartbeat(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.state != JobState::Running {
            return Err(TasklineError::invalid_state_transition(self.id, self.state, JobState::Running));
        }
        self.heartbeat_at = Some(now);
        Ok(())
    }

    /// Record progress reported by the handler, clamped to 100.
    pub fn set_progress(&mut self, progress: u8, now: DateTime<Utc>) -> Result<()> {
        self.heartbeat(now)?;
        self.progress = progress.min(100);
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Typed Job
// ═══════════════════════════════════════════════════════════════════════════════

/// Typed snapshot of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job<D, R = serde_json::Value> {
    pub id: JobId,
    pub queue_name: String,
    pub data: D,
    pub state: JobState,
    pub progress: u8,
    pub result: Option<R>,
    pub error: Option<String>,
    pub error_kind: Option<JobErrorKind>,
    pub attempts: u32,
    pub retries: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl<D, R> Job<D, R>
where
    D: DeserializeOwned,
    R: DeserializeOwned,
{
    /// Decode a record's payload and result.
    pub fn from_record(record: JobRecord) -> Result<Self> {
        let data = serde_json::from_value(record.data)?;
        let result = record.result.map(serde_json::from_value).transpose()?;
        Ok(Self {
            id: record.id,
            queue_name: record.queue_name,
            data,
            state: record.state,
            progress: record.progress,
            result,
            error: record.error,
            error_kind: record.error_kind,
            attempts: record.attempts,
            retries: record.retries,
            created_at: record.created_at,
            started_at: record.started_at,
            settled_at: record.settled_at,
        })
    }
}

impl<D, R> Job<D, R> {
    pub fn is_settled(&self) -> bool {
        self.state.is_settled()
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.settled_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    /// See [`JobRecord::failure`].
    pub fn failure(&self) -> Option<TasklineError> {
        failure_of(self.id, self.state, self.error_kind, self.error.as_deref())
    }
}

fn failure_of(id: JobId, state: JobState, kind: Option<JobErrorKind>, message: Option<&str>) -> Option<TasklineError> {
    if state != JobState::Failed {
        return None;
    }
    match kind {
        Some(JobErrorKind::Orphaned) => Some(TasklineError::job_orphaned(id)),
        _ => Some(TasklineError::job_failed(id, message.unwrap_or("job failed").to_string())),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(retries: u32) -> JobRecord {
        JobRecord::new("test", json!({"n": 1}), retries, Utc::now())
    }

    #[test]
    fn test_job_id_parse() {
        let id = JobId::new();
        assert_eq!(id.to_string().parse::<JobId>().unwrap(), id);
        assert!("not-a-uuid".parse::<JobId>().is_err());
    }

    #[test]
    fn test_job_state_settled() {
        assert!(JobState::Completed.is_settled());
        assert!(JobState::Failed.is_settled());
        assert!(JobState::Cancelled.is_settled());
        assert!(!JobState::Pending.is_settled());
        assert!(!JobState::Running.is_settled());
        assert!(!JobState::Retrying.is_settled());
    }

    #[test]
    fn test_job_state_parse() {
        assert_eq!("running".parse::<JobState>().unwrap(), JobState::Running);
        assert_eq!("FAILED".parse::<JobState>().unwrap(), JobState::Failed);
        assert!("done".parse::<JobState>().is_err());
        assert_eq!(serde_json::to_value(JobState::Retrying).unwrap(), json!("RETRYING"));
    }

    #[test]
    fn test_backoff_fixed() {
        let backoff = BackoffStrategy::fixed(Duration::from_secs(10));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(10));
        assert_eq!(backoff.delay_for_attempt(5), Duration::from_secs(10));
    }

    #[test]
    fn test_backoff_exponential() {
        let backoff = BackoffStrategy::Exponential {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(100),
            multiplier: 2.0,
        };
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(backoff.delay_for_attempt(4), Duration::from_secs(8));
        assert_eq!(backoff.delay_for_attempt(20), Duration::from_secs(100));
        assert_eq!(backoff.delay_for_attempt(u32::MAX), Duration::from_secs(100));
    }

    #[test]
    fn test_backoff_linear() {
        let backoff = BackoffStrategy::Linear {
            initial: Duration::from_secs(5),
            increment: Duration::from_secs(3),
            max: Duration::from_secs(10),
        };
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(5));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(8));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_secs(10));
    }

    #[test]
    fn test_backoff_deserializes_humantime() {
        let backoff: BackoffStrategy =
            serde_json::from_value(json!({"type": "fixed", "delay": "250ms"})).unwrap();
        assert_eq!(backoff, BackoffStrategy::fixed(Duration::from_millis(250)));
    }

    #[test]
    fn test_happy_path() {
        let now = Utc::now();
        let mut job = record(0);
        job.start("w1", now).unwrap();
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.started_at, Some(now));

        let state = job.complete(json!({"value": 42}), now).unwrap();
        assert_eq!(state, JobState::Completed);
        assert_eq!(job.result, Some(json!({"value": 42})));
        assert!(job.settled_at.is_some());
        assert!(job.worker_id.is_none());
        assert_eq!(job.duration(), Some(chrono::Duration::zero()));
    }

    #[test]
    fn test_retries_exhaust_after_retries_plus_one_attempts() {
        let now = Utc::now();
        let mut job = record(2);
        let backoff = BackoffStrategy::none();
        let error = JobError::new("boom");

        for expected in [JobState::Retrying, JobState::Retrying, JobState::Failed] {
            job.start("w1", now).unwrap();
            assert_eq!(job.fail_attempt(&error, &backoff, now).unwrap(), expected);
        }
        assert_eq!(job.attempts, 3);
        assert_eq!(job.error.as_deref(), Some("boom"));
        assert_eq!(job.error_kind, Some(JobErrorKind::Handler));
    }

    #[test]
    fn test_started_at_set_once() {
        let first = Utc::now();
        let later = first + chrono::Duration::seconds(5);
        let mut job = record(1);
        job.start("w1", first).unwrap();
        job.fail_attempt(&JobError::new("x"), &BackoffStrategy::none(), first).unwrap();
        job.start("w1", later).unwrap();
        assert_eq!(job.started_at, Some(first));
    }

    #[test]
    fn test_retrying_respects_backoff() {
        let now = Utc::now();
        let mut job = record(1);
        job.start("w1", now).unwrap();
        job.fail_attempt(&JobError::new("x"), &BackoffStrategy::fixed(Duration::from_secs(30)), now)
            .unwrap();
        assert!(!job.is_claimable(now));
        assert!(job.is_claimable(now + chrono::Duration::seconds(30)));
    }

    #[test]
    fn test_out_of_range_backoff_leaves_record_running() {
        let now = Utc::now();
        let mut job = record(1);
        job.start("w1", now).unwrap();
        let before = job.clone();

        let huge = BackoffStrategy::fixed(Duration::from_secs(u64::MAX / 2));
        let err = job.fail_attempt(&JobError::new("x"), &huge, now).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidConfiguration);
        assert_eq!(job, before);
    }

    #[test]
    fn test_failure_codes() {
        let now = Utc::now();
        let mut failed = record(0);
        failed.start("w1", now).unwrap();
        failed.fail_attempt(&JobError::new("boom"), &BackoffStrategy::none(), now).unwrap();
        let err = failed.failure().unwrap();
        assert_eq!(err.code(), ErrorCode::JobFailed);
        assert_eq!(err.user_message(), "boom");

        let mut orphaned = record(0);
        orphaned.start("w1", now).unwrap();
        orphaned.recover_orphan(now).unwrap();
        assert_eq!(orphaned.failure().unwrap().code(), ErrorCode::JobOrphaned);

        assert!(record(0).failure().is_none());
    }

    #[test]
    fn test_settled_jobs_reject_mutation() {
        let now = Utc::now();
        let mut job = record(0);
        job.start("w1", now).unwrap();
        job.complete(json!(1), now).unwrap();
        let before = job.clone();

        let err = job.complete(json!(2), now).unwrap_err();
        assert_eq!(err.code(), ErrorCode::JobAlreadySettled);
        assert_eq!(job.cancel(now).unwrap_err().code(), ErrorCode::JobAlreadySettled);
        assert_eq!(job.start("w2", now).unwrap_err().code(), ErrorCode::JobAlreadySettled);
        assert_eq!(job, before);
    }

    #[test]
    fn test_cancel_pending_is_immediate() {
        let now = Utc::now();
        let mut job = record(0);
        assert_eq!(job.cancel(now).unwrap(), JobState::Cancelled);
        assert!(job.started_at.is_none());
        assert!(job.duration().is_none());
    }

    #[test]
    fn test_cancel_running_is_honored_on_return() {
        let now = Utc::now();
        let mut job = record(3);
        job.start("w1", now).unwrap();
        assert_eq!(job.cancel(now).unwrap(), JobState::Running);
        assert!(job.cancel_requested);
        assert_eq!(
            job.fail_attempt(&JobError::new("x"), &BackoffStrategy::none(), now).unwrap(),
            JobState::Cancelled
        );
    }

    #[test]
    fn test_illegal_transition() {
        let now = Utc::now();
        let mut job = record(0);
        let err = job.complete(json!(1), now).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidStateTransition);
        assert_eq!(job.state, JobState::Pending);
    }

    #[test]
    fn test_recover_orphan() {
        let now = Utc::now();
        let mut job = record(1);
        job.start("w1", now).unwrap();
        assert_eq!(job.recover_orphan(now).unwrap(), JobState::Pending);
        assert_eq!(job.attempts, 1);

        job.start("w2", now).unwrap();
        assert_eq!(job.recover_orphan(now).unwrap(), JobState::Failed);
        assert_eq!(job.error.as_deref(), Some(ORPHANED_ERROR_MESSAGE));
        assert_eq!(job.error_kind, Some(JobErrorKind::Orphaned));
    }

    #[test]
    fn test_admin_retry() {
        let now = Utc::now();
        let mut job = record(0);
        job.start("w1", now).unwrap();
        job.fail_attempt(&JobError::new("boom"), &BackoffStrategy::none(), now).unwrap();

        job.reset_for_retry().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.retries, 1);
        assert!(job.has_attempts_left());
        assert!(job.error.is_none());

        let mut pending = record(0);
        assert_eq!(
            pending.reset_for_retry().unwrap_err().code(),
            ErrorCode::InvalidStateTransition
        );
    }

    #[test]
    fn test_progress_clamped() {
        let now = Utc::now();
        let mut job = record(0);
        assert!(job.set_progress(10, now).is_err());
        job.start("w1", now).unwrap();
        job.set_progress(250, now).unwrap();
        assert_eq!(job.progress, 100);
    }

    #[test]
    fn test_typed_job_from_record() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Payload {
            n: u32,
        }

        let now = Utc::now();
        let mut rec = record(0);
        rec.start("w1", now).unwrap();
        rec.complete(json!("done"), now).unwrap();

        let job: Job<Payload, String> = Job::from_record(rec).unwrap();
        assert_eq!(job.data, Payload { n: 1 });
        assert_eq!(job.result.as_deref(), Some("done"));
        assert!(job.is_settled());

        let bad = JobRecord::new("test", json!("nope"), 0, now);
        assert!(Job::<Payload, String>::from_record(bad).is_err());
    }
}
