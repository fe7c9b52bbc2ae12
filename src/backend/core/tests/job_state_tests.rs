//! Property tests for the job state machine.
//!
//! Random event sequences are applied to a fresh record. Every accepted event
//! must follow an edge of the state machine, and every rejected event must
//! leave the record untouched.

use chrono::{Duration as ChronoDuration, Utc};
use proptest::prelude::*;
use std::time::Duration;
use taskline_core::jobs::{BackoffStrategy, JobError, JobErrorKind, JobRecord, JobState, ORPHANED_ERROR_MESSAGE};

#[derive(Debug, Clone)]
enum Event {
    Claim,
    Complete,
    Fail,
    Cancel,
    Recover,
    AdminRetry,
    Heartbeat,
    Progress(u8),
}

fn event() -> impl Strategy<Value = Event> {
    prop_oneof![
        3 => Just(Event::Claim),
        2 => Just(Event::Complete),
        3 => Just(Event::Fail),
        1 => Just(Event::Cancel),
        1 => Just(Event::Recover),
        1 => Just(Event::AdminRetry),
        1 => Just(Event::Heartbeat),
        1 => any::<u8>().prop_map(Event::Progress),
    ]
}

fn apply(record: &mut JobRecord, event: &Event, step: i64) -> bool {
    let now = Utc::now() + ChronoDuration::seconds(step);
    let backoff = BackoffStrategy::fixed(Duration::ZERO);
    match event {
        Event::Claim => record.start("worker-a", now).is_ok(),
        Event::Complete => record.complete(serde_json::json!({"ok": true}), now).is_ok(),
        Event::Fail => record.fail_attempt(&JobError::new("boom"), &backoff, now).is_ok(),
        Event::Cancel => record.cancel(now).is_ok(),
        Event::Recover => record.recover_orphan(now).is_ok(),
        Event::AdminRetry => record.reset_for_retry().is_ok(),
        Event::Heartbeat => record.heartbeat(now).is_ok(),
        Event::Progress(p) => record.set_progress(*p, now).is_ok(),
    }
}

fn check_invariants(record: &JobRecord) {
    assert!(
        record.attempts <= record.retries + 1,
        "attempts {} exceed retries {} + 1",
        record.attempts,
        record.retries
    );
    assert!(record.progress <= 100);

    match record.state {
        JobState::Running => {
            assert!(record.worker_id.is_some());
            assert!(record.heartbeat_at.is_some());
            assert!(record.started_at.is_some());
        }
        JobState::Completed => {
            assert_eq!(record.progress, 100);
            assert!(record.result.is_some());
        }
        JobState::Failed => {
            assert!(record.error.is_some());
            match record.error_kind {
                Some(JobErrorKind::Handler) => assert_eq!(record.attempts, record.retries + 1),
                Some(JobErrorKind::Orphaned) => {
                    assert_eq!(record.error.as_deref(), Some(ORPHANED_ERROR_MESSAGE))
                }
                None => panic!("failed job without an error kind"),
            }
        }
        JobState::Retrying => assert!(record.retry_at.is_some()),
        JobState::Pending | JobState::Cancelled => {}
    }

    if record.is_settled() {
        assert!(record.settled_at.is_some());
        assert!(record.worker_id.is_none());
    } else {
        assert!(record.settled_at.is_none());
    }
}

proptest! {
    #[test]
    fn prop_events_follow_state_machine(
        retries in 0u32..4,
        events in proptest::collection::vec(event(), 0..40),
    ) {
        let mut record = JobRecord::new("q", serde_json::json!(null), retries, Utc::now());
        check_invariants(&record);

        for (step, event) in events.iter().enumerate() {
            let before = record.clone();
            let accepted = apply(&mut record, event, step as i64);

            if accepted {
                prop_assert!(
                    before.state == record.state || before.state.can_transition_to(record.state),
                    "{:?} moved {:?} -> {:?}",
                    event,
                    before.state,
                    record.state
                );
                prop_assert!(record.attempts >= before.attempts);
            } else {
                prop_assert_eq!(&before, &record);
            }
            check_invariants(&record);
        }
    }

    #[test]
    fn prop_settled_jobs_only_accept_admin_retry(
        retries in 0u32..3,
        events in proptest::collection::vec(event(), 1..20),
    ) {
        let mut record = JobRecord::new("q", serde_json::json!(null), retries, Utc::now());
        record.cancel(Utc::now()).unwrap();

        for (step, event) in events.iter().enumerate() {
            let before = record.clone();
            prop_assert!(!apply(&mut record, event, step as i64));
            prop_assert_eq!(&before, &record);
        }
    }

    #[test]
    fn prop_failing_handler_runs_retries_plus_one_times(retries in 0u32..6) {
        let mut record = JobRecord::new("q", serde_json::json!(null), retries, Utc::now());
        let backoff = BackoffStrategy::fixed(Duration::ZERO);
        let mut runs = 0;

        while !record.is_settled() {
            record.start("worker-a", Utc::now()).unwrap();
            runs += 1;
            record.fail_attempt(&JobError::new("boom"), &backoff, Utc::now()).unwrap();
        }

        prop_assert_eq!(runs, retries + 1);
        prop_assert_eq!(record.state, JobState::Failed);
        prop_assert_eq!(record.error.as_deref(), Some("boom"));
    }

    #[test]
    fn prop_exponential_backoff_is_monotonic_and_capped(attempt in 1u32..64) {
        let backoff = BackoffStrategy::default();
        let max = Duration::from_secs(300);
        let here = backoff.delay_for_attempt(attempt);
        let next = backoff.delay_for_attempt(attempt + 1);
        prop_assert!(here <= next);
        prop_assert!(next <= max);
    }
}

#[test]
fn test_orphan_with_attempts_left_is_requeued_without_counting() {
    let mut record = JobRecord::new("q", serde_json::json!(null), 1, Utc::now());
    record.start("worker-a", Utc::now()).unwrap();

    assert_eq!(record.recover_orphan(Utc::now()).unwrap(), JobState::Pending);
    assert_eq!(record.attempts, 1);
    assert!(record.worker_id.is_none());

    record.start("worker-b", Utc::now()).unwrap();
    assert_eq!(record.attempts, 2);
    assert_eq!(record.recover_orphan(Utc::now()).unwrap(), JobState::Failed);
    assert_eq!(record.error_kind, Some(JobErrorKind::Orphaned));
}

#[test]
fn test_cancel_requested_while_running_wins_over_outcome() {
    let mut record = JobRecord::new("q", serde_json::json!(null), 0, Utc::now());
    record.start("worker-a", Utc::now()).unwrap();
    assert_eq!(record.cancel(Utc::now()).unwrap(), JobState::Running);
    assert!(record.cancel_requested);

    assert_eq!(
        record.complete(serde_json::json!(1), Utc::now()).unwrap(),
        JobState::Cancelled
    );
    assert!(record.result.is_none());
}
