
use netqueue::error::QueueError;
use netqueue::scheduler::{JobStatus, JobStatusTracker};
use proptest::prelude::*;
use test_harness::assert_exclusive;

#[test]
fn test_job_lifecycle_end_to_end() {
    let tracker = JobStatusTracker::default();

    let admitted = tracker.change_status(42, JobStatus::Pending).unwrap();
    assert_eq!(admitted.prior, JobStatus::NotFound);

    let running = tracker.change_status(42, JobStatus::Running).unwrap();
    assert_eq!(running.prior, JobStatus::Pending);
    assert!(running.applied);

    let done = tracker.change_status(42, JobStatus::Done).unwrap();
    assert_eq!(done.prior, JobStatus::Running);
    assert_eq!(tracker.done_count(), 1);

    let err = tracker.change_status(42, JobStatus::Running).unwrap_err();
    assert!(matches!(
        err,
        QueueError::InvalidTransition {
            job_id: 42,
            from: JobStatus::Done,
            to: JobStatus::Running
        }
    ));
    assert!(!err.is_fatal());
    assert_eq!(tracker.get_status(42).unwrap(), JobStatus::Done);
    assert_eq!(tracker.done_count(), 1);
}

#[test]
fn test_read_path() {
    let tracker = JobStatusTracker::default();
    tracker.add_pending_batch(1, 2);
    for id in 1..=2 {
        tracker.change_status(id, JobStatus::Running).unwrap();
        tracker.change_status(id, JobStatus::Done).unwrap();
        tracker.change_status(id, JobStatus::Reading).unwrap();
    }

    assert!(tracker.change_status(1, JobStatus::Confirmed).unwrap().applied);
    assert!(tracker.change_status(2, JobStatus::ReadFailed).unwrap().applied);

    // Reading back to Done does not count as another completion
    tracker.set_status(2, JobStatus::Reading);
    let back = tracker.change_status(2, JobStatus::Done).unwrap();
    assert_eq!(back.prior, JobStatus::Reading);
    assert_eq!(tracker.done_count(), 2);
}

#[test]
fn test_noop_targets_are_idempotent() {
    let tracker = JobStatusTracker::default();
    tracker.add_pending_batch(1, 1);
    tracker.change_status(1, JobStatus::Canceled).unwrap();

    let first = tracker.change_status(1, JobStatus::Canceled).unwrap();
    let second = tracker.change_status(1, JobStatus::Canceled).unwrap();
    assert_eq!(first, second);
    assert!(!second.applied);
    assert_eq!(tracker.get_status(1).unwrap(), JobStatus::Canceled);

    // Canceling an unknown job is silently ignored
    let unknown = tracker.change_status(99, JobStatus::Canceled).unwrap();
    assert!(!unknown.applied);
    assert_eq!(tracker.get_status(99).unwrap(), JobStatus::NotFound);
}

#[test]
fn test_completion_report_quirk() {
    // A failure or read-failure report for a job in the wrong state is
    // indistinguishable from success except for `applied`.
    let tracker = JobStatusTracker::default();
    tracker.add_pending_batch(1, 1);

    let failed = tracker.change_status(1, JobStatus::Failed).unwrap();
    assert_eq!(failed.prior, JobStatus::Failed);
    assert!(!failed.applied);

    let read_failed = tracker.change_status(1, JobStatus::ReadFailed).unwrap();
    assert_eq!(read_failed.prior, JobStatus::ReadFailed);
    assert!(!read_failed.applied);

    assert_eq!(tracker.get_status(1).unwrap(), JobStatus::Pending);
}

#[test]
fn test_set_status_round_trip() {
    let tracker = JobStatusTracker::default();
    for status in JobStatus::TRACKED.into_iter().chain([JobStatus::NotFound]) {
        tracker.set_status(7, status);
        assert_eq!(tracker.get_status(7).unwrap(), status);
    }
    assert!(tracker.get_alive_jobs().is_empty());
}

#[test]
fn test_snapshot_and_queries() {
    let tracker = JobStatusTracker::default();
    tracker.add_pending_batch(10, 19);
    tracker.change_status(12, JobStatus::Running).unwrap();
    tracker.change_status(15, JobStatus::Running).unwrap();
    tracker.change_status(15, JobStatus::Done).unwrap();

    let snapshot = tracker.status_snapshot();
    assert_eq!(snapshot[&JobStatus::Pending], 8);
    assert_eq!(snapshot[&JobStatus::Running], 1);
    assert_eq!(snapshot[&JobStatus::Done], 1);

    let candidates = [12, 15, 17].into_iter().collect();
    assert_eq!(tracker.get_pending_job_from_set(&candidates), Some(17));
    assert_eq!(tracker.pending_intersect(&candidates).len(), 1);
    assert_eq!(tracker.min_job_id(), Some(10));
    assert_eq!(tracker.max_job_id(), Some(19));

    tracker.compact();
    assert_eq!(tracker.get_alive_jobs().len(), 10);
}

#[derive(Debug, Clone)]
enum Op {
    Change(u32, JobStatus),
    Set(u32, JobStatus),
    Batch(u32, u32),
}

fn any_status() -> impl Strategy<Value = JobStatus> {
    prop::sample::select(
        JobStatus::TRACKED
            .into_iter()
            .chain([JobStatus::NotFound])
            .collect::<Vec<_>>(),
    )
}

fn any_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u32..40, any_status()).prop_map(|(id, s)| Op::Change(id, s)),
        (1u32..40, any_status()).prop_map(|(id, s)| Op::Set(id, s)),
        (1u32..40, 0u32..5).prop_map(|(from, len)| Op::Batch(from, from + len)),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_status_sets_stay_exclusive(ops in prop::collection::vec(any_op(), 1..60)) {
        let tracker = JobStatusTracker::new(8);
        for op in ops {
            let before = match &op {
                Op::Change(id, _) => Some((*id, tracker.get_status(*id).unwrap())),
                _ => None,
            };
            match op {
                Op::Change(id, target) => {
                    if let Err(e) = tracker.change_status(id, target) {
                        prop_assert!(matches!(e, QueueError::InvalidTransition { .. }), "expected InvalidTransition, got {:?}", e);
                        // rejected changes leave the job where it was
                        let (id, prior) = before.unwrap();
                        prop_assert_eq!(tracker.get_status(id).unwrap(), prior);
                    }
                }
                Op::Set(id, status) => tracker.set_status(id, status),
                Op::Batch(from, to) => tracker.add_pending_batch(from, to),
            }
            assert_exclusive(&tracker, 1..45);
        }
    }
}
