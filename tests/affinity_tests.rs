use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Write};

use netqueue::bitset::IdSet;
use netqueue::error::QueueError;
use netqueue::scheduler::{AffinityRegistry, ClientRole, JobStatus, JobStatusTracker};

#[test]
fn test_job_then_client_share_affinity() {
    let registry = AffinityRegistry::new();

    let id = registry.resolve_affinity_token("chrX", Some(7), None, ClientRole::Get);
    let again = registry.resolve_affinity_token("chrX", None, Some(99), ClientRole::Get);
    assert_eq!(id, again);

    let jobs: Vec<u32> = registry.get_jobs_with_affinity(id).iter().collect();
    assert_eq!(jobs, vec![7]);

    let stats = registry.get_affinity_statistics(&JobStatusTracker::default());
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].token, "chrX");
    assert_eq!(stats[0].get_clients, 1);
    assert_eq!(stats[0].read_clients, 0);
}

#[test]
fn test_token_round_trip() {
    let registry = AffinityRegistry::new();
    let id = registry.resolve_affinity("chr1");
    assert_eq!(registry.resolve_affinity("chr1"), id);
    assert_eq!(registry.get_token_by_id(id).as_deref(), Some("chr1"));
    assert_eq!(registry.get_id_by_token("chr1"), Some(id));
    assert_eq!(registry.get_id_by_token("chr2"), None);
}

#[test]
fn test_statistics_use_tracker_state() {
    let registry = AffinityRegistry::new();
    let tracker = JobStatusTracker::default();
    tracker.add_pending_batch(1, 3);
    tracker.change_status(2, JobStatus::Running).unwrap();

    let id = registry.resolve_affinity("batch");
    for job in 1..=3 {
        registry.add_job_to_affinity(id, job);
    }
    registry.set_wait_client_for_affinities(5, &[id].into_iter().collect(), ClientRole::Read);

    let stats = &registry.get_affinity_statistics(&tracker)[0];
    assert_eq!(stats.jobs, 3);
    assert_eq!(stats.pending_jobs, 2);
    assert_eq!(stats.running_jobs, 1);
    assert_eq!(stats.waiting_read_clients, 1);
}

#[test]
fn test_collect_garbage_respects_new_references() {
    let registry = AffinityRegistry::new();
    let a = registry.resolve_affinity_token("a", Some(1), None, ClientRole::Get);
    let b = registry.resolve_affinity_token("b", Some(2), None, ClientRole::Get);
    registry.remove_job_from_affinity(a, 1);
    registry.remove_job_from_affinity(b, 2);
    assert_eq!(registry.removal_candidates().len(), 2);

    // b gets a client before the pass runs
    registry.add_client_to_affinity(10, b, ClientRole::Read);

    assert_eq!(registry.collect_garbage(10), 1);
    assert_eq!(registry.get_token_by_id(a), None);
    assert_eq!(registry.get_id_by_token("a"), None);
    assert_eq!(registry.get_token_by_id(b).as_deref(), Some("b"));

    // every surviving candidate is genuinely unreferenced
    assert_eq!(registry.check_remove_candidates(), 0);
}

#[test]
fn test_collect_garbage_is_bounded() {
    let registry = AffinityRegistry::new();
    for i in 0..5 {
        registry.resolve_affinity(&format!("t{}", i));
    }
    assert_eq!(registry.collect_garbage(2), 2);
    assert_eq!(registry.len(), 3);
    assert_eq!(registry.collect_garbage(10), 3);
    assert!(registry.is_empty());
}

#[test]
fn test_disconnect_clears_client_everywhere() {
    let registry = AffinityRegistry::new();
    let ids: IdSet = ["x", "y"]
        .iter()
        .map(|t| registry.resolve_affinity_token(t, None, Some(3), ClientRole::Get))
        .collect();
    registry.set_wait_client_for_affinities(3, &ids, ClientRole::Get);

    registry.remove_client(3);
    for id in &ids {
        assert!(registry.get_wait_clients(id, ClientRole::Get).is_empty());
    }
    assert_eq!(registry.removal_candidates(), ids);
}

#[test]
fn test_dump_and_reload_through_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("affinities.dump");

    let source = AffinityRegistry::new();
    let kept = source.resolve_affinity_token("chr1", Some(1), None, ClientRole::Get);
    let also = source.resolve_affinity_token("chr2", Some(2), None, ClientRole::Get);
    source.resolve_affinity_token("idle", None, Some(4), ClientRole::Get);
    {
        let mut writer = BufWriter::new(File::create(&path).unwrap());
        // only affinities with jobs are persisted
        assert_eq!(source.dump(&mut writer).unwrap(), 2);
        writer.flush().unwrap();
    }

    let restored = AffinityRegistry::new();
    let mut reader = BufReader::new(File::open(&path).unwrap());
    assert_eq!(restored.load_from_dump(&mut reader).unwrap(), 2);

    // replay job membership for chr1 only
    assert!(restored.add_job_to_affinity(kept, 1));
    assert_eq!(restored.finalize_affinity_dictionary_loading(), 1);
    assert_eq!(restored.get_id_by_token("chr1"), Some(kept));
    assert_eq!(restored.get_token_by_id(also), None);

    // new tokens never collide with loaded ids
    let fresh = restored.resolve_affinity("chr3");
    assert!(fresh > kept);
}

#[test]
fn test_load_rejects_corrupt_input() {
    let registry = AffinityRegistry::new();

    // header cut short
    let err = registry.load_from_dump(&mut Cursor::new(vec![1u8, 0, 0])).unwrap_err();
    assert!(matches!(err, QueueError::CorruptDump(_)));

    // token shorter than announced
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&5u32.to_le_bytes());
    bytes.extend_from_slice(&10u32.to_le_bytes());
    bytes.extend_from_slice(b"abc");
    let err = registry.load_from_dump(&mut Cursor::new(bytes)).unwrap_err();
    assert!(matches!(err, QueueError::CorruptDump(_)));

    // duplicate token
    let mut bytes = Vec::new();
    for id in [1u32, 2] {
        bytes.extend_from_slice(&id.to_le_bytes());
        bytes.extend_from_slice(&3u32.to_le_bytes());
        bytes.extend_from_slice(b"dup");
    }
    let err = registry.load_from_dump(&mut Cursor::new(bytes)).unwrap_err();
    assert!(matches!(err, QueueError::CorruptDump(_)));
    assert!(registry.is_empty());

    // empty input is a valid, empty dump
    assert_eq!(registry.load_from_dump(&mut Cursor::new(Vec::new())).unwrap(), 0);
}
