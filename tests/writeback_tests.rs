//! Write-back engine integration tests over the simulated library.

mod common;

use common::{harness, HarnessOptions};
use std::time::Duration;
use tapevault::catalog::{FileState, TapeStatus};

#[tokio::test]
async fn test_dirty_file_migrates_to_tape() {
    let h = harness(HarnessOptions::default());
    let tape = h.add_tape("VT0001", 1);

    h.write_file("docs/report.pdf", b"quarterly numbers");
    assert_eq!(
        h.catalog.get("docs/report.pdf").unwrap().state,
        FileState::Dirty
    );

    h.writeback.run_once().await.unwrap();

    let record = h.catalog.get("docs/report.pdf").unwrap();
    assert_eq!(record.state, FileState::Clean);
    let extent = record.extent.expect("migrated file has an extent");
    assert_eq!(extent.tape, tape);
    assert_eq!(extent.len, 17);
    assert!(record.checksum.is_some());

    // Bytes really landed on the tape, and its index knows the file.
    assert_eq!(
        h.library.tape_file(&tape, "docs/report.pdf").unwrap(),
        b"quarterly numbers"
    );
    let index = h.library.tape_index(&tape).unwrap();
    assert_eq!(index.live_entries().count(), 1);

    // Tape accounting reflects the write.
    let tape_record = h.catalog.get_tape(&tape).unwrap();
    assert_eq!(tape_record.used_bytes, 17);
}

#[tokio::test]
async fn test_dwell_delay_defers_migration() {
    let h = harness(HarnessOptions {
        dwell: Duration::from_secs(3600),
        ..Default::default()
    });
    h.add_tape("VT0001", 1);

    h.write_file("fresh.txt", b"just written");
    h.writeback.run_once().await.unwrap();

    // Still inside the dwell window: nothing moves.
    assert_eq!(h.catalog.get("fresh.txt").unwrap().state, FileState::Dirty);
    assert_eq!(h.library.load_count(), 0);
}

#[tokio::test]
async fn test_batch_shares_one_mount_cycle() {
    let h = harness(HarnessOptions::default());
    let tape = h.add_tape("VT0001", 1);

    h.write_file("a.bin", b"aaaa");
    h.write_file("b.bin", b"bbbb");
    h.write_file("c.bin", b"cccc");

    h.writeback.run_once().await.unwrap();

    for path in ["a.bin", "b.bin", "c.bin"] {
        assert_eq!(h.catalog.get(path).unwrap().state, FileState::Clean);
        assert!(h.library.tape_file(&tape, path).is_some());
    }
    // One batch, one load.
    assert_eq!(h.library.load_count(), 1);
}

#[tokio::test]
async fn test_media_failure_reverts_and_retargets() {
    let h = harness(HarnessOptions::default());
    // A has more free space, so it is selected first.
    let tape_a = h.add_tape_with_capacity("VT000A", 1, 20 * 1024 * 1024);
    let tape_b = h.add_tape("VT000B", 2);
    h.library.set_media_bad(&tape_a, true);

    h.write_file("payload.bin", b"important");
    h.writeback.run_once().await.unwrap();

    // Failed write: file is dirty again, the bad tape is flagged.
    let record = h.catalog.get("payload.bin").unwrap();
    assert_eq!(record.state, FileState::Dirty);
    assert!(record.extent.is_none());
    assert_eq!(
        h.catalog.get_tape(&tape_a).unwrap().status,
        TapeStatus::NeedsReclaim
    );

    // Next pass lands on the healthy tape.
    h.writeback.run_once().await.unwrap();
    let record = h.catalog.get("payload.bin").unwrap();
    assert_eq!(record.state, FileState::Clean);
    assert_eq!(record.extent.unwrap().tape, tape_b);
}

#[tokio::test]
async fn test_retry_ceiling_flags_unrecoverable() {
    let h = harness(HarnessOptions {
        migration_retry_limit: 1,
        ..Default::default()
    });
    let tape = h.add_tape("VT0001", 1);
    h.library.set_media_bad(&tape, true);

    h.write_file("doomed.bin", b"cannot land");
    h.writeback.run_once().await.unwrap();

    let record = h.catalog.get("doomed.bin").unwrap();
    assert_eq!(record.state, FileState::Unrecoverable);
    // The cache copy is still there for the operator.
    assert!(record.cache_blob.is_some());
}

#[tokio::test]
async fn test_rewrite_during_dwell_debounces() {
    let h = harness(HarnessOptions {
        dwell: Duration::from_secs(3600),
        ..Default::default()
    });
    h.add_tape("VT0001", 1);

    h.write_file("volatile.log", b"v1");
    h.writeback.run_once().await.unwrap();
    h.write_file("volatile.log", b"v1 and then some");
    h.writeback.run_once().await.unwrap();

    // Still one dirty record, nothing on tape, no mount cycles burned.
    assert_eq!(
        h.catalog.get("volatile.log").unwrap().state,
        FileState::Dirty
    );
    assert_eq!(h.library.load_count(), 0);
}

#[tokio::test]
async fn test_deletion_flushed_to_tape_index_on_next_write() {
    let h = harness(HarnessOptions::default());
    let tape = h.add_tape("VT0001", 1);

    h.write_file("old.bin", b"first generation");
    h.writeback.run_once().await.unwrap();

    h.namespace.unlink("old.bin").unwrap();
    let tape_record = h.catalog.get_tape(&tape).unwrap();
    assert_eq!(tape_record.deleted_bytes, 16);

    // The tape's own index still lists the file until the next write mount.
    assert_eq!(h.library.tape_index(&tape).unwrap().live_entries().count(), 1);

    h.write_file("new.bin", b"second");
    h.writeback.run_once().await.unwrap();

    let index = h.library.tape_index(&tape).unwrap();
    let live: Vec<_> = index.live_entries().map(|e| e.path.clone()).collect();
    assert_eq!(live, vec!["new.bin".to_string()]);
}
