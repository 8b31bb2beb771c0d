//! Defrag planner integration tests: threshold triggering, relocation,
//! resumable jobs and source reformatting.

mod common;

use chrono::Utc;
use common::{harness, Harness, HarnessOptions};
use tapevault::catalog::{FileState, TapeId, TapeStatus};
use tapevault::defrag::{load_job, save_job, DefragJob, DefragPlanner};
use tapevault::error::TapeVaultError;

/// Five 100-byte files on a 900-byte source tape, two of them unlinked,
/// which puts the deleted ratio at 200/900, about 22% of capacity.
async fn fragmented_source(h: &Harness) -> TapeId {
    let source = h.add_tape_with_capacity("VTSRC1", 1, 900);
    for i in 0..5 {
        h.write_file(&format!("data/f{}.bin", i), &[i as u8; 100]);
    }
    h.writeback.run_once().await.unwrap();
    h.namespace.unlink("data/f0.bin").unwrap();
    h.namespace.unlink("data/f1.bin").unwrap();
    source
}

#[tokio::test]
async fn test_under_threshold_is_left_alone() {
    let h = harness(HarnessOptions {
        defrag_threshold_percent: 50,
        ..Default::default()
    });
    fragmented_source(&h).await;
    h.add_tape("VTDST1", 2);

    let loads = h.library.load_count();
    h.defrag.run_once().await.unwrap();

    assert!(load_job(h.dir.path()).unwrap().is_none());
    assert_eq!(h.library.load_count(), loads);
}

#[tokio::test]
async fn test_reclaim_relocates_live_files_and_reformats_source() {
    let h = harness(HarnessOptions::default());
    let source = fragmented_source(&h).await;
    let dest = h.add_tape("VTDST1", 2);

    h.defrag.run_once().await.unwrap();

    // Survivors moved, in full.
    for i in 2..5 {
        let path = format!("data/f{}.bin", i);
        let record = h.catalog.get(&path).unwrap();
        assert_eq!(record.state, FileState::Clean);
        assert_eq!(record.extent.as_ref().unwrap().tape, dest);
        assert_eq!(
            h.library.tape_file(&dest, &path).unwrap(),
            vec![i as u8; 100]
        );
    }
    assert_eq!(h.library.tape_index(&dest).unwrap().live_entries().count(), 3);

    // Source is wiped and back in service.
    let source_record = h.catalog.get_tape(&source).unwrap();
    assert_eq!(source_record.status, TapeStatus::Mounted);
    assert_eq!(source_record.used_bytes, 0);
    assert_eq!(source_record.deleted_bytes, 0);
    assert!(h.library.tape_file(&source, "data/f2.bin").is_none());

    // Tombstones that pointed at the reformatted tape lost their extents.
    assert!(h.catalog.get("data/f0.bin").unwrap().extent.is_none());

    // The job is done and gone.
    assert!(load_job(h.dir.path()).unwrap().is_none());

    // Relocated content is still reachable through the namespace.
    h.cache.remove_blob("data/f3.bin").unwrap();
    h.catalog
        .with_record_mut("data/f3.bin", |r| r.cache_blob = None)
        .unwrap();
    assert_eq!(h.read_file("data/f3.bin").await, vec![3u8; 100]);
}

#[tokio::test]
async fn test_media_flagged_tape_reclaimed_regardless_of_ratio() {
    let h = harness(HarnessOptions::default());
    let source = h.add_tape("VTSRC1", 1);
    h.write_file("only.bin", b"healthy data");
    h.writeback.run_once().await.unwrap();

    // Flagged by a media failure elsewhere; nothing was ever deleted.
    h.catalog
        .with_tape_mut(&source, |t| t.status = TapeStatus::NeedsReclaim)
        .unwrap();
    let dest = h.add_tape("VTDST1", 2);

    h.defrag.run_once().await.unwrap();

    let record = h.catalog.get("only.bin").unwrap();
    assert_eq!(record.extent.unwrap().tape, dest);
    assert_eq!(
        h.catalog.get_tape(&source).unwrap().status,
        TapeStatus::Mounted
    );
}

#[tokio::test]
async fn test_interrupted_job_resumes_from_persisted_cursor() {
    let h = harness(HarnessOptions::default());
    let source = fragmented_source(&h).await;
    let dest = h.add_tape("VTDST1", 2);

    // A planned job that crashed before relocating anything: the planner
    // had already fenced the source and persisted the file list.
    h.catalog
        .with_tape_mut(&source, |t| t.status = TapeStatus::NeedsReclaim)
        .unwrap();
    let job = DefragJob {
        source: source.clone(),
        dest: dest.clone(),
        files: vec![
            "data/f2.bin".to_string(),
            "data/f3.bin".to_string(),
            "data/f4.bin".to_string(),
        ],
        cursor: 0,
        created: Utc::now(),
    };
    save_job(h.dir.path(), &job).unwrap();

    h.defrag.run_once().await.unwrap();

    for path in ["data/f2.bin", "data/f3.bin", "data/f4.bin"] {
        assert_eq!(h.catalog.get(path).unwrap().extent.as_ref().unwrap().tape, dest);
    }
    assert_eq!(
        h.catalog.get_tape(&source).unwrap().status,
        TapeStatus::Mounted
    );
    assert!(load_job(h.dir.path()).unwrap().is_none());
}

#[tokio::test]
async fn test_resume_mid_list_ignores_stale_spool_data() {
    let h = harness(HarnessOptions::default());
    let source = fragmented_source(&h).await;
    let dest = h.add_tape("VTDST1", 2);

    // The crashed run had already relocated f2 and advanced the cursor
    // past it.
    h.catalog
        .with_tape_mut(&source, |t| t.status = TapeStatus::NeedsReclaim)
        .unwrap();
    let extent = h
        .library
        .seed_file(&dest, "data/f2.bin", &[2u8; 100], Utc::now());
    h.catalog
        .with_tape_mut(&dest, |t| t.used_bytes += 100)
        .unwrap();
    h.catalog.relocate("data/f2.bin", extent).unwrap();

    let job = DefragJob {
        source: source.clone(),
        dest: dest.clone(),
        files: vec![
            "data/f2.bin".to_string(),
            "data/f3.bin".to_string(),
            "data/f4.bin".to_string(),
        ],
        cursor: 1,
        created: Utc::now(),
    };
    save_job(h.dir.path(), &job).unwrap();

    // It also left a truncated spool copy of f4 behind.
    let spool = h.dir.path().join("defrag_spool");
    std::fs::create_dir_all(&spool).unwrap();
    std::fs::write(spool.join("2"), b"stale partial copy").unwrap();

    h.defrag.run_once().await.unwrap();

    // The resumed pass re-spools from tape; the stale copy never lands.
    for i in 2..5 {
        let path = format!("data/f{}.bin", i);
        assert_eq!(
            h.catalog.get(&path).unwrap().extent.as_ref().unwrap().tape,
            dest
        );
        assert_eq!(
            h.library.tape_file(&dest, &path).unwrap(),
            vec![i as u8; 100]
        );
    }
    // f2 was not copied a second time.
    assert_eq!(h.library.tape_index(&dest).unwrap().live_entries().count(), 3);

    let source_record = h.catalog.get_tape(&source).unwrap();
    assert_eq!(source_record.status, TapeStatus::Mounted);
    assert_eq!(source_record.used_bytes, 0);
    assert!(load_job(h.dir.path()).unwrap().is_none());
}

#[tokio::test]
async fn test_verification_failure_names_destination_tape() {
    let h = harness(HarnessOptions::default());
    fragmented_source(&h).await;
    let dest = h.add_tape("VTDST1", 2);

    // Every read off the drive delivers flipped bytes, so no stored copy
    // ever verifies.
    h.library.inject_fetch_corruption(1_000);

    let err = h.defrag.run_once().await.unwrap_err();
    match err {
        TapeVaultError::MediaError { tape, .. } => assert_eq!(tape, dest.to_string()),
        other => panic!("expected media error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_bounded_spool_batches_alternate_mounts() {
    let h = harness(HarnessOptions::default());
    let planner = DefragPlanner::new(
        h.catalog.clone(),
        h.scheduler.clone(),
        h.library.clone(),
        h.dir.path().to_path_buf(),
        20,
    )
    .with_spool_batch_bytes(150);

    let source = fragmented_source(&h).await;
    let dest = h.add_tape("VTDST1", 2);

    // Three 100-byte survivors against a 150-byte batch limit: two spool
    // passes, so the drive alternates source and destination.
    let loads_before = h.library.load_count();
    planner.run_once().await.unwrap();
    assert_eq!(h.library.load_count(), loads_before + 4);

    for i in 2..5 {
        let path = format!("data/f{}.bin", i);
        assert_eq!(
            h.catalog.get(&path).unwrap().extent.as_ref().unwrap().tape,
            dest
        );
        assert_eq!(
            h.library.tape_file(&dest, &path).unwrap(),
            vec![i as u8; 100]
        );
    }
    assert_eq!(h.library.tape_index(&dest).unwrap().live_entries().count(), 3);
    assert_eq!(
        h.catalog.get_tape(&source).unwrap().status,
        TapeStatus::Mounted
    );
    assert!(load_job(h.dir.path()).unwrap().is_none());
}

#[tokio::test]
async fn test_file_unlinked_mid_job_is_skipped() {
    let h = harness(HarnessOptions::default());
    let source = fragmented_source(&h).await;
    let dest = h.add_tape("VTDST1", 2);

    // Plan persisted, then a user unlinks one of the listed files before
    // the job runs.
    h.catalog
        .with_tape_mut(&source, |t| t.status = TapeStatus::NeedsReclaim)
        .unwrap();
    let job = DefragJob {
        source: source.clone(),
        dest: dest.clone(),
        files: vec![
            "data/f2.bin".to_string(),
            "data/f3.bin".to_string(),
            "data/f4.bin".to_string(),
        ],
        cursor: 0,
        created: Utc::now(),
    };
    save_job(h.dir.path(), &job).unwrap();
    h.namespace.unlink("data/f3.bin").unwrap();

    h.defrag.run_once().await.unwrap();

    assert_eq!(
        h.catalog.get("data/f2.bin").unwrap().extent.as_ref().unwrap().tape,
        dest
    );
    assert_eq!(
        h.catalog.get("data/f4.bin").unwrap().extent.as_ref().unwrap().tape,
        dest
    );
    assert_eq!(h.catalog.get("data/f3.bin").unwrap().state, FileState::Tombstoned);
    assert_eq!(h.library.tape_index(&dest).unwrap().live_entries().count(), 2);
}
