//! Drive scheduler integration tests: exclusivity under concurrent load
//! and foreground priority over background work.

use rstest::rstest;
use std::sync::Arc;
use std::time::Duration;
use tapevault::catalog::TapeId;
use tapevault::device::SimLibrary;
use tapevault::scheduler::{DriveScheduler, Priority};

fn scheduler_over(tapes: &[&str]) -> (Arc<SimLibrary>, Arc<DriveScheduler>) {
    let library = Arc::new(SimLibrary::new());
    for (i, tag) in tapes.iter().enumerate() {
        library.add_tape(&TapeId::new(*tag), i as u32 + 1, 1_000_000, true);
    }
    let scheduler = Arc::new(DriveScheduler::new(
        library.clone(),
        2,
        Duration::from_millis(1),
    ));
    (library, scheduler)
}

/// The simulator rejects a load while a tape is already in the drive, so
/// any exclusivity violation surfaces as a drive fault.
#[rstest]
#[case(&["VT0001"])]
#[case(&["VT0001", "VT0002", "VT0003"])]
#[tokio::test]
async fn test_concurrent_sessions_never_overlap_tapes(#[case] tapes: &[&str]) {
    let (library, scheduler) = scheduler_over(tapes);
    let tapes: Vec<TapeId> = tapes.iter().map(|t| TapeId::new(*t)).collect();

    let mut workers = Vec::new();
    for i in 0..24 {
        let scheduler = Arc::clone(&scheduler);
        let tape = tapes[i % tapes.len()].clone();
        let priority = if i % 4 == 0 {
            Priority::Foreground
        } else {
            Priority::Background
        };
        workers.push(tokio::spawn(async move {
            let session = scheduler.request_mount(&tape, priority).await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
            assert_eq!(session.tape(), &tape);
            session.release();
        }));
    }
    for worker in workers {
        worker.await.unwrap();
    }

    assert!(!scheduler.is_faulted());
    // Every unload was balanced by a load; exactly one tape can remain.
    assert_eq!(library.load_count(), library.unload_count() + 1);
    assert!(library.loaded_tape().is_some());
}

#[tokio::test]
async fn test_same_tape_requests_coalesce_onto_one_mount() {
    let (library, scheduler) = scheduler_over(&["VT0001"]);
    let tape = TapeId::new("VT0001");

    let a = scheduler.request_mount(&tape, Priority::Background).await.unwrap();
    let b = scheduler.request_mount(&tape, Priority::Foreground).await.unwrap();
    let c = scheduler.request_mount(&tape, Priority::Background).await.unwrap();

    assert_eq!(library.load_count(), 1);
    assert_eq!(scheduler.session_count(), 3);

    a.release();
    b.release();
    c.release();

    // Lazy unmount: the tape stays in the drive until someone else needs it.
    assert_eq!(library.unload_count(), 0);
    assert_eq!(library.loaded_tape(), Some(tape));
}

#[tokio::test]
async fn test_foreground_request_served_before_earlier_background() {
    let (_library, scheduler) = scheduler_over(&["VT0001", "VT0002", "VT0003"]);
    let mounted = scheduler
        .request_mount(&TapeId::new("VT0001"), Priority::Background)
        .await
        .unwrap();

    let background = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move {
            let session = scheduler
                .request_mount(&TapeId::new("VT0002"), Priority::Background)
                .await
                .unwrap();
            let at = std::time::Instant::now();
            session.release();
            at
        })
    };
    // Queued strictly after the background request.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let foreground = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move {
            let session = scheduler
                .request_mount(&TapeId::new("VT0003"), Priority::Foreground)
                .await
                .unwrap();
            let at = std::time::Instant::now();
            session.release();
            at
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    mounted.release();

    let background_at = background.await.unwrap();
    let foreground_at = foreground.await.unwrap();
    assert!(foreground_at < background_at);
}
