//! Shared harness for integration tests: a full engine stack over the
//! in-memory simulated library.

use std::sync::Arc;
use std::time::Duration;
use tapevault::cache::CacheStore;
use tapevault::catalog::{Catalog, TapeId, TapeRecord, TapeStatus};
use tapevault::defrag::DefragPlanner;
use tapevault::device::SimLibrary;
use tapevault::namespace::Namespace;
use tapevault::scheduler::DriveScheduler;
use tapevault::writeback::WriteBackEngine;
use tempfile::TempDir;

pub const TAPE_CAPACITY: u64 = 10 * 1024 * 1024;

pub struct Harness {
    pub dir: TempDir,
    pub library: Arc<SimLibrary>,
    pub catalog: Arc<Catalog>,
    pub cache: Arc<CacheStore>,
    pub scheduler: Arc<DriveScheduler>,
    pub namespace: Arc<Namespace>,
    pub writeback: Arc<WriteBackEngine>,
    pub defrag: Arc<DefragPlanner>,
}

pub struct HarnessOptions {
    pub cache_capacity: u64,
    pub dwell: Duration,
    pub migration_retry_limit: u32,
    pub defrag_threshold_percent: u8,
    pub stage_timeout: Duration,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        HarnessOptions {
            cache_capacity: 1024 * 1024,
            // Tests drive passes explicitly; no dwell by default.
            dwell: Duration::ZERO,
            migration_retry_limit: 3,
            defrag_threshold_percent: 20,
            stage_timeout: Duration::from_secs(30),
        }
    }
}

pub fn harness(options: HarnessOptions) -> Harness {
    let dir = TempDir::new().unwrap();
    let library = Arc::new(SimLibrary::new());
    let catalog = Arc::new(Catalog::new());
    let cache = Arc::new(CacheStore::new(&dir.path().join("cache"), options.cache_capacity).unwrap());
    let scheduler = Arc::new(DriveScheduler::new(
        library.clone(),
        2,
        Duration::from_millis(1),
    ));
    let namespace = Arc::new(Namespace::new(
        catalog.clone(),
        cache.clone(),
        scheduler.clone(),
        library.clone(),
        dir.path().to_path_buf(),
        options.stage_timeout,
    ));
    let writeback = Arc::new(WriteBackEngine::new(
        catalog.clone(),
        cache.clone(),
        scheduler.clone(),
        library.clone(),
        dir.path().to_path_buf(),
        options.dwell,
        options.migration_retry_limit,
    ));
    let defrag = Arc::new(DefragPlanner::new(
        catalog.clone(),
        scheduler.clone(),
        library.clone(),
        dir.path().to_path_buf(),
        options.defrag_threshold_percent,
    ));

    Harness {
        dir,
        library,
        catalog,
        cache,
        scheduler,
        namespace,
        writeback,
        defrag,
    }
}

impl Harness {
    /// Register a formatted, empty tape with both the simulator and the
    /// catalog.
    pub fn add_tape(&self, tag: &str, slot: u32) -> TapeId {
        self.add_tape_with_capacity(tag, slot, TAPE_CAPACITY)
    }

    pub fn add_tape_with_capacity(&self, tag: &str, slot: u32, capacity: u64) -> TapeId {
        let tape = TapeId::new(tag);
        self.library.add_tape(&tape, slot, capacity, true);
        let mut record = TapeRecord::new(tape.clone(), Some(slot), capacity);
        record.status = TapeStatus::Unmounted;
        self.catalog.upsert_tape(record);
        tape
    }

    /// Write a file through the namespace and commit it.
    pub fn write_file(&self, path: &str, content: &[u8]) {
        use std::io::Write;
        let mut handle = self.namespace.open_for_write(path).unwrap();
        handle.write_all(content).unwrap();
        handle.finish().unwrap();
    }

    /// Read a file through the namespace to completion.
    pub async fn read_file(&self, path: &str) -> Vec<u8> {
        use std::io::Read;
        let mut handle = self.namespace.open_for_read(path).await.unwrap();
        let mut buf = Vec::new();
        handle.read_to_end(&mut buf).unwrap();
        buf
    }
}
