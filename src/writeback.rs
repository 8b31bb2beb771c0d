use crate::cache::{checksum_file, CacheStore};
use crate::catalog::{Catalog, FileState, TapeId, TapeRecord};
use crate::device::{DriveDevice, IndexEntry};
use crate::error::{Result, TapeVaultError};
use crate::scheduler::{DriveScheduler, Priority};
use crate::tapeops;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// One pending migration. Created when a dirty record's dwell delay
/// elapses, destroyed on success or when the retry ceiling flags the
/// record unrecoverable.
#[derive(Debug, Clone)]
pub struct WriteBackTask {
    pub path: String,
    pub eligible_since: chrono::DateTime<Utc>,
    pub retries: u32,
    /// Tapes that failed a write for this task; the next attempt picks a
    /// different destination.
    pub exclude: HashSet<TapeId>,
}

/// Promotes dirty cached files to tape after the dwell delay, batched by
/// destination tape so a mount cycle serves many files.
pub struct WriteBackEngine {
    catalog: Arc<Catalog>,
    cache: Arc<CacheStore>,
    scheduler: Arc<DriveScheduler>,
    drive: Arc<dyn DriveDevice>,
    state_dir: PathBuf,
    dwell: Duration,
    retry_limit: u32,
    tasks: Mutex<HashMap<String, WriteBackTask>>,
}

impl WriteBackEngine {
    pub fn new(
        catalog: Arc<Catalog>,
        cache: Arc<CacheStore>,
        scheduler: Arc<DriveScheduler>,
        drive: Arc<dyn DriveDevice>,
        state_dir: PathBuf,
        dwell: Duration,
        retry_limit: u32,
    ) -> Self {
        WriteBackEngine {
            catalog,
            cache,
            scheduler,
            drive,
            state_dir,
            dwell,
            retry_limit,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Background loop: sweep for eligibility and flush batches until
    /// shutdown is signalled.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>, tick: Duration) {
        tracing::debug!("Write-back engine started, dwell={:?}", self.dwell);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(tick) => {
                    if let Err(e) = self.run_once().await {
                        tracing::warn!("Write-back pass failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    tracing::debug!("Write-back engine stopping");
                    break;
                }
            }
        }
    }

    /// One full pass: promote dwelled dirty records to eligible, then
    /// migrate every eligible batch. Exposed separately so tests can drive
    /// the engine deterministically.
    pub async fn run_once(&self) -> Result<()> {
        self.sweep_eligibility();

        loop {
            let Some((dest, batch)) = self.next_batch() else {
                break;
            };
            self.migrate_batch(&dest, batch).await?;
        }

        Ok(())
    }

    /// Dirty records whose dwell delay elapsed without modification become
    /// eligible. A record rewritten during the window keeps its fresh mtime
    /// and simply stays dirty, so a busy file migrates once it goes quiet.
    fn sweep_eligibility(&self) {
        let now = Utc::now();
        let dwell = chrono::Duration::from_std(self.dwell).unwrap_or(chrono::Duration::zero());

        for record in self.catalog.query_by_state(FileState::Dirty) {
            if now - record.mtime < dwell {
                continue;
            }
            match self
                .catalog
                .transition(&record.path, FileState::Dirty, FileState::Eligible)
            {
                Ok(()) => {
                    tracing::debug!("{} became migration-eligible", record.path);
                    let mut tasks = self.tasks.lock();
                    tasks.entry(record.path.clone()).or_insert(WriteBackTask {
                        path: record.path.clone(),
                        eligible_since: now,
                        retries: 0,
                        exclude: HashSet::new(),
                    });
                }
                // Lost a race with a writer or an unlink; the new state wins.
                Err(TapeVaultError::StateConflict { .. }) => {}
                Err(e) => tracing::warn!("Eligibility sweep on {}: {}", record.path, e),
            }
        }

        // Rebuild tasks for eligible records we have no task for (restart).
        let mut tasks = self.tasks.lock();
        for record in self.catalog.query_by_state(FileState::Eligible) {
            tasks.entry(record.path.clone()).or_insert(WriteBackTask {
                path: record.path.clone(),
                eligible_since: now,
                retries: 0,
                exclude: HashSet::new(),
            });
        }
    }

    /// Group eligible files by destination and return one batch, or None
    /// when nothing can be placed.
    fn next_batch(&self) -> Option<(TapeId, Vec<WriteBackTask>)> {
        let eligible = self.catalog.query_by_state(FileState::Eligible);
        if eligible.is_empty() {
            return None;
        }

        let tasks = self.tasks.lock();
        let mut by_dest: HashMap<TapeId, Vec<WriteBackTask>> = HashMap::new();

        for record in &eligible {
            let Some(task) = tasks.get(&record.path) else {
                continue;
            };
            match select_destination(&self.catalog.tapes(), record.size, &task.exclude) {
                Some(dest) => by_dest.entry(dest).or_default().push(task.clone()),
                None => {
                    tracing::warn!(
                        "No destination tape with room for {} ({} bytes)",
                        record.path,
                        record.size
                    );
                }
            }
        }

        // Largest batch first: most files per mount cycle.
        by_dest
            .into_iter()
            .max_by_key(|(_, batch)| batch.len())
    }

    /// Mount the destination once and migrate every file in the batch.
    async fn migrate_batch(&self, dest: &TapeId, batch: Vec<WriteBackTask>) -> Result<()> {
        tracing::info!("Migrating {} file(s) to tape {}", batch.len(), dest);

        let session = self.scheduler.request_mount(dest, Priority::Background).await?;
        tapeops::note_mounted(&self.catalog, dest);

        let mut index = tapeops::prepare_for_write(&self.catalog, &self.drive, dest).await?;
        let mut wrote_any = false;

        for task in batch {
            match self.migrate_one(dest, &task, &mut index).await {
                Ok(true) => wrote_any = true,
                Ok(false) => {}
                Err(TapeVaultError::MediaError { tape, detail }) => {
                    tracing::error!("Media error on {} during migration: {}", tape, detail);
                    self.handle_media_failure(dest, &task);
                    // The rest of the batch would hit the same media; flush
                    // what we have and let the next pass retarget.
                    break;
                }
                Err(TapeVaultError::CapacityExceeded(msg)) => {
                    tracing::warn!("Tape {} filled mid-batch: {}", dest, msg);
                    self.revert_to_dirty(&task, dest, false);
                    break;
                }
                Err(e) => {
                    tracing::warn!("Migration of {} failed: {}", task.path, e);
                    self.revert_to_dirty(&task, dest, false);
                }
            }
        }

        if wrote_any {
            tapeops::finish_write(&self.catalog, &self.drive, dest, index).await?;
        }
        session.release();

        crate::catalog::save_catalog(&self.catalog, &self.state_dir)?;
        Ok(())
    }

    /// Migrate a single file. Returns Ok(true) when bytes landed on tape.
    async fn migrate_one(
        &self,
        dest: &TapeId,
        task: &WriteBackTask,
        index: &mut crate::device::TapeIndex,
    ) -> Result<bool> {
        // CAS guards against a writer or unlink racing us; losing means the
        // file is no longer ours to migrate.
        match self
            .catalog
            .transition(&task.path, FileState::Eligible, FileState::Migrating)
        {
            Ok(()) => {}
            Err(TapeVaultError::StateConflict { .. }) => {
                self.tasks.lock().remove(&task.path);
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        let blob = self.cache.blob_abs(&CacheStore::blob_rel(&task.path));
        let checksum = checksum_file(&blob)?;

        let drive = Arc::clone(&self.drive);
        let tape_path = task.path.clone();
        let blob2 = blob.clone();
        let store_result = tokio::task::spawn_blocking(move || drive.store(&blob2, &tape_path))
            .await
            .map_err(|e| TapeVaultError::DeviceUnavailable(e.to_string()))?;

        // The tape write was never confirmed on error, so the cache copy
        // stays authoritative.
        let extent = store_result?;
        let size = extent.len;
        let offset = extent.offset;

        match self
            .catalog
            .complete_migration(&task.path, extent, checksum.clone())
        {
            Ok(()) => {}
            Err(TapeVaultError::StateConflict { .. }) => {
                // A writer dirtied the file mid-transfer. The appended
                // bytes are orphans on the destination.
                tracing::debug!("{} was rewritten during migration, discarding copy", task.path);
                let _ = self.catalog.with_tape_mut(dest, |t| {
                    t.used_bytes = t.used_bytes.saturating_add(size).min(t.capacity);
                    t.deleted_bytes = t.deleted_bytes.saturating_add(size);
                });
                self.tasks.lock().remove(&task.path);
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        let record = self
            .catalog
            .get(&task.path)
            .ok_or_else(|| TapeVaultError::NotFound(task.path.clone()))?;

        // Any older copy of this path on the destination (overwrite of an
        // on-tape file) is dead in the index from this generation on.
        index.mark_dead(&task.path);
        index.entries.push(IndexEntry {
            path: task.path.clone(),
            offset,
            len: size,
            checksum: Some(checksum),
            mtime: record.mtime,
            dead: false,
        });

        // The cache copy demotes to an evictable replica.
        self.cache.mark_clean_replica(&task.path, size);
        self.tasks.lock().remove(&task.path);
        tracing::info!("{} migrated to {} ({} bytes)", task.path, dest, size);
        Ok(true)
    }

    fn handle_media_failure(&self, dest: &TapeId, task: &WriteBackTask) {
        // Failed media stops being a destination candidate until reclaimed.
        let _ = self
            .catalog
            .with_tape_mut(dest, |t| t.status = crate::catalog::TapeStatus::NeedsReclaim);
        self.revert_to_dirty(task, dest, true);
    }

    fn revert_to_dirty(&self, task: &WriteBackTask, dest: &TapeId, exclude_dest: bool) {
        let retries = task.retries + 1;
        if retries >= self.retry_limit {
            tracing::error!(
                "{} failed migration {} times; flagging unrecoverable for operator attention",
                task.path,
                retries
            );
            if let Err(e) = self.catalog.transition(
                &task.path,
                FileState::Migrating,
                FileState::Unrecoverable,
            ) {
                tracing::warn!("Could not flag {} unrecoverable: {}", task.path, e);
            }
            self.tasks.lock().remove(&task.path);
            return;
        }

        if let Err(e) =
            self.catalog
                .transition(&task.path, FileState::Migrating, FileState::Dirty)
        {
            tracing::warn!("Could not revert {} to dirty: {}", task.path, e);
        }
        let mut tasks = self.tasks.lock();
        if let Some(t) = tasks.get_mut(&task.path) {
            t.retries = retries;
            if exclude_dest {
                t.exclude.insert(dest.clone());
            }
        }
    }

    #[cfg(test)]
    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }
}

/// Pick a migration destination: never a tape that refuses migration
/// (NeedsReclaim, Retired), never an excluded tape, and it must have
/// headroom for the file. Most free space wins, so no single tape fills
/// while others sit blank.
pub fn select_destination(
    tapes: &[TapeRecord],
    needed: u64,
    exclude: &HashSet<TapeId>,
) -> Option<TapeId> {
    tapes
        .iter()
        .filter(|t| t.status.accepts_migration())
        .filter(|t| !exclude.contains(&t.id))
        .filter(|t| t.free_bytes() >= needed)
        .max_by_key(|t| t.free_bytes())
        .map(|t| t.id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TapeStatus;

    fn tape(id: &str, status: TapeStatus, capacity: u64, used: u64) -> TapeRecord {
        let mut t = TapeRecord::new(TapeId::new(id), Some(1), capacity);
        t.status = status;
        t.used_bytes = used;
        t
    }

    #[test]
    fn test_select_destination_prefers_most_free() {
        let tapes = vec![
            tape("A", TapeStatus::Formatted, 1_000, 600),
            tape("B", TapeStatus::Formatted, 1_000, 100),
            tape("C", TapeStatus::Unmounted, 1_000, 300),
        ];
        assert_eq!(
            select_destination(&tapes, 50, &HashSet::new()),
            Some(TapeId::new("B"))
        );
    }

    #[test]
    fn test_select_destination_skips_reclaim_and_excluded() {
        let tapes = vec![
            tape("A", TapeStatus::NeedsReclaim, 1_000, 0),
            tape("B", TapeStatus::Retired, 1_000, 0),
            tape("C", TapeStatus::Formatted, 1_000, 0),
        ];
        let mut exclude = HashSet::new();
        exclude.insert(TapeId::new("C"));
        assert_eq!(select_destination(&tapes, 10, &exclude), None);
        assert_eq!(
            select_destination(&tapes, 10, &HashSet::new()),
            Some(TapeId::new("C"))
        );
    }

    #[test]
    fn test_select_destination_respects_headroom() {
        let tapes = vec![tape("A", TapeStatus::Formatted, 1_000, 950)];
        assert_eq!(select_destination(&tapes, 100, &HashSet::new()), None);
        assert_eq!(
            select_destination(&tapes, 50, &HashSet::new()),
            Some(TapeId::new("A"))
        );
    }
}
