use crate::cache::checksum_file;
use crate::catalog::{Catalog, FileState, TapeId, TapeStatus};
use crate::device::{DriveDevice, IndexEntry};
use crate::error::{Result, TapeVaultError};
use crate::scheduler::{DriveScheduler, Priority};
use crate::tapeops;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const VERIFY_RETRY_LIMIT: u32 = 3;

// Spool disk held by one phase-A pass. Larger batches mean fewer mount
// cycles; the phase loop picks up where the batch ended.
const SPOOL_BATCH_BYTES: u64 = 4 * 1024 * 1024 * 1024;

/// A persisted tape-reclaim job. The cursor records how many listed files
/// have been verified on the destination; everything before it is durable,
/// everything after it is retried on resume. The source tape is not
/// touched destructively until the cursor reaches the end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefragJob {
    pub source: TapeId,
    pub dest: TapeId,
    /// Live files to relocate, in on-tape offset order.
    pub files: Vec<String>,
    pub cursor: usize,
    pub created: DateTime<Utc>,
}

impl DefragJob {
    pub fn is_complete(&self) -> bool {
        self.cursor >= self.files.len()
    }
}

/// Reclaims tape capacity fragmented by deletions. The medium is
/// append-only, so reclaiming means relocating all live extents to a fresh
/// destination and reformatting the source. Exactly one job runs at a time,
/// because there is exactly one drive.
pub struct DefragPlanner {
    catalog: Arc<Catalog>,
    scheduler: Arc<DriveScheduler>,
    drive: Arc<dyn DriveDevice>,
    state_dir: PathBuf,
    threshold_percent: u8,
    spool_batch_bytes: u64,
}

impl DefragPlanner {
    pub fn new(
        catalog: Arc<Catalog>,
        scheduler: Arc<DriveScheduler>,
        drive: Arc<dyn DriveDevice>,
        state_dir: PathBuf,
        threshold_percent: u8,
    ) -> Self {
        DefragPlanner {
            catalog,
            scheduler,
            drive,
            state_dir,
            threshold_percent,
            spool_batch_bytes: SPOOL_BATCH_BYTES,
        }
    }

    /// Cap the local disk a single spool pass may hold.
    pub fn with_spool_batch_bytes(mut self, limit: u64) -> Self {
        self.spool_batch_bytes = limit;
        self
    }

    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>, tick: Duration) {
        tracing::debug!(
            "Defrag planner started, threshold={}%",
            self.threshold_percent
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(tick) => {
                    if let Err(e) = self.run_once().await {
                        tracing::warn!("Defrag pass failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    tracing::debug!("Defrag planner stopping");
                    break;
                }
            }
        }
    }

    /// Resume a persisted job if one exists, otherwise plan a new one if
    /// any tape crossed the reclaim threshold. One pass, test-drivable.
    pub async fn run_once(&self) -> Result<()> {
        let job = match load_job(&self.state_dir)? {
            Some(job) => {
                tracing::info!(
                    "Resuming defrag of {} at entry {}/{}",
                    job.source,
                    job.cursor,
                    job.files.len()
                );
                job
            }
            None => match self.plan()? {
                Some(job) => job,
                None => return Ok(()),
            },
        };

        self.execute(job).await
    }

    /// Create a job for the worst offender over the threshold, if any.
    fn plan(&self) -> Result<Option<DefragJob>> {
        let threshold = self.threshold_percent as f64 / 100.0;
        let tapes = self.catalog.tapes();

        let Some(source) = tapes
            .iter()
            .filter(|t| {
                t.status == TapeStatus::NeedsReclaim
                    || (t.deleted_ratio() > threshold
                        && matches!(t.status, TapeStatus::Unmounted | TapeStatus::Formatted | TapeStatus::Mounted))
            })
            .max_by(|a, b| {
                a.deleted_ratio()
                    .partial_cmp(&b.deleted_ratio())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
        else {
            return Ok(None);
        };

        let mut live: Vec<_> = self
            .catalog
            .query_by_tape(&source.id)
            .into_iter()
            .filter(|r| r.state == FileState::Clean)
            .collect();
        live.sort_by_key(|r| r.extent.as_ref().map(|e| e.offset).unwrap_or(0));

        let live_bytes: u64 = live
            .iter()
            .filter_map(|r| r.extent.as_ref().map(|e| e.len))
            .sum();

        let mut exclude = HashSet::new();
        exclude.insert(source.id.clone());
        let Some(dest) =
            crate::writeback::select_destination(&tapes, live_bytes, &exclude)
        else {
            tracing::warn!(
                "Tape {} needs reclaim ({} live bytes) but no destination has headroom",
                source.id,
                live_bytes
            );
            return Ok(None);
        };

        let job = DefragJob {
            source: source.id.clone(),
            dest,
            files: live.into_iter().map(|r| r.path).collect(),
            cursor: 0,
            created: Utc::now(),
        };

        tracing::info!(
            "Planned defrag: {} -> {} ({} files, deleted ratio {:.1}%)",
            job.source,
            job.dest,
            job.files.len(),
            source.deleted_ratio() * 100.0
        );

        // The source must stop accepting new data for the job's lifetime.
        self.catalog
            .with_tape_mut(&job.source, |t| t.status = TapeStatus::NeedsReclaim)?;
        save_job(&self.state_dir, &job)?;
        Ok(Some(job))
    }

    async fn execute(&self, mut job: DefragJob) -> Result<()> {
        let spool = self.state_dir.join("defrag_spool");
        std::fs::create_dir_all(&spool)?;

        while !job.is_complete() {
            // Phase A: one source mount, spool every remaining live extent.
            self.spool_remaining(&job, &spool).await?;
            // Phase B: one destination mount, store + verify + advance the
            // cursor per file. A crash here resumes from the last durable
            // cursor value.
            self.store_remaining(&mut job, &spool).await?;
        }

        self.finish(&job).await?;
        let _ = std::fs::remove_dir_all(&spool);
        Ok(())
    }

    async fn spool_remaining(&self, job: &DefragJob, spool: &Path) -> Result<()> {
        let session = self
            .scheduler
            .request_mount(&job.source, Priority::Background)
            .await?;
        tapeops::note_mounted(&self.catalog, &job.source);

        let mut spooled_bytes = 0u64;
        for (i, path) in job.files.iter().enumerate().skip(job.cursor) {
            // Unlinked since planning; nothing to relocate.
            if !self.still_live(path) {
                continue;
            }
            let dst = spool.join(i.to_string());
            let drive = Arc::clone(&self.drive);
            let tape_path = path.clone();
            let dst2 = dst.clone();
            let fetched = tokio::task::spawn_blocking(move || drive.fetch(&tape_path, &dst2))
                .await
                .map_err(|e| TapeVaultError::DeviceUnavailable(e.to_string()))??;

            spooled_bytes += fetched;
            if spooled_bytes >= self.spool_batch_bytes {
                tracing::debug!(
                    "Spool batch full ({} bytes), deferring the rest to the next pass",
                    spooled_bytes
                );
                break;
            }
        }

        session.release();
        Ok(())
    }

    async fn store_remaining(&self, job: &mut DefragJob, spool: &Path) -> Result<()> {
        let session = self
            .scheduler
            .request_mount(&job.dest, Priority::Background)
            .await?;
        tapeops::note_mounted(&self.catalog, &job.dest);
        let mut index = tapeops::prepare_for_write(&self.catalog, &self.drive, &job.dest).await?;

        while job.cursor < job.files.len() {
            let i = job.cursor;
            let path = job.files[i].clone();

            if !self.still_live(&path) {
                job.cursor = i + 1;
                save_job(&self.state_dir, job)?;
                continue;
            }

            let spooled = spool.join(i.to_string());
            if !spooled.exists() {
                // Spool incomplete (crash between phases); redo phase A.
                break;
            }

            let extent = self.store_verified(&job.dest, &path, &spooled).await?;

            let record = self
                .catalog
                .get(&path)
                .ok_or_else(|| TapeVaultError::NotFound(path.clone()))?;
            index.entries.push(IndexEntry {
                path: path.clone(),
                offset: extent.offset,
                len: extent.len,
                checksum: record.checksum.clone(),
                mtime: record.mtime,
                dead: false,
            });

            // Only now does the catalog stop pointing at the source extent.
            self.catalog.relocate(&path, extent)?;
            job.cursor = i + 1;
            save_job(&self.state_dir, job)?;
            let _ = std::fs::remove_file(&spooled);
            tracing::debug!("Relocated {} ({}/{})", path, job.cursor, job.files.len());
        }

        tapeops::finish_write(&self.catalog, &self.drive, &job.dest, index).await?;
        session.release();
        Ok(())
    }

    /// Append the spooled file to the destination and read it back to
    /// verify the checksum. A failed verification leaves orphan bytes on
    /// the append-only destination; they are counted dead and the store is
    /// retried.
    async fn store_verified(
        &self,
        dest: &TapeId,
        path: &str,
        spooled: &Path,
    ) -> Result<crate::catalog::ExtentRef> {
        let expected = checksum_file(spooled)?;

        for attempt in 1..=VERIFY_RETRY_LIMIT {
            let drive = Arc::clone(&self.drive);
            let tape_path = path.to_string();
            let src = spooled.to_path_buf();
            let extent = tokio::task::spawn_blocking(move || drive.store(&src, &tape_path))
                .await
                .map_err(|e| TapeVaultError::DeviceUnavailable(e.to_string()))??;

            let verify_path = spooled.with_extension("verify");
            let drive = Arc::clone(&self.drive);
            let tape_path = path.to_string();
            let vp = verify_path.clone();
            let fetched = tokio::task::spawn_blocking(move || drive.fetch(&tape_path, &vp))
                .await
                .map_err(|e| TapeVaultError::DeviceUnavailable(e.to_string()))?;

            let ok = match fetched {
                Ok(_) => checksum_file(&verify_path)? == expected,
                Err(e) => {
                    tracing::warn!("Verification read of {} failed: {}", path, e);
                    false
                }
            };
            let _ = std::fs::remove_file(&verify_path);

            if ok {
                return Ok(extent);
            }

            tracing::warn!(
                "Checksum mismatch for {} on {} (attempt {}), discarding copy",
                path,
                extent.tape,
                attempt
            );
            // The unverified copy is dead weight on the destination.
            let _ = self
                .catalog
                .with_tape_mut(&extent.tape, |t| {
                    t.used_bytes = t.used_bytes.saturating_add(extent.len).min(t.capacity);
                    t.deleted_bytes = t.deleted_bytes.saturating_add(extent.len);
                });
        }

        Err(TapeVaultError::MediaError {
            tape: dest.to_string(),
            detail: format!("could not verify {} after {} attempts", path, VERIFY_RETRY_LIMIT),
        })
    }

    /// Every listed file verified on the destination: reformat the source
    /// and return it to service.
    async fn finish(&self, job: &DefragJob) -> Result<()> {
        tracing::info!("Defrag of {} complete, reformatting", job.source);

        let session = self
            .scheduler
            .request_mount(&job.source, Priority::Background)
            .await?;
        tapeops::note_mounted(&self.catalog, &job.source);

        let drive = Arc::clone(&self.drive);
        let volume = job.source.clone();
        tokio::task::spawn_blocking(move || drive.format(&volume))
            .await
            .map_err(|e| TapeVaultError::DeviceUnavailable(e.to_string()))??;
        session.release();

        self.catalog.with_tape_mut(&job.source, |t| {
            t.status = TapeStatus::Mounted;
            t.used_bytes = 0;
            t.deleted_bytes = 0;
            t.last_seen = Utc::now();
        })?;

        // Tombstoned records still pointing at the reformatted tape lose
        // their (now meaningless) extents.
        for record in self.catalog.query_by_tape(&job.source) {
            if record.state == FileState::Tombstoned {
                let _ = self
                    .catalog
                    .with_record_mut(&record.path, |r| r.extent = None);
            }
        }

        clear_job(&self.state_dir)?;
        crate::catalog::save_catalog(&self.catalog, &self.state_dir)?;
        Ok(())
    }

    fn still_live(&self, path: &str) -> bool {
        self.catalog
            .get(path)
            .map(|r| r.state == FileState::Clean)
            .unwrap_or(false)
    }
}

fn job_path(state_dir: &Path) -> PathBuf {
    state_dir.join("defrag_job.json")
}

pub fn load_job(state_dir: &Path) -> Result<Option<DefragJob>> {
    let path = job_path(state_dir);
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path)?;
    let job = serde_json::from_str(&content)?;
    Ok(Some(job))
}

pub fn save_job(state_dir: &Path, job: &DefragJob) -> Result<()> {
    std::fs::create_dir_all(state_dir)?;
    let path = job_path(state_dir);
    let tmp = state_dir.join("defrag_job.json.tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(job)?)?;

    let file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)?;
    file.try_lock_exclusive()
        .map_err(|e| TapeVaultError::Io(std::io::Error::other(format!(
            "Failed to lock defrag job file: {}",
            e
        ))))?;
    let rename_result = std::fs::rename(&tmp, &path);
    if let Err(e) = file.unlock() {
        tracing::warn!("Failed to release defrag job lock: {}", e);
    }
    rename_result?;
    Ok(())
}

pub fn clear_job(state_dir: &Path) -> Result<()> {
    match std::fs::remove_file(job_path(state_dir)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_job_persistence_round_trip() {
        let dir = TempDir::new().unwrap();
        let job = DefragJob {
            source: TapeId::new("SRC"),
            dest: TapeId::new("DST"),
            files: vec!["a".to_string(), "b".to_string()],
            cursor: 1,
            created: Utc::now(),
        };

        save_job(dir.path(), &job).unwrap();
        let loaded = load_job(dir.path()).unwrap().unwrap();
        assert_eq!(loaded.cursor, 1);
        assert_eq!(loaded.files, job.files);

        clear_job(dir.path()).unwrap();
        assert!(load_job(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_job_completion() {
        let mut job = DefragJob {
            source: TapeId::new("SRC"),
            dest: TapeId::new("DST"),
            files: vec!["a".to_string()],
            cursor: 0,
            created: Utc::now(),
        };
        assert!(!job.is_complete());
        job.cursor = 1;
        assert!(job.is_complete());
    }
}
