use crate::cache::{checksum_file, CacheStore};
use crate::catalog::{Catalog, FileRecord, FileState, TapeStatus};
use crate::error::{Result, TapeVaultError};
use crate::scheduler::{DriveScheduler, Priority};
use dashmap::DashMap;
use std::io::{Read, Seek, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// What a path resolves to. Directories are implicit: they exist exactly
/// when some live file lives beneath them, the catalog is the namespace.
#[derive(Debug, Clone)]
pub enum Entry {
    File(FileRecord),
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

/// The contract the filesystem adapter calls against. Every long-latency
/// operation blocks only its caller; already-cached traffic never waits on
/// the drive.
pub struct Namespace {
    catalog: Arc<Catalog>,
    cache: Arc<CacheStore>,
    scheduler: Arc<DriveScheduler>,
    drive: Arc<dyn crate::device::DriveDevice>,
    state_dir: PathBuf,
    stage_timeout: Duration,
    /// Single-flight stage-ins: concurrent readers of the same uncached
    /// file share one mount and one tape pass. The map is shared with the
    /// detached stage tasks, which remove their own entries on completion.
    inflight: Arc<DashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Namespace {
    pub fn new(
        catalog: Arc<Catalog>,
        cache: Arc<CacheStore>,
        scheduler: Arc<DriveScheduler>,
        drive: Arc<dyn crate::device::DriveDevice>,
        state_dir: PathBuf,
        stage_timeout: Duration,
    ) -> Self {
        Namespace {
            catalog,
            cache,
            scheduler,
            drive,
            state_dir,
            stage_timeout,
            inflight: Arc::new(DashMap::new()),
        }
    }

    pub fn lookup(&self, path: &str) -> Result<Entry> {
        let path = normalize_path(path)?;
        if path.is_empty() {
            return Ok(Entry::Directory);
        }
        if let Some(record) = self.catalog.get(&path) {
            if record.is_live() {
                return Ok(Entry::File(record));
            }
        }
        let prefix = format!("{}/", path);
        let has_children = self
            .catalog
            .live_paths()
            .iter()
            .any(|p| p.starts_with(&prefix));
        if has_children {
            Ok(Entry::Directory)
        } else {
            Err(TapeVaultError::NotFound(path))
        }
    }

    /// Direct children of a directory, sorted by name. Served entirely
    /// from the catalog; never touches tape.
    pub fn readdir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let path = normalize_path(path)?;
        let prefix = if path.is_empty() {
            String::new()
        } else {
            match self.lookup(&path)? {
                Entry::Directory => {}
                Entry::File(_) => {
                    return Err(TapeVaultError::InvalidPath(format!(
                        "{} is not a directory",
                        path
                    )))
                }
            }
            format!("{}/", path)
        };

        let mut seen = std::collections::BTreeMap::new();
        for record_path in self.catalog.live_paths() {
            let Some(remainder) = record_path.strip_prefix(&prefix) else {
                continue;
            };
            match remainder.split_once('/') {
                Some((child, _)) => {
                    seen.entry(child.to_string()).or_insert(DirEntry {
                        name: child.to_string(),
                        is_dir: true,
                        size: 0,
                    });
                }
                None => {
                    let size = self
                        .catalog
                        .get(&record_path)
                        .map(|r| r.size)
                        .unwrap_or(0);
                    seen.insert(
                        remainder.to_string(),
                        DirEntry {
                            name: remainder.to_string(),
                            is_dir: false,
                            size,
                        },
                    );
                }
            }
        }

        Ok(seen.into_values().collect())
    }

    /// Open a file for reading, transparently staging it in from tape when
    /// not cached. Blocks the caller until the content is available, bounded
    /// by the stage timeout.
    pub async fn open_for_read(&self, path: &str) -> Result<ReadHandle> {
        let path = normalize_path(path)?;
        let record = self
            .catalog
            .get(&path)
            .filter(|r| r.is_live())
            .ok_or_else(|| TapeVaultError::NotFound(path.clone()))?;

        if !record.is_cached() {
            if record.state != FileState::Clean {
                return Err(TapeVaultError::CatalogCorruption(format!(
                    "{} is {} but has no cache copy",
                    path, record.state
                )));
            }
            self.stage_in(&path, &record).await?;
        }

        self.cache.note_open(&path);
        let blob = self.cache.blob_abs(&CacheStore::blob_rel(&path));
        let file = match std::fs::File::open(&blob) {
            Ok(f) => f,
            Err(e) => {
                self.cache.note_close(&path);
                return Err(e.into());
            }
        };

        let _ = self
            .catalog
            .with_record_mut(&path, |r| r.atime = chrono::Utc::now());

        Ok(ReadHandle {
            file,
            path,
            cache: Arc::clone(&self.cache),
        })
    }

    /// Stage one file from tape into the cache, deduplicating concurrent
    /// requests for the same path.
    ///
    /// The stage itself runs detached: cancelling the future that awaits a
    /// fetch would drop the drive session mid-transfer and let the changer
    /// move while drive I/O is still in flight. Only the wait is bounded;
    /// the transfer runs to completion and serves the next reader.
    async fn stage_in(&self, path: &str, record: &FileRecord) -> Result<()> {
        let flight = self
            .inflight
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();

        let catalog = Arc::clone(&self.catalog);
        let cache = Arc::clone(&self.cache);
        let scheduler = Arc::clone(&self.scheduler);
        let drive = Arc::clone(&self.drive);
        let inflight = Arc::clone(&self.inflight);
        let task_path = path.to_string();
        let task_record = record.clone();

        let staging = tokio::spawn(async move {
            let _guard = flight.lock().await;

            // A concurrent reader may have finished the stage-in while
            // this one waited for the flight lock.
            let result = if catalog
                .get(&task_path)
                .map(|r| r.is_cached())
                .unwrap_or(false)
            {
                Ok(())
            } else {
                Self::do_stage_in(&catalog, &cache, &scheduler, &drive, &task_path, &task_record)
                    .await
            };
            inflight.remove(&task_path);
            result
        });

        match tokio::time::timeout(self.stage_timeout, staging).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(TapeVaultError::DeviceUnavailable(format!(
                "stage-in task failed: {}",
                e
            ))),
            Err(_) => Err(TapeVaultError::DeviceUnavailable(format!(
                "stage-in of {} timed out after {:?}; transfer continues in the background",
                path, self.stage_timeout
            ))),
        }
    }

    async fn do_stage_in(
        catalog: &Arc<Catalog>,
        cache: &Arc<CacheStore>,
        scheduler: &Arc<DriveScheduler>,
        drive: &Arc<dyn crate::device::DriveDevice>,
        path: &str,
        record: &FileRecord,
    ) -> Result<()> {
        let extent = record
            .extent
            .clone()
            .ok_or_else(|| TapeVaultError::CatalogCorruption(format!("{} has no extent", path)))?;

        tracing::info!("Staging {} in from tape {}", path, extent.tape);

        let evicted = cache.ensure_room(extent.len)?;
        drop_evicted_blobs(catalog, &evicted);

        let session = scheduler
            .request_mount(&extent.tape, Priority::Foreground)
            .await?;
        crate::tapeops::note_mounted(catalog, &extent.tape);

        let partial = partial_blob_path(cache, path);
        let fetch_drive = Arc::clone(drive);
        let tape_path = path.to_string();
        let partial2 = partial.clone();
        let fetch_result = tokio::task::spawn_blocking(move || fetch_drive.fetch(&tape_path, &partial2))
            .await
            .map_err(|e| TapeVaultError::DeviceUnavailable(e.to_string()))?;
        session.release();

        let fetched = match fetch_result {
            Ok(bytes) => bytes,
            Err(e @ TapeVaultError::MediaError { .. }) => {
                let _ = std::fs::remove_file(&partial);
                let _ =
                    catalog.with_tape_mut(&extent.tape, |t| t.status = TapeStatus::NeedsReclaim);
                return Err(e);
            }
            Err(e) => {
                let _ = std::fs::remove_file(&partial);
                return Err(e);
            }
        };

        if let Some(expected) = &record.checksum {
            let actual = checksum_file(&partial)?;
            if &actual != expected {
                let _ = std::fs::remove_file(&partial);
                let _ =
                    catalog.with_tape_mut(&extent.tape, |t| t.status = TapeStatus::NeedsReclaim);
                return Err(TapeVaultError::MediaError {
                    tape: extent.tape.to_string(),
                    detail: format!("staged copy of {} failed checksum verification", path),
                });
            }
        }

        let blob = cache.blob_abs(&CacheStore::blob_rel(path));
        if let Some(parent) = blob.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(&partial, &blob)?;

        cache.mark_clean_replica(path, fetched);
        catalog.with_record_mut(path, |r| r.cache_blob = Some(CacheStore::blob_rel(path)))?;
        Ok(())
    }

    /// Open a file for writing. The content lands in the cache, the record
    /// becomes dirty and the dwell timer starts; tape placement happens
    /// later, in the background.
    pub fn open_for_write(&self, path: &str) -> Result<WriteHandle> {
        let path = normalize_path(path)?;
        if path.is_empty() {
            return Err(TapeVaultError::InvalidPath("empty path".to_string()));
        }

        // Backpressure: when dirty and open data alone fills the cache,
        // reject new writes instead of dropping anything.
        if self.cache.pinned_bytes() >= self.cache.capacity() {
            return Err(TapeVaultError::CapacityExceeded(
                "cache is full of unmigrated data".to_string(),
            ));
        }

        let blob_rel = CacheStore::blob_rel(&path);
        let blob = self.cache.blob_abs(&blob_rel);
        if let Some(parent) = blob.parent() {
            std::fs::create_dir_all(parent)?;
        }

        match self.catalog.get(&path) {
            Some(record) if record.is_live() => {
                // The replica stops being evictable the moment the write
                // begins; from here the cache copy is the only current one.
                if record.is_cached() {
                    self.cache.pin_for_write(&path);
                }
                self.catalog.mark_dirty_for_write(&path, &blob_rel)?;
                // An uncached clean file starts over; a cached one keeps its
                // replica as the base for extension.
                if !record.is_cached() {
                    let _ = std::fs::remove_file(&blob);
                }
            }
            _ => {
                // New file (or resurrecting a tombstoned path; the old
                // record moves to history).
                self.catalog.put(FileRecord::new_dirty(&path, &blob_rel));
                let _ = std::fs::remove_file(&blob);
            }
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&blob)?;

        Ok(WriteHandle {
            file: Some(file),
            path,
            blob,
            namespace: self,
        })
    }

    /// Tombstone a file: the record is retained, the owning tape's dead
    /// byte counter grows, and any cache blob is freed.
    pub fn unlink(&self, path: &str) -> Result<()> {
        let path = normalize_path(path)?;
        let removed = self.catalog.tombstone(&path)?;

        if removed.cache_blob.is_some() {
            self.cache.remove_blob(&path)?;
            self.catalog
                .with_record_mut(&path, |r| r.cache_blob = None)?;
        }

        crate::catalog::save_catalog(&self.catalog, &self.state_dir)?;
        tracing::info!("Unlinked {}", path);
        Ok(())
    }

    fn commit_write(&self, path: &str, blob: &PathBuf) -> Result<()> {
        let size = std::fs::metadata(blob)?.len();
        self.cache.account_dirty(path, size);
        self.catalog.with_record_mut(path, |r| {
            r.size = size;
            r.mtime = chrono::Utc::now();
        })?;

        // Relieve pressure from this write if clean replicas can go.
        match self.cache.ensure_room(0) {
            Ok(evicted) => drop_evicted_blobs(&self.catalog, &evicted),
            Err(TapeVaultError::CapacityExceeded(msg)) => {
                tracing::warn!("Cache over capacity after write to {}: {}", path, msg);
            }
            Err(e) => return Err(e),
        }

        crate::catalog::save_catalog(&self.catalog, &self.state_dir)?;
        Ok(())
    }
}

fn drop_evicted_blobs(catalog: &Catalog, evicted: &[String]) {
    for victim in evicted {
        if let Err(e) = catalog.with_record_mut(victim, |r| r.cache_blob = None) {
            tracing::warn!("Evicted {} but could not update record: {}", victim, e);
        }
    }
}

fn partial_blob_path(cache: &CacheStore, path: &str) -> PathBuf {
    let mut p = cache.blob_abs(&CacheStore::blob_rel(path)).into_os_string();
    p.push(".part");
    PathBuf::from(p)
}

/// Read stream over a staged or dirty cache blob. Closing (dropping) the
/// handle releases the open-file pin that blocks eviction.
pub struct ReadHandle {
    file: std::fs::File,
    path: String,
    cache: Arc<CacheStore>,
}

impl std::fmt::Debug for ReadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadHandle")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl std::io::Read for ReadHandle {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}

impl std::io::Seek for ReadHandle {
    fn seek(&mut self, pos: std::io::SeekFrom) -> std::io::Result<u64> {
        self.file.seek(pos)
    }
}

impl Drop for ReadHandle {
    fn drop(&mut self) {
        self.cache.note_close(&self.path);
    }
}

/// Writable handle appending into a cache blob. `finish` commits the new
/// size and modification time; dropping without finishing still commits,
/// best-effort, so partial data is never silently unaccounted.
pub struct WriteHandle<'a> {
    file: Option<std::fs::File>,
    path: String,
    blob: PathBuf,
    namespace: &'a Namespace,
}

impl std::fmt::Debug for WriteHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteHandle")
            .field("path", &self.path)
            .field("blob", &self.blob)
            .finish_non_exhaustive()
    }
}

impl WriteHandle<'_> {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn finish(mut self) -> Result<()> {
        self.finish_inner()
    }

    fn finish_inner(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
            drop(file);
            self.namespace.commit_write(&self.path, &self.blob)?;
        }
        Ok(())
    }
}

impl std::io::Write for WriteHandle<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.file {
            Some(file) => file.write(buf),
            None => Err(std::io::Error::other("write handle already finished")),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.file {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for WriteHandle<'_> {
    fn drop(&mut self) {
        if self.file.is_some() {
            if let Err(e) = self.finish_inner() {
                tracing::warn!("Implicit commit of {} failed: {}", self.path, e);
            }
        }
    }
}

/// Strip leading slashes and reject traversal components. The catalog
/// stores relative paths only.
pub fn normalize_path(path: &str) -> Result<String> {
    let trimmed = path.trim_start_matches('/').trim_end_matches('/');
    if trimmed
        .split('/')
        .any(|c| c == ".." || c == "." || (c.is_empty() && !trimmed.is_empty()))
    {
        return Err(TapeVaultError::InvalidPath(path.to_string()));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/a/b/c").unwrap(), "a/b/c");
        assert_eq!(normalize_path("a/b").unwrap(), "a/b");
        assert_eq!(normalize_path("/").unwrap(), "");
        assert!(normalize_path("a/../b").is_err());
        assert!(normalize_path("a//b").is_err());
        assert!(normalize_path("./a").is_err());
    }
}
