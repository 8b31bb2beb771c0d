use crate::error::{Result, TapeVaultError};
use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

// Eviction candidates are capped, not the cache itself; byte accounting is
// what actually bounds the cache.
const EVICTION_QUEUE_CAPACITY: usize = 1_000_000;

/// SHA-256 of a file's content, hex-encoded. Streams in 1 MiB chunks.
pub fn checksum_file(path: &Path) -> Result<String> {
    use std::io::Read;

    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Disk cache accounting. The blob bytes themselves live in ordinary files
/// under the cache root; this layer tracks usage, which staged replicas are
/// evictable, and which files are held open by readers.
///
/// Eviction only ever considers clean replicas that no reader has open.
/// Dirty, eligible and migrating content is authoritative and is never
/// evicted; migration must complete (or fail back to dirty) first.
pub struct CacheStore {
    root: PathBuf,
    capacity: u64,
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    used_bytes: u64,
    /// Size of each accounted blob, keyed by virtual path.
    sizes: HashMap<String, u64>,
    /// Clean replicas in least-recently-used order, keyed by virtual path.
    clean_lru: LruCache<String, ()>,
    open_counts: HashMap<String, usize>,
}

impl CacheStore {
    pub fn new(root: &Path, capacity: u64) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        Ok(CacheStore {
            root: root.to_path_buf(),
            capacity,
            inner: Mutex::new(CacheInner {
                used_bytes: 0,
                sizes: HashMap::new(),
                clean_lru: LruCache::new(
                    NonZeroUsize::new(EVICTION_QUEUE_CAPACITY).expect("nonzero"),
                ),
                open_counts: HashMap::new(),
            }),
        })
    }

    /// Stable blob name for a virtual path.
    pub fn blob_rel(path: &str) -> String {
        format!("blobs/{}", hex::encode(Sha256::digest(path.as_bytes())))
    }

    pub fn blob_abs(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    pub fn used_bytes(&self) -> u64 {
        self.inner.lock().used_bytes
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes that eviction cannot reclaim: dirty content plus open replicas.
    pub fn pinned_bytes(&self) -> u64 {
        let inner = self.inner.lock();
        inner
            .sizes
            .iter()
            .filter(|(path, _)| !inner.clean_lru.contains(*path) || Self::is_open(&inner, path))
            .map(|(_, size)| *size)
            .sum()
    }

    fn is_open(inner: &CacheInner, path: &str) -> bool {
        inner.open_counts.get(path).copied().unwrap_or(0) > 0
    }

    pub fn note_open(&self, path: &str) {
        let mut inner = self.inner.lock();
        *inner.open_counts.entry(path.to_string()).or_insert(0) += 1;
        // Refresh recency while we're here.
        inner.clean_lru.get(path);
    }

    pub fn note_close(&self, path: &str) {
        let mut inner = self.inner.lock();
        if let Some(count) = inner.open_counts.get_mut(path) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                inner.open_counts.remove(path);
            }
        }
    }

    /// Account a blob that was just written or resized. The path leaves the
    /// evictable set: freshly written content is dirty until migrated.
    pub fn account_dirty(&self, path: &str, new_size: u64) {
        let mut inner = self.inner.lock();
        let old = inner.sizes.insert(path.to_string(), new_size).unwrap_or(0);
        inner.used_bytes = inner.used_bytes - old + new_size;
        inner.clean_lru.pop(path);
    }

    /// A cached replica is being reused as the base of a new write. It
    /// leaves the evictable set immediately and keeps its accounted size
    /// until the write commits.
    pub fn pin_for_write(&self, path: &str) {
        self.inner.lock().clean_lru.pop(path);
    }

    /// Mark a path's blob as a clean, evictable replica (staged in from
    /// tape, or migration just completed).
    pub fn mark_clean_replica(&self, path: &str, size: u64) {
        let mut inner = self.inner.lock();
        let old = inner.sizes.insert(path.to_string(), size).unwrap_or(0);
        inner.used_bytes = inner.used_bytes - old + size;
        inner.clean_lru.put(path.to_string(), ());
    }

    /// Remove a blob from disk and accounting (unlink, or discarded staging).
    pub fn remove_blob(&self, path: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(size) = inner.sizes.remove(path) {
            inner.used_bytes -= size;
        }
        inner.clean_lru.pop(path);
        inner.open_counts.remove(path);
        drop(inner);

        let abs = self.blob_abs(&Self::blob_rel(path));
        match std::fs::remove_file(&abs) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Make room for `incoming` additional bytes, evicting clean replicas in
    /// LRU order. Returns the virtual paths evicted so the caller can clear
    /// their cache references in the catalog. Fails with `CapacityExceeded`
    /// when the remaining pressure cannot be relieved.
    pub fn ensure_room(&self, incoming: u64) -> Result<Vec<String>> {
        let mut evicted = Vec::new();
        let mut inner = self.inner.lock();

        if incoming > self.capacity {
            return Err(TapeVaultError::CapacityExceeded(format!(
                "object of {} bytes exceeds cache capacity {}",
                incoming, self.capacity
            )));
        }

        let mut skipped: Vec<String> = Vec::new();
        while inner.used_bytes + incoming > self.capacity {
            let Some((path, ())) = inner.clean_lru.pop_lru() else {
                break;
            };
            if Self::is_open(&inner, &path) {
                skipped.push(path);
                continue;
            }
            if let Some(size) = inner.sizes.remove(&path) {
                inner.used_bytes -= size;
            }
            evicted.push(path);
        }
        // Open replicas stay resident and keep their recency.
        for path in skipped {
            inner.clean_lru.put(path, ());
        }

        if inner.used_bytes + incoming > self.capacity {
            // Roll nothing back; evicted entries are already gone from
            // accounting and will be deleted below regardless.
            let used = inner.used_bytes;
            drop(inner);
            self.delete_evicted(&evicted)?;
            return Err(TapeVaultError::CapacityExceeded(format!(
                "cache full: {} of {} bytes pinned by dirty or open files",
                used, self.capacity
            )));
        }

        drop(inner);
        self.delete_evicted(&evicted)?;
        Ok(evicted)
    }

    fn delete_evicted(&self, paths: &[String]) -> Result<()> {
        for path in paths {
            let abs = self.blob_abs(&Self::blob_rel(path));
            if let Err(e) = std::fs::remove_file(&abs) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("Failed to delete evicted blob for {}: {}", path, e);
                }
            }
            tracing::debug!("Evicted clean replica of {}", path);
        }
        Ok(())
    }
}
