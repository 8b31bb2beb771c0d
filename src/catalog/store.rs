use crate::catalog::types::{ExtentRef, FileRecord, FileState, TapeId, TapeRecord};
use crate::error::{Result, TapeVaultError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Snapshot shape persisted to disk and exchanged with recovery.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogContents {
    pub files: HashMap<String, FileRecord>,
    pub tapes: HashMap<TapeId, TapeRecord>,
    /// Superseded records retained for auditability (recovery conflicts,
    /// overwritten tombstones). Never served through the namespace.
    pub history: Vec<FileRecord>,
}

/// Authoritative mapping from virtual path to file state and physical
/// location. Concurrent reads, per-record single-writer updates via
/// compare-and-swap state transitions.
#[derive(Debug, Default)]
pub struct Catalog {
    inner: RwLock<CatalogContents>,
}

impl Catalog {
    pub fn new() -> Self {
        Catalog::default()
    }

    pub fn from_contents(contents: CatalogContents) -> Self {
        Catalog {
            inner: RwLock::new(contents),
        }
    }

    pub fn contents(&self) -> CatalogContents {
        self.inner.read().clone()
    }

    pub fn replace_contents(&self, contents: CatalogContents) {
        *self.inner.write() = contents;
    }

    pub fn get(&self, path: &str) -> Option<FileRecord> {
        self.inner.read().files.get(path).cloned()
    }

    /// Insert or replace a record. A replaced record is moved to history
    /// rather than dropped.
    pub fn put(&self, record: FileRecord) {
        let mut inner = self.inner.write();
        if let Some(old) = inner.files.insert(record.path.clone(), record) {
            inner.history.push(old);
        }
    }

    /// Remove a record outright. Prefer `tombstone` for deletions that must
    /// keep tape accounting intact.
    pub fn delete(&self, path: &str) -> Option<FileRecord> {
        self.inner.write().files.remove(path)
    }

    pub fn query_by_state(&self, state: FileState) -> Vec<FileRecord> {
        self.inner
            .read()
            .files
            .values()
            .filter(|r| r.state == state)
            .cloned()
            .collect()
    }

    pub fn query_by_tape(&self, tape: &TapeId) -> Vec<FileRecord> {
        self.inner
            .read()
            .files
            .values()
            .filter(|r| r.extent.as_ref().is_some_and(|e| &e.tape == tape))
            .cloned()
            .collect()
    }

    /// Atomic compare-and-swap state transition. Fails with `StateConflict`
    /// if the record is not currently in `from`, which is how racing
    /// write-back, unlink and recovery operations are serialized per record.
    pub fn transition(&self, path: &str, from: FileState, to: FileState) -> Result<()> {
        let mut inner = self.inner.write();
        let record = inner
            .files
            .get_mut(path)
            .ok_or_else(|| TapeVaultError::NotFound(path.to_string()))?;

        if record.state != from {
            return Err(TapeVaultError::StateConflict {
                path: path.to_string(),
                expected: from.name().to_string(),
                actual: record.state.name().to_string(),
            });
        }
        if !from.can_transition_to(to) {
            return Err(TapeVaultError::StateConflict {
                path: path.to_string(),
                expected: format!("a state reachable from {}", from),
                actual: to.name().to_string(),
            });
        }

        record.state = to;
        Ok(())
    }

    /// Apply a closure to a record under the write lock.
    pub fn with_record_mut<F, T>(&self, path: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut FileRecord) -> T,
    {
        let mut inner = self.inner.write();
        let record = inner
            .files
            .get_mut(path)
            .ok_or_else(|| TapeVaultError::NotFound(path.to_string()))?;
        Ok(f(record))
    }

    /// Tombstone a record and account its dead extent bytes against the
    /// owning tape, in one critical section.
    pub fn tombstone(&self, path: &str) -> Result<FileRecord> {
        let mut inner = self.inner.write();
        let record = inner
            .files
            .get_mut(path)
            .ok_or_else(|| TapeVaultError::NotFound(path.to_string()))?;

        if !record.state.can_transition_to(FileState::Tombstoned) {
            return Err(TapeVaultError::StateConflict {
                path: path.to_string(),
                expected: "a tombstonable state".to_string(),
                actual: record.state.name().to_string(),
            });
        }

        record.state = FileState::Tombstoned;
        let removed = record.clone();

        if let Some(extent) = removed.extent.clone() {
            if let Some(tape) = inner.tapes.get_mut(&extent.tape) {
                tape.deleted_bytes = tape.deleted_bytes.saturating_add(extent.len);
                debug_assert!(tape.accounting_ok(), "tape accounting violated");
            }
        }

        Ok(removed)
    }

    /// Point a record at a freshly verified extent on another tape, moving
    /// the dead bytes from the old extent to its owner. Used by defrag and
    /// by migration retargeting; the record state is untouched.
    pub fn relocate(&self, path: &str, new_extent: ExtentRef) -> Result<()> {
        let mut inner = self.inner.write();
        let old = {
            let record = inner
                .files
                .get_mut(path)
                .ok_or_else(|| TapeVaultError::NotFound(path.to_string()))?;
            std::mem::replace(&mut record.extent, Some(new_extent))
        };

        if let Some(old) = old {
            if let Some(tape) = inner.tapes.get_mut(&old.tape) {
                tape.deleted_bytes = tape.deleted_bytes.saturating_add(old.len);
            }
        }
        Ok(())
    }

    /// Atomically finish a migration: only if the record is still
    /// `Migrating` does it gain the new extent and checksum and become
    /// `Clean`. A writer that dirtied the file mid-transfer wins instead,
    /// and the caller must treat the tape bytes as orphaned.
    pub fn complete_migration(
        &self,
        path: &str,
        extent: ExtentRef,
        checksum: String,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let record = inner
            .files
            .get_mut(path)
            .ok_or_else(|| TapeVaultError::NotFound(path.to_string()))?;

        if record.state != FileState::Migrating {
            return Err(TapeVaultError::StateConflict {
                path: path.to_string(),
                expected: FileState::Migrating.name().to_string(),
                actual: record.state.name().to_string(),
            });
        }

        let old = std::mem::replace(&mut record.extent, Some(extent));
        record.checksum = Some(checksum);
        record.state = FileState::Clean;

        if let Some(old) = old {
            if let Some(tape) = inner.tapes.get_mut(&old.tape) {
                tape.deleted_bytes = tape.deleted_bytes.saturating_add(old.len);
            }
        }
        Ok(())
    }

    /// Atomically mark a record dirty for a new write: legal from `Dirty`
    /// (no-op), `Eligible` (debounce), `Clean` (overwrite; the tape extent
    /// dies immediately since the cache copy becomes authoritative), and
    /// `Migrating` (the in-flight transfer loses). Sets the cache blob and
    /// resets the dwell timer.
    pub fn mark_dirty_for_write(&self, path: &str, blob: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let record = inner
            .files
            .get_mut(path)
            .ok_or_else(|| TapeVaultError::NotFound(path.to_string()))?;

        match record.state {
            FileState::Dirty => {}
            FileState::Eligible
            | FileState::Clean
            | FileState::Migrating
            | FileState::Unrecoverable => {
                record.state = FileState::Dirty;
            }
            other => {
                return Err(TapeVaultError::StateConflict {
                    path: path.to_string(),
                    expected: "a writable state".to_string(),
                    actual: other.name().to_string(),
                });
            }
        }

        record.cache_blob = Some(blob.to_string());
        record.mtime = chrono::Utc::now();
        let old = record.extent.take();

        if let Some(old) = old {
            if let Some(tape) = inner.tapes.get_mut(&old.tape) {
                tape.deleted_bytes = tape.deleted_bytes.saturating_add(old.len);
            }
        }
        Ok(())
    }

    pub fn get_tape(&self, id: &TapeId) -> Option<TapeRecord> {
        self.inner.read().tapes.get(id).cloned()
    }

    pub fn tapes(&self) -> Vec<TapeRecord> {
        self.inner.read().tapes.values().cloned().collect()
    }

    pub fn upsert_tape(&self, tape: TapeRecord) {
        self.inner.write().tapes.insert(tape.id.clone(), tape);
    }

    pub fn with_tape_mut<F, T>(&self, id: &TapeId, f: F) -> Result<T>
    where
        F: FnOnce(&mut TapeRecord) -> T,
    {
        let mut inner = self.inner.write();
        let tape = inner
            .tapes
            .get_mut(id)
            .ok_or_else(|| TapeVaultError::NotFound(format!("tape {}", id)))?;
        let out = f(tape);
        debug_assert!(tape.accounting_ok(), "tape accounting violated");
        Ok(out)
    }

    pub fn push_history(&self, record: FileRecord) {
        self.inner.write().history.push(record);
    }

    pub fn live_paths(&self) -> Vec<String> {
        self.inner
            .read()
            .files
            .values()
            .filter(|r| r.is_live())
            .map(|r| r.path.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.read();
        inner.files.is_empty() && inner.tapes.is_empty()
    }

    /// Structural consistency check. An inconsistent catalog is a valid
    /// bootstrap trigger for recovery, not a fatal error.
    pub fn check_consistent(&self) -> std::result::Result<(), String> {
        let inner = self.inner.read();
        for record in inner.files.values() {
            if let Some(extent) = &record.extent {
                if !inner.tapes.contains_key(&extent.tape) {
                    return Err(format!(
                        "record {} references unknown tape {}",
                        record.path, extent.tape
                    ));
                }
            }
            if record.state == FileState::Clean && record.extent.is_none() {
                return Err(format!("clean record {} has no tape extent", record.path));
            }
            if record.state.cache_is_authoritative() && record.cache_blob.is_none() {
                return Err(format!(
                    "record {} is {} but has no cache blob",
                    record.path, record.state
                ));
            }
        }
        for tape in inner.tapes.values() {
            if !tape.accounting_ok() {
                return Err(format!(
                    "tape {} accounting violated: deleted={} used={} capacity={}",
                    tape.id, tape.deleted_bytes, tape.used_bytes, tape.capacity
                ));
            }
        }
        Ok(())
    }
}
