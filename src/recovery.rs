use crate::catalog::{
    Catalog, CatalogContents, ExtentRef, FileRecord, FileState, TapeId, TapeRecord, TapeStatus,
};
use crate::device::{ChangerDevice, DriveDevice, TapeIndex};
use crate::error::{Result, TapeVaultError};
use crate::scheduler::{DriveScheduler, Priority};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoverySummary {
    pub tapes_scanned: usize,
    pub files_indexed: usize,
    pub conflicts: usize,
    pub tapes_retired: usize,
    pub tapes_failed: usize,
}

/// Rebuilds the catalog from the tapes' own embedded indexes.
///
/// Runs at startup when the catalog store is missing or inconsistent, or on
/// operator request. Each tape is mounted through the normal scheduler path
/// so the single-session invariant holds even here; the one-shot pass runs
/// before any foreground traffic is admitted.
pub struct Recovery {
    catalog: Arc<Catalog>,
    scheduler: Arc<DriveScheduler>,
    changer: Arc<dyn ChangerDevice>,
    drive: Arc<dyn DriveDevice>,
}

impl Recovery {
    pub fn new(
        catalog: Arc<Catalog>,
        scheduler: Arc<DriveScheduler>,
        changer: Arc<dyn ChangerDevice>,
        drive: Arc<dyn DriveDevice>,
    ) -> Self {
        Recovery {
            catalog,
            scheduler,
            changer,
            drive,
        }
    }

    pub async fn run(&self) -> Result<RecoverySummary> {
        tracing::info!("Starting catalog recovery from tape inventory");
        let mut summary = RecoverySummary::default();

        let changer = Arc::clone(&self.changer);
        let report = tokio::task::spawn_blocking(move || changer.inventory())
            .await
            .map_err(|e| TapeVaultError::DeviceUnavailable(e.to_string()))??;

        let mut present: Vec<TapeId> = report.all_tapes();
        // Deterministic scan order makes recovery idempotent run-to-run.
        present.sort();
        present.dedup();

        // Tapes the catalog knows but the changer no longer holds are
        // retired, not deleted: their records stay for the operator.
        for tape in self.catalog.tapes() {
            if !present.contains(&tape.id) && tape.status != TapeStatus::Retired {
                tracing::warn!("Tape {} missing from inventory, retiring", tape.id);
                let _ = self
                    .catalog
                    .with_tape_mut(&tape.id, |t| t.status = TapeStatus::Retired);
                summary.tapes_retired += 1;
            }
        }

        // Records whose cache copy is authoritative survive recovery as-is;
        // the tape scan can only supersede tape-authoritative state.
        let existing = self.catalog.contents();
        let mut merged: HashMap<String, FileRecord> = existing
            .files
            .iter()
            .filter(|(_, r)| r.state.cache_is_authoritative())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut history = existing.history.clone();
        let mut tapes: HashMap<TapeId, TapeRecord> = existing
            .tapes
            .iter()
            .filter(|(_, t)| t.status == TapeStatus::Retired)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        for tape_id in &present {
            // One unreadable cartridge must not abort the whole rebuild.
            let (index, tape_record) = match self.scan_tape(tape_id, report.slot_of(tape_id)).await
            {
                Ok(scanned) => scanned,
                Err(e) => {
                    tracing::error!("Failed to index tape {}: {}; skipping", tape_id, e);
                    // Recovery owns the drive exclusively, so clearing the
                    // fault latch cannot race foreground traffic.
                    self.scheduler.reset_faults();
                    let mut record = self
                        .catalog
                        .get_tape(tape_id)
                        .unwrap_or_else(|| TapeRecord::new(tape_id.clone(), report.slot_of(tape_id), 0));
                    record.status = TapeStatus::NeedsReclaim;
                    record.last_seen = Utc::now();
                    tapes.insert(tape_id.clone(), record);
                    summary.tapes_failed += 1;
                    continue;
                }
            };
            summary.tapes_scanned += 1;

            for entry in index.live_entries() {
                summary.files_indexed += 1;
                let candidate = FileRecord {
                    path: entry.path.clone(),
                    size: entry.len,
                    checksum: entry.checksum.clone(),
                    state: FileState::Clean,
                    extent: Some(ExtentRef {
                        tape: tape_id.clone(),
                        offset: entry.offset,
                        len: entry.len,
                    }),
                    cache_blob: None,
                    mtime: entry.mtime,
                    atime: entry.mtime,
                };

                match merged.remove(&entry.path) {
                    None => {
                        merged.insert(entry.path.clone(), candidate);
                    }
                    Some(incumbent) => {
                        summary.conflicts += 1;
                        let (winner, mut loser) = resolve_conflict(incumbent, candidate);
                        tracing::warn!(
                            "Conflict on {}: keeping copy on {:?}, retaining superseded entry",
                            winner.path,
                            winner.extent.as_ref().map(|e| e.tape.to_string()),
                        );
                        loser.state = FileState::Tombstoned;
                        // Reruns resolve the same conflicts; only record a
                        // superseded copy the first time it loses.
                        if !history.contains(&loser) {
                            history.push(loser);
                        }
                        merged.insert(winner.path.clone(), winner);
                    }
                }
            }

            tapes.insert(tape_id.clone(), tape_record);
        }

        // Whatever was scanned last is still sitting in the drive.
        if let Some(current) = self.scheduler.current_tape() {
            if let Some(t) = tapes.get_mut(&current) {
                t.status = TapeStatus::Mounted;
            }
        }

        self.catalog.replace_contents(CatalogContents {
            files: merged,
            tapes,
            history,
        });

        tracing::info!(
            "Recovery complete: {} tapes, {} files, {} conflicts",
            summary.tapes_scanned,
            summary.files_indexed,
            summary.conflicts
        );
        Ok(summary)
    }

    async fn scan_tape(
        &self,
        tape_id: &TapeId,
        slot: Option<u32>,
    ) -> Result<(TapeIndex, TapeRecord)> {
        tracing::info!("Indexing tape {}", tape_id);
        let session = self
            .scheduler
            .request_mount(tape_id, Priority::Foreground)
            .await?;

        let drive = Arc::clone(&self.drive);
        let scanned = tokio::task::spawn_blocking(move || {
            let index = drive.read_index()?;
            let usage = drive.usage()?;
            Ok::<_, TapeVaultError>((index, usage))
        })
        .await
        .map_err(|e| TapeVaultError::DeviceUnavailable(e.to_string()))?;
        session.release();

        let (index, usage) = scanned?;

        let mut record = TapeRecord::new(tape_id.clone(), slot, usage.total_bytes);
        record.status = TapeStatus::Unmounted;
        record.used_bytes = usage.total_bytes - usage.free_bytes;
        record.deleted_bytes = index.dead_bytes();
        record.last_seen = Utc::now();

        tracing::info!(
            "Indexed {} entries on {} ({} live bytes)",
            index.entries.len(),
            tape_id,
            index.live_bytes()
        );
        Ok((index, record))
    }
}

/// Cross-tape conflict policy: a cache-authoritative incumbent always wins;
/// otherwise the later on-tape-recorded mtime wins, with the volume tag as
/// a deterministic tie-break. The loser is retained as history.
fn resolve_conflict(incumbent: FileRecord, candidate: FileRecord) -> (FileRecord, FileRecord) {
    if incumbent.state.cache_is_authoritative() {
        return (incumbent, candidate);
    }
    let incumbent_key = (
        incumbent.mtime,
        incumbent
            .extent
            .as_ref()
            .map(|e| e.tape.clone())
            .unwrap_or_else(|| TapeId::new("")),
    );
    let candidate_key = (
        candidate.mtime,
        candidate
            .extent
            .as_ref()
            .map(|e| e.tape.clone())
            .unwrap_or_else(|| TapeId::new("")),
    );
    if candidate_key > incumbent_key {
        (candidate, incumbent)
    } else {
        (incumbent, candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(path: &str, tape: &str, mtime_secs: i64, state: FileState) -> FileRecord {
        FileRecord {
            path: path.to_string(),
            size: 10,
            checksum: None,
            state,
            extent: Some(ExtentRef {
                tape: TapeId::new(tape),
                offset: 0,
                len: 10,
            }),
            cache_blob: None,
            mtime: Utc.timestamp_opt(mtime_secs, 0).unwrap(),
            atime: Utc.timestamp_opt(mtime_secs, 0).unwrap(),
        }
    }

    #[test]
    fn test_later_mtime_wins() {
        let old = record("f", "VT0001", 100, FileState::Clean);
        let new = record("f", "VT0002", 200, FileState::Clean);
        let (winner, loser) = resolve_conflict(old, new);
        assert_eq!(winner.extent.as_ref().unwrap().tape, TapeId::new("VT0002"));
        assert_eq!(loser.extent.as_ref().unwrap().tape, TapeId::new("VT0001"));
    }

    #[test]
    fn test_mtime_tie_broken_by_volume_tag() {
        let a = record("f", "VT0001", 100, FileState::Clean);
        let b = record("f", "VT0002", 100, FileState::Clean);
        let (winner, _) = resolve_conflict(a, b);
        assert_eq!(winner.extent.as_ref().unwrap().tape, TapeId::new("VT0002"));

        // Same result regardless of argument order.
        let a = record("f", "VT0001", 100, FileState::Clean);
        let b = record("f", "VT0002", 100, FileState::Clean);
        let (winner, _) = resolve_conflict(b, a);
        assert_eq!(winner.extent.as_ref().unwrap().tape, TapeId::new("VT0002"));
    }

    #[test]
    fn test_cache_authoritative_incumbent_wins() {
        let mut dirty = record("f", "VT0001", 50, FileState::Dirty);
        dirty.cache_blob = Some("blobs/x".to_string());
        dirty.extent = None;
        let tape_copy = record("f", "VT0002", 500, FileState::Clean);
        let (winner, _) = resolve_conflict(dirty, tape_copy);
        assert_eq!(winner.state, FileState::Dirty);
    }
}
