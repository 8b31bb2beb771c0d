//! Helpers shared by the write-back engine and the defrag worker for
//! preparing a mounted tape for writing.

use crate::catalog::{Catalog, FileState, TapeId, TapeStatus};
use crate::device::{DriveDevice, TapeIndex};
use crate::error::Result;
use std::sync::Arc;

/// Record a successful mount in the catalog: the tape leaves its slot, and
/// whatever was previously marked mounted is back in storage.
pub(crate) fn note_mounted(catalog: &Catalog, tape: &TapeId) {
    for record in catalog.tapes() {
        if record.status == TapeStatus::Mounted && &record.id != tape {
            let _ = catalog.with_tape_mut(&record.id, |t| t.status = TapeStatus::Unmounted);
        }
    }
    let _ = catalog.with_tape_mut(tape, |t| t.status = TapeStatus::Mounted);
}

/// Make the mounted tape writable: format it if blank, and fold any
/// catalog tombstones for this tape into its embedded index so deletions
/// survive a catalog rebuild. Returns the up-to-date index.
pub(crate) async fn prepare_for_write(
    catalog: &Arc<Catalog>,
    drive: &Arc<dyn DriveDevice>,
    tape: &TapeId,
) -> Result<TapeIndex> {
    let is_blank = catalog
        .get_tape(tape)
        .map(|t| t.status == TapeStatus::Blank)
        .unwrap_or(false);

    if is_blank {
        tracing::info!("Formatting blank tape {}", tape);
        let drive2 = Arc::clone(drive);
        let tape2 = tape.clone();
        tokio::task::spawn_blocking(move || drive2.format(&tape2))
            .await
            .map_err(|e| crate::error::TapeVaultError::DeviceUnavailable(e.to_string()))??;
    }

    let drive2 = Arc::clone(drive);
    let mut index = tokio::task::spawn_blocking(move || drive2.read_index())
        .await
        .map_err(|e| crate::error::TapeVaultError::DeviceUnavailable(e.to_string()))??;

    // A changer with scrambled slot state can hand us the wrong cartridge;
    // never write under a mismatched volume tag.
    if index.volume != tape.as_str() {
        return Err(crate::error::TapeVaultError::ConsistencyConflict(format!(
            "drive holds volume {} but {} was requested",
            index.volume, tape
        )));
    }

    // Deletions are accounted in the catalog the moment they happen, but
    // the tape's own index only learns about them here, at the next write
    // mount.
    let mut flushed = 0u64;
    for record in catalog.query_by_tape(tape) {
        if record.state == FileState::Tombstoned {
            flushed += index.mark_dead(&record.path);
        }
    }
    if flushed > 0 {
        tracing::debug!("Flushed {} dead bytes into index of {}", flushed, tape);
    }

    Ok(index)
}

/// Write the index back and refresh the catalog's view of the tape.
pub(crate) async fn finish_write(
    catalog: &Arc<Catalog>,
    drive: &Arc<dyn DriveDevice>,
    tape: &TapeId,
    index: TapeIndex,
) -> Result<()> {
    let drive2 = Arc::clone(drive);
    let usage = tokio::task::spawn_blocking(move || {
        drive2.write_index(&index)?;
        drive2.usage()
    })
    .await
    .map_err(|e| crate::error::TapeVaultError::DeviceUnavailable(e.to_string()))??;

    catalog.with_tape_mut(tape, |t| {
        t.capacity = usage.total_bytes;
        t.used_bytes = usage.total_bytes - usage.free_bytes;
        t.last_seen = chrono::Utc::now();
    })?;
    Ok(())
}
