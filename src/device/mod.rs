use crate::catalog::{ExtentRef, TapeId};
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub mod mtx;
pub mod sim;

pub use mtx::MtxLibrary;
pub use sim::SimLibrary;

/// One occupied storage element in the changer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub slot: u32,
    pub tape: TapeId,
}

/// Result of a changer inventory pass: which cartridges sit in which slots,
/// and whether one is already in the drive.
#[derive(Debug, Clone, Default)]
pub struct InventoryReport {
    pub slots: Vec<SlotInfo>,
    pub loaded: Option<TapeId>,
}

impl InventoryReport {
    pub fn all_tapes(&self) -> Vec<TapeId> {
        let mut tapes: Vec<TapeId> = self.slots.iter().map(|s| s.tape.clone()).collect();
        if let Some(loaded) = &self.loaded {
            tapes.push(loaded.clone());
        }
        tapes
    }

    pub fn slot_of(&self, tape: &TapeId) -> Option<u32> {
        self.slots.iter().find(|s| &s.tape == tape).map(|s| s.slot)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveStatus {
    Empty,
    Loaded,
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TapeUsage {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

/// One entry in a tape's self-describing index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub path: String,
    pub offset: u64,
    pub len: u64,
    pub checksum: Option<String>,
    pub mtime: DateTime<Utc>,
    /// Extent bytes are dead (deleted or superseded). Kept in the index so
    /// reclaim accounting survives a catalog rebuild.
    #[serde(default)]
    pub dead: bool,
}

/// A tape's embedded extent table (LTFS-style). Authoritative description
/// of the tape's own contents; recovery rebuilds the catalog from these.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TapeIndex {
    pub volume: String,
    pub generation: u64,
    pub entries: Vec<IndexEntry>,
}

impl TapeIndex {
    pub fn new(volume: &TapeId) -> Self {
        TapeIndex {
            volume: volume.to_string(),
            generation: 0,
            entries: Vec::new(),
        }
    }

    pub fn live_entries(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.iter().filter(|e| !e.dead)
    }

    pub fn live_bytes(&self) -> u64 {
        self.live_entries().map(|e| e.len).sum()
    }

    pub fn dead_bytes(&self) -> u64 {
        self.entries.iter().filter(|e| e.dead).map(|e| e.len).sum()
    }

    /// Mark every entry for `path` dead. Returns the bytes newly deadened.
    pub fn mark_dead(&mut self, path: &str) -> u64 {
        let mut freed = 0;
        for entry in self.entries.iter_mut() {
            if entry.path == path && !entry.dead {
                entry.dead = true;
                freed += entry.len;
            }
        }
        freed
    }
}

/// Robotic changer: moves cartridges between storage slots and the drive.
/// Load and unload are mutually exclusive with all drive I/O; the scheduler
/// enforces that, implementations need not.
pub trait ChangerDevice: Send + Sync {
    fn inventory(&self) -> Result<InventoryReport>;
    fn load(&self, tape: &TapeId) -> Result<()>;
    fn unload(&self) -> Result<()>;
}

/// The single physical tape drive, addressed through the loaded tape's
/// LTFS-style namespace. The medium is append-only: `store` always appends
/// at the write cursor and existing extents are never rewritten in place.
pub trait DriveDevice: Send + Sync {
    fn status(&self) -> Result<DriveStatus>;

    /// Stream one file's extent from the loaded tape into `dst`.
    /// Returns the byte count.
    fn fetch(&self, tape_path: &str, dst: &Path) -> Result<u64>;

    /// Append the content of `src` to the loaded tape under `tape_path`,
    /// returning the extent it landed in.
    fn store(&self, src: &Path, tape_path: &str) -> Result<ExtentRef>;

    /// Read the loaded tape's embedded index.
    fn read_index(&self) -> Result<TapeIndex>;

    /// Replace the loaded tape's embedded index. Called after each write
    /// batch so the tape stays self-describing.
    fn write_index(&self, index: &TapeIndex) -> Result<()>;

    fn usage(&self) -> Result<TapeUsage>;

    /// Reformat the loaded tape, destroying its contents and index.
    fn format(&self, volume: &TapeId) -> Result<()>;

    fn rewind(&self) -> Result<()>;
}
