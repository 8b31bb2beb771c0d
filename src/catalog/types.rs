use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Volume tag printed on the cartridge barcode. Unique within a library.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TapeId(pub String);

impl TapeId {
    pub fn new(tag: impl Into<String>) -> Self {
        TapeId(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TapeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A contiguous region of tape holding one file's data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentRef {
    pub tape: TapeId,
    pub offset: u64,
    pub len: u64,
}

/// Per-file migration state.
///
/// The cache copy is authoritative in `Dirty`, `Eligible`, `Migrating` and
/// `Unrecoverable`; the tape extent is authoritative in `Clean`. A record is
/// never in a state where both copies claim to be current.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    /// Modified in cache, dwell timer running.
    Dirty,
    /// Dwell delay elapsed without modification; queued for migration.
    Eligible,
    /// A write-back task is copying this file to tape right now.
    Migrating,
    /// On tape; any cache copy is a disposable replica.
    Clean,
    /// Deleted (or superseded during recovery). Extent bytes are dead.
    Tombstoned,
    /// Migration retries exhausted. Cache copy pinned until an operator
    /// intervenes.
    Unrecoverable,
}

impl FileState {
    pub fn name(&self) -> &'static str {
        match self {
            FileState::Dirty => "dirty",
            FileState::Eligible => "eligible",
            FileState::Migrating => "migrating",
            FileState::Clean => "clean",
            FileState::Tombstoned => "tombstoned",
            FileState::Unrecoverable => "unrecoverable",
        }
    }

    /// Whether the cache copy is the authoritative content in this state.
    pub fn cache_is_authoritative(&self) -> bool {
        matches!(
            self,
            FileState::Dirty | FileState::Eligible | FileState::Migrating | FileState::Unrecoverable
        )
    }

    /// Legal state-machine edges. Everything else is a `StateConflict`.
    pub fn can_transition_to(&self, to: FileState) -> bool {
        use FileState::*;
        matches!(
            (self, to),
            (Dirty, Eligible)
                | (Dirty, Tombstoned)
                | (Eligible, Dirty)        // modified during dwell, debounce
                | (Eligible, Migrating)
                | (Eligible, Tombstoned)
                | (Migrating, Clean)
                | (Migrating, Dirty)       // transfer failed, cache still authoritative
                | (Migrating, Tombstoned)  // unlinked mid-transfer, tombstone wins
                | (Migrating, Unrecoverable)
                | (Clean, Dirty)           // overwrite of an on-tape file
                | (Clean, Tombstoned)
                | (Unrecoverable, Dirty)   // operator reset
                | (Unrecoverable, Tombstoned)
        )
    }
}

impl std::fmt::Display for FileState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Virtual path, unique key within the namespace. No leading slash.
    pub path: String,
    pub size: u64,
    /// SHA-256 of the content, hex-encoded. Set when the content is first
    /// committed to cache and re-verified on every relocation.
    pub checksum: Option<String>,
    pub state: FileState,
    /// Valid only while the tape copy exists (Clean, Tombstoned history,
    /// and Migrating sources during relocation).
    pub extent: Option<ExtentRef>,
    /// Relative blob path under the cache root, present while cached.
    pub cache_blob: Option<String>,
    pub mtime: DateTime<Utc>,
    pub atime: DateTime<Utc>,
}

impl FileRecord {
    pub fn new_dirty(path: impl Into<String>, blob: impl Into<String>) -> Self {
        let now = Utc::now();
        FileRecord {
            path: path.into(),
            size: 0,
            checksum: None,
            state: FileState::Dirty,
            extent: None,
            cache_blob: Some(blob.into()),
            mtime: now,
            atime: now,
        }
    }

    pub fn is_live(&self) -> bool {
        !matches!(self.state, FileState::Tombstoned)
    }

    pub fn is_cached(&self) -> bool {
        self.cache_blob.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TapeStatus {
    /// Never formatted; must be formatted before receiving data.
    Blank,
    /// Formatted and empty-ish, ready for use.
    Formatted,
    /// Currently in the drive.
    Mounted,
    /// In a storage slot, carries data.
    Unmounted,
    /// Deletion ratio crossed the reclaim threshold, or a write failed on
    /// this media. Never selected as a migration destination.
    NeedsReclaim,
    /// Removed from service (missing from inventory or operator action).
    Retired,
}

impl TapeStatus {
    pub fn name(&self) -> &'static str {
        match self {
            TapeStatus::Blank => "blank",
            TapeStatus::Formatted => "formatted",
            TapeStatus::Mounted => "mounted",
            TapeStatus::Unmounted => "unmounted",
            TapeStatus::NeedsReclaim => "needs_reclaim",
            TapeStatus::Retired => "retired",
        }
    }

    /// Whether a tape in this status may be chosen to receive migrated data.
    pub fn accepts_migration(&self) -> bool {
        matches!(
            self,
            TapeStatus::Blank | TapeStatus::Formatted | TapeStatus::Mounted | TapeStatus::Unmounted
        )
    }
}

impl std::fmt::Display for TapeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TapeRecord {
    pub id: TapeId,
    /// Storage element the changer reported the cartridge in. None while
    /// the tape is in the drive.
    pub slot: Option<u32>,
    pub status: TapeStatus,
    pub used_bytes: u64,
    pub deleted_bytes: u64,
    pub capacity: u64,
    pub last_seen: DateTime<Utc>,
}

impl TapeRecord {
    pub fn new(id: TapeId, slot: Option<u32>, capacity: u64) -> Self {
        TapeRecord {
            id,
            slot,
            status: TapeStatus::Blank,
            used_bytes: 0,
            deleted_bytes: 0,
            capacity,
            last_seen: Utc::now(),
        }
    }

    pub fn free_bytes(&self) -> u64 {
        self.capacity.saturating_sub(self.used_bytes)
    }

    /// Deleted fraction of total capacity, the defrag trigger metric.
    pub fn deleted_ratio(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.deleted_bytes as f64 / self.capacity as f64
    }

    /// `deleted_bytes <= used_bytes <= capacity` must hold at all times.
    pub fn accounting_ok(&self) -> bool {
        self.deleted_bytes <= self.used_bytes && self.used_bytes <= self.capacity
    }
}
