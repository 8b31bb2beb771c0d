use crate::catalog::{ExtentRef, TapeId};
use crate::device::{
    ChangerDevice, DriveDevice, DriveStatus, IndexEntry, InventoryReport, SlotInfo, TapeIndex,
    TapeUsage,
};
use crate::error::{Result, TapeVaultError};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

/// In-memory tape library with fault injection. Implements both device
/// capabilities so tests can drive the whole engine without hardware.
#[derive(Default)]
pub struct SimLibrary {
    state: Mutex<SimState>,
}

#[derive(Default)]
struct SimState {
    slots: BTreeMap<u32, TapeId>,
    tapes: HashMap<TapeId, SimTape>,
    in_drive: Option<TapeId>,
    load_count: u64,
    unload_count: u64,
    // fault injection
    load_timeouts: HashMap<TapeId, u32>,
    drive_down: bool,
    fetch_delay: Duration,
    fetch_corruption: u32,
    unload_media_errors: u32,
}

#[derive(Default)]
struct SimTape {
    capacity: u64,
    formatted: bool,
    cursor: u64,
    files: HashMap<String, Vec<u8>>,
    index: TapeIndex,
    media_bad: bool,
}

impl SimLibrary {
    pub fn new() -> Self {
        SimLibrary::default()
    }

    pub fn add_tape(&self, tape: &TapeId, slot: u32, capacity: u64, formatted: bool) {
        let mut state = self.state.lock();
        state.slots.insert(slot, tape.clone());
        state.tapes.insert(
            tape.clone(),
            SimTape {
                capacity,
                formatted,
                cursor: 0,
                files: HashMap::new(),
                index: TapeIndex::new(tape),
                media_bad: false,
            },
        );
    }

    /// Place a file directly on a tape, bypassing the engine. Used to set
    /// up recovery and stage-in scenarios.
    pub fn seed_file(
        &self,
        tape: &TapeId,
        path: &str,
        content: &[u8],
        mtime: chrono::DateTime<chrono::Utc>,
    ) -> ExtentRef {
        use sha2::{Digest, Sha256};

        let mut state = self.state.lock();
        let sim_tape = state.tapes.get_mut(tape).expect("tape exists");
        let offset = sim_tape.cursor;
        let len = content.len() as u64;
        sim_tape.cursor += len;
        sim_tape.files.insert(path.to_string(), content.to_vec());
        sim_tape.index.generation += 1;
        sim_tape.index.entries.push(IndexEntry {
            path: path.to_string(),
            offset,
            len,
            checksum: Some(hex::encode(Sha256::digest(content))),
            mtime,
            dead: false,
        });
        ExtentRef {
            tape: tape.clone(),
            offset,
            len,
        }
    }

    /// Make the next `count` load attempts for `tape` fail with a timeout.
    pub fn inject_load_timeouts(&self, tape: &TapeId, count: u32) {
        self.state.lock().load_timeouts.insert(tape.clone(), count);
    }

    /// All writes to `tape` fail with a media error until cleared.
    pub fn set_media_bad(&self, tape: &TapeId, bad: bool) {
        if let Some(t) = self.state.lock().tapes.get_mut(tape) {
            t.media_bad = bad;
        }
    }

    pub fn set_drive_down(&self, down: bool) {
        self.state.lock().drive_down = down;
    }

    /// Every fetch blocks for `delay` before touching the tape, simulating
    /// a slow seek and transfer.
    pub fn set_fetch_delay(&self, delay: Duration) {
        self.state.lock().fetch_delay = delay;
    }

    /// The next `count` fetches flip the last byte of the content they
    /// deliver, so checksum verification sees a mismatch.
    pub fn inject_fetch_corruption(&self, count: u32) {
        self.state.lock().fetch_corruption = count;
    }

    /// The next `count` unloads eject the cartridge but report a media
    /// error naming it, as a drive does when the eject path jams.
    pub fn inject_unload_media_errors(&self, count: u32) {
        self.state.lock().unload_media_errors = count;
    }

    pub fn load_count(&self) -> u64 {
        self.state.lock().load_count
    }

    pub fn unload_count(&self) -> u64 {
        self.state.lock().unload_count
    }

    pub fn loaded_tape(&self) -> Option<TapeId> {
        self.state.lock().in_drive.clone()
    }

    pub fn tape_file(&self, tape: &TapeId, path: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .tapes
            .get(tape)
            .and_then(|t| t.files.get(path).cloned())
    }

    pub fn tape_index(&self, tape: &TapeId) -> Option<TapeIndex> {
        self.state.lock().tapes.get(tape).map(|t| t.index.clone())
    }

    fn check_drive_up(state: &SimState) -> Result<()> {
        if state.drive_down {
            return Err(TapeVaultError::DeviceTimeout(
                "simulated drive not responding".to_string(),
            ));
        }
        Ok(())
    }
}

impl ChangerDevice for SimLibrary {
    fn inventory(&self) -> Result<InventoryReport> {
        let state = self.state.lock();
        Self::check_drive_up(&state)?;
        Ok(InventoryReport {
            slots: state
                .slots
                .iter()
                .filter(|(_, tape)| Some(*tape) != state.in_drive.as_ref())
                .map(|(slot, tape)| SlotInfo {
                    slot: *slot,
                    tape: tape.clone(),
                })
                .collect(),
            loaded: state.in_drive.clone(),
        })
    }

    fn load(&self, tape: &TapeId) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_drive_up(&state)?;

        if let Some(remaining) = state.load_timeouts.get_mut(tape) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TapeVaultError::DeviceTimeout(format!(
                    "simulated load timeout for {}",
                    tape
                )));
            }
        }

        if state.in_drive.is_some() {
            return Err(TapeVaultError::DeviceUnavailable(
                "drive already loaded".to_string(),
            ));
        }
        if !state.tapes.contains_key(tape) {
            return Err(TapeVaultError::NotFound(format!("tape {}", tape)));
        }

        state.in_drive = Some(tape.clone());
        state.load_count += 1;
        Ok(())
    }

    fn unload(&self) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_drive_up(&state)?;
        if state.unload_media_errors > 0 {
            state.unload_media_errors -= 1;
            // The cartridge still comes out; only the status report is bad.
            let ejected = state.in_drive.take();
            if ejected.is_some() {
                state.unload_count += 1;
            }
            return Err(TapeVaultError::MediaError {
                tape: ejected.map(|t| t.to_string()).unwrap_or_default(),
                detail: "simulated eject error".to_string(),
            });
        }
        if state.in_drive.take().is_some() {
            state.unload_count += 1;
        }
        Ok(())
    }
}

impl DriveDevice for SimLibrary {
    fn status(&self) -> Result<DriveStatus> {
        let state = self.state.lock();
        if state.drive_down {
            return Ok(DriveStatus::Busy);
        }
        Ok(if state.in_drive.is_some() {
            DriveStatus::Loaded
        } else {
            DriveStatus::Empty
        })
    }

    fn fetch(&self, tape_path: &str, dst: &Path) -> Result<u64> {
        // Sleep without the lock so concurrent library calls stay visible.
        let delay = self.state.lock().fetch_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let mut state = self.state.lock();
        Self::check_drive_up(&state)?;
        let tape_id = state
            .in_drive
            .clone()
            .ok_or_else(|| TapeVaultError::DeviceUnavailable("no tape loaded".to_string()))?;
        let tape = &state.tapes[&tape_id];
        if tape.media_bad {
            return Err(TapeVaultError::MediaError {
                tape: tape_id.to_string(),
                detail: "simulated read failure".to_string(),
            });
        }
        let mut content = tape
            .files
            .get(tape_path)
            .ok_or_else(|| TapeVaultError::MediaError {
                tape: tape_id.to_string(),
                detail: format!("extent for {} not readable", tape_path),
            })?
            .clone();
        if state.fetch_corruption > 0 {
            state.fetch_corruption -= 1;
            if let Some(byte) = content.last_mut() {
                *byte ^= 0xFF;
            }
        }
        drop(state);
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(dst, &content)?;
        Ok(content.len() as u64)
    }

    fn store(&self, src: &Path, tape_path: &str) -> Result<ExtentRef> {
        let content = std::fs::read(src)?;
        let mut state = self.state.lock();
        Self::check_drive_up(&state)?;
        let tape_id = state
            .in_drive
            .clone()
            .ok_or_else(|| TapeVaultError::DeviceUnavailable("no tape loaded".to_string()))?;
        let tape = state.tapes.get_mut(&tape_id).expect("loaded tape exists");

        if tape.media_bad {
            return Err(TapeVaultError::MediaError {
                tape: tape_id.to_string(),
                detail: "simulated write failure".to_string(),
            });
        }
        if !tape.formatted {
            return Err(TapeVaultError::MediaError {
                tape: tape_id.to_string(),
                detail: "tape not formatted".to_string(),
            });
        }
        let len = content.len() as u64;
        if tape.cursor + len > tape.capacity {
            return Err(TapeVaultError::CapacityExceeded(format!(
                "tape {} full",
                tape_id
            )));
        }

        let offset = tape.cursor;
        tape.cursor += len;
        tape.files.insert(tape_path.to_string(), content);
        Ok(ExtentRef {
            tape: tape_id,
            offset,
            len,
        })
    }

    fn read_index(&self) -> Result<TapeIndex> {
        let state = self.state.lock();
        Self::check_drive_up(&state)?;
        let tape_id = state
            .in_drive
            .clone()
            .ok_or_else(|| TapeVaultError::DeviceUnavailable("no tape loaded".to_string()))?;
        Ok(state.tapes[&tape_id].index.clone())
    }

    fn write_index(&self, index: &TapeIndex) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_drive_up(&state)?;
        let tape_id = state
            .in_drive
            .clone()
            .ok_or_else(|| TapeVaultError::DeviceUnavailable("no tape loaded".to_string()))?;
        let tape = state.tapes.get_mut(&tape_id).expect("loaded tape exists");
        tape.index = index.clone();
        tape.index.generation += 1;
        Ok(())
    }

    fn usage(&self) -> Result<TapeUsage> {
        let state = self.state.lock();
        Self::check_drive_up(&state)?;
        let tape_id = state
            .in_drive
            .clone()
            .ok_or_else(|| TapeVaultError::DeviceUnavailable("no tape loaded".to_string()))?;
        let tape = &state.tapes[&tape_id];
        Ok(TapeUsage {
            total_bytes: tape.capacity,
            free_bytes: tape.capacity - tape.cursor,
        })
    }

    fn format(&self, volume: &TapeId) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_drive_up(&state)?;
        let tape_id = state
            .in_drive
            .clone()
            .ok_or_else(|| TapeVaultError::DeviceUnavailable("no tape loaded".to_string()))?;
        let tape = state.tapes.get_mut(&tape_id).expect("loaded tape exists");
        tape.files.clear();
        tape.cursor = 0;
        tape.formatted = true;
        tape.index = TapeIndex::new(volume);
        Ok(())
    }

    fn rewind(&self) -> Result<()> {
        Ok(())
    }
}
