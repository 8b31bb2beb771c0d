use crate::catalog::{ExtentRef, TapeId};
use crate::device::{
    ChangerDevice, DriveDevice, DriveStatus, IndexEntry, InventoryReport, SlotInfo, TapeIndex,
    TapeUsage,
};
use crate::error::{Result, TapeVaultError};
use parking_lot::Mutex;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Command;

const INDEX_FILE: &str = ".tapevault/index.json";

/// Real library driver: `mtx` for the changer, `ltfs` for drive I/O.
///
/// A loaded tape is made ready by mounting its LTFS volume under the
/// staging base; drive reads and writes go through that mount. The
/// scheduler guarantees load/unload never overlaps drive I/O, so the only
/// state carried here is which volume is currently mounted.
pub struct MtxLibrary {
    changer_device: String,
    tape_device: String,
    staging_base: PathBuf,
    mounted: Mutex<Option<MountedVolume>>,
}

struct MountedVolume {
    tape: TapeId,
    mount_point: PathBuf,
}

impl MtxLibrary {
    pub fn new(changer_device: &str, tape_device: &str, staging_base: &Path) -> Self {
        MtxLibrary {
            changer_device: changer_device.to_string(),
            tape_device: tape_device.to_string(),
            staging_base: staging_base.to_path_buf(),
            mounted: Mutex::new(None),
        }
    }

    fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        tracing::debug!("Running command: {} {}", program, args.join(" "));
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| TapeVaultError::DeviceUnavailable(format!("{}: {}", program, e)))?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).to_string());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        tracing::error!("Command failed: {} {}: {}", program, args.join(" "), stderr);
        Err(classify_device_error(program, &stderr))
    }

    fn mount_point_for(&self, tape: &TapeId) -> PathBuf {
        self.staging_base.join(tape.as_str())
    }

    fn current_mount(&self) -> Result<(TapeId, PathBuf)> {
        self.mounted
            .lock()
            .as_ref()
            .map(|m| (m.tape.clone(), m.mount_point.clone()))
            .ok_or_else(|| TapeVaultError::DeviceUnavailable("no tape mounted".to_string()))
    }
}

/// Map tool failures onto the error taxonomy. `mtx` and `ltfs` report
/// contention and hardware trouble only through exit status and stderr
/// text, so this is necessarily heuristic.
fn classify_device_error(program: &str, stderr: &str) -> TapeVaultError {
    let lowered = stderr.to_lowercase();
    if lowered.contains("busy") || lowered.contains("timeout") || lowered.contains("not ready") {
        TapeVaultError::DeviceTimeout(format!("{}: {}", program, stderr.trim()))
    } else if lowered.contains("medium error") || lowered.contains("write error") {
        TapeVaultError::MediaError {
            tape: "<loaded>".to_string(),
            detail: stderr.trim().to_string(),
        }
    } else {
        TapeVaultError::DeviceUnavailable(format!("{}: {}", program, stderr.trim()))
    }
}

/// Parse `mtx status` output into an inventory report.
///
/// Lines of interest:
///   `Data Transfer Element 0:Full (Storage Element 4 Loaded):VolumeTag = VT0004`
///   `Storage Element 1:Full :VolumeTag=VT0001`
/// IMPORT/EXPORT elements are ignored.
pub fn parse_mtx_status(output: &str) -> InventoryReport {
    let drive_re = Regex::new(r"Data Transfer Element \d+:Full.*VolumeTag\s*=\s*(\S+)")
        .expect("static regex");
    let slot_re =
        Regex::new(r"Storage Element (\d+):Full.*VolumeTag\s*=\s*(\S+)").expect("static regex");

    let mut report = InventoryReport::default();

    for line in output.lines() {
        let line = line.trim();
        if line.contains("IMPORT/EXPORT") {
            continue;
        }
        if let Some(caps) = drive_re.captures(line) {
            report.loaded = Some(TapeId::new(&caps[1]));
            continue;
        }
        if let Some(caps) = slot_re.captures(line) {
            if let Ok(slot) = caps[1].parse::<u32>() {
                report.slots.push(SlotInfo {
                    slot,
                    tape: TapeId::new(&caps[2]),
                });
            }
        }
    }

    report
}

impl ChangerDevice for MtxLibrary {
    fn inventory(&self) -> Result<InventoryReport> {
        let output = self.run("mtx", &["-f", &self.changer_device, "status"])?;
        Ok(parse_mtx_status(&output))
    }

    fn load(&self, tape: &TapeId) -> Result<()> {
        let report = self.inventory()?;

        if report.loaded.as_ref() == Some(tape) {
            tracing::debug!("Tape {} already in the drive", tape);
        } else {
            if report.loaded.is_some() {
                self.unload()?;
            }
            let slot = report.slot_of(tape).ok_or_else(|| {
                TapeVaultError::NotFound(format!("tape {} not present in any slot", tape))
            })?;
            tracing::info!("Loading tape {} from slot {}", tape, slot);
            self.run(
                "mtx",
                &["-f", &self.changer_device, "load", &slot.to_string(), "0"],
            )?;
        }

        let mount_point = self.mount_point_for(tape);
        std::fs::create_dir_all(&mount_point)?;
        tracing::info!("Mounting LTFS volume {} at {:?}", tape, mount_point);
        self.run(
            "ltfs",
            &[
                "-o",
                &format!("devname={}", self.tape_device),
                mount_point.to_str().ok_or_else(|| {
                    TapeVaultError::Config("staging path is not valid UTF-8".to_string())
                })?,
            ],
        )?;

        *self.mounted.lock() = Some(MountedVolume {
            tape: tape.clone(),
            mount_point,
        });
        Ok(())
    }

    fn unload(&self) -> Result<()> {
        if let Some(mounted) = self.mounted.lock().take() {
            tracing::info!("Unmounting LTFS volume {}", mounted.tape);
            let mp = mounted.mount_point.to_string_lossy().to_string();
            if self.run("umount", &[&mp]).is_err() {
                self.run("fusermount", &["-u", &mp])?;
            }
        }
        tracing::info!("Unloading drive");
        self.run("mtx", &["-f", &self.changer_device, "unload"])?;
        Ok(())
    }
}

impl DriveDevice for MtxLibrary {
    fn status(&self) -> Result<DriveStatus> {
        if self.mounted.lock().is_some() {
            Ok(DriveStatus::Loaded)
        } else {
            Ok(DriveStatus::Empty)
        }
    }

    fn fetch(&self, tape_path: &str, dst: &Path) -> Result<u64> {
        let (_, mount_point) = self.current_mount()?;
        let src = mount_point.join(tape_path);
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = std::fs::copy(&src, dst)?;
        Ok(bytes)
    }

    fn store(&self, src: &Path, tape_path: &str) -> Result<ExtentRef> {
        let (tape, mount_point) = self.current_mount()?;
        let usage_before = self.usage()?;
        let dst = mount_point.join(tape_path);
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let len = std::fs::copy(src, &dst)?;

        // LTFS hides physical block addresses; the logical offset is the
        // tape's used byte count before this append.
        Ok(ExtentRef {
            tape,
            offset: usage_before.total_bytes - usage_before.free_bytes,
            len,
        })
    }

    fn read_index(&self) -> Result<TapeIndex> {
        let (tape, mount_point) = self.current_mount()?;
        let index_path = mount_point.join(INDEX_FILE);

        if index_path.exists() {
            let content = std::fs::read_to_string(&index_path)?;
            return Ok(serde_json::from_str(&content)?);
        }

        // Foreign or pre-existing LTFS volume: synthesize an index from the
        // filesystem, the way the first inventory pass always has.
        tracing::info!("Tape {} carries no index file, walking volume", tape);
        let mut index = TapeIndex::new(&tape);
        let mut offset = 0u64;
        walk_volume(&mount_point, &mount_point, &mut |rel, meta| {
            let len = meta.len();
            let mtime = meta
                .modified()
                .map(chrono::DateTime::<chrono::Utc>::from)
                .unwrap_or_else(|_| chrono::Utc::now());
            index.entries.push(IndexEntry {
                path: rel.to_string(),
                offset,
                len,
                checksum: None,
                mtime,
                dead: false,
            });
            offset += len;
        })?;
        Ok(index)
    }

    fn write_index(&self, index: &TapeIndex) -> Result<()> {
        let (_, mount_point) = self.current_mount()?;
        let index_path = mount_point.join(INDEX_FILE);
        if let Some(parent) = index_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&index_path, serde_json::to_string_pretty(index)?)?;
        Ok(())
    }

    fn usage(&self) -> Result<TapeUsage> {
        let (_, mount_point) = self.current_mount()?;
        let output = self.run(
            "df",
            &[
                "-B1",
                "--output=size,avail",
                &mount_point.to_string_lossy(),
            ],
        )?;
        parse_df_output(&output)
    }

    fn format(&self, volume: &TapeId) -> Result<()> {
        let (_, mount_point) = self.current_mount()?;
        let mp = mount_point.to_string_lossy().to_string();
        tracing::info!("Reformatting tape {}", volume);
        if self.run("umount", &[&mp]).is_err() {
            self.run("fusermount", &["-u", &mp])?;
        }
        self.run(
            "mkltfs",
            &[
                "-d",
                &self.tape_device,
                "-n",
                volume.as_str(),
                "-f",
            ],
        )?;
        self.run(
            "ltfs",
            &["-o", &format!("devname={}", self.tape_device), &mp],
        )?;
        Ok(())
    }

    fn rewind(&self) -> Result<()> {
        self.run("mt", &["-f", &self.tape_device, "rewind"])?;
        Ok(())
    }
}

fn parse_df_output(output: &str) -> Result<TapeUsage> {
    // Header line, then one data line: "  size  avail"
    let line = output
        .lines()
        .nth(1)
        .ok_or_else(|| TapeVaultError::DeviceUnavailable("unexpected df output".to_string()))?;
    let mut fields = line.split_whitespace();
    let total: u64 = fields
        .next()
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| TapeVaultError::DeviceUnavailable("unexpected df output".to_string()))?;
    let free: u64 = fields
        .next()
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| TapeVaultError::DeviceUnavailable("unexpected df output".to_string()))?;
    Ok(TapeUsage {
        total_bytes: total,
        free_bytes: free,
    })
}

fn walk_volume(
    root: &Path,
    dir: &Path,
    visit: &mut dyn FnMut(&str, &std::fs::Metadata),
) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let meta = entry.metadata()?;
        if meta.is_dir() {
            walk_volume(root, &path, visit)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            let rel = rel.to_string_lossy();
            if rel.starts_with(".tapevault") {
                continue;
            }
            visit(&rel, &meta);
        }
    }
    Ok(())
}
