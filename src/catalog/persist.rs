use crate::catalog::store::{Catalog, CatalogContents};
use crate::error::{Result, TapeVaultError};
use fs2::FileExt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

pub fn catalog_path(state_dir: &Path) -> PathBuf {
    state_dir.join("catalog.json")
}

/// Load the persisted catalog.
///
/// Returns `Ok(None)` when no snapshot exists (fresh install, or the store
/// was wiped); the caller treats that as a recovery trigger, not an error.
/// An unreadable or unparsable snapshot is reported as `CatalogCorruption`,
/// which also routes into recovery.
pub fn load_catalog(state_dir: &Path) -> Result<Option<Catalog>> {
    let path = catalog_path(state_dir);

    if !path.exists() {
        return Ok(None);
    }

    let file = OpenOptions::new()
        .read(true)
        .open(&path)
        .map_err(|e| TapeVaultError::CatalogCorruption(format!("Failed to open catalog: {}", e)))?;

    file.try_lock_shared()
        .map_err(|e| TapeVaultError::CatalogCorruption(format!("Failed to lock catalog: {}", e)))?;

    let content = std::fs::read_to_string(&path)
        .map_err(|e| TapeVaultError::CatalogCorruption(format!("Failed to read catalog: {}", e)));

    if let Err(e) = file.unlock() {
        tracing::warn!("Failed to release catalog read lock: {}", e);
    }

    let contents: CatalogContents = serde_json::from_str(&content?)
        .map_err(|e| TapeVaultError::CatalogCorruption(format!("Failed to parse catalog: {}", e)))?;

    Ok(Some(Catalog::from_contents(contents)))
}

/// Persist a catalog snapshot. Written to a temp file and renamed into
/// place so a crash mid-write never leaves a torn snapshot behind.
pub fn save_catalog(catalog: &Catalog, state_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(state_dir)?;

    let path = catalog_path(state_dir);
    let tmp_path = state_dir.join("catalog.json.tmp");

    let content = serde_json::to_string_pretty(&catalog.contents())?;
    std::fs::write(&tmp_path, &content)?;

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)?;
    file.try_lock_exclusive()
        .map_err(|e| TapeVaultError::Io(std::io::Error::other(format!(
            "Failed to acquire catalog write lock: {}",
            e
        ))))?;

    let rename_result = std::fs::rename(&tmp_path, &path);

    if let Err(e) = file.unlock() {
        tracing::warn!("Failed to release catalog write lock: {}", e);
    }

    rename_result?;
    Ok(())
}
