use crate::catalog::{load_catalog, FileState};
use crate::config::Config;
use crate::error::Result;

/// Offline status view over the persisted catalog snapshot. Does not touch
/// the changer or drive, so it is safe while the engine is running.
pub fn show_status(config: &Config, json: bool) -> Result<()> {
    let state_dir = config.paths.get_state_dir()?;
    let Some(catalog) = load_catalog(&state_dir)? else {
        println!("No catalog snapshot at {}", state_dir.display());
        println!("Run `tapevault reindex` to build one from tape.");
        return Ok(());
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&catalog.contents())?);
        return Ok(());
    }

    let contents = catalog.contents();

    println!("Files: {} total", contents.files.len());
    for state in [
        FileState::Dirty,
        FileState::Eligible,
        FileState::Migrating,
        FileState::Clean,
        FileState::Tombstoned,
        FileState::Unrecoverable,
    ] {
        let count = contents
            .files
            .values()
            .filter(|r| r.state == state)
            .count();
        if count > 0 {
            println!("  {}: {}", state, count);
        }
    }

    let mut tapes: Vec<_> = contents.tapes.values().collect();
    tapes.sort_by(|a, b| a.id.cmp(&b.id));
    println!();
    println!("Tapes: {}", tapes.len());
    for tape in tapes {
        println!(
            "  {} [{}] slot={} used={} deleted={} ({:.1}%) capacity={}",
            tape.id,
            tape.status,
            tape.slot
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".to_string()),
            tape.used_bytes,
            tape.deleted_bytes,
            tape.deleted_ratio() * 100.0,
            tape.capacity,
        );
    }

    if !contents.history.is_empty() {
        println!();
        println!("History entries: {}", contents.history.len());
    }

    Ok(())
}
