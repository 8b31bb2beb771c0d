use crate::config::Config;
use crate::device::MtxLibrary;
use crate::engine::Engine;
use crate::error::Result;
use std::sync::Arc;

/// Operator-requested full reindex: scan every tape's embedded index and
/// rebuild the catalog from it.
pub async fn run_reindex(config: &Config) -> Result<()> {
    let library = Arc::new(MtxLibrary::new(
        &config.devices.get_changer_device(),
        &config.devices.get_tape_device(),
        &config.paths.get_staging_dir(),
    ));

    let engine = Engine::start(config, library.clone(), library).await?;
    let summary = engine.reindex().await?;

    println!(
        "Reindexed {} files from {} tapes ({} conflicts, {} tapes retired)",
        summary.files_indexed, summary.tapes_scanned, summary.conflicts, summary.tapes_retired
    );
    engine.shutdown().await
}
