use crate::config::Config;
use crate::device::MtxLibrary;
use crate::engine::Engine;
use crate::error::Result;
use std::sync::Arc;

/// Run the engine against the real library until interrupted. Write-back
/// and defrag run in the background; the namespace is served to callers of
/// the library API.
pub async fn run_serve(config: &Config) -> Result<()> {
    let library = Arc::new(MtxLibrary::new(
        &config.devices.get_changer_device(),
        &config.devices.get_tape_device(),
        &config.paths.get_staging_dir(),
    ));

    let mut engine = Engine::start(config, library.clone(), library).await?;
    engine.spawn_background(config);
    tracing::info!("tapevault serving; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .map_err(crate::error::TapeVaultError::Io)?;
    tracing::info!("Interrupt received, shutting down");

    engine.shutdown().await
}
