use crate::cli::ConfigAction;
use crate::config::{get_config_path, load_config, save_config};
use crate::error::{Result, TapeVaultError};

pub fn handle_config_command(action: Option<ConfigAction>) -> Result<()> {
    match action {
        Some(ConfigAction::Path) => {
            let config_path = get_config_path()?;
            println!("Config location: {}", config_path.display());
        }
        None | Some(ConfigAction::Show) => {
            let config_path = get_config_path()?;
            let config = load_config()?;
            println!("Config file: {}", config_path.display());
            println!();
            println!("Current configuration:");
            println!("  Devices:");
            println!("    changer_device: {}", config.devices.get_changer_device());
            println!("    tape_device: {}", config.devices.get_tape_device());
            println!(
                "    device_retry_limit: {}",
                config.devices.get_device_retry_limit()
            );
            println!("  Paths:");
            println!(
                "    mount_point: {}",
                config.paths.get_mount_point().display()
            );
            println!(
                "    staging_dir: {}",
                config.paths.get_staging_dir().display()
            );
            println!(
                "    state_dir: {}",
                config.paths.get_state_dir()?.display()
            );
            println!("  Migration:");
            println!(
                "    cache_size_bytes: {}",
                config.migration.get_cache_size_bytes()
            );
            println!(
                "    write_back_delay: {:?}",
                config.migration.get_write_back_delay()
            );
            println!(
                "    defrag_threshold_percent: {}",
                config.migration.get_defrag_threshold_percent()
            );
            println!(
                "    migration_retry_limit: {}",
                config.migration.get_migration_retry_limit()
            );
            println!(
                "    stage_timeout: {:?}",
                config.migration.get_stage_timeout()
            );
        }
        Some(ConfigAction::Edit) => {
            let config_path = get_config_path()?;
            if !config_path.exists() {
                save_config(&load_config()?)?;
                println!("Created default config at {}", config_path.display());
            }

            let editor = std::env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());
            let status = std::process::Command::new(&editor)
                .arg(&config_path)
                .status()
                .map_err(|e| {
                    TapeVaultError::Config(format!(
                        "Failed to open editor '{}': {}. Set EDITOR environment variable to your preferred editor.",
                        editor, e
                    ))
                })?;

            if !status.success() {
                return Err(TapeVaultError::Config(format!(
                    "Editor '{}' exited with non-zero status",
                    editor
                )));
            }
        }
    }
    Ok(())
}
