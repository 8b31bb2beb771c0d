use crate::error::{Result, TapeVaultError};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_CACHE_SIZE_BYTES: u64 = 100 * 1024 * 1024 * 1024;
const DEFAULT_WRITE_BACK_DELAY_SECS: u64 = 600;
const DEFAULT_DEFRAG_THRESHOLD_PERCENT: u8 = 20;
const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 900;
const DEFAULT_DEVICE_RETRY_LIMIT: u32 = 4;
const DEFAULT_DEVICE_RETRY_BACKOFF_MS: u64 = 2_000;
const DEFAULT_MIGRATION_RETRY_LIMIT: u32 = 3;
const DEFAULT_WRITE_BACK_TICK_MS: u64 = 5_000;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DevicesConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changer_device: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tape_device: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_retry_limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_retry_backoff_ms: Option<u64>,
}

impl DevicesConfig {
    pub fn get_changer_device(&self) -> String {
        self.changer_device
            .clone()
            .unwrap_or_else(|| "/dev/sg1".to_string())
    }

    pub fn get_tape_device(&self) -> String {
        self.tape_device
            .clone()
            .unwrap_or_else(|| "/dev/st0".to_string())
    }

    pub fn get_device_retry_limit(&self) -> u32 {
        self.device_retry_limit.unwrap_or(DEFAULT_DEVICE_RETRY_LIMIT)
    }

    pub fn get_device_retry_backoff(&self) -> Duration {
        Duration::from_millis(
            self.device_retry_backoff_ms
                .unwrap_or(DEFAULT_DEVICE_RETRY_BACKOFF_MS),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PathsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_point: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staging_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<String>,
}

impl PathsConfig {
    pub fn get_mount_point(&self) -> PathBuf {
        PathBuf::from(
            self.mount_point
                .clone()
                .unwrap_or_else(|| "/mnt/tapevault".to_string()),
        )
    }

    pub fn get_staging_dir(&self) -> PathBuf {
        PathBuf::from(
            self.staging_dir
                .clone()
                .unwrap_or_else(|| "/tmp/ltfs_mounts".to_string()),
        )
    }

    pub fn get_state_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.state_dir {
            return Ok(PathBuf::from(dir));
        }
        default_state_dir()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MigrationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_back_delay_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_back_tick_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defrag_threshold_percent: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_retry_limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_timeout_secs: Option<u64>,
}

impl MigrationConfig {
    pub fn get_cache_size_bytes(&self) -> u64 {
        self.cache_size_bytes.unwrap_or(DEFAULT_CACHE_SIZE_BYTES)
    }

    pub fn get_write_back_delay(&self) -> Duration {
        Duration::from_secs(
            self.write_back_delay_secs
                .unwrap_or(DEFAULT_WRITE_BACK_DELAY_SECS),
        )
    }

    pub fn get_write_back_tick(&self) -> Duration {
        Duration::from_millis(self.write_back_tick_ms.unwrap_or(DEFAULT_WRITE_BACK_TICK_MS))
    }

    pub fn get_defrag_threshold_percent(&self) -> u8 {
        self.defrag_threshold_percent
            .unwrap_or(DEFAULT_DEFRAG_THRESHOLD_PERCENT)
    }

    pub fn get_migration_retry_limit(&self) -> u32 {
        self.migration_retry_limit
            .unwrap_or(DEFAULT_MIGRATION_RETRY_LIMIT)
    }

    pub fn get_stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs.unwrap_or(DEFAULT_STAGE_TIMEOUT_SECS))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub devices: DevicesConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub migration: MigrationConfig,
}

pub fn get_config_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("TAPEVAULT_CONFIG_DIR") {
        return Ok(PathBuf::from(dir));
    }
    let proj_dirs = ProjectDirs::from("", "", "tapevault")
        .ok_or_else(|| TapeVaultError::Config("Could not determine config directory".to_string()))?;
    Ok(proj_dirs.config_dir().to_path_buf())
}

pub fn get_config_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join("config.toml"))
}

fn default_state_dir() -> Result<PathBuf> {
    let proj_dirs = ProjectDirs::from("", "", "tapevault")
        .ok_or_else(|| TapeVaultError::Config("Could not determine state directory".to_string()))?;
    Ok(proj_dirs.data_dir().to_path_buf())
}

/// Load configuration from the config file, falling back to defaults when
/// the file does not exist.
pub fn load_config() -> Result<Config> {
    let config_path = get_config_path()?;

    if !config_path.exists() {
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(&config_path)
        .map_err(|e| TapeVaultError::Config(format!("Failed to read config file: {}", e)))?;

    toml::from_str(&content)
        .map_err(|e| TapeVaultError::Config(format!("Failed to parse config file: {}", e)))
}

pub fn save_config(config: &Config) -> Result<()> {
    let config_path = get_config_path()?;

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            TapeVaultError::Config(format!("Failed to create config directory: {}", e))
        })?;
    }

    let content = toml::to_string_pretty(config)
        .map_err(|e| TapeVaultError::Config(format!("Failed to serialize config: {}", e)))?;

    std::fs::write(&config_path, content)
        .map_err(|e| TapeVaultError::Config(format!("Failed to write config file: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(
            config.migration.get_cache_size_bytes(),
            100 * 1024 * 1024 * 1024
        );
        assert_eq!(
            config.migration.get_write_back_delay(),
            Duration::from_secs(600)
        );
        assert_eq!(config.migration.get_defrag_threshold_percent(), 20);
        assert_eq!(config.devices.get_changer_device(), "/dev/sg1");
        assert_eq!(config.devices.get_tape_device(), "/dev/st0");
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [migration]
            write_back_delay_secs = 30
            defrag_threshold_percent = 25

            [devices]
            changer_device = "/dev/sg4"
            "#,
        )
        .unwrap();

        assert_eq!(
            config.migration.get_write_back_delay(),
            Duration::from_secs(30)
        );
        assert_eq!(config.migration.get_defrag_threshold_percent(), 25);
        assert_eq!(config.devices.get_changer_device(), "/dev/sg4");
        // Unset fields fall back to defaults
        assert_eq!(config.devices.get_tape_device(), "/dev/st0");
    }
}
