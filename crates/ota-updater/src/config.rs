//! Configuration structures for the update engine.
//!
//! Defines the running firmware identity, session limits and the location of
//! persisted update state.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::commit::DEFAULT_COMMIT_STATE_FILE;
use crate::error::UpdateError;
use crate::manifest::FirmwareInfo;

/// Main update configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Identity of the running firmware
    #[serde(default)]
    pub firmware: FirmwareInfo,

    /// Maximum duration of an update session in seconds
    #[serde(default = "default_update_timeout")]
    pub update_timeout_secs: u64,

    /// Skip packages carrying the running version and build id
    #[serde(default = "default_true")]
    pub ignore_same_version: bool,

    /// Where the commit timeout is persisted across the reboot
    #[serde(default = "default_commit_state_file")]
    pub commit_state_file: PathBuf,

    /// Largest manifest accepted, in bytes
    #[serde(default = "default_max_manifest_size")]
    pub max_manifest_size: u64,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            firmware: FirmwareInfo::default(),
            update_timeout_secs: default_update_timeout(),
            ignore_same_version: true,
            commit_state_file: default_commit_state_file(),
            max_manifest_size: default_max_manifest_size(),
            logging: LoggingConfig::default(),
        }
    }
}

impl UpdateConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, UpdateError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| UpdateError::ConfigError(e.to_string()))?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), UpdateError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| UpdateError::ConfigError(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn update_timeout(&self) -> Duration {
        Duration::from_secs(self.update_timeout_secs)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default level filter (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_update_timeout() -> u64 {
    600
}

fn default_commit_state_file() -> PathBuf {
    PathBuf::from(DEFAULT_COMMIT_STATE_FILE)
}

fn default_max_manifest_size() -> u64 {
    64 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = UpdateConfig::default();
        assert_eq!(config.update_timeout_secs, 600);
        assert!(config.ignore_same_version);
        assert_eq!(config.commit_state_file, PathBuf::from("updater.dat"));
        assert_eq!(config.max_manifest_size, 65536);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: UpdateConfig = toml::from_str(
            r#"
            update_timeout_secs = 30

            [firmware]
            platform = "esp32"
            version = "1.0.0"
            build_id = "b1"
            "#,
        )
        .unwrap();
        assert_eq!(config.update_timeout(), Duration::from_secs(30));
        assert_eq!(config.firmware.platform, "esp32");
        assert!(config.ignore_same_version);
        assert_eq!(config.max_manifest_size, 65536);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("conf").join("updater.toml");
        let mut config = UpdateConfig::default();
        config.ignore_same_version = false;
        config.firmware.build_id = "20240101".to_string();
        config.save_to_file(&path).unwrap();

        let loaded = UpdateConfig::load_from_file(&path).unwrap();
        assert!(!loaded.ignore_same_version);
        assert_eq!(loaded.firmware, config.firmware);
    }

    #[test]
    fn test_invalid_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "update_timeout_secs = \"soon\"").unwrap();
        assert!(matches!(
            UpdateConfig::load_from_file(&path),
            Err(UpdateError::ConfigError(_))
        ));
    }
}
