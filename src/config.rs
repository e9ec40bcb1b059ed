//! Engine configuration: the volume table plus default paths.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{RecoveryError, Result};
use crate::volume::Volume;

pub const CONFIG_ENV: &str = "RUSTY_RECOVERY_CONFIG";
const SYSTEM_CONFIG: &str = "/etc/rusty-recovery.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default)]
    pub volumes: Vec<Volume>,
    #[serde(default = "default_device_backup_root")]
    pub device_backup_root: PathBuf,
    #[serde(default = "default_convert_temp_file")]
    pub convert_temp_file: PathBuf,
    #[serde(default = "default_block_size")]
    pub block_size: u32,
}

fn default_device_backup_root() -> PathBuf {
    PathBuf::from("/sdcard/backup/device")
}

fn default_convert_temp_file() -> PathBuf {
    PathBuf::from("/sdcard/__convert_temp.img")
}

fn default_block_size() -> u32 {
    4096
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            volumes: Vec::new(),
            device_backup_root: default_device_backup_root(),
            convert_temp_file: default_convert_temp_file(),
            block_size: default_block_size(),
        }
    }
}

impl RecoveryConfig {
    /// Get the user config file path
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("rusty-recovery").join("config.json"))
    }

    /// Load configuration, trying `explicit`, then the environment override,
    /// then the user config directory, then the system-wide file.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from_path(path);
        }
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Self::load_from_path(Path::new(&path));
        }

        let candidates = Self::user_config_path()
            .into_iter()
            .chain(std::iter::once(PathBuf::from(SYSTEM_CONFIG)));
        for path in candidates {
            if path.exists() {
                return Self::load_from_path(&path);
            }
        }
        Err(RecoveryError::Config("no configuration file found".into()))
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: RecoveryConfig = serde_json::from_str(&content)
            .map_err(|e| RecoveryError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        log::debug!(
            "loaded {} volumes from {}",
            config.volumes.len(),
            path.display()
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 || self.block_size % 512 != 0 {
            return Err(RecoveryError::Config(format!(
                "block_size {} is not a non-zero multiple of 512",
                self.block_size
            )));
        }
        let mut seen = HashSet::new();
        for v in &self.volumes {
            if !seen.insert(v.name.as_str()) {
                return Err(RecoveryError::Config(format!("duplicate volume name {}", v.name)));
            }
            if v.device.is_none() && !v.is_virtual {
                return Err(RecoveryError::Config(format!(
                    "volume {} has no device and is not virtual",
                    v.name
                )));
            }
        }
        Ok(())
    }
}
