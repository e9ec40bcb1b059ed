use std::path::PathBuf;

use crate::builder::{BlockCopyBuilder, ImageBuilder};
use crate::config::RecoveryConfig;
use crate::volume::VolumeManager;

/// Collaborators and settings shared by every backup and restore operation.
pub struct RecoveryContext<'a> {
    pub volumes: &'a dyn VolumeManager,
    pub builder: &'a dyn ImageBuilder,
    pub block_size: u32,
    pub device_backup_root: PathBuf,
    pub convert_temp_file: PathBuf,
}

static DEFAULT_BUILDER: BlockCopyBuilder = BlockCopyBuilder;

impl<'a> RecoveryContext<'a> {
    pub fn new(volumes: &'a dyn VolumeManager, config: &RecoveryConfig) -> Self {
        Self {
            volumes,
            builder: &DEFAULT_BUILDER,
            block_size: config.block_size,
            device_backup_root: config.device_backup_root.clone(),
            convert_temp_file: config.convert_temp_file.clone(),
        }
    }

    pub fn with_builder(mut self, builder: &'a dyn ImageBuilder) -> Self {
        self.builder = builder;
        self
    }
}

/// Result of an operation over several volumes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl BatchOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub(crate) fn record(&mut self, name: &str, result: anyhow::Result<()>) {
        match result {
            Ok(()) => self.succeeded.push(name.to_string()),
            Err(e) => self.failed.push((name.to_string(), format!("{e:#}"))),
        }
    }
}
