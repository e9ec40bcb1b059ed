use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt image: {0}")]
    CorruptImage(String),

    #[error("Could not determine backup method for {}", .0.display())]
    UnknownFormat(PathBuf),

    #[error("Non-monotonic write: offset {offset} is behind cursor {cursor}")]
    NonMonotonicWrite { offset: u64, cursor: u64 },

    #[error("Offset {offset} is not aligned to block size {block_size}")]
    Misaligned { offset: u64, block_size: u32 },

    #[error("Volume {name}: {reason}")]
    Volume { name: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl RecoveryError {
    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        RecoveryError::CorruptImage(msg.into())
    }

    pub(crate) fn volume(name: &str, reason: impl Into<String>) -> Self {
        RecoveryError::Volume {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RecoveryError>;
