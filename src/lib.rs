pub mod backup;
pub mod builder;
pub mod config;
pub mod context;
pub mod detect;
pub mod error;
pub mod formats;
pub mod fs;
pub mod progress;
pub mod restore;
pub mod volume;

pub use context::{BatchOutcome, RecoveryContext};
pub use error::RecoveryError;
pub use formats::BackupMethod;
