use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};

use crate::formats::BackupMethod;

/// Output file name for a volume backup, e.g. `system.yimg.gz`.
pub fn backup_file_name(volume_name: &str, method: BackupMethod, compress: bool) -> String {
    format!("{volume_name}.{}", method.file_extension(compress))
}

/// `<root>/YYYYMMDD`, or the first free `<root>/YYYYMMDD.N`.
pub fn device_backup_dir(root: &Path, date: NaiveDate) -> PathBuf {
    unique_path(&root.join(date.format("%Y%m%d").to_string()))
}

/// Device backup folder for today.
pub fn todays_device_backup_dir(root: &Path) -> PathBuf {
    device_backup_dir(root, Local::now().date_naive())
}

/// `base` if it does not exist, else `base.1`, `base.2`, ...
pub fn unique_path(base: &Path) -> PathBuf {
    if !base.exists() {
        return base.to_path_buf();
    }
    let mut n: u32 = 1;
    loop {
        let mut name = base.as_os_str().to_owned();
        name.push(format!(".{n}"));
        let candidate = PathBuf::from(name);
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

/// Create the backup output folder. Returns the path to the created directory.
pub fn create_backup_folder(folder: &Path) -> Result<PathBuf> {
    fs::create_dir_all(folder)
        .with_context(|| format!("failed to create backup folder: {}", folder.display()))?;
    Ok(folder.to_path_buf())
}

/// Deletes a partially written backup file unless [`OutputGuard::keep`] is called.
pub struct OutputGuard(Option<PathBuf>);

impl OutputGuard {
    pub fn new(path: &Path) -> Self {
        Self(Some(path.to_path_buf()))
    }

    pub fn keep(mut self) -> PathBuf {
        self.0.take().unwrap_or_default()
    }
}

impl Drop for OutputGuard {
    fn drop(&mut self) {
        if let Some(ref path) = self.0 {
            let _ = fs::remove_file(path);
        }
    }
}
