//! Volume table entries and the mount/format collaborator.

use std::fs::{self, File};
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};

use crate::error::{RecoveryError, Result};

/// One named, mountable partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    #[serde(default)]
    pub device: Option<PathBuf>,
    pub mount_point: PathBuf,
    pub fs_type: String,
    #[serde(default)]
    pub fs_options: Option<String>,
    /// Fallback filesystem tried when mounting with `fs_type` fails.
    #[serde(default)]
    pub fs_type2: Option<String>,
    #[serde(default)]
    pub fs_options2: Option<String>,
    /// Participates in whole-device backup.
    #[serde(default)]
    pub backup: bool,
    /// Participates in whole-device wipe.
    #[serde(default)]
    pub wipe: bool,
    #[serde(default, rename = "virtual")]
    pub is_virtual: bool,
}

impl Volume {
    pub fn device_path(&self) -> Result<&Path> {
        self.device
            .as_deref()
            .ok_or_else(|| RecoveryError::volume(&self.name, "volume has no block device"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FsStats {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

impl FsStats {
    pub fn used_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.free_bytes)
    }
}

/// Access to the volume table and the OS primitives that act on it.
///
/// The engine never mutates the table; it only borrows entries from it.
pub trait VolumeManager {
    fn volumes(&self) -> &[Volume];

    fn get_volume(&self, name: &str) -> Option<&Volume> {
        self.volumes().iter().find(|v| v.name == name)
    }

    /// The volume whose mount point is the longest prefix of `path`.
    fn get_volume_for_path(&self, path: &Path) -> Option<&Volume> {
        self.volumes()
            .iter()
            .filter(|v| path.starts_with(&v.mount_point))
            .max_by_key(|v| v.mount_point.components().count())
    }

    /// Mount the volume. Returns whether it was already mounted.
    fn mount(&self, volume: &Volume) -> Result<bool>;

    /// Unmount the volume. Returns whether it was mounted beforehand.
    fn unmount(&self, volume: &Volume) -> Result<bool>;

    fn is_mounted(&self, volume: &Volume) -> Result<bool>;

    /// Create a fresh filesystem of `fs_type`. The volume must be unmounted.
    fn format(&self, volume: &Volume, fs_type: &str) -> Result<()>;

    fn size_in_bytes(&self, volume: &Volume) -> Result<u64>;

    fn filesystem_stats(&self, volume: &Volume) -> Result<FsStats>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Restore {
    Nothing,
    Unmount,
    Mount,
}

/// Puts a volume into a required mount state and restores the prior state on drop.
pub struct MountGuard<'a> {
    manager: &'a dyn VolumeManager,
    volume: &'a Volume,
    restore: Restore,
}

impl<'a> MountGuard<'a> {
    pub fn mounted(manager: &'a dyn VolumeManager, volume: &'a Volume) -> Result<Self> {
        let was_mounted = manager.mount(volume)?;
        Ok(Self {
            manager,
            volume,
            restore: if was_mounted {
                Restore::Nothing
            } else {
                Restore::Unmount
            },
        })
    }

    pub fn unmounted(manager: &'a dyn VolumeManager, volume: &'a Volume) -> Result<Self> {
        let was_mounted = manager.unmount(volume)?;
        Ok(Self {
            manager,
            volume,
            restore: if was_mounted {
                Restore::Mount
            } else {
                Restore::Nothing
            },
        })
    }
}

impl Drop for MountGuard<'_> {
    fn drop(&mut self) {
        let result = match self.restore {
            Restore::Nothing => return,
            Restore::Unmount => self.manager.unmount(self.volume).map(|_| ()),
            Restore::Mount => self.manager.mount(self.volume).map(|_| ()),
        };
        if let Err(e) = result {
            log::warn!(
                "failed to restore mount state of {}: {e}",
                self.volume.name
            );
        }
    }
}

/// [`VolumeManager`] backed by `/proc/mounts` and the system `mount`, `umount`
/// and `mkfs` commands.
pub struct SystemVolumes {
    volumes: Vec<Volume>,
}

impl SystemVolumes {
    pub fn new(volumes: Vec<Volume>) -> Self {
        Self { volumes }
    }

    fn try_mount(&self, volume: &Volume, device: &Path, fs_type: &str, options: Option<&str>) -> Result<()> {
        let mut cmd = Command::new("mount");
        cmd.arg("-t").arg(fs_type);
        if let Some(opts) = options {
            cmd.arg("-o").arg(opts);
        }
        cmd.arg(device).arg(&volume.mount_point);
        run(&mut cmd, volume, "mount")
    }
}

impl VolumeManager for SystemVolumes {
    fn volumes(&self) -> &[Volume] {
        &self.volumes
    }

    fn mount(&self, volume: &Volume) -> Result<bool> {
        if volume.is_virtual || self.is_mounted(volume)? {
            return Ok(true);
        }
        let device = volume.device_path()?;
        fs::create_dir_all(&volume.mount_point)?;

        match self.try_mount(volume, device, &volume.fs_type, volume.fs_options.as_deref()) {
            Ok(()) => Ok(false),
            Err(primary) => match volume.fs_type2.as_deref() {
                Some(fs2) => {
                    log::debug!("{}: {primary}; trying {fs2}", volume.name);
                    self.try_mount(volume, device, fs2, volume.fs_options2.as_deref())?;
                    Ok(false)
                }
                None => Err(primary),
            },
        }
    }

    fn unmount(&self, volume: &Volume) -> Result<bool> {
        if volume.is_virtual {
            return Err(RecoveryError::volume(&volume.name, "virtual volumes cannot be unmounted"));
        }
        if !self.is_mounted(volume)? {
            return Ok(false);
        }
        run(Command::new("umount").arg(&volume.mount_point), volume, "umount")?;
        Ok(true)
    }

    fn is_mounted(&self, volume: &Volume) -> Result<bool> {
        if volume.is_virtual {
            return Ok(true);
        }
        let table = fs::read_to_string("/proc/mounts")?;
        Ok(table_lists(&table, &volume.mount_point))
    }

    fn format(&self, volume: &Volume, fs_type: &str) -> Result<()> {
        let device = volume.device_path()?;
        run(
            Command::new(format!("mkfs.{fs_type}")).arg(device),
            volume,
            "format",
        )
    }

    fn size_in_bytes(&self, volume: &Volume) -> Result<u64> {
        let mut file = File::open(volume.device_path()?)?;
        Ok(file.seek(SeekFrom::End(0))?)
    }

    fn filesystem_stats(&self, volume: &Volume) -> Result<FsStats> {
        let st = nix::sys::statvfs::statvfs(&volume.mount_point).map_err(std::io::Error::from)?;
        let frag = st.fragment_size() as u64;
        Ok(FsStats {
            total_bytes: st.blocks() as u64 * frag,
            free_bytes: st.blocks_free() as u64 * frag,
        })
    }
}

fn run(cmd: &mut Command, volume: &Volume, what: &str) -> Result<()> {
    let output = cmd.output()?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(RecoveryError::volume(
        &volume.name,
        format!("{what} failed ({}): {}", output.status, stderr.trim()),
    ))
}

/// Mount points listed in a `/proc/mounts` style table.
fn mount_points(table: &str) -> impl Iterator<Item = String> + '_ {
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(|field| field.replace("\\040", " "))
}

fn table_lists(table: &str, mount_point: &Path) -> bool {
    mount_points(table).any(|mp| Path::new(&mp) == mount_point)
}
