//! In-memory volume table over a temp directory.
//!
//! Each volume's "device" is a regular file under `dev/` and its mount point
//! a directory under `mnt/`. Mounting only flips a flag; formatting zeroes
//! the device and empties the mount directory, the way mkfs would.
//!
//! With [`MockVolumes::hiding_unmounted`] an unmounted volume's files are
//! parked under `store/`, so its mount point shows an empty directory.

#![allow(dead_code)]

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusty_recovery::error::{RecoveryError, Result};
use rusty_recovery::volume::{FsStats, Volume, VolumeManager};
use tempfile::TempDir;

pub const DEVICE_SIZE: u64 = 64 * 1024;

pub struct MockVolumes {
    pub root: TempDir,
    volumes: Vec<Volume>,
    mounted: Mutex<HashSet<String>>,
    fail_mount: HashSet<String>,
    fail_format: HashSet<String>,
    hide_unmounted: bool,
    pub formats: Mutex<Vec<(String, String)>>,
}

pub struct Spec<'a> {
    pub name: &'a str,
    pub backup: bool,
    pub wipe: bool,
}

pub fn vol(name: &str, backup: bool, wipe: bool) -> Spec<'_> {
    Spec { name, backup, wipe }
}

impl MockVolumes {
    pub fn new(specs: &[Spec<'_>]) -> Self {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("dev")).unwrap();
        let volumes = specs
            .iter()
            .map(|s| {
                let device = root.path().join("dev").join(s.name);
                fs::write(&device, vec![0u8; DEVICE_SIZE as usize]).unwrap();
                let mount_point = root.path().join("mnt").join(s.name);
                fs::create_dir_all(&mount_point).unwrap();
                Volume {
                    name: s.name.to_string(),
                    device: Some(device),
                    mount_point,
                    fs_type: "ext4".into(),
                    fs_options: None,
                    fs_type2: None,
                    fs_options2: None,
                    backup: s.backup,
                    wipe: s.wipe,
                    is_virtual: false,
                }
            })
            .collect();
        Self {
            root,
            volumes,
            mounted: Mutex::new(HashSet::new()),
            fail_mount: HashSet::new(),
            fail_format: HashSet::new(),
            hide_unmounted: false,
            formats: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_mount(mut self, name: &str) -> Self {
        self.fail_mount.insert(name.to_string());
        self
    }

    pub fn failing_format(mut self, name: &str) -> Self {
        self.fail_format.insert(name.to_string());
        self
    }

    /// Park the files of every currently unmounted volume out of sight.
    pub fn hiding_unmounted(mut self) -> Self {
        fs::create_dir_all(self.root.path().join("store")).unwrap();
        for v in &self.volumes {
            if !self.mounted_now(&v.name) {
                self.park(v);
            }
        }
        self.hide_unmounted = true;
        self
    }

    fn store_dir(&self, volume: &Volume) -> PathBuf {
        self.root.path().join("store").join(&volume.name)
    }

    fn park(&self, volume: &Volume) {
        fs::rename(&volume.mount_point, self.store_dir(volume)).unwrap();
        fs::create_dir(&volume.mount_point).unwrap();
    }

    fn unpark(&self, volume: &Volume) {
        fs::remove_dir(&volume.mount_point).unwrap();
        fs::rename(self.store_dir(volume), &volume.mount_point).unwrap();
    }

    pub fn vol(&self, name: &str) -> &Volume {
        self.get_volume(name).unwrap()
    }

    pub fn mount_dir(&self, name: &str) -> PathBuf {
        self.vol(name).mount_point.clone()
    }

    pub fn device(&self, name: &str) -> PathBuf {
        self.vol(name).device.clone().unwrap()
    }

    pub fn mounted_now(&self, name: &str) -> bool {
        self.mounted.lock().unwrap().contains(name)
    }

    pub fn set_mounted(&self, name: &str) {
        self.mounted.lock().unwrap().insert(name.to_string());
    }
}

fn dir_size(path: &Path) -> u64 {
    let mut total = 0;
    if let Ok(entries) = fs::read_dir(path) {
        for e in entries.flatten() {
            let meta = fs::symlink_metadata(e.path()).unwrap();
            total += if meta.is_dir() { dir_size(&e.path()) } else { meta.len() };
        }
    }
    total
}

impl VolumeManager for MockVolumes {
    fn volumes(&self) -> &[Volume] {
        &self.volumes
    }

    fn mount(&self, volume: &Volume) -> Result<bool> {
        if self.fail_mount.contains(&volume.name) {
            return Err(RecoveryError::Volume {
                name: volume.name.clone(),
                reason: "mount failed".into(),
            });
        }
        let newly = self.mounted.lock().unwrap().insert(volume.name.clone());
        if newly && self.hide_unmounted {
            self.unpark(volume);
        }
        Ok(!newly)
    }

    fn unmount(&self, volume: &Volume) -> Result<bool> {
        let was = self.mounted.lock().unwrap().remove(&volume.name);
        if was && self.hide_unmounted {
            self.park(volume);
        }
        Ok(was)
    }

    fn is_mounted(&self, volume: &Volume) -> Result<bool> {
        Ok(self.mounted_now(&volume.name))
    }

    fn format(&self, volume: &Volume, fs_type: &str) -> Result<()> {
        if self.fail_format.contains(&volume.name) {
            return Err(RecoveryError::Volume {
                name: volume.name.clone(),
                reason: "mkfs failed".into(),
            });
        }
        if self.mounted_now(&volume.name) {
            return Err(RecoveryError::Volume {
                name: volume.name.clone(),
                reason: "cannot format a mounted volume".into(),
            });
        }
        self.formats
            .lock()
            .unwrap()
            .push((volume.name.clone(), fs_type.to_string()));
        fs::write(volume.device.as_ref().unwrap(), vec![0u8; DEVICE_SIZE as usize])?;
        for entry in fs::read_dir(&volume.mount_point)? {
            let path = entry?.path();
            if fs::symlink_metadata(&path)?.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    fn size_in_bytes(&self, volume: &Volume) -> Result<u64> {
        Ok(fs::metadata(volume.device.as_ref().unwrap())?.len())
    }

    fn filesystem_stats(&self, volume: &Volume) -> Result<FsStats> {
        let total = DEVICE_SIZE * 1024;
        Ok(FsStats {
            total_bytes: total,
            free_bytes: total.saturating_sub(dir_size(&volume.mount_point)),
        })
    }
}

/// A small tree with a subdirectory, a symlink and a hard link pair.
pub fn populate_tree(dir: &Path) {
    use std::os::unix::fs::PermissionsExt;

    fs::write(dir.join("hello.txt"), b"Hello, yaffs2!").unwrap();
    fs::set_permissions(dir.join("hello.txt"), fs::Permissions::from_mode(0o640)).unwrap();
    fs::create_dir(dir.join("subdir")).unwrap();
    let big: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    fs::write(dir.join("subdir/big.bin"), &big).unwrap();
    fs::write(dir.join("subdir/empty"), b"").unwrap();
    std::os::unix::fs::symlink("hello.txt", dir.join("link.txt")).unwrap();
    fs::hard_link(dir.join("subdir/big.bin"), dir.join("twin.bin")).unwrap();
}

/// 1 KiB blocks of the [`ext_device`] image.
pub const EXT_BLOCK: usize = 1024;

/// Allocated block runs `[start, end)` of [`ext_device`]. Block 30 is
/// allocated but holds only zeros.
pub const EXT_USED: &[(usize, usize)] = &[(0, 4), (8, 20), (30, 31)];

/// A minimal ext image filling the device: 64 blocks in one group, group
/// descriptors in block 2, block bitmap in block 3.
pub fn ext_device() -> Vec<u8> {
    let mut bytes = vec![0u8; DEVICE_SIZE as usize];
    {
        let sb = &mut bytes[1024..2048];
        sb[0x04..0x08].copy_from_slice(&64u32.to_le_bytes());
        sb[0x14..0x18].copy_from_slice(&1u32.to_le_bytes());
        sb[0x20..0x24].copy_from_slice(&8192u32.to_le_bytes());
        sb[0x38..0x3A].copy_from_slice(&0xEF53u16.to_le_bytes());
    }
    bytes[2 * EXT_BLOCK..2 * EXT_BLOCK + 4].copy_from_slice(&3u32.to_le_bytes());
    for &(start, end) in EXT_USED {
        for block in start.max(1)..end {
            let bit = block - 1;
            bytes[3 * EXT_BLOCK + bit / 8] |= 1 << (bit % 8);
        }
    }
    for (i, b) in bytes[8 * EXT_BLOCK..20 * EXT_BLOCK].iter_mut().enumerate() {
        *b = (i % 241) as u8 + 1;
    }
    bytes
}

pub fn ext_block_used(block: usize) -> bool {
    EXT_USED.iter().any(|&(start, end)| (start..end).contains(&block))
}
