//! End-to-end orchestration tests over a mock volume table: per-volume
//! backup and restore in every method, whole-device batches, wipe, format
//! and filesystem conversion.
//!
//! Run with: cargo test --test orchestrator_e2e

mod common;

use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use common::{ext_block_used, ext_device, populate_tree, vol, MockVolumes, DEVICE_SIZE, EXT_BLOCK};
use rusty_recovery::backup::{backup_device, backup_volume};
use rusty_recovery::config::RecoveryConfig;
use rusty_recovery::progress::{LogLevel, ProgressSink, Reporter, SharedProgress};
use rusty_recovery::restore::{convert_volume, format_volume, restore_directory, restore_volume, wipe_device};
use rusty_recovery::volume::VolumeManager;
use rusty_recovery::{BackupMethod, RecoveryContext, RecoveryError};
use tempfile::TempDir;

fn patterned_device(magic_at: Option<(usize, [u8; 2])>) -> Vec<u8> {
    let mut bytes = vec![0u8; DEVICE_SIZE as usize];
    for (i, b) in bytes[8192..20000].iter_mut().enumerate() {
        *b = (i % 241) as u8 + 1;
    }
    if let Some((offset, magic)) = magic_at {
        bytes[offset..offset + 2].copy_from_slice(&magic);
    }
    bytes
}

fn zero_device(path: &Path) {
    fs::write(path, vec![0u8; DEVICE_SIZE as usize]).unwrap();
}

fn is_invalid_argument(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<RecoveryError>(),
        Some(RecoveryError::InvalidArgument(_))
    )
}

// ============================================================================
// Test Group A: single volume backup and restore
// ============================================================================

#[test]
fn test_yaffs2_volume_round_trip_restores_mount_state() {
    let volumes = MockVolumes::new(&[vol("data", true, true)]);
    let config = RecoveryConfig::default();
    let ctx = RecoveryContext::new(&volumes, &config);
    populate_tree(&volumes.mount_dir("data"));
    let dest = TempDir::new().unwrap();

    let image = backup_volume(
        &ctx,
        "data",
        BackupMethod::SequentialLogImage,
        true,
        dest.path(),
        &Reporter::silent(),
    )
    .unwrap();
    assert!(image.exists());
    assert!(!volumes.mounted_now("data"));

    volumes.set_mounted("data");
    fs::write(volumes.mount_dir("data").join("stale.txt"), b"old").unwrap();

    let shared = SharedProgress::new();
    restore_volume(&ctx, &image, "data", None, &Reporter::new(Some(&shared))).unwrap();

    let mnt = volumes.mount_dir("data");
    assert!(!mnt.join("stale.txt").exists());
    assert_eq!(fs::read(mnt.join("hello.txt")).unwrap(), b"Hello, yaffs2!");
    assert_eq!(fs::read(mnt.join("subdir/big.bin")).unwrap().len(), 5000);
    assert!(fs::symlink_metadata(mnt.join("link.txt")).unwrap().file_type().is_symlink());
    assert_eq!(*volumes.formats.lock().unwrap(), vec![("data".to_string(), "ext4".to_string())]);
    assert!(volumes.mounted_now("data"));
    assert!((shared.fraction() - 1.0).abs() < 1e-6);

    let messages = shared.drain_messages();
    assert!(messages.iter().any(|m| m.message.starts_with("Detected")));
    assert!(messages.iter().any(|m| m.message == "> Restore complete."));
}

#[test]
fn test_raw_dump_round_trip() {
    let volumes = MockVolumes::new(&[vol("boot", false, false)]);
    let config = RecoveryConfig::default();
    let ctx = RecoveryContext::new(&volumes, &config);
    let original = patterned_device(Some((510, [0x55, 0xAA])));
    fs::write(volumes.device("boot"), &original).unwrap();
    let dest = TempDir::new().unwrap();

    let image = backup_volume(&ctx, "boot", BackupMethod::RawDump, true, dest.path(), &Reporter::silent()).unwrap();
    zero_device(&volumes.device("boot"));
    restore_volume(&ctx, &image, "boot", None, &Reporter::silent()).unwrap();

    assert_eq!(fs::read(volumes.device("boot")).unwrap(), original);
    assert!(volumes.formats.lock().unwrap().is_empty());
}

#[test]
fn test_flat_ext4_image_round_trip() {
    let volumes = MockVolumes::new(&[vol("system", true, false)]);
    let config = RecoveryConfig::default();
    let ctx = RecoveryContext::new(&volumes, &config);
    let original = ext_device();
    fs::write(volumes.device("system"), &original).unwrap();
    let dest = TempDir::new().unwrap();

    let image = backup_volume(&ctx, "system", BackupMethod::Ext4Image, false, dest.path(), &Reporter::silent()).unwrap();
    assert_eq!(fs::metadata(&image).unwrap().len(), DEVICE_SIZE);
    zero_device(&volumes.device("system"));
    restore_volume(&ctx, &image, "system", None, &Reporter::silent()).unwrap();

    assert_eq!(fs::read(volumes.device("system")).unwrap(), original);
}

#[test]
fn test_sparse_image_round_trip_restores_unmounted() {
    let volumes = MockVolumes::new(&[vol("system", true, false)]);
    let config = RecoveryConfig::default();
    let ctx = RecoveryContext::new(&volumes, &config);
    let original = ext_device();
    fs::write(volumes.device("system"), &original).unwrap();
    let dest = TempDir::new().unwrap();

    let image = backup_volume(
        &ctx,
        "system",
        BackupMethod::Ext4SparseImage,
        true,
        dest.path(),
        &Reporter::silent(),
    )
    .unwrap();
    assert!(fs::metadata(&image).unwrap().len() < DEVICE_SIZE);

    // old contents everywhere, so only copied blocks change
    fs::write(volumes.device("system"), vec![0xEEu8; DEVICE_SIZE as usize]).unwrap();
    volumes.set_mounted("system");
    let shared = SharedProgress::new();
    restore_volume(&ctx, &image, "system", None, &Reporter::new(Some(&shared))).unwrap();

    let restored = fs::read(volumes.device("system")).unwrap();
    let sink_block = config.block_size as usize;
    let per_sink = sink_block / EXT_BLOCK;
    for (i, (got, want)) in restored.chunks(sink_block).zip(original.chunks(sink_block)).enumerate() {
        if (i * per_sink..(i + 1) * per_sink).any(ext_block_used) {
            assert_eq!(got, want, "allocated block {i}");
        } else {
            assert!(got.iter().all(|&b| b == 0xEE), "free block {i} was written");
        }
    }
    assert!(restored[30 * EXT_BLOCK..31 * EXT_BLOCK].iter().all(|&b| b == 0));
    assert!(volumes.mounted_now("system"));
    let messages = shared.drain_messages();
    assert!(!messages.iter().any(|m| m.level == LogLevel::Warning));
}

#[test]
fn test_restore_rejects_image_on_target_volume() {
    let volumes = MockVolumes::new(&[vol("data", true, true)]);
    let config = RecoveryConfig::default();
    let ctx = RecoveryContext::new(&volumes, &config);
    let image = volumes.mount_dir("data").join("data.img");
    fs::write(&image, patterned_device(Some((510, [0x55, 0xAA])))).unwrap();

    let err = restore_volume(&ctx, &image, "data", None, &Reporter::silent()).unwrap_err();
    assert!(is_invalid_argument(&err));
    assert!(fs::read(volumes.device("data")).unwrap().iter().all(|&b| b == 0));
}

#[test]
fn test_restore_unknown_volume_fails() {
    let volumes = MockVolumes::new(&[vol("data", true, true)]);
    let config = RecoveryConfig::default();
    let ctx = RecoveryContext::new(&volumes, &config);
    let dest = TempDir::new().unwrap();
    let image = dest.path().join("x.img");
    fs::write(&image, patterned_device(Some((510, [0x55, 0xAA])))).unwrap();

    assert!(restore_volume(&ctx, &image, "cache", None, &Reporter::silent()).is_err());
    assert!(backup_volume(&ctx, "", BackupMethod::RawDump, false, dest.path(), &Reporter::silent()).is_err());
}

// ============================================================================
// Test Group B: whole-device operations
// ============================================================================

#[test]
fn test_device_backup_partial_failure() {
    let volumes = MockVolumes::new(&[
        vol("a", true, false),
        vol("b", true, false),
        vol("c", true, false),
        vol("sdcard", false, false),
    ])
    .failing_mount("b");
    let config = RecoveryConfig::default();
    let ctx = RecoveryContext::new(&volumes, &config);
    populate_tree(&volumes.mount_dir("a"));
    fs::write(volumes.mount_dir("c").join("notes.txt"), b"c volume").unwrap();
    let dest = volumes.mount_dir("sdcard").join("backup");

    let shared = SharedProgress::new();
    let (dir, outcome) = backup_device(&ctx, Some(&dest), true, &Reporter::new(Some(&shared))).unwrap();

    assert_eq!(dir, dest);
    assert_eq!(outcome.succeeded, vec!["a".to_string(), "c".to_string()]);
    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(outcome.failed[0].0, "b");
    assert!(!outcome.is_complete());

    assert!(dest.join("a.yimg.gz").exists());
    assert!(dest.join("c.yimg.gz").exists());
    assert!(!dest.join("b.yimg.gz").exists());
    assert!(!volumes.mounted_now("sdcard"));
    assert!(!volumes.mounted_now("a"));
    assert!((shared.fraction() - 1.0).abs() < 1e-4);

    let messages = shared.drain_messages();
    assert!(messages
        .iter()
        .any(|m| m.level == LogLevel::Warning && m.message.starts_with("> Device backup partially completed")));
}

#[test]
fn test_device_backup_rejects_destination_on_eligible_volume() {
    let volumes = MockVolumes::new(&[vol("a", true, false), vol("b", true, false)]);
    let config = RecoveryConfig::default();
    let ctx = RecoveryContext::new(&volumes, &config);
    let dest = volumes.mount_dir("a").join("backup");

    let err = backup_device(&ctx, Some(&dest), true, &Reporter::silent()).unwrap_err();
    assert!(is_invalid_argument(&err));
    assert!(!dest.exists());
}

#[test]
fn test_device_backups_on_one_day_get_separate_folders() {
    let volumes = MockVolumes::new(&[vol("data", true, false), vol("sdcard", false, false)]);
    populate_tree(&volumes.mount_dir("data"));
    let volumes = volumes.hiding_unmounted();
    let config = RecoveryConfig {
        device_backup_root: volumes.mount_dir("sdcard").join("backup"),
        ..RecoveryConfig::default()
    };
    let ctx = RecoveryContext::new(&volumes, &config);

    let (first, outcome) = backup_device(&ctx, None, false, &Reporter::silent()).unwrap();
    assert!(outcome.is_complete());
    let (second, outcome) = backup_device(&ctx, None, false, &Reporter::silent()).unwrap();
    assert!(outcome.is_complete());

    let mut expected = first.clone().into_os_string();
    expected.push(".1");
    assert_eq!(second.into_os_string(), expected);
    assert!(!volumes.mounted_now("sdcard"));

    let sdcard = volumes.vol("sdcard");
    volumes.mount(sdcard).unwrap();
    assert!(first.join("data.yimg").exists());
    assert!(Path::new(&expected).join("data.yimg").exists());
}

#[test]
fn test_volume_backup_skips_backup_folder_inside_source() {
    let volumes = MockVolumes::new(&[vol("data", true, false)]);
    let config = RecoveryConfig::default();
    let ctx = RecoveryContext::new(&volumes, &config);
    let mnt = volumes.mount_dir("data");
    populate_tree(&mnt);
    let dest = mnt.join("backups");
    fs::create_dir(&dest).unwrap();
    fs::write(dest.join("data.yimg.old"), vec![7u8; 3000]).unwrap();

    let image = backup_volume(
        &ctx,
        "data",
        BackupMethod::SequentialLogImage,
        false,
        &dest,
        &Reporter::silent(),
    )
    .unwrap();

    let out = TempDir::new().unwrap();
    let replayed = out.path().join("replayed");
    restore_directory(&ctx, &image, &replayed, &Reporter::silent()).unwrap();
    assert!(replayed.join("hello.txt").exists());
    assert!(!replayed.join("backups").exists());
}

#[test]
fn test_device_backup_with_nothing_eligible_fails() {
    let volumes = MockVolumes::new(&[vol("sdcard", false, false)]);
    let config = RecoveryConfig::default();
    let ctx = RecoveryContext::new(&volumes, &config);
    let dest = TempDir::new().unwrap();

    let err = backup_device(&ctx, Some(dest.path()), false, &Reporter::silent()).unwrap_err();
    assert!(is_invalid_argument(&err));
}

#[test]
fn test_wipe_device_partial() {
    let volumes = MockVolumes::new(&[vol("a", false, true), vol("b", false, true), vol("sdcard", false, false)])
        .failing_format("b");
    let config = RecoveryConfig::default();
    let ctx = RecoveryContext::new(&volumes, &config);
    fs::write(volumes.mount_dir("a").join("secret"), b"x").unwrap();
    fs::write(volumes.mount_dir("sdcard").join("keep"), b"y").unwrap();

    let shared = SharedProgress::new();
    let outcome = wipe_device(&ctx, &Reporter::new(Some(&shared))).unwrap();

    assert_eq!(outcome.succeeded, vec!["a".to_string()]);
    assert_eq!(outcome.failed[0].0, "b");
    assert!(!volumes.mount_dir("a").join("secret").exists());
    assert!(volumes.mount_dir("sdcard").join("keep").exists());
    assert!(!volumes.mounted_now("a"));

    let messages = shared.drain_messages();
    assert!(messages.iter().any(|m| m.level == LogLevel::Warning
        && m.message == "> Data partially wiped. Some user data may still be present on the device."));
}

#[test]
fn test_wipe_device_success_message() {
    let volumes = MockVolumes::new(&[vol("a", false, true), vol("b", false, true)]);
    let config = RecoveryConfig::default();
    let ctx = RecoveryContext::new(&volumes, &config);

    let shared = SharedProgress::new();
    let outcome = wipe_device(&ctx, &Reporter::new(Some(&shared))).unwrap();

    assert!(outcome.is_complete());
    assert_eq!(volumes.formats.lock().unwrap().len(), 2);
    let messages = shared.drain_messages();
    assert!(messages.iter().any(|m| m.message == "> Data wiped successfully."));
}

// ============================================================================
// Test Group C: format and convert
// ============================================================================

#[test]
fn test_format_volume_keeps_mount_state() {
    let volumes = MockVolumes::new(&[vol("cache", false, true)]);
    let config = RecoveryConfig::default();
    let ctx = RecoveryContext::new(&volumes, &config);
    fs::write(volumes.mount_dir("cache").join("junk"), b"z").unwrap();
    volumes.set_mounted("cache");

    format_volume(&ctx, "cache", None, &Reporter::silent()).unwrap();
    format_volume(&ctx, "cache", Some("vfat"), &Reporter::silent()).unwrap();

    assert_eq!(
        *volumes.formats.lock().unwrap(),
        vec![
            ("cache".to_string(), "ext4".to_string()),
            ("cache".to_string(), "vfat".to_string())
        ]
    );
    assert!(!volumes.mount_dir("cache").join("junk").exists());
    assert!(volumes.mounted_now("cache"));
}

#[derive(Default)]
struct Recorder {
    timed: Mutex<Vec<(f32, f32)>>,
    busy: Mutex<Vec<bool>>,
    last: Mutex<f32>,
}

impl ProgressSink for Recorder {
    fn message(&self, _level: LogLevel, _text: &str) {}

    fn set_progress(&self, fraction: f32) {
        *self.last.lock().unwrap() = fraction;
    }

    fn set_indeterminate(&self, on: bool) {
        self.busy.lock().unwrap().push(on);
    }

    fn show_progress(&self, from: f32, span: f32, _expected: Duration) {
        self.timed.lock().unwrap().push((from, span));
    }
}

#[test]
fn test_format_volume_hints_timed_progress() {
    let volumes = MockVolumes::new(&[vol("cache", false, true)]);
    let config = RecoveryConfig::default();
    let ctx = RecoveryContext::new(&volumes, &config);

    let recorder = Recorder::default();
    let reporter = Reporter::new(Some(&recorder)).scoped(0.5, 0.5);
    format_volume(&ctx, "cache", None, &reporter).unwrap();

    assert_eq!(*recorder.timed.lock().unwrap(), vec![(0.5, 0.5)]);
    assert!((*recorder.last.lock().unwrap() - 1.0).abs() < 1e-6);
}

#[test]
fn test_device_backup_marks_usage_scan_busy() {
    let volumes = MockVolumes::new(&[vol("data", true, false), vol("sdcard", false, false)]);
    let config = RecoveryConfig::default();
    let ctx = RecoveryContext::new(&volumes, &config);
    let dest = volumes.mount_dir("sdcard").join("backup");

    let recorder = Recorder::default();
    backup_device(&ctx, Some(&dest), false, &Reporter::new(Some(&recorder))).unwrap();
    assert_eq!(*recorder.busy.lock().unwrap(), vec![true, false]);
}

#[test]
fn test_convert_volume_keeps_contents() {
    let volumes = MockVolumes::new(&[vol("data", true, true), vol("sdcard", false, false)]);
    let config = RecoveryConfig::default();
    let mut ctx = RecoveryContext::new(&volumes, &config);
    let temp = volumes.mount_dir("sdcard").join("tmp/__convert_temp.img");
    ctx.convert_temp_file = temp.clone();
    populate_tree(&volumes.mount_dir("data"));

    let shared = SharedProgress::new();
    convert_volume(&ctx, "data", "f2fs", &Reporter::new(Some(&shared))).unwrap();

    assert_eq!(*volumes.formats.lock().unwrap(), vec![("data".to_string(), "f2fs".to_string())]);
    let mnt = volumes.mount_dir("data");
    assert_eq!(fs::read(mnt.join("hello.txt")).unwrap(), b"Hello, yaffs2!");
    assert_eq!(fs::read(mnt.join("twin.bin")).unwrap().len(), 5000);
    assert!(!temp.exists());
    assert!(!volumes.mounted_now("data"));
    assert!(!volumes.mounted_now("sdcard"));
    assert!((shared.fraction() - 1.0).abs() < 1e-6);
}

#[test]
fn test_convert_volume_format_failure_removes_temp() {
    let volumes =
        MockVolumes::new(&[vol("data", true, true), vol("sdcard", false, false)]).failing_format("data");
    let config = RecoveryConfig::default();
    let mut ctx = RecoveryContext::new(&volumes, &config);
    let temp = volumes.mount_dir("sdcard").join("__convert_temp.img");
    ctx.convert_temp_file = temp.clone();
    populate_tree(&volumes.mount_dir("data"));

    assert!(convert_volume(&ctx, "data", "f2fs", &Reporter::silent()).is_err());
    assert!(!temp.exists());
    assert!(volumes.mount_dir("data").join("hello.txt").exists());
}

#[test]
fn test_convert_volume_rejects_temp_on_same_volume() {
    let volumes = MockVolumes::new(&[vol("data", true, true)]);
    let config = RecoveryConfig::default();
    let mut ctx = RecoveryContext::new(&volumes, &config);
    ctx.convert_temp_file = volumes.mount_dir("data").join("__convert_temp.img");

    let err = convert_volume(&ctx, "data", "f2fs", &Reporter::silent()).unwrap_err();
    assert!(is_invalid_argument(&err));
    let err = convert_volume(&ctx, "data", "", &Reporter::silent()).unwrap_err();
    assert!(is_invalid_argument(&err));
    assert!(volumes.formats.lock().unwrap().is_empty());
}
