use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::backup::{backup_volume_to, mount_for_path};
use crate::context::{BatchOutcome, RecoveryContext};
use crate::detect::detect_method;
use crate::error::RecoveryError;
use crate::formats::sparse::{self, SparseRestoreReport};
use crate::formats::yaffs2::{self, RestoreSummary};
use crate::formats::{fraction, open_target_for_writing, raw, BackupMethod, ImageReader};
use crate::progress::Reporter;
use crate::volume::{MountGuard, Volume};

const PARTIAL_RESTORE_WARNING: &str = "The destination may be left partially restored.";

/// mkfs reports nothing; the bar creeps over this long while it runs.
const FORMAT_EXPECTED: Duration = Duration::from_secs(100);

/// Restore an image onto a volume.
///
/// With no `method`, the image format is detected. yaffs2 images are replayed
/// through a freshly wiped and mounted filesystem; every other format is
/// written straight to the unmounted block device.
pub fn restore_volume(
    ctx: &RecoveryContext<'_>,
    image: &Path,
    volume_name: &str,
    method: Option<BackupMethod>,
    reporter: &Reporter<'_>,
) -> Result<()> {
    if volume_name.is_empty() || image.as_os_str().is_empty() {
        bail!(RecoveryError::InvalidArgument("image and volume are required".into()));
    }
    let volume = lookup(ctx, volume_name)?;
    if let Some(source) = ctx.volumes.get_volume_for_path(image) {
        if source.name == volume.name {
            bail!(RecoveryError::InvalidArgument(format!(
                "image {} is stored on {}, the volume being restored",
                image.display(),
                volume.name
            )));
        }
    }
    let _source_guard = mount_for_path(ctx, image, None)?;

    let method = match method {
        Some(m) => m,
        None => {
            let m = detect_method(image)
                .with_context(|| format!("cannot identify {}", image.display()))?;
            reporter.info(format!("Detected {m}"));
            m
        }
    };
    reporter.info(format!("Restoring {} to {} as {method}...", image.display(), volume.name));

    let result = match method {
        BackupMethod::SequentialLogImage => {
            wipe_volume(ctx, volume, &reporter.scoped(0.0, 0.05))
                .and_then(|()| replay_tree(ctx, image, volume, &reporter.scoped(0.05, 0.95)).map(|_| ()))
        }
        _ => restore_block_image(ctx, image, volume, method, reporter),
    };
    if let Err(ref e) = result {
        reporter.error(format!("restore of {} failed: {e:#}", volume.name));
        reporter.warn(PARTIAL_RESTORE_WARNING);
        return result;
    }
    reporter.progress(1.0);
    reporter.info("> Restore complete.");
    Ok(())
}

fn restore_block_image(
    ctx: &RecoveryContext<'_>,
    image: &Path,
    volume: &Volume,
    method: BackupMethod,
    reporter: &Reporter<'_>,
) -> Result<()> {
    let _guard = MountGuard::unmounted(ctx.volumes, volume)
        .with_context(|| format!("failed to unmount {}", volume.name))?;
    let device = volume.device_path()?;

    match method {
        BackupMethod::Ext4SparseImage => {
            let mut out = open_target_for_writing(device)
                .with_context(|| format!("cannot open {} for writing", device.display()))?;
            let report = sparse::restore_file(image, &mut out, reporter)
                .with_context(|| format!("failed to restore sparse image {}", image.display()))?;
            out.sync_all()?;
            report_sparse(&report, reporter);
        }
        _ => {
            raw::restore(image, device, reporter)
                .with_context(|| format!("failed to write {} to {}", image.display(), device.display()))?;
        }
    }
    Ok(())
}

fn report_sparse(report: &SparseRestoreReport, reporter: &Reporter<'_>) {
    for warning in report.warnings() {
        reporter.warn(warning);
    }
    log::debug!(
        "sparse restore: {} blocks, crc {:08x}",
        report.blocks_written,
        report.checksum
    );
}

/// Replay a yaffs2 image through the mounted filesystem of `volume`.
fn replay_tree(
    ctx: &RecoveryContext<'_>,
    image: &Path,
    volume: &Volume,
    reporter: &Reporter<'_>,
) -> Result<RestoreSummary> {
    let _guard = MountGuard::mounted(ctx.volumes, volume)
        .with_context(|| format!("failed to mount {}", volume.name))?;
    replay_into(image, &volume.mount_point, reporter)
}

fn replay_into(image: &Path, dest: &Path, reporter: &Reporter<'_>) -> Result<RestoreSummary> {
    let mut input = ImageReader::open(image).with_context(|| format!("cannot open {}", image.display()))?;
    let total = input.file_len();
    let summary = yaffs2::restore_tree(&mut input, total, dest, reporter)
        .with_context(|| format!("failed to replay {}", image.display()))?;
    reporter.info(format!(
        "Restored {} files, {} directories, {} symlinks, {} hard links",
        summary.files, summary.directories, summary.symlinks, summary.hard_links
    ));
    Ok(summary)
}

/// Replay a yaffs2 image into an arbitrary directory.
pub fn restore_directory(
    ctx: &RecoveryContext<'_>,
    image: &Path,
    dest: &Path,
    reporter: &Reporter<'_>,
) -> Result<RestoreSummary> {
    if image.as_os_str().is_empty() || dest.as_os_str().is_empty() {
        bail!(RecoveryError::InvalidArgument("image and destination are required".into()));
    }
    let _source_guard = mount_for_path(ctx, image, None)?;
    let _dest_guard = mount_for_path(ctx, dest, None)?;

    let method = detect_method(image)?;
    if method != BackupMethod::SequentialLogImage {
        bail!(RecoveryError::InvalidArgument(format!(
            "{} is a {method}, not a directory image",
            image.display()
        )));
    }
    fs::create_dir_all(dest).with_context(|| format!("failed to create {}", dest.display()))?;
    reporter.info(format!("Restoring {} into {}", image.display(), dest.display()));
    replay_into(image, dest, reporter)
}

/// Format a volume, restoring its mount state afterwards.
pub fn format_volume(
    ctx: &RecoveryContext<'_>,
    volume_name: &str,
    fs_type: Option<&str>,
    reporter: &Reporter<'_>,
) -> Result<()> {
    let volume = lookup(ctx, volume_name)?;
    format_with(ctx, volume, fs_type.unwrap_or(volume.fs_type.as_str()), reporter)
}

fn format_with(ctx: &RecoveryContext<'_>, volume: &Volume, fs_type: &str, reporter: &Reporter<'_>) -> Result<()> {
    if volume.is_virtual {
        bail!(RecoveryError::volume(&volume.name, "virtual volumes cannot be formatted"));
    }
    reporter.info(format!("Formatting {} as {fs_type}...", volume.name));
    let _guard = MountGuard::unmounted(ctx.volumes, volume)
        .with_context(|| format!("failed to unmount {}", volume.name))?;
    reporter.timed(FORMAT_EXPECTED);
    ctx.volumes
        .format(volume, fs_type)
        .with_context(|| format!("failed to format {} as {fs_type}", volume.name))?;
    reporter.progress(1.0);
    Ok(())
}

/// Reformat a volume with its own configured filesystem.
fn wipe_volume(ctx: &RecoveryContext<'_>, volume: &Volume, reporter: &Reporter<'_>) -> Result<()> {
    format_with(ctx, volume, &volume.fs_type, reporter)
}

/// Convert a volume's filesystem by backing it up, reformatting it and
/// replaying the backup.
///
/// The temporary image is deleted on success. If the replay fails it is
/// left in place so the data can still be recovered from it.
pub fn convert_volume(
    ctx: &RecoveryContext<'_>,
    volume_name: &str,
    fs_type: &str,
    reporter: &Reporter<'_>,
) -> Result<()> {
    if fs_type.is_empty() {
        bail!(RecoveryError::InvalidArgument("filesystem type is required".into()));
    }
    let volume = lookup(ctx, volume_name)?;
    let temp = ctx.convert_temp_file.as_path();
    if let Some(temp_volume) = ctx.volumes.get_volume_for_path(temp) {
        if temp_volume.name == volume.name {
            bail!(RecoveryError::InvalidArgument(format!(
                "temporary file {} is on {}, the volume being converted",
                temp.display(),
                volume.name
            )));
        }
    }
    let _temp_guard = mount_for_path(ctx, temp, None)?;
    if let Some(parent) = temp.parent() {
        fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    }
    reporter.info(format!("Converting {} to {fs_type}...", volume.name));

    if let Err(e) = backup_volume_to(
        ctx,
        volume,
        BackupMethod::SequentialLogImage,
        true,
        temp,
        &reporter.scoped(0.0, 0.45),
    ) {
        reporter.error(format!("backup of {} failed, volume left unchanged: {e:#}", volume.name));
        return Err(e);
    }

    if let Err(e) = format_with(ctx, volume, fs_type, &reporter.scoped(0.45, 0.05)) {
        reporter.error(format!("format of {} failed: {e:#}", volume.name));
        remove_temp(temp, reporter);
        return Err(e);
    }

    if let Err(e) = replay_tree(ctx, temp, volume, &reporter.scoped(0.5, 0.5)) {
        reporter.error(format!("restore of {} failed: {e:#}", volume.name));
        reporter.warn(format!("Backup kept at {}", temp.display()));
        return Err(e);
    }

    remove_temp(temp, reporter);
    reporter.progress(1.0);
    reporter.info(format!("> {} converted to {fs_type}.", volume.name));
    Ok(())
}

fn remove_temp(temp: &Path, reporter: &Reporter<'_>) {
    if let Err(e) = fs::remove_file(temp) {
        reporter.warn(format!("failed to delete {}: {e}", temp.display()));
    }
}

/// Reformat every wipe-eligible volume. One failure does not stop the rest.
pub fn wipe_device(ctx: &RecoveryContext<'_>, reporter: &Reporter<'_>) -> Result<BatchOutcome> {
    let targets: Vec<&Volume> = ctx.volumes.volumes().iter().filter(|v| v.wipe).collect();
    if targets.is_empty() {
        bail!(RecoveryError::InvalidArgument("no volumes are marked for wipe".into()));
    }
    reporter.info("Wiping device data...");

    let mut outcome = BatchOutcome::default();
    for (i, volume) in targets.iter().enumerate() {
        let step = reporter.scoped(fraction(i as u64, targets.len() as u64), 1.0 / targets.len() as f32);
        let result = MountGuard::mounted(ctx.volumes, volume)
            .with_context(|| format!("failed to mount {}", volume.name))
            .and_then(|_guard| wipe_volume(ctx, volume, &step));
        if let Err(ref e) = result {
            reporter.error(format!("wipe of {} failed: {e:#}", volume.name));
        }
        outcome.record(&volume.name, result);
    }

    reporter.progress(1.0);
    if outcome.is_complete() {
        reporter.info("> Data wiped successfully.");
    } else {
        reporter.warn("> Data partially wiped. Some user data may still be present on the device.");
    }
    Ok(outcome)
}

fn lookup<'a>(ctx: &RecoveryContext<'a>, name: &str) -> Result<&'a Volume> {
    let volumes = ctx.volumes;
    volumes
        .get_volume(name)
        .ok_or_else(|| RecoveryError::volume(name, "no such volume").into())
}
