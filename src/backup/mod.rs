pub mod format;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::builder::FlatImageWriter;
use crate::context::{BatchOutcome, RecoveryContext};
use crate::error::RecoveryError;
use crate::formats::sparse::SparseImageFile;
use crate::formats::yaffs2::{self, EncodeProgress};
use crate::formats::{raw, BackupMethod, ImageWriter};
use crate::progress::{format_size, ProgressScope, Reporter};
use crate::volume::{MountGuard, Volume};
use format::{backup_file_name, create_backup_folder, todays_device_backup_dir, OutputGuard};

/// Back up one volume into `dest_dir`. Returns the path of the image written.
pub fn backup_volume(
    ctx: &RecoveryContext<'_>,
    volume_name: &str,
    method: BackupMethod,
    compress: bool,
    dest_dir: &Path,
    reporter: &Reporter<'_>,
) -> Result<PathBuf> {
    if volume_name.is_empty() {
        return Err(RecoveryError::InvalidArgument("volume name is empty".into()).into());
    }
    let volume = ctx
        .volumes
        .get_volume(volume_name)
        .ok_or_else(|| RecoveryError::volume(volume_name, "no such volume"))?;

    let _dest_guard = mount_for_path(ctx, dest_dir, Some(volume))?;
    create_backup_folder(dest_dir)?;
    let output = dest_dir.join(backup_file_name(&volume.name, method, compress));

    backup_volume_to(ctx, volume, method, compress, &output, reporter)?;
    Ok(output)
}

/// Back up `volume` into the file `output`. The output's volume must already be mounted.
pub(crate) fn backup_volume_to(
    ctx: &RecoveryContext<'_>,
    volume: &Volume,
    method: BackupMethod,
    compress: bool,
    output: &Path,
    reporter: &Reporter<'_>,
) -> Result<()> {
    reporter.info(format!("Backing up {} as {method}...", volume.name));
    let _source_guard = MountGuard::mounted(ctx.volumes, volume)
        .with_context(|| format!("failed to mount {}", volume.name))?;

    let guard = OutputGuard::new(output);
    match method {
        BackupMethod::SequentialLogImage => {
            // a backup folder inside the source stays out of the image, older backups included
            let exclude = match output.parent() {
                Some(dir) if dir.starts_with(&volume.mount_point) && dir != volume.mount_point => dir,
                _ => output,
            };
            log::debug!("{}: excluding {}", volume.name, exclude.display());
            let writer = ImageWriter::create(output, compress)
                .with_context(|| format!("failed to create {}", output.display()))?;
            let (writer, progress) = yaffs2::encode_tree(&volume.mount_point, writer, Some(exclude), reporter)
                .with_context(|| format!("failed to encode {}", volume.mount_point.display()))?;
            writer.finish()?.sync_all()?;
            log_encode_summary(reporter, &progress);
        }
        BackupMethod::RawDump => {
            let size = ctx.volumes.size_in_bytes(volume)?;
            raw::dump(volume.device_path()?, size, output, compress, reporter)
                .with_context(|| format!("failed to dump {}", volume.name))?;
        }
        BackupMethod::Ext4Image => {
            let size = ctx.volumes.size_in_bytes(volume)?;
            let writer = ImageWriter::create(output, compress)
                .with_context(|| format!("failed to create {}", output.display()))?;
            let mut sink = FlatImageWriter::new(writer, ctx.block_size);
            ctx.builder
                .build(volume, size, &mut sink, reporter)
                .with_context(|| format!("failed to build image of {}", volume.name))?;
            sink.finish()?.finish()?.sync_all()?;
        }
        BackupMethod::Ext4SparseImage => {
            let size = ctx.volumes.size_in_bytes(volume)?;
            let mut file = SparseImageFile::create(output, ctx.block_size, size, compress)
                .with_context(|| format!("failed to create {}", output.display()))?;
            ctx.builder
                .build(volume, size, file.writer(), reporter)
                .with_context(|| format!("failed to build sparse image of {}", volume.name))?;
            let header = file.close()?;
            log::debug!(
                "{}: {} sparse chunks over {} blocks",
                volume.name,
                header.total_chunks,
                header.total_blks
            );
        }
    }
    let output = guard.keep();
    reporter.progress(1.0);
    reporter.info(format!("> Backup complete: {}", output.display()));
    Ok(())
}

fn log_encode_summary(reporter: &Reporter<'_>, progress: &EncodeProgress) {
    log::debug!(
        "encoded {} objects in {} units",
        progress.processed_objects,
        progress.units_written
    );
    reporter.info(format!(
        "Wrote {} objects, {} of file data",
        progress.processed_objects,
        format_size(progress.data_bytes)
    ));
}

/// Back up every backup-eligible volume as yaffs2 images.
///
/// Progress is split by each volume's used bytes. A failing volume is
/// recorded and the rest still run.
pub fn backup_device(
    ctx: &RecoveryContext<'_>,
    dest_dir: Option<&Path>,
    compress: bool,
    reporter: &Reporter<'_>,
) -> Result<(PathBuf, BatchOutcome)> {
    let eligible: Vec<&Volume> = ctx.volumes.volumes().iter().filter(|v| v.backup).collect();
    if eligible.is_empty() {
        bail!(RecoveryError::InvalidArgument("no volumes are marked for backup".into()));
    }
    let root = dest_dir.unwrap_or(ctx.device_backup_root.as_path());
    if let Some(dest) = ctx.volumes.get_volume_for_path(root) {
        if eligible.iter().any(|v| v.name == dest.name) {
            bail!(RecoveryError::InvalidArgument(format!(
                "destination {} is on volume {}, which is being backed up",
                root.display(),
                dest.name
            )));
        }
    }

    // the dated folder is only unique once earlier backups are visible
    let _dest_guard = mount_for_path(ctx, root, None)?;
    let dest_dir = match dest_dir {
        Some(d) => d.to_path_buf(),
        None => todays_device_backup_dir(root),
    };
    create_backup_folder(&dest_dir)?;
    reporter.info(format!("Backing up device to {}", dest_dir.display()));

    reporter.indeterminate(true);
    let used: Vec<u64> = eligible.iter().map(|v| used_bytes(ctx, v, reporter)).collect();
    reporter.indeterminate(false);
    let scopes = weighted_scopes(reporter.scope(), &used);

    let mut outcome = BatchOutcome::default();
    for (volume, scope) in eligible.iter().zip(scopes) {
        let output = dest_dir.join(backup_file_name(
            &volume.name,
            BackupMethod::SequentialLogImage,
            compress,
        ));
        let result = backup_volume_to(
            ctx,
            volume,
            BackupMethod::SequentialLogImage,
            compress,
            &output,
            &reporter.with_scope(scope),
        );
        if let Err(ref e) = result {
            reporter.error(format!("backup of {} failed: {e:#}", volume.name));
        }
        outcome.record(&volume.name, result);
    }

    if outcome.is_complete() {
        reporter.info("> Device backup completed successfully.");
    } else {
        reporter.warn(format!(
            "> Device backup partially completed: {} of {} volumes failed.",
            outcome.failed.len(),
            eligible.len()
        ));
    }
    Ok((dest_dir, outcome))
}

fn used_bytes(ctx: &RecoveryContext<'_>, volume: &Volume, reporter: &Reporter<'_>) -> u64 {
    let stats = MountGuard::mounted(ctx.volumes, volume).and_then(|_guard| ctx.volumes.filesystem_stats(volume));
    match stats {
        Ok(s) => s.used_bytes(),
        Err(e) => {
            reporter.warn(format!("cannot read usage of {}: {e}", volume.name));
            0
        }
    }
}

/// Split `outer` into consecutive scopes proportional to `weights`.
///
/// All-zero weights split evenly.
pub fn weighted_scopes(outer: ProgressScope, weights: &[u64]) -> Vec<ProgressScope> {
    let total: u64 = weights.iter().sum();
    let count = weights.len().max(1) as f64;
    let mut start = 0.0f64;
    weights
        .iter()
        .map(|&w| {
            let size = if total == 0 {
                1.0 / count
            } else {
                w as f64 / total as f64
            };
            let scope = outer.nest(start as f32, size as f32);
            start += size;
            scope
        })
        .collect()
}

/// Back up an arbitrary directory as a yaffs2 image file.
pub fn backup_directory(
    ctx: &RecoveryContext<'_>,
    source: &Path,
    output: &Path,
    compress: bool,
    reporter: &Reporter<'_>,
) -> Result<EncodeProgress> {
    if source.as_os_str().is_empty() || output.as_os_str().is_empty() {
        return Err(RecoveryError::InvalidArgument("source and output are required".into()).into());
    }
    let _source_guard = mount_for_path(ctx, source, None)?;
    let _dest_guard = mount_for_path(ctx, output, None)?;

    let source = fs::canonicalize(source)
        .with_context(|| format!("cannot resolve {}", source.display()))?;
    let parent = output.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    create_backup_folder(parent)?;
    let parent = fs::canonicalize(parent)?;
    if parent.starts_with(&source) {
        return Err(RecoveryError::InvalidArgument(format!(
            "output {} is inside the source directory {}",
            output.display(),
            source.display()
        ))
        .into());
    }

    reporter.info(format!("Backing up {} to {}", source.display(), output.display()));
    let guard = OutputGuard::new(output);
    let writer = ImageWriter::create(output, compress)
        .with_context(|| format!("failed to create {}", output.display()))?;
    let (writer, progress) = yaffs2::encode_tree(&source, writer, None, reporter)?;
    writer.finish()?.sync_all()?;
    guard.keep();
    log_encode_summary(reporter, &progress);
    Ok(progress)
}

/// Mount the managed volume holding `path`, if any, unless it is `except`.
pub(crate) fn mount_for_path<'a>(
    ctx: &RecoveryContext<'a>,
    path: &Path,
    except: Option<&Volume>,
) -> Result<Option<MountGuard<'a>>> {
    let volumes = ctx.volumes;
    let Some(volume) = volumes.get_volume_for_path(path) else {
        return Ok(None);
    };
    if except.is_some_and(|e| e.name == volume.name) {
        return Ok(None);
    }
    let guard = MountGuard::mounted(volumes, volume)
        .with_context(|| format!("failed to mount {} for {}", volume.name, path.display()))?;
    Ok(Some(guard))
}
