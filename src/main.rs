use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::LevelFilter;

use rusty_recovery::config::RecoveryConfig;
use rusty_recovery::progress::{ProgressState, Reporter, SharedProgress};
use rusty_recovery::volume::{SystemVolumes, VolumeManager};
use rusty_recovery::{backup, detect, restore, BackupMethod, BatchOutcome, RecoveryContext};

#[derive(Parser, Debug)]
#[command(author, version = env!("APP_VERSION"), about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List configured volumes
    Volumes,
    /// Identify the format of an image file
    Detect { image: PathBuf },
    /// Back up one volume
    Backup {
        volume: String,
        /// ext4, sparse, raw or yaffs2
        #[arg(short, long, default_value = "yaffs2")]
        method: BackupMethod,
        #[arg(short = 'z', long)]
        compress: bool,
        #[arg(short, long)]
        dest: PathBuf,
    },
    /// Back up all backup-eligible volumes
    BackupDevice {
        #[arg(short, long)]
        dest: Option<PathBuf>,
        #[arg(long)]
        no_compress: bool,
    },
    /// Back up a directory as a yaffs2 image
    BackupDir {
        source: PathBuf,
        output: PathBuf,
        #[arg(short = 'z', long)]
        compress: bool,
    },
    /// Restore an image onto a volume
    Restore {
        image: PathBuf,
        volume: String,
        /// Skip detection and use this method
        #[arg(short, long)]
        method: Option<BackupMethod>,
    },
    /// Restore a yaffs2 image into a directory
    RestoreDir { image: PathBuf, dest: PathBuf },
    /// Change a volume's filesystem, keeping its contents
    Convert { volume: String, fs_type: String },
    /// Format a volume
    Format {
        volume: String,
        fs_type: Option<String>,
    },
    /// Format every wipe-eligible volume
    Wipe,
    Mount { volume: String },
    Unmount { volume: String },
}

const TICK: Duration = Duration::from_millis(100);
const SPINNER: [char; 4] = ['|', '/', '-', '\\'];

/// Draws a spinner or whole percent on one stderr line.
fn render(state: &mut ProgressState, last: &mut String) {
    // already printed through the logger
    state.log_messages.clear();
    let line = if state.indeterminate {
        SPINNER[state.animation_frame as usize % SPINNER.len()].to_string()
    } else {
        format!("{:3}%", (state.fraction * 100.0) as i32)
    };
    if line != *last {
        eprint!("\r{line}");
        let _ = std::io::stderr().flush();
        *last = line;
    }
}

fn main() {
    pretty_env_logger::formatted_builder()
        .filter_level(LevelFilter::Info)
        .parse_env("RUST_LOG")
        .init();

    match run(Args::parse()) {
        Ok(true) => {}
        Ok(false) => std::process::exit(2),
        Err(e) => {
            log::error!("{e:#}");
            std::process::exit(1);
        }
    }
}

/// Returns `false` when a multi-volume operation only partially succeeded.
fn run(args: Args) -> Result<bool> {
    if !nix::unistd::geteuid().is_root() {
        log::warn!("not running as root; mounting and device access may fail");
    }
    let config = RecoveryConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    let volumes = SystemVolumes::new(config.volumes.clone());
    let ctx = RecoveryContext::new(&volumes, &config);
    let progress = SharedProgress::new();
    let reporter = Reporter::new(Some(&progress));
    let mut last = String::new();
    let _ticker = progress.start_ticker(TICK, move |state| render(state, &mut last));

    match args.command {
        Command::Volumes => {
            for v in volumes.volumes() {
                let device = v.device.as_deref().map(|d| d.display().to_string());
                println!(
                    "{:<12} {:<24} {:<16} {:<6} backup={} wipe={}",
                    v.name,
                    device.as_deref().unwrap_or("-"),
                    v.mount_point.display(),
                    v.fs_type,
                    v.backup,
                    v.wipe
                );
            }
        }
        Command::Detect { image } => {
            let method = detect::detect_method(&image)?;
            println!("{}: {method}", image.display());
        }
        Command::Backup {
            volume,
            method,
            compress,
            dest,
        } => {
            let output = backup::backup_volume(&ctx, &volume, method, compress, &dest, &reporter)?;
            println!("{}", output.display());
        }
        Command::BackupDevice { dest, no_compress } => {
            let (dir, outcome) = backup::backup_device(&ctx, dest.as_deref(), !no_compress, &reporter)?;
            println!("{}", dir.display());
            return Ok(report_outcome(&outcome));
        }
        Command::BackupDir {
            source,
            output,
            compress,
        } => {
            backup::backup_directory(&ctx, &source, &output, compress, &reporter)?;
        }
        Command::Restore {
            image,
            volume,
            method,
        } => restore::restore_volume(&ctx, &image, &volume, method, &reporter)?,
        Command::RestoreDir { image, dest } => {
            restore::restore_directory(&ctx, &image, &dest, &reporter)?;
        }
        Command::Convert { volume, fs_type } => {
            restore::convert_volume(&ctx, &volume, &fs_type, &reporter)?
        }
        Command::Format { volume, fs_type } => {
            restore::format_volume(&ctx, &volume, fs_type.as_deref(), &reporter)?
        }
        Command::Wipe => {
            let outcome = restore::wipe_device(&ctx, &reporter)?;
            return Ok(report_outcome(&outcome));
        }
        Command::Mount { volume } => {
            let v = lookup(&volumes, &volume)?;
            if volumes.mount(v)? {
                log::info!("{volume} is already mounted");
            }
        }
        Command::Unmount { volume } => {
            let v = lookup(&volumes, &volume)?;
            if !volumes.unmount(v)? {
                log::info!("{volume} was not mounted");
            }
        }
    }
    Ok(true)
}

fn lookup<'a>(volumes: &'a SystemVolumes, name: &str) -> Result<&'a rusty_recovery::volume::Volume> {
    volumes
        .get_volume(name)
        .with_context(|| format!("no such volume: {name}"))
}

fn report_outcome(outcome: &BatchOutcome) -> bool {
    for (name, reason) in &outcome.failed {
        log::error!("{name}: {reason}");
    }
    outcome.is_complete()
}
