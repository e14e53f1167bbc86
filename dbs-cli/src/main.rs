use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

/// Reference CLI for the Direct Block Store library. Every subcommand takes
/// the backing object's path first; this binary carries no on-device logic
/// of its own, it only calls into `dbs-core`'s Management/Query/Block APIs.
#[derive(Parser)]
#[command(name = "dbs")]
struct Cli {
    /// Path to the backing file or block device.
    device: PathBuf,

    /// Open the backing object without O_DIRECT (needed on filesystems that
    /// reject it, e.g. tmpfs/overlay).
    #[arg(long)]
    no_direct_io: bool,

    /// Force debug-level logging, equivalent to RUST_LOG=debug.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
#[command(rename_all = "snake_case")]
enum Command {
    GetDeviceInfo,
    GetVolumeInfo,
    GetSnapshotInfo { volume: String },
    InitDevice,
    VacuumDevice,
    CreateVolume { name: String, size: u64 },
    RenameVolume { name: String, new_name: String },
    CreateSnapshot { name: String },
    CloneSnapshot { new_name: String, snapshot_id: u16 },
    DeleteVolume { name: String },
    DeleteSnapshot { snapshot_id: u16 },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        std::env::set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    let path = cli.device.as_path();
    let direct_io = !cli.no_direct_io;

    match cli.command {
        Command::GetDeviceInfo => {
            let info = dbs_core::device_info(path, direct_io).context("get_device_info")?;
            println!("{info:#?}");
        }
        Command::GetVolumeInfo => {
            let volumes = dbs_core::volume_info(path, direct_io).context("get_volume_info")?;
            for v in volumes {
                println!("{v:#?}");
            }
        }
        Command::GetSnapshotInfo { volume } => {
            let snapshots =
                dbs_core::snapshot_info(path, &volume, direct_io).context("get_snapshot_info")?;
            for s in snapshots {
                println!("{s:#?}");
            }
        }
        Command::InitDevice => {
            dbs_core::init_device(path, direct_io).context("init_device")?;
        }
        Command::VacuumDevice => {
            dbs_core::vacuum_device(path).context("vacuum_device")?;
        }
        Command::CreateVolume { name, size } => {
            dbs_core::create_volume(path, &name, size, direct_io).context("create_volume")?;
        }
        Command::RenameVolume { name, new_name } => {
            dbs_core::rename_volume(path, &name, &new_name, direct_io)
                .context("rename_volume")?;
        }
        Command::CreateSnapshot { name } => {
            dbs_core::create_snapshot(path, &name, direct_io).context("create_snapshot")?;
        }
        Command::CloneSnapshot {
            new_name,
            snapshot_id,
        } => {
            dbs_core::clone_snapshot(path, &new_name, snapshot_id, direct_io)
                .context("clone_snapshot")?;
        }
        Command::DeleteVolume { name } => {
            dbs_core::delete_volume(path, &name, direct_io).context("delete_volume")?;
        }
        Command::DeleteSnapshot { snapshot_id } => {
            dbs_core::delete_snapshot(path, snapshot_id, direct_io).context("delete_snapshot")?;
        }
    }

    Ok(())
}
