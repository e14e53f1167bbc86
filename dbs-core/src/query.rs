//! Read-only views of device, volume, and snapshot state, for tooling.

use std::path::Path;

use crate::device::DeviceContext;
use crate::error::{DbsError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub version: u32,
    pub device_size: u64,
    pub total_device_extents: u32,
    pub allocated_device_extents: u32,
    pub volume_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub name: String,
    pub size: u64,
    pub tip_snapshot_id: u16,
    pub created_at: i64,
    pub snapshot_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub id: u16,
    pub parent_id: u16,
    pub created_at: i64,
}

pub fn device_info(path: &Path, direct_io: bool) -> Result<DeviceInfo> {
    let dc = DeviceContext::open(path, direct_io)?;
    let info = DeviceInfo {
        version: dc.superblock.version,
        device_size: dc.superblock.device_size,
        total_device_extents: dc.total_device_extents,
        allocated_device_extents: dc.superblock.allocated_device_extents,
        volume_count: dc.count_volumes(),
    };
    dc.close()?;
    Ok(info)
}

pub fn volume_info(path: &Path, direct_io: bool) -> Result<Vec<VolumeInfo>> {
    let dc = DeviceContext::open(path, direct_io)?;
    let mut out = Vec::new();
    for (slot, v) in dc.volumes.iter().enumerate() {
        if v.is_free() {
            continue;
        }
        let created_at = dc.snapshots[(v.snapshot_id - 1) as usize].created_at;
        out.push(VolumeInfo {
            name: v.volume_name.clone(),
            size: v.volume_size,
            tip_snapshot_id: v.snapshot_id,
            created_at,
            snapshot_count: dc.count_snapshots(slot),
        });
    }
    dc.close()?;
    Ok(out)
}

/// Ordered tip -> root.
pub fn snapshot_info(path: &Path, volume_name: &str, direct_io: bool) -> Result<Vec<SnapshotInfo>> {
    let dc = DeviceContext::open(path, direct_io)?;
    let slot = dc
        .find_volume(volume_name)
        .ok_or_else(|| DbsError::VolumeNotFound(volume_name.to_string()))?;
    let mut out = Vec::new();
    let mut sid = dc.volumes[slot].snapshot_id;
    while sid != 0 {
        let rec = dc.snapshots[(sid - 1) as usize];
        out.push(SnapshotInfo {
            id: sid,
            parent_id: rec.parent_snapshot_id,
            created_at: rec.created_at,
        });
        sid = rec.parent_snapshot_id;
    }
    dc.close()?;
    Ok(out)
}
