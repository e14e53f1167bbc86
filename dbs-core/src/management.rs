//! Device and volume lifecycle operations: init, create/rename/delete
//! volume, create/clone/delete snapshot.
//!
//! Every operation here follows the same shape: open device context ->
//! validate -> mutate in memory -> persist the touched region(s) -> close.
//! There is no rollback; on I/O failure mid-operation the on-disk state is
//! whatever was persisted last.

use std::path::Path;

use log::info;

use crate::codec::SnapshotRecord;
use crate::constants::MAX_VOLUME_NAME_SIZE;
use crate::device::DeviceContext;
use crate::error::{DbsError, Result};
use crate::extent_map::ExtentMap;

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_VOLUME_NAME_SIZE {
        return Err(DbsError::InvalidName {
            max: MAX_VOLUME_NAME_SIZE,
            actual: name.len(),
        });
    }
    Ok(())
}

pub fn init_device(path: &Path, direct_io: bool) -> Result<()> {
    DeviceContext::init(path, direct_io)
}

pub fn vacuum_device(_path: &Path) -> Result<()> {
    Err(DbsError::NotImplemented("vacuum_device"))
}

pub fn create_volume(path: &Path, name: &str, size: u64, direct_io: bool) -> Result<()> {
    validate_name(name)?;
    let mut dc = DeviceContext::open(path, direct_io)?;
    if dc.find_volume(name).is_some() {
        return Err(DbsError::VolumeExists(name.to_string()));
    }
    dc.add_volume(name, size)?;
    dc.write_metadata()?;
    dc.close()?;
    info!("create_volume {:?} size={}", name, size);
    Ok(())
}

pub fn rename_volume(path: &Path, name: &str, new_name: &str, direct_io: bool) -> Result<()> {
    let mut dc = DeviceContext::open(path, direct_io)?;
    let slot = dc
        .find_volume(name)
        .ok_or_else(|| DbsError::VolumeNotFound(name.to_string()))?;
    if name != new_name {
        validate_name(new_name)?;
        if dc.find_volume(new_name).is_some() {
            return Err(DbsError::VolumeExists(new_name.to_string()));
        }
    }
    dc.volumes[slot].volume_name = new_name.to_string();
    dc.write_metadata()?;
    dc.close()?;
    info!("rename_volume {:?} -> {:?}", name, new_name);
    Ok(())
}

pub fn create_snapshot(path: &Path, name: &str, direct_io: bool) -> Result<()> {
    let mut dc = DeviceContext::open(path, direct_io)?;
    let slot = dc
        .find_volume(name)
        .ok_or_else(|| DbsError::VolumeNotFound(name.to_string()))?;
    let tip = dc.volumes[slot].snapshot_id;
    let new_sid = dc.add_snapshot(tip)?;
    dc.volumes[slot].snapshot_id = new_sid;
    dc.write_metadata()?;
    dc.close()?;
    info!("create_snapshot {:?} new_tip={}", name, new_sid);
    Ok(())
}

fn lookup_snapshot(dc: &DeviceContext, snapshot_id: u16) -> Result<()> {
    if snapshot_id == 0
        || snapshot_id as usize > dc.snapshots.len()
        || dc.snapshots[(snapshot_id - 1) as usize].is_free()
    {
        return Err(DbsError::SnapshotNotFound(snapshot_id));
    }
    Ok(())
}

pub fn clone_snapshot(
    path: &Path,
    new_name: &str,
    snapshot_id: u16,
    direct_io: bool,
) -> Result<()> {
    validate_name(new_name)?;
    let mut dc = DeviceContext::open(path, direct_io)?;
    if dc.find_volume(new_name).is_some() {
        return Err(DbsError::VolumeExists(new_name.to_string()));
    }
    lookup_snapshot(&dc, snapshot_id)?;
    let src_slot = dc
        .find_volume_with_snapshot(snapshot_id)
        .ok_or(DbsError::SnapshotNotFound(snapshot_id))?;
    let volume_size = dc.volumes[src_slot].volume_size;

    let snapshots = dc.snapshots.clone();
    let src_map = ExtentMap::volume_map(&mut dc, volume_size, snapshot_id, &snapshots)?;

    let live_count = src_map.allocated_volume_extents;
    if dc.superblock.allocated_device_extents as u64 + live_count > dc.total_device_extents as u64
    {
        return Err(DbsError::NoSpace);
    }

    let new_slot = dc.add_volume(new_name, volume_size)?;
    dc.write_metadata()?;
    let new_root_sid = dc.volumes[new_slot].snapshot_id;

    let _dst_map = src_map.copy_all_to(&mut dc, new_root_sid)?;
    dc.write_superblock()?;
    dc.close()?;
    info!(
        "clone_snapshot {:?} from snapshot={} extents={}",
        new_name, snapshot_id, live_count
    );
    Ok(())
}

pub fn delete_volume(path: &Path, name: &str, direct_io: bool) -> Result<()> {
    let mut dc = DeviceContext::open(path, direct_io)?;
    let slot = dc
        .find_volume(name)
        .ok_or_else(|| DbsError::VolumeNotFound(name.to_string()))?;
    let volume_size = dc.volumes[slot].volume_size;
    let mut sid = dc.volumes[slot].snapshot_id;
    while sid != 0 {
        let mut map = ExtentMap::snapshot_map(&mut dc, volume_size, sid)?;
        map.clear_all(&mut dc)?;
        let parent = dc.snapshots[(sid - 1) as usize].parent_snapshot_id;
        dc.snapshots[(sid - 1) as usize] = SnapshotRecord::default();
        sid = parent;
    }
    dc.volumes[slot] = Default::default();
    dc.write_metadata()?;
    dc.close()?;
    info!("delete_volume {:?}", name);
    Ok(())
}

pub fn delete_snapshot(path: &Path, snapshot_id: u16, direct_io: bool) -> Result<()> {
    let mut dc = DeviceContext::open(path, direct_io)?;
    lookup_snapshot(&dc, snapshot_id)?;
    let volume_slot = dc
        .find_volume_with_snapshot(snapshot_id)
        .ok_or(DbsError::SnapshotNotFound(snapshot_id))?;
    if dc.volumes[volume_slot].snapshot_id == snapshot_id {
        return Err(DbsError::CannotDeleteCurrent(snapshot_id));
    }
    let child = dc
        .find_child_snapshot(snapshot_id)
        .ok_or(DbsError::CannotDeleteRoot(snapshot_id))?;

    let volume_size = dc.volumes[volume_slot].volume_size;
    let mut victim_map = ExtentMap::snapshot_map(&mut dc, volume_size, snapshot_id)?;
    let mut child_map = ExtentMap::snapshot_map(&mut dc, volume_size, child)?;
    victim_map.merge_into(&mut dc, &mut child_map, child)?;
    victim_map.clear_all(&mut dc)?;

    let victim_parent = dc.snapshots[(snapshot_id - 1) as usize].parent_snapshot_id;
    dc.snapshots[(child - 1) as usize].parent_snapshot_id = victim_parent;
    dc.snapshots[(snapshot_id - 1) as usize] = SnapshotRecord::default();
    dc.write_metadata()?;
    dc.close()?;
    info!("delete_snapshot {} (child {} reparented)", snapshot_id, child);
    Ok(())
}
