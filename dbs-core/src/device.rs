//! The in-memory mirror of superblock + volume table + snapshot table, and
//! the derived offsets that describe where everything else lives on disk.

use std::path::Path;

use dbs_io::{BackingStore, Direction, FileBackingStore};
use log::{debug, info};

use crate::codec::{ExtentRecord, SnapshotRecord, Superblock, VolumeRecord};
use crate::constants::*;
use crate::error::{DbsError, Result};

fn ceil_div(a: u64, b: u64) -> u64 {
    (a + b - 1) / b
}

fn ceil_to(a: u64, b: u64) -> u64 {
    ceil_div(a, b) * b
}

/// Byte offset of the volume+snapshot table region, one block past the
/// superblock, rounded up to the next block.
pub fn compute_extent_offset() -> u64 {
    let table_bytes =
        (MAX_VOLUMES * VOLUME_RECORD_SIZE + MAX_SNAPSHOTS * SNAPSHOT_RECORD_SIZE) as u64;
    (1 + ceil_div(table_bytes, BLOCK_SIZE)) * BLOCK_SIZE
}

/// Largest `total_device_extents` for which the extent-metadata table and
/// the data area both fit within `device_size - extent_offset`.
///
/// `fits(n)` is monotone: as `n` grows, both the metadata table and the
/// data area it gates grow, so this is a plain binary search for the
/// largest feasible `n`.
pub fn compute_total_device_extents(device_size: u64, extent_offset: u64) -> u32 {
    let fits = |n: u64| -> bool {
        let meta_end = extent_offset + n * EXTENT_RECORD_SIZE as u64;
        let data_offset = ceil_to(meta_end, EXTENT_SIZE);
        data_offset.checked_add(n * EXTENT_SIZE).is_some()
            && data_offset + n * EXTENT_SIZE <= device_size
    };
    if extent_offset >= device_size {
        return 0;
    }
    let mut lo: u64 = 0;
    let mut hi: u64 = (device_size - extent_offset) / EXTENT_SIZE + 1;
    while lo < hi {
        let mid = lo + (hi - lo + 1) / 2;
        if fits(mid) {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    lo as u32
}

pub fn compute_data_offset(extent_offset: u64, total_device_extents: u32) -> u64 {
    let meta_end = extent_offset + total_device_extents as u64 * EXTENT_RECORD_SIZE as u64;
    ceil_to(meta_end, EXTENT_SIZE)
}

fn epoch_now() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_secs() as i64
}

fn io_open_err(source: std::io::Error) -> DbsError {
    DbsError::Io {
        direction: Direction::Read,
        offset: 0,
        len: 0,
        source,
    }
}

/// The in-memory mirror of a device's metadata, plus its derived offsets.
pub struct DeviceContext {
    store: Box<dyn BackingStore>,
    pub superblock: Superblock,
    pub volumes: Vec<VolumeRecord>,
    pub snapshots: Vec<SnapshotRecord>,
    pub extent_offset: u64,
    pub data_offset: u64,
    pub total_device_extents: u32,
}

impl DeviceContext {
    /// Formats a fresh device: requires the backing object already exist,
    /// be openable read/write, non-zero, and at least [`MIN_DEVICE_SIZE`].
    pub fn init(path: &Path, direct_io: bool) -> Result<()> {
        let mut store: Box<dyn BackingStore> =
            Box::new(FileBackingStore::open(path, direct_io).map_err(io_open_err)?);
        let device_size = store.size();
        if device_size == 0 {
            return Err(DbsError::ZeroSize);
        }
        if device_size < MIN_DEVICE_SIZE {
            return Err(DbsError::TooSmall {
                min: MIN_DEVICE_SIZE,
                actual: device_size,
            });
        }

        let superblock = Superblock::fresh(device_size);
        let extent_offset = compute_extent_offset();
        let total_device_extents = compute_total_device_extents(device_size, extent_offset);
        let data_offset = compute_data_offset(extent_offset, total_device_extents);
        info!(
            "init {}: device_size={} extent_offset={} data_offset={} total_device_extents={}",
            path.display(),
            device_size,
            extent_offset,
            data_offset,
            total_device_extents
        );

        store
            .write_at(&superblock.encode(), 0)
            .map_err(DbsError::from)?;

        // Stream zero batches across the volume/snapshot table and the
        // extent-metadata table, one block at a time; both regions are
        // block-aligned by construction.
        let zero_block = vec![0u8; BLOCK_SIZE as usize];
        let mut offset = BLOCK_SIZE;
        while offset < data_offset {
            store
                .write_at(&zero_block, offset)
                .map_err(DbsError::from)?;
            offset += BLOCK_SIZE;
        }
        store.sync().map_err(DbsError::from)?;
        Ok(())
    }

    /// Opens an existing device, rejecting magic/version mismatches.
    pub fn open(path: &Path, direct_io: bool) -> Result<Self> {
        let mut store: Box<dyn BackingStore> =
            Box::new(FileBackingStore::open(path, direct_io).map_err(io_open_err)?);

        let mut sb_buf = vec![0u8; BLOCK_SIZE as usize];
        store.read_at(&mut sb_buf, 0).map_err(DbsError::from)?;
        let superblock = Superblock::decode(&sb_buf)?;

        let extent_offset = compute_extent_offset();
        let total_device_extents =
            compute_total_device_extents(superblock.device_size, extent_offset);
        let data_offset = compute_data_offset(extent_offset, total_device_extents);

        let table_len = (extent_offset - BLOCK_SIZE) as usize;
        let mut table_buf = vec![0u8; table_len];
        store
            .read_at(&mut table_buf, BLOCK_SIZE)
            .map_err(DbsError::from)?;

        let mut volumes = Vec::with_capacity(MAX_VOLUMES);
        let mut off = 0usize;
        for _ in 0..MAX_VOLUMES {
            volumes.push(VolumeRecord::decode(&table_buf[off..off + VOLUME_RECORD_SIZE]));
            off += VOLUME_RECORD_SIZE;
        }
        let mut snapshots = Vec::with_capacity(MAX_SNAPSHOTS);
        for _ in 0..MAX_SNAPSHOTS {
            snapshots.push(SnapshotRecord::decode(
                &table_buf[off..off + SNAPSHOT_RECORD_SIZE],
            ));
            off += SNAPSHOT_RECORD_SIZE;
        }

        debug!(
            "open {}: {} volumes, {} snapshots, total_device_extents={}",
            path.display(),
            volumes.iter().filter(|v| !v.is_free()).count(),
            snapshots.iter().filter(|s| !s.is_free()).count(),
            total_device_extents
        );

        Ok(Self {
            store,
            superblock,
            volumes,
            snapshots,
            extent_offset,
            data_offset,
            total_device_extents,
        })
    }

    pub fn close(mut self) -> Result<()> {
        self.store.sync().map_err(DbsError::from)
    }

    pub fn store_mut(&mut self) -> &mut dyn BackingStore {
        self.store.as_mut()
    }

    // ---- Lookups -------------------------------------------------------

    pub fn find_volume(&self, name: &str) -> Option<usize> {
        self.volumes
            .iter()
            .position(|v| !v.is_free() && v.volume_name == name)
    }

    /// The unique snapshot whose parent is `sid`, if any.
    pub fn find_child_snapshot(&self, sid: u16) -> Option<u16> {
        self.snapshots.iter().enumerate().find_map(|(i, s)| {
            if !s.is_free() && s.parent_snapshot_id == sid {
                Some((i + 1) as u16)
            } else {
                None
            }
        })
    }

    /// Walks descendants of `sid` until a volume tip is found.
    pub fn find_volume_with_snapshot(&self, sid: u16) -> Option<usize> {
        let mut candidate = sid;
        loop {
            if let Some(slot) = self
                .volumes
                .iter()
                .position(|v| !v.is_free() && v.snapshot_id == candidate)
            {
                return Some(slot);
            }
            candidate = self.find_child_snapshot(candidate)?;
        }
    }

    pub fn count_volumes(&self) -> usize {
        self.volumes.iter().filter(|v| !v.is_free()).count()
    }

    /// Chain length (tip to root, inclusive) for the given volume slot.
    pub fn count_snapshots(&self, volume_slot: usize) -> usize {
        let mut n = 0;
        let mut sid = self.volumes[volume_slot].snapshot_id;
        while sid != 0 {
            n += 1;
            sid = self.snapshots[(sid - 1) as usize].parent_snapshot_id;
        }
        n
    }

    // ---- Mutators --------------------------------------------------------

    /// Picks the first free snapshot slot and sets `created_at = now`.
    /// Returns the new snapshot's public id (`slot_index + 1`).
    pub fn add_snapshot(&mut self, parent: u16) -> Result<u16> {
        let slot = self
            .snapshots
            .iter()
            .position(|s| s.is_free())
            .ok_or(DbsError::OutOfSnapshotSlots(MAX_SNAPSHOTS))?;
        self.snapshots[slot] = SnapshotRecord {
            parent_snapshot_id: parent,
            created_at: epoch_now(),
        };
        Ok((slot + 1) as u16)
    }

    /// Picks the first free volume slot, creates its root snapshot, and
    /// initializes name/size. `size` is truncated down to an
    /// `EXTENT_SIZE` multiple; a size that truncates to zero is rejected.
    pub fn add_volume(&mut self, name: &str, size: u64) -> Result<usize> {
        let truncated = (size / EXTENT_SIZE) * EXTENT_SIZE;
        if truncated == 0 {
            return Err(DbsError::ZeroSize);
        }
        let slot = self
            .volumes
            .iter()
            .position(|v| v.is_free())
            .ok_or(DbsError::OutOfVolumeSlots(MAX_VOLUMES))?;
        let root = self.add_snapshot(0)?;
        self.volumes[slot] = VolumeRecord {
            snapshot_id: root,
            volume_size: truncated,
            volume_name: name.to_string(),
        };
        Ok(slot)
    }

    /// Increments `allocated_device_extents` and returns the device slot
    /// that was just reserved. Fails `NoSpace` once the table is full.
    pub fn allocate_extent_slot(&mut self) -> Result<u32> {
        let slot = self.superblock.allocated_device_extents;
        if slot >= self.total_device_extents {
            return Err(DbsError::NoSpace);
        }
        self.superblock.allocated_device_extents += 1;
        Ok(slot)
    }

    // ---- Persisters ------------------------------------------------------

    pub fn write_superblock(&mut self) -> Result<()> {
        let buf = self.superblock.encode();
        self.store.write_at(&buf, 0).map_err(DbsError::from)
    }

    pub fn write_metadata(&mut self) -> Result<()> {
        let table_len = (self.extent_offset - BLOCK_SIZE) as usize;
        let mut buf = vec![0u8; table_len];
        let mut off = 0usize;
        for v in &self.volumes {
            buf[off..off + VOLUME_RECORD_SIZE].copy_from_slice(&v.encode());
            off += VOLUME_RECORD_SIZE;
        }
        for s in &self.snapshots {
            buf[off..off + SNAPSHOT_RECORD_SIZE].copy_from_slice(&s.encode());
            off += SNAPSHOT_RECORD_SIZE;
        }
        self.store
            .write_at(&buf, BLOCK_SIZE)
            .map_err(DbsError::from)
    }

    fn extent_slot_offset(&self, slot_idx: u32) -> u64 {
        self.extent_offset + slot_idx as u64 * EXTENT_RECORD_SIZE as u64
    }

    /// Persists a single extent record, already in on-disk form (its
    /// `extent_pos` must be the volume-relative index, not a device slot).
    pub fn write_extent(&mut self, slot_idx: u32, record: &ExtentRecord) -> Result<()> {
        self.store
            .write_at(&record.encode(), self.extent_slot_offset(slot_idx))
            .map_err(DbsError::from)
    }

    /// Persists a contiguous batch of on-disk extent records starting at
    /// `starting_slot_idx`, in chunks bounded by [`EXTENT_BATCH`].
    pub fn write_extents(&mut self, batch: &[ExtentRecord], starting_slot_idx: u32) -> Result<()> {
        for (chunk_idx, chunk) in batch.chunks(EXTENT_BATCH).enumerate() {
            let mut buf = vec![0u8; chunk.len() * EXTENT_RECORD_SIZE];
            for (i, rec) in chunk.iter().enumerate() {
                buf[i * EXTENT_RECORD_SIZE..(i + 1) * EXTENT_RECORD_SIZE]
                    .copy_from_slice(&rec.encode());
            }
            let start_slot = starting_slot_idx + (chunk_idx * EXTENT_BATCH) as u32;
            self.store
                .write_at(&buf, self.extent_slot_offset(start_slot))
                .map_err(DbsError::from)?;
        }
        Ok(())
    }

    /// Reads `count` contiguous on-disk extent records starting at
    /// `starting_slot_idx`, in chunks bounded by [`EXTENT_BATCH`].
    pub fn read_extents(&mut self, count: usize, starting_slot_idx: u32) -> Result<Vec<ExtentRecord>> {
        let mut out = Vec::with_capacity(count);
        let mut remaining = count;
        let mut slot = starting_slot_idx;
        while remaining > 0 {
            let n = remaining.min(EXTENT_BATCH);
            let mut buf = vec![0u8; n * EXTENT_RECORD_SIZE];
            self.store
                .read_at(&mut buf, self.extent_slot_offset(slot))
                .map_err(DbsError::from)?;
            for i in 0..n {
                out.push(ExtentRecord::decode(
                    &buf[i * EXTENT_RECORD_SIZE..(i + 1) * EXTENT_RECORD_SIZE],
                ));
            }
            remaining -= n;
            slot += n as u32;
        }
        Ok(out)
    }

    pub fn read_extent_data(&mut self, device_slot: u32, buf: &mut [u8]) -> Result<()> {
        let offset = self.data_offset + device_slot as u64 * EXTENT_SIZE;
        self.store.read_at(buf, offset).map_err(DbsError::from)
    }

    pub fn write_extent_data(&mut self, device_slot: u32, buf: &[u8]) -> Result<()> {
        let offset = self.data_offset + device_slot as u64 * EXTENT_SIZE;
        self.store.write_at(buf, offset).map_err(DbsError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extent_offset_is_block_aligned_and_stable() {
        let off = compute_extent_offset();
        assert_eq!(off % BLOCK_SIZE, 0);
        // 256*266 + 65535*10 = 68096 + 655350 = 723446 bytes -> 177 blocks -> (1+177)*4096
        assert_eq!(off, 178 * BLOCK_SIZE);
    }

    #[test]
    fn total_device_extents_fits_within_device() {
        let extent_offset = compute_extent_offset();
        let device_size = MIN_DEVICE_SIZE;
        let n = compute_total_device_extents(device_size, extent_offset);
        let data_offset = compute_data_offset(extent_offset, n);
        assert!(data_offset + n as u64 * EXTENT_SIZE <= device_size);
        // One more extent must not fit.
        let data_offset_plus = compute_data_offset(extent_offset, n + 1);
        assert!(data_offset_plus + (n as u64 + 1) * EXTENT_SIZE > device_size);
    }

    #[test]
    fn total_device_extents_scales_with_device_size() {
        let extent_offset = compute_extent_offset();
        let small = compute_total_device_extents(MIN_DEVICE_SIZE, extent_offset);
        let big = compute_total_device_extents(MIN_DEVICE_SIZE * 10, extent_offset);
        assert!(big > small);
    }
}
