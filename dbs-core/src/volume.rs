//! Block API: an open volume context backed by a flattened extent map,
//! supporting block-granular read/write/unmap plus byte-offset wrappers.

use log::{debug, info};

use crate::codec::ExtentRecord;
use crate::constants::*;
use crate::device::DeviceContext;
use crate::error::{DbsError, Result};
use crate::extent_map::ExtentMap;

fn ceil_div(a: u64, b: u64) -> u64 {
    (a + b - 1) / b
}

/// A named volume opened for block I/O, owning its device context and a
/// volume extent map flattened across the whole snapshot lineage.
pub struct VolumeContext {
    device: DeviceContext,
    pub volume_name: String,
    pub volume_size: u64,
    pub tip_snapshot_id: u16,
    pub total_volume_extents: u64,
    map: ExtentMap,
}

impl VolumeContext {
    pub fn open_volume(path: &std::path::Path, name: &str, direct_io: bool) -> Result<Self> {
        let mut device = DeviceContext::open(path, direct_io)?;
        let slot = device
            .find_volume(name)
            .ok_or_else(|| DbsError::VolumeNotFound(name.to_string()))?;
        let volume_size = device.volumes[slot].volume_size;
        let tip = device.volumes[slot].snapshot_id;
        let snapshots = device.snapshots.clone();
        let map = ExtentMap::volume_map(&mut device, volume_size, tip, &snapshots)?;
        let total_volume_extents = volume_size / EXTENT_SIZE;
        info!(
            "open_volume {:?}: tip={} total_volume_extents={}",
            name, tip, total_volume_extents
        );
        Ok(Self {
            device,
            volume_name: name.to_string(),
            volume_size,
            tip_snapshot_id: tip,
            total_volume_extents,
            map,
        })
    }

    pub fn close_volume(self) -> Result<()> {
        self.device.close()
    }

    fn split(&self, block_index: u64) -> Result<(u64, u64)> {
        let v = block_index >> BLOCK_BITS_IN_EXTENT;
        let b = block_index & BLOCK_MASK_IN_EXTENT;
        if v >= self.total_volume_extents {
            return Err(DbsError::OutOfRange {
                index: block_index,
                total_blocks: self.total_volume_extents * BLOCKS_PER_EXTENT,
            });
        }
        Ok((v, b))
    }

    pub fn read_block(&mut self, block_index: u64, out: &mut [u8]) -> Result<()> {
        let (v, b) = self.split(block_index)?;
        match self.map.get(v) {
            Some(rec) if rec.bit(b) => {
                let offset =
                    self.device.data_offset + rec.extent_pos as u64 * EXTENT_SIZE + b * BLOCK_SIZE;
                self.device.store_mut().read_at(out, offset).map_err(DbsError::from)
            }
            _ => {
                out.iter_mut().for_each(|byte| *byte = 0);
                Ok(())
            }
        }
    }

    /// Two-phase write: with `update_metadata = false`, returns
    /// `MetadataNeedsUpdate` instead of allocating or COW-ing so a caller
    /// holding only a shared lock can retry exclusively.
    pub fn write_block(&mut self, block_index: u64, data: &[u8], update_metadata: bool) -> Result<()> {
        let (v, b) = self.split(block_index)?;
        let tip = self.tip_snapshot_id;

        match self.map.get(v) {
            Some(rec) if rec.snapshot_id == tip => {}
            Some(_) => {
                if !update_metadata {
                    return Err(DbsError::MetadataNeedsUpdate);
                }
                debug!("write_block: COW v={} onto tip={}", v, tip);
                self.map.copy_extent(&mut self.device, v, tip)?;
                self.device.write_superblock()?;
            }
            None => {
                if !update_metadata {
                    return Err(DbsError::MetadataNeedsUpdate);
                }
                debug!("write_block: new_extent v={} tip={}", v, tip);
                self.map.new_extent(&mut self.device, v, tip)?;
                self.device.write_superblock()?;
            }
        }

        let rec = *self.map.get(v).expect("materialized above");
        let offset = self.device.data_offset + rec.extent_pos as u64 * EXTENT_SIZE + b * BLOCK_SIZE;
        self.device
            .store_mut()
            .write_at(data, offset)
            .map_err(DbsError::from)?;

        if !rec.bit(b) {
            self.map.set_block_bit(v, b);
            let updated = *self.map.get(v).expect("just set above");
            let on_disk = ExtentRecord {
                snapshot_id: updated.snapshot_id,
                extent_pos: v as u32,
                block_bitmap: updated.block_bitmap,
            };
            self.device.write_extent(updated.extent_pos, &on_disk)?;
        }
        Ok(())
    }

    /// Idempotent: unmapping an unwritten or already-unmapped block
    /// succeeds silently.
    pub fn unmap_block(&mut self, block_index: u64) -> Result<()> {
        let (v, b) = self.split(block_index)?;
        let rec = match self.map.get(v) {
            Some(r) if r.bit(b) => *r,
            _ => return Ok(()),
        };
        self.map.clear_block_bit(v, b);
        let now_empty = self
            .map
            .get(v)
            .map(|r| r.bitmap_is_empty())
            .unwrap_or(true);

        if now_empty {
            self.device.write_extent(rec.extent_pos, &ExtentRecord::default())?;
            self.map.remove(v);
        } else {
            let updated = *self.map.get(v).expect("bit cleared above");
            let on_disk = ExtentRecord {
                snapshot_id: updated.snapshot_id,
                extent_pos: v as u32,
                block_bitmap: updated.block_bitmap,
            };
            self.device.write_extent(updated.extent_pos, &on_disk)?;
        }
        Ok(())
    }

    pub fn read_at(&mut self, buf: &mut [u8], byte_offset: u64) -> Result<()> {
        let mut block_buf = [0u8; BLOCK_SIZE as usize];
        let mut pos = byte_offset;
        let mut written = 0usize;
        let mut remaining = buf.len();
        while remaining > 0 {
            let block_index = pos / BLOCK_SIZE;
            let in_block_off = (pos % BLOCK_SIZE) as usize;
            self.read_block(block_index, &mut block_buf)?;
            let n = remaining.min(BLOCK_SIZE as usize - in_block_off);
            buf[written..written + n].copy_from_slice(&block_buf[in_block_off..in_block_off + n]);
            pos += n as u64;
            written += n;
            remaining -= n;
        }
        Ok(())
    }

    pub fn write_at(&mut self, buf: &[u8], byte_offset: u64, update_metadata: bool) -> Result<()> {
        let mut pos = byte_offset;
        let mut read_pos = 0usize;
        let mut remaining = buf.len();
        while remaining > 0 {
            let block_index = pos / BLOCK_SIZE;
            let in_block_off = (pos % BLOCK_SIZE) as usize;
            let n = remaining.min(BLOCK_SIZE as usize - in_block_off);
            let mut block_buf = [0u8; BLOCK_SIZE as usize];
            if n < BLOCK_SIZE as usize {
                self.read_block(block_index, &mut block_buf)?;
            }
            block_buf[in_block_off..in_block_off + n].copy_from_slice(&buf[read_pos..read_pos + n]);
            self.write_block(block_index, &block_buf, update_metadata)?;
            pos += n as u64;
            read_pos += n;
            remaining -= n;
        }
        Ok(())
    }

    /// Only whole blocks fully covered by `[byte_offset, byte_offset+length)`
    /// are unmapped; a partially covered head or tail block is left as is.
    pub fn unmap_at(&mut self, length: u64, byte_offset: u64) -> Result<()> {
        let first_full_block = ceil_div(byte_offset, BLOCK_SIZE);
        let end = byte_offset + length;
        let last_full_block_end = end / BLOCK_SIZE;
        let mut block = first_full_block;
        while block < last_full_block_end {
            self.unmap_block(block)?;
            block += 1;
        }
        Ok(())
    }
}
