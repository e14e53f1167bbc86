//! In-memory materialization of which volume-relative extents are present
//! for a given (volume, snapshot) view, and where each lives on device.

use crate::codec::{ExtentRecord, SnapshotRecord};
use crate::constants::EXTENT_SIZE;
use crate::device::DeviceContext;
use crate::error::Result;

/// Which volume-relative extents are present for one snapshot id (or, once
/// flattened across a lineage, for a whole volume), and the device slot
/// each one lives at.
///
/// Two parallel structures back this: a word-packed presence bitmap and a
/// dense `extents[]` array, so bulk scans can skip 32 extents at a time
/// with one word comparison, the only way this stays cheap on a
/// multi-terabyte volume with a handful of written extents.
pub struct ExtentMap {
    pub total_volume_extents: u64,
    pub allocated_volume_extents: u64,
    pub max_extent_idx: Option<u64>,
    extent_bitmap: Vec<u32>,
    extents: Vec<Option<ExtentRecord>>,
}

impl ExtentMap {
    pub fn empty(total_volume_extents: u64) -> Self {
        let word_count = ((total_volume_extents + 31) / 32).max(1) as usize;
        Self {
            total_volume_extents,
            allocated_volume_extents: 0,
            max_extent_idx: None,
            extent_bitmap: vec![0u32; word_count],
            extents: vec![None; total_volume_extents as usize],
        }
    }

    pub fn get(&self, v: u64) -> Option<&ExtentRecord> {
        self.extents.get(v as usize).and_then(|e| e.as_ref())
    }

    pub fn is_present(&self, v: u64) -> bool {
        self.get(v).is_some()
    }

    fn bit_index(v: u64) -> (usize, u32) {
        ((v / 32) as usize, (v % 32) as u32)
    }

    fn set_bit(&mut self, v: u64) {
        let (w, b) = Self::bit_index(v);
        self.extent_bitmap[w] |= 1 << b;
    }

    fn clear_bit(&mut self, v: u64) {
        let (w, b) = Self::bit_index(v);
        self.extent_bitmap[w] &= !(1 << b);
    }

    pub(crate) fn insert(&mut self, v: u64, record: ExtentRecord) {
        if self.extents[v as usize].is_none() {
            self.allocated_volume_extents += 1;
        }
        self.extents[v as usize] = Some(record);
        self.set_bit(v);
        self.max_extent_idx = Some(self.max_extent_idx.map_or(v, |m| m.max(v)));
    }

    pub(crate) fn remove(&mut self, v: u64) {
        if self.extents[v as usize].take().is_some() {
            self.allocated_volume_extents -= 1;
        }
        self.clear_bit(v);
    }

    /// Sets block bit `b` on the (already-present) record at `v`.
    pub(crate) fn set_block_bit(&mut self, v: u64, b: u64) {
        if let Some(rec) = self.extents[v as usize].as_mut() {
            rec.set_bit(b);
        }
    }

    /// Clears block bit `b` on the (already-present) record at `v`.
    pub(crate) fn clear_block_bit(&mut self, v: u64, b: u64) {
        if let Some(rec) = self.extents[v as usize].as_mut() {
            rec.clear_bit(b);
        }
    }

    /// Visits every populated `v`, skipping empty 32-extent regions in one
    /// word comparison.
    fn for_each_present(&self, mut f: impl FnMut(u64, &ExtentRecord)) {
        let max = match self.max_extent_idx {
            Some(m) => m,
            None => return,
        };
        let last_word = (max / 32) as usize;
        for (w, &word) in self.extent_bitmap.iter().enumerate().take(last_word + 1) {
            if word == 0 {
                continue;
            }
            for b in 0..32u32 {
                if (word >> b) & 1 == 1 {
                    let v = w as u64 * 32 + b as u64;
                    if v > max {
                        break;
                    }
                    if let Some(rec) = &self.extents[v as usize] {
                        f(v, rec);
                    }
                }
            }
        }
    }

    /// Streams through the live extent-metadata records, picking out every
    /// one tagged with `sid`. Mirrors the record with `extent_pos` swapped
    /// to the device-slot index at which it was found.
    pub fn snapshot_map(device: &mut DeviceContext, volume_size: u64, sid: u16) -> Result<Self> {
        let total_volume_extents = volume_size / EXTENT_SIZE;
        let mut map = Self::empty(total_volume_extents);
        let live = device
            .total_device_extents
            .min(device.superblock.allocated_device_extents) as usize;

        let mut slot: u32 = 0;
        let mut remaining = live;
        while remaining > 0 {
            let batch_n = remaining.min(crate::constants::EXTENT_BATCH);
            let records = device.read_extents(batch_n, slot)?;
            for (i, rec) in records.iter().enumerate() {
                if rec.snapshot_id == sid {
                    let v = rec.extent_pos as u64;
                    if v < total_volume_extents {
                        let device_slot = slot + i as u32;
                        let mut mem_rec = *rec;
                        mem_rec.extent_pos = device_slot;
                        map.insert(v, mem_rec);
                    }
                }
            }
            slot += batch_n as u32;
            remaining -= batch_n;
        }
        Ok(map)
    }

    /// Flattens a snapshot's view with every ancestor's, nearest ancestor
    /// wins: the first time `v` is seen walking toward the root is kept.
    pub fn volume_map(
        device: &mut DeviceContext,
        volume_size: u64,
        sid: u16,
        snapshots: &[SnapshotRecord],
    ) -> Result<Self> {
        let mut map = Self::snapshot_map(device, volume_size, sid)?;
        let mut ancestor = snapshots[(sid - 1) as usize].parent_snapshot_id;
        while ancestor != 0 {
            let ancestor_map = Self::snapshot_map(device, volume_size, ancestor)?;
            ancestor_map.for_each_present(|v, rec| {
                if !map.is_present(v) {
                    map.insert(v, *rec);
                }
            });
            ancestor = snapshots[(ancestor - 1) as usize].parent_snapshot_id;
        }
        Ok(map)
    }

    /// Allocates a fresh device slot for a never-before-materialized
    /// volume-relative extent `v`, tags it with `sid`, and persists the
    /// (empty) extent record. The caller persists the superblock
    /// afterward, since `allocated_device_extents` changed.
    pub fn new_extent(&mut self, device: &mut DeviceContext, v: u64, sid: u16) -> Result<()> {
        let device_slot = device.allocate_extent_slot()?;
        let on_disk = ExtentRecord {
            snapshot_id: sid,
            extent_pos: v as u32,
            block_bitmap: [0u8; crate::constants::EXTENT_BITMAP_SIZE],
        };
        device.write_extent(device_slot, &on_disk)?;
        self.insert(
            v,
            ExtentRecord {
                snapshot_id: sid,
                extent_pos: device_slot,
                block_bitmap: on_disk.block_bitmap,
            },
        );
        Ok(())
    }

    /// Copies `v`'s existing data into a fresh device slot retagged with
    /// `sid` (the copy-on-write path for a write against an ancestor's
    /// extent).
    pub fn copy_extent(&mut self, device: &mut DeviceContext, v: u64, sid: u16) -> Result<()> {
        let old = *self.get(v).expect("copy_extent requires an existing entry");
        let record = relocate_copy(device, old.extent_pos, sid, v, old.block_bitmap)?;
        self.insert(v, record);
        Ok(())
    }

    /// Physically copies every populated extent into fresh device slots
    /// tagged with `new_sid`, returning the destination's own extent map.
    /// `self` is left unmodified. Used by `clone_snapshot`.
    pub fn copy_all_to(&self, device: &mut DeviceContext, new_sid: u16) -> Result<Self> {
        let mut dst = Self::empty(self.total_volume_extents);
        let mut first_err = None;
        self.for_each_present(|v, rec| {
            if first_err.is_some() {
                return;
            }
            match relocate_copy(device, rec.extent_pos, new_sid, v, rec.block_bitmap) {
                Ok(new_rec) => dst.insert(v, new_rec),
                Err(e) => first_err = Some(e),
            }
        });
        if let Some(e) = first_err {
            return Err(e);
        }
        Ok(dst)
    }

    /// For every `v` present in `self` and absent in `dst`, moves the
    /// record into `dst` retagged with `new_sid` (the device slot is kept,
    /// only ownership changes), clears it from `self`, and rewrites the
    /// on-disk record. Used by `delete_snapshot` to preserve data visible
    /// to a later descendant.
    pub fn merge_into(&mut self, device: &mut DeviceContext, dst: &mut Self, new_sid: u16) -> Result<()> {
        let mut to_move = Vec::new();
        self.for_each_present(|v, _| {
            if !dst.is_present(v) {
                to_move.push(v);
            }
        });
        for v in to_move {
            let mut moved = *self.get(v).expect("collected from for_each_present");
            moved.snapshot_id = new_sid;
            let device_slot = moved.extent_pos;
            let on_disk = ExtentRecord {
                snapshot_id: new_sid,
                extent_pos: v as u32,
                block_bitmap: moved.block_bitmap,
            };
            device.write_extent(device_slot, &on_disk)?;
            dst.insert(v, moved);
            self.remove(v);
        }
        Ok(())
    }

    /// Overwrites every populated extent's on-disk record with an
    /// all-zero record, logically freeing the device slot. Slots are
    /// never compacted; they stay dark until a future `vacuum`.
    pub fn clear_all(&mut self, device: &mut DeviceContext) -> Result<()> {
        let mut slots = Vec::new();
        self.for_each_present(|v, rec| slots.push((v, rec.extent_pos)));
        for (v, device_slot) in slots {
            device.write_extent(device_slot, &ExtentRecord::default())?;
            self.remove(v);
        }
        Ok(())
    }
}

fn relocate_copy(
    device: &mut DeviceContext,
    src_device_slot: u32,
    dst_sid: u16,
    v: u64,
    bitmap: [u8; crate::constants::EXTENT_BITMAP_SIZE],
) -> Result<ExtentRecord> {
    let mut buf = vec![0u8; EXTENT_SIZE as usize];
    device.read_extent_data(src_device_slot, &mut buf)?;
    let new_slot = device.allocate_extent_slot()?;
    device.write_extent_data(new_slot, &buf)?;
    let on_disk = ExtentRecord {
        snapshot_id: dst_sid,
        extent_pos: v as u32,
        block_bitmap: bitmap,
    };
    device.write_extent(new_slot, &on_disk)?;
    Ok(ExtentRecord {
        snapshot_id: dst_sid,
        extent_pos: new_slot,
        block_bitmap: bitmap,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_map_has_no_present_entries() {
        let map = ExtentMap::empty(10);
        assert_eq!(map.allocated_volume_extents, 0);
        assert!(map.max_extent_idx.is_none());
        assert!(!map.is_present(0));
    }

    #[test]
    fn insert_and_remove_track_count_and_bitmap() {
        let mut map = ExtentMap::empty(100);
        map.insert(
            5,
            ExtentRecord {
                snapshot_id: 1,
                extent_pos: 0,
                block_bitmap: [0; 32],
            },
        );
        assert!(map.is_present(5));
        assert_eq!(map.allocated_volume_extents, 1);
        assert_eq!(map.max_extent_idx, Some(5));
        map.remove(5);
        assert!(!map.is_present(5));
        assert_eq!(map.allocated_volume_extents, 0);
    }

    #[test]
    fn for_each_present_skips_empty_words() {
        let mut map = ExtentMap::empty(1000);
        map.insert(
            0,
            ExtentRecord {
                snapshot_id: 1,
                extent_pos: 1,
                block_bitmap: [0; 32],
            },
        );
        map.insert(
            900,
            ExtentRecord {
                snapshot_id: 1,
                extent_pos: 2,
                block_bitmap: [0; 32],
            },
        );
        let mut seen = Vec::new();
        map.for_each_present(|v, _| seen.push(v));
        assert_eq!(seen, vec![0, 900]);
    }
}
