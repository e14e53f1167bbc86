//! Fixed little-endian (de)serialization for the superblock, volume table,
//! snapshot table and extent-metadata records.
//!
//! Every record is encoded field-by-field through a `Cursor` rather than by
//! transmuting a `#[repr(C)]` struct: none of these records' byte sizes
//! (266, 10, 38 bytes) line up with a struct's natural layout, so explicit
//! encode/decode is both simpler and safer than fighting padding.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

use crate::constants::*;
use crate::error::{DbsError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Superblock {
    pub magic: [u8; 8],
    pub version: u32,
    pub allocated_device_extents: u32,
    pub device_size: u64,
}

impl Superblock {
    pub fn fresh(device_size: u64) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            allocated_device_extents: 0,
            device_size,
        }
    }

    pub fn encode(&self) -> [u8; BLOCK_SIZE as usize] {
        let mut block = [0u8; BLOCK_SIZE as usize];
        {
            let mut c = Cursor::new(&mut block[..SUPERBLOCK_RECORD_SIZE]);
            c.write_all(&self.magic).unwrap();
            c.write_u32::<LittleEndian>(self.version).unwrap();
            c.write_u32::<LittleEndian>(self.allocated_device_extents)
                .unwrap();
            c.write_u64::<LittleEndian>(self.device_size).unwrap();
        }
        block
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut c = Cursor::new(buf);
        let mut magic = [0u8; 8];
        c.read_exact(&mut magic).map_err(io_err)?;
        let version = c.read_u32::<LittleEndian>().map_err(io_err)?;
        let allocated_device_extents = c.read_u32::<LittleEndian>().map_err(io_err)?;
        let device_size = c.read_u64::<LittleEndian>().map_err(io_err)?;
        if magic != MAGIC {
            return Err(DbsError::NotInitialized);
        }
        if version != VERSION {
            return Err(DbsError::VersionMismatch {
                expected: VERSION,
                found: version,
            });
        }
        Ok(Self {
            magic,
            version,
            allocated_device_extents,
            device_size,
        })
    }
}

/// One volume-table slot. `snapshot_id == 0` means the slot is free.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VolumeRecord {
    pub snapshot_id: u16,
    pub volume_size: u64,
    pub volume_name: String,
}

impl VolumeRecord {
    pub fn is_free(&self) -> bool {
        self.snapshot_id == 0
    }

    pub fn encode(&self) -> [u8; VOLUME_RECORD_SIZE] {
        let mut buf = [0u8; VOLUME_RECORD_SIZE];
        {
            let mut c = Cursor::new(&mut buf[..]);
            c.write_u16::<LittleEndian>(self.snapshot_id).unwrap();
            c.write_u64::<LittleEndian>(self.volume_size).unwrap();
            let name_bytes = self.volume_name.as_bytes();
            let n = name_bytes.len().min(MAX_VOLUME_NAME_SIZE);
            c.write_all(&name_bytes[..n]).unwrap();
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Self {
        let mut c = Cursor::new(buf);
        let snapshot_id = c.read_u16::<LittleEndian>().unwrap();
        let volume_size = c.read_u64::<LittleEndian>().unwrap();
        let mut name_buf = [0u8; 256];
        c.read_exact(&mut name_buf).unwrap();
        let nul = name_buf.iter().position(|&b| b == 0).unwrap_or(256);
        let volume_name = String::from_utf8_lossy(&name_buf[..nul]).into_owned();
        Self {
            snapshot_id,
            volume_size,
            volume_name,
        }
    }
}

/// One snapshot-table slot. `created_at == 0` means the slot is free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SnapshotRecord {
    pub parent_snapshot_id: u16,
    pub created_at: i64,
}

impl SnapshotRecord {
    pub fn is_free(&self) -> bool {
        self.created_at == 0
    }

    pub fn encode(&self) -> [u8; SNAPSHOT_RECORD_SIZE] {
        let mut buf = [0u8; SNAPSHOT_RECORD_SIZE];
        {
            let mut c = Cursor::new(&mut buf[..]);
            c.write_u16::<LittleEndian>(self.parent_snapshot_id)
                .unwrap();
            c.write_i64::<LittleEndian>(self.created_at).unwrap();
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Self {
        let mut c = Cursor::new(buf);
        let parent_snapshot_id = c.read_u16::<LittleEndian>().unwrap();
        let created_at = c.read_i64::<LittleEndian>().unwrap();
        Self {
            parent_snapshot_id,
            created_at,
        }
    }
}

/// One extent-metadata record.
///
/// `extent_pos` is dual-purposed: on disk it is the *volume-relative*
/// extent index this device slot backs; once loaded into an
/// [`crate::extent_map::ExtentMap`] it is overwritten with the
/// *device-slot* index. The codec itself never performs this swap: every
/// caller that persists a record through [`crate::device::DeviceContext`]
/// is responsible for passing the volume-relative index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtentRecord {
    pub snapshot_id: u16,
    pub extent_pos: u32,
    pub block_bitmap: [u8; EXTENT_BITMAP_SIZE],
}

impl ExtentRecord {
    pub fn is_free(&self) -> bool {
        self.snapshot_id == 0
    }

    pub fn bit(&self, b: u64) -> bool {
        let byte = (b / 8) as usize;
        let bit = (b % 8) as u32;
        (self.block_bitmap[byte] >> bit) & 1 == 1
    }

    pub fn set_bit(&mut self, b: u64) {
        let byte = (b / 8) as usize;
        let bit = (b % 8) as u32;
        self.block_bitmap[byte] |= 1 << bit;
    }

    pub fn clear_bit(&mut self, b: u64) {
        let byte = (b / 8) as usize;
        let bit = (b % 8) as u32;
        self.block_bitmap[byte] &= !(1 << bit);
    }

    pub fn bitmap_is_empty(&self) -> bool {
        self.block_bitmap.iter().all(|&b| b == 0)
    }

    pub fn encode(&self) -> [u8; EXTENT_RECORD_SIZE] {
        let mut buf = [0u8; EXTENT_RECORD_SIZE];
        {
            let mut c = Cursor::new(&mut buf[..]);
            c.write_u16::<LittleEndian>(self.snapshot_id).unwrap();
            c.write_u32::<LittleEndian>(self.extent_pos).unwrap();
            c.write_all(&self.block_bitmap).unwrap();
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Self {
        let mut c = Cursor::new(buf);
        let snapshot_id = c.read_u16::<LittleEndian>().unwrap();
        let extent_pos = c.read_u32::<LittleEndian>().unwrap();
        let mut block_bitmap = [0u8; EXTENT_BITMAP_SIZE];
        c.read_exact(&mut block_bitmap).unwrap();
        Self {
            snapshot_id,
            extent_pos,
            block_bitmap,
        }
    }
}

fn io_err(e: std::io::Error) -> DbsError {
    DbsError::Io {
        direction: dbs_io::Direction::Read,
        offset: 0,
        len: 0,
        source: e,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn superblock_round_trip() {
        let sb = Superblock {
            magic: MAGIC,
            version: VERSION,
            allocated_device_extents: 42,
            device_size: 123_456_789,
        };
        let encoded = sb.encode();
        let decoded = Superblock::decode(&encoded).unwrap();
        assert_eq!(sb, decoded);
    }

    #[test]
    fn superblock_rejects_bad_magic() {
        let mut block = [0u8; BLOCK_SIZE as usize];
        block[0] = 0xFF;
        assert!(matches!(
            Superblock::decode(&block),
            Err(DbsError::NotInitialized)
        ));
    }

    #[test]
    fn superblock_rejects_version_mismatch() {
        let mut sb = Superblock::fresh(MIN_DEVICE_SIZE);
        sb.version = 0x0002_0000;
        let encoded = sb.encode();
        assert!(matches!(
            Superblock::decode(&encoded),
            Err(DbsError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn volume_record_round_trip_truncates_long_names() {
        let long_name = "x".repeat(300);
        let rec = VolumeRecord {
            snapshot_id: 7,
            volume_size: EXTENT_SIZE * 3,
            volume_name: long_name,
        };
        let encoded = rec.encode();
        let decoded = VolumeRecord::decode(&encoded);
        assert_eq!(decoded.volume_name.len(), MAX_VOLUME_NAME_SIZE);
        assert_eq!(decoded.snapshot_id, 7);
        assert_eq!(decoded.volume_size, EXTENT_SIZE * 3);
    }

    #[test]
    fn extent_record_bitmap_bits() {
        let mut rec = ExtentRecord::default();
        assert!(rec.bitmap_is_empty());
        rec.set_bit(0);
        rec.set_bit(255);
        assert!(rec.bit(0));
        assert!(rec.bit(255));
        assert!(!rec.bit(1));
        assert!(!rec.bitmap_is_empty());
        rec.clear_bit(0);
        rec.clear_bit(255);
        assert!(rec.bitmap_is_empty());
    }

    #[test]
    fn extent_record_round_trip() {
        let mut rec = ExtentRecord {
            snapshot_id: 3,
            extent_pos: 9,
            block_bitmap: [0u8; EXTENT_BITMAP_SIZE],
        };
        rec.set_bit(17);
        let encoded = rec.encode();
        let decoded = ExtentRecord::decode(&encoded);
        assert_eq!(rec, decoded);
    }
}
