//! On-device constants, bit-exact.

/// Eight-byte magic stamped at the start of every initialized device.
pub const MAGIC: [u8; 8] = [0x44, 0x42, 0x53, 0x40, 0x33, 0x39, 0x0D, 0x21];

/// Current on-device format version: 16-bit major | 8-bit minor | 8-bit patch.
pub const VERSION: u32 = 0x0001_0000;

/// Logical block size, and the physical alignment unit for all I/O.
pub const BLOCK_SIZE: u64 = 4096;

/// Size of one extent: the unit of on-device allocation and COW.
pub const EXTENT_SIZE: u64 = 1024 * 1024;

/// Blocks per extent (`EXTENT_SIZE / BLOCK_SIZE`).
pub const BLOCKS_PER_EXTENT: u64 = 256;

/// `log2(BLOCKS_PER_EXTENT)`, used to split a block index into an extent
/// index and a block-within-extent offset.
pub const BLOCK_BITS_IN_EXTENT: u32 = 8;

/// `BLOCKS_PER_EXTENT - 1`, used to mask out the block-within-extent offset.
pub const BLOCK_MASK_IN_EXTENT: u64 = 0xFF;

/// One presence bit per block in an extent: `BLOCKS_PER_EXTENT / 8`.
pub const EXTENT_BITMAP_SIZE: usize = 32;

pub const MAX_VOLUMES: usize = 256;
pub const MAX_SNAPSHOTS: usize = 65_535;
pub const MAX_VOLUME_NAME_SIZE: usize = 255;

/// Devices smaller than this are rejected at `init_device`.
pub const MIN_DEVICE_SIZE: u64 = 100 * 1024 * 1024;

/// On-disk size of a superblock record before zero-padding to a block.
pub const SUPERBLOCK_RECORD_SIZE: usize = 8 + 4 + 4 + 8;

/// On-disk size of one volume-table record.
pub const VOLUME_RECORD_SIZE: usize = 2 + 8 + 256;

/// On-disk size of one snapshot-table record.
pub const SNAPSHOT_RECORD_SIZE: usize = 2 + 8;

/// On-disk size of one extent-metadata record.
pub const EXTENT_RECORD_SIZE: usize = 2 + 4 + EXTENT_BITMAP_SIZE;

/// Upper bound on how many extent-metadata records a single codec call
/// reads or writes, to bound peak memory use on large devices.
pub const EXTENT_BATCH: usize = 65_536;
