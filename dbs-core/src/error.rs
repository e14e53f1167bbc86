//! The closed error taxonomy for every DBS operation.

use thiserror::Error;

pub use dbs_io::Direction;

#[derive(Debug, Error)]
pub enum DbsError {
    #[error("{direction} of {len} bytes at offset {offset} failed: {source}")]
    Io {
        direction: Direction,
        offset: u64,
        len: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("backing object is not an initialized DBS device (magic mismatch)")]
    NotInitialized,

    #[error("device format version {found:#010x} is not supported (expected {expected:#010x})")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("backing object has zero size")]
    ZeroSize,

    #[error("backing object is {actual} bytes, below the minimum device size of {min} bytes")]
    TooSmall { min: u64, actual: u64 },

    #[error("volume {0:?} not found")]
    VolumeNotFound(String),

    #[error("snapshot {0} not found")]
    SnapshotNotFound(u16),

    #[error("volume {0:?} already exists")]
    VolumeExists(String),

    #[error("no free volume slots (maximum {0})")]
    OutOfVolumeSlots(usize),

    #[error("no free snapshot slots (maximum {0})")]
    OutOfSnapshotSlots(usize),

    #[error("not enough free device extents to complete the operation")]
    NoSpace,

    #[error("block index {index} is out of range for a volume with {total_blocks} blocks")]
    OutOfRange { index: u64, total_blocks: u64 },

    #[error("cannot delete snapshot {0}: it is the current tip of its volume")]
    CannotDeleteCurrent(u16),

    #[error("cannot delete snapshot {0}: it is a root with no child to merge into")]
    CannotDeleteRoot(u16),

    #[error("write requires exclusive metadata access; retry with update_metadata = true")]
    MetadataNeedsUpdate,

    #[error("{0} is not implemented")]
    NotImplemented(&'static str),

    #[error("volume name must be non-empty and at most {max} bytes (got {actual})")]
    InvalidName { max: usize, actual: usize },
}

impl From<dbs_io::StoreError> for DbsError {
    fn from(e: dbs_io::StoreError) -> Self {
        match e {
            dbs_io::StoreError::Io {
                direction,
                offset,
                len,
                source,
            } => DbsError::Io {
                direction,
                offset,
                len,
                source,
            },
            dbs_io::StoreError::Misaligned { offset, len, align } => DbsError::Io {
                direction: Direction::Read,
                offset,
                len,
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("offset/len not aligned to {align}"),
                ),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, DbsError>;
