//! On-disk format, extent allocator, snapshot lineage and COW block I/O
//! for Direct Block Store volumes.

pub mod codec;
pub mod constants;
pub mod device;
pub mod error;
pub mod extent_map;
pub mod management;
pub mod query;
pub mod volume;

pub use constants::*;
pub use device::DeviceContext;
pub use error::{DbsError, Direction, Result};
pub use extent_map::ExtentMap;
pub use management::{
    clone_snapshot, create_snapshot, create_volume, delete_snapshot, delete_volume, init_device,
    rename_volume, vacuum_device,
};
pub use query::{device_info, snapshot_info, volume_info, DeviceInfo, SnapshotInfo, VolumeInfo};
pub use volume::VolumeContext;
