//! Volume-metadata service contract.

use crate::error::Result;

/// Mount state of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeMountStatus {
    Mounted,
    Unmounted,
}

/// Read-only view of volume metadata maintained elsewhere.
pub trait VolumeInfoManager: Send + Sync {
    fn mount_status(&self, volume_id: u32) -> VolumeMountStatus;

    /// Size of the volume in bytes.
    fn volume_size(&self, volume_id: u32) -> Result<u64>;
}
