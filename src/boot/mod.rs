// boot regions

use bitflags::bitflags;

use crate::MB;
use std::time::{SystemTime, SystemTimeError, UNIX_EPOCH};

pub mod checksum;
pub mod sector;

/// Offset (in sectors) of the main boot region.
pub const MAIN_BOOT_OFFSET: u64 = 0;
/// Offset (in sectors) of the backup boot region.
pub const BACKUP_BOOT_OFFSET: u64 = 12;
/// Number of extended boot sectors per boot region.
pub const EXTENDED_BOOT: u64 = 8;
/// Sector index (within a boot region) of the checksum sector.
pub const CHECKSUM_SECTOR: u64 = 11;
/// Sectors covered by one VBR, checksum sector included.
pub const VBR_SECTORS: u64 = 12;

/// Maximum amount of clusters
pub const MAX_CLUSTER_COUNT: u32 = 0xFFFFFFF5;
/// Maximum size of clusters
pub const MAX_CLUSTER_SIZE: u32 = 32 * MB;

pub const FIRST_USABLE_CLUSTER_INDEX: u32 = 2;
pub const DRIVE_SELECT: u8 = 0x80;
pub const BOOT_SIGNATURE: u16 = 0xAA55;
pub const EXTENDED_BOOT_SIGNATURE: u32 = 0xAA550000;

/// Structure representing the file system revision.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSystemRevision {
    /// Minor version of the exFAT file system (low-order byte).
    pub vermin: u8,
    /// Major version of the exFAT file system (high-order byte).
    pub vermaj: u8,
}

impl Default for FileSystemRevision {
    fn default() -> Self {
        Self {
            vermin: 0,
            vermaj: 1,
        }
    }
}

/// Structure representing the unique volume serial number.
#[repr(transparent)]
#[derive(Copy, Clone, Debug)]
pub struct VolumeSerialNumber(pub u32);

impl VolumeSerialNumber {
    pub fn try_new() -> Result<VolumeSerialNumber, SystemTimeError> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?;
        Ok(VolumeSerialNumber(now.as_secs() as u32))
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    #[repr(C)]
    pub struct VolumeFlags: u16 {
        /// The ActiveFat field shall describe which FAT and Allocation Bitmap are active (and implementations shall use), as follows:
        /// - 0, which means the First FAT and First Allocation Bitmap are active
        /// - 1, which means the Second FAT and Second Allocation Bitmap are active and is possible only when the NumberOfFats field contains the value 2
        const ACTIVE_FAT = 1;
        /// The VolumeDirty field shall describe whether the volume is dirty or not, as follows:
        /// - 0, which means the volume is probably in a consistent state
        /// - 1, which means the volume is probably in an inconsistent state
        const DIRTY = 1 << 1;
        /// The MediaFailure field shall describe whether an implementation has discovered media failures or not, as follows:
        /// - 0, which means the hosting media has not reported failures or any known failures are already recorded in the FAT as "bad" clusters
        /// - 1, which means the hosting media has reported failures (i.e. has failed read or write operations)
        const MEDIA_FAILURE = 1 << 2;
        // remaining bits are reserved
    }
}
