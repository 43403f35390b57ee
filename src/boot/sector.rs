use bytemuck::{Pod, Zeroable};
use checked_num::CheckedU64;
use endify::Endify;

use super::{BOOT_SIGNATURE, FileSystemRevision, MAX_CLUSTER_SIZE, VolumeFlags};
use crate::Result;
use crate::error::Error;

/// The Main/Backup Boot Sector structure for an exFAT volume, as stored on
/// disk (all multi-byte fields little-endian).
#[derive(Debug, Clone, Copy, Pod, Zeroable, Endify)]
#[repr(C)]
pub struct RawBootSector {
    /// The jump instruction for CPUs to execute bootstrapping instructions in `boot_code`.
    /// - Must be `0xEB 0x76 0x90` in order (low-order byte first).
    pub(crate) jump_boot: [u8; 3],

    /// The name of the file system on the volume.
    /// - Must be `"EXFAT   "` (including three trailing spaces).
    pub(crate) filesystem_name: [u8; 8],

    /// Reserved field corresponding to the FAT12/16/32 BIOS Parameter Block.
    /// - Must be all zeroes to prevent misinterpretation by FAT-based systems.
    pub(crate) _reserved: [u8; 53],

    /// The sector offset from the beginning of the media to the partition that contains the exFAT volume.
    /// - A value of `0` indicates that this field should be ignored.
    pub(crate) partition_offset: u64,

    /// The total size of the exFAT volume in sectors.
    /// - Must be at least `2^20 / (2^BytesPerSectorShift)`, ensuring a minimum volume size of 1MB.
    pub(crate) volume_length: u64,

    /// The sector offset from the start of the volume to the First FAT.
    /// - Minimum value: `24` (accounts for boot sectors).
    /// - Maximum value: `ClusterHeapOffset - (FatLength * NumberOfFats)`.
    pub(crate) fat_offset: u32,

    /// The number of sectors occupied by each FAT.
    /// - Ensures there is enough space for all clusters in the Cluster Heap.
    pub(crate) fat_length: u32,

    /// The sector offset from the start of the volume to the Cluster Heap.
    /// - Defines where the data region (cluster storage) begins.
    pub(crate) cluster_heap_offset: u32,

    /// The number of clusters in the Cluster Heap.
    /// - Must be the lesser of `(VolumeLength - ClusterHeapOffset) / 2^SectorsPerClusterShift`
    ///   or `2^32 - 11`.
    pub(crate) cluster_count: u32,

    /// The cluster index of the first cluster in the root directory.
    /// - Must be between `2` (first valid cluster) and `ClusterCount + 1`.
    pub(crate) first_cluster_of_root_directory: u32,

    /// A unique serial number for identifying the volume.
    /// - Typically derived from the date/time of formatting.
    pub(crate) volume_serial_number: u32,

    /// The revision number of the exFAT structures on the volume.
    /// - The high byte represents the major version, and the low byte represents the minor version.
    pub(crate) file_system_revision: u16,

    /// A set of flags that indicate file system status.
    /// - **Bit 0**: `ActiveFat` (0 = First FAT, 1 = Second FAT used in TexFAT).
    /// - **Bit 1**: `VolumeDirty` (0 = clean, 1 = dirty).
    /// - **Bit 2**: `MediaFailure` (0 = no failures, 1 = known media failures).
    /// - **Bit 3**: `ClearToZero` (should be cleared before modifying file system structures).
    pub(crate) volume_flags: u16,

    /// The sector size in a power-of-two exponent.
    /// - Valid range: `9` (512 bytes) to `12` (4096 bytes).
    pub(crate) bytes_per_sector_shift: u8,

    /// The number of sectors per cluster in a power-of-two exponent.
    /// - Valid range: `0` (1 sector per cluster) to `25 - BytesPerSectorShift`.
    pub(crate) sectors_per_cluster_shift: u8,

    /// The number of File Allocation Tables (FATs) in the volume.
    /// - `1`: Only the First FAT is present.
    /// - `2`: Used in **TexFAT**, which has a Second FAT and a Second Allocation Bitmap.
    pub(crate) number_of_fats: u8,

    /// Extended INT 13h drive number, useful for bootstrapping.
    /// - Typically contains `0x80`.
    pub(crate) drive_select: u8,

    /// The percentage of allocated clusters in the Cluster Heap.
    /// - Values range from `0` to `100` (rounded down).
    /// - `0xFF` means the percentage is unknown.
    pub(crate) percent_in_use: u8,

    /// Reserved for future use. Must be set to zero.
    pub(crate) _reserved2: [u8; 7],

    /// The bootstrapping code that is executed if the volume is bootable.
    /// - If not used for booting, should be filled with `0xF4` (Halt instruction).
    pub(crate) boot_code: [u8; 390],

    /// Identifies this sector as a boot sector.
    /// - Must be `0xAA55` to be considered valid.
    pub(crate) boot_signature: u16,
}

/// The boot sector parsed, validated and converted to native quantities.
/// Built once at mount and immutable thereafter.
#[derive(Debug, Clone)]
pub struct SuperBlock {
    pub sector_bits: u8,
    pub spc_bits: u8,
    pub sector_size: u32,
    pub cluster_size: u32,
    pub sector_count: u64,
    pub cluster_count: u32,
    pub fat_sector_start: u32,
    pub fat_sector_count: u32,
    pub cluster_sector_start: u32,
    pub rootdir_cluster: u32,
    pub volume_serial: u32,
    pub fs_version: FileSystemRevision,
    pub volume_state: VolumeFlags,
    pub allocated_percent: u8,
}

impl SuperBlock {
    /// Validates a boot sector (already converted to native endianness) and
    /// builds the superblock from it.
    pub fn parse(raw: &RawBootSector) -> Result<SuperBlock> {
        if raw.jump_boot != [0xEB, 0x76, 0x90] {
            return Err(Error::corrupt("bad boot jump instruction"));
        }
        if raw.filesystem_name != *b"EXFAT   " {
            return Err(Error::corrupt("filesystem name is not EXFAT"));
        }
        if raw.boot_signature != BOOT_SIGNATURE {
            return Err(Error::corrupt("bad boot signature"));
        }
        if !(9..=12).contains(&raw.bytes_per_sector_shift) {
            return Err(Error::corrupt(format!(
                "bytes per sector shift {} outside 9..=12",
                raw.bytes_per_sector_shift
            )));
        }
        let sector_bits = raw.bytes_per_sector_shift;
        let spc_bits = raw.sectors_per_cluster_shift;
        if spc_bits > 25 - sector_bits {
            return Err(Error::corrupt(format!(
                "sectors per cluster shift {spc_bits} too large"
            )));
        }
        let sector_size = 1u32 << sector_bits;
        let cluster_size = sector_size << spc_bits;
        if cluster_size > MAX_CLUSTER_SIZE {
            return Err(Error::corrupt("cluster size above 32 MiB"));
        }

        let fs_version = FileSystemRevision {
            vermin: raw.file_system_revision as u8,
            vermaj: (raw.file_system_revision >> 8) as u8,
        };
        if fs_version.vermaj != 1 {
            return Err(Error::corrupt(format!(
                "unsupported exFAT revision {}.{:02}",
                fs_version.vermaj, fs_version.vermin
            )));
        }

        let number_of_fats = raw.number_of_fats;
        if !(1..=2).contains(&number_of_fats) {
            return Err(Error::corrupt(format!("{number_of_fats} FATs")));
        }
        let volume_state = VolumeFlags::from_bits_truncate(raw.volume_flags);
        if volume_state.contains(VolumeFlags::ACTIVE_FAT) {
            // TexFAT second-FAT volumes are not supported
            return Err(Error::corrupt("second FAT marked active"));
        }

        if raw.volume_length < (1 << (20 - sector_bits)) {
            return Err(Error::corrupt("volume smaller than 1 MiB"));
        }
        if raw.fat_offset < 24 {
            return Err(Error::corrupt("FAT overlaps the boot regions"));
        }
        let fat_end = (CheckedU64::new(raw.fat_length as u64) * number_of_fats as u64
            + raw.fat_offset as u64)
            .ok_or(Error::Corrupt("FAT region overflows".into()))?;
        if (raw.cluster_heap_offset as u64) < fat_end {
            return Err(Error::corrupt("cluster heap overlaps the FAT"));
        }

        let cluster_count = raw.cluster_count;
        let fat_bytes = (CheckedU64::new(raw.fat_length as u64) * sector_size as u64)
            .ok_or(Error::Corrupt("FAT size overflows".into()))?;
        if fat_bytes < 4 * (cluster_count as u64 + 2) {
            return Err(Error::corrupt("FAT too small for the cluster heap"));
        }

        let heap_end = (CheckedU64::new(cluster_count as u64) * (1u64 << spc_bits)
            + raw.cluster_heap_offset as u64)
            .ok_or(Error::Corrupt("cluster heap overflows".into()))?;
        if heap_end > raw.volume_length {
            return Err(Error::corrupt("cluster heap extends past the volume"));
        }

        let rootdir_cluster = raw.first_cluster_of_root_directory;
        if rootdir_cluster < 2 || rootdir_cluster > cluster_count + 1 {
            return Err(Error::corrupt(format!(
                "root directory cluster {rootdir_cluster} out of range"
            )));
        }

        Ok(SuperBlock {
            sector_bits,
            spc_bits,
            sector_size,
            cluster_size,
            sector_count: raw.volume_length,
            cluster_count,
            fat_sector_start: raw.fat_offset,
            fat_sector_count: raw.fat_length,
            cluster_sector_start: raw.cluster_heap_offset,
            rootdir_cluster,
            volume_serial: raw.volume_serial_number,
            fs_version,
            volume_state,
            allocated_percent: raw.percent_in_use,
        })
    }

    /// Whether `cluster` indexes a data cluster on this volume.
    pub fn is_valid_cluster(&self, cluster: u32) -> bool {
        cluster >= 2 && cluster - 2 < self.cluster_count
    }

    /// First sector of a data cluster.
    pub fn cluster_to_sector(&self, cluster: u32) -> u64 {
        debug_assert!(self.is_valid_cluster(cluster));
        self.cluster_sector_start as u64 + ((cluster as u64 - 2) << self.spc_bits)
    }

    /// Byte offset of a data cluster on the device.
    pub fn c2o(&self, cluster: u32) -> u64 {
        self.cluster_to_sector(cluster) << self.sector_bits
    }

    pub fn sectors_per_cluster(&self) -> u32 {
        1 << self.spc_bits
    }
}
