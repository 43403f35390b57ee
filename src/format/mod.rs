//! Volume formatting: lays out the boot regions, FAT, allocation bitmap,
//! upcase table and root directory on an empty device. Backs the optional
//! `format` host operation and the test harness.

use bytemuck::bytes_of;
use checked_num::CheckedU64;
use derive_builder::Builder;

use crate::boot::checksum::Checksum;
use crate::boot::sector::RawBootSector;
use crate::boot::{
    BACKUP_BOOT_OFFSET, BOOT_SIGNATURE, DRIVE_SELECT, EXTENDED_BOOT, EXTENDED_BOOT_SIGNATURE,
    FIRST_USABLE_CLUSTER_INDEX, MAX_CLUSTER_COUNT, MAX_CLUSTER_SIZE, VolumeSerialNumber,
};
use crate::cache::io::CachedDisk;
use crate::dir::entry::{BitmapEntry, LabelEntry, TYPE_BITMAP, TYPE_LABEL, TYPE_UPCASE, UpcaseEntry};
use crate::error::Error;
use crate::fat::FatEntry;
use crate::upcase::{UpcaseTable, table_checksum};
use crate::{DEFAULT_BOUNDARY_ALIGNMENT, GB, KB, MB, Result};

/// A struct of exFAT formatting options. It implements the
/// [`derive_builder::Builder`] pattern.
#[derive(Builder, Clone, Debug)]
#[builder(build_fn(validate = "Self::validate"))]
pub struct FormatVolumeOptions {
    /// Size of the target volume (in bytes).
    dev_size: u64,
    /// Amount of bytes per sector. Must be a power of `2` and between `512`
    /// and `4096`.
    bytes_per_sector: u16,
    /// Bytes per cluster; chosen from the volume size when not given.
    #[builder(default, setter(strip_option))]
    bytes_per_cluster: Option<u32>,
    /// Volume label, at most 11 UTF-16 code units.
    #[builder(default, setter(strip_option))]
    label: Option<String>,
    /// Byte alignment for the FAT and the cluster heap. Defaults to
    /// [`DEFAULT_BOUNDARY_ALIGNMENT`].
    #[builder(default = DEFAULT_BOUNDARY_ALIGNMENT)]
    boundary_align: u32,
    /// Whether to zero the whole data area as well, which takes longer.
    /// Defaults to `false`.
    #[builder(default)]
    full_format: bool,
}

impl FormatVolumeOptionsBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        if let Some(bytes_per_sector) = self.bytes_per_sector {
            if !bytes_per_sector.is_power_of_two() || !(512..=4096).contains(&bytes_per_sector) {
                return Err(
                    "Bytes per sector field must be a power of two and between `512` and `4096`."
                        .to_string(),
                );
            }
        }
        if let Some(boundary_align) = self.boundary_align {
            if !boundary_align.is_power_of_two() {
                return Err("Boundary alignment field must be a power of two.".to_string());
            }
        }
        if let Some(Some(label)) = &self.label {
            if label.encode_utf16().count() > 11 {
                return Err("Volume label exceeds 11 code units.".to_string())
            }
        }
        Ok(())
    }
}

/// Default cluster size based on the volume size.
fn default_cluster_size(size: u64) -> u32 {
    const FIRST_BOUND: u64 = 256 * MB as u64;
    const FROM_FIRST_BOUND: u64 = FIRST_BOUND + 1;

    const SECOND_BOUND: u64 = 32 * GB as u64;
    const FROM_SECOND_BOUND: u64 = SECOND_BOUND + 1;

    match size {
        ..=FIRST_BOUND => 4 * KB as u32,
        FROM_FIRST_BOUND..=SECOND_BOUND => 32 * KB as u32,
        FROM_SECOND_BOUND.. => 128 * KB as u32,
    }
}

/// Computed volume geometry, ready to be written.
#[derive(Clone, Debug)]
pub struct Formatter {
    options: FormatVolumeOptions,
    bytes_per_cluster: u32,
    volume_length: u64,
    fat_offset: u32,
    fat_length: u32,
    cluster_heap_offset: u32,
    cluster_count: u32,
    cluster_count_used: u32,
    first_cluster_of_root_directory: u32,
    bitmap_length_bytes: u32,
    bitmap_offset_bytes: u64,
    upcase_start_cluster: u32,
    uptable_offset_bytes: u64,
    root_offset_bytes: u64,
    volume_serial_number: u32,
}

impl Formatter {
    pub fn try_new(options: FormatVolumeOptions) -> Result<Formatter> {
        let size = options.dev_size;
        let bytes_per_sector = options.bytes_per_sector;
        let bytes_per_cluster = options
            .bytes_per_cluster
            .unwrap_or_else(|| default_cluster_size(size));

        if !bytes_per_cluster.is_power_of_two()
            || !(bytes_per_sector as u32..=MAX_CLUSTER_SIZE).contains(&bytes_per_cluster)
        {
            return Err(Error::InvalidArgument("bad cluster size"));
        }
        let bytes_per_sector_shift = bytes_per_sector.ilog2() as u8;

        let volume_length = size / bytes_per_sector as u64;
        if volume_length < (1 << (20 - bytes_per_sector_shift)) {
            return Err(Error::InvalidArgument("volume smaller than 1 MiB"));
        }

        let fat_offset_bytes: u64 = (CheckedU64::new(bytes_per_sector as u64) * 24)
            .ok_or(Error::InvalidArgument("bad sector size"))?
            .next_multiple_of(options.boundary_align as u64);
        let fat_offset: u32 = (fat_offset_bytes / bytes_per_sector as u64)
            .try_into()
            .map_err(|_| Error::InvalidArgument("boundary alignment too big"))?;

        let max_clusters: CheckedU64 = ((CheckedU64::new(size) - fat_offset_bytes - 8 - 1)
            / (bytes_per_cluster as u64 + 4)
            + 1)
        .ok_or(Error::InvalidArgument("volume too small"))?
        .into();

        let fat_length_bytes = ((max_clusters + 2) * 4)
            .ok_or(Error::InvalidArgument("volume too large for its FAT"))?
            .next_multiple_of(bytes_per_sector as u64);
        let fat_length: u32 = (fat_length_bytes / bytes_per_sector as u64)
            .try_into()
            .map_err(|_| Error::InvalidArgument("volume too large for its FAT"))?;

        let cluster_heap_offset_bytes =
            (fat_offset_bytes + fat_length_bytes).next_multiple_of(options.boundary_align as u64);
        if cluster_heap_offset_bytes >= size {
            return Err(Error::InvalidArgument("boundary alignment too big"));
        }
        let cluster_heap_offset: u32 = (cluster_heap_offset_bytes / bytes_per_sector as u64)
            .try_into()
            .map_err(|_| Error::InvalidArgument("boundary alignment too big"))?;

        let cluster_count: u32 = ((size - cluster_heap_offset_bytes) / bytes_per_cluster as u64)
            .try_into()
            .map_err(|_| Error::InvalidArgument("bad cluster size"))?;
        if cluster_count
            > MAX_CLUSTER_COUNT.min(
                ((volume_length - cluster_heap_offset as u64)
                    >> (bytes_per_cluster / bytes_per_sector as u32).ilog2()) as u32,
            )
        {
            return Err(Error::InvalidArgument("bad cluster size"));
        }

        // bitmap occupies the first clusters of the heap
        let bitmap_length_bytes = cluster_count.next_multiple_of(8) / 8;
        let bitmap_clusters = bitmap_length_bytes.next_multiple_of(bytes_per_cluster) / bytes_per_cluster;

        let upcase_len_bytes = UpcaseTable::ascii().to_bytes().len() as u32;
        let upcase_start_cluster = FIRST_USABLE_CLUSTER_INDEX + bitmap_clusters;
        let upcase_clusters = upcase_len_bytes.next_multiple_of(bytes_per_cluster) / bytes_per_cluster;

        let first_cluster_of_root_directory = upcase_start_cluster + upcase_clusters;
        let cluster_count_used = bitmap_clusters + upcase_clusters + 1;
        if cluster_count <= cluster_count_used {
            return Err(Error::InvalidArgument("volume too small"));
        }

        let bitmap_offset_bytes = cluster_heap_offset_bytes;
        let uptable_offset_bytes =
            bitmap_offset_bytes + bitmap_clusters as u64 * bytes_per_cluster as u64;
        let root_offset_bytes =
            uptable_offset_bytes + upcase_clusters as u64 * bytes_per_cluster as u64;

        let volume_serial_number = VolumeSerialNumber::try_new()
            .map_err(|_| Error::InvalidArgument("system clock before the epoch"))?
            .0;

        Ok(Formatter {
            options,
            bytes_per_cluster,
            volume_length,
            fat_offset,
            fat_length,
            cluster_heap_offset,
            cluster_count,
            cluster_count_used,
            first_cluster_of_root_directory,
            bitmap_length_bytes,
            bitmap_offset_bytes,
            upcase_start_cluster,
            uptable_offset_bytes,
            root_offset_bytes,
            volume_serial_number,
        })
    }

    /// Writes the volume onto the device, through the block cache, and
    /// syncs.
    pub fn write(&self, disk: &CachedDisk) -> Result<()> {
        if disk.sector_size() != self.options.bytes_per_sector as u32 {
            return Err(Error::InvalidArgument("device sector size mismatch"));
        }
        if disk.size_bytes() < self.options.dev_size {
            return Err(Error::InvalidArgument("device smaller than the volume"));
        }

        // clear the metadata region (or everything, for a full format)
        let zero_to = if self.options.full_format {
            self.options.dev_size
        } else {
            self.root_offset_bytes + self.bytes_per_cluster as u64
        };
        disk.write_zeroes(0, zero_to)?;

        self.write_boot_region(disk, 0)?;
        self.write_boot_region(disk, BACKUP_BOOT_OFFSET)?;
        self.write_fat(disk)?;
        self.write_bitmap(disk)?;
        self.write_upcase_table(disk)?;
        self.write_root_dir(disk)?;

        disk.sync()?;
        Ok(())
    }

    fn boot_sector(&self) -> RawBootSector {
        RawBootSector {
            jump_boot: [0xEB, 0x76, 0x90],
            filesystem_name: *b"EXFAT   ",
            _reserved: [0; 53],
            partition_offset: 0,
            volume_length: self.volume_length.to_le(),
            fat_offset: self.fat_offset.to_le(),
            fat_length: self.fat_length.to_le(),
            cluster_heap_offset: self.cluster_heap_offset.to_le(),
            cluster_count: self.cluster_count.to_le(),
            first_cluster_of_root_directory: self.first_cluster_of_root_directory.to_le(),
            volume_serial_number: self.volume_serial_number.to_le(),
            file_system_revision: 0x0100u16.to_le(),
            volume_flags: 0,
            bytes_per_sector_shift: self.options.bytes_per_sector.ilog2() as u8,
            sectors_per_cluster_shift: (self.bytes_per_cluster
                / self.options.bytes_per_sector as u32)
                .ilog2() as u8,
            number_of_fats: 1,
            drive_select: DRIVE_SELECT,
            percent_in_use: (self.cluster_count_used as u64 * 100 / self.cluster_count as u64)
                as u8,
            _reserved2: [0; 7],
            boot_code: [0xF4; 390],
            boot_signature: BOOT_SIGNATURE.to_le(),
        }
    }

    fn write_boot_region(&self, disk: &CachedDisk, offset_sectors: u64) -> Result<()> {
        let ss = self.options.bytes_per_sector as usize;
        let base = offset_sectors * ss as u64;
        let mut checksum = Checksum::new();

        // main boot sector (512 significant bytes, rest of the sector zero)
        let boot = self.boot_sector();
        let mut sector = vec![0u8; ss];
        sector[..size_of::<RawBootSector>()].copy_from_slice(bytes_of(&boot));
        disk.write_bytes(base, &sector)?;
        checksum.boot_sector(&sector);

        // extended boot sectors carry only their trailing signature
        let mut extended = vec![0u8; ss];
        extended[ss - 4..].copy_from_slice(&EXTENDED_BOOT_SIGNATURE.to_le_bytes());
        for i in 0..EXTENDED_BOOT {
            disk.write_bytes(base + (1 + i) * ss as u64, &extended)?;
            checksum.sector(&extended);
        }

        // OEM parameter and reserved sectors stay zero
        let zero = vec![0u8; ss];
        checksum.sector(&zero);
        checksum.sector(&zero);

        let mut checksum_sector = vec![0u8; ss];
        for word in checksum_sector.chunks_exact_mut(4) {
            word.copy_from_slice(&checksum.get().to_le_bytes());
        }
        disk.write_bytes(base + 11 * ss as u64, &checksum_sector)?;
        Ok(())
    }

    fn write_fat(&self, disk: &CachedDisk) -> Result<()> {
        self.write_fat_entry(disk, FatEntry::media_type(), 0)?;
        self.write_fat_entry(disk, FatEntry::eof(), 1)?;

        // chains for the bitmap, the upcase table and the root directory
        let mut index = self.write_fat_chain(
            disk,
            FIRST_USABLE_CLUSTER_INDEX,
            self.upcase_start_cluster - FIRST_USABLE_CLUSTER_INDEX,
        )?;
        index = self.write_fat_chain(
            disk,
            index,
            self.first_cluster_of_root_directory - self.upcase_start_cluster,
        )?;
        self.write_fat_chain(disk, index, 1)?;
        Ok(())
    }

    fn write_fat_entry(&self, disk: &CachedDisk, entry: FatEntry, index: u64) -> Result<()> {
        let offset =
            self.fat_offset as u64 * self.options.bytes_per_sector as u64 + index * 4;
        disk.write_bytes(offset, &entry.0.to_le_bytes())?;
        Ok(())
    }

    /// Writes one cluster chain and returns the next free cluster index.
    fn write_fat_chain(&self, disk: &CachedDisk, cluster: u32, count: u32) -> Result<u32> {
        let end = cluster + count;
        for current in cluster..end - 1 {
            self.write_fat_entry(disk, FatEntry(current + 1), current as u64)?;
        }
        self.write_fat_entry(disk, FatEntry::eof(), end as u64 - 1)?;
        Ok(end)
    }

    fn write_bitmap(&self, disk: &CachedDisk) -> Result<()> {
        let full_bytes = (self.cluster_count_used / 8) as usize;
        let remaining_bits = self.cluster_count_used % 8;
        let mut bitmap = vec![0u8; full_bytes + 1];
        bitmap[..full_bytes].fill(0xFF);
        if remaining_bits != 0 {
            bitmap[full_bytes] = (1u8 << remaining_bits) - 1;
        }
        disk.write_bytes(self.bitmap_offset_bytes, &bitmap)?;
        Ok(())
    }

    fn write_upcase_table(&self, disk: &CachedDisk) -> Result<()> {
        disk.write_bytes(self.uptable_offset_bytes, &UpcaseTable::ascii().to_bytes())?;
        Ok(())
    }

    fn write_root_dir(&self, disk: &CachedDisk) -> Result<()> {
        let mut entries: Vec<u8> = Vec::new();

        if let Some(label) = &self.options.label {
            let units: Vec<u16> = label.encode_utf16().collect();
            let mut volume_label = [0u8; 22];
            for (i, unit) in units.iter().enumerate() {
                volume_label[i * 2..i * 2 + 2].copy_from_slice(&unit.to_le_bytes());
            }
            let entry = LabelEntry {
                entry_type: TYPE_LABEL,
                character_count: units.len() as u8,
                volume_label,
                _reserved: [0; 8],
            };
            entries.extend_from_slice(bytes_of(&entry));
        }

        let bitmap = BitmapEntry {
            entry_type: TYPE_BITMAP,
            flags: 0,
            _reserved: [0; 18],
            first_cluster: FIRST_USABLE_CLUSTER_INDEX.to_le(),
            data_len: (self.bitmap_length_bytes as u64).to_le(),
        };
        entries.extend_from_slice(bytes_of(&bitmap));

        let table = UpcaseTable::ascii().to_bytes();
        let upcase = UpcaseEntry {
            entry_type: TYPE_UPCASE,
            _reserved1: [0; 3],
            table_checksum: table_checksum(&table).to_le(),
            _reserved2: [0; 12],
            first_cluster: self.upcase_start_cluster.to_le(),
            data_len: (table.len() as u64).to_le(),
        };
        entries.extend_from_slice(bytes_of(&upcase));

        disk.write_bytes(self.root_offset_bytes, &entries)?;
        Ok(())
    }
}

/// Formats a device in one call.
pub fn mkfs(disk: &CachedDisk, options: FormatVolumeOptions) -> Result<()> {
    Formatter::try_new(options)?.write(disk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::RamDisk;

    fn format_image(size: u64, sector: u32) -> CachedDisk {
        let disk = CachedDisk::with_defaults(Box::new(RamDisk::new(size, sector))).unwrap();
        let options = FormatVolumeOptionsBuilder::default()
            .dev_size(size)
            .bytes_per_sector(sector as u16)
            .label("Hello".to_string())
            .build()
            .unwrap();
        mkfs(&disk, options).unwrap();
        disk
    }

    #[test]
    fn small_format_has_valid_boot_regions() {
        let disk = format_image(32 * MB as u64, 512);

        let mut sector = vec![0u8; 512];
        disk.read_bytes(0, &mut sector).unwrap();
        assert_eq!(&sector[0..3], &[0xEB, 0x76, 0x90]);
        assert_eq!(&sector[3..11], b"EXFAT   ");
        assert_eq!(&sector[510..512], &[0x55, 0xAA]);
        assert_eq!(sector[108], 9); // bytes per sector shift
        // 4 KiB clusters for small volumes
        assert_eq!(sector[109], 3);

        // backup boot region is byte-identical
        let mut backup = vec![0u8; 512];
        disk.read_bytes(12 * 512, &mut backup).unwrap();
        assert_eq!(sector, backup);

        // FAT starts with the media type and reserved entries
        let fat_offset = u32::from_le_bytes(sector[80..84].try_into().unwrap()) as u64 * 512;
        let mut fat = vec![0u8; 8];
        disk.read_bytes(fat_offset, &mut fat).unwrap();
        assert_eq!(u32::from_le_bytes(fat[0..4].try_into().unwrap()), 0xFFFFFFF8);
        assert_eq!(u32::from_le_bytes(fat[4..8].try_into().unwrap()), 0xFFFFFFFF);
    }

    #[test]
    fn bad_sector_sizes_are_rejected() {
        assert!(
            FormatVolumeOptionsBuilder::default()
                .dev_size(32 * MB as u64)
                .bytes_per_sector(300u16)
                .build()
                .is_err()
        );
        assert!(
            FormatVolumeOptionsBuilder::default()
                .dev_size(32 * MB as u64)
                .bytes_per_sector(8192u16)
                .build()
                .is_err()
        );
    }

    #[test]
    fn tiny_volumes_are_rejected() {
        let options = FormatVolumeOptionsBuilder::default()
            .dev_size(512 * 1024)
            .bytes_per_sector(512u16)
            .build()
            .unwrap();
        assert!(Formatter::try_new(options).is_err());
    }
}
