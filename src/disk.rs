use std::fs::File;
use std::path::Path;

use crate::error::DeviceError;

/// Smallest sector size accepted from a backing device.
pub const MIN_SECTOR_SIZE: u32 = 256;

/// Sector-granular access to a single backing store of known size.
///
/// Implementations make no concurrency guarantees; the block cache
/// serialises every call.
pub trait SectorDevice: Send {
    /// Reads `buf.len() / sector_size` sectors starting at `sector`.
    /// `buf` must be a whole multiple of the sector size.
    fn read_sectors(&mut self, sector: u64, buf: &mut [u8]) -> Result<(), DeviceError>;

    /// Writes `buf.len() / sector_size` sectors starting at `sector`.
    fn write_sectors(&mut self, sector: u64, buf: &[u8]) -> Result<(), DeviceError>;

    /// Flushes lower-level driver caches.
    fn sync(&mut self) -> Result<(), DeviceError>;

    fn sector_count(&self) -> u64;

    fn sector_size(&self) -> u32;

    fn write_protected(&self) -> bool {
        false
    }
}

pub(crate) fn valid_sector_size(sector_size: u32) -> bool {
    sector_size.is_power_of_two() && sector_size >= MIN_SECTOR_SIZE
}

fn check_range(
    sector: u64,
    len: usize,
    sector_size: u32,
    sector_count: u64,
) -> Result<u64, DeviceError> {
    if len % sector_size as usize != 0 {
        return Err(DeviceError::OutOfBounds);
    }
    let count = (len / sector_size as usize) as u64;
    if sector >= sector_count || count > sector_count - sector {
        return Err(DeviceError::OutOfBounds);
    }
    Ok(count)
}

/// A device backed by a regular file or a raw block device node.
pub struct FileDisk {
    file: File,
    sector_size: u32,
    sector_count: u64,
    read_only: bool,
    dirty: bool,
}

impl FileDisk {
    /// Wraps an already opened file. The usable size is rounded down to a
    /// whole number of sectors.
    pub fn from_file(file: File, sector_size: u32, read_only: bool) -> Result<Self, DeviceError> {
        if !valid_sector_size(sector_size) {
            return Err(DeviceError::OutOfBounds);
        }
        let len = file.metadata()?.len();
        Ok(FileDisk {
            file,
            sector_size,
            sector_count: len / sector_size as u64,
            read_only,
            dirty: false,
        })
    }

    pub fn open(path: impl AsRef<Path>, sector_size: u32) -> Result<Self, DeviceError> {
        let file = File::options().read(true).write(true).open(path)?;
        Self::from_file(file, sector_size, false)
    }

    pub fn open_read_only(path: impl AsRef<Path>, sector_size: u32) -> Result<Self, DeviceError> {
        let file = File::open(path)?;
        Self::from_file(file, sector_size, true)
    }

    #[cfg(unix)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
        std::os::unix::fs::FileExt::read_exact_at(&self.file, buf, offset)
    }

    #[cfg(windows)]
    fn read_at(&self, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
        while !buf.is_empty() {
            let n = std::os::windows::fs::FileExt::seek_read(&self.file, buf, offset)?;
            if n == 0 {
                return Err(std::io::ErrorKind::UnexpectedEof.into());
            }
            buf = &mut buf[n..];
            offset += n as u64;
        }
        Ok(())
    }

    #[cfg(unix)]
    fn write_at(&self, buf: &[u8], offset: u64) -> std::io::Result<()> {
        std::os::unix::fs::FileExt::write_all_at(&self.file, buf, offset)
    }

    #[cfg(windows)]
    fn write_at(&self, mut buf: &[u8], mut offset: u64) -> std::io::Result<()> {
        while !buf.is_empty() {
            let n = std::os::windows::fs::FileExt::seek_write(&self.file, buf, offset)?;
            if n == 0 {
                return Err(std::io::ErrorKind::WriteZero.into());
            }
            buf = &buf[n..];
            offset += n as u64;
        }
        Ok(())
    }
}

impl SectorDevice for FileDisk {
    fn read_sectors(&mut self, sector: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
        check_range(sector, buf.len(), self.sector_size, self.sector_count)?;
        self.read_at(buf, sector * self.sector_size as u64)?;
        Ok(())
    }

    fn write_sectors(&mut self, sector: u64, buf: &[u8]) -> Result<(), DeviceError> {
        if self.read_only {
            return Err(DeviceError::WriteProtected);
        }
        check_range(sector, buf.len(), self.sector_size, self.sector_count)?;
        self.write_at(buf, sector * self.sector_size as u64)?;
        self.dirty = true;
        Ok(())
    }

    fn sync(&mut self) -> Result<(), DeviceError> {
        if self.dirty {
            self.file.sync_data()?;
            self.dirty = false;
        }
        Ok(())
    }

    fn sector_count(&self) -> u64 {
        self.sector_count
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn write_protected(&self) -> bool {
        self.read_only
    }
}

/// A memory-backed device, mainly useful for tests and scratch images.
pub struct RamDisk {
    data: Vec<u8>,
    sector_size: u32,
}

impl RamDisk {
    pub fn new(size: u64, sector_size: u32) -> RamDisk {
        assert!(valid_sector_size(sector_size), "bad sector size");
        let size = size - size % sector_size as u64;
        RamDisk {
            data: vec![0u8; size as usize],
            sector_size,
        }
    }

    pub fn from_vec(data: Vec<u8>, sector_size: u32) -> RamDisk {
        assert!(valid_sector_size(sector_size), "bad sector size");
        assert_eq!(data.len() % sector_size as usize, 0);
        RamDisk { data, sector_size }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl SectorDevice for RamDisk {
    fn read_sectors(&mut self, sector: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
        check_range(sector, buf.len(), self.sector_size, self.sector_count())?;
        let start = (sector * self.sector_size as u64) as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }

    fn write_sectors(&mut self, sector: u64, buf: &[u8]) -> Result<(), DeviceError> {
        check_range(sector, buf.len(), self.sector_size, self.sector_count())?;
        let start = (sector * self.sector_size as u64) as usize;
        self.data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn sector_count(&self) -> u64 {
        self.data.len() as u64 / self.sector_size as u64
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ram_disk_round_trip() {
        let mut disk = RamDisk::new(1024 * 1024, 512);
        let pattern: Vec<u8> = (0..512u32).map(|i| i as u8).collect();
        disk.write_sectors(7, &pattern).unwrap();
        let mut back = vec![0u8; 512];
        disk.read_sectors(7, &mut back).unwrap();
        assert_eq!(back, pattern);
    }

    #[test]
    fn out_of_bounds_rejected() {
        let mut disk = RamDisk::new(4096, 512);
        let buf = [0u8; 512];
        assert!(matches!(
            disk.write_sectors(8, &buf),
            Err(DeviceError::OutOfBounds)
        ));
        let mut buf = [0u8; 1024];
        assert!(matches!(
            disk.read_sectors(7, &mut buf),
            Err(DeviceError::OutOfBounds)
        ));
    }

    #[test]
    fn file_disk_round_trip() {
        let file = tempfile::tempfile().unwrap();
        file.set_len(1024 * 1024).unwrap();
        let mut disk = FileDisk::from_file(file, 512, false).unwrap();
        assert_eq!(disk.sector_count(), 2048);
        let pattern = [0xA5u8; 512];
        disk.write_sectors(100, &pattern).unwrap();
        disk.sync().unwrap();
        let mut back = [0u8; 512];
        disk.read_sectors(100, &mut back).unwrap();
        assert_eq!(back, pattern);
    }
}
