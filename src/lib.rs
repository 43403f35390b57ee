//! # exfat-rw
//!
//! Read/write implementation of the exFAT filesystem on top of a bounded,
//! segmented-LRU block cache that mediates all sector I/O to the backing
//! device.
//!
//! ## Usage
//!
//! ```rust
//! use exfat_rw::MB;
//! use exfat_rw::cache::io::CachedDisk;
//! use exfat_rw::disk::RamDisk;
//! use exfat_rw::format::{FormatVolumeOptionsBuilder, mkfs};
//! use exfat_rw::fs::{ExfatFs, MountOptions};
//!
//! let dev = RamDisk::new(16 * MB as u64, 512);
//! let disk = CachedDisk::with_defaults(Box::new(dev)).unwrap();
//!
//! let options = FormatVolumeOptionsBuilder::default()
//!     .dev_size(16 * MB as u64)
//!     .bytes_per_sector(512u16)
//!     .label("Hello".to_string())
//!     .build()
//!     .unwrap();
//! mkfs(&disk, options).unwrap();
//!
//! let fs = ExfatFs::mount(disk, MountOptions::default()).unwrap();
//! let file = fs.create("/greeting.txt").unwrap();
//! fs.write(&file, b"hello exfat", 0).unwrap();
//! fs.put(file).unwrap();
//! fs.unmount().unwrap();
//! ```

/// Cluster bitmap allocator.
pub mod bitmap;
/// Boot region structures and the VBR checksum.
pub mod boot;
/// Segmented-LRU block cache.
pub mod cache;
/// Directory entry codec and directory traversal.
pub mod dir;
/// Sector device abstractions.
pub mod disk;
pub mod error;
/// FAT access and cluster chain navigation.
pub mod fat;
/// Volume formatting.
pub mod format;
/// Mounted filesystem operations.
pub mod fs;
/// In-memory file/directory nodes.
pub mod node;
/// exFAT timestamp codec.
pub mod timestamp;
/// Upcase table and name folding.
pub mod upcase;

pub use error::{DeviceError, Error};

pub const GB: u32 = 1024 * 1024 * 1024;
pub const MB: u32 = 1024 * 1024;
pub const KB: u16 = 1024;

pub const DEFAULT_BOUNDARY_ALIGNMENT: u32 = 1024 * 1024;

pub(crate) type Result<T, E = Error> = core::result::Result<T, E>;
