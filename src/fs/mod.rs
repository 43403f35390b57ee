//! The mounted filesystem: superblock handling, node writeback, volume
//! state maintenance and the host-facing operation surface.

use std::sync::{Arc, Mutex};

use bytemuck::pod_read_unaligned;
use endify::Endify;

use crate::Result;
use crate::bitmap::ClusterBitmap;
use crate::boot::checksum::Checksum;
use crate::boot::sector::{RawBootSector, SuperBlock};
use crate::boot::{CHECKSUM_SECTOR, VolumeFlags};
use crate::cache::io::CachedDisk;
use crate::dir::Directory;
use crate::dir::entry::{
    DirEntry, ENTRY_SIZE, EntrySet, FileAttributes, MAX_NAME_LENGTH, TYPE_LABEL,
};
use crate::error::Error;
use crate::fat::{CLUSTER_END, CLUSTER_FREE, FatEntry, FatTable};
use crate::node::{Node, NodeFlags, NodeInner, NodeTable};
use crate::timestamp::{Timestamp, Timestamps};
use crate::upcase::{UpcaseTable, table_checksum};

mod io;
mod lookup;
mod namei;
pub mod options;

pub use lookup::DirentInfo;
pub use options::MountOptions;

/// Filesystem-wide statistics, as reported to `statfs`.
#[derive(Copy, Clone, Debug)]
pub struct StatFs {
    pub sector_size: u32,
    pub cluster_size: u32,
    pub cluster_count: u32,
    pub free_clusters: u32,
    pub name_max: u32,
}

/// Per-node attributes, as reported to `getattr`.
#[derive(Copy, Clone, Debug)]
pub struct Stat {
    pub size: u64,
    pub is_directory: bool,
    pub attributes: FileAttributes,
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub atime: i64,
    pub mtime: i64,
    pub crtime: i64,
}

/// A mounted exFAT volume.
pub struct ExfatFs {
    pub(crate) disk: CachedDisk,
    pub(crate) sb: SuperBlock,
    pub(crate) fat: FatTable,
    pub(crate) upcase: UpcaseTable,
    pub(crate) bitmap: Mutex<ClusterBitmap>,
    pub(crate) nodes: Mutex<NodeTable>,
    pub(crate) root: Arc<Node>,
    pub(crate) opts: MountOptions,
    read_only: bool,
    label: Mutex<Option<String>>,
    /// Offset of the label entry within the root directory, if present.
    label_offset: Mutex<Option<u64>>,
}

impl ExfatFs {
    /// Mounts a volume: validates the boot region and its checksum sector,
    /// loads the allocation bitmap and the upcase table from the root
    /// directory, applies the mount options and (for writable mounts)
    /// raises the volume dirty flag.
    pub fn mount(disk: CachedDisk, opts: MountOptions) -> Result<Arc<ExfatFs>> {
        let mut raw = [0u8; size_of::<RawBootSector>()];
        disk.read_bytes(0, &mut raw)?;
        let raw: RawBootSector = Endify::from_le(pod_read_unaligned(&raw));
        let sb = SuperBlock::parse(&raw)?;

        if sb.sector_size != disk.sector_size() {
            return Err(Error::InvalidArgument(
                "volume sector size does not match the device",
            ));
        }
        if sb.sector_count > disk.sector_count() {
            return Err(Error::corrupt("volume extends past the device"));
        }
        Self::verify_vbr_checksum(&disk, &sb)?;

        let mut read_only = opts.read_only;
        if !read_only && disk.write_protected() {
            if opts.ro_fallback {
                log::warn!("exfat: device is write protected, mounting read-only");
                read_only = true;
            } else {
                return Err(Error::ReadOnly);
            }
        }
        if sb.volume_state.contains(VolumeFlags::DIRTY) {
            if !read_only && opts.ro_fallback {
                log::warn!("exfat: volume was not unmounted cleanly, mounting read-only");
                read_only = true;
            } else {
                log::warn!("exfat: volume was not unmounted cleanly");
            }
        }

        let fat = FatTable::new(&sb);
        let root_chain = fat.collect_chain(&disk, &sb, sb.rootdir_cluster)?;
        let root_size = root_chain.len() as u64 * sb.cluster_size as u64;
        let root = Arc::new(Node::new_root(
            sb.rootdir_cluster,
            root_size,
            Timestamps::all(Timestamp::now()),
        ));

        // scan the root directory for the bitmap, upcase table and label
        let mut bitmap_entry: Option<(u32, u64)> = None;
        let mut upcase_entry: Option<(u32, u64, u32)> = None;
        let mut label: Option<String> = None;
        let mut label_offset: Option<u64> = None;
        {
            let root_dir = Directory {
                disk: &disk,
                sb: &sb,
                fat: &fat,
                first_cluster: sb.rootdir_cluster,
                contiguous: false,
                size: root_size,
            };
            let mut stream = root_dir.stream();
            while let Some((offset, raw)) = stream.next_raw()? {
                match DirEntry::parse(&raw) {
                    DirEntry::EndOfDirectory => break,
                    DirEntry::Bitmap(entry) => {
                        if entry.flags & 1 == 0 && bitmap_entry.is_none() {
                            let first = u32::from_le({ entry.first_cluster });
                            let len = u64::from_le({ entry.data_len });
                            bitmap_entry = Some((first, len));
                        }
                    }
                    DirEntry::Upcase(entry) => {
                        if upcase_entry.is_none() {
                            let first = u32::from_le({ entry.first_cluster });
                            let len = u64::from_le({ entry.data_len });
                            let checksum = u32::from_le({ entry.table_checksum });
                            upcase_entry = Some((first, len, checksum));
                        }
                    }
                    DirEntry::Label(entry) => {
                        if entry.character_count > 11 {
                            return Err(Error::corrupt("volume label too long"));
                        }
                        let units: Vec<u16> = entry.volume_label
                            [..entry.character_count as usize * 2]
                            .chunks_exact(2)
                            .map(|c| u16::from_le_bytes([c[0], c[1]]))
                            .collect();
                        label = Some(String::from_utf16_lossy(&units));
                        label_offset = Some(offset);
                    }
                    _ => {}
                }
            }
        }

        let (bitmap_first, bitmap_len) =
            bitmap_entry.ok_or_else(|| Error::corrupt("no allocation bitmap entry"))?;
        let bitmap = ClusterBitmap::load(&disk, &sb, &fat, bitmap_first, bitmap_len)?;

        let (upcase_first, upcase_len, upcase_sum) =
            upcase_entry.ok_or_else(|| Error::corrupt("no upcase table entry"))?;
        if upcase_len == 0 || upcase_len > 2 * 0x10000 {
            return Err(Error::corrupt("unreasonable upcase table size"));
        }
        let upcase_bytes = fat.read_chain_bytes(&disk, &sb, upcase_first, upcase_len)?;
        if table_checksum(&upcase_bytes) != upcase_sum {
            return Err(Error::corrupt("upcase table checksum mismatch"));
        }
        let upcase = UpcaseTable::from_bytes(&upcase_bytes)?;

        let fs = Arc::new(ExfatFs {
            disk,
            sb,
            fat,
            upcase,
            bitmap: Mutex::new(bitmap),
            nodes: Mutex::new(NodeTable::new()),
            root,
            opts,
            read_only,
            label: Mutex::new(label),
            label_offset: Mutex::new(label_offset),
        });

        if !fs.read_only {
            fs.write_volume_state(true)?;
        }
        log::debug!(
            "exfat: mounted volume serial {:08x}, {} clusters of {} bytes, {}",
            fs.sb.volume_serial,
            fs.sb.cluster_count,
            fs.sb.cluster_size,
            if fs.read_only { "ro" } else { "rw" },
        );
        Ok(fs)
    }

    fn verify_vbr_checksum(disk: &CachedDisk, sb: &SuperBlock) -> Result<()> {
        let ss = sb.sector_size as usize;
        let mut region = vec![0u8; ss * CHECKSUM_SECTOR as usize];
        disk.read_bytes(0, &mut region)?;
        let mut checksum = Checksum::new();
        checksum.boot_sector(&region[..ss]);
        for sector in 1..CHECKSUM_SECTOR as usize {
            checksum.sector(&region[sector * ss..(sector + 1) * ss]);
        }
        let expected = checksum.get();

        let mut stored = vec![0u8; ss];
        disk.read_bytes(CHECKSUM_SECTOR * ss as u64, &mut stored)?;
        for word in stored.chunks_exact(4) {
            if u32::from_le_bytes(word.try_into().unwrap()) != expected {
                return Err(Error::corrupt("boot region checksum mismatch"));
            }
        }
        Ok(())
    }

    /// Rewrites the volume dirty flag and `percent_in_use` in the boot
    /// sector, then regenerates the main checksum sector to match.
    fn write_volume_state(&self, dirty: bool) -> Result<()> {
        let ss = self.sb.sector_size as usize;
        let mut region = vec![0u8; ss * CHECKSUM_SECTOR as usize];
        self.disk.read_bytes(0, &mut region)?;

        let mut flags = VolumeFlags::from_bits_truncate(u16::from_le_bytes([
            region[106],
            region[107],
        ]));
        flags.set(VolumeFlags::DIRTY, dirty);
        region[106..108].copy_from_slice(&flags.bits().to_le_bytes());

        let free = self.bitmap.lock().unwrap().free_count();
        let used = self.sb.cluster_count - free;
        region[112] = (used as u64 * 100 / self.sb.cluster_count.max(1) as u64) as u8;

        let mut checksum = Checksum::new();
        checksum.boot_sector(&region[..ss]);
        for sector in 1..CHECKSUM_SECTOR as usize {
            checksum.sector(&region[sector * ss..(sector + 1) * ss]);
        }
        self.disk.write_bytes(0, &region[..ss])?;

        let mut stored = vec![0u8; ss];
        for word in stored.chunks_exact_mut(4) {
            word.copy_from_slice(&checksum.get().to_le_bytes());
        }
        self.disk.write_bytes(CHECKSUM_SECTOR * ss as u64, &stored)?;
        Ok(())
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            Err(Error::ReadOnly)
        } else {
            Ok(())
        }
    }

    pub fn statfs(&self) -> StatFs {
        StatFs {
            sector_size: self.sb.sector_size,
            cluster_size: self.sb.cluster_size,
            cluster_count: self.sb.cluster_count,
            free_clusters: self.bitmap.lock().unwrap().free_count(),
            name_max: MAX_NAME_LENGTH as u32,
        }
    }

    pub fn free_clusters(&self) -> u32 {
        self.bitmap.lock().unwrap().free_count()
    }

    pub fn root(&self) -> Arc<Node> {
        let root = Arc::clone(&self.root);
        root.inner.write().unwrap().references += 1;
        root
    }

    pub fn label(&self) -> Option<String> {
        self.label.lock().unwrap().clone()
    }

    /// Rewrites (or creates) the volume label entry in the root directory.
    pub fn set_label(&self, label: &str) -> Result<()> {
        self.ensure_writable()?;
        let units: Vec<u16> = label.encode_utf16().collect();
        if units.len() > 11 {
            return Err(Error::InvalidName("volume label exceeds 11 code units"));
        }
        let mut raw = [0u8; ENTRY_SIZE];
        raw[0] = TYPE_LABEL;
        raw[1] = units.len() as u8;
        for (i, unit) in units.iter().enumerate() {
            raw[2 + i * 2..4 + i * 2].copy_from_slice(&unit.to_le_bytes());
        }

        let mut offset_slot = self.label_offset.lock().unwrap();
        let dir = self.root_dir();
        let offset = match *offset_slot {
            Some(offset) => offset,
            None => dir
                .find_free_run(1)?
                .ok_or(Error::NoSpace)?,
        };
        dir.write_at(offset, &raw)?;
        *offset_slot = Some(offset);
        *self.label.lock().unwrap() = Some(label.to_string());
        Ok(())
    }

    /// Writes every dirty node's entry group and flushes the block cache to
    /// the device.
    pub fn sync(&self) -> Result<()> {
        let nodes = self.nodes.lock().unwrap().nodes();
        for node in nodes {
            self.flush_node(&node)?;
        }
        self.disk.sync()?;
        Ok(())
    }

    /// Flushes everything and, on writable mounts, clears the volume dirty
    /// flag. Mount → unmount with no intervening operations leaves the
    /// volume byte-identical.
    pub fn unmount(&self) -> Result<()> {
        self.sync()?;
        if !self.read_only {
            self.write_volume_state(false)?;
            self.disk.sync()?;
        }
        Ok(())
    }

    /// Decrements a handle's reference. The last put of an
    /// unlinked-while-open node frees its clusters; otherwise dirty
    /// metadata is written back.
    pub fn put(&self, node: Arc<Node>) -> Result<()> {
        let (references, unlinked) = {
            let mut inner = node.inner.write().unwrap();
            debug_assert!(inner.references > 0, "unbalanced put");
            inner.references = inner.references.saturating_sub(1);
            (
                inner.references,
                inner.flags.contains(NodeFlags::UNLINKED),
            )
        };
        if unlinked {
            if references == 0 {
                self.free_node_clusters(&node)?;
            }
        } else {
            self.flush_node(&node)?;
        }
        Ok(())
    }

    /// Re-emits a dirty node's directory entry group through the cache.
    pub(crate) fn flush_node(&self, node: &Arc<Node>) -> Result<()> {
        let (set, entry_offset, parent) = {
            let inner = node.inner.read().unwrap();
            if !inner.flags.contains(NodeFlags::DIRTY)
                || inner.flags.contains(NodeFlags::UNLINKED)
            {
                return Ok(());
            }
            let Some(parent) = inner.parent.clone() else {
                // the root has no entry group
                return Ok(());
            };
            (entry_set_of(&inner), inner.entry_offset, parent)
        };
        let bytes = set.encode(&self.upcase);
        let dir = self.dir_of(&parent)?;
        dir.write_at(entry_offset, &bytes)?;
        node.inner.write().unwrap().flags.remove(NodeFlags::DIRTY);
        Ok(())
    }

    /// Returns the freed clusters of an unlinked node to the bitmap.
    fn free_node_clusters(&self, node: &Node) -> Result<()> {
        let inner = node.inner.read().unwrap();
        if inner.start_cluster == 0 {
            return Ok(());
        }
        let count = inner.size.div_ceil(self.sb.cluster_size as u64) as u32;
        let mut bitmap = self.bitmap.lock().unwrap();
        if inner.is_contiguous() {
            bitmap.release_run(&self.disk, &self.sb, inner.start_cluster, count)?;
        } else {
            let chain = self.fat.collect_chain(&self.disk, &self.sb, inner.start_cluster)?;
            for &cluster in &chain {
                self.fat.set(&self.disk, cluster, FatEntry(CLUSTER_FREE))?;
                bitmap.release(&self.disk, &self.sb, cluster)?;
            }
        }
        Ok(())
    }

    /// A [`Directory`] view of a directory node's current geometry.
    pub(crate) fn dir_of(&self, node: &Arc<Node>) -> Result<Directory<'_>> {
        let inner = node.inner.read().unwrap();
        if !inner.is_directory() {
            return Err(Error::NotADirectory);
        }
        Ok(Directory {
            disk: &self.disk,
            sb: &self.sb,
            fat: &self.fat,
            first_cluster: inner.start_cluster,
            contiguous: inner.is_contiguous(),
            size: inner.size,
        })
    }

    fn root_dir(&self) -> Directory<'_> {
        let inner = self.root.inner.read().unwrap();
        Directory {
            disk: &self.disk,
            sb: &self.sb,
            fat: &self.fat,
            first_cluster: inner.start_cluster,
            contiguous: false,
            size: inner.size,
        }
    }

    /// Clusters a node occupies.
    pub(crate) fn cluster_count_of(&self, inner: &NodeInner) -> u64 {
        inner.size.div_ceil(self.sb.cluster_size as u64)
    }

    /// The cluster following `cluster` in a node's chain, or
    /// [`CLUSTER_END`]. Contiguous chains are advanced arithmetically
    /// without touching the FAT.
    pub(crate) fn next_cluster(&self, inner: &NodeInner, cluster: u32) -> Result<u32> {
        if inner.is_contiguous() {
            let index = cluster - inner.start_cluster;
            if (index + 1) as u64 >= self.cluster_count_of(inner) {
                Ok(CLUSTER_END)
            } else {
                Ok(cluster + 1)
            }
        } else {
            self.fat.get(&self.disk, cluster)
        }
    }

    /// Walks `count` steps into a node's chain.
    pub(crate) fn advance_cluster(&self, inner: &NodeInner, count: u64) -> Result<u32> {
        if count >= self.cluster_count_of(inner).max(1) {
            return Err(Error::corrupt("cluster walk past the end of the chain"));
        }
        if inner.is_contiguous() {
            return Ok(inner.start_cluster + count as u32);
        }
        let mut cluster = inner.start_cluster;
        for _ in 0..count {
            cluster = self.fat.get(&self.disk, cluster)?;
            if !self.sb.is_valid_cluster(cluster) {
                return Err(Error::corrupt(format!(
                    "invalid cluster {cluster:#x} in chain"
                )));
            }
        }
        Ok(cluster)
    }
}

/// Snapshot of a node's metadata as an encodable entry group.
pub(crate) fn entry_set_of(inner: &NodeInner) -> EntrySet {
    EntrySet {
        attributes: inner.attributes,
        timestamps: inner.timestamps,
        contiguous: inner.is_contiguous(),
        first_cluster: inner.start_cluster,
        size: inner.size,
        valid_size: inner.valid_size,
        name: inner.name.clone(),
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::sync::Arc;

    use super::{ExfatFs, MountOptions};
    use crate::cache::io::CachedDisk;
    use crate::disk::RamDisk;
    use crate::format::{FormatVolumeOptionsBuilder, mkfs};

    pub(crate) fn image(size: u64, sector_size: u32) -> CachedDisk {
        let disk = CachedDisk::with_defaults(Box::new(RamDisk::new(size, sector_size))).unwrap();
        let options = FormatVolumeOptionsBuilder::default()
            .dev_size(size)
            .bytes_per_sector(sector_size as u16)
            .build()
            .unwrap();
        mkfs(&disk, options).unwrap();
        disk
    }

    pub(crate) fn fresh_fs(size: u64, sector_size: u32) -> Arc<ExfatFs> {
        ExfatFs::mount(image(size, sector_size), MountOptions::default()).unwrap()
    }

    /// Unmounts and recovers the cached disk for inspection or remounting.
    pub(crate) fn teardown(fs: Arc<ExfatFs>) -> CachedDisk {
        fs.unmount().unwrap();
        let fs = Arc::try_unwrap(fs).ok().expect("dangling filesystem handles");
        fs.disk
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::{fresh_fs, image, teardown};
    use super::*;
    use crate::MB;

    fn snapshot(disk: &CachedDisk) -> Vec<u8> {
        let mut image = vec![0u8; disk.size_bytes() as usize];
        disk.read_bytes(0, &mut image).unwrap();
        image
    }

    #[test]
    fn mount_unmount_mount_is_a_no_op() {
        let disk = image(16 * MB as u64, 512);
        let fs = ExfatFs::mount(disk, MountOptions::default()).unwrap();
        let disk = teardown(fs);
        let first = snapshot(&disk);

        let fs = ExfatFs::mount(disk, MountOptions::default()).unwrap();
        let disk = teardown(fs);
        assert_eq!(first, snapshot(&disk));
    }

    #[test]
    fn statfs_reports_the_heap() {
        let fs = fresh_fs(16 * MB as u64, 512);
        let stats = fs.statfs();
        assert_eq!(stats.sector_size, 512);
        assert_eq!(stats.cluster_size, 4096);
        assert!(stats.free_clusters < stats.cluster_count);
        assert_eq!(stats.name_max, 255);
    }

    #[test]
    fn read_only_mounts_refuse_mutation() {
        let disk = image(16 * MB as u64, 512);
        let fs = ExfatFs::mount(disk, MountOptions::parse("ro").unwrap()).unwrap();
        assert!(fs.read_only());
        assert!(matches!(fs.create("/nope"), Err(Error::ReadOnly)));
        assert!(matches!(fs.mkdir("/nope"), Err(Error::ReadOnly)));
        assert!(matches!(fs.unlink("/nope"), Err(Error::ReadOnly)));
    }

    #[test]
    fn volume_label_persists_across_remounts() {
        let fs = ExfatFs::mount(image(16 * MB as u64, 512), MountOptions::default()).unwrap();
        assert_eq!(fs.label(), None);
        fs.set_label("ARCHIVE").unwrap();
        let disk = teardown(fs);

        let fs = ExfatFs::mount(disk, MountOptions::default()).unwrap();
        assert_eq!(fs.label().as_deref(), Some("ARCHIVE"));
    }

    #[test]
    fn corrupted_boot_region_fails_the_mount() {
        let disk = image(16 * MB as u64, 512);
        // flip one byte inside an extended boot sector
        let mut byte = [0u8; 1];
        disk.read_bytes(3 * 512 + 17, &mut byte).unwrap();
        byte[0] ^= 0x40;
        disk.write_bytes(3 * 512 + 17, &byte).unwrap();

        assert!(matches!(
            ExfatFs::mount(disk, MountOptions::default()),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn dirty_volume_with_ro_fallback_mounts_read_only() {
        let disk = image(16 * MB as u64, 512);
        let fs = ExfatFs::mount(disk, MountOptions::default()).unwrap();
        // simulate a crash: sync data but skip the unmount bookkeeping
        fs.sync().unwrap();
        let fs = Arc::try_unwrap(fs).ok().expect("dangling filesystem handles");
        let disk = fs.disk;

        let fs = ExfatFs::mount(disk, MountOptions::parse("ro_fallback").unwrap()).unwrap();
        assert!(fs.read_only());
    }

    #[test]
    fn free_count_survives_a_remount() {
        let fs = fresh_fs(16 * MB as u64, 512);
        let file = fs.create("/data").unwrap();
        fs.write(&file, &vec![7u8; 10_000], 0).unwrap();
        fs.put(file).unwrap();
        let free = fs.free_clusters();

        let disk = teardown(fs);
        let fs = ExfatFs::mount(disk, MountOptions::default()).unwrap();
        assert_eq!(fs.free_clusters(), free);
    }
}
