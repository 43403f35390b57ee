//! Directory traversal and mutation on top of the cached disk.

use crate::Result;
use crate::boot::sector::SuperBlock;
use crate::cache::io::CachedDisk;
use crate::error::Error;
use crate::fat::{CLUSTER_END, FatTable};
use crate::upcase::UpcaseTable;

pub mod entry;

use entry::{DirEntry, ENTRY_IN_USE, ENTRY_SIZE, EntrySet, ExfatName};

/// A view of one directory's cluster chain. Carries just enough geometry to
/// iterate and rewrite entries; the owning node tracks everything else.
pub(crate) struct Directory<'a> {
    pub(crate) disk: &'a CachedDisk,
    pub(crate) sb: &'a SuperBlock,
    pub(crate) fat: &'a FatTable,
    pub(crate) first_cluster: u32,
    pub(crate) contiguous: bool,
    /// Directory size in bytes; always a whole number of clusters.
    pub(crate) size: u64,
}

impl<'a> Directory<'a> {
    pub(crate) fn stream(&'a self) -> DirStream<'a> {
        DirStream {
            dir: self,
            pos: 0,
            cluster: self.first_cluster,
        }
    }

    /// Maps a byte offset within the directory onto the device.
    fn map(&self, offset: u64) -> Result<u64> {
        debug_assert!(offset < self.size);
        let cluster_size = self.sb.cluster_size as u64;
        let index = (offset / cluster_size) as u32;
        let cluster = if self.contiguous {
            self.first_cluster + index
        } else {
            let mut cluster = self.first_cluster;
            for _ in 0..index {
                cluster = self.fat.get(self.disk, cluster)?;
            }
            cluster
        };
        if !self.sb.is_valid_cluster(cluster) {
            return Err(Error::corrupt(format!(
                "directory chain leads to invalid cluster {cluster:#x}"
            )));
        }
        Ok(self.sb.c2o(cluster) + offset % cluster_size)
    }

    /// Reads a byte range of the directory, chunked on cluster boundaries.
    pub(crate) fn read_at(&self, mut offset: u64, buf: &mut [u8]) -> Result<()> {
        let cluster_size = self.sb.cluster_size as u64;
        let mut pos = 0usize;
        while pos < buf.len() {
            let within = offset % cluster_size;
            let take = ((cluster_size - within) as usize).min(buf.len() - pos);
            let device = self.map(offset)?;
            self.disk.read_bytes(device, &mut buf[pos..pos + take])?;
            offset += take as u64;
            pos += take;
        }
        Ok(())
    }

    /// Writes a byte range of the directory, chunked on cluster boundaries.
    pub(crate) fn write_at(&self, mut offset: u64, mut data: &[u8]) -> Result<()> {
        let cluster_size = self.sb.cluster_size as u64;
        while !data.is_empty() {
            let within = offset % cluster_size;
            let take = ((cluster_size - within) as usize).min(data.len());
            let device = self.map(offset)?;
            self.disk.write_bytes(device, &data[..take])?;
            offset += take as u64;
            data = &data[take..];
        }
        Ok(())
    }

    /// Reads and decodes the entry group at `offset`.
    pub(crate) fn read_group_at(&self, offset: u64) -> Result<EntrySet> {
        let mut primary = [0u8; ENTRY_SIZE];
        self.read_at(offset, &mut primary)?;
        let DirEntry::File(file) = DirEntry::parse(&primary) else {
            return Err(Error::corrupt("no file entry at recorded group offset"));
        };
        let count = 1 + file.secondary_count as usize;
        let mut raw = vec![[0u8; ENTRY_SIZE]; count];
        raw[0] = primary;
        for (i, slot) in raw.iter_mut().enumerate().skip(1) {
            self.read_at(offset + (i * ENTRY_SIZE) as u64, slot)?;
        }
        EntrySet::parse(&raw)
    }

    /// Finds the group whose name folds equal to `name`. Corrupt groups are
    /// skipped (and logged by the codec), matching what a scan of a damaged
    /// directory should survive.
    pub(crate) fn find_name(
        &self,
        upcase: &UpcaseTable,
        name: &ExfatName,
    ) -> Result<Option<(u64, EntrySet)>> {
        let hash = upcase.name_hash(name.as_units());
        let mut stream = self.stream();
        while let Some((offset, group)) = stream.next_group()? {
            match group {
                Ok(set) => {
                    if upcase.name_hash(set.name.as_units()) == hash
                        && upcase.eq_fold(set.name.as_units(), name.as_units())
                    {
                        return Ok(Some((offset, set)));
                    }
                }
                Err(_) => continue,
            }
        }
        Ok(None)
    }

    /// Collects every intact entry group, for `readdir`.
    pub(crate) fn all_groups(&self) -> Result<Vec<(u64, EntrySet)>> {
        let mut out = Vec::new();
        let mut stream = self.stream();
        while let Some((offset, group)) = stream.next_group()? {
            if let Ok(set) = group {
                out.push((offset, set));
            }
        }
        Ok(out)
    }

    /// Whether the directory holds no live entry groups.
    pub(crate) fn is_empty(&self) -> Result<bool> {
        let mut stream = self.stream();
        Ok(stream.next_group()?.is_none())
    }

    /// Finds `needed` consecutive unused slots, returning the offset of the
    /// first.
    pub(crate) fn find_free_run(&self, needed: usize) -> Result<Option<u64>> {
        let mut stream = self.stream();
        let mut run_start = 0u64;
        let mut run_len = 0usize;
        while let Some((offset, raw)) = stream.next_raw()? {
            if raw[0] & ENTRY_IN_USE == 0 {
                if run_len == 0 {
                    run_start = offset;
                }
                run_len += 1;
                if run_len == needed {
                    return Ok(Some(run_start));
                }
            } else {
                run_len = 0;
            }
        }
        Ok(None)
    }

    /// Clears the in-use bit on `count` consecutive entries, retiring a
    /// group.
    pub(crate) fn invalidate_group(&self, offset: u64, count: usize) -> Result<()> {
        for i in 0..count {
            let at = offset + (i * ENTRY_SIZE) as u64;
            let mut type_byte = [0u8; 1];
            self.read_at(at, &mut type_byte)?;
            if type_byte[0] & ENTRY_IN_USE != 0 {
                type_byte[0] &= !ENTRY_IN_USE;
                self.write_at(at, &type_byte)?;
            }
        }
        Ok(())
    }
}

/// Sequential reader over a directory's entries. Tracks the current cluster
/// so FAT-chained directories are walked once, not re-walked per entry.
pub(crate) struct DirStream<'a> {
    dir: &'a Directory<'a>,
    pos: u64,
    cluster: u32,
}

impl DirStream<'_> {
    /// The next raw 32-byte entry and its byte offset within the directory.
    pub(crate) fn next_raw(&mut self) -> Result<Option<(u64, [u8; ENTRY_SIZE])>> {
        if self.pos >= self.dir.size {
            return Ok(None);
        }
        if !self.dir.sb.is_valid_cluster(self.cluster) {
            return Err(Error::corrupt(format!(
                "directory chain leads to invalid cluster {:#x}",
                self.cluster
            )));
        }
        let cluster_size = self.dir.sb.cluster_size as u64;
        let device = self.dir.sb.c2o(self.cluster) + self.pos % cluster_size;
        let mut raw = [0u8; ENTRY_SIZE];
        self.dir.disk.read_bytes(device, &mut raw)?;

        let offset = self.pos;
        self.pos += ENTRY_SIZE as u64;
        if self.pos < self.dir.size && self.pos % cluster_size == 0 {
            self.cluster = if self.dir.contiguous {
                self.cluster + 1
            } else {
                let next = self.dir.fat.get(self.dir.disk, self.cluster)?;
                if next == CLUSTER_END {
                    return Err(Error::corrupt("directory chain ends before its size"));
                }
                next
            };
        }
        Ok(Some((offset, raw)))
    }

    /// The next entry group. `Ok(Some((offset, Err(..))))` reports a group
    /// with a bad checksum or structure, which callers usually skip.
    pub(crate) fn next_group(&mut self) -> Result<Option<(u64, Result<EntrySet>)>> {
        while let Some((offset, raw)) = self.next_raw()? {
            let file = match DirEntry::parse(&raw) {
                DirEntry::File(file) => file,
                DirEntry::EndOfDirectory => return Ok(None),
                _ => continue,
            };
            let count = 1 + file.secondary_count as usize;
            let mut group = Vec::with_capacity(count);
            group.push(raw);
            while group.len() < count {
                match self.next_raw()? {
                    Some((_, raw)) => group.push(raw),
                    None => {
                        return Ok(Some((
                            offset,
                            Err(Error::corrupt("entry group runs past the directory")),
                        )));
                    }
                }
            }
            return Ok(Some((offset, EntrySet::parse(&group))));
        }
        Ok(None)
    }
}
