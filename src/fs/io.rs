//! File data I/O: read, write, truncate and the cluster-chain growth that
//! backs them.

use std::sync::Arc;

use crate::Result;
use crate::dir::entry::FileAttributes;
use crate::error::Error;
use crate::fat::{CLUSTER_FREE, FatEntry};
use crate::node::{Node, NodeFlags, NodeInner};
use crate::timestamp::Timestamp;

use super::ExfatFs;

impl ExfatFs {
    /// Reads up to `buf.len()` bytes at `offset`, returning how many were
    /// read (short at end of file). Updates the access time unless the
    /// volume is read-only or mounted `noatime`.
    pub fn read(&self, node: &Arc<Node>, buf: &mut [u8], offset: u64) -> Result<usize> {
        let total = {
            let inner = node.inner.read().unwrap();
            if inner.is_directory() {
                return Err(Error::IsADirectory);
            }
            if offset >= inner.size || buf.is_empty() {
                return Ok(0);
            }
            let cluster_size = self.sb.cluster_size as u64;
            let total = buf.len().min((inner.size - offset) as usize);
            let mut cluster = self.advance_cluster(&inner, offset / cluster_size)?;
            let mut within = offset % cluster_size;
            let mut done = 0usize;
            while done < total {
                if !self.sb.is_valid_cluster(cluster) {
                    return Err(Error::corrupt(format!(
                        "invalid cluster {cluster:#x} while reading"
                    )));
                }
                let step = ((cluster_size - within) as usize).min(total - done);
                self.disk
                    .read_bytes(self.sb.c2o(cluster) + within, &mut buf[done..done + step])?;
                done += step;
                within = 0;
                if done < total {
                    cluster = self.next_cluster(&inner, cluster)?;
                }
            }
            total
        };
        if !self.read_only() && !self.opts.noatime {
            let mut inner = node.inner.write().unwrap();
            inner.timestamps.accessed = Timestamp::now();
            inner.mark_dirty();
        }
        Ok(total)
    }

    /// Writes `buf` at `offset`, growing the file as needed. A write past
    /// the current end materialises the gap with zeroes first (exFAT has no
    /// holes).
    pub fn write(&self, node: &Arc<Node>, buf: &[u8], offset: u64) -> Result<usize> {
        self.ensure_writable()?;
        if node.is_directory() {
            return Err(Error::IsADirectory);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(Error::InvalidArgument("write beyond 2^64"))?;
        let size = node.inner.read().unwrap().size;
        if offset > size {
            self.resize_node(node, offset, true)?;
        }
        if end > size.max(offset) {
            self.resize_node(node, end, false)?;
        }

        {
            let inner = node.inner.read().unwrap();
            let cluster_size = self.sb.cluster_size as u64;
            let mut cluster = self.advance_cluster(&inner, offset / cluster_size)?;
            let mut within = offset % cluster_size;
            let mut done = 0usize;
            while done < buf.len() {
                if !self.sb.is_valid_cluster(cluster) {
                    return Err(Error::corrupt(format!(
                        "invalid cluster {cluster:#x} while writing"
                    )));
                }
                let step = ((cluster_size - within) as usize).min(buf.len() - done);
                self.disk
                    .write_bytes(self.sb.c2o(cluster) + within, &buf[done..done + step])?;
                done += step;
                within = 0;
                if done < buf.len() {
                    cluster = self.next_cluster(&inner, cluster)?;
                }
            }
        }

        let mut inner = node.inner.write().unwrap();
        inner.timestamps.modified = Timestamp::now();
        inner.attributes.insert(FileAttributes::ARCHIVE);
        inner.mark_dirty();
        Ok(buf.len())
    }

    /// Truncates or extends a file. Growth rounds up to whole clusters;
    /// with `erase` set the newly visible bytes are zero-filled.
    pub fn truncate(&self, node: &Arc<Node>, new_size: u64, erase: bool) -> Result<()> {
        self.ensure_writable()?;
        if node.is_directory() {
            return Err(Error::IsADirectory);
        }
        self.resize_node(node, new_size, erase)?;
        let mut inner = node.inner.write().unwrap();
        inner.timestamps.modified = Timestamp::now();
        inner.mark_dirty();
        Ok(())
    }

    /// Writes back a node's metadata and pushes all dirty sectors to the
    /// device.
    pub fn fsync(&self, node: &Arc<Node>, datasync: bool) -> Result<()> {
        if !datasync {
            self.flush_node(node)?;
        }
        self.disk.sync()?;
        Ok(())
    }

    /// Changes a node's size, allocating or freeing clusters. Also used to
    /// grow directories (their sizes stay cluster-aligned).
    pub(crate) fn resize_node(&self, node: &Arc<Node>, new_size: u64, erase: bool) -> Result<()> {
        let mut inner = node.inner.write().unwrap();
        let old_size = inner.size;
        if new_size == old_size {
            return Ok(());
        }
        let cluster_size = self.sb.cluster_size as u64;
        let old_clusters = old_size.div_ceil(cluster_size);
        let new_clusters = new_size.div_ceil(cluster_size);
        if new_clusters > old_clusters {
            self.grow_chain(&mut inner, old_clusters, new_clusters)?;
        } else if new_clusters < old_clusters {
            self.shrink_chain(&mut inner, old_clusters, new_clusters)?;
        }
        inner.size = new_size;
        inner.valid_size = new_size;
        if erase && new_size > old_size {
            self.zero_range(&inner, old_size, new_size)?;
        }
        inner.mark_dirty();
        Ok(())
    }

    /// Appends clusters to a chain, preferring contiguous extension from
    /// the current tail. A contiguous chain forced to take a non-adjacent
    /// cluster is first materialised into real FAT links.
    fn grow_chain(&self, inner: &mut NodeInner, old_clusters: u64, new_clusters: u64) -> Result<()> {
        let mut bitmap = self.bitmap.lock().unwrap();

        let original_start = inner.start_cluster;
        let mut tail = if old_clusters == 0 {
            0
        } else if inner.is_contiguous() {
            inner.start_cluster + old_clusters as u32 - 1
        } else {
            self.advance_cluster(inner, old_clusters - 1)?
        };
        let original_tail = tail;
        let mut added: Vec<u32> = Vec::new();

        for _ in old_clusters..new_clusters {
            let hint = if tail == 0 { 0 } else { tail + 1 };
            let cluster = match bitmap.allocate(&self.disk, &self.sb, hint) {
                Ok(cluster) => cluster,
                Err(e) => {
                    // undo this call's allocations; the chain stays valid
                    for &c in added.iter().rev() {
                        let _ = bitmap.release(&self.disk, &self.sb, c);
                    }
                    if original_start == 0 {
                        inner.start_cluster = 0;
                        inner.flags.insert(NodeFlags::CONTIGUOUS);
                    } else if !inner.is_contiguous() {
                        let _ = self.fat.set(&self.disk, original_tail, FatEntry::eof());
                    }
                    return Err(e);
                }
            };
            if inner.start_cluster == 0 {
                inner.start_cluster = cluster;
                inner.flags.insert(NodeFlags::CONTIGUOUS);
            } else if inner.is_contiguous() && cluster == tail + 1 {
                // the implicit chain simply covers one more cluster
            } else {
                if inner.is_contiguous() {
                    // materialise the implicit chain into actual FAT links
                    for c in inner.start_cluster..tail {
                        self.fat.set(&self.disk, c, FatEntry(c + 1))?;
                    }
                    inner.flags.remove(NodeFlags::CONTIGUOUS);
                }
                self.fat.set(&self.disk, tail, FatEntry(cluster))?;
                self.fat.set(&self.disk, cluster, FatEntry::eof())?;
            }
            added.push(cluster);
            tail = cluster;
        }
        Ok(())
    }

    /// Frees the tail of a chain. Truncating to zero collapses the chain
    /// entirely.
    fn shrink_chain(
        &self,
        inner: &mut NodeInner,
        old_clusters: u64,
        new_clusters: u64,
    ) -> Result<()> {
        let mut bitmap = self.bitmap.lock().unwrap();
        if inner.is_contiguous() {
            let first_freed = inner.start_cluster + new_clusters as u32;
            bitmap.release_run(
                &self.disk,
                &self.sb,
                first_freed,
                (old_clusters - new_clusters) as u32,
            )?;
        } else if new_clusters == 0 {
            let chain = self
                .fat
                .collect_chain(&self.disk, &self.sb, inner.start_cluster)?;
            for &cluster in &chain {
                self.fat.set(&self.disk, cluster, FatEntry(CLUSTER_FREE))?;
                bitmap.release(&self.disk, &self.sb, cluster)?;
            }
        } else {
            let new_tail = self.advance_cluster(inner, new_clusters - 1)?;
            let mut cluster = self.fat.get(&self.disk, new_tail)?;
            self.fat.set(&self.disk, new_tail, FatEntry::eof())?;
            while self.sb.is_valid_cluster(cluster) {
                let next = self.fat.get(&self.disk, cluster)?;
                self.fat.set(&self.disk, cluster, FatEntry(CLUSTER_FREE))?;
                bitmap.release(&self.disk, &self.sb, cluster)?;
                cluster = next;
            }
        }
        if new_clusters == 0 {
            inner.start_cluster = 0;
            inner.flags.insert(NodeFlags::CONTIGUOUS);
        }
        Ok(())
    }

    /// Zero-fills a byte range of a node through its cluster chain.
    fn zero_range(&self, inner: &NodeInner, from: u64, to: u64) -> Result<()> {
        let cluster_size = self.sb.cluster_size as u64;
        let mut cluster = self.advance_cluster(inner, from / cluster_size)?;
        let mut pos = from;
        while pos < to {
            if !self.sb.is_valid_cluster(cluster) {
                return Err(Error::corrupt(format!(
                    "invalid cluster {cluster:#x} while zero-filling"
                )));
            }
            let within = pos % cluster_size;
            let step = (cluster_size - within).min(to - pos);
            self.disk
                .write_zeroes(self.sb.c2o(cluster) + within, step)?;
            pos += step;
            if pos < to {
                cluster = self.next_cluster(inner, cluster)?;
            }
        }
        Ok(())
    }
}
