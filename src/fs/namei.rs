//! Namespace operations: create, mkdir, unlink, rmdir, rename, utimens.

use std::sync::Arc;

use crate::Result;
use crate::dir::entry::{EntrySet, ExfatName, FileAttributes};
use crate::error::Error;
use crate::node::{Node, NodeFlags};
use crate::timestamp::{Timestamp, Timestamps};

use super::{ExfatFs, entry_set_of};

/// Splits a path into (parent path, final component).
fn split_path(path: &str) -> Result<(String, &str)> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(Error::InvalidArgument("path has no final component"));
    }
    match trimmed.rfind('/') {
        Some(i) => Ok((trimmed[..i].to_string(), &trimmed[i + 1..])),
        None => Ok((String::new(), trimmed)),
    }
}

impl ExfatFs {
    /// Opens an existing file or directory, returning a handle the caller
    /// releases with [`ExfatFs::put`].
    pub fn open(&self, path: &str) -> Result<Arc<Node>> {
        self.get(path)
    }

    /// Creates a regular file and returns an open handle to it.
    pub fn create(&self, path: &str) -> Result<Arc<Node>> {
        self.mknod_common(path, FileAttributes::ARCHIVE)
    }

    /// Creates a directory with one zero-filled cluster.
    pub fn mkdir(&self, path: &str) -> Result<()> {
        let node = self.mknod_common(path, FileAttributes::DIRECTORY)?;
        self.put(node)
    }

    fn mknod_common(&self, path: &str, attributes: FileAttributes) -> Result<Arc<Node>> {
        self.ensure_writable()?;
        let (parent_path, name) = split_path(path)?;
        let name = ExfatName::new(name)?;
        let parent = self.get(&parent_path)?;
        let result = self.mknod_at(&parent, name, attributes);
        self.put(parent)?;
        result
    }

    fn mknod_at(
        &self,
        parent: &Arc<Node>,
        name: ExfatName,
        attributes: FileAttributes,
    ) -> Result<Arc<Node>> {
        if !parent.is_directory() {
            return Err(Error::NotADirectory);
        }
        if self.lookup_child_set(parent, &name)?.is_some() {
            return Err(Error::AlreadyExists);
        }

        let (first_cluster, size) = if attributes.contains(FileAttributes::DIRECTORY) {
            let cluster = {
                let mut bitmap = self.bitmap.lock().unwrap();
                bitmap.allocate(&self.disk, &self.sb, 0)?
            };
            self.disk
                .write_zeroes(self.sb.c2o(cluster), self.sb.cluster_size as u64)?;
            (cluster, self.sb.cluster_size as u64)
        } else {
            (0, 0)
        };

        let now = Timestamp::now();
        let set = EntrySet {
            attributes,
            timestamps: Timestamps::all(now),
            contiguous: true,
            first_cluster,
            size,
            valid_size: size,
            name,
        };
        let entry_offset = self.append_group(parent, &set)?;

        let parent_start = parent.inner.read().unwrap().start_cluster;
        let node = Arc::new(Node::from_entry_set(
            set,
            Arc::clone(parent),
            parent_start,
            entry_offset,
        ));
        self.nodes
            .lock()
            .unwrap()
            .insert((parent_start, entry_offset), Arc::clone(&node));

        let mut p = parent.inner.write().unwrap();
        p.timestamps.modified = now;
        p.mark_dirty();
        Ok(node)
    }

    /// Writes a new entry group into the first free run of slots, growing
    /// the directory by one cluster when none is large enough.
    pub(crate) fn append_group(&self, parent: &Arc<Node>, set: &EntrySet) -> Result<u64> {
        let needed = set.entry_count();
        let offset = loop {
            if let Some(offset) = self.dir_of(parent)?.find_free_run(needed)? {
                break offset;
            }
            // grow by one zeroed cluster; small clusters may need more than
            // one round before a long enough run exists
            let old_size = parent.inner.read().unwrap().size;
            self.resize_node(parent, old_size + self.sb.cluster_size as u64, true)?;
        };
        let dir = self.dir_of(parent)?;
        dir.write_at(offset, &set.encode(&self.upcase))?;
        Ok(offset)
    }

    fn lookup_child_set(
        &self,
        parent: &Arc<Node>,
        name: &ExfatName,
    ) -> Result<Option<(u64, EntrySet)>> {
        let dir = self.dir_of(parent)?;
        dir.find_name(&self.upcase, name)
    }

    /// Removes a file. If handles are still open the clusters are freed on
    /// the last [`ExfatFs::put`].
    pub fn unlink(&self, path: &str) -> Result<()> {
        self.ensure_writable()?;
        let node = self.get(path)?;
        let result = if node.is_directory() {
            Err(Error::IsADirectory)
        } else {
            self.unlink_node(&node)
        };
        self.put(node)?;
        result
    }

    /// Removes an empty directory.
    pub fn rmdir(&self, path: &str) -> Result<()> {
        self.ensure_writable()?;
        let node = self.get(path)?;
        let result = (|| {
            if !node.is_directory() {
                return Err(Error::NotADirectory);
            }
            if node.is_root() {
                return Err(Error::InvalidArgument("cannot remove the root directory"));
            }
            if !self.dir_of(&node)?.is_empty()? {
                return Err(Error::NotEmpty);
            }
            self.unlink_node(&node)
        })();
        self.put(node)?;
        result
    }

    /// Retires a node's entry group and schedules its clusters for
    /// freeing. With live references the free happens on the last put.
    pub(crate) fn unlink_node(&self, node: &Arc<Node>) -> Result<()> {
        let (parent, entry_offset, count, key) = {
            let inner = node.inner.read().unwrap();
            let parent = inner
                .parent
                .clone()
                .ok_or(Error::InvalidArgument("cannot unlink the root directory"))?;
            (
                parent,
                inner.entry_offset,
                1 + inner.continuations as usize,
                inner.key,
            )
        };
        {
            let dir = self.dir_of(&parent)?;
            dir.invalidate_group(entry_offset, count)?;
        }
        {
            let mut inner = node.inner.write().unwrap();
            inner.flags.insert(NodeFlags::UNLINKED);
            inner.flags.remove(NodeFlags::DIRTY);
        }
        self.nodes.lock().unwrap().remove(&key);

        let mut p = parent.inner.write().unwrap();
        p.timestamps.modified = Timestamp::now();
        p.mark_dirty();
        Ok(())
    }

    /// Moves or renames a node. The data clusters never move: the new
    /// parent gains a group describing the same chain, the old group is
    /// invalidated. Renames within one directory that keep the slot count
    /// rewrite the group in place.
    pub fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        self.ensure_writable()?;
        let (new_parent_path, new_name) = split_path(new_path)?;
        let new_name = ExfatName::new(new_name)?;
        let node = self.get(old_path)?;
        if node.is_root() {
            self.put(node)?;
            return Err(Error::InvalidArgument("cannot rename the root directory"));
        }
        let new_parent = match self.get(&new_parent_path) {
            Ok(parent) => parent,
            Err(e) => {
                self.put(node)?;
                return Err(e);
            }
        };
        let result = self.rename_node(&node, &new_parent, new_name);
        self.put(new_parent)?;
        self.put(node)?;
        result
    }

    fn rename_node(
        &self,
        node: &Arc<Node>,
        new_parent: &Arc<Node>,
        new_name: ExfatName,
    ) -> Result<()> {
        if !new_parent.is_directory() {
            return Err(Error::NotADirectory);
        }
        if node.is_directory() {
            // a directory cannot move into its own subtree
            let mut cursor = Arc::clone(new_parent);
            loop {
                if Arc::ptr_eq(&cursor, node) {
                    return Err(Error::InvalidArgument(
                        "cannot move a directory into itself",
                    ));
                }
                let up = cursor.inner.read().unwrap().parent.clone();
                match up {
                    Some(parent) => cursor = parent,
                    None => break,
                }
            }
        }

        let node_key = node.inner.read().unwrap().key;

        // an existing target is replaced; non-empty directories refuse
        if let Some((target_offset, target_set)) = self.lookup_child_set(new_parent, &new_name)? {
            let parent_start = new_parent.inner.read().unwrap().start_cluster;
            if (parent_start, target_offset) != node_key {
                let target = self.materialize(new_parent, target_set, target_offset);
                let removed = (|| {
                    if target.is_directory() && !self.dir_of(&target)?.is_empty()? {
                        return Err(Error::NotEmpty);
                    }
                    self.unlink_node(&target)
                })();
                self.put(target)?;
                removed?;
            }
        }

        let (old_parent, old_offset, old_count) = {
            let inner = node.inner.read().unwrap();
            let parent = inner.parent.clone().expect("non-root node has a parent");
            (parent, inner.entry_offset, 1 + inner.continuations as usize)
        };
        let same_parent = Arc::ptr_eq(&old_parent, new_parent);
        let new_set = {
            let inner = node.inner.read().unwrap();
            let mut set = entry_set_of(&inner);
            set.name = new_name.clone();
            set
        };

        if same_parent && new_set.entry_count() == old_count {
            let dir = self.dir_of(new_parent)?;
            dir.write_at(old_offset, &new_set.encode(&self.upcase))?;
            let mut inner = node.inner.write().unwrap();
            inner.name = new_name;
            inner.flags.remove(NodeFlags::DIRTY);
        } else {
            let new_offset = self.append_group(new_parent, &new_set)?;
            {
                let old_dir = self.dir_of(&old_parent)?;
                old_dir.invalidate_group(old_offset, old_count)?;
            }
            let new_parent_start = new_parent.inner.read().unwrap().start_cluster;
            let mut nodes = self.nodes.lock().unwrap();
            nodes.remove(&node_key);
            {
                let mut inner = node.inner.write().unwrap();
                inner.parent = Some(Arc::clone(new_parent));
                inner.entry_offset = new_offset;
                inner.continuations = new_set.continuations();
                inner.name = new_name;
                inner.key = (new_parent_start, new_offset);
                inner.flags.remove(NodeFlags::DIRTY);
            }
            nodes.insert((new_parent_start, new_offset), Arc::clone(node));
        }

        let now = Timestamp::now();
        for parent in [&old_parent, new_parent] {
            let mut p = parent.inner.write().unwrap();
            p.timestamps.modified = now;
            p.mark_dirty();
        }
        Ok(())
    }

    /// Sets access and modification times.
    pub fn utimens(&self, path: &str, atime: Option<i64>, mtime: Option<i64>) -> Result<()> {
        self.ensure_writable()?;
        let node = self.get(path)?;
        {
            let mut inner = node.inner.write().unwrap();
            if let Some(secs) = atime {
                inner.timestamps.accessed = Timestamp::from_unix(secs);
            }
            if let Some(secs) = mtime {
                inner.timestamps.modified = Timestamp::from_unix(secs);
            }
            inner.mark_dirty();
        }
        self.put(node)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::fresh_fs;
    use super::*;
    use crate::MB;

    #[test]
    fn rename_across_directories_moves_the_entry_not_the_data() {
        let fs = fresh_fs(16 * MB as u64, 512);
        fs.mkdir("/d1").unwrap();
        fs.mkdir("/d2").unwrap();

        let x = fs.create("/d1/x").unwrap();
        fs.write(&x, b"hello", 0).unwrap();
        fs.put(x).unwrap();

        fs.rename("/d1/x", "/d2/y").unwrap();

        let y = fs.open("/d2/y").unwrap();
        let mut back = [0u8; 5];
        assert_eq!(fs.read(&y, &mut back, 0).unwrap(), 5);
        assert_eq!(&back, b"hello");
        fs.put(y).unwrap();

        assert!(matches!(fs.lookup("/d1/x"), Err(Error::NotFound)));
        assert!(fs.readdir("/d1").unwrap().is_empty());
    }

    #[test]
    fn unlink_while_open_defers_cluster_freeing() {
        let fs = fresh_fs(16 * MB as u64, 512);
        let file = fs.create("/a.bin").unwrap();
        fs.write(&file, &[1u8; 100], 0).unwrap(); // one cluster
        let free_after_write = fs.free_clusters();

        fs.unlink("/a.bin").unwrap();
        assert_eq!(fs.free_clusters(), free_after_write);
        assert!(matches!(fs.lookup("/a.bin"), Err(Error::NotFound)));

        // the open handle still reads the data
        let mut byte = [0u8; 1];
        assert_eq!(fs.read(&file, &mut byte, 0).unwrap(), 1);
        assert_eq!(byte[0], 1);

        fs.put(file).unwrap();
        assert_eq!(fs.free_clusters(), free_after_write + 1);
    }

    #[test]
    fn rename_preserves_size_start_cluster_and_times() {
        let fs = fresh_fs(16 * MB as u64, 512);
        let file = fs.create("/keep.bin").unwrap();
        fs.write(&file, &vec![3u8; 10_000], 0).unwrap();
        fs.put(file).unwrap();

        let before = fs.getattr("/keep.bin").unwrap();
        let start_before = {
            let node = fs.open("/keep.bin").unwrap();
            let start = node.start_cluster();
            fs.put(node).unwrap();
            start
        };

        // same slot count: rewritten in place
        fs.rename("/keep.bin", "/kept.bin").unwrap();
        // longer name: the group moves
        fs.rename("/kept.bin", "/a name long enough to need two entries.bin")
            .unwrap();

        let after = fs
            .getattr("/a name long enough to need two entries.bin")
            .unwrap();
        let node = fs
            .open("/a name long enough to need two entries.bin")
            .unwrap();
        assert_eq!(after.size, before.size);
        assert_eq!(after.mtime, before.mtime);
        assert_eq!(after.crtime, before.crtime);
        assert_eq!(node.start_cluster(), start_before);
        fs.put(node).unwrap();
    }

    #[test]
    fn unicode_names_survive_create_readdir_lookup() {
        let fs = fresh_fs(16 * MB as u64, 512);
        let name = "café 🚀 notes.txt";
        let node = fs.create(&format!("/{name}")).unwrap();
        fs.put(node).unwrap();

        let listing = fs.readdir("/").unwrap();
        assert!(listing.iter().any(|d| d.name == name), "{listing:?}");

        let node = fs.lookup(&format!("/{name}")).unwrap();
        assert_eq!(node.name(), name);
        fs.put(node).unwrap();
    }

    #[test]
    fn lookups_fold_case_through_the_upcase_table() {
        let fs = fresh_fs(16 * MB as u64, 512);
        let node = fs.create("/MiXeD.TxT").unwrap();
        fs.put(node).unwrap();

        let node = fs.lookup("/mixed.txt").unwrap();
        assert_eq!(node.name(), "MiXeD.TxT"); // case preserved on disk
        fs.put(node).unwrap();

        assert!(matches!(fs.create("/mixed.TXT"), Err(Error::AlreadyExists)));
    }

    #[test]
    fn rmdir_requires_an_empty_directory() {
        let fs = fresh_fs(16 * MB as u64, 512);
        fs.mkdir("/d").unwrap();
        let f = fs.create("/d/f").unwrap();
        fs.put(f).unwrap();

        assert!(matches!(fs.rmdir("/d"), Err(Error::NotEmpty)));
        assert!(matches!(fs.rmdir("/d/f"), Err(Error::NotADirectory)));
        assert!(matches!(fs.unlink("/d"), Err(Error::IsADirectory)));

        fs.unlink("/d/f").unwrap();
        fs.rmdir("/d").unwrap();
        assert!(matches!(fs.lookup("/d"), Err(Error::NotFound)));

        // the freed slots are reusable
        fs.mkdir("/d").unwrap();
        assert!(fs.readdir("/d").unwrap().is_empty());
    }

    #[test]
    fn rename_replaces_existing_files_but_not_full_directories() {
        let fs = fresh_fs(16 * MB as u64, 512);
        let a = fs.create("/a").unwrap();
        fs.write(&a, b"aaa", 0).unwrap();
        fs.put(a).unwrap();
        let b = fs.create("/b").unwrap();
        fs.write(&b, b"b", 0).unwrap();
        fs.put(b).unwrap();

        fs.rename("/a", "/b").unwrap();
        let b = fs.open("/b").unwrap();
        assert_eq!(b.size(), 3);
        fs.put(b).unwrap();
        assert!(matches!(fs.lookup("/a"), Err(Error::NotFound)));

        fs.mkdir("/full").unwrap();
        let inside = fs.create("/full/file").unwrap();
        fs.put(inside).unwrap();
        fs.mkdir("/other").unwrap();
        assert!(matches!(fs.rename("/other", "/full"), Err(Error::NotEmpty)));
    }

    #[test]
    fn directories_grow_when_their_entries_overflow_a_cluster() {
        let fs = fresh_fs(16 * MB as u64, 512);
        fs.mkdir("/crowd").unwrap();
        let initial_size = {
            let d = fs.open("/crowd").unwrap();
            let size = d.size();
            fs.put(d).unwrap();
            size
        };

        // each group takes 3 slots of 32 bytes; 60 files overflow one
        // 4 KiB cluster
        for i in 0..60 {
            let f = fs.create(&format!("/crowd/file-{i:02}")).unwrap();
            fs.put(f).unwrap();
        }
        let d = fs.open("/crowd").unwrap();
        assert!(d.size() > initial_size);
        fs.put(d).unwrap();

        assert_eq!(fs.readdir("/crowd").unwrap().len(), 60);
        for i in 0..60 {
            let f = fs.lookup(&format!("/crowd/file-{i:02}")).unwrap();
            fs.put(f).unwrap();
        }
    }

    #[test]
    fn deep_paths_resolve_component_by_component() {
        let fs = fresh_fs(16 * MB as u64, 512);
        fs.mkdir("/a").unwrap();
        fs.mkdir("/a/b").unwrap();
        fs.mkdir("/a/b/c").unwrap();
        let f = fs.create("/a/b/c/leaf").unwrap();
        fs.write(&f, b"deep", 0).unwrap();
        fs.put(f).unwrap();

        let f = fs.lookup("/a/b/c/leaf").unwrap();
        assert_eq!(f.size(), 4);
        fs.put(f).unwrap();

        // dot and dot-dot components
        let f = fs.lookup("/a/./b/../b/c/leaf").unwrap();
        assert_eq!(f.size(), 4);
        fs.put(f).unwrap();

        assert!(matches!(
            fs.lookup("/a/b/c/leaf/deeper"),
            Err(Error::NotADirectory)
        ));
    }

    #[test]
    fn moving_a_directory_into_its_own_subtree_is_rejected() {
        let fs = fresh_fs(16 * MB as u64, 512);
        fs.mkdir("/top").unwrap();
        fs.mkdir("/top/sub").unwrap();
        assert!(matches!(
            fs.rename("/top", "/top/sub/moved"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn utimens_round_trips_through_the_entry_group() {
        let fs = fresh_fs(16 * MB as u64, 512);
        let f = fs.create("/stamped").unwrap();
        fs.put(f).unwrap();

        fs.utimens("/stamped", Some(1_600_000_000), Some(1_500_000_000))
            .unwrap();
        fs.sync().unwrap();

        let stat = fs.getattr("/stamped").unwrap();
        assert_eq!(stat.atime, 1_600_000_000);
        assert_eq!(stat.mtime, 1_500_000_000);
    }

    #[test]
    fn entry_groups_keep_valid_checksums_after_mutation() {
        let fs = fresh_fs(16 * MB as u64, 512);
        fs.mkdir("/checked").unwrap();
        let f = fs.create("/checked/file").unwrap();
        fs.write(&f, &[7u8; 5000], 0).unwrap();
        fs.truncate(&f, 1234, false).unwrap();
        fs.put(f).unwrap();
        fs.rename("/checked/file", "/checked/renamed-to-something-longer").unwrap();
        fs.sync().unwrap();

        // re-reading the group re-verifies the stored checksum
        let node = fs.open("/checked/renamed-to-something-longer").unwrap();
        let (parent, offset) = {
            let inner = node.inner.read().unwrap();
            (inner.parent.clone().unwrap(), inner.entry_offset)
        };
        let set = {
            let dir = fs.dir_of(&parent).unwrap();
            dir.read_group_at(offset).unwrap()
        };
        assert_eq!(set.size, 1234);
        assert_eq!(set.name.to_string(), "renamed-to-something-longer");
        fs.put(node).unwrap();
    }

    #[test]
    fn free_space_accounting_returns_to_baseline() {
        let fs = fresh_fs(16 * MB as u64, 512);
        let baseline = fs.free_clusters();

        fs.mkdir("/d").unwrap();
        let f = fs.create("/d/data").unwrap();
        fs.write(&f, &vec![0x42u8; 30_000], 0).unwrap();
        fs.put(f).unwrap();
        assert!(fs.free_clusters() < baseline);

        fs.unlink("/d/data").unwrap();
        fs.rmdir("/d").unwrap();
        assert_eq!(fs.free_clusters(), baseline);
    }
}
