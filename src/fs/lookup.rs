//! Path resolution and directory listing.

use std::sync::Arc;

use crate::Result;
use crate::dir::entry::{EntrySet, ExfatName};
use crate::error::Error;
use crate::node::Node;

use super::{ExfatFs, Stat};

/// One `readdir` result.
#[derive(Clone, Debug)]
pub struct DirentInfo {
    pub name: String,
    pub stat: Stat,
}

impl ExfatFs {
    /// Resolves a `/`-separated path to a reference-counted node. The
    /// caller owns one reference and must return it with
    /// [`ExfatFs::put`]. Names compare case-insensitively through the
    /// volume's upcase table.
    pub fn get(&self, path: &str) -> Result<Arc<Node>> {
        let mut current = self.root();
        for component in path.split('/') {
            if component.is_empty() || component == "." {
                continue;
            }
            if component == ".." {
                let parent = current.inner.read().unwrap().parent.clone();
                if let Some(parent) = parent {
                    parent.inner.write().unwrap().references += 1;
                    self.put(current)?;
                    current = parent;
                }
                continue;
            }
            let child = match self.lookup_child(&current, component) {
                Ok(Some(child)) => child,
                Ok(None) => {
                    self.put(current)?;
                    return Err(Error::NotFound);
                }
                Err(e) => {
                    self.put(current)?;
                    return Err(e);
                }
            };
            self.put(current)?;
            current = child;
        }
        Ok(current)
    }

    /// `lookup` is `get` under its host-facing name.
    pub fn lookup(&self, path: &str) -> Result<Arc<Node>> {
        self.get(path)
    }

    /// Finds `name` in a directory node. The node table de-duplicates by
    /// (parent start cluster, entry offset) so concurrent opens of the same
    /// file share one node.
    pub(crate) fn lookup_child(
        &self,
        parent: &Arc<Node>,
        name: &str,
    ) -> Result<Option<Arc<Node>>> {
        let name = ExfatName::new(name)?;
        let found = {
            let dir = self.dir_of(parent)?;
            dir.find_name(&self.upcase, &name)?
        };
        let Some((offset, set)) = found else {
            return Ok(None);
        };
        Ok(Some(self.materialize(parent, set, offset)))
    }

    /// Returns the live node for an entry group, creating and registering
    /// it if this is the first handle.
    pub(crate) fn materialize(
        &self,
        parent: &Arc<Node>,
        set: EntrySet,
        entry_offset: u64,
    ) -> Arc<Node> {
        let parent_start = parent.inner.read().unwrap().start_cluster;
        let key = (parent_start, entry_offset);
        let mut nodes = self.nodes.lock().unwrap();
        if let Some(existing) = nodes.get(&key) {
            existing.inner.write().unwrap().references += 1;
            return existing;
        }
        let node = Arc::new(Node::from_entry_set(
            set,
            Arc::clone(parent),
            parent_start,
            entry_offset,
        ));
        nodes.insert(key, Arc::clone(&node));
        node
    }

    /// Lists a directory: every intact entry group as a name plus stat.
    pub fn readdir(&self, path: &str) -> Result<Vec<DirentInfo>> {
        let node = self.get(path)?;
        let result = self.readdir_node(&node);
        self.put(node)?;
        result
    }

    pub fn readdir_node(&self, node: &Arc<Node>) -> Result<Vec<DirentInfo>> {
        let groups = {
            let dir = self.dir_of(node)?;
            dir.all_groups()?
        };
        Ok(groups
            .into_iter()
            .map(|(_, set)| DirentInfo {
                name: set.name.to_string(),
                stat: self.stat_of_set(&set),
            })
            .collect())
    }

    pub fn getattr(&self, path: &str) -> Result<Stat> {
        let node = self.get(path)?;
        let stat = self.stat(&node);
        self.put(node)?;
        Ok(stat)
    }

    pub fn stat(&self, node: &Arc<Node>) -> Stat {
        let inner = node.inner.read().unwrap();
        Stat {
            size: inner.size,
            is_directory: inner.is_directory(),
            attributes: inner.attributes,
            mode: self.opts.mode_for(inner.attributes),
            uid: self.opts.uid,
            gid: self.opts.gid,
            nlink: 1,
            atime: inner.timestamps.accessed.to_unix(),
            mtime: inner.timestamps.modified.to_unix(),
            crtime: inner.timestamps.created.to_unix(),
        }
    }

    fn stat_of_set(&self, set: &EntrySet) -> Stat {
        Stat {
            size: set.size,
            is_directory: set
                .attributes
                .contains(crate::dir::entry::FileAttributes::DIRECTORY),
            attributes: set.attributes,
            mode: self.opts.mode_for(set.attributes),
            uid: self.opts.uid,
            gid: self.opts.gid,
            nlink: 1,
            atime: set.timestamps.accessed.to_unix(),
            mtime: set.timestamps.modified.to_unix(),
            crtime: set.timestamps.created.to_unix(),
        }
    }
}
