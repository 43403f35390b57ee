use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use bitflags::bitflags;

use crate::dir::entry::{EntrySet, ExfatName, FileAttributes};
use crate::timestamp::Timestamps;

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub(crate) struct NodeFlags: u8 {
        /// The cluster chain is an arithmetic progression starting at
        /// `start_cluster`; the FAT holds no links for it.
        const CONTIGUOUS = 1 << 0;
        /// In-memory metadata differs from the on-disk entry group.
        const DIRTY = 1 << 1;
        /// Unlinked while handles were open; clusters are freed on the
        /// last put.
        const UNLINKED = 1 << 2;
    }
}

/// Identity of a node's entry group: the parent directory's first cluster
/// plus the group's byte offset within the parent.
pub(crate) type NodeKey = (u32, u64);

/// `entry_offset` value used by nodes without an on-disk group (the root).
pub(crate) const NO_ENTRY_OFFSET: u64 = u64::MAX;

/// In-memory representation of one file or directory, shared between path
/// lookup, open handles and writeback.
pub struct Node {
    pub(crate) inner: RwLock<NodeInner>,
}

pub(crate) struct NodeInner {
    pub(crate) key: NodeKey,
    pub(crate) start_cluster: u32,
    pub(crate) size: u64,
    pub(crate) valid_size: u64,
    pub(crate) attributes: FileAttributes,
    pub(crate) flags: NodeFlags,
    pub(crate) timestamps: Timestamps,
    pub(crate) name: ExfatName,
    /// Byte offset of the entry group inside the parent directory.
    pub(crate) entry_offset: u64,
    /// Secondary entries following the file entry on disk.
    pub(crate) continuations: u8,
    /// Live handles (lookups not yet put back).
    pub(crate) references: u32,
    pub(crate) parent: Option<Arc<Node>>,
}

impl NodeInner {
    pub(crate) fn is_directory(&self) -> bool {
        self.attributes.contains(FileAttributes::DIRECTORY)
    }

    pub(crate) fn is_contiguous(&self) -> bool {
        self.flags.contains(NodeFlags::CONTIGUOUS)
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.flags.insert(NodeFlags::DIRTY);
    }
}

impl Node {
    pub(crate) fn from_entry_set(
        set: EntrySet,
        parent: Arc<Node>,
        parent_start: u32,
        entry_offset: u64,
    ) -> Node {
        let mut flags = NodeFlags::empty();
        if set.contiguous {
            flags.insert(NodeFlags::CONTIGUOUS);
        }
        let continuations = set.continuations();
        Node {
            inner: RwLock::new(NodeInner {
                key: (parent_start, entry_offset),
                start_cluster: set.first_cluster,
                size: set.size,
                valid_size: set.valid_size,
                attributes: set.attributes,
                flags,
                timestamps: set.timestamps,
                name: set.name,
                entry_offset,
                continuations,
                references: 1,
                parent: Some(parent),
            }),
        }
    }

    /// The root directory has no entry group of its own; its size comes
    /// from walking the FAT chain at mount.
    pub(crate) fn new_root(start_cluster: u32, size: u64, timestamps: Timestamps) -> Node {
        Node {
            inner: RwLock::new(NodeInner {
                key: (0, NO_ENTRY_OFFSET),
                start_cluster,
                size,
                valid_size: size,
                attributes: FileAttributes::DIRECTORY,
                flags: NodeFlags::empty(),
                timestamps,
                name: ExfatName::raw(vec![b'/' as u16]),
                entry_offset: NO_ENTRY_OFFSET,
                continuations: 0,
                references: 1,
                parent: None,
            }),
        }
    }

    pub fn is_directory(&self) -> bool {
        self.inner.read().unwrap().is_directory()
    }

    pub fn is_root(&self) -> bool {
        self.inner.read().unwrap().parent.is_none()
    }

    pub fn size(&self) -> u64 {
        self.inner.read().unwrap().size
    }

    pub fn start_cluster(&self) -> u32 {
        self.inner.read().unwrap().start_cluster
    }

    pub fn name(&self) -> String {
        self.inner.read().unwrap().name.to_string()
    }
}

/// De-duplicates live nodes so every open handle to the same on-disk file
/// shares one [`Node`] (and one set of cached metadata). The root is owned
/// by the filesystem, not the table.
pub(crate) struct NodeTable {
    map: HashMap<NodeKey, Arc<Node>>,
}

impl NodeTable {
    pub(crate) fn new() -> NodeTable {
        NodeTable {
            map: HashMap::new(),
        }
    }

    pub(crate) fn get(&self, key: &NodeKey) -> Option<Arc<Node>> {
        self.map.get(key).cloned()
    }

    pub(crate) fn insert(&mut self, key: NodeKey, node: Arc<Node>) {
        self.map.insert(key, node);
    }

    pub(crate) fn remove(&mut self, key: &NodeKey) -> Option<Arc<Node>> {
        self.map.remove(key)
    }

    pub(crate) fn nodes(&self) -> Vec<Arc<Node>> {
        self.map.values().cloned().collect()
    }
}
