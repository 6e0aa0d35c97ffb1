//! Inode index.
//!
//! Maps inode addresses to tree slots. The index never owns entries; it is kept consistent with
//! the tree by the tree itself.

use rustc_hash::FxHashMap;

use super::InodeAddr;
use super::tree::NodeId;

/// Inode address to tree slot lookup.
#[derive(Debug, Default)]
pub struct InodeIndex {
    map: FxHashMap<InodeAddr, NodeId>,
}

impl InodeIndex {
    /// Point `ino` at `node`.
    pub fn insert(&mut self, ino: InodeAddr, node: NodeId) {
        self.map.insert(ino, node);
    }

    /// The slot holding `ino`.
    #[must_use]
    pub fn get(&self, ino: InodeAddr) -> Option<NodeId> {
        self.map.get(&ino).copied()
    }

    /// Forget `ino`.
    pub fn remove(&mut self, ino: InodeAddr) -> Option<NodeId> {
        self.map.remove(&ino)
    }

    /// Number of indexed inodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether nothing is indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
