//! Path-resolution cache.
//!
//! Maps (parent inode, child name) to the child's inode so repeated path walks skip the
//! directory scans. Entries live in an arena and point at their parent by index, which
//! gives ".." a cycle-free representation (the root is its own parent) and keeps parent
//! links stable for the life of an entry. Removal leaves a tombstone in the map, so a
//! present key with an empty value is still a miss.

use hashbrown::HashMap;
use log::warn;
use parking_lot::RwLock;

use crate::err::{FsError, FsResult};
use crate::inode::InodeNo;

/// Index of a cache node in the arena.
pub(crate) type NodeId = usize;

#[derive(Clone, Copy, Debug)]
pub(crate) struct DCacheNode {
    /// Arena index of the parent entry; the root points at itself.
    pub(crate) parent: NodeId,

    pub(crate) ino: InodeNo,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct Key {
    parent_ino: InodeNo,
    name: Box<[u8]>,
}

impl Key {
    fn new(parent_ino: InodeNo, name: &[u8]) -> Self {
        Self {
            parent_ino,
            name: name.into(),
        }
    }
}

struct Inner {
    arena: Vec<DCacheNode>,
    map: HashMap<Key, Option<NodeId>>,
    root: Option<NodeId>,
}

pub(crate) struct DCache {
    inner: RwLock<Inner>,
}

impl DCache {
    pub(crate) fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                arena: Vec::new(),
                map: HashMap::new(),
                root: None,
            }),
        }
    }

    /// Seeds the cache with the self-parented root entry. A second call leaves the
    /// existing root untouched and reports the double initialization.
    pub(crate) fn init_root(&self, root_ino: InodeNo) -> FsResult<()> {
        let mut inner = self.inner.write();
        if inner.root.is_some() {
            warn!("reinitializing dcache root, ignored");
            return Err(FsError::AlreadyMounted);
        }

        inner.arena.push(DCacheNode {
            parent: 0,
            ino: root_ino,
        });
        inner.root = Some(0);
        Ok(())
    }

    pub(crate) fn root(&self) -> NodeId {
        let inner = self.inner.read();
        inner.root.expect("dcache root not initialized")
    }

    pub(crate) fn node(&self, id: NodeId) -> DCacheNode {
        self.inner.read().arena[id]
    }

    /// The cached child of `parent` named `name`, if any. Tombstones are misses.
    pub(crate) fn lookup(&self, name: &[u8], parent: NodeId) -> Option<NodeId> {
        let inner = self.inner.read();
        let key = Key::new(inner.arena[parent].ino, name);
        inner.map.get(&key).copied().flatten()
    }

    /// Caches `name` under `parent`, replacing any prior mapping for that key. The old
    /// entry, if any, stays in the arena; parent links are never rehomed.
    pub(crate) fn insert(&self, name: &[u8], ino: InodeNo, parent: NodeId) {
        let mut inner = self.inner.write();
        let key = Key::new(inner.arena[parent].ino, name);

        inner.arena.push(DCacheNode { parent, ino });
        let id = inner.arena.len() - 1;
        inner.map.insert(key, Some(id));
    }

    /// Tombstones the mapping for `name` under the directory numbered `parent_ino`.
    pub(crate) fn remove(&self, name: &[u8], parent_ino: InodeNo) {
        let mut inner = self.inner.write();
        let key = Key::new(parent_ino, name);
        if let Some(slot) = inner.map.get_mut(&key) {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_self_parented_and_init_is_idempotent() {
        let dc = DCache::new();
        assert_eq!(dc.init_root(InodeNo::ROOT), Ok(()));
        assert_eq!(
            dc.init_root(InodeNo::from_raw(7)),
            Err(FsError::AlreadyMounted)
        );

        // the rejected reinit left the original root in place
        let root = dc.root();
        let node = dc.node(root);
        assert_eq!(node.parent, root);
        assert_eq!(node.ino, InodeNo::ROOT);
    }

    #[test]
    fn lookup_follows_insert() {
        let dc = DCache::new();
        dc.init_root(InodeNo::ROOT).unwrap();
        let root = dc.root();

        assert!(dc.lookup(b"etc", root).is_none());
        dc.insert(b"etc", InodeNo::from_raw(12), root);

        let etc = dc.lookup(b"etc", root).unwrap();
        assert_eq!(dc.node(etc).ino.raw(), 12);
        assert_eq!(dc.node(etc).parent, root);
    }

    #[test]
    fn same_name_under_different_parents_does_not_collide() {
        let dc = DCache::new();
        dc.init_root(InodeNo::ROOT).unwrap();
        let root = dc.root();

        dc.insert(b"a", InodeNo::from_raw(11), root);
        let a = dc.lookup(b"a", root).unwrap();
        dc.insert(b"x", InodeNo::from_raw(21), root);
        dc.insert(b"x", InodeNo::from_raw(22), a);

        let x_under_root = dc.lookup(b"x", root).unwrap();
        let x_under_a = dc.lookup(b"x", a).unwrap();
        assert_eq!(dc.node(x_under_root).ino.raw(), 21);
        assert_eq!(dc.node(x_under_a).ino.raw(), 22);
    }

    #[test]
    fn remove_leaves_a_tombstone() {
        let dc = DCache::new();
        dc.init_root(InodeNo::ROOT).unwrap();
        let root = dc.root();

        dc.insert(b"tmp", InodeNo::from_raw(30), root);
        dc.remove(b"tmp", InodeNo::ROOT);
        assert!(dc.lookup(b"tmp", root).is_none());

        // reinsertion over the tombstone revives the key
        dc.insert(b"tmp", InodeNo::from_raw(31), root);
        assert_eq!(dc.node(dc.lookup(b"tmp", root).unwrap()).ino.raw(), 31);
    }
}
