//! Inode management for the FUSE filesystem.
//!
//! Maps FUSE inode numbers to mount paths and back, with the kernel's
//! `nlookup` reference count tracked per inode.

use crate::path::MountPath;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::Ref;
use std::sync::atomic::{AtomicU64, Ordering};

/// The root inode number (FUSE convention).
pub const ROOT_INODE: u64 = 1;

/// An entry in the inode table.
#[derive(Debug)]
pub struct InodeEntry {
    /// Current path of the inode.
    pub path: MountPath,
    /// Lookup count for `forget()` handling.
    nlookup: AtomicU64,
}

impl InodeEntry {
    fn with_nlookup(path: MountPath, nlookup: u64) -> Self {
        Self {
            path,
            nlookup: AtomicU64::new(nlookup),
        }
    }

    /// Increments the lookup count and returns the new value.
    pub fn inc_nlookup(&self) -> u64 {
        self.nlookup.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Decrements the lookup count by `count` and returns the new value.
    /// Returns `None` if the count would go negative.
    pub fn dec_nlookup(&self, count: u64) -> Option<u64> {
        let old = self.nlookup.fetch_sub(count, Ordering::AcqRel);
        if old < count {
            self.nlookup.fetch_add(count, Ordering::Relaxed);
            None
        } else {
            Some(old - count)
        }
    }

    pub fn nlookup(&self) -> u64 {
        self.nlookup.load(Ordering::Relaxed)
    }
}

/// Thread-safe bidirectional inode ↔ path table.
pub struct InodeTable {
    by_inode: DashMap<u64, InodeEntry>,
    by_path: DashMap<MountPath, u64>,
    next_inode: AtomicU64,
}

impl InodeTable {
    /// Creates a table holding only the root inode.
    pub fn new() -> Self {
        let table = Self {
            by_inode: DashMap::new(),
            by_path: DashMap::new(),
            next_inode: AtomicU64::new(ROOT_INODE + 1),
        };
        table
            .by_inode
            .insert(ROOT_INODE, InodeEntry::with_nlookup(MountPath::root(), 1));
        table.by_path.insert(MountPath::root(), ROOT_INODE);
        table
    }

    /// Returns the inode of `path`, allocating one if needed, and counts
    /// one kernel lookup against it.
    pub fn get_or_insert(&self, path: &MountPath) -> u64 {
        self.get_or_insert_with(path, 1)
    }

    /// Like [`InodeTable::get_or_insert`] but without counting a lookup,
    /// for entries returned from `readdir()`.
    pub fn get_or_insert_no_lookup_inc(&self, path: &MountPath) -> u64 {
        self.get_or_insert_with(path, 0)
    }

    fn get_or_insert_with(&self, path: &MountPath, lookups: u64) -> u64 {
        match self.by_path.entry(path.clone()) {
            Entry::Occupied(entry) => {
                let inode = *entry.get();
                drop(entry);
                if lookups > 0
                    && let Some(e) = self.by_inode.get(&inode)
                {
                    e.inc_nlookup();
                }
                inode
            }
            Entry::Vacant(entry) => {
                let inode = self.next_inode.fetch_add(1, Ordering::Relaxed);
                self.by_inode
                    .insert(inode, InodeEntry::with_nlookup(path.clone(), lookups));
                entry.insert(inode);
                inode
            }
        }
    }

    pub fn get(&self, inode: u64) -> Option<Ref<'_, u64, InodeEntry>> {
        self.by_inode.get(&inode)
    }

    /// Current path of `inode`.
    pub fn path(&self, inode: u64) -> Option<MountPath> {
        self.by_inode.get(&inode).map(|e| e.path.clone())
    }

    /// Inode currently mapped to `path`.
    pub fn get_inode(&self, path: &MountPath) -> Option<u64> {
        self.by_path.get(path).map(|r| *r)
    }

    /// Drops `nlookup` kernel references. Returns `true` if the inode was
    /// evicted. The root is never evicted.
    pub fn forget(&self, inode: u64, nlookup: u64) -> bool {
        if inode == ROOT_INODE {
            return false;
        }
        let remaining = match self.by_inode.get(&inode) {
            Some(entry) => entry.dec_nlookup(nlookup),
            None => return false,
        };
        if remaining != Some(0) {
            return false;
        }
        match self.by_inode.remove(&inode) {
            Some((_, entry)) => {
                self.by_path.remove_if(&entry.path, |_, ino| *ino == inode);
                true
            }
            None => false,
        }
    }

    /// Unmaps `path` and everything below it (after a delete). The inode
    /// entries stay until the kernel forgets them.
    pub fn invalidate_path(&self, path: &MountPath) {
        self.by_path.retain(|p, _| !p.starts_with(path));
    }

    /// Re-paths every inode at or below `old` to live under `new`.
    pub fn rename_prefix(&self, old: &MountPath, new: &MountPath) {
        self.invalidate_path(new);
        let moved: Vec<(MountPath, u64)> = self
            .by_path
            .iter()
            .filter(|e| e.key().starts_with(old))
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        for (from, inode) in moved {
            let Some(to) = from.rebase(old, new) else {
                continue;
            };
            self.by_path.remove(&from);
            if let Some(mut entry) = self.by_inode.get_mut(&inode) {
                entry.path = to.clone();
            }
            self.by_path.insert(to, inode);
        }
    }

    /// Number of inodes currently in the table.
    pub fn len(&self) -> usize {
        self.by_inode.len()
    }

    /// Always false: the root inode is permanent.
    pub fn is_empty(&self) -> bool {
        self.by_inode.is_empty()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> MountPath {
        MountPath::new(s)
    }

    #[test]
    fn test_root_inode_exists() {
        let table = InodeTable::new();
        assert_eq!(table.path(ROOT_INODE), Some(MountPath::root()));
        assert_eq!(table.get_inode(&MountPath::root()), Some(ROOT_INODE));
    }

    #[test]
    fn test_allocate_inode() {
        let table = InodeTable::new();
        let inode = table.get_or_insert(&p("/docs"));
        assert!(inode > ROOT_INODE);
        assert_eq!(table.get_or_insert(&p("/docs")), inode);
        assert_eq!(table.get(inode).unwrap().nlookup(), 2);
    }

    #[test]
    fn test_readdir_entries_do_not_count() {
        let table = InodeTable::new();
        let inode = table.get_or_insert_no_lookup_inc(&p("/listed"));
        assert_eq!(table.get(inode).unwrap().nlookup(), 0);
        assert_eq!(table.get_or_insert(&p("/listed")), inode);
        assert_eq!(table.get(inode).unwrap().nlookup(), 1);
    }

    #[test]
    fn test_forget_evicts() {
        let table = InodeTable::new();
        let inode = table.get_or_insert(&p("/temp"));
        assert!(table.forget(inode, 1));
        assert!(table.get(inode).is_none());
        assert!(table.get_inode(&p("/temp")).is_none());
    }

    #[test]
    fn test_forget_partial_keeps_inode() {
        let table = InodeTable::new();
        let inode = table.get_or_insert(&p("/temp"));
        table.get_or_insert(&p("/temp"));
        assert!(!table.forget(inode, 1));
        assert_eq!(table.get(inode).unwrap().nlookup(), 1);
    }

    #[test]
    fn test_forget_root_never_evicts() {
        let table = InodeTable::new();
        assert!(!table.forget(ROOT_INODE, 1));
        assert!(table.get(ROOT_INODE).is_some());
    }

    #[test]
    fn test_invalidate_path_keeps_entry() {
        let table = InodeTable::new();
        let dir = table.get_or_insert(&p("/d"));
        let child = table.get_or_insert(&p("/d/f"));
        table.invalidate_path(&p("/d"));
        assert!(table.get_inode(&p("/d")).is_none());
        assert!(table.get_inode(&p("/d/f")).is_none());
        assert!(table.get(dir).is_some());
        assert!(table.get(child).is_some());

        // A new entry at the same path gets a fresh inode.
        assert_ne!(table.get_or_insert(&p("/d")), dir);
    }

    #[test]
    fn test_rename_prefix_moves_descendants() {
        let table = InodeTable::new();
        let dir = table.get_or_insert(&p("/old"));
        let child = table.get_or_insert(&p("/old/sub/file"));
        let sibling = table.get_or_insert(&p("/older"));

        table.rename_prefix(&p("/old"), &p("/new"));
        assert_eq!(table.get_inode(&p("/new")), Some(dir));
        assert_eq!(table.get_inode(&p("/new/sub/file")), Some(child));
        assert_eq!(table.path(child), Some(p("/new/sub/file")));
        assert!(table.get_inode(&p("/old")).is_none());
        assert_eq!(table.get_inode(&p("/older")), Some(sibling));
    }

    #[test]
    fn test_rename_prefix_replaces_target() {
        let table = InodeTable::new();
        let src = table.get_or_insert(&p("/a"));
        let target = table.get_or_insert(&p("/b"));
        table.rename_prefix(&p("/a"), &p("/b"));
        assert_eq!(table.get_inode(&p("/b")), Some(src));
        // The replaced inode is unmapped but alive until forgotten.
        assert!(table.get(target).is_some());
        assert!(table.forget(target, 1));
    }
}
