//! Thread-safe handle table.
//!
//! Backs both the content cache (keyed by mount path) and the FUSE file
//! handle numbers handed to the kernel (auto-incrementing `u64` keys).

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::Ref;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

/// Concurrent map from handle keys to handle values.
///
/// ```
/// use xferfs_fuse::handles::HandleTable;
///
/// let table: HandleTable<u64, &str> = HandleTable::new_auto_id();
/// let fh = table.insert_auto("/docs/a.txt");
/// assert_eq!(*table.get(&fh).unwrap(), "/docs/a.txt");
/// assert_eq!(table.remove(&fh), Some("/docs/a.txt"));
/// ```
#[derive(Debug)]
pub struct HandleTable<K, V>
where
    K: Eq + Hash,
{
    handles: DashMap<K, V>,
    /// Next auto ID; 0 is never handed out. `None` for caller-keyed tables.
    next_id: Option<AtomicU64>,
}

impl<V> HandleTable<u64, V> {
    /// Creates a table that generates its own `u64` keys, starting at 1.
    pub fn new_auto_id() -> Self {
        Self {
            handles: DashMap::new(),
            next_id: Some(AtomicU64::new(1)),
        }
    }

    /// Inserts a value under a freshly generated key and returns the key.
    ///
    /// # Panics
    ///
    /// Panics if the table was not created with [`HandleTable::new_auto_id`].
    pub fn insert_auto(&self, value: V) -> u64 {
        let next_id = self
            .next_id
            .as_ref()
            .expect("insert_auto requires new_auto_id");
        let mut value = Some(value);
        loop {
            let id = next_id.fetch_add(1, Ordering::Relaxed);
            if id == 0 {
                continue;
            }
            if let Entry::Vacant(entry) = self.handles.entry(id)
                && let Some(value) = value.take()
            {
                entry.insert(value);
                return id;
            }
        }
    }
}

impl<K, V> HandleTable<K, V>
where
    K: Eq + Hash,
{
    /// Creates a table keyed by caller-provided keys.
    pub fn new() -> Self {
        Self {
            handles: DashMap::new(),
            next_id: None,
        }
    }

    /// Inserts a handle, returning the value it replaced.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.handles.insert(key, value)
    }

    pub fn get(&self, key: &K) -> Option<Ref<'_, K, V>> {
        self.handles.get(key)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.handles.remove(key).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn clear(&self) {
        self.handles.clear();
    }

    /// Moves the handle stored under `old` to `new`, replacing any handle
    /// already stored there. Returns whether a handle was moved.
    pub fn rekey(&self, old: &K, new: K) -> bool {
        match self.handles.remove(old) {
            Some((_, value)) => {
                self.handles.insert(new, value);
                true
            }
            None => false,
        }
    }
}

impl<K, V> HandleTable<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Snapshot of the current keys.
    pub fn keys(&self) -> Vec<K> {
        self.handles.iter().map(|e| e.key().clone()).collect()
    }
}

impl<K, V> Default for HandleTable<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}
