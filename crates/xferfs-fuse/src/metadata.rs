//! In-memory mirror of remote file metadata.
//!
//! Directories are loaded lazily, one remote listing per directory, and stay
//! loaded for the lifetime of the mount unless explicitly invalidated. Local
//! mutations (create, mkdir, remove, rename, size changes) update the mirror
//! immediately; it is the source of truth for every later lookup.

use crate::error::{FsError, FsResult};
use crate::path::MountPath;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, trace};
use xferfs_gateway::{EntryKind, ListingEntry, TransferGateway};

/// Permission bits of the root directory.
pub const ROOT_PERMISSIONS: u16 = 0o755;

/// Type of a mirrored entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Directory,
    RegularFile,
}

/// Attributes of one mirrored path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttributes {
    pub kind: FileKind,
    /// Permission bits (no file type bits).
    pub perm: u16,
    pub size: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub nlink: u32,
}

impl FileAttributes {
    /// Attributes of a freshly created, empty regular file.
    pub fn new_file(perm: u16, now: SystemTime) -> Self {
        Self {
            kind: FileKind::RegularFile,
            perm: perm & 0o7777,
            size: 0,
            atime: now,
            mtime: now,
            ctime: now,
            nlink: 1,
        }
    }

    /// Attributes of a freshly created directory.
    pub fn new_directory(perm: u16, now: SystemTime) -> Self {
        Self {
            kind: FileKind::Directory,
            nlink: 2,
            ..Self::new_file(perm, now)
        }
    }

    /// Attributes built from a remote listing entry.
    pub fn from_listing(entry: &ListingEntry, now: SystemTime) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let perm = (entry.permissions & 0o7777) as u16;
        let mtime = entry.last_modified.unwrap_or(now);
        let mut attrs = match entry.kind {
            EntryKind::Dir => Self::new_directory(perm, now),
            EntryKind::File => Self::new_file(perm, now),
        };
        attrs.size = entry.size;
        attrs.mtime = mtime;
        attrs.ctime = mtime;
        attrs
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

#[derive(Debug, Default)]
struct MirrorState {
    /// Attributes per path.
    files: HashMap<MountPath, FileAttributes>,
    /// Child names per loaded directory.
    dirs: HashMap<MountPath, BTreeSet<String>>,
}

impl MirrorState {
    /// Drops every entry strictly below `dir`.
    fn drop_descendants(&mut self, dir: &MountPath) {
        self.files.retain(|p, _| p == dir || !p.starts_with(dir));
        self.dirs.retain(|p, _| p == dir || !p.starts_with(dir));
    }

    fn unregister(&mut self, path: &MountPath) {
        if let (Some(listing), Some(name)) = (self.dirs.get_mut(&path.parent()), path.file_name())
        {
            listing.remove(name);
        }
    }
}

/// Lazily populated path → attributes map for one remote endpoint.
pub struct MetadataMirror {
    gateway: Arc<dyn TransferGateway>,
    endpoint: String,
    state: Mutex<MirrorState>,
}

impl MetadataMirror {
    /// Creates a mirror for `endpoint` with the root seeded and loaded.
    pub fn new(gateway: Arc<dyn TransferGateway>, endpoint: impl Into<String>) -> FsResult<Self> {
        let mut state = MirrorState::default();
        state.files.insert(
            MountPath::root(),
            FileAttributes::new_directory(ROOT_PERMISSIONS, SystemTime::now()),
        );
        let mirror = Self {
            gateway,
            endpoint: endpoint.into(),
            state: Mutex::new(state),
        };
        mirror.ensure_loaded(&MountPath::root())?;
        Ok(mirror)
    }

    /// Endpoint this mirror reflects.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Returns the attributes of `path`, loading its parent directory first.
    pub fn stat(&self, path: &MountPath) -> FsResult<FileAttributes> {
        if !path.is_root() {
            self.ensure_loaded(&path.parent())?;
        }
        self.state
            .lock()
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| FsError::NotFound(path.to_string()))
    }

    /// Lists a directory, synthetic `.` and `..` first.
    pub fn listdir(&self, path: &MountPath) -> FsResult<Vec<String>> {
        self.ensure_loaded(path)?;
        let state = self.state.lock();
        let listing = state
            .dirs
            .get(path)
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        let mut names = Vec::with_capacity(listing.len() + 2);
        names.push(".".to_string());
        names.push("..".to_string());
        names.extend(listing.iter().cloned());
        Ok(names)
    }

    /// Whether the listing of `dir` is resident.
    pub fn is_loaded(&self, dir: &MountPath) -> bool {
        self.state.lock().dirs.contains_key(dir)
    }

    /// Registers a new, empty regular file.
    pub fn new_file(&self, path: &MountPath, perm: u16) -> FsResult<FileAttributes> {
        self.insert_new(path, FileAttributes::new_file(perm, SystemTime::now()))
    }

    /// Registers a new, empty directory. Its listing counts as loaded.
    pub fn new_directory(&self, path: &MountPath, perm: u16) -> FsResult<FileAttributes> {
        self.insert_new(path, FileAttributes::new_directory(perm, SystemTime::now()))
    }

    fn insert_new(&self, path: &MountPath, attrs: FileAttributes) -> FsResult<FileAttributes> {
        let name = path
            .file_name()
            .ok_or_else(|| FsError::AlreadyExists(path.to_string()))?
            .to_string();
        let mut state = self.state.lock();
        let parent = path.parent();
        if !state.dirs.contains_key(&parent) {
            return Err(FsError::ParentNotLoaded(parent.to_string()));
        }
        if state.files.contains_key(path) {
            return Err(FsError::AlreadyExists(path.to_string()));
        }
        if attrs.is_dir() {
            state.dirs.insert(path.clone(), BTreeSet::new());
        }
        state.files.insert(path.clone(), attrs.clone());
        if let Some(listing) = state.dirs.get_mut(&parent) {
            listing.insert(name);
        }
        trace!(path = %path, kind = ?attrs.kind, "Registered new entry");
        Ok(attrs)
    }

    /// Removes `path` (and anything mirrored below it) from the mirror.
    pub fn remove(&self, path: &MountPath) -> FsResult<()> {
        if path.is_root() {
            return Err(FsError::NotSupported);
        }
        let mut state = self.state.lock();
        if state.files.remove(path).is_none() {
            return Err(FsError::NotFound(path.to_string()));
        }
        state.dirs.remove(path);
        state.drop_descendants(path);
        state.unregister(path);
        trace!(path = %path, "Removed entry");
        Ok(())
    }

    /// Moves the entry at `old` to `new`, replacing any entry at `new`.
    ///
    /// Directory renames carry every mirrored descendant along.
    pub fn rename(&self, old: &MountPath, new: &MountPath) -> FsResult<()> {
        if old == new {
            return Ok(());
        }
        if old.is_root() || new.is_root() || new.starts_with(old) {
            return Err(FsError::InvalidName(new.to_string()));
        }
        let Some(new_name) = new.file_name().map(str::to_string) else {
            return Err(FsError::InvalidName(new.to_string()));
        };
        // Listings below `old` can only be fetched from the old remote path,
        // which stops existing once the queued move runs.
        if self.stat(old)?.is_dir() {
            self.load_subtree(old)?;
        }

        let mut state = self.state.lock();
        if !state.files.contains_key(old) {
            return Err(FsError::NotFound(old.to_string()));
        }
        let new_parent = new.parent();
        if !state.dirs.contains_key(&new_parent) {
            return Err(FsError::ParentNotLoaded(new_parent.to_string()));
        }

        // Replace the target.
        if state.files.remove(new).is_some() {
            state.dirs.remove(new);
            state.drop_descendants(new);
        }

        let moved: Vec<MountPath> = state
            .files
            .keys()
            .filter(|p| p.starts_with(old))
            .cloned()
            .collect();
        for from in moved {
            if let (Some(to), Some(attrs)) = (from.rebase(old, new), state.files.remove(&from)) {
                state.files.insert(to, attrs);
            }
        }
        let moved_dirs: Vec<MountPath> = state
            .dirs
            .keys()
            .filter(|p| p.starts_with(old))
            .cloned()
            .collect();
        for from in moved_dirs {
            if let (Some(to), Some(listing)) = (from.rebase(old, new), state.dirs.remove(&from)) {
                state.dirs.insert(to, listing);
            }
        }

        state.unregister(old);
        if let Some(listing) = state.dirs.get_mut(&new_parent) {
            listing.insert(new_name);
        }
        if let Some(attrs) = state.files.get_mut(new) {
            attrs.ctime = SystemTime::now();
        }
        trace!(from = %old, to = %new, "Renamed entry");
        Ok(())
    }

    /// Records a new size for `path`.
    pub fn change_size(&self, path: &MountPath, size: u64) -> FsResult<()> {
        let mut state = self.state.lock();
        let attrs = state
            .files
            .get_mut(path)
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        let now = SystemTime::now();
        attrs.size = size;
        attrs.mtime = now;
        attrs.ctime = now;
        Ok(())
    }

    /// Updates the timestamps of `path`.
    pub fn set_times(
        &self,
        path: &MountPath,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> FsResult<FileAttributes> {
        let mut state = self.state.lock();
        let attrs = state
            .files
            .get_mut(path)
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        if let Some(t) = atime {
            attrs.atime = t;
        }
        if let Some(t) = mtime {
            attrs.mtime = t;
        }
        attrs.ctime = SystemTime::now();
        Ok(attrs.clone())
    }

    /// Forgets the listing of `dir` and everything mirrored below it, so the
    /// next access reloads it from the remote endpoint.
    pub fn invalidate(&self, dir: &MountPath) {
        let mut state = self.state.lock();
        if state.dirs.remove(dir).is_some() {
            state.drop_descendants(dir);
            debug!(path = %dir, "Invalidated directory");
        }
    }

    /// Loads every directory listing at or below `dir`.
    fn load_subtree(&self, dir: &MountPath) -> FsResult<()> {
        let mut pending = vec![dir.clone()];
        while let Some(next) = pending.pop() {
            self.ensure_loaded(&next)?;
            let state = self.state.lock();
            if let Some(listing) = state.dirs.get(&next) {
                pending.extend(
                    listing
                        .iter()
                        .map(|name| next.join(name))
                        .filter(|child| state.files.get(child).is_some_and(FileAttributes::is_dir)),
                );
            }
        }
        trace!(path = %dir, "Subtree loaded");
        Ok(())
    }

    /// Loads the listing of `dir` if it is not resident yet.
    ///
    /// Ancestors are loaded first so the directory itself has attributes.
    /// The remote call is made without holding the lock; a listing that was
    /// inserted concurrently wins.
    fn ensure_loaded(&self, dir: &MountPath) -> FsResult<()> {
        if self.is_loaded(dir) {
            return Ok(());
        }
        if !dir.is_root() && !self.stat(dir)?.is_dir() {
            return Err(FsError::NotADirectory(dir.to_string()));
        }

        debug!(endpoint = %self.endpoint, path = %dir, "Loading directory from remote");
        let entries = self
            .gateway
            .list_directory(&self.endpoint, dir.as_str())
            .map_err(|e| {
                if e.is_not_found() {
                    FsError::NotFound(dir.to_string())
                } else {
                    e.into()
                }
            })?;
        let now = SystemTime::now();

        let mut state = self.state.lock();
        if state.dirs.contains_key(dir) {
            return Ok(());
        }
        if !state.files.contains_key(dir) {
            // Removed locally while the listing was in flight.
            return Err(FsError::NotFound(dir.to_string()));
        }
        let mut names = BTreeSet::new();
        for entry in &entries {
            if entry.name.is_empty()
                || entry.name == "."
                || entry.name == ".."
                || entry.name.contains('/')
            {
                continue;
            }
            state
                .files
                .insert(dir.join(&entry.name), FileAttributes::from_listing(entry, now));
            names.insert(entry.name.clone());
        }
        trace!(path = %dir, count = names.len(), "Directory loaded");
        state.dirs.insert(dir.clone(), names);
        Ok(())
    }
}
