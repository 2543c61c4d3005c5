//! Local on-disk mirror of remote file content.
//!
//! A remote file is downloaded into the scratch directory the first time it
//! is opened and stays resident for the rest of the mount session. All byte
//! I/O goes through the local mirror; only the download touches the network.
//!
//! Open handles are shared per path: repeated opens of one path reuse the
//! same [`CacheHandle`], which is closed when the last opener releases it.
//! Unlinking a path detaches its open handle, which keeps working on its own
//! local file until released.

use crate::config::BridgeConfig;
use crate::error::{FsError, FsResult};
use crate::handles::HandleTable;
use crate::path::MountPath;
use crate::task::{TaskOutcome, wait_for_task};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use xferfs_gateway::{TransferGateway, TransferItem};

/// Shared, lockable handle to a cached file.
pub type SharedHandle = Arc<Mutex<CacheHandle>>;

/// An open local mirror of one remote file.
#[derive(Debug)]
pub struct CacheHandle {
    file: File,
    /// Mount path the handle currently serves. Follows renames.
    path: MountPath,
    local_path: PathBuf,
    writable: bool,
    /// Number of outstanding opens sharing this handle.
    opens: usize,
    /// Modified since it was opened (or created locally).
    dirty: bool,
    /// The path was unlinked while open; nothing is written back.
    unlinked: bool,
}

impl CacheHandle {
    fn open(path: MountPath, local_path: PathBuf, writable: bool) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(&local_path)?;
        Ok(Self {
            file,
            path,
            local_path,
            writable,
            opens: 1,
            dirty: false,
            unlinked: false,
        })
    }

    /// Reopens the mirror for writing if it was opened read-only.
    fn ensure_writable(&mut self) -> io::Result<()> {
        if !self.writable {
            self.file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&self.local_path)?;
            self.writable = true;
        }
        Ok(())
    }

    /// Reads up to `size` bytes at `offset`. Short only at end of file.
    pub fn read_at(&mut self, offset: u64, size: usize) -> io::Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; size];
        let mut filled = 0;
        while filled < size {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }

    /// Writes all of `data` at `offset`.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<usize> {
        self.ensure_writable()?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        self.dirty = true;
        Ok(data.len())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }

    pub fn sync(&mut self, data_only: bool) -> io::Result<()> {
        if data_only {
            self.file.sync_data()
        } else {
            self.file.sync_all()
        }
    }

    pub fn set_len(&mut self, size: u64) -> io::Result<()> {
        self.ensure_writable()?;
        self.file.set_len(size)?;
        self.dirty = true;
        Ok(())
    }

    #[cfg(test)]
    fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn path(&self) -> &MountPath {
        &self.path
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Whether the path behind this handle was removed while it was open.
    pub fn is_unlinked(&self) -> bool {
        self.unlinked
    }
}

/// Result of releasing one open of a handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Release {
    /// Other opens still share the handle.
    StillOpen,
    /// The handle was closed.
    Closed {
        /// Mount path the handle served when it closed.
        path: MountPath,
        local_path: PathBuf,
        /// Content changed and should be written back.
        dirty: bool,
    },
}

/// Download-on-open content cache for one mount.
pub struct ContentCache {
    gateway: Arc<dyn TransferGateway>,
    remote_endpoint: String,
    local_endpoint: String,
    cache_dir: PathBuf,
    download_timeout: Duration,
    poll_interval: Duration,
    /// Resident mirrors: mount path → local file. Kept after release.
    resident: Mutex<HashMap<MountPath, PathBuf>>,
    /// Open handles of live paths.
    handles: HandleTable<MountPath, SharedHandle>,
    /// Open handles whose path was unlinked. Their local file is removed on
    /// the last release.
    orphans: Mutex<Vec<SharedHandle>>,
}

impl ContentCache {
    /// Creates the cache, recreating the scratch directory from scratch.
    pub fn new(gateway: Arc<dyn TransferGateway>, config: &BridgeConfig) -> FsResult<Self> {
        let cache_dir = config.cache_dir.clone();
        if cache_dir.exists() {
            debug!(dir = %cache_dir.display(), "Removing stale cache directory");
            fs::remove_dir_all(&cache_dir)?;
        }
        fs::create_dir_all(&cache_dir)?;
        // The transfer agent writing downloads may run as another user.
        fs::set_permissions(&cache_dir, fs::Permissions::from_mode(0o777))?;
        info!(dir = %cache_dir.display(), "Content cache ready");

        Ok(Self {
            gateway,
            remote_endpoint: config.remote_endpoint.clone(),
            local_endpoint: config.local_endpoint.clone(),
            cache_dir,
            download_timeout: config.download_timeout,
            poll_interval: config.download_poll_interval,
            resident: Mutex::new(HashMap::new()),
            handles: HandleTable::new(),
            orphans: Mutex::new(Vec::new()),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Creates an empty local mirror for a new path and opens it.
    pub fn create(&self, path: &MountPath) -> FsResult<SharedHandle> {
        let local = self.allocate(path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&local)?;
        let handle = Arc::new(Mutex::new(CacheHandle {
            file,
            path: path.clone(),
            local_path: local,
            writable: true,
            opens: 1,
            // Never uploaded yet, so the remote file does not exist.
            dirty: true,
            unlinked: false,
        }));
        self.handles.insert(path.clone(), Arc::clone(&handle));
        debug!(path = %path, "Created local mirror");
        Ok(handle)
    }

    /// Opens `path`, downloading it first if it has no local mirror.
    ///
    /// `flags` are the open(2) flags; the access mode decides whether the
    /// mirror is opened writable and `O_TRUNC` empties it.
    pub fn open(&self, path: &MountPath, flags: i32) -> FsResult<SharedHandle> {
        let writable = flags & libc::O_ACCMODE != libc::O_RDONLY;

        if let Some(handle) = self.get(path) {
            {
                let mut h = handle.lock();
                h.opens += 1;
                if writable {
                    h.ensure_writable()?;
                }
                if flags & libc::O_TRUNC != 0 {
                    h.set_len(0)?;
                }
            }
            return Ok(handle);
        }

        let local = match self.local_path(path) {
            Some(local) => local,
            None => self.download(path)?,
        };
        let mut handle =
            CacheHandle::open(path.clone(), local, writable || flags & libc::O_TRUNC != 0)?;
        if flags & libc::O_TRUNC != 0 {
            handle.set_len(0)?;
        }
        let handle = Arc::new(Mutex::new(handle));
        self.handles.insert(path.clone(), Arc::clone(&handle));
        Ok(handle)
    }

    /// Returns the open handle for `path`, if any.
    pub fn get(&self, path: &MountPath) -> Option<SharedHandle> {
        self.handles.get(path).map(|h| Arc::clone(h.value()))
    }

    /// Releases one open of `handle`.
    pub fn release(&self, handle: &SharedHandle) -> FsResult<Release> {
        let mut h = handle.lock();
        if h.opens == 0 {
            return Err(FsError::NotOpen(h.path.to_string()));
        }
        h.opens -= 1;
        if h.opens > 0 {
            return Ok(Release::StillOpen);
        }
        h.flush()?;
        if h.unlinked {
            self.orphans.lock().retain(|o| !Arc::ptr_eq(o, handle));
            remove_local(&h.local_path);
            return Ok(Release::Closed {
                path: h.path.clone(),
                local_path: h.local_path.clone(),
                dirty: false,
            });
        }
        let live = self
            .handles
            .get(&h.path)
            .is_some_and(|current| Arc::ptr_eq(current.value(), handle));
        if live {
            self.handles.remove(&h.path);
        }
        Ok(Release::Closed {
            path: h.path.clone(),
            local_path: h.local_path.clone(),
            dirty: std::mem::take(&mut h.dirty),
        })
    }

    /// Whether `path` has a local mirror.
    pub fn is_resident(&self, path: &MountPath) -> bool {
        self.resident.lock().contains_key(path)
    }

    /// Local mirror of `path`, if resident.
    pub fn local_path(&self, path: &MountPath) -> Option<PathBuf> {
        self.resident.lock().get(path).cloned()
    }

    /// Number of open handles, including unlinked ones.
    pub fn open_handles(&self) -> usize {
        self.handles.len() + self.orphans.lock().len()
    }

    /// Sets the size of the mirror of `path`, which must be open or resident.
    pub fn truncate(&self, path: &MountPath, size: u64) -> FsResult<()> {
        if let Some(handle) = self.get(path) {
            handle.lock().set_len(size)?;
            return Ok(());
        }
        let local = self
            .local_path(path)
            .ok_or_else(|| FsError::NotOpen(path.to_string()))?;
        OpenOptions::new().write(true).open(local)?.set_len(size)?;
        Ok(())
    }

    /// Carries residency and open handles of `old` (and anything below it)
    /// over to `new`.
    pub fn rename(&self, old: &MountPath, new: &MountPath) {
        {
            let mut resident = self.resident.lock();
            let moved: Vec<MountPath> = resident
                .keys()
                .filter(|p| p.starts_with(old))
                .cloned()
                .collect();
            for from in moved {
                if let (Some(to), Some(local)) = (from.rebase(old, new), resident.remove(&from)) {
                    resident.insert(to, local);
                }
            }
        }
        for from in self.handles.keys() {
            let Some(to) = from.rebase(old, new) else {
                continue;
            };
            if let Some(handle) = self.get(&from) {
                handle.lock().path = to.clone();
            }
            self.handles.rekey(&from, to);
        }
    }

    /// Drops the mirrors of `path` and anything below it.
    ///
    /// Open handles stay usable until released, after which their local
    /// file is removed. They no longer answer for the path, so a new file
    /// created there gets a handle and a local file of its own.
    pub fn forget(&self, path: &MountPath) {
        let dropped: Vec<PathBuf> = {
            let mut resident = self.resident.lock();
            let keys: Vec<MountPath> = resident
                .keys()
                .filter(|p| p.starts_with(path))
                .cloned()
                .collect();
            keys.iter().filter_map(|k| resident.remove(k)).collect()
        };

        let mut held: Vec<PathBuf> = Vec::new();
        for key in self.handles.keys() {
            if !key.starts_with(path) {
                continue;
            }
            let Some(handle) = self.handles.remove(&key) else {
                continue;
            };
            let mut h = handle.lock();
            if h.opens == 0 {
                continue;
            }
            h.unlinked = true;
            held.push(h.local_path.clone());
            self.orphans.lock().push(Arc::clone(&handle));
            debug!(path = %key, "Open file unlinked; removing its mirror on release");
        }

        for local in dropped.iter().filter(|local| !held.contains(local)) {
            remove_local(local);
        }
    }

    /// Closes every handle and removes the scratch directory.
    pub fn destroy(&self) -> FsResult<()> {
        self.handles.clear();
        self.orphans.lock().clear();
        self.resident.lock().clear();
        match fs::remove_dir_all(&self.cache_dir) {
            Ok(()) => {
                info!(dir = %self.cache_dir.display(), "Deleted local cache");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Picks the local file for `path` and records it as resident.
    ///
    /// Files are named by base name; a name already used by another
    /// resident path or by an unlinked open file gets a `~N` suffix.
    fn allocate(&self, path: &MountPath) -> PathBuf {
        let orphans: Vec<SharedHandle> = self.orphans.lock().clone();
        let orphaned: Vec<PathBuf> = orphans
            .iter()
            .map(|h| h.lock().local_path.clone())
            .collect();
        let mut resident = self.resident.lock();
        if let Some(existing) = resident.get(path) {
            return existing.clone();
        }
        let base = path.file_name().unwrap_or("root");
        let mut candidate = self.cache_dir.join(base);
        let mut n = 1;
        while resident.values().any(|used| *used == candidate) || orphaned.contains(&candidate) {
            candidate = self.cache_dir.join(format!("{base}~{n}"));
            n += 1;
        }
        resident.insert(path.clone(), candidate.clone());
        candidate
    }

    fn unallocate(&self, path: &MountPath) {
        if let Some(local) = self.resident.lock().remove(path) {
            remove_local(&local);
        }
    }

    /// Copies the remote file into the scratch directory, blocking until
    /// the transfer completes or the download timeout passes.
    fn download(&self, path: &MountPath) -> FsResult<PathBuf> {
        let local = self.allocate(path);
        match self.run_download(path, &local) {
            Ok(()) => Ok(local),
            Err(reason) => {
                warn!(path = %path, %reason, "Download failed");
                self.unallocate(path);
                Err(FsError::OpenFailed {
                    path: path.to_string(),
                    reason,
                })
            }
        }
    }

    fn run_download(&self, path: &MountPath, local: &Path) -> Result<(), String> {
        let destination = local
            .to_str()
            .ok_or_else(|| format!("cache path {} is not UTF-8", local.display()))?;
        info!(path = %path, "Copying to local cache");

        let submission = self.gateway.submission_id().map_err(|e| e.to_string())?;
        let task = self
            .gateway
            .submit_transfer(
                &submission,
                &self.remote_endpoint,
                &self.local_endpoint,
                &[TransferItem::new(path.as_str(), destination, false)],
            )
            .map_err(|e| e.to_string())?;
        let outcome = wait_for_task(
            self.gateway.as_ref(),
            &task,
            self.download_timeout,
            self.poll_interval,
        )
        .map_err(|e| e.to_string())?;

        match outcome {
            TaskOutcome::Succeeded if local.is_file() => Ok(()),
            TaskOutcome::Succeeded => Err(format!("task {task} left no file")),
            TaskOutcome::Failed => Err(format!("task {task} failed")),
            TaskOutcome::TimedOut => Err(format!(
                "task {task} did not complete within {:?}",
                self.download_timeout
            )),
        }
    }
}

fn remove_local(local: &Path) {
    if let Err(e) = fs::remove_file(local)
        && e.kind() != io::ErrorKind::NotFound
    {
        warn!(path = %local.display(), error = %e, "Failed to remove cached file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use xferfs_gateway::DirectoryGateway;

    struct Fixture {
        _remote: TempDir,
        scratch: TempDir,
        gw: Arc<DirectoryGateway>,
        cache: ContentCache,
    }

    fn fixture() -> Fixture {
        let remote = TempDir::new().unwrap();
        fs::create_dir(remote.path().join("a")).unwrap();
        fs::create_dir(remote.path().join("b")).unwrap();
        fs::write(remote.path().join("a/data.txt"), b"remote bytes").unwrap();
        fs::write(remote.path().join("b/data.txt"), b"other bytes").unwrap();
        let scratch = TempDir::new().unwrap();
        let gw = Arc::new(
            DirectoryGateway::new()
                .with_endpoint("remote", remote.path())
                .with_endpoint("local", "/"),
        );
        let config = BridgeConfig::new("remote", "local")
            .cache_dir(scratch.path().join("cache"))
            .download_timeout(Duration::from_millis(100))
            .download_poll_interval(Duration::from_millis(5));
        let cache = ContentCache::new(gw.clone(), &config).unwrap();
        Fixture {
            _remote: remote,
            scratch,
            gw,
            cache,
        }
    }

    fn p(s: &str) -> MountPath {
        MountPath::new(s)
    }

    #[test]
    fn test_new_recreates_scratch_dir() {
        let scratch = TempDir::new().unwrap();
        let dir = scratch.path().join("cache");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("stale"), b"old").unwrap();

        let gw = Arc::new(DirectoryGateway::new());
        let config = BridgeConfig::new("remote", "local").cache_dir(&dir);
        let _cache = ContentCache::new(gw, &config).unwrap();
        assert!(dir.is_dir());
        assert!(!dir.join("stale").exists());
    }

    #[test]
    fn test_open_downloads_once() {
        let f = fixture();
        let handle = f.cache.open(&p("/a/data.txt"), libc::O_RDONLY).unwrap();
        assert_eq!(handle.lock().read_at(0, 100).unwrap(), b"remote bytes");
        assert_eq!(f.gw.log().transfers().len(), 1);

        assert!(matches!(
            f.cache.release(&handle).unwrap(),
            Release::Closed { dirty: false, .. }
        ));
        assert!(f.cache.get(&p("/a/data.txt")).is_none());
        assert!(f.cache.is_resident(&p("/a/data.txt")));

        f.cache.open(&p("/a/data.txt"), libc::O_RDONLY).unwrap();
        assert_eq!(f.gw.log().transfers().len(), 1);
    }

    #[test]
    fn test_repeated_open_shares_handle() {
        let f = fixture();
        let first = f.cache.open(&p("/a/data.txt"), libc::O_RDONLY).unwrap();
        let second = f.cache.open(&p("/a/data.txt"), libc::O_RDWR).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        assert_eq!(f.cache.release(&first).unwrap(), Release::StillOpen);
        assert!(matches!(
            f.cache.release(&second).unwrap(),
            Release::Closed { .. }
        ));
        assert!(matches!(f.cache.release(&first), Err(FsError::NotOpen(_))));
    }

    #[test]
    fn test_base_name_collision_gets_suffix() {
        let f = fixture();
        let a = f.cache.open(&p("/a/data.txt"), libc::O_RDONLY).unwrap();
        let b = f.cache.open(&p("/b/data.txt"), libc::O_RDONLY).unwrap();
        assert_ne!(a.lock().local_path(), b.lock().local_path());
        assert!(b.lock().local_path().ends_with("data.txt~1"));
        assert_eq!(a.lock().read_at(0, 100).unwrap(), b"remote bytes");
        assert_eq!(b.lock().read_at(0, 100).unwrap(), b"other bytes");
    }

    #[test]
    fn test_write_then_read_and_dirty() {
        let f = fixture();
        let handle = f.cache.open(&p("/a/data.txt"), libc::O_RDWR).unwrap();
        {
            let mut h = handle.lock();
            assert_eq!(h.write_at(7, b"BYTES").unwrap(), 5);
            assert_eq!(h.read_at(0, 100).unwrap(), b"remote BYTES");
        }
        assert!(matches!(
            f.cache.release(&handle).unwrap(),
            Release::Closed { dirty: true, .. }
        ));
    }

    #[test]
    fn test_create_is_local_only() {
        let f = fixture();
        let handle = f.cache.create(&p("/a/new.txt")).unwrap();
        assert_eq!(handle.lock().len().unwrap(), 0);
        assert!(f.gw.log().transfers().is_empty());
        assert!(handle.lock().is_dirty());
        assert!(matches!(
            f.cache.release(&handle).unwrap(),
            Release::Closed { dirty: true, .. }
        ));
    }

    #[test]
    fn test_stalled_download_leaves_no_entry() {
        let f = fixture();
        f.gw.set_stall_tasks(true);
        let err = f.cache.open(&p("/a/data.txt"), libc::O_RDONLY).unwrap_err();
        assert!(matches!(err, FsError::OpenFailed { .. }));
        assert_eq!(err.to_errno(), libc::EIO);
        assert!(f.cache.get(&p("/a/data.txt")).is_none());
        assert!(!f.cache.is_resident(&p("/a/data.txt")));
        assert!(!f.scratch.path().join("cache/data.txt").exists());
    }

    #[test]
    fn test_failed_submission_is_open_failure() {
        let f = fixture();
        f.gw.set_fail_submissions(true);
        assert!(matches!(
            f.cache.open(&p("/a/data.txt"), libc::O_RDONLY),
            Err(FsError::OpenFailed { .. })
        ));
        assert!(!f.cache.is_resident(&p("/a/data.txt")));
    }

    #[test]
    fn test_missing_remote_file_is_open_failure() {
        let f = fixture();
        assert!(matches!(
            f.cache.open(&p("/a/missing.txt"), libc::O_RDONLY),
            Err(FsError::OpenFailed { .. })
        ));
    }

    #[test]
    fn test_rename_keeps_residency() {
        let f = fixture();
        let handle = f.cache.open(&p("/a/data.txt"), libc::O_RDONLY).unwrap();
        f.cache.rename(&p("/a"), &p("/c"));
        assert!(f.cache.get(&p("/c/data.txt")).is_some());
        assert_eq!(handle.lock().path(), &p("/c/data.txt"));
        assert!(!f.cache.is_resident(&p("/a/data.txt")));
        assert!(f.cache.is_resident(&p("/c/data.txt")));
    }

    #[test]
    fn test_forget_removes_local_file() {
        let f = fixture();
        let handle = f.cache.open(&p("/a/data.txt"), libc::O_RDONLY).unwrap();
        let local = f.cache.local_path(&p("/a/data.txt")).unwrap();
        f.cache.forget(&p("/a/data.txt"));
        // Still open: file kept until release.
        assert!(local.exists());
        assert!(f.cache.get(&p("/a/data.txt")).is_none());
        assert!(handle.lock().is_unlinked());
        assert_eq!(f.cache.open_handles(), 1);
        assert!(matches!(
            f.cache.release(&handle).unwrap(),
            Release::Closed { dirty: false, .. }
        ));
        assert!(!local.exists());
        assert_eq!(f.cache.open_handles(), 0);
    }

    #[test]
    fn test_forget_closed_file_removes_it_at_once() {
        let f = fixture();
        let handle = f.cache.open(&p("/a/data.txt"), libc::O_RDONLY).unwrap();
        f.cache.release(&handle).unwrap();
        let local = f.cache.local_path(&p("/a/data.txt")).unwrap();
        f.cache.forget(&p("/a"));
        assert!(!local.exists());
        assert!(!f.cache.is_resident(&p("/a/data.txt")));
    }

    #[test]
    fn test_recreate_after_unlink_while_open_is_independent() {
        let f = fixture();
        let path = p("/a/data.txt");
        let old = f.cache.open(&path, libc::O_RDONLY).unwrap();
        let old_local = old.lock().local_path().to_path_buf();
        f.cache.forget(&path);

        let new = f.cache.create(&path).unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
        let new_local = new.lock().local_path().to_path_buf();
        assert_ne!(old_local, new_local);
        new.lock().write_at(0, b"fresh").unwrap();

        // Closing the unlinked handle leaves the new file alone.
        assert!(matches!(
            f.cache.release(&old).unwrap(),
            Release::Closed { dirty: false, .. }
        ));
        assert!(!old_local.exists());
        assert!(new_local.exists());
        assert!(Arc::ptr_eq(&f.cache.get(&path).unwrap(), &new));
        assert_eq!(new.lock().read_at(0, 16).unwrap(), b"fresh");
        assert!(matches!(
            f.cache.release(&new).unwrap(),
            Release::Closed { dirty: true, .. }
        ));
    }

    #[test]
    fn test_open_with_trunc() {
        let f = fixture();
        let handle = f
            .cache
            .open(&p("/a/data.txt"), libc::O_WRONLY | libc::O_TRUNC)
            .unwrap();
        assert_eq!(handle.lock().len().unwrap(), 0);
        assert!(handle.lock().is_dirty());
    }

    #[test]
    fn test_destroy_removes_directory() {
        let f = fixture();
        f.cache.create(&p("/a/new.txt")).unwrap();
        f.cache.destroy().unwrap();
        assert!(!f.cache.cache_dir().exists());
        assert_eq!(f.cache.open_handles(), 0);
    }
}
