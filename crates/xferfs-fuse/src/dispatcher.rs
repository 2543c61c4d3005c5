//! Path-level filesystem operations.
//!
//! [`BridgeFs`] ties the metadata mirror, the content cache and the batch
//! queue together. Every operation updates the local view synchronously;
//! destructive operations queue their remote counterpart and, depending on
//! the [`MutationPolicy`], either return at once or wait for it.
//!
//! The FUSE adapter in [`crate::filesystem`] translates inodes and file
//! handles into the paths used here.

use crate::batch_queue::{BatchQueue, MutationTicket};
use crate::config::{BridgeConfig, MutationPolicy};
use crate::content_cache::{ContentCache, Release, SharedHandle};
use crate::error::{FsError, FsResult};
use crate::metadata::{FileAttributes, MetadataMirror};
use crate::path::MountPath;
use parking_lot::{Mutex, MutexGuard};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;
use tracing::{debug, info, instrument, trace, warn};
use xferfs_gateway::TransferGateway;

const PATH_LOCK_STRIPES: usize = 64;

/// Striped locks serializing open/release-style calls on one path.
struct PathLocks {
    stripes: Vec<Mutex<()>>,
}

impl PathLocks {
    fn new() -> Self {
        Self {
            stripes: (0..PATH_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    fn lock(&self, path: &MountPath) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        path.hash(&mut hasher);
        #[allow(clippy::cast_possible_truncation)]
        let idx = (hasher.finish() % PATH_LOCK_STRIPES as u64) as usize;
        self.stripes[idx].lock()
    }
}

/// One mounted remote endpoint.
pub struct BridgeFs {
    gateway: Arc<dyn TransferGateway>,
    config: BridgeConfig,
    mirror: MetadataMirror,
    cache: ContentCache,
    queue: BatchQueue,
    path_locks: PathLocks,
    destroyed: AtomicBool,
}

impl BridgeFs {
    /// Builds the bridge: loads the root listing, recreates the scratch
    /// directory and starts the batch queue.
    pub fn new(gateway: Arc<dyn TransferGateway>, config: BridgeConfig) -> FsResult<Self> {
        let mirror = MetadataMirror::new(Arc::clone(&gateway), config.remote_endpoint.clone())?;
        let cache = ContentCache::new(Arc::clone(&gateway), &config)?;
        let queue = BatchQueue::start(Arc::clone(&gateway), config.queue.clone())?;
        info!(
            remote = %config.remote_endpoint,
            local = %config.local_endpoint,
            policy = ?config.mutation_policy,
            "Bridge ready"
        );
        Ok(Self {
            gateway,
            config,
            mirror,
            cache,
            queue,
            path_locks: PathLocks::new(),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn mirror(&self) -> &MetadataMirror {
        &self.mirror
    }

    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    pub fn queue(&self) -> &BatchQueue {
        &self.queue
    }

    fn remote(&self) -> &str {
        &self.config.remote_endpoint
    }

    /// Attributes of `path`.
    pub fn getattr(&self, path: &MountPath) -> FsResult<FileAttributes> {
        trace!(path = %path, "getattr");
        self.mirror.stat(path)
    }

    /// Names in directory `path`, including `.` and `..`.
    pub fn readdir(&self, path: &MountPath) -> FsResult<Vec<String>> {
        trace!(path = %path, "readdir");
        self.mirror.listdir(path)
    }

    /// Fails with `AlreadyExists` if `path` is present. Loads its parent.
    fn ensure_absent(&self, path: &MountPath) -> FsResult<()> {
        match self.mirror.stat(path) {
            Ok(_) => Err(FsError::AlreadyExists(path.to_string())),
            Err(FsError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Creates a directory on the remote endpoint, then mirrors it.
    #[instrument(level = "debug", skip(self), fields(path = %path))]
    pub fn mkdir(&self, path: &MountPath, perm: u16) -> FsResult<FileAttributes> {
        self.ensure_absent(path)?;
        self.gateway
            .make_directory(self.remote(), path.as_str())
            .map_err(|e| {
                if e.is_not_found() {
                    FsError::NotFound(path.parent().to_string())
                } else {
                    e.into()
                }
            })?;
        self.mirror.new_directory(path, perm)
    }

    /// Creates an empty file locally and opens it. Nothing reaches the
    /// remote endpoint until the file is released.
    #[instrument(level = "debug", skip(self), fields(path = %path))]
    pub fn create(&self, path: &MountPath, perm: u16) -> FsResult<(FileAttributes, SharedHandle)> {
        let _guard = self.path_locks.lock(path);
        self.ensure_absent(path)?;
        let handle = self.cache.create(path)?;
        match self.mirror.new_file(path, perm) {
            Ok(attrs) => Ok((attrs, handle)),
            Err(e) => {
                let _ = self.cache.release(&handle);
                self.cache.forget(path);
                Err(e)
            }
        }
    }

    /// Opens `path`, downloading its content on first use.
    #[instrument(level = "debug", skip(self), fields(path = %path))]
    pub fn open(&self, path: &MountPath, flags: i32) -> FsResult<SharedHandle> {
        let _guard = self.path_locks.lock(path);
        if self.mirror.stat(path)?.is_dir() {
            return Err(FsError::IsADirectory(path.to_string()));
        }
        let handle = self.cache.open(path, flags)?;
        if flags & libc::O_TRUNC != 0 {
            self.mirror.change_size(path, 0)?;
        }
        Ok(handle)
    }

    /// Reads up to `size` bytes at `offset` from an open file.
    pub fn read(&self, handle: &SharedHandle, offset: u64, size: usize) -> FsResult<Vec<u8>> {
        let mut h = handle.lock();
        let data = h.read_at(offset, size)?;
        trace!(path = %h.path(), offset, requested = size, read = data.len(), "read");
        Ok(data)
    }

    /// Writes `data` at `offset` and grows the mirrored size if needed.
    ///
    /// Writes to a file unlinked while open only touch its local mirror.
    pub fn write(&self, handle: &SharedHandle, offset: u64, data: &[u8]) -> FsResult<usize> {
        let (path, written, unlinked) = {
            let mut h = handle.lock();
            let written = h.write_at(offset, data)?;
            (h.path().clone(), written, h.is_unlinked())
        };
        trace!(path = %path, offset, written, "write");
        if !unlinked {
            let current = self.mirror.stat(&path)?.size;
            self.mirror
                .change_size(&path, current.max(offset + written as u64))?;
        }
        Ok(written)
    }

    pub fn flush(&self, handle: &SharedHandle) -> FsResult<()> {
        handle.lock().flush()?;
        Ok(())
    }

    pub fn fsync(&self, handle: &SharedHandle, data_only: bool) -> FsResult<()> {
        handle.lock().sync(data_only)?;
        Ok(())
    }

    /// Releases one open of a file. When the last open of a modified file
    /// goes away and write-back is on, the file is queued for upload.
    pub fn release(&self, handle: &SharedHandle) -> FsResult<()> {
        let path = handle.lock().path().clone();
        let _guard = self.path_locks.lock(&path);
        self.release_locked(handle)
    }

    fn release_locked(&self, handle: &SharedHandle) -> FsResult<()> {
        let Release::Closed {
            path,
            local_path,
            dirty,
        } = self.cache.release(handle)?
        else {
            return Ok(());
        };
        if !dirty {
            return Ok(());
        }
        if !self.config.write_back {
            debug!(path = %path, "Write-back disabled; keeping changes local");
            return Ok(());
        }
        let Some(source) = local_path.to_str() else {
            warn!(path = %path, "Cache path is not UTF-8; changes stay local");
            return Ok(());
        };
        let ticket = self.queue.add_transfer(
            &self.config.local_endpoint,
            source,
            self.remote(),
            path.as_str(),
        )?;
        debug!(path = %path, %ticket, "Queued write-back");
        Ok(())
    }

    /// Sets the size of `path`, opening it for the duration if needed.
    #[instrument(level = "debug", skip(self), fields(path = %path))]
    pub fn truncate(&self, path: &MountPath, size: u64) -> FsResult<FileAttributes> {
        let _guard = self.path_locks.lock(path);
        if self.mirror.stat(path)?.is_dir() {
            return Err(FsError::IsADirectory(path.to_string()));
        }
        if self.cache.get(path).is_some() {
            self.cache.truncate(path, size)?;
        } else {
            let handle = self.cache.open(path, libc::O_RDWR)?;
            let resized = handle.lock().set_len(size);
            self.release_locked(&handle)?;
            resized?;
        }
        self.mirror.change_size(path, size)?;
        self.mirror.stat(path)
    }

    /// Updates access and modification times.
    pub fn utimens(
        &self,
        path: &MountPath,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> FsResult<FileAttributes> {
        self.mirror.set_times(path, atime, mtime)
    }

    /// Removes a file.
    #[instrument(level = "debug", skip(self), fields(path = %path))]
    pub fn unlink(&self, path: &MountPath) -> FsResult<()> {
        if self.mirror.stat(path)?.is_dir() {
            return Err(FsError::IsADirectory(path.to_string()));
        }
        self.remove_entry(path)
    }

    /// Removes an empty directory.
    #[instrument(level = "debug", skip(self), fields(path = %path))]
    pub fn rmdir(&self, path: &MountPath) -> FsResult<()> {
        if path.is_root() {
            return Err(FsError::NotSupported);
        }
        if !self.mirror.stat(path)?.is_dir() {
            return Err(FsError::NotADirectory(path.to_string()));
        }
        if self.mirror.listdir(path)?.len() > 2 {
            return Err(FsError::NotEmpty(path.to_string()));
        }
        self.remove_entry(path)
    }

    fn remove_entry(&self, path: &MountPath) -> FsResult<()> {
        let ticket = {
            let _guard = self.path_locks.lock(path);
            let ticket = self.queue.add_deletion(self.remote(), path.as_str())?;
            self.mirror.remove(path)?;
            self.cache.forget(path);
            ticket
        };
        self.settle(ticket)
    }

    /// Moves `old` to `new`: a remote copy followed by a remote delete of
    /// the source, with the local view updated immediately.
    #[instrument(level = "debug", skip(self), fields(from = %old, to = %new))]
    pub fn rename(&self, old: &MountPath, new: &MountPath) -> FsResult<()> {
        let source = self.mirror.stat(old)?;
        if old == new {
            return Ok(());
        }
        if old.is_root() || new.is_root() || new.starts_with(old) {
            return Err(FsError::InvalidName(new.to_string()));
        }
        match self.mirror.stat(new) {
            Ok(target) => match (source.is_dir(), target.is_dir()) {
                (true, false) => return Err(FsError::NotADirectory(new.to_string())),
                (false, true) => return Err(FsError::IsADirectory(new.to_string())),
                (true, true) if self.mirror.listdir(new)?.len() > 2 => {
                    return Err(FsError::NotEmpty(new.to_string()));
                }
                _ => {}
            },
            Err(FsError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        // Moving the local view first pulls in any unloaded listings below
        // `old` while they still exist remotely.
        self.mirror.rename(old, new)?;
        self.cache.forget(new);
        self.cache.rename(old, new);
        let remote = self.remote();
        self.queue
            .add_transfer(remote, old.as_str(), remote, new.as_str())?;
        let ticket = self.queue.add_deletion(remote, old.as_str())?;
        self.settle(ticket)
    }

    /// Applies the mutation policy to a freshly queued mutation.
    fn settle(&self, ticket: MutationTicket) -> FsResult<()> {
        match self.config.mutation_policy {
            MutationPolicy::Optimistic => Ok(()),
            MutationPolicy::WaitForRemote { timeout } => self.queue.wait_for(ticket, timeout),
        }
    }

    /// Tears the mount down: flushes and joins the batch queue, then
    /// deletes the scratch directory. Runs once.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(pending = self.queue.pending_len(), "Waiting for pending changes");
        self.queue.close();
        let stats = self.queue.stats();
        info!(
            submitted = stats.tasks_submitted,
            failed = stats.tasks_failed,
            timed_out = stats.tasks_timed_out,
            "Batch queue closed"
        );
        if let Err(e) = self.cache.destroy() {
            warn!(error = %e, "Failed to delete local cache");
        }
    }
}

impl Drop for BridgeFs {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;
    use xferfs_gateway::DirectoryGateway;

    fn p(s: &str) -> MountPath {
        MountPath::new(s)
    }

    fn bridge(policy: MutationPolicy) -> (TempDir, TempDir, Arc<DirectoryGateway>, BridgeFs) {
        let remote = TempDir::new().unwrap();
        fs::create_dir(remote.path().join("a")).unwrap();
        fs::write(remote.path().join("a/one.txt"), b"one").unwrap();
        let scratch = TempDir::new().unwrap();
        let gw = Arc::new(
            DirectoryGateway::new()
                .with_endpoint("remote", remote.path())
                .with_endpoint("local", "/"),
        );
        let config = BridgeConfig::new("remote", "local")
            .cache_dir(scratch.path().join("cache"))
            .download_timeout(Duration::from_millis(200))
            .download_poll_interval(Duration::from_millis(5))
            .queue(
                QueueConfig::default()
                    .poll_interval(Duration::from_millis(5))
                    .quiescence(Duration::from_secs(3600))
                    .task_timeout(Duration::from_millis(200))
                    .task_poll_interval(Duration::from_millis(2)),
            )
            .mutation_policy(policy);
        let fs = BridgeFs::new(gw.clone(), config).unwrap();
        (remote, scratch, gw, fs)
    }

    #[test]
    fn test_path_locks_same_stripe_for_same_path() {
        let locks = PathLocks::new();
        let guard = locks.lock(&p("/x"));
        drop(guard);
        let _again = locks.lock(&p("/x"));
    }

    #[test]
    fn test_open_directory_rejected() {
        let (_r, _s, _gw, fs) = bridge(MutationPolicy::Optimistic);
        assert!(matches!(
            fs.open(&p("/a"), libc::O_RDONLY),
            Err(FsError::IsADirectory(_))
        ));
    }

    #[test]
    fn test_create_existing_rejected() {
        let (_r, _s, _gw, fs) = bridge(MutationPolicy::Optimistic);
        assert!(matches!(
            fs.create(&p("/a/one.txt"), 0o644),
            Err(FsError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_unlink_directory_rejected() {
        let (_r, _s, gw, fs) = bridge(MutationPolicy::Optimistic);
        assert!(matches!(fs.unlink(&p("/a")), Err(FsError::IsADirectory(_))));
        assert!(matches!(
            fs.rmdir(&p("/a/one.txt")),
            Err(FsError::NotADirectory(_))
        ));
        assert_eq!(fs.queue().pending_len(), 0);
        assert!(gw.log().deletes().is_empty());
    }

    #[test]
    fn test_rename_queues_transfer_then_delete() {
        let (_r, _s, _gw, fs) = bridge(MutationPolicy::Optimistic);
        fs.rename(&p("/a/one.txt"), &p("/a/two.txt")).unwrap();
        assert_eq!(fs.queue().pending_len(), 2);
        assert_eq!(fs.getattr(&p("/a/two.txt")).unwrap().size, 3);
        assert!(matches!(
            fs.getattr(&p("/a/one.txt")),
            Err(FsError::NotFound(_))
        ));
    }

    #[test]
    fn test_wait_for_remote_reports_failure() {
        let (_r, _s, gw, fs) = bridge(MutationPolicy::WaitForRemote {
            timeout: Duration::from_secs(5),
        });
        gw.set_fail_submissions(true);
        let err = fs.unlink(&p("/a/one.txt")).unwrap_err();
        assert_eq!(err.to_errno(), libc::EIO);
        // The local view was still updated.
        assert!(matches!(
            fs.getattr(&p("/a/one.txt")),
            Err(FsError::NotFound(_))
        ));
    }

    #[test]
    fn test_wait_for_remote_success() {
        let (remote, _s, _gw, fs) = bridge(MutationPolicy::WaitForRemote {
            timeout: Duration::from_secs(5),
        });
        fs.rename(&p("/a/one.txt"), &p("/a/moved.txt")).unwrap();
        assert!(remote.path().join("a/moved.txt").exists());
        assert!(!remote.path().join("a/one.txt").exists());
    }

    #[test]
    fn test_truncate_unopened_file() {
        let (_r, _s, _gw, fs) = bridge(MutationPolicy::Optimistic);
        let attrs = fs.truncate(&p("/a/one.txt"), 1).unwrap();
        assert_eq!(attrs.size, 1);
        assert_eq!(fs.cache().open_handles(), 0);
        // Closing a modified file queues a write-back.
        assert_eq!(fs.queue().pending_len(), 1);
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let (_r, scratch, _gw, fs) = bridge(MutationPolicy::Optimistic);
        fs.destroy();
        fs.destroy();
        assert!(!scratch.path().join("cache").exists());
    }
}
