//! FUSE filesystem adapter.
//!
//! Translates kernel requests (inode numbers, file handles, raw names) into
//! calls on [`BridgeFs`], which works purely in mount paths.
//!
//! # Request mapping
//!
//! | FUSE callback | Bridge operation | Notes |
//! |---------------|------------------|-------|
//! | `lookup`, `getattr` | [`BridgeFs::getattr`] | |
//! | `readdir` | [`BridgeFs::readdir`] | children stat'd for their type |
//! | `mkdir` | [`BridgeFs::mkdir`] | synchronous remote call |
//! | `create`, `open` | [`BridgeFs::create`], [`BridgeFs::open`] | open may download |
//! | `read`, `write`, `flush`, `fsync` | cache handle I/O by `fh` | never remote |
//! | `release` | [`BridgeFs::release`] | may queue a write-back |
//! | `unlink`, `rmdir`, `rename` | queued mutations | |
//! | `setattr` | [`BridgeFs::truncate`], [`BridgeFs::utimens`] | mode/owner ignored |

use crate::content_cache::SharedHandle;
use crate::dispatcher::BridgeFs;
use crate::error::FsError;
use crate::handles::HandleTable;
use crate::inode::{InodeTable, ROOT_INODE};
use crate::metadata::{FileAttributes, FileKind};
use crate::path::MountPath;
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use libc::c_int;
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, trace, warn};

/// Block size reported in attributes and statfs.
const BLOCK_SIZE: u32 = 4096;

/// Maximum name length reported by statfs.
const MAX_NAME_LEN: u32 = 255;

/// State attached to a kernel file handle.
struct OpenFile {
    handle: SharedHandle,
}

/// The mounted filesystem as seen by the kernel.
pub struct XferFs {
    bridge: Arc<BridgeFs>,
    inodes: InodeTable,
    files: HandleTable<u64, OpenFile>,
    attr_ttl: Duration,
    uid: u32,
    gid: u32,
}

impl XferFs {
    /// Wraps a bridge for mounting. Files appear owned by the mounting user.
    pub fn new(bridge: Arc<BridgeFs>) -> Self {
        // SAFETY: getuid/getgid are always successful and have no preconditions.
        let uid = unsafe { libc::getuid() };
        let gid = unsafe { libc::getgid() };
        let attr_ttl = bridge.config().attr_ttl;
        Self {
            bridge,
            inodes: InodeTable::new(),
            files: HandleTable::new_auto_id(),
            attr_ttl,
            uid,
            gid,
        }
    }

    pub fn bridge(&self) -> &Arc<BridgeFs> {
        &self.bridge
    }

    fn path_of(&self, ino: u64) -> Result<MountPath, c_int> {
        self.inodes.path(ino).ok_or(libc::ENOENT)
    }

    /// Resolves `name` inside directory `parent`.
    /// Cache handle behind a kernel file handle.
    fn open_file(&self, fh: u64) -> Option<SharedHandle> {
        self.files.get(&fh).map(|open| Arc::clone(&open.handle))
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Result<MountPath, c_int> {
        let Some(name) = name.to_str() else {
            return Err(libc::EINVAL);
        };
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(libc::EINVAL);
        }
        Ok(self.path_of(parent)?.join(name))
    }

    fn make_attr(&self, ino: u64, attrs: &FileAttributes) -> FileAttr {
        let kind = match attrs.kind {
            FileKind::Directory => FileType::Directory,
            FileKind::RegularFile => FileType::RegularFile,
        };
        FileAttr {
            ino,
            size: attrs.size,
            blocks: attrs.size.div_ceil(u64::from(BLOCK_SIZE)),
            atime: attrs.atime,
            mtime: attrs.mtime,
            ctime: attrs.ctime,
            crtime: attrs.ctime,
            kind,
            perm: attrs.perm,
            nlink: attrs.nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }
}

/// Logs a failed request and returns its errno.
fn errno(op: &str, path: &MountPath, e: &FsError) -> c_int {
    let code = e.to_errno();
    match e {
        FsError::NotFound(_)
        | FsError::AlreadyExists(_)
        | FsError::NotEmpty(_)
        | FsError::NotADirectory(_)
        | FsError::IsADirectory(_) => debug!(op, path = %path, error = %e, "Request rejected"),
        _ => warn!(op, path = %path, error = %e, errno = code, "Request failed"),
    }
    code
}

fn resolve_time(time: TimeOrNow) -> SystemTime {
    match time {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

/// Permission bits from a create/mkdir mode and umask.
#[allow(clippy::cast_possible_truncation)]
fn perm_bits(mode: u32, umask: u32) -> u16 {
    (mode & !umask & 0o7777) as u16
}

impl Filesystem for XferFs {
    fn init(&mut self, _req: &Request<'_>, config: &mut KernelConfig) -> Result<(), c_int> {
        config.add_capabilities(fuser::consts::FUSE_ASYNC_READ).ok();
        info!(
            remote = %self.bridge.config().remote_endpoint,
            "FUSE filesystem initialized"
        );
        Ok(())
    }

    fn destroy(&mut self) {
        info!("FUSE filesystem shutting down");
        self.files.clear();
        self.bridge.destroy();
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(code) => return reply.error(code),
        };
        trace!(parent, path = %path, "lookup");
        match self.bridge.getattr(&path) {
            Ok(attrs) => {
                let ino = self.inodes.get_or_insert(&path);
                reply.entry(&self.attr_ttl, &self.make_attr(ino, &attrs), 0);
            }
            Err(e) => reply.error(errno("lookup", &path, &e)),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    fn batch_forget(&mut self, _req: &Request<'_>, nodes: &[fuser::fuse_forget_one]) {
        for node in nodes {
            self.inodes.forget(node.nodeid, node.nlookup);
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(code) => return reply.error(code),
        };
        match self.bridge.getattr(&path) {
            Ok(attrs) => reply.attr(&self.attr_ttl, &self.make_attr(ino, &attrs)),
            Err(e) => reply.error(errno("getattr", &path, &e)),
        }
    }

    /// Handles truncation and timestamp updates. Mode and ownership changes
    /// are accepted but not stored: the remote service has no such notion.
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(code) => return reply.error(code),
        };
        let result = (|| {
            if let Some(size) = size {
                self.bridge.truncate(&path, size)?;
            }
            if atime.is_some() || mtime.is_some() {
                self.bridge
                    .utimens(&path, atime.map(resolve_time), mtime.map(resolve_time))?;
            }
            self.bridge.getattr(&path)
        })();
        match result {
            Ok(attrs) => reply.attr(&self.attr_ttl, &self.make_attr(ino, &attrs)),
            Err(e) => reply.error(errno("setattr", &path, &e)),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(code) => return reply.error(code),
        };
        match self.bridge.getattr(&path) {
            Ok(attrs) if attrs.is_dir() => reply.opened(0, 0),
            Ok(_) => reply.error(libc::ENOTDIR),
            Err(e) => reply.error(errno("opendir", &path, &e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(code) => return reply.error(code),
        };
        let names = match self.bridge.readdir(&path) {
            Ok(names) => names,
            Err(e) => return reply.error(errno("readdir", &path, &e)),
        };
        let skip = usize::try_from(offset).unwrap_or(0);
        for (i, name) in names.iter().enumerate().skip(skip) {
            let (entry_ino, kind) = match name.as_str() {
                "." => (ino, FileType::Directory),
                ".." => {
                    let parent = self
                        .inodes
                        .get_inode(&path.parent())
                        .unwrap_or(ROOT_INODE);
                    (parent, FileType::Directory)
                }
                child => {
                    let child_path = path.join(child);
                    let kind = match self.bridge.getattr(&child_path) {
                        Ok(attrs) if attrs.is_dir() => FileType::Directory,
                        Ok(_) => FileType::RegularFile,
                        // Removed between listing and stat.
                        Err(_) => continue,
                    };
                    (self.inodes.get_or_insert_no_lookup_inc(&child_path), kind)
                }
            };
            #[allow(clippy::cast_possible_wrap)]
            let next_offset = (i + 1) as i64;
            if reply.add(entry_ino, next_offset, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(code) => return reply.error(code),
        };
        match self.bridge.mkdir(&path, perm_bits(mode, umask)) {
            Ok(attrs) => {
                let ino = self.inodes.get_or_insert(&path);
                reply.entry(&self.attr_ttl, &self.make_attr(ino, &attrs), 0);
            }
            Err(e) => reply.error(errno("mkdir", &path, &e)),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        _flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(code) => return reply.error(code),
        };
        match self.bridge.create(&path, perm_bits(mode, umask)) {
            Ok((attrs, handle)) => {
                let ino = self.inodes.get_or_insert(&path);
                let fh = self.files.insert_auto(OpenFile { handle });
                reply.created(&self.attr_ttl, &self.make_attr(ino, &attrs), 0, fh, 0);
            }
            Err(e) => reply.error(errno("create", &path, &e)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(code) => return reply.error(code),
        };
        match self.bridge.open(&path, flags) {
            Ok(handle) => {
                let fh = self.files.insert_auto(OpenFile { handle });
                reply.opened(fh, 0);
            }
            Err(e) => reply.error(errno("open", &path, &e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Ok(offset) = u64::try_from(offset) else {
            return reply.error(libc::EINVAL);
        };
        let Some(handle) = self.open_file(fh) else {
            return reply.error(libc::EBADF);
        };
        match self.bridge.read(&handle, offset, size as usize) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno("read", handle.lock().path(), &e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Ok(offset) = u64::try_from(offset) else {
            return reply.error(libc::EINVAL);
        };
        let Some(handle) = self.open_file(fh) else {
            return reply.error(libc::EBADF);
        };
        match self.bridge.write(&handle, offset, data) {
            #[allow(clippy::cast_possible_truncation)]
            Ok(written) => reply.written(written as u32),
            Err(e) => reply.error(errno("write", handle.lock().path(), &e)),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let Some(handle) = self.open_file(fh) else {
            return reply.error(libc::EBADF);
        };
        match self.bridge.flush(&handle) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("flush", handle.lock().path(), &e)),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        let Some(handle) = self.open_file(fh) else {
            return reply.error(libc::EBADF);
        };
        match self.bridge.fsync(&handle, datasync) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("fsync", handle.lock().path(), &e)),
        }
    }

    /// Drops one open of the file. The last release of a modified file
    /// queues its upload.
    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let Some(open) = self.files.remove(&fh) else {
            return reply.error(libc::EBADF);
        };
        match self.bridge.release(&open.handle) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("release", open.handle.lock().path(), &e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(code) => return reply.error(code),
        };
        match self.bridge.unlink(&path) {
            Ok(()) => {
                self.inodes.invalidate_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(errno("unlink", &path, &e)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(code) => return reply.error(code),
        };
        match self.bridge.rmdir(&path) {
            Ok(()) => {
                self.inodes.invalidate_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(errno("rmdir", &path, &e)),
        }
    }

    /// Plain renames only; `RENAME_NOREPLACE` and `RENAME_EXCHANGE` are
    /// rejected with `EINVAL`.
    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        if flags != 0 {
            return reply.error(libc::EINVAL);
        }
        let (old, new) = match (
            self.child_path(parent, name),
            self.child_path(newparent, newname),
        ) {
            (Ok(old), Ok(new)) => (old, new),
            (Err(code), _) | (_, Err(code)) => return reply.error(code),
        };
        match self.bridge.rename(&old, &new) {
            Ok(()) => {
                self.inodes.rename_prefix(&old, &new);
                reply.ok();
            }
            Err(e) => reply.error(errno("rename", &old, &e)),
        }
    }

    /// The remote side reports no capacity, so fixed values are returned.
    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        reply.statfs(0, 0, 0, 0, 0, BLOCK_SIZE, MAX_NAME_LEN, BLOCK_SIZE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perm_bits_applies_umask() {
        assert_eq!(perm_bits(0o100_666, 0o022), 0o644);
        assert_eq!(perm_bits(0o40_777, 0o027), 0o750);
    }

    #[test]
    fn test_resolve_specific_time() {
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(42);
        assert_eq!(resolve_time(TimeOrNow::SpecificTime(t)), t);
    }
}
