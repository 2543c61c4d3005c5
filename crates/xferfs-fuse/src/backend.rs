//! Mounting the filesystem in a background FUSE session.

use crate::filesystem::XferFs;
use fuser::{BackgroundSession, MountOption};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;
use thiserror::Error;

/// Timeout for graceful `session.join()` before forcing unmount.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time allowed for the mount syscall.
pub const DEFAULT_MOUNT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum MountError {
    #[error("Mountpoint does not exist or is not a directory: {0}")]
    MountpointNotDirectory(PathBuf),

    #[error("FUSE is not available: {0}")]
    FuseUnavailable(&'static str),

    #[error("Mount failed: {0}")]
    Mount(#[source] io::Error),
}

/// Options for [`mount_background`].
#[derive(Debug, Clone)]
pub struct MountConfig {
    /// Remote endpoint name, shown as the filesystem source.
    pub fs_name: String,
    /// Unmount automatically when the process exits.
    pub auto_unmount: bool,
    pub mount_timeout: Duration,
}

impl MountConfig {
    pub fn new(remote_endpoint: &str) -> Self {
        Self {
            fs_name: format!("xferfs:{remote_endpoint}"),
            auto_unmount: false,
            mount_timeout: DEFAULT_MOUNT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn auto_unmount(mut self, enabled: bool) -> Self {
        self.auto_unmount = enabled;
        self
    }

    fn options(&self) -> Vec<MountOption> {
        let mut options = vec![
            MountOption::FSName(self.fs_name.clone()),
            MountOption::Subtype("xferfs".to_string()),
        ];
        if self.auto_unmount {
            options.push(MountOption::AutoUnmount);
        }
        options
    }
}

/// Handle to a mounted filesystem. Dropping it unmounts.
pub struct MountHandle {
    session: Option<BackgroundSession>,
    mountpoint: PathBuf,
}

impl MountHandle {
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Unmounts and waits for the session to finish, which includes the
    /// filesystem's own teardown (draining queued remote mutations).
    pub fn unmount(mut self) {
        tracing::info!(mountpoint = %self.mountpoint.display(), "Unmounting");
        if let Some(session) = self.session.take() {
            session.join();
        }
        tracing::info!(mountpoint = %self.mountpoint.display(), "Unmounted");
    }

    fn force_unmount(&self) {
        #[cfg(target_os = "macos")]
        {
            let _ = std::process::Command::new("umount")
                .arg("-f")
                .arg(&self.mountpoint)
                .output();
        }

        #[cfg(target_os = "linux")]
        {
            let _ = std::process::Command::new("fusermount")
                .args(["-uz"])
                .arg(&self.mountpoint)
                .output();
        }
    }
}

impl Drop for MountHandle {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        tracing::debug!(mountpoint = %self.mountpoint.display(), "Unmounting on drop");
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            session.join();
            let _ = tx.send(());
        });
        if rx.recv_timeout(JOIN_TIMEOUT).is_err() {
            tracing::warn!(
                mountpoint = %self.mountpoint.display(),
                "session.join() timed out after {:?}, forcing unmount",
                JOIN_TIMEOUT
            );
            self.force_unmount();
        }
    }
}

/// Whether the FUSE kernel interface is present.
pub fn fuse_available() -> Result<(), MountError> {
    #[cfg(target_os = "macos")]
    {
        if Path::new("/Library/Filesystems/macfuse.fs").exists() {
            Ok(())
        } else {
            Err(MountError::FuseUnavailable("macFUSE is not installed"))
        }
    }
    #[cfg(target_os = "linux")]
    {
        if Path::new("/dev/fuse").exists() {
            Ok(())
        } else {
            Err(MountError::FuseUnavailable(
                "/dev/fuse is missing; ensure the fuse kernel module is loaded",
            ))
        }
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        Err(MountError::FuseUnavailable("unsupported platform"))
    }
}

/// Mounts `fs` at `mountpoint` in a background session.
///
/// The mount syscall runs on its own thread so a stale mount at the target
/// cannot block the caller past `config.mount_timeout`.
pub fn mount_background(
    fs: XferFs,
    mountpoint: &Path,
    config: &MountConfig,
) -> Result<MountHandle, MountError> {
    if !mountpoint.is_dir() {
        return Err(MountError::MountpointNotDirectory(mountpoint.to_path_buf()));
    }
    fuse_available()?;

    let target = mountpoint.to_path_buf();
    let options = config.options();
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let result = fuser::spawn_mount2(fs, &target, &options);
        let _ = tx.send(result);
    });

    let session = match rx.recv_timeout(config.mount_timeout) {
        Ok(Ok(session)) => session,
        Ok(Err(e)) => return Err(MountError::Mount(e)),
        Err(mpsc::RecvTimeoutError::Timeout) => {
            return Err(MountError::Mount(io::Error::new(
                io::ErrorKind::TimedOut,
                "Mount operation timed out - the mountpoint may be on a stale FUSE mount",
            )));
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            return Err(MountError::Mount(io::Error::other(
                "Mount thread terminated unexpectedly",
            )));
        }
    };
    tracing::info!(mountpoint = %mountpoint.display(), fs_name = %config.fs_name, "Mounted");
    Ok(MountHandle {
        session: Some(session),
        mountpoint: mountpoint.to_path_buf(),
    })
}
