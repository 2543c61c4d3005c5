//! Error handling and mapping for the filesystem bridge.
//!
//! Every bridge operation returns [`FsResult`]; the FUSE adapter turns
//! errors into POSIX error codes with [`ToErrno`].

use std::io;
use std::time::Duration;
use thiserror::Error;
use xferfs_gateway::GatewayError;

/// Errors that can occur during filesystem operations.
#[derive(Debug, Error)]
pub enum FsError {
    /// Stat or lookup miss.
    #[error("No such file or directory: {0}")]
    NotFound(String),

    /// rmdir on a directory that still has children.
    #[error("Directory not empty: {0}")]
    NotEmpty(String),

    /// Entry already exists.
    #[error("File already exists: {0}")]
    AlreadyExists(String),

    /// Path component is not a directory.
    #[error("Not a directory: {0}")]
    NotADirectory(String),

    /// File operation on a directory.
    #[error("Is a directory: {0}")]
    IsADirectory(String),

    /// Parent directory is not present in the metadata mirror.
    #[error("Parent directory not loaded: {0}")]
    ParentNotLoaded(String),

    /// Download of the remote content failed.
    #[error("Open failed for {path}: {reason}")]
    OpenFailed { path: String, reason: String },

    /// A remote task did not reach a terminal status in time.
    #[error("Transfer of {what} did not complete within {timeout:?}")]
    TransferTimeout { what: String, timeout: Duration },

    /// A queued remote mutation failed (only reported when waiting for it).
    #[error("Remote mutation failed for {0}")]
    MutationFailed(String),

    /// The mutation queue was closed; no further mutations are accepted.
    #[error("Mutation queue is closed")]
    QueueClosed,

    /// No open handle for the path.
    #[error("File is not open: {0}")]
    NotOpen(String),

    /// Name is not valid UTF-8 or contains a separator.
    #[error("Invalid file name: {0}")]
    InvalidName(String),

    /// Remote call failed (boxed to reduce enum size).
    #[error("Remote call failed: {0}")]
    Gateway(Box<GatewayError>),

    /// Local IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Operation not supported.
    #[error("Operation not supported")]
    NotSupported,
}

impl FsError {
    /// Converts this error to a libc error code for FUSE.
    pub fn to_errno(&self) -> i32 {
        match self {
            FsError::NotFound(_) | FsError::ParentNotLoaded(_) => libc::ENOENT,
            FsError::NotEmpty(_) => libc::ENOTEMPTY,
            FsError::AlreadyExists(_) => libc::EEXIST,
            FsError::NotADirectory(_) => libc::ENOTDIR,
            FsError::IsADirectory(_) => libc::EISDIR,
            FsError::OpenFailed { .. }
            | FsError::TransferTimeout { .. }
            | FsError::MutationFailed(_)
            | FsError::QueueClosed => libc::EIO,
            FsError::NotOpen(_) => libc::EBADF,
            FsError::InvalidName(_) => libc::EINVAL,
            FsError::Gateway(e) => gateway_error_to_errno(e),
            FsError::Io(e) => io_error_to_errno(e),
            FsError::NotSupported => libc::ENOTSUP,
        }
    }
}

/// Converts an IO error to a libc error code, falling back to EIO.
pub fn io_error_to_errno(e: &io::Error) -> i32 {
    e.raw_os_error().unwrap_or(match e.kind() {
        io::ErrorKind::NotFound => libc::ENOENT,
        io::ErrorKind::PermissionDenied => libc::EACCES,
        io::ErrorKind::AlreadyExists => libc::EEXIST,
        io::ErrorKind::InvalidInput => libc::EINVAL,
        io::ErrorKind::TimedOut => libc::ETIMEDOUT,
        _ => libc::EIO,
    })
}

/// Converts a gateway error to a libc error code.
///
/// Missing remote paths become ENOENT; every other remote failure is EIO.
pub fn gateway_error_to_errno(e: &GatewayError) -> i32 {
    if e.is_not_found() {
        libc::ENOENT
    } else {
        libc::EIO
    }
}

/// Result type for filesystem operations.
pub type FsResult<T> = Result<T, FsError>;

/// Extension trait to convert errors to errno.
pub trait ToErrno {
    /// Converts this error to a libc error code.
    fn to_errno(&self) -> i32;
}

impl ToErrno for FsError {
    fn to_errno(&self) -> i32 {
        FsError::to_errno(self)
    }
}

impl ToErrno for GatewayError {
    fn to_errno(&self) -> i32 {
        gateway_error_to_errno(self)
    }
}

impl ToErrno for io::Error {
    fn to_errno(&self) -> i32 {
        io_error_to_errno(self)
    }
}

// Manual From implementation to box the gateway error
impl From<GatewayError> for FsError {
    fn from(e: GatewayError) -> Self {
        FsError::Gateway(Box::new(e))
    }
}
