//! FUSE filesystem bridge over a remote transfer service.
//!
//! Mounts a remote endpoint reachable through a [`TransferGateway`] as a
//! local directory tree:
//!
//! - Metadata is mirrored in memory, one directory listing at a time, and
//!   never refreshed for the life of the mount
//! - File contents are downloaded into a local scratch directory on first
//!   open and served from there
//! - Deletes and renames are queued, coalesced into batched remote tasks and
//!   submitted strictly in order by a single background worker
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use xferfs_fuse::{BridgeConfig, BridgeFs, MountConfig, XferFs, mount_background};
//!
//! let bridge = Arc::new(BridgeFs::new(gateway, BridgeConfig::new("remote#ep", "local#ep"))?);
//! let handle = mount_background(XferFs::new(bridge), mountpoint, &MountConfig::new("remote#ep"))?;
//! ```
//!
//! [`TransferGateway`]: xferfs_gateway::TransferGateway

pub mod backend;
pub mod batch_queue;
pub mod config;
pub mod content_cache;
pub mod dispatcher;
pub mod error;
pub mod filesystem;
pub mod handles;
pub mod inode;
pub mod metadata;
pub mod path;
pub mod task;

pub use backend::{MountConfig, MountError, MountHandle, mount_background};
pub use batch_queue::{
    BatchQueue, MutationDescriptor, MutationKind, MutationTicket, QueueStatsSnapshot,
};
pub use config::{BridgeConfig, FileConfig, GatewayKind, MutationPolicy, QueueConfig};
pub use content_cache::{CacheHandle, ContentCache, SharedHandle};
pub use dispatcher::BridgeFs;
pub use error::{FsError, FsResult, ToErrno};
pub use filesystem::XferFs;
pub use inode::{InodeTable, ROOT_INODE};
pub use metadata::{FileAttributes, FileKind, MetadataMirror};
pub use path::MountPath;
