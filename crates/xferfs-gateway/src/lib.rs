//! Remote transfer gateways for xferfs.
//!
//! The filesystem bridge talks to remote storage exclusively through the
//! [`TransferGateway`] trait: a blocking RPC surface that issues submission
//! IDs, lists directories, submits copy/delete tasks, polls their status and
//! creates directories.
//!
//! Two implementations are provided:
//!
//! - [`GlobusGateway`] - the Globus Transfer REST API over HTTPS
//! - [`DirectoryGateway`] - endpoints backed by local directories, used for
//!   local mounts and as the remote side in tests

pub mod directory;
pub mod error;
pub mod gateway;
pub mod globus;
pub mod types;

pub use directory::{CallLog, DirectoryGateway, GatewayEvent};
pub use error::{GatewayError, GatewayResult};
pub use gateway::TransferGateway;
pub use globus::GlobusGateway;
pub use types::{
    ActivationStatus, EntryKind, ListingEntry, SubmissionId, TaskId, TaskState, TaskStatus,
    TransferItem,
};
