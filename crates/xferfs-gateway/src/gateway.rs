//! The blocking transfer gateway interface.

use crate::error::GatewayResult;
use crate::types::{ActivationStatus, ListingEntry, SubmissionId, TaskId, TaskStatus, TransferItem};

/// Blocking, fallible RPC surface of a remote transfer service.
///
/// Every mutating submission (`submit_transfer`, `submit_delete`) needs a
/// fresh [`SubmissionId`] from [`submission_id`](Self::submission_id).
/// Submissions return immediately with a [`TaskId`]; completion is observed
/// by polling [`poll_task`](Self::poll_task) until the status is terminal.
pub trait TransferGateway: Send + Sync {
    /// Issues a new one-time submission ID.
    fn submission_id(&self) -> GatewayResult<SubmissionId>;

    /// Activates an endpoint so it can be used for transfers.
    ///
    /// A non-200 [`ActivationStatus`] is returned as `Ok`; callers decide
    /// whether that is fatal.
    fn activate_endpoint(&self, endpoint: &str) -> GatewayResult<ActivationStatus>;

    /// Lists the entries of a directory on an endpoint.
    fn list_directory(&self, endpoint: &str, path: &str) -> GatewayResult<Vec<ListingEntry>>;

    /// Submits a transfer task copying `items` from `source` to `destination`.
    fn submit_transfer(
        &self,
        submission_id: &SubmissionId,
        source: &str,
        destination: &str,
        items: &[TransferItem],
    ) -> GatewayResult<TaskId>;

    /// Submits a delete task removing `paths` from `endpoint`.
    fn submit_delete(
        &self,
        submission_id: &SubmissionId,
        endpoint: &str,
        paths: &[String],
        recursive: bool,
    ) -> GatewayResult<TaskId>;

    /// Polls the status of a previously submitted task.
    fn poll_task(&self, task_id: &TaskId) -> GatewayResult<TaskStatus>;

    /// Creates a directory on an endpoint.
    fn make_directory(&self, endpoint: &str, path: &str) -> GatewayResult<()>;
}
