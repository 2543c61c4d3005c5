//! Bounded polling of remote tasks.

use std::thread;
use std::time::{Duration, Instant};
use tracing::trace;
use xferfs_gateway::{GatewayResult, TaskId, TransferGateway};

/// How waiting on a remote task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded,
    /// Terminal, but the remote side reports failure.
    Failed,
    /// No terminal status within the timeout. The task may still complete.
    TimedOut,
}

/// Polls `task` until it reaches a terminal status or `timeout` elapses.
///
/// The first poll happens immediately; later polls are spaced by
/// `poll_interval`. Poll errors are returned as-is.
pub fn wait_for_task(
    gateway: &dyn TransferGateway,
    task: &TaskId,
    timeout: Duration,
    poll_interval: Duration,
) -> GatewayResult<TaskOutcome> {
    let deadline = Instant::now() + timeout;
    loop {
        let status = gateway.poll_task(task)?;
        if status.is_terminal() {
            trace!(task = %task, state = ?status.state, "Task reached terminal status");
            return Ok(if status.is_success() {
                TaskOutcome::Succeeded
            } else {
                TaskOutcome::Failed
            });
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(TaskOutcome::TimedOut);
        }
        thread::sleep(poll_interval.min(deadline - now));
    }
}
