//! Batched, strictly ordered remote mutations.
//!
//! Deletes and transfers are queued instead of being submitted one by one.
//! Consecutive intents with the same [`MutationDescriptor`] are merged into
//! the tail batch, so removing a directory tree file by file becomes a single
//! remote task. A dedicated worker thread flushes the queue once no mutation
//! has arrived for the quiescence window (or when asked to), submitting the
//! batches in queue order and waiting for each one to reach terminal status
//! before submitting the next.
//!
//! Failures are logged by the worker; callers that need to know the outcome
//! keep the [`MutationTicket`] returned at enqueue time and call
//! [`BatchQueue::wait_for`].

use crate::config::QueueConfig;
use crate::error::{FsError, FsResult};
use crate::task::{TaskOutcome, wait_for_task};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};
use xferfs_gateway::{TaskId, TransferGateway, TransferItem};

/// Failed ticket ranges remembered for [`BatchQueue::wait_for`].
const MAX_FAILED_RANGES: usize = 1024;

/// Kind of a queued remote mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    Delete,
    Transfer,
}

/// Coalescing key: intents with equal descriptors share one remote task.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MutationDescriptor {
    pub kind: MutationKind,
    pub source_endpoint: String,
    /// Only set for transfers.
    pub destination_endpoint: Option<String>,
}

impl MutationDescriptor {
    pub fn delete(endpoint: impl Into<String>) -> Self {
        Self {
            kind: MutationKind::Delete,
            source_endpoint: endpoint.into(),
            destination_endpoint: None,
        }
    }

    pub fn transfer(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            kind: MutationKind::Transfer,
            source_endpoint: source.into(),
            destination_endpoint: Some(destination.into()),
        }
    }
}

impl fmt::Display for MutationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.destination_endpoint {
            Some(dst) => write!(f, "transfer {} -> {dst}", self.source_endpoint),
            None => write!(f, "delete on {}", self.source_endpoint),
        }
    }
}

/// Receipt for one enqueued mutation. Tickets increase monotonically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MutationTicket(u64);

impl fmt::Display for MutationTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
enum Items {
    Delete(Vec<String>),
    Transfer(Vec<TransferItem>),
}

impl Items {
    fn len(&self) -> usize {
        match self {
            Items::Delete(paths) => paths.len(),
            Items::Transfer(items) => items.len(),
        }
    }
}

/// One pending batch. Its tickets form a contiguous range because only the
/// tail batch ever grows.
#[derive(Debug)]
struct QueuedTask {
    descriptor: MutationDescriptor,
    items: Items,
    first_ticket: u64,
    last_ticket: u64,
}

/// Counters describing queue activity.
#[derive(Debug, Default)]
pub struct QueueStats {
    tasks_submitted: AtomicU64,
    tasks_succeeded: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_timed_out: AtomicU64,
    items_submitted: AtomicU64,
}

/// Point-in-time copy of [`QueueStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStatsSnapshot {
    pub tasks_submitted: u64,
    pub tasks_succeeded: u64,
    /// Submission errors and tasks that finished unsuccessfully.
    pub tasks_failed: u64,
    pub tasks_timed_out: u64,
    pub items_submitted: u64,
}

impl QueueStats {
    fn record_submit(&self, items: usize) {
        self.tasks_submitted.fetch_add(1, Ordering::Relaxed);
        self.items_submitted.fetch_add(items as u64, Ordering::Relaxed);
    }

    fn record_outcome(&self, outcome: Option<TaskOutcome>) {
        let counter = match outcome {
            Some(TaskOutcome::Succeeded) => &self.tasks_succeeded,
            Some(TaskOutcome::TimedOut) => &self.tasks_timed_out,
            Some(TaskOutcome::Failed) | None => &self.tasks_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            tasks_submitted: self.tasks_submitted.load(Ordering::Relaxed),
            tasks_succeeded: self.tasks_succeeded.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            tasks_timed_out: self.tasks_timed_out.load(Ordering::Relaxed),
            items_submitted: self.items_submitted.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
struct QueueState {
    pending: Vec<QueuedTask>,
    last_mutation: Instant,
    closing: bool,
    flush_requested: bool,
    /// Last ticket handed out (0 = none yet).
    last_ticket: u64,
    /// Every ticket up to and including this one has settled.
    settled_through: u64,
    /// Ticket ranges whose batch did not succeed.
    failed: Vec<RangeInclusive<u64>>,
}

impl QueueState {
    fn is_failed(&self, ticket: u64) -> bool {
        self.failed.iter().any(|r| r.contains(&ticket))
    }

    /// Records a failed batch, extending the last range when they touch.
    /// Only the newest [`MAX_FAILED_RANGES`] ranges are kept.
    fn record_failure(&mut self, first: u64, last: u64) {
        if let Some(tail) = self.failed.last_mut()
            && *tail.end() + 1 == first
        {
            *tail = *tail.start()..=last;
            return;
        }
        if self.failed.len() == MAX_FAILED_RANGES {
            self.failed.remove(0);
        }
        self.failed.push(first..=last);
    }
}

struct Shared {
    gateway: Arc<dyn TransferGateway>,
    config: QueueConfig,
    state: Mutex<QueueState>,
    /// Wakes the worker early (close, flush request).
    wake: Condvar,
    /// Signalled whenever a batch settles.
    settled: Condvar,
    stats: QueueStats,
}

/// Queue of remote deletes and transfers with a single flush worker.
pub struct BatchQueue {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BatchQueue {
    /// Starts the queue and its flush worker.
    pub fn start(gateway: Arc<dyn TransferGateway>, config: QueueConfig) -> FsResult<Self> {
        let shared = Arc::new(Shared {
            gateway,
            config,
            state: Mutex::new(QueueState {
                pending: Vec::new(),
                last_mutation: Instant::now(),
                closing: false,
                flush_requested: false,
                last_ticket: 0,
                settled_through: 0,
                failed: Vec::new(),
            }),
            wake: Condvar::new(),
            settled: Condvar::new(),
            stats: QueueStats::default(),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("xferfs-batch".to_string())
            .spawn(move || worker_shared.run())?;
        debug!("Batch queue worker started");
        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queues a recursive delete of `path` on `endpoint`.
    pub fn add_deletion(&self, endpoint: &str, path: &str) -> FsResult<MutationTicket> {
        self.enqueue(MutationDescriptor::delete(endpoint), |items| {
            if let Items::Delete(paths) = items {
                paths.push(path.to_string());
            }
        })
    }

    /// Queues a recursive copy of `src_path` on `src_endpoint` to `dst_path`
    /// on `dst_endpoint`.
    pub fn add_transfer(
        &self,
        src_endpoint: &str,
        src_path: &str,
        dst_endpoint: &str,
        dst_path: &str,
    ) -> FsResult<MutationTicket> {
        self.enqueue(
            MutationDescriptor::transfer(src_endpoint, dst_endpoint),
            |items| {
                if let Items::Transfer(list) = items {
                    list.push(TransferItem::new(src_path, dst_path, true));
                }
            },
        )
    }

    fn enqueue<F>(&self, descriptor: MutationDescriptor, push: F) -> FsResult<MutationTicket>
    where
        F: FnOnce(&mut Items),
    {
        let mut state = self.shared.state.lock();
        if state.closing {
            return Err(FsError::QueueClosed);
        }
        state.last_ticket += 1;
        let ticket = state.last_ticket;

        let merges = state
            .pending
            .last()
            .is_some_and(|tail| tail.descriptor == descriptor);
        if !merges {
            let items = match descriptor.kind {
                MutationKind::Delete => Items::Delete(Vec::new()),
                MutationKind::Transfer => Items::Transfer(Vec::new()),
            };
            trace!(%descriptor, ticket, "New batch");
            state.pending.push(QueuedTask {
                descriptor,
                items,
                first_ticket: ticket,
                last_ticket: ticket,
            });
        }
        if let Some(tail) = state.pending.last_mut() {
            push(&mut tail.items);
            tail.last_ticket = ticket;
        }
        state.last_mutation = Instant::now();
        Ok(MutationTicket(ticket))
    }

    /// Asks the worker to flush without waiting for quiescence.
    pub fn request_flush(&self) {
        self.shared.state.lock().flush_requested = true;
        self.shared.wake.notify_all();
    }

    /// Requests a flush and blocks until the batch holding `ticket` has
    /// settled. Fails if that batch did not succeed or `timeout` passes.
    pub fn wait_for(&self, ticket: MutationTicket, timeout: Duration) -> FsResult<()> {
        self.request_flush();
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while state.settled_through < ticket.0 {
            if self
                .shared
                .settled
                .wait_until(&mut state, deadline)
                .timed_out()
                && state.settled_through < ticket.0
            {
                return Err(FsError::TransferTimeout {
                    what: format!("mutation {ticket}"),
                    timeout,
                });
            }
        }
        if state.is_failed(ticket.0) {
            return Err(FsError::MutationFailed(format!("mutation {ticket}")));
        }
        Ok(())
    }

    /// Flushes and waits until every mutation queued so far has settled.
    ///
    /// Individual failures are not reported here; they are logged.
    pub fn drain(&self, timeout: Duration) -> FsResult<()> {
        let last = self.shared.state.lock().last_ticket;
        if last == 0 {
            return Ok(());
        }
        match self.wait_for(MutationTicket(last), timeout) {
            Err(FsError::MutationFailed(_)) | Ok(()) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Number of batches waiting to be flushed.
    pub fn pending_len(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    /// Number of items across all waiting batches.
    pub fn pending_items(&self) -> usize {
        self.shared
            .state
            .lock()
            .pending
            .iter()
            .map(|t| t.items.len())
            .sum()
    }

    pub fn stats(&self) -> QueueStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Stops accepting mutations, flushes everything still queued and joins
    /// the worker. Safe to call more than once.
    pub fn close(&self) {
        {
            let mut state = self.shared.state.lock();
            if !state.closing {
                info!(pending = state.pending.len(), "Closing batch queue");
            }
            state.closing = true;
        }
        self.shared.wake.notify_all();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker
            && worker.join().is_err()
        {
            error!("Batch queue worker panicked");
        }
    }
}

impl Drop for BatchQueue {
    fn drop(&mut self) {
        self.close();
    }
}

impl Shared {
    /// Worker loop: wait for a flushable generation, then submit it.
    fn run(&self) {
        loop {
            let generation = {
                let mut state = self.state.lock();
                loop {
                    if state.pending.is_empty() {
                        state.flush_requested = false;
                        if state.closing {
                            debug!("Batch queue worker exiting");
                            return;
                        }
                    } else if state.closing
                        || state.flush_requested
                        || state.last_mutation.elapsed() >= self.config.quiescence
                    {
                        state.flush_requested = false;
                        break std::mem::take(&mut state.pending);
                    }
                    self.wake.wait_for(&mut state, self.config.poll_interval);
                }
            };

            info!(batches = generation.len(), "Clearing task queue");
            for task in generation {
                let ok = self.submit_and_wait(&task);
                let mut state = self.state.lock();
                state.settled_through = task.last_ticket;
                if !ok {
                    state.record_failure(task.first_ticket, task.last_ticket);
                }
                drop(state);
                self.settled.notify_all();
            }
        }
    }

    /// Submits one batch and waits for it. Returns whether it succeeded.
    fn submit_and_wait(&self, task: &QueuedTask) -> bool {
        let descriptor = &task.descriptor;
        let task_id = match self.submit(task) {
            Ok(id) => id,
            Err(e) => {
                error!(%descriptor, items = task.items.len(), error = %e, "Failed to submit batch");
                self.stats.record_outcome(None);
                return false;
            }
        };
        self.stats.record_submit(task.items.len());
        debug!(%descriptor, task = %task_id, items = task.items.len(), "Submitted batch");

        let outcome = match wait_for_task(
            self.gateway.as_ref(),
            &task_id,
            self.config.task_timeout,
            self.config.task_poll_interval,
        ) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(%descriptor, task = %task_id, error = %e, "Polling batch failed");
                self.stats.record_outcome(None);
                return false;
            }
        };
        self.stats.record_outcome(Some(outcome));
        match outcome {
            TaskOutcome::Succeeded => {
                debug!(task = %task_id, "Batch completed");
                true
            }
            TaskOutcome::Failed => {
                warn!(%descriptor, task = %task_id, "Batch finished unsuccessfully");
                false
            }
            TaskOutcome::TimedOut => {
                warn!(
                    %descriptor,
                    task = %task_id,
                    timeout = ?self.config.task_timeout,
                    "Batch did not complete in time; moving on"
                );
                false
            }
        }
    }

    fn submit(&self, task: &QueuedTask) -> xferfs_gateway::GatewayResult<TaskId> {
        let submission = self.gateway.submission_id()?;
        let descriptor = &task.descriptor;
        match &task.items {
            Items::Delete(paths) => {
                self.gateway
                    .submit_delete(&submission, &descriptor.source_endpoint, paths, true)
            }
            Items::Transfer(items) => self.gateway.submit_transfer(
                &submission,
                &descriptor.source_endpoint,
                descriptor
                    .destination_endpoint
                    .as_deref()
                    .unwrap_or(&descriptor.source_endpoint),
                items,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;
    use xferfs_gateway::{DirectoryGateway, GatewayEvent};

    const WAIT: Duration = Duration::from_secs(5);

    fn fast_config() -> QueueConfig {
        QueueConfig::default()
            .poll_interval(Duration::from_millis(5))
            .quiescence(Duration::from_millis(20))
            .task_timeout(Duration::from_millis(200))
            .task_poll_interval(Duration::from_millis(2))
    }

    /// Never flushes on its own within a test's lifetime.
    fn idle_config() -> QueueConfig {
        fast_config().quiescence(Duration::from_secs(3600))
    }

    fn setup(config: QueueConfig) -> (TempDir, Arc<DirectoryGateway>, BatchQueue) {
        let dir = TempDir::new().unwrap();
        for name in ["a", "b", "c", "d"] {
            fs::write(dir.path().join(name), name).unwrap();
        }
        let gw = Arc::new(DirectoryGateway::new().with_endpoint("ep", dir.path()));
        let queue = BatchQueue::start(gw.clone(), config).unwrap();
        (dir, gw, queue)
    }

    #[test]
    fn test_deletions_coalesce_into_one_task() {
        let (dir, gw, queue) = setup(idle_config());
        for name in ["a", "b", "c"] {
            queue.add_deletion("ep", &format!("/{name}")).unwrap();
        }
        assert_eq!(queue.pending_len(), 1);
        assert_eq!(queue.pending_items(), 3);

        queue.drain(WAIT).unwrap();
        let log = gw.log();
        let deletes = log.deletes();
        assert_eq!(deletes.len(), 1);
        match deletes[0] {
            GatewayEvent::SubmitDelete { paths, .. } => assert_eq!(paths.len(), 3),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(log.submission_ids, 1);
        assert!(!dir.path().join("a").exists());
        assert!(dir.path().join("d").exists());
    }

    #[test]
    fn test_only_tail_coalesces() {
        let (_dir, gw, queue) = setup(idle_config());
        let t1 = queue.add_deletion("ep", "/a").unwrap();
        let t2 = queue.add_transfer("ep", "/b", "ep", "/b2").unwrap();
        let t3 = queue.add_deletion("ep", "/c").unwrap();
        assert!(t1 < t2 && t2 < t3);
        assert_eq!(queue.pending_len(), 3);

        queue.drain(WAIT).unwrap();
        let log = gw.log();
        let order: Vec<TaskId> = log
            .submissions()
            .iter()
            .filter_map(|e| e.submitted_task().cloned())
            .collect();
        assert_eq!(order.len(), 3);
        assert!(matches!(log.submissions()[0], GatewayEvent::SubmitDelete { .. }));
        assert!(matches!(log.submissions()[1], GatewayEvent::SubmitTransfer { .. }));
        assert!(matches!(log.submissions()[2], GatewayEvent::SubmitDelete { .. }));

        // Each batch is submitted only after the previous one went terminal.
        for pair in order.windows(2) {
            let terminal = log.terminal_poll_index(&pair[0]).unwrap();
            let next = log.submission_index(&pair[1]).unwrap();
            assert!(terminal < next);
        }
    }

    #[test]
    fn test_waits_for_quiescence() {
        let config = fast_config().quiescence(Duration::from_millis(300));
        let (_dir, gw, queue) = setup(config);
        queue.add_deletion("ep", "/a").unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(gw.log().submissions().is_empty());
        assert_eq!(queue.pending_len(), 1);

        let ticket = queue.add_deletion("ep", "/b").unwrap();
        let start = Instant::now();
        let deadline = start + WAIT;
        while gw.log().submissions().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(start.elapsed() >= Duration::from_millis(250));
        queue.wait_for(ticket, WAIT).unwrap();
        assert_eq!(gw.log().deletes().len(), 1);
    }

    #[test]
    fn test_close_flushes_pending() {
        let (dir, gw, queue) = setup(idle_config());
        queue.add_deletion("ep", "/a").unwrap();
        queue.close();
        assert_eq!(gw.log().deletes().len(), 1);
        assert!(!dir.path().join("a").exists());
        assert_eq!(queue.pending_len(), 0);

        // Idempotent, and later mutations are refused.
        queue.close();
        assert!(matches!(
            queue.add_deletion("ep", "/b"),
            Err(FsError::QueueClosed)
        ));
    }

    #[test]
    fn test_failed_batch_does_not_block_later_ones() {
        let (dir, gw, queue) = setup(idle_config());
        gw.set_fail_submissions(true);
        let failed = queue.add_deletion("ep", "/a").unwrap();
        assert!(matches!(
            queue.wait_for(failed, WAIT),
            Err(FsError::MutationFailed(_))
        ));

        gw.set_fail_submissions(false);
        let ok = queue.add_transfer("ep", "/b", "ep", "/b-copy").unwrap();
        queue.wait_for(ok, WAIT).unwrap();
        assert!(dir.path().join("b-copy").exists());
        assert!(dir.path().join("a").exists());

        let stats = queue.stats();
        assert_eq!(stats.tasks_failed, 1);
        assert_eq!(stats.tasks_succeeded, 1);
        assert_eq!(stats.tasks_submitted, 1);
    }

    #[test]
    fn test_stalled_task_times_out_and_moves_on() {
        let (_dir, gw, queue) = setup(idle_config());
        gw.set_stall_tasks(true);
        let stalled = queue.add_deletion("ep", "/a").unwrap();
        assert!(matches!(
            queue.wait_for(stalled, WAIT),
            Err(FsError::MutationFailed(_))
        ));
        assert_eq!(queue.stats().tasks_timed_out, 1);

        gw.set_stall_tasks(false);
        let next = queue.add_deletion("ep", "/b").unwrap();
        queue.wait_for(next, WAIT).unwrap();
    }

    #[test]
    fn test_wait_for_times_out() {
        let config = idle_config().task_timeout(Duration::from_millis(500));
        let (_dir, gw, queue) = setup(config);
        gw.set_stall_tasks(true);
        let ticket = queue.add_deletion("ep", "/a").unwrap();
        assert!(matches!(
            queue.wait_for(ticket, Duration::from_millis(50)),
            Err(FsError::TransferTimeout { .. })
        ));
    }

    fn empty_state() -> QueueState {
        QueueState {
            pending: Vec::new(),
            last_mutation: Instant::now(),
            closing: false,
            flush_requested: false,
            last_ticket: 0,
            settled_through: 0,
            failed: Vec::new(),
        }
    }

    #[test]
    fn test_failed_ranges_merge_when_adjacent() {
        let mut state = empty_state();
        state.record_failure(1, 3);
        state.record_failure(4, 4);
        state.record_failure(7, 9);
        assert_eq!(state.failed, vec![1..=4, 7..=9]);
        assert!(state.is_failed(4));
        assert!(!state.is_failed(5));
        assert!(state.is_failed(8));
    }

    #[test]
    fn test_failed_ranges_are_capped() {
        let mut state = empty_state();
        for i in 0..(MAX_FAILED_RANGES as u64 + 10) {
            // Gaps keep every range separate.
            state.record_failure(i * 2 + 1, i * 2 + 1);
        }
        assert_eq!(state.failed.len(), MAX_FAILED_RANGES);
        assert!(!state.is_failed(1));
        assert!(state.is_failed(MAX_FAILED_RANGES as u64 * 2 + 19));
    }

    #[test]
    fn test_interleaved_kinds_keep_separate_batches() {
        let (_dir, _gw, queue) = setup(idle_config());
        queue.add_deletion("ep", "/a").unwrap();
        queue.add_deletion("ep", "/b").unwrap();
        queue.add_transfer("ep", "/c", "ep", "/c2").unwrap();
        queue.add_transfer("ep", "/d", "ep", "/d2").unwrap();
        queue.add_deletion("other", "/x").unwrap();
        assert_eq!(queue.pending_len(), 3);
        assert_eq!(queue.pending_items(), 5);
    }

    #[test]
    fn test_drain_with_nothing_queued() {
        let (_dir, gw, queue) = setup(idle_config());
        queue.drain(Duration::from_millis(10)).unwrap();
        assert_eq!(gw.log().submission_ids, 0);
    }
}
