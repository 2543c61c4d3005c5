//! Property tests for batch coalescing and flush order.

mod common;

use common::*;
use proptest::prelude::*;
use std::sync::Arc;
use tempfile::TempDir;
use xferfs_fuse::BatchQueue;
use xferfs_gateway::{DirectoryGateway, GatewayEvent};

/// One enqueue in a generated workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    DeleteX,
    DeleteY,
    TransferXY,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![Just(Op::DeleteX), Just(Op::DeleteY), Just(Op::TransferXY)]
}

/// Lengths of runs of equal consecutive operations.
fn runs(ops: &[Op]) -> Vec<(Op, usize)> {
    let mut runs: Vec<(Op, usize)> = Vec::new();
    for &op in ops {
        match runs.last_mut() {
            Some((last, n)) if *last == op => *n += 1,
            _ => runs.push((op, 1)),
        }
    }
    runs
}

fn submitted(event: &GatewayEvent) -> (Op, usize) {
    match event {
        GatewayEvent::SubmitDelete { endpoint, paths, .. } if endpoint == "x" => {
            (Op::DeleteX, paths.len())
        }
        GatewayEvent::SubmitDelete { paths, .. } => (Op::DeleteY, paths.len()),
        GatewayEvent::SubmitTransfer { items, .. } => (Op::TransferXY, items.len()),
        other => panic!("not a submission: {other:?}"),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Every run of equal consecutive mutations becomes exactly one remote
    /// task, submitted in enqueue order, and each task is terminal before
    /// the next is submitted.
    #[test]
    fn coalesced_batches_follow_enqueue_runs(
        ops in prop::collection::vec(op_strategy(), 1..24)
    ) {
        let x = TempDir::new().unwrap();
        let y = TempDir::new().unwrap();
        let gateway = Arc::new(
            DirectoryGateway::new()
                .with_endpoint("x", x.path())
                .with_endpoint("y", y.path()),
        );
        let queue = BatchQueue::start(gateway.clone(), test_queue_config()).unwrap();

        for (i, op) in ops.iter().enumerate() {
            let queued = match op {
                Op::DeleteX => queue.add_deletion("x", &format!("/f{i}")),
                Op::DeleteY => queue.add_deletion("y", &format!("/f{i}")),
                Op::TransferXY => {
                    queue.add_transfer("x", &format!("/s{i}"), "y", &format!("/d{i}"))
                }
            };
            queued.unwrap();
        }
        let expected = runs(&ops);
        prop_assert_eq!(queue.pending_len(), expected.len());
        queue.drain(DRAIN_TIMEOUT).unwrap();

        let log = gateway.log();
        let submissions = log.submissions();
        let actual: Vec<(Op, usize)> = submissions.iter().map(|e| submitted(e)).collect();
        prop_assert_eq!(&actual, &expected);
        prop_assert_eq!(log.submission_ids, expected.len());

        for pair in submissions.windows(2) {
            let first = pair[0].submitted_task().unwrap();
            let second = pair[1].submitted_task().unwrap();
            prop_assert!(
                log.terminal_poll_index(first).unwrap() < log.submission_index(second).unwrap()
            );
        }
        queue.close();
    }
}

#[test]
fn test_delete_transfer_delete_flush_in_order() {
    let remote = TempDir::new().unwrap();
    for name in ["a", "b", "c"] {
        std::fs::write(remote.path().join(name), name).unwrap();
    }
    let gateway = Arc::new(DirectoryGateway::new().with_endpoint(REMOTE, remote.path()));
    gateway.set_polls_until_complete(3);
    let queue = BatchQueue::start(gateway.clone(), test_queue_config()).unwrap();

    queue.add_deletion(REMOTE, "/a").unwrap();
    queue.add_transfer(REMOTE, "/b", REMOTE, "/b2").unwrap();
    queue.add_deletion(REMOTE, "/c").unwrap();
    assert_eq!(queue.pending_len(), 3);
    queue.drain(DRAIN_TIMEOUT).unwrap();

    let log = gateway.log();
    let submissions = log.submissions();
    assert_eq!(submissions.len(), 3);
    assert!(matches!(submissions[0], GatewayEvent::SubmitDelete { paths, .. } if paths == &["/a".to_string()]));
    assert!(matches!(submissions[1], GatewayEvent::SubmitTransfer { .. }));
    assert!(matches!(submissions[2], GatewayEvent::SubmitDelete { paths, .. } if paths == &["/c".to_string()]));

    let first = submissions[0].submitted_task().unwrap();
    let second = submissions[1].submitted_task().unwrap();
    let third = submissions[2].submitted_task().unwrap();
    assert!(log.terminal_poll_index(first).unwrap() < log.submission_index(second).unwrap());
    assert!(log.terminal_poll_index(second).unwrap() < log.submission_index(third).unwrap());

    assert!(!remote.path().join("a").exists());
    assert!(remote.path().join("b2").exists());
    assert_eq!(queue.stats().tasks_succeeded, 3);
}
