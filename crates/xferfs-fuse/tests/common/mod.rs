//! Shared harness for bridge integration tests.
//!
//! Builds a [`BridgeFs`] over a [`DirectoryGateway`] whose remote endpoint is
//! a temporary directory, so every test runs without FUSE or network access.
//! Timings are shortened to milliseconds and quiescence is effectively
//! disabled: queued mutations only flush when a test drains the queue or the
//! bridge is destroyed.

// Not every test file uses every helper
#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use xferfs_fuse::{BridgeConfig, BridgeFs, MountPath, MutationPolicy, QueueConfig};
use xferfs_gateway::DirectoryGateway;

pub const REMOTE: &str = "remote";
pub const LOCAL: &str = "local";

/// Generous upper bound for draining the queue in tests.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub fn p(path: &str) -> MountPath {
    MountPath::new(path)
}

/// Queue timings for tests: fast polling, flush only on demand.
pub fn test_queue_config() -> QueueConfig {
    QueueConfig::default()
        .poll_interval(Duration::from_millis(5))
        .quiescence(Duration::from_secs(3600))
        .task_timeout(Duration::from_millis(300))
        .task_poll_interval(Duration::from_millis(2))
}

/// A bridge over a seeded temporary remote tree:
///
/// ```text
/// /top.txt            "top level"
/// /a/one.txt          "one"
/// /a/sub/deep.txt     "deep"
/// /b/                 (empty)
/// ```
pub struct TestBridge {
    // Dropped first so teardown runs while the directories still exist.
    pub fs: BridgeFs,
    pub gateway: Arc<DirectoryGateway>,
    pub remote: TempDir,
    pub scratch: TempDir,
}

impl TestBridge {
    pub fn new() -> Self {
        Self::with_policy(MutationPolicy::Optimistic)
    }

    pub fn with_policy(policy: MutationPolicy) -> Self {
        let remote = TempDir::new().expect("remote tempdir");
        seed_remote(&remote);
        let scratch = TempDir::new().expect("scratch tempdir");
        let gateway = Arc::new(
            DirectoryGateway::new()
                .with_endpoint(REMOTE, remote.path())
                .with_endpoint(LOCAL, "/"),
        );
        let config = BridgeConfig::new(REMOTE, LOCAL)
            .cache_dir(scratch.path().join("cache"))
            .download_timeout(Duration::from_millis(300))
            .download_poll_interval(Duration::from_millis(5))
            .queue(test_queue_config())
            .mutation_policy(policy);
        let fs = BridgeFs::new(gateway.clone(), config).expect("bridge");
        Self {
            fs,
            gateway,
            remote,
            scratch,
        }
    }

    /// Location of a mount path inside the remote endpoint.
    pub fn remote_path(&self, path: &str) -> PathBuf {
        self.remote.path().join(path.trim_start_matches('/'))
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.scratch.path().join("cache")
    }

    /// Flushes the queue and waits for every queued mutation to settle.
    pub fn drain(&self) {
        self.fs.queue().drain(DRAIN_TIMEOUT).expect("drain");
    }

    /// Number of gateway calls made so far.
    pub fn call_count(&self) -> usize {
        let log = self.gateway.log();
        log.events.len() + log.submission_ids
    }

    /// Opens `path` read/write, writes `data` at offset 0 and releases it.
    pub fn write_file(&self, path: &MountPath, data: &[u8]) {
        let handle = self.fs.open(path, libc::O_RDWR).expect("open");
        self.fs.write(&handle, 0, data).expect("write");
        self.fs.release(&handle).expect("release");
    }
}

fn seed_remote(remote: &TempDir) {
    let root = remote.path();
    fs::write(root.join("top.txt"), b"top level").expect("seed");
    fs::create_dir_all(root.join("a/sub")).expect("seed");
    fs::write(root.join("a/one.txt"), b"one").expect("seed");
    fs::write(root.join("a/sub/deep.txt"), b"deep").expect("seed");
    fs::create_dir(root.join("b")).expect("seed");
}
