//! Bridge configuration.
//!
//! [`BridgeConfig`] carries the endpoints, the scratch directory and every
//! timing knob of the bridge. Defaults suit a high-latency transfer service;
//! tests shrink the intervals to milliseconds.
//!
//! A [`FileConfig`] can be loaded from TOML and applied on top of the
//! defaults before command-line overrides.
//!
//! # Example configuration
//!
//! ```toml
//! local_endpoint = "my-laptop"
//! remote_endpoint = "cluster#scratch"
//! cache_dir = "/var/tmp/xferfs-cache"
//! gateway = "globus"
//! write_back = true
//!
//! [timing]
//! download_timeout = "20s"
//! quiescence = "3s"
//! task_timeout = "1m"
//!
//! [endpoint_roots]
//! my-laptop = "/"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default bound on a blocking download performed by `open`.
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Default interval between status polls of a download task.
pub const DEFAULT_DOWNLOAD_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default wake-up interval of the batch flush loop.
pub const DEFAULT_QUEUE_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default idle time after the last enqueue before a flush is allowed.
pub const DEFAULT_QUIESCENCE: Duration = Duration::from_secs(5);

/// Default bound on waiting for one queued task to reach terminal status.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(30);

/// Default interval between status polls of a queued task.
pub const DEFAULT_TASK_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Name of the scratch directory created under the system temp dir when no
/// cache directory is configured.
pub const DEFAULT_CACHE_DIR_NAME: &str = "xferfs-cache";

/// How destructive operations relate to their queued remote mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MutationPolicy {
    /// Update the local view and return at once; remote failures are only
    /// logged by the flush loop.
    #[default]
    Optimistic,
    /// Update the local view, then block until the mutation's batch has
    /// settled. A failed or timed-out batch is reported as EIO.
    WaitForRemote { timeout: Duration },
}

/// Timing of the mutation batch queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// How often the flush loop wakes up when nothing signals it.
    pub poll_interval: Duration,
    /// Idle time after the last enqueue before pending batches are flushed.
    pub quiescence: Duration,
    /// Upper bound on waiting for a single submitted task.
    pub task_timeout: Duration,
    /// Interval between status polls of a submitted task.
    pub task_poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_QUEUE_POLL_INTERVAL,
            quiescence: DEFAULT_QUIESCENCE,
            task_timeout: DEFAULT_TASK_TIMEOUT,
            task_poll_interval: DEFAULT_TASK_POLL_INTERVAL,
        }
    }
}

impl QueueConfig {
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub fn quiescence(mut self, quiescence: Duration) -> Self {
        self.quiescence = quiescence;
        self
    }

    #[must_use]
    pub fn task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    #[must_use]
    pub fn task_poll_interval(mut self, interval: Duration) -> Self {
        self.task_poll_interval = interval;
        self
    }
}

/// Configuration of one bridge instance.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Endpoint that holds the remote tree being mounted.
    pub remote_endpoint: String,
    /// Endpoint naming this machine; downloads land here.
    pub local_endpoint: String,
    /// Scratch directory for downloaded content. Recreated at startup and
    /// removed at teardown.
    pub cache_dir: PathBuf,
    /// Upper bound on the blocking download done by `open`.
    pub download_timeout: Duration,
    /// Interval between status polls of a download.
    pub download_poll_interval: Duration,
    /// Queue timing.
    pub queue: QueueConfig,
    /// Behaviour of unlink/rmdir/rename with respect to the remote side.
    pub mutation_policy: MutationPolicy,
    /// Upload modified files back to the remote endpoint on release.
    pub write_back: bool,
    /// Attribute TTL handed to the kernel.
    pub attr_ttl: Duration,
}

impl BridgeConfig {
    /// Creates a configuration with default timing for the given endpoints.
    pub fn new(remote_endpoint: impl Into<String>, local_endpoint: impl Into<String>) -> Self {
        Self {
            remote_endpoint: remote_endpoint.into(),
            local_endpoint: local_endpoint.into(),
            cache_dir: std::env::temp_dir().join(DEFAULT_CACHE_DIR_NAME),
            download_timeout: DEFAULT_DOWNLOAD_TIMEOUT,
            download_poll_interval: DEFAULT_DOWNLOAD_POLL_INTERVAL,
            queue: QueueConfig::default(),
            mutation_policy: MutationPolicy::default(),
            write_back: true,
            attr_ttl: Duration::from_secs(1),
        }
    }

    #[must_use]
    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    #[must_use]
    pub fn download_timeout(mut self, timeout: Duration) -> Self {
        self.download_timeout = timeout;
        self
    }

    #[must_use]
    pub fn download_poll_interval(mut self, interval: Duration) -> Self {
        self.download_poll_interval = interval;
        self
    }

    #[must_use]
    pub fn queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    #[must_use]
    pub fn mutation_policy(mut self, policy: MutationPolicy) -> Self {
        self.mutation_policy = policy;
        self
    }

    #[must_use]
    pub fn write_back(mut self, enabled: bool) -> Self {
        self.write_back = enabled;
        self
    }

    #[must_use]
    pub fn attr_ttl(mut self, ttl: Duration) -> Self {
        self.attr_ttl = ttl;
        self
    }

    /// Applies every value present in a configuration file.
    ///
    /// Endpoint names and gateway selection are left to the caller, which
    /// resolves them together with command-line arguments.
    #[must_use]
    pub fn apply_file(mut self, file: &FileConfig) -> Self {
        if let Some(dir) = &file.cache_dir {
            self.cache_dir.clone_from(dir);
        }
        if let Some(enabled) = file.write_back {
            self.write_back = enabled;
        }
        if let Some(timeout) = file.wait_for_remote {
            self.mutation_policy = MutationPolicy::WaitForRemote { timeout };
        }
        let t = &file.timing;
        if let Some(v) = t.download_timeout {
            self.download_timeout = v;
        }
        if let Some(v) = t.download_poll_interval {
            self.download_poll_interval = v;
        }
        if let Some(v) = t.queue_poll_interval {
            self.queue.poll_interval = v;
        }
        if let Some(v) = t.quiescence {
            self.queue.quiescence = v;
        }
        if let Some(v) = t.task_timeout {
            self.queue.task_timeout = v;
        }
        if let Some(v) = t.task_poll_interval {
            self.queue.task_poll_interval = v;
        }
        if let Some(v) = t.attr_ttl {
            self.attr_ttl = v;
        }
        self
    }
}

/// Which gateway implementation the binary talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum GatewayKind {
    /// Globus Transfer REST API.
    #[default]
    Globus,
    /// Endpoints backed by local directories.
    Directory,
}

/// Errors raised while loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not determine the configuration directory")]
    NoConfigDir,

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Timing overrides, all optional, written as humantime strings ("500ms", "2s").
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimingConfig {
    #[serde(with = "humantime_serde")]
    pub download_timeout: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub download_poll_interval: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub queue_poll_interval: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub quiescence: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub task_timeout: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub task_poll_interval: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub attr_ttl: Option<Duration>,
}

/// On-disk configuration file.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub local_endpoint: Option<String>,
    pub remote_endpoint: Option<String>,
    pub cache_dir: Option<PathBuf>,
    pub gateway: Option<GatewayKind>,
    /// Globus Transfer API base URL.
    pub base_url: Option<String>,
    pub write_back: Option<bool>,
    /// When set, destructive operations wait this long for the remote side.
    #[serde(with = "humantime_serde")]
    pub wait_for_remote: Option<Duration>,
    pub timing: TimingConfig,
    /// Endpoint name to local directory, for the directory gateway.
    pub endpoint_roots: BTreeMap<String, PathBuf>,
}

impl FileConfig {
    /// Default location of the configuration file.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let dirs = directories::ProjectDirs::from("org", "xferfs", "xferfs")
            .ok_or(ConfigError::NoConfigDir)?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Parses a configuration from TOML text.
    pub fn parse(content: &str, origin: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    /// Loads a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, path)
    }

    /// Loads the file at the default location, or an empty configuration if
    /// there is none.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = Self::default_path()?;
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file found, using defaults");
            return Ok(Self::default());
        }
        Self::load(&path)
    }
}
