//! Gateway backed by directories on the local disk.
//!
//! Each endpoint name maps to a root directory. Transfers, deletes and
//! mkdirs are executed synchronously at submission time, which makes this
//! gateway useful for running a mount against plain local storage and as
//! the remote side in tests.
//!
//! Tests can also observe and steer it: every call is recorded in a
//! [`CallLog`], tasks can be stalled so they never reach a terminal status,
//! and submissions can be forced to fail.

use crate::error::{GatewayError, GatewayResult};
use crate::gateway::TransferGateway;
use crate::types::{
    ActivationStatus, EntryKind, ListingEntry, SubmissionId, TaskId, TaskStatus, TransferItem,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, trace, warn};

/// One recorded gateway call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    ListDirectory {
        endpoint: String,
        path: String,
    },
    SubmitTransfer {
        task: TaskId,
        source: String,
        destination: String,
        items: Vec<TransferItem>,
    },
    SubmitDelete {
        task: TaskId,
        endpoint: String,
        paths: Vec<String>,
    },
    Poll {
        task: TaskId,
        terminal: bool,
    },
    MakeDirectory {
        endpoint: String,
        path: String,
    },
}

impl GatewayEvent {
    /// Task ID of a submission event.
    pub fn submitted_task(&self) -> Option<&TaskId> {
        match self {
            GatewayEvent::SubmitTransfer { task, .. } | GatewayEvent::SubmitDelete { task, .. } => {
                Some(task)
            }
            _ => None,
        }
    }
}

/// Snapshot of every call made against a [`DirectoryGateway`].
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    /// Number of submission IDs issued.
    pub submission_ids: usize,
    /// Calls in the order they were made.
    pub events: Vec<GatewayEvent>,
}

impl CallLog {
    /// Number of directory listings performed.
    pub fn list_calls(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, GatewayEvent::ListDirectory { .. }))
            .count()
    }

    /// Submission events (transfers and deletes) in order.
    pub fn submissions(&self) -> Vec<&GatewayEvent> {
        self.events
            .iter()
            .filter(|e| e.submitted_task().is_some())
            .collect()
    }

    /// Delete submissions in order.
    pub fn deletes(&self) -> Vec<&GatewayEvent> {
        self.events
            .iter()
            .filter(|e| matches!(e, GatewayEvent::SubmitDelete { .. }))
            .collect()
    }

    /// Transfer submissions in order.
    pub fn transfers(&self) -> Vec<&GatewayEvent> {
        self.events
            .iter()
            .filter(|e| matches!(e, GatewayEvent::SubmitTransfer { .. }))
            .collect()
    }

    /// Index of the first poll that saw `task` terminal.
    pub fn terminal_poll_index(&self, task: &TaskId) -> Option<usize> {
        self.events.iter().position(|e| {
            matches!(e, GatewayEvent::Poll { task: t, terminal: true } if t == task)
        })
    }

    /// Index of the submission of `task`.
    pub fn submission_index(&self, task: &TaskId) -> Option<usize> {
        self.events
            .iter()
            .position(|e| e.submitted_task() == Some(task))
    }
}

#[derive(Debug)]
struct TaskRecord {
    /// Polls remaining before the task turns terminal.
    polls_left: u32,
    /// Whether execution failed (reported once terminal).
    failed: bool,
    /// Stalled tasks never turn terminal.
    stalled: bool,
    completed_at: Option<SystemTime>,
}

#[derive(Debug, Default)]
struct GatewayState {
    next_id: u64,
    tasks: HashMap<TaskId, TaskRecord>,
    log: CallLog,
    stall_tasks: bool,
    fail_submissions: bool,
    polls_until_complete: u32,
}

/// Transfer gateway whose endpoints are directories on the local disk.
#[derive(Debug)]
pub struct DirectoryGateway {
    endpoints: HashMap<String, PathBuf>,
    state: Mutex<GatewayState>,
}

impl DirectoryGateway {
    /// Creates a gateway with no endpoints.
    pub fn new() -> Self {
        Self {
            endpoints: HashMap::new(),
            state: Mutex::new(GatewayState::default()),
        }
    }

    /// Registers an endpoint rooted at `root`.
    #[must_use]
    pub fn with_endpoint(mut self, name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        self.endpoints.insert(name.into(), root.into());
        self
    }

    /// When set, tasks submitted from now on are accepted but never
    /// executed and never reach a terminal status.
    pub fn set_stall_tasks(&self, stall: bool) {
        self.state.lock().stall_tasks = stall;
    }

    /// When set, every submission fails with a status error.
    pub fn set_fail_submissions(&self, fail: bool) {
        self.state.lock().fail_submissions = fail;
    }

    /// Number of non-terminal polls each new task answers before it
    /// reports completion.
    pub fn set_polls_until_complete(&self, polls: u32) {
        self.state.lock().polls_until_complete = polls;
    }

    /// Returns a snapshot of all calls made so far.
    pub fn log(&self) -> CallLog {
        self.state.lock().log.clone()
    }

    /// Resolves an endpoint path to a location on disk.
    pub fn resolve(&self, endpoint: &str, path: &str) -> GatewayResult<PathBuf> {
        let root = self
            .endpoints
            .get(endpoint)
            .ok_or_else(|| GatewayError::UnknownEndpoint(endpoint.to_string()))?;
        let relative = Path::new(path.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(GatewayError::Status {
                code: 400,
                message: format!("invalid path: {path}"),
            });
        }
        Ok(root.join(relative))
    }

    fn check_submission(&self, state: &GatewayState) -> GatewayResult<()> {
        if state.fail_submissions {
            return Err(GatewayError::Status {
                code: 503,
                message: "submissions disabled".to_string(),
            });
        }
        Ok(())
    }

    /// Registers a new task, running `execute` unless tasks are stalled.
    fn start_task<F>(&self, state: &mut GatewayState, execute: F) -> TaskId
    where
        F: FnOnce() -> io::Result<()>,
    {
        state.next_id += 1;
        let task_id = TaskId::new(format!("task-{}", state.next_id));
        let stalled = state.stall_tasks;
        let failed = if stalled {
            false
        } else {
            match execute() {
                Ok(()) => false,
                Err(e) => {
                    warn!(task = %task_id, error = %e, "Task execution failed");
                    true
                }
            }
        };
        state.tasks.insert(
            task_id.clone(),
            TaskRecord {
                polls_left: state.polls_until_complete,
                failed,
                stalled,
                completed_at: None,
            },
        );
        task_id
    }

    fn not_found(endpoint: &str, path: &str) -> GatewayError {
        GatewayError::NotFound {
            endpoint: endpoint.to_string(),
            path: path.to_string(),
        }
    }
}

impl Default for DirectoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferGateway for DirectoryGateway {
    fn submission_id(&self) -> GatewayResult<SubmissionId> {
        let mut state = self.state.lock();
        state.log.submission_ids += 1;
        Ok(SubmissionId::new(format!("submission-{}", state.log.submission_ids)))
    }

    fn activate_endpoint(&self, endpoint: &str) -> GatewayResult<ActivationStatus> {
        Ok(match self.endpoints.get(endpoint) {
            Some(root) if root.is_dir() => ActivationStatus {
                code: 200,
                message: format!("Endpoint {endpoint} activated"),
            },
            Some(root) => ActivationStatus {
                code: 404,
                message: format!("Endpoint root {} is not a directory", root.display()),
            },
            None => ActivationStatus {
                code: 404,
                message: format!("Unknown endpoint {endpoint}"),
            },
        })
    }

    fn list_directory(&self, endpoint: &str, path: &str) -> GatewayResult<Vec<ListingEntry>> {
        self.state.lock().log.events.push(GatewayEvent::ListDirectory {
            endpoint: endpoint.to_string(),
            path: path.to_string(),
        });

        let dir = self.resolve(endpoint, path)?;
        let read_dir = fs::read_dir(&dir).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Self::not_found(endpoint, path)
            } else {
                GatewayError::Io(e)
            }
        })?;

        let mut entries = Vec::new();
        for entry in read_dir {
            let entry = entry?;
            let metadata = entry.metadata()?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                debug!(path = %entry.path().display(), "Skipping non-UTF-8 entry");
                continue;
            };
            entries.push(ListingEntry {
                name,
                kind: if metadata.is_dir() {
                    EntryKind::Dir
                } else {
                    EntryKind::File
                },
                permissions: metadata.permissions().mode() & 0o7777,
                size: if metadata.is_dir() { 0 } else { metadata.len() },
                last_modified: metadata.modified().ok(),
            });
        }
        trace!(endpoint, path, count = entries.len(), "Listed directory");
        Ok(entries)
    }

    fn submit_transfer(
        &self,
        _submission_id: &SubmissionId,
        source: &str,
        destination: &str,
        items: &[TransferItem],
    ) -> GatewayResult<TaskId> {
        let mut state = self.state.lock();
        self.check_submission(&state)?;

        let mut resolved = Vec::with_capacity(items.len());
        for item in items {
            resolved.push((
                self.resolve(source, &item.source)?,
                self.resolve(destination, &item.destination)?,
                item.recursive,
            ));
        }

        let task = self.start_task(&mut state, || {
            for (from, to, recursive) in &resolved {
                copy_entry(from, to, *recursive)?;
            }
            Ok(())
        });
        debug!(task = %task, source, destination, items = items.len(), "Submitted transfer");
        state.log.events.push(GatewayEvent::SubmitTransfer {
            task: task.clone(),
            source: source.to_string(),
            destination: destination.to_string(),
            items: items.to_vec(),
        });
        Ok(task)
    }

    fn submit_delete(
        &self,
        _submission_id: &SubmissionId,
        endpoint: &str,
        paths: &[String],
        recursive: bool,
    ) -> GatewayResult<TaskId> {
        let mut state = self.state.lock();
        self.check_submission(&state)?;

        let mut resolved = Vec::with_capacity(paths.len());
        for path in paths {
            resolved.push(self.resolve(endpoint, path)?);
        }

        let task = self.start_task(&mut state, || {
            for target in &resolved {
                remove_entry(target, recursive)?;
            }
            Ok(())
        });
        debug!(task = %task, endpoint, items = paths.len(), "Submitted delete");
        state.log.events.push(GatewayEvent::SubmitDelete {
            task: task.clone(),
            endpoint: endpoint.to_string(),
            paths: paths.to_vec(),
        });
        Ok(task)
    }

    fn poll_task(&self, task_id: &TaskId) -> GatewayResult<TaskStatus> {
        let mut state = self.state.lock();
        let record = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| GatewayError::UnknownTask(task_id.to_string()))?;

        let status = if record.stalled {
            TaskStatus::running()
        } else if record.polls_left > 0 {
            record.polls_left -= 1;
            TaskStatus::running()
        } else {
            let at = *record.completed_at.get_or_insert_with(SystemTime::now);
            if record.failed {
                TaskStatus::failed(at)
            } else {
                TaskStatus::succeeded(at)
            }
        };

        state.log.events.push(GatewayEvent::Poll {
            task: task_id.clone(),
            terminal: status.is_terminal(),
        });
        Ok(status)
    }

    fn make_directory(&self, endpoint: &str, path: &str) -> GatewayResult<()> {
        self.state.lock().log.events.push(GatewayEvent::MakeDirectory {
            endpoint: endpoint.to_string(),
            path: path.to_string(),
        });
        let dir = self.resolve(endpoint, path)?;
        fs::create_dir(&dir).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Self::not_found(endpoint, path),
            io::ErrorKind::AlreadyExists => GatewayError::Status {
                code: 409,
                message: format!("{path} already exists"),
            },
            _ => GatewayError::Io(e),
        })
    }
}

/// Copies a file, or a directory tree when `recursive` is set.
fn copy_entry(from: &Path, to: &Path, recursive: bool) -> io::Result<()> {
    let metadata = fs::metadata(from)?;
    if !metadata.is_dir() {
        fs::copy(from, to)?;
        return Ok(());
    }
    if !recursive {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is a directory", from.display()),
        ));
    }
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        copy_entry(&entry.path(), &to.join(entry.file_name()), true)?;
    }
    Ok(())
}

fn remove_entry(target: &Path, recursive: bool) -> io::Result<()> {
    let metadata = fs::symlink_metadata(target)?;
    if !metadata.is_dir() {
        fs::remove_file(target)
    } else if recursive {
        fs::remove_dir_all(target)
    } else {
        fs::remove_dir(target)
    }
}
