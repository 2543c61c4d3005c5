//! Wire-level types exchanged with a transfer gateway.

use std::fmt;
use std::time::SystemTime;

/// One-time token required to submit a remote transfer or delete task.
///
/// A submission ID must never be reused; the remote side uses it to
/// deduplicate retried submissions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubmissionId(String);

impl SubmissionId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a submitted remote task.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of an entry returned by a directory listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    File,
}

/// A single entry of a remote directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    /// Base name of the entry.
    pub name: String,
    /// Directory or regular file.
    pub kind: EntryKind,
    /// Permission bits (the remote reports them as an octal string).
    pub permissions: u32,
    /// Size in bytes.
    pub size: u64,
    /// Last modification time, when the remote reports one.
    pub last_modified: Option<SystemTime>,
}

impl ListingEntry {
    /// Parses permission bits from the octal string form used on the wire.
    ///
    /// Returns `None` for anything that is not a valid octal number.
    pub fn parse_permissions(octal: &str) -> Option<u32> {
        u32::from_str_radix(octal.trim(), 8).ok()
    }
}

/// One source/destination pair inside a transfer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferItem {
    pub source: String,
    pub destination: String,
    /// Whether directory subtrees are copied as a whole.
    pub recursive: bool,
}

impl TransferItem {
    pub fn new(source: impl Into<String>, destination: impl Into<String>, recursive: bool) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            recursive,
        }
    }
}

/// Lifecycle state reported for a remote task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Active,
    Inactive,
    Succeeded,
    Failed,
}

impl TaskState {
    /// Maps the remote's status string onto a state. Unknown values are
    /// treated as still running.
    pub fn from_wire(status: &str) -> Self {
        match status {
            "SUCCEEDED" => TaskState::Succeeded,
            "FAILED" => TaskState::Failed,
            "INACTIVE" => TaskState::Inactive,
            _ => TaskState::Active,
        }
    }
}

/// Result of polling a remote task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStatus {
    pub state: TaskState,
    /// Set once the task has finished, successfully or not.
    pub completion_time: Option<SystemTime>,
}

impl TaskStatus {
    pub fn running() -> Self {
        Self {
            state: TaskState::Active,
            completion_time: None,
        }
    }

    pub fn succeeded(at: SystemTime) -> Self {
        Self {
            state: TaskState::Succeeded,
            completion_time: Some(at),
        }
    }

    pub fn failed(at: SystemTime) -> Self {
        Self {
            state: TaskState::Failed,
            completion_time: Some(at),
        }
    }

    /// A task is terminal once the remote reports a completion time.
    pub fn is_terminal(&self) -> bool {
        self.completion_time.is_some()
    }

    /// Terminal and not failed.
    pub fn is_success(&self) -> bool {
        self.is_terminal() && self.state != TaskState::Failed
    }
}

/// Outcome of activating an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationStatus {
    /// HTTP-style status code; anything but 200 is a failure.
    pub code: u16,
    pub message: String,
}

impl ActivationStatus {
    pub fn is_ok(&self) -> bool {
        self.code == 200
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_permissions_octal() {
        assert_eq!(ListingEntry::parse_permissions("0755"), Some(0o755));
        assert_eq!(ListingEntry::parse_permissions("644"), Some(0o644));
        assert_eq!(ListingEntry::parse_permissions(" 0700 "), Some(0o700));
        assert_eq!(ListingEntry::parse_permissions("rwx"), None);
        assert_eq!(ListingEntry::parse_permissions("0789"), None);
    }

    #[test]
    fn test_task_status_terminal() {
        assert!(!TaskStatus::running().is_terminal());
        assert!(!TaskStatus::running().is_success());

        let done = TaskStatus::succeeded(SystemTime::now());
        assert!(done.is_terminal());
        assert!(done.is_success());

        let failed = TaskStatus::failed(SystemTime::now());
        assert!(failed.is_terminal());
        assert!(!failed.is_success());
    }

    #[test]
    fn test_task_state_from_wire() {
        assert_eq!(TaskState::from_wire("SUCCEEDED"), TaskState::Succeeded);
        assert_eq!(TaskState::from_wire("FAILED"), TaskState::Failed);
        assert_eq!(TaskState::from_wire("INACTIVE"), TaskState::Inactive);
        assert_eq!(TaskState::from_wire("ACTIVE"), TaskState::Active);
        assert_eq!(TaskState::from_wire("something-new"), TaskState::Active);
    }

    #[test]
    fn test_activation_status() {
        let ok = ActivationStatus { code: 200, message: "activated".into() };
        assert!(ok.is_ok());
        let denied = ActivationStatus { code: 403, message: "denied".into() };
        assert!(!denied.is_ok());
    }
}
