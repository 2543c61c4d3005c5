//! Blocking client for the Globus Transfer REST API.
//!
//! Only the handful of calls the filesystem bridge needs are implemented:
//! submission IDs, endpoint activation, directory listing, transfer and
//! delete submission, task polling and mkdir.

use crate::error::{GatewayError, GatewayResult};
use crate::gateway::TransferGateway;
use crate::types::{
    ActivationStatus, EntryKind, ListingEntry, SubmissionId, TaskId, TaskState, TaskStatus,
    TransferItem,
};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};
use tracing::{debug, trace, warn};
use url::Url;

/// Default Transfer API base URL.
pub const DEFAULT_BASE_URL: &str = "https://transfer.api.globus.org/v0.10/";

/// Default timeout for a single HTTP request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct SubmissionIdResponse {
    value: String,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(rename = "DATA")]
    data: Vec<ListEntryWire>,
}

#[derive(Debug, Deserialize)]
struct ListEntryWire {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    permissions: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    last_modified: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TaskIdResponse {
    task_id: String,
}

#[derive(Debug, Deserialize)]
struct TaskResponse {
    status: String,
    #[serde(default)]
    completion_time: Option<String>,
}

#[derive(Debug, Serialize)]
struct TransferItemWire<'a> {
    #[serde(rename = "DATA_TYPE")]
    data_type: &'static str,
    source_path: &'a str,
    destination_path: &'a str,
    recursive: bool,
}

#[derive(Debug, Serialize)]
struct TransferRequest<'a> {
    #[serde(rename = "DATA_TYPE")]
    data_type: &'static str,
    submission_id: &'a str,
    source_endpoint: &'a str,
    destination_endpoint: &'a str,
    #[serde(rename = "DATA")]
    data: Vec<TransferItemWire<'a>>,
}

#[derive(Debug, Serialize)]
struct DeleteItemWire<'a> {
    #[serde(rename = "DATA_TYPE")]
    data_type: &'static str,
    path: &'a str,
}

#[derive(Debug, Serialize)]
struct DeleteRequest<'a> {
    #[serde(rename = "DATA_TYPE")]
    data_type: &'static str,
    submission_id: &'a str,
    endpoint: &'a str,
    recursive: bool,
    #[serde(rename = "DATA")]
    data: Vec<DeleteItemWire<'a>>,
}

#[derive(Debug, Serialize)]
struct MkdirRequest<'a> {
    #[serde(rename = "DATA_TYPE")]
    data_type: &'static str,
    path: &'a str,
}

/// Transfer gateway talking to the Globus Transfer service over HTTPS.
pub struct GlobusGateway {
    client: Client,
    base_url: Url,
    token: SecretString,
}

impl std::fmt::Debug for GlobusGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobusGateway")
            .field("base_url", &self.base_url.as_str())
            .finish_non_exhaustive()
    }
}

impl GlobusGateway {
    /// Creates a client for the public Transfer API.
    pub fn new(token: SecretString) -> GatewayResult<Self> {
        Self::with_base_url(DEFAULT_BASE_URL, token, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Creates a client against a custom base URL (e.g. a test server).
    pub fn with_base_url(
        base_url: &str,
        token: SecretString,
        request_timeout: Duration,
    ) -> GatewayResult<Self> {
        let mut base_url =
            Url::parse(base_url).map_err(|e| GatewayError::Transport(format!("bad base URL: {e}")))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let client = Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("xferfs/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url,
            token,
        })
    }

    /// Builds an API URL from path segments, escaping each one.
    fn url(&self, segments: &[&str]) -> GatewayResult<Url> {
        let mut url = self.base_url.clone();
        {
            let mut parts = url
                .path_segments_mut()
                .map_err(|()| GatewayError::Transport("base URL cannot be a base".to_string()))?;
            parts.pop_if_empty();
            for segment in segments {
                parts.push(segment);
            }
        }
        Ok(url)
    }

    /// URL of the `ls` operation for `path` on `endpoint`.
    fn listing_url(&self, endpoint: &str, path: &str) -> GatewayResult<Url> {
        let mut url = self.url(&["operation", "endpoint", endpoint, "ls"])?;
        url.query_pairs_mut().append_pair("path", path);
        Ok(url)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.bearer_auth(self.token.expose_secret())
    }

    /// Sends a request and decodes a successful JSON body.
    fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> GatewayResult<T> {
        let response = self.authorized(request).send()?;
        let response = Self::check_status(response)?;
        Ok(response.json::<T>()?)
    }

    fn check_status(response: Response) -> GatewayResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response
            .json::<MessageResponse>()
            .ok()
            .and_then(|m| m.message.or(m.code))
            .unwrap_or_else(|| status.to_string());
        Err(GatewayError::Status {
            code: status.as_u16(),
            message,
        })
    }
}

/// Parses a timestamp in the formats the Transfer API uses.
fn parse_timestamp(raw: &str) -> Option<SystemTime> {
    let parsed = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%:z")
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .ok()?;
    Some(SystemTime::from(parsed.with_timezone(&Utc)))
}

fn listing_entry(wire: ListEntryWire) -> ListingEntry {
    let kind = if wire.kind == "dir" {
        EntryKind::Dir
    } else {
        EntryKind::File
    };
    let permissions = wire
        .permissions
        .as_deref()
        .and_then(ListingEntry::parse_permissions)
        .unwrap_or(match kind {
            EntryKind::Dir => 0o755,
            EntryKind::File => 0o644,
        });
    ListingEntry {
        name: wire.name,
        kind,
        permissions,
        size: wire.size.unwrap_or(0),
        last_modified: wire.last_modified.as_deref().and_then(parse_timestamp),
    }
}

impl TransferGateway for GlobusGateway {
    fn submission_id(&self) -> GatewayResult<SubmissionId> {
        let url = self.url(&["submission_id"])?;
        let body: SubmissionIdResponse = self.send_json(self.client.get(url))?;
        trace!(submission_id = %body.value, "Issued submission id");
        Ok(SubmissionId::new(body.value))
    }

    fn activate_endpoint(&self, endpoint: &str) -> GatewayResult<ActivationStatus> {
        let url = self.url(&["endpoint", endpoint, "autoactivate"])?;
        let response = self.authorized(self.client.post(url)).send()?;
        let code = response.status().as_u16();
        let body = response.json::<MessageResponse>().ok();
        let message = body
            .and_then(|m| m.message.or(m.code))
            .unwrap_or_default();
        debug!(endpoint, code, %message, "Endpoint autoactivate");
        Ok(ActivationStatus { code, message })
    }

    fn list_directory(&self, endpoint: &str, path: &str) -> GatewayResult<Vec<ListingEntry>> {
        let url = self.listing_url(endpoint, path)?;
        let request = self.client.get(url);
        let response = self.authorized(request).send()?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(GatewayError::NotFound {
                endpoint: endpoint.to_string(),
                path: path.to_string(),
            });
        }
        let body: ListResponse = Self::check_status(response)?.json()?;
        debug!(endpoint, path, count = body.data.len(), "Loaded directory listing");
        Ok(body.data.into_iter().map(listing_entry).collect())
    }

    fn submit_transfer(
        &self,
        submission_id: &SubmissionId,
        source: &str,
        destination: &str,
        items: &[TransferItem],
    ) -> GatewayResult<TaskId> {
        let request = TransferRequest {
            data_type: "transfer",
            submission_id: submission_id.as_str(),
            source_endpoint: source,
            destination_endpoint: destination,
            data: items
                .iter()
                .map(|item| TransferItemWire {
                    data_type: "transfer_item",
                    source_path: &item.source,
                    destination_path: &item.destination,
                    recursive: item.recursive,
                })
                .collect(),
        };
        let url = self.url(&["transfer"])?;
        let body: TaskIdResponse = self.send_json(self.client.post(url).json(&request))?;
        debug!(task = %body.task_id, source, destination, items = items.len(), "Submitted transfer");
        Ok(TaskId::new(body.task_id))
    }

    fn submit_delete(
        &self,
        submission_id: &SubmissionId,
        endpoint: &str,
        paths: &[String],
        recursive: bool,
    ) -> GatewayResult<TaskId> {
        let request = DeleteRequest {
            data_type: "delete",
            submission_id: submission_id.as_str(),
            endpoint,
            recursive,
            data: paths
                .iter()
                .map(|path| DeleteItemWire {
                    data_type: "delete_item",
                    path,
                })
                .collect(),
        };
        let url = self.url(&["delete"])?;
        let body: TaskIdResponse = self.send_json(self.client.post(url).json(&request))?;
        debug!(task = %body.task_id, endpoint, items = paths.len(), "Submitted delete");
        Ok(TaskId::new(body.task_id))
    }

    fn poll_task(&self, task_id: &TaskId) -> GatewayResult<TaskStatus> {
        let url = self.url(&["task", task_id.as_str()])?;
        let body: TaskResponse = self.send_json(self.client.get(url))?;
        let completion_time = match body.completion_time.as_deref() {
            Some(raw) => match parse_timestamp(raw) {
                Some(t) => Some(t),
                None => {
                    warn!(task = %task_id, raw, "Unparseable completion time, treating as now");
                    Some(SystemTime::now())
                }
            },
            None => None,
        };
        Ok(TaskStatus {
            state: TaskState::from_wire(&body.status),
            completion_time,
        })
    }

    fn make_directory(&self, endpoint: &str, path: &str) -> GatewayResult<()> {
        let url = self.url(&["operation", "endpoint", endpoint, "mkdir"])?;
        let request = MkdirRequest {
            data_type: "mkdir",
            path,
        };
        let body: MessageResponse = self.send_json(self.client.post(url).json(&request))?;
        debug!(endpoint, path, message = ?body.message, "Created remote directory");
        Ok(())
    }
}
