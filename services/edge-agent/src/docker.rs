//! Docker Engine API client.
//!
//! Talks to the Docker daemon over its Unix socket and implements
//! [`ContainerRuntime`]. Every call is bounded by a request timeout; stops
//! get the grace period on top of it.
//!
//! Reference: https://docs.docker.com/engine/api/v1.43/

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use hyper::{body::Buf, Body, Client, Method, Request, StatusCode};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

use crate::runtime::{
    ContainerId, ContainerRuntime, ContainerState, ContainerStatus, ContainerSummary,
    CreateContainerRequest, RuntimeError, RuntimeResult, CONTAINER_NAME_LABEL,
};

/// Errors from the Docker API.
#[derive(Debug, Error)]
pub enum DockerError {
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("request error: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

impl DockerError {
    /// Map to a runtime error; a 404 for `id` becomes [`RuntimeError::NotFound`].
    fn into_runtime(self, id: Option<&ContainerId>) -> RuntimeError {
        match (self, id) {
            (Self::Api { status: 404, .. }, Some(id)) => RuntimeError::NotFound(id.clone()),
            (Self::Api { status, message }, _) => RuntimeError::Rejected { status, message },
            (Self::Http(e), _) => RuntimeError::Unavailable(e.to_string()),
            (Self::Request(e), _) => RuntimeError::Unavailable(e.to_string()),
            (Self::Json(e), _) => RuntimeError::Decode(e.to_string()),
            (Self::Timeout(after), _) => RuntimeError::Timeout(after),
        }
    }
}

/// Docker client for Unix socket communication.
pub struct DockerRuntime {
    socket_path: String,
    client: Client<UnixConnector>,
    request_timeout: Duration,
}

impl DockerRuntime {
    /// Create a new client for the given socket path.
    pub fn new<P: AsRef<Path>>(socket_path: P, request_timeout: Duration) -> Self {
        let socket_path = socket_path.as_ref().to_string_lossy().to_string();
        let client = Client::unix();
        Self {
            socket_path,
            client,
            request_timeout,
        }
    }

    /// Check if the socket exists.
    pub fn socket_exists(&self) -> bool {
        Path::new(&self.socket_path).exists()
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<(StatusCode, hyper::body::Bytes), DockerError> {
        let uri = Uri::new(&self.socket_path, path);

        debug!(method = %method, path = path, "Request to Docker API");

        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("Accept", "application/json");
        let request = match body {
            Some(bytes) => builder
                .header("Content-Type", "application/json")
                .body(Body::from(bytes))?,
            None => builder.body(Body::empty())?,
        };

        let exchange = async {
            let response = self.client.request(request).await?;
            let status = response.status();
            let bytes = hyper::body::to_bytes(response.into_body()).await?;
            Ok::<_, DockerError>((status, bytes))
        };

        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| DockerError::Timeout(timeout))?
    }

    /// Send a request and fail on any status other than success or `allowed`.
    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
        timeout: Duration,
        allowed: &[StatusCode],
    ) -> Result<hyper::body::Bytes, DockerError> {
        let (status, bytes) = self.send(method, path, body, timeout).await?;
        if status.is_success() || allowed.contains(&status) {
            return Ok(bytes);
        }

        let message = error_message(&bytes);
        if status != StatusCode::NOT_FOUND {
            error!(status = %status, path = path, message = %message, "Docker API error");
        }
        Err(DockerError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, DockerError> {
        let bytes = self
            .call(Method::GET, path, None, self.request_timeout, &[])
            .await?;
        Ok(serde_json::from_reader(bytes.reader())?)
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_containers(&self) -> RuntimeResult<Vec<ContainerSummary>> {
        let entries: Vec<ListEntry> = self
            .get("/containers/json?all=true")
            .await
            .map_err(|e| e.into_runtime(None))?;
        Ok(entries.into_iter().map(ListEntry::into_summary).collect())
    }

    async fn inspect_container(&self, id: &ContainerId) -> RuntimeResult<ContainerStatus> {
        let path = format!("/containers/{}/json", encode_path_segment(id.as_str()));
        let inspect: InspectResponse = self
            .get(&path)
            .await
            .map_err(|e| e.into_runtime(Some(id)))?;
        Ok(inspect.into_status())
    }

    async fn create_container(
        &self,
        request: &CreateContainerRequest,
    ) -> RuntimeResult<ContainerId> {
        let body = serde_json::to_vec(&CreateBody::from_request(request))
            .map_err(|e| RuntimeError::Decode(e.to_string()))?;
        let path = format!("/containers/create?name={}", encode_query_value(&request.name));

        let bytes = self
            .call(Method::POST, &path, Some(body), self.request_timeout, &[])
            .await
            .map_err(|e| e.into_runtime(None))?;
        let created: CreateResponse = serde_json::from_reader(bytes.reader())
            .map_err(|e| RuntimeError::Decode(e.to_string()))?;

        for warning in created.warnings.iter().flatten() {
            debug!(name = %request.name, warning = %warning, "Docker create warning");
        }
        Ok(ContainerId::new(created.id))
    }

    async fn start_container(&self, id: &ContainerId) -> RuntimeResult<()> {
        let path = format!("/containers/{}/start", encode_path_segment(id.as_str()));
        self.call(
            Method::POST,
            &path,
            None,
            self.request_timeout,
            &[StatusCode::NOT_MODIFIED],
        )
        .await
        .map(|_| ())
        .map_err(|e| e.into_runtime(Some(id)))
    }

    async fn stop_container(&self, id: &ContainerId, grace: Duration) -> RuntimeResult<()> {
        let path = format!(
            "/containers/{}/stop?t={}",
            encode_path_segment(id.as_str()),
            grace.as_secs()
        );
        self.call(
            Method::POST,
            &path,
            None,
            self.request_timeout.saturating_add(grace),
            &[StatusCode::NOT_MODIFIED],
        )
        .await
        .map(|_| ())
        .map_err(|e| e.into_runtime(Some(id)))
    }

    async fn remove_container(&self, id: &ContainerId) -> RuntimeResult<()> {
        let path = format!("/containers/{}", encode_path_segment(id.as_str()));
        self.call(Method::DELETE, &path, None, self.request_timeout, &[])
            .await
            .map(|_| ())
            .map_err(|e| e.into_runtime(Some(id)))
    }
}

/// Entry of `GET /containers/json`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListEntry {
    id: String,
    #[serde(default)]
    created: i64,
    #[serde(default)]
    status: String,
}

impl ListEntry {
    fn into_summary(self) -> ContainerSummary {
        ContainerSummary {
            id: ContainerId::new(self.id),
            created_at: DateTime::from_timestamp(self.created, 0).unwrap_or_default(),
            state: ContainerState::from_status_text(&self.status),
        }
    }
}

/// Body of `GET /containers/{id}/json`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectResponse {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    created: String,
    #[serde(default)]
    image: String,
    #[serde(default)]
    state: InspectState,
    #[serde(default)]
    config: InspectConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    #[serde(default)]
    status: String,
    #[serde(default)]
    exit_code: i64,
    #[serde(default)]
    error: String,
    #[serde(default)]
    started_at: String,
    #[serde(default)]
    finished_at: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    image: String,
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
}

impl InspectResponse {
    fn into_status(self) -> ContainerStatus {
        let labels = self.config.labels.unwrap_or_default();
        let name = labels
            .get(CONTAINER_NAME_LABEL)
            .cloned()
            .unwrap_or_else(|| self.name.trim_start_matches('/').to_string());
        let image = if self.config.image.is_empty() {
            self.image
        } else {
            self.config.image
        };
        let reason = Some(self.state.error).filter(|e| !e.is_empty());

        ContainerStatus {
            id: ContainerId::new(self.id),
            name,
            image,
            state: ContainerState::from_state_name(&self.state.status),
            exit_code: self.state.exit_code,
            created_at: parse_time(&self.created).unwrap_or_default(),
            started_at: parse_time(&self.state.started_at),
            finished_at: parse_time(&self.state.finished_at),
            reason,
            labels,
        }
    }
}

/// Parse an RFC 3339 timestamp; empty strings and the zero time are `None`.
fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(s).ok()?.with_timezone(&Utc);
    (parsed.year() > 1).then_some(parsed)
}

/// Body of `POST /containers/create`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct CreateBody<'a> {
    hostname: &'a str,
    image: &'a str,
    #[serde(skip_serializing_if = "is_empty_slice")]
    entrypoint: &'a [String],
    #[serde(skip_serializing_if = "is_empty_slice")]
    cmd: &'a [String],
    env: &'a [String],
    labels: &'a BTreeMap<String, String>,
    exposed_ports: BTreeMap<&'a str, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    working_dir: Option<&'a str>,
    host_config: HostConfig<'a>,
}

fn is_empty_slice(v: &&[String]) -> bool {
    v.is_empty()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct HostConfig<'a> {
    network_mode: &'a str,
    memory: i64,
    memory_swap: i64,
    cpu_shares: i64,
    cpu_quota: i64,
    cpu_period: i64,
}

impl<'a> CreateBody<'a> {
    fn from_request(request: &'a CreateContainerRequest) -> Self {
        Self {
            hostname: &request.hostname,
            image: &request.image,
            entrypoint: &request.entrypoint,
            cmd: &request.cmd,
            env: &request.env,
            labels: &request.labels,
            exposed_ports: request
                .exposed_ports
                .iter()
                .map(|p| (p.as_str(), serde_json::json!({})))
                .collect(),
            working_dir: request.working_dir.as_deref(),
            host_config: HostConfig {
                network_mode: &request.network_mode,
                memory: request.resources.memory,
                memory_swap: request.resources.memory_swap,
                cpu_shares: request.resources.cpu_shares,
                cpu_quota: request.resources.cpu_quota,
                cpu_period: request.resources.cpu_period,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateResponse {
    id: String,
    #[serde(default)]
    warnings: Option<Vec<String>>,
}

/// Docker reports errors as `{"message": "..."}`.
fn error_message(body: &[u8]) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        message: String,
    }
    serde_json::from_slice::<ErrorBody>(body)
        .map(|b| b.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).trim().to_string())
}

fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~')
}

fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for &b in s.as_bytes() {
        if is_unreserved(b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

fn encode_query_value(s: &str) -> String {
    percent_encode(s)
}

fn encode_path_segment(s: &str) -> String {
    percent_encode(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{RuntimeResources, POD_UID_LABEL};
    use std::collections::BTreeSet;

    #[test]
    fn test_decode_list_entries() {
        let body = r#"[
            {"Id": "aaa", "Created": 1700000000, "Status": "Up 5 minutes", "Names": ["/web"]},
            {"Id": "bbb", "Created": 1700000100, "Status": "Exited (1) 3 seconds ago"},
            {"Id": "ccc", "Created": 1700000200, "Status": "Up 1 hour (Paused)"}
        ]"#;
        let entries: Vec<ListEntry> = serde_json::from_str(body).unwrap();
        let summaries: Vec<_> = entries.into_iter().map(ListEntry::into_summary).collect();

        assert_eq!(summaries[0].id, ContainerId::from("aaa"));
        assert_eq!(summaries[0].state, ContainerState::Running);
        assert_eq!(
            summaries[0].created_at,
            DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()
        );
        assert_eq!(summaries[1].state, ContainerState::Exited);
        assert_eq!(summaries[2].state, ContainerState::Paused);
    }

    #[test]
    fn test_decode_inspect() {
        let body = r#"{
            "Id": "abc123",
            "Name": "/k8s_web_gateway_edge_uid-1_0",
            "Created": "2024-03-01T10:00:00.123456789Z",
            "Image": "sha256:deadbeef",
            "State": {
                "Status": "exited",
                "ExitCode": 2,
                "Error": "",
                "StartedAt": "2024-03-01T10:00:01Z",
                "FinishedAt": "2024-03-01T10:05:00Z"
            },
            "Config": {
                "Image": "nginx:1.25",
                "Labels": {
                    "io.kubernetes.pod.uid": "uid-1",
                    "io.kubernetes.container.name": "web"
                }
            }
        }"#;
        let inspect: InspectResponse = serde_json::from_str(body).unwrap();
        let status = inspect.into_status();

        assert_eq!(status.id, ContainerId::from("abc123"));
        assert_eq!(status.name, "web");
        assert_eq!(status.image, "nginx:1.25");
        assert_eq!(status.state, ContainerState::Exited);
        assert_eq!(status.exit_code, 2);
        assert!(status.started_at.is_some());
        assert!(status.finished_at.is_some());
        assert_eq!(status.reason, None);
        assert_eq!(status.label(POD_UID_LABEL), Some("uid-1"));
    }

    #[test]
    fn test_decode_inspect_zero_times() {
        let body = r#"{
            "Id": "abc123",
            "Name": "/plain",
            "Created": "2024-03-01T10:00:00Z",
            "State": {
                "Status": "created",
                "ExitCode": 128,
                "Error": "exec: \"nope\": executable file not found",
                "StartedAt": "0001-01-01T00:00:00Z",
                "FinishedAt": "0001-01-01T00:00:00Z"
            },
            "Config": {"Labels": null}
        }"#;
        let status = serde_json::from_str::<InspectResponse>(body)
            .unwrap()
            .into_status();

        assert_eq!(status.name, "plain");
        assert_eq!(status.started_at, None);
        assert_eq!(status.finished_at, None);
        assert!(status.never_ran());
        assert!(status.reason.unwrap().contains("executable file not found"));
        assert!(status.labels.is_empty());
    }

    #[test]
    fn test_encode_create_body() {
        let request = CreateContainerRequest {
            name: "k8s_web".to_string(),
            hostname: "edge-1".to_string(),
            image: "nginx:1.25".to_string(),
            entrypoint: vec![],
            cmd: vec!["nginx".to_string()],
            env: vec!["A=1".to_string()],
            labels: BTreeMap::from([(POD_UID_LABEL.to_string(), "uid-1".to_string())]),
            exposed_ports: BTreeSet::from(["80/tcp".to_string()]),
            working_dir: None,
            network_mode: "host".to_string(),
            resources: RuntimeResources {
                memory: 1024,
                memory_swap: 0,
                cpu_shares: 512,
                cpu_quota: 50_000,
                cpu_period: 100_000,
            },
        };

        let json = serde_json::to_value(CreateBody::from_request(&request)).unwrap();

        assert_eq!(json["Hostname"], "edge-1");
        assert_eq!(json["Cmd"], serde_json::json!(["nginx"]));
        assert!(json.get("Entrypoint").is_none());
        assert!(json.get("WorkingDir").is_none());
        assert_eq!(json["ExposedPorts"], serde_json::json!({"80/tcp": {}}));
        assert_eq!(json["Labels"]["io.kubernetes.pod.uid"], "uid-1");
        assert_eq!(json["HostConfig"]["NetworkMode"], "host");
        assert_eq!(json["HostConfig"]["CpuShares"], 512);
        assert_eq!(json["HostConfig"]["CpuQuota"], 50_000);
        assert_eq!(json["HostConfig"]["Memory"], 1024);
    }

    #[test]
    fn test_error_message() {
        assert_eq!(
            error_message(br#"{"message": "No such container: x"}"#),
            "No such container: x"
        );
        assert_eq!(error_message(b"plain failure\n"), "plain failure");
    }

    #[test]
    fn test_not_found_maps_to_runtime_not_found() {
        let id = ContainerId::from("abc");
        let err = DockerError::Api {
            status: 404,
            message: "No such container".to_string(),
        };
        assert_eq!(err.into_runtime(Some(&id)), RuntimeError::NotFound(id));

        let err = DockerError::Api {
            status: 404,
            message: "No such image".to_string(),
        };
        assert!(matches!(
            err.into_runtime(None),
            RuntimeError::Rejected { status: 404, .. }
        ));
    }

    #[test]
    fn test_percent_encode() {
        assert_eq!(encode_query_value("k8s_web_pod_ns_uid_0"), "k8s_web_pod_ns_uid_0");
        assert_eq!(encode_query_value("a b/c"), "a%20b%2Fc");
    }
}
