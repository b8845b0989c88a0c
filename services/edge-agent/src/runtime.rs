//! Container runtime interface and mock implementation.
//!
//! The runtime interface abstracts the container engine operations the
//! agent relies on:
//! - Listing, inspecting, creating, starting, stopping and removing containers
//!
//! Runtime-native status text is decoded into [`ContainerState`] once, at
//! this boundary. A mock implementation is provided for testing and
//! development.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use edged_reconcile::{Clock, SpecHash, SystemClock};
use thiserror::Error;
use tracing::{debug, info};

use crate::pod::PodUid;

/// Label carrying the pod name.
pub const POD_NAME_LABEL: &str = "io.kubernetes.pod.name";
/// Label carrying the pod namespace.
pub const POD_NAMESPACE_LABEL: &str = "io.kubernetes.pod.namespace";
/// Label carrying the pod UID.
pub const POD_UID_LABEL: &str = "io.kubernetes.pod.uid";
/// Label carrying the container name inside the pod.
pub const CONTAINER_NAME_LABEL: &str = "io.kubernetes.container.name";
/// Label carrying the spec hash the container was created from.
pub const CONTAINER_HASH_LABEL: &str = "io.kubernetes.container.hash";
/// Label carrying the restart count the container was created with.
pub const CONTAINER_RESTART_COUNT_LABEL: &str = "io.kubernetes.container.restartCount";

/// Runtime-assigned container identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContainerId(String);

impl ContainerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 characters, as shown by most container tooling.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContainerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Observed container state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ContainerState {
    #[default]
    Unknown,
    Created,
    Running,
    Paused,
    Exited,
}

impl ContainerState {
    /// Decode a human-readable status line such as `Up 3 hours (Paused)` or
    /// `Exited (1) 2 minutes ago`.
    pub fn from_status_text(text: &str) -> Self {
        let text = text.trim();
        if text.starts_with("Up") {
            if text.ends_with("(Paused)") || text.ends_with("Paused") {
                Self::Paused
            } else {
                Self::Running
            }
        } else if text.starts_with("Exited") {
            Self::Exited
        } else if text.starts_with("Created") {
            Self::Created
        } else {
            Self::Unknown
        }
    }

    /// Decode a machine-readable state such as `running` or `exited`.
    pub fn from_state_name(name: &str) -> Self {
        match name {
            "created" => Self::Created,
            "running" | "restarting" => Self::Running,
            "paused" => Self::Paused,
            "exited" | "dead" => Self::Exited,
            _ => Self::Unknown,
        }
    }

    pub fn is_running(self) -> bool {
        self == Self::Running
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Exited => "exited",
        };
        f.write_str(s)
    }
}

/// Entry returned by [`ContainerRuntime::list_containers`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: ContainerId,
    pub created_at: DateTime<Utc>,
    pub state: ContainerState,
}

/// Detailed container status returned by [`ContainerRuntime::inspect_container`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerStatus {
    pub id: ContainerId,
    pub name: String,
    pub image: String,
    pub state: ContainerState,
    pub exit_code: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Runtime-reported failure reason, if any.
    pub reason: Option<String>,
    pub labels: HashMap<String, String>,
}

impl ContainerStatus {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    /// Pod the container belongs to, if it carries a non-empty pod UID label.
    pub fn pod_uid(&self) -> Option<PodUid> {
        self.label(POD_UID_LABEL)
            .filter(|uid| !uid.is_empty())
            .map(PodUid::from)
    }

    /// Restart count recorded at creation, if present and well formed.
    pub fn restart_count(&self) -> Option<u32> {
        self.label(CONTAINER_RESTART_COUNT_LABEL)
            .and_then(|v| v.parse().ok())
    }

    /// Spec hash recorded at creation, if present and well formed.
    pub fn spec_hash(&self) -> Option<SpecHash> {
        self.label(CONTAINER_HASH_LABEL)
            .and_then(|v| SpecHash::parse(v).ok())
    }

    /// A created container that carries a failure exit code but never
    /// finished never actually ran.
    pub fn never_ran(&self) -> bool {
        self.state == ContainerState::Created && self.exit_code != 0 && self.finished_at.is_none()
    }
}

/// Resource settings applied to a new container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuntimeResources {
    /// Memory limit in bytes; zero means unlimited.
    pub memory: i64,
    /// Memory plus swap limit; zero leaves swap unset.
    pub memory_swap: i64,
    pub cpu_shares: i64,
    /// CPU quota per period in microseconds; zero means unlimited.
    pub cpu_quota: i64,
    pub cpu_period: i64,
}

/// Everything the runtime needs to create a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateContainerRequest {
    pub name: String,
    pub hostname: String,
    pub image: String,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    /// `KEY=value` pairs.
    pub env: Vec<String>,
    pub labels: BTreeMap<String, String>,
    /// `port/proto` entries, e.g. `80/tcp`.
    pub exposed_ports: BTreeSet<String>,
    pub working_dir: Option<String>,
    pub network_mode: String,
    pub resources: RuntimeResources,
}

/// Runtime errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("container {0} not found")]
    NotFound(ContainerId),

    #[error("runtime unavailable: {0}")]
    Unavailable(String),

    #[error("runtime rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("runtime call timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed runtime response: {0}")]
    Decode(String),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Container runtime interface.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// List all containers, running or not.
    async fn list_containers(&self) -> RuntimeResult<Vec<ContainerSummary>>;

    /// Inspect a single container.
    async fn inspect_container(&self, id: &ContainerId) -> RuntimeResult<ContainerStatus>;

    /// Create (but do not start) a container.
    async fn create_container(&self, request: &CreateContainerRequest)
        -> RuntimeResult<ContainerId>;

    /// Start a created container.
    async fn start_container(&self, id: &ContainerId) -> RuntimeResult<()>;

    /// Stop a container, killing it once `grace` has elapsed.
    async fn stop_container(&self, id: &ContainerId, grace: Duration) -> RuntimeResult<()>;

    /// Remove a stopped container.
    async fn remove_container(&self, id: &ContainerId) -> RuntimeResult<()>;
}

/// A call made against [`MockRuntime`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    List,
    Inspect(ContainerId),
    Create(String),
    Start(ContainerId),
    Stop(ContainerId),
    Remove(ContainerId),
}

impl RuntimeCall {
    /// Calls that change runtime state.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Self::Create(_) | Self::Start(_) | Self::Stop(_) | Self::Remove(_)
        )
    }
}

#[derive(Debug, Default)]
struct MockState {
    containers: BTreeMap<ContainerId, ContainerStatus>,
    calls: Vec<RuntimeCall>,
    fail_list: bool,
    fail_create: bool,
    fail_start: bool,
    fail_stop: HashSet<ContainerId>,
    fail_remove: HashSet<ContainerId>,
    fail_inspect: HashSet<ContainerId>,
}

/// In-memory runtime for testing and development.
///
/// Containers live in a map; failures can be injected per operation and
/// every call is recorded.
#[derive(Debug)]
pub struct MockRuntime {
    /// Counter for generating container IDs.
    id_counter: AtomicU64,
    clock: Arc<dyn Clock>,
    state: Mutex<MockState>,
}

impl MockRuntime {
    /// Create an empty mock runtime backed by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty mock runtime that timestamps containers with `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            id_counter: AtomicU64::new(0),
            clock,
            state: Mutex::new(MockState::default()),
        }
    }

    /// Create a mock runtime that fails all creates.
    pub fn failing() -> Self {
        let runtime = Self::new();
        runtime.set_fail_create(true);
        runtime
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_id(&self) -> ContainerId {
        let counter = self.id_counter.fetch_add(1, Ordering::SeqCst);
        ContainerId::new(format!("mock{:060x}", counter))
    }

    pub fn set_fail_list(&self, fail: bool) {
        self.lock().fail_list = fail;
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.lock().fail_create = fail;
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.lock().fail_start = fail;
    }

    pub fn fail_stop_for(&self, id: &ContainerId) {
        self.lock().fail_stop.insert(id.clone());
    }

    pub fn fail_remove_for(&self, id: &ContainerId) {
        self.lock().fail_remove.insert(id.clone());
    }

    pub fn fail_inspect_for(&self, id: &ContainerId) {
        self.lock().fail_inspect.insert(id.clone());
    }

    /// Clear all injected failures.
    pub fn heal(&self) {
        let mut state = self.lock();
        state.fail_list = false;
        state.fail_create = false;
        state.fail_start = false;
        state.fail_stop.clear();
        state.fail_remove.clear();
        state.fail_inspect.clear();
    }

    /// Add a container directly, bypassing create.
    pub fn insert_container(&self, status: ContainerStatus) {
        self.lock().containers.insert(status.id.clone(), status);
    }

    /// Change a container's state, as if it had crashed or been paused.
    pub fn set_container_state(&self, id: &ContainerId, state: ContainerState, exit_code: i64) {
        let now = self.clock.now();
        if let Some(container) = self.lock().containers.get_mut(id) {
            container.state = state;
            container.exit_code = exit_code;
            if state == ContainerState::Exited {
                container.finished_at = Some(now);
            }
        }
    }

    /// Current status of a container, without recording a call.
    pub fn container(&self, id: &ContainerId) -> Option<ContainerStatus> {
        self.lock().containers.get(id).cloned()
    }

    /// IDs of all containers, without recording a call.
    pub fn container_ids(&self) -> Vec<ContainerId> {
        self.lock().containers.keys().cloned().collect()
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.lock().calls.clone()
    }

    /// Calls that changed runtime state.
    pub fn mutations(&self) -> Vec<RuntimeCall> {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.is_mutation())
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

fn injected(operation: &str) -> RuntimeError {
    RuntimeError::Unavailable(format!("mock runtime configured to fail {}", operation))
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn list_containers(&self) -> RuntimeResult<Vec<ContainerSummary>> {
        tokio::task::yield_now().await;

        let mut state = self.lock();
        state.calls.push(RuntimeCall::List);
        if state.fail_list {
            return Err(injected("list"));
        }

        Ok(state
            .containers
            .values()
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                created_at: c.created_at,
                state: c.state,
            })
            .collect())
    }

    async fn inspect_container(&self, id: &ContainerId) -> RuntimeResult<ContainerStatus> {
        tokio::task::yield_now().await;

        let mut state = self.lock();
        state.calls.push(RuntimeCall::Inspect(id.clone()));
        if state.fail_inspect.contains(id) {
            return Err(injected("inspect"));
        }

        state
            .containers
            .get(id)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(id.clone()))
    }

    async fn create_container(
        &self,
        request: &CreateContainerRequest,
    ) -> RuntimeResult<ContainerId> {
        tokio::task::yield_now().await;

        let now = self.clock.now();
        let mut state = self.lock();
        state.calls.push(RuntimeCall::Create(request.name.clone()));
        if state.fail_create {
            return Err(injected("create"));
        }
        if state.containers.values().any(|c| c.name == request.name) {
            return Err(RuntimeError::Rejected {
                status: 409,
                message: format!("container name {} already in use", request.name),
            });
        }

        let id = self.next_id();
        info!(
            container_id = %id.short(),
            name = %request.name,
            image = %request.image,
            "[MOCK] Created container"
        );

        state.containers.insert(
            id.clone(),
            ContainerStatus {
                id: id.clone(),
                name: request.name.clone(),
                image: request.image.clone(),
                state: ContainerState::Created,
                exit_code: 0,
                created_at: now,
                started_at: None,
                finished_at: None,
                reason: None,
                labels: request
                    .labels
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            },
        );

        Ok(id)
    }

    async fn start_container(&self, id: &ContainerId) -> RuntimeResult<()> {
        tokio::task::yield_now().await;

        let now = self.clock.now();
        let mut state = self.lock();
        state.calls.push(RuntimeCall::Start(id.clone()));
        let fail = state.fail_start;

        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.clone()))?;
        if fail {
            container.exit_code = 128;
            container.reason = Some("mock start failure".to_string());
            return Err(injected("start"));
        }

        container.state = ContainerState::Running;
        container.exit_code = 0;
        container.started_at = Some(now);
        container.finished_at = None;
        debug!(container_id = %id.short(), "[MOCK] Started container");
        Ok(())
    }

    async fn stop_container(&self, id: &ContainerId, grace: Duration) -> RuntimeResult<()> {
        tokio::task::yield_now().await;

        let now = self.clock.now();
        let mut state = self.lock();
        state.calls.push(RuntimeCall::Stop(id.clone()));
        if state.fail_stop.contains(id) {
            return Err(injected("stop"));
        }

        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.clone()))?;
        if container.state.is_running() || container.state == ContainerState::Paused {
            container.state = ContainerState::Exited;
            container.finished_at = Some(now);
        }
        debug!(
            container_id = %id.short(),
            grace_secs = grace.as_secs(),
            "[MOCK] Stopped container"
        );
        Ok(())
    }

    async fn remove_container(&self, id: &ContainerId) -> RuntimeResult<()> {
        tokio::task::yield_now().await;

        let mut state = self.lock();
        state.calls.push(RuntimeCall::Remove(id.clone()));
        if state.fail_remove.contains(id) {
            return Err(injected("remove"));
        }

        state
            .containers
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::NotFound(id.clone()))?;
        debug!(container_id = %id.short(), "[MOCK] Removed container");
        Ok(())
    }
}
