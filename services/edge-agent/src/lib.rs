//! Edge agent library.
//!
//! Converges the containers running on an edge node toward the pods desired
//! for it. The [`ContainerEngine`] plans and applies per-pod actions against a
//! [`ContainerRuntime`], tracks every container it has seen, and evicts
//! containers that no longer belong to a desired pod.
//!
//! ## Architecture
//!
//! - **Planner** (`planner`): decides which containers to start and kill
//! - **Executor** (`executor`): applies a plan with per-pod start backoff
//! - **Garbage collector** (`gc`): detects, selects and evicts containers
//! - **Records** (`records`): container records and the pod index
//! - **Status** (`status`): runtime state to pod phase
//! - **Runtime** (`runtime`, `docker`): the container engine interface and
//!   its Docker implementation
//! - **Workers** (`workers`, `sync_loop`): background pools and loops that
//!   drive the engine from a pod manifest

pub mod config;
pub mod container_config;
pub mod docker;
pub mod engine;
pub mod error;
pub mod executor;
pub mod gc;
pub mod liveness;
pub mod manifest;
pub mod planner;
pub mod pod;
pub mod quantity;
pub mod records;
pub mod runtime;
pub mod status;
pub mod sync_loop;
pub mod workers;

pub use engine::{ContainerEngine, EngineConfig};
pub use error::{EngineError, EvictionFailure};
pub use gc::{GcPolicy, GcReport};
pub use liveness::{LivenessResults, ProbeResult};
pub use planner::{KillInfo, KillReason, PodActions};
pub use pod::{ContainerSpec, Pod, PodUid, RestartPolicy};
pub use runtime::{
    ContainerId, ContainerRuntime, ContainerState, ContainerStatus, MockRuntime, RuntimeError,
};
pub use status::{to_pod_phase, PodPhase, PodStatus};
