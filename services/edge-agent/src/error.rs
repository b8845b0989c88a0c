//! Engine errors.

use std::time::Duration;

use thiserror::Error;

use crate::pod::PodUid;
use crate::runtime::{ContainerId, RuntimeError};

/// A container the garbage collector failed to evict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionFailure {
    pub container_id: ContainerId,
    pub error: RuntimeError,
}

/// Errors surfaced by the reconciliation engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("back-off starting pod {pod}, retry in {remaining:?}")]
    BackoffActive { pod: String, remaining: Duration },

    #[error("invalid port for container {container}: {reason}")]
    InvalidPort { container: String, reason: String },

    #[error("invalid {resource} quantity {quantity:?} for container {container}: {reason}")]
    InvalidQuantity {
        container: String,
        resource: &'static str,
        quantity: String,
        reason: String,
    },

    #[error("container {container_id} for pod {pod} was created but failed to start: {source}")]
    StartFailed {
        pod: String,
        container_id: ContainerId,
        #[source]
        source: RuntimeError,
    },

    #[error("no container indexed for pod {0}")]
    PodNotFound(PodUid),

    #[error("failed to evict {} container(s), {aborted} eviction task(s) aborted", .failures.len())]
    GarbageCollection {
        failures: Vec<EvictionFailure>,
        aborted: usize,
    },
}

impl EngineError {
    /// Whether this is a backoff skip rather than a real failure.
    pub fn is_backoff(&self) -> bool {
        matches!(self, Self::BackoffActive { .. })
    }
}
