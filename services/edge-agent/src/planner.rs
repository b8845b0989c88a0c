//! Compute the actions that bring a pod to its desired state.
//!
//! Planning is read-only: it inspects the indexed container and the latest
//! liveness result but never mutates runtime or agent state. Running it
//! twice against the same runtime state yields the same plan.

use std::collections::BTreeMap;
use std::fmt;

use edged_reconcile::SpecHash;
use tracing::{debug, info, warn};

use crate::engine::ContainerEngine;
use crate::pod::{Pod, RestartPolicy};
use crate::runtime::{ContainerId, ContainerState, ContainerStatus};

/// Why a container is being killed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillReason {
    /// The desired spec no longer matches the one the container was created from.
    SpecChanged { current: SpecHash, desired: SpecHash },
    /// The most recent liveness probe failed.
    LivenessFailed,
}

impl fmt::Display for KillReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SpecChanged { current, desired } => write!(
                f,
                "container spec hash changed ({} vs {}), will be killed and re-created",
                current, desired
            ),
            Self::LivenessFailed => write!(f, "container failed liveness probe, will be killed"),
        }
    }
}

/// A container scheduled for killing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillInfo {
    /// Name of the container inside the pod.
    pub name: String,
    pub reason: KillReason,
    /// Stop the container but keep it and its index entry, so a pod that
    /// must not restart goes on reporting its terminated container.
    pub keep: bool,
}

/// The plan for one pod.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PodActions {
    /// Indices into the pod's containers to create and start.
    pub containers_to_start: Vec<usize>,

    /// Containers to stop (and, unless kept, remove), ordered by ID.
    pub containers_to_kill: BTreeMap<ContainerId, KillInfo>,

    /// Restart count for newly started containers.
    pub restart_count: u32,
}

impl PodActions {
    pub fn is_empty(&self) -> bool {
        self.containers_to_start.is_empty() && self.containers_to_kill.is_empty()
    }
}

/// Whether a container in the given observed state should be restarted.
///
/// `None` means the container is missing or its status is unknown.
pub fn should_restart(
    observed: Option<(ContainerState, i64)>,
    policy: RestartPolicy,
) -> bool {
    let Some((state, exit_code)) = observed else {
        return true;
    };
    match state {
        ContainerState::Running => false,
        ContainerState::Unknown | ContainerState::Created => true,
        ContainerState::Paused | ContainerState::Exited => match policy {
            RestartPolicy::Never => false,
            RestartPolicy::OnFailure => exit_code != 0,
            RestartPolicy::Always => true,
        },
    }
}

impl ContainerEngine {
    /// Plan the actions for `pod`.
    ///
    /// Only the pod's first container is managed.
    pub async fn plan(&self, pod: &Pod) -> PodActions {
        let mut actions = PodActions::default();

        let Some(container) = pod.containers.first() else {
            warn!(pod = %pod.full_name(), "Pod has no containers, nothing to plan");
            return actions;
        };
        if pod.containers.len() > 1 {
            warn!(
                pod = %pod.full_name(),
                containers = pod.containers.len(),
                "Only the first container of a pod is managed"
            );
        }

        let Some(handle) = self.index.get(&pod.uid).await else {
            debug!(pod = %pod.full_name(), "No container indexed, scheduling start");
            actions.containers_to_start.push(0);
            return actions;
        };

        let status = match self.runtime.inspect_container(&handle.container_id).await {
            Ok(status) => Some(status),
            Err(e) => {
                warn!(
                    pod = %pod.full_name(),
                    container_id = %handle.container_id.short(),
                    error = %e,
                    "Failed to inspect container, treating status as unknown"
                );
                None
            }
        };
        actions.restart_count = status
            .as_ref()
            .and_then(ContainerStatus::restart_count)
            .map_or(0, |n| n.saturating_add(1));

        let Some(current) = status.as_ref().filter(|s| s.state.is_running()) else {
            if should_restart(observed(status.as_ref()), pod.restart_policy) {
                info!(
                    pod = %pod.full_name(),
                    container = %container.name,
                    "Container is not running, scheduling restart"
                );
                actions.containers_to_start.push(0);
            }
            return actions;
        };

        let liveness_failed = self.liveness.is_failing(&current.id).await;
        let desired = container.spec_hash();
        let (reason, keep) = match current.spec_hash() {
            Some(current_hash) if current_hash != desired => {
                actions.containers_to_start.push(0);
                let reason = KillReason::SpecChanged {
                    current: current_hash,
                    desired,
                };
                (reason, false)
            }
            _ if liveness_failed => {
                let restart = pod.restart_policy != RestartPolicy::Never;
                if restart {
                    actions.containers_to_start.push(0);
                }
                (KillReason::LivenessFailed, !restart)
            }
            Some(_) => return actions,
            None => {
                warn!(
                    pod = %pod.full_name(),
                    container = %container.name,
                    container_id = %current.id.short(),
                    "Running container has no valid spec hash label, leaving it alone"
                );
                return actions;
            }
        };

        info!(
            pod = %pod.full_name(),
            container = %container.name,
            container_id = %current.id.short(),
            reason = %reason,
            keep,
            "Scheduling container kill"
        );
        actions.containers_to_kill.insert(
            current.id.clone(),
            KillInfo {
                name: container.name.clone(),
                reason,
                keep,
            },
        );

        actions
    }
}

fn observed(status: Option<&ContainerStatus>) -> Option<(ContainerState, i64)> {
    status.map(|s| (s.state, s.exit_code))
}
