//! Translate runtime state into pod status.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::engine::ContainerEngine;
use crate::pod::{Pod, RestartPolicy};
use crate::runtime::{ContainerState, ContainerStatus};

/// Pod lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

/// Phase of a pod whose single container is in `status`.
pub fn to_pod_phase(status: &ContainerStatus, policy: RestartPolicy) -> PodPhase {
    match status.state {
        ContainerState::Running => PodPhase::Running,
        ContainerState::Exited => match policy {
            RestartPolicy::Never | RestartPolicy::OnFailure if status.exit_code == 0 => {
                PodPhase::Succeeded
            }
            _ => PodPhase::Failed,
        },
        ContainerState::Created if status.never_ran() => PodPhase::Failed,
        // Between create and start.
        ContainerState::Created => PodPhase::Running,
        ContainerState::Paused | ContainerState::Unknown => PodPhase::Unknown,
    }
}

/// Per-container state as reported upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ContainerStateView {
    Waiting {
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Running {
        started_at: Option<DateTime<Utc>>,
    },
    Terminated {
        exit_code: i64,
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        started_at: Option<DateTime<Utc>>,
        finished_at: Option<DateTime<Utc>>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStatusView {
    pub name: String,
    pub container_id: Option<String>,
    pub image: String,
    pub restart_count: u32,
    pub ready: bool,
    pub state: ContainerStateView,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodCondition {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStatus {
    pub phase: PodPhase,
    pub conditions: Vec<PodCondition>,
    pub container_statuses: Vec<ContainerStatusView>,
}

impl ContainerEngine {
    /// Current status of `pod`.
    pub async fn pod_status(&self, pod: &Pod) -> PodStatus {
        let Some(handle) = self.index.get(&pod.uid).await else {
            let (phase, state) = if pod.deletion_requested {
                (
                    PodPhase::Succeeded,
                    ContainerStateView::Terminated {
                        exit_code: 0,
                        reason: "Completed".to_string(),
                        message: None,
                        started_at: None,
                        finished_at: None,
                    },
                )
            } else {
                (
                    PodPhase::Pending,
                    ContainerStateView::Waiting {
                        reason: "ContainerCreating".to_string(),
                        message: None,
                    },
                )
            };
            return pod_status_without_container(pod, phase, state);
        };

        let status = match self.runtime.inspect_container(&handle.container_id).await {
            Ok(status) => status,
            Err(e) => {
                warn!(
                    pod = %pod.full_name(),
                    container_id = %handle.container_id.short(),
                    error = %e,
                    "Failed to inspect container for status"
                );
                return pod_status_without_container(
                    pod,
                    PodPhase::Unknown,
                    ContainerStateView::Waiting {
                        reason: "ContainerStatusUnknown".to_string(),
                        message: Some(e.to_string()),
                    },
                );
            }
        };

        let phase = to_pod_phase(&status, pod.restart_policy);
        let views = pod
            .containers
            .iter()
            .map(|container| ContainerStatusView {
                name: container.name.clone(),
                container_id: Some(status.id.to_string()),
                image: status.image.clone(),
                restart_count: status.restart_count().unwrap_or(0),
                ready: status.state.is_running(),
                state: state_view(&status),
            })
            .collect();

        build_status(phase, views)
    }
}

fn state_view(status: &ContainerStatus) -> ContainerStateView {
    match status.state {
        ContainerState::Running => ContainerStateView::Running {
            started_at: status.started_at,
        },
        ContainerState::Exited => ContainerStateView::Terminated {
            exit_code: status.exit_code,
            reason: status.reason.clone().unwrap_or_else(|| {
                if status.exit_code == 0 {
                    "Completed".to_string()
                } else {
                    "Error".to_string()
                }
            }),
            message: None,
            started_at: status.started_at,
            finished_at: status.finished_at,
        },
        ContainerState::Created if status.never_ran() => ContainerStateView::Waiting {
            reason: "ContainerCannotRun".to_string(),
            message: status.reason.clone(),
        },
        ContainerState::Created => ContainerStateView::Waiting {
            reason: "ContainerCreating".to_string(),
            message: None,
        },
        ContainerState::Paused => ContainerStateView::Waiting {
            reason: "Paused".to_string(),
            message: None,
        },
        ContainerState::Unknown => ContainerStateView::Waiting {
            reason: "ContainerStatusUnknown".to_string(),
            message: status.reason.clone(),
        },
    }
}

fn pod_status_without_container(
    pod: &Pod,
    phase: PodPhase,
    state: ContainerStateView,
) -> PodStatus {
    let views = pod
        .containers
        .iter()
        .map(|container| ContainerStatusView {
            name: container.name.clone(),
            container_id: None,
            image: container.image.clone(),
            restart_count: 0,
            ready: false,
            state: state.clone(),
        })
        .collect();
    build_status(phase, views)
}

fn build_status(phase: PodPhase, views: Vec<ContainerStatusView>) -> PodStatus {
    let unready: Vec<&str> = views
        .iter()
        .filter(|v| !v.ready)
        .map(|v| v.name.as_str())
        .collect();

    let ready = if unready.is_empty() {
        PodCondition {
            kind: "Ready".to_string(),
            status: true,
            reason: None,
            message: None,
        }
    } else {
        PodCondition {
            kind: "Ready".to_string(),
            status: false,
            reason: Some("ContainersNotReady".to_string()),
            message: Some(format!("containers with unready status: [{}]", unready.join(" "))),
        }
    };

    PodStatus {
        phase,
        conditions: vec![ready],
        container_statuses: views,
    }
}
