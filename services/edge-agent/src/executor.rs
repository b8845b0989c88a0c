//! Apply a [`PodActions`] plan.
//!
//! Order of operations for one pod:
//! 1. Skip everything while the pod is backed off.
//! 2. Kill every container in the plan; the first failed removal aborts.
//!    Containers marked `keep` are only stopped and stay indexed.
//! 3. Create, record, index and start each container in the plan.
//!
//! A failed create or start records a backoff failure and aborts. Only a
//! pass that completes every step resets the pod's backoff.

use tracing::{info, warn};

use crate::container_config::build_create_request;
use crate::engine::ContainerEngine;
use crate::error::EngineError;
use crate::planner::PodActions;
use crate::pod::Pod;
use crate::records::{ContainerHandle, ContainerRecord};
use crate::runtime::ContainerId;

impl ContainerEngine {
    /// Execute `actions` for `pod`.
    pub async fn apply(&self, pod: &Pod, actions: &PodActions) -> Result<(), EngineError> {
        let key = pod.backoff_key();

        if let Some(remaining) = self.backoff_remaining(&key) {
            info!(
                pod = %pod.full_name(),
                remaining_secs = remaining.as_secs(),
                "Pod is backing off, skipping"
            );
            return Err(EngineError::BackoffActive {
                pod: pod.full_name(),
                remaining,
            });
        }

        let reaper = self.reaper();
        for (container_id, kill) in &actions.containers_to_kill {
            info!(
                pod = %pod.full_name(),
                container = %kill.name,
                container_id = %container_id.short(),
                reason = %kill.reason,
                "Killing container"
            );
            if kill.keep {
                reaper.stop(container_id).await?;
            } else {
                reaper.kill(Some(&pod.uid), container_id).await?;
            }
        }

        for &idx in &actions.containers_to_start {
            let Some(container) = pod.containers.get(idx) else {
                warn!(pod = %pod.full_name(), index = idx, "Planned container index out of range");
                continue;
            };

            let request = build_create_request(
                pod,
                container,
                actions.restart_count,
                &self.config.hostname,
            )
            .inspect_err(|_| {
                self.record_start_failure(&key);
            })?;

            let container_id = match self.runtime.create_container(&request).await {
                Ok(id) => id,
                Err(e) => {
                    let delay = self.record_start_failure(&key);
                    warn!(
                        pod = %pod.full_name(),
                        container = %container.name,
                        error = %e,
                        backoff_secs = delay.as_secs(),
                        "Failed to create container"
                    );
                    return Err(e.into());
                }
            };

            self.track_created(pod, &container_id).await;

            if let Err(e) = self.runtime.start_container(&container_id).await {
                let delay = self.record_start_failure(&key);
                warn!(
                    pod = %pod.full_name(),
                    container = %container.name,
                    container_id = %container_id.short(),
                    error = %e,
                    backoff_secs = delay.as_secs(),
                    "Failed to start container"
                );
                return Err(EngineError::StartFailed {
                    pod: pod.full_name(),
                    container_id,
                    source: e,
                });
            }

            info!(
                pod = %pod.full_name(),
                container = %container.name,
                container_id = %container_id.short(),
                restart_count = actions.restart_count,
                "Started container"
            );
        }

        self.reset_backoff(&key);
        Ok(())
    }

    /// Record a freshly created container and point the pod index at it.
    async fn track_created(&self, pod: &Pod, container_id: &ContainerId) {
        let now = self.clock.now();

        self.records
            .insert(
                container_id.clone(),
                ContainerRecord::created(pod.uid.clone(), now),
            )
            .await;
        self.index
            .set(
                pod.uid.clone(),
                ContainerHandle {
                    container_id: container_id.clone(),
                    started_at: now,
                },
            )
            .await;
    }
}
