//! The container engine.
//!
//! [`ContainerEngine`] owns the shared state every reconciliation path works
//! on: the runtime client, the record store, the pod index, liveness results
//! and per-pod backoff. Planning, applying, garbage collection and status
//! translation are implemented on it in their own modules.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use edged_reconcile::{Backoff, BackoffPolicy, Clock, SystemClock};
use tracing::{debug, error, info, warn};

use crate::error::EngineError;
use crate::liveness::LivenessResults;
use crate::pod::{Pod, PodUid};
use crate::records::{ContainerHandle, ContainerRecord, PodContainerIndex, RecordStore};
use crate::runtime::{ContainerId, ContainerRuntime, ContainerState, RuntimeError};

/// Engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Hostname given to every container.
    pub hostname: String,

    /// Grace period passed to the runtime when stopping a container.
    pub stop_grace_period: Duration,

    /// Start backoff.
    pub backoff: BackoffPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            stop_grace_period: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Reconciles pods against the container runtime.
pub struct ContainerEngine {
    pub(crate) runtime: Arc<dyn ContainerRuntime>,
    pub(crate) records: Arc<RecordStore>,
    pub(crate) index: Arc<PodContainerIndex>,
    pub(crate) liveness: Arc<LivenessResults>,
    backoff: Mutex<Backoff>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: EngineConfig,
}

impl ContainerEngine {
    /// Create an engine that reads the system clock.
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: EngineConfig) -> Self {
        Self::with_clock(runtime, config, Arc::new(SystemClock))
    }

    /// Create an engine with an explicit time source.
    pub fn with_clock(
        runtime: Arc<dyn ContainerRuntime>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            runtime,
            records: Arc::new(RecordStore::new()),
            index: Arc::new(PodContainerIndex::new()),
            liveness: Arc::new(LivenessResults::new()),
            backoff: Mutex::new(Backoff::new(config.backoff.clone())),
            clock,
            config,
        }
    }

    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    pub fn index(&self) -> &PodContainerIndex {
        &self.index
    }

    /// Liveness results, written by the prober.
    pub fn liveness(&self) -> &Arc<LivenessResults> {
        &self.liveness
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn backoff(&self) -> MutexGuard<'_, Backoff> {
        self.backoff
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Time left before `key` may be retried, if it is backed off.
    pub fn backoff_remaining(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now();
        self.backoff().remaining(key, now)
    }

    /// Consecutive start failures recorded for `key`.
    pub fn backoff_attempts(&self, key: &str) -> u32 {
        self.backoff().attempts(key)
    }

    pub(crate) fn record_start_failure(&self, key: &str) -> Duration {
        let now = self.clock.now();
        self.backoff().record_failure(key, now)
    }

    pub(crate) fn reset_backoff(&self, key: &str) {
        self.backoff().reset(key);
    }

    /// Forget backoff keys that have been idle long enough.
    pub fn prune_backoff(&self) {
        let now = self.clock.now();
        self.backoff().prune(now);
    }

    pub(crate) fn reaper(&self) -> ContainerReaper {
        ContainerReaper {
            runtime: Arc::clone(&self.runtime),
            records: Arc::clone(&self.records),
            index: Arc::clone(&self.index),
            liveness: Arc::clone(&self.liveness),
            grace: self.config.stop_grace_period,
        }
    }

    /// Rebuild the pod index from the runtime.
    ///
    /// Called once at startup. For each pod the newest container wins; all
    /// pod-labelled containers also get a record. Containers that cannot be
    /// inspected are skipped.
    pub async fn init_pod_index(&self) -> Result<usize, EngineError> {
        let containers = self.runtime.list_containers().await?;

        for summary in containers {
            let status = match self.runtime.inspect_container(&summary.id).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(
                        container_id = %summary.id.short(),
                        error = %e,
                        "Failed to inspect container during index rebuild"
                    );
                    continue;
                }
            };
            let Some(pod) = status.pod_uid() else {
                continue;
            };

            if !self.records.contains(&status.id).await {
                self.records
                    .insert(
                        status.id.clone(),
                        ContainerRecord {
                            first_detected: status.created_at,
                            last_used: None,
                            state: status.state,
                            pod_id: Some(pod.clone()),
                            pod_resolved: true,
                        },
                    )
                    .await;
            }

            self.index
                .set_if_newer(
                    pod,
                    ContainerHandle {
                        container_id: status.id.clone(),
                        started_at: status.created_at,
                    },
                )
                .await;
        }

        let indexed = self.index.len().await;
        info!(pods = indexed, "Rebuilt pod index");
        Ok(indexed)
    }

    /// Plan and apply one pod.
    ///
    /// A pod marked for deletion is terminated instead.
    pub async fn sync_pod(&self, pod: &Pod) -> Result<(), EngineError> {
        if pod.deletion_requested {
            return match self.terminate_pod(&pod.uid).await {
                Err(EngineError::PodNotFound(_)) => Ok(()),
                other => other,
            };
        }

        let actions = self.plan(pod).await;
        if actions.is_empty() {
            debug!(pod = %pod.full_name(), "Pod up to date");
        }
        self.apply(pod, &actions).await
    }

    /// Kill the container currently indexed for `pod`.
    pub async fn terminate_pod(&self, pod: &PodUid) -> Result<(), EngineError> {
        let handle = self
            .index
            .get(pod)
            .await
            .ok_or_else(|| EngineError::PodNotFound(pod.clone()))?;

        info!(pod_uid = %pod, container_id = %handle.container_id.short(), "Terminating pod");
        self.reaper()
            .kill(Some(pod), &handle.container_id)
            .await
            .map_err(EngineError::from)
    }

    /// Terminate every indexed pod that is not in `desired`.
    ///
    /// All orphans are attempted; the first failure is returned afterwards.
    pub async fn cleanup_orphaned_pods(
        &self,
        desired: &HashSet<PodUid>,
    ) -> Result<Vec<PodUid>, EngineError> {
        let mut terminated = Vec::new();
        let mut first_error = None;

        for pod in self.index.pod_uids().await {
            if desired.contains(&pod) {
                continue;
            }
            match self.terminate_pod(&pod).await {
                Ok(()) => terminated.push(pod),
                // Raced with another termination.
                Err(EngineError::PodNotFound(_)) => {}
                Err(e) => {
                    warn!(pod_uid = %pod, error = %e, "Failed to clean up orphaned pod");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(terminated),
        }
    }
}

/// Stops and removes containers, then forgets them.
///
/// Holds only shared handles so it can be moved into spawned tasks.
#[derive(Clone)]
pub(crate) struct ContainerReaper {
    runtime: Arc<dyn ContainerRuntime>,
    records: Arc<RecordStore>,
    index: Arc<PodContainerIndex>,
    liveness: Arc<LivenessResults>,
    grace: Duration,
}

impl ContainerReaper {
    /// Stop and remove `id`.
    ///
    /// A failed stop is logged and removal is attempted anyway; a failed
    /// removal is returned. A container that is already gone counts as
    /// removed. On success the pod index entry is dropped if it still points
    /// at `id`, followed by the record.
    pub(crate) async fn kill(
        &self,
        pod: Option<&PodUid>,
        id: &ContainerId,
    ) -> Result<(), RuntimeError> {
        debug!(container_id = %id.short(), "Stopping container");
        if let Err(e) = self.runtime.stop_container(id, self.grace).await {
            if !e.is_not_found() {
                warn!(container_id = %id.short(), error = %e, "Failed to stop container");
            }
        }

        match self.runtime.remove_container(id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(container_id = %id.short(), "Container already removed");
            }
            Err(e) => {
                error!(container_id = %id.short(), error = %e, "Failed to remove container");
                return Err(e);
            }
        }

        if let Some(pod) = pod {
            self.index.remove_if_current(pod, id).await;
        }
        self.liveness.remove(id).await;
        self.records.remove(id).await;

        info!(container_id = %id.short(), "Container removed");
        Ok(())
    }

    /// Stop `id` but leave it, its record and any index entry in place.
    ///
    /// Unlike [`kill`](Self::kill), a failed stop is returned.
    pub(crate) async fn stop(&self, id: &ContainerId) -> Result<(), RuntimeError> {
        debug!(container_id = %id.short(), "Stopping container, keeping it");
        match self.runtime.stop_container(id, self.grace).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(container_id = %id.short(), "Container already removed");
            }
            Err(e) => {
                warn!(container_id = %id.short(), error = %e, "Failed to stop container");
                return Err(e);
            }
        }

        self.liveness.remove(id).await;
        self.records
            .update(id, |record| record.state = ContainerState::Exited)
            .await;

        info!(container_id = %id.short(), "Container stopped");
        Ok(())
    }
}
