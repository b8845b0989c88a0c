//! Sync loop for converging node state.
//!
//! The sync loop:
//! - Periodically re-reads the manifest
//! - Dispatches a sync for every desired pod
//! - Dispatches termination for pods that dropped out of the manifest or are
//!   still indexed without being desired

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use crate::engine::ContainerEngine;
use crate::manifest::{ManifestError, ManifestSource};
use crate::pod::{Pod, PodUid};
use crate::workers::{PodWorkers, WorkerError};

/// The most recently loaded desired pods, shared with the GC worker.
#[derive(Debug, Clone, Default)]
pub struct DesiredPods {
    pods: Arc<RwLock<Option<HashMap<PodUid, Pod>>>>,
}

impl DesiredPods {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the desired set; returns the UIDs that were desired before.
    pub async fn replace(&self, pods: &[Pod]) -> HashSet<PodUid> {
        let next: HashMap<PodUid, Pod> = pods
            .iter()
            .map(|pod| (pod.uid.clone(), pod.clone()))
            .collect();
        let previous = self.pods.write().await.replace(next);
        previous
            .map(|p| p.into_keys().collect())
            .unwrap_or_default()
    }

    /// Desired UIDs, or `None` before the first load.
    pub async fn uids(&self) -> Option<HashSet<PodUid>> {
        self.pods
            .read()
            .await
            .as_ref()
            .map(|pods| pods.keys().cloned().collect())
    }

    pub async fn get(&self, uid: &PodUid) -> Option<Pod> {
        self.pods.read().await.as_ref()?.get(uid).cloned()
    }
}

/// What one sync pass dispatched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub synced: usize,
    pub terminated: usize,
    /// Items dropped because a worker queue was full.
    pub deferred: usize,
}

/// Sync loop errors.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Workers(#[from] WorkerError),
}

/// Periodically dispatches pod work from the manifest.
pub struct SyncLoop {
    source: ManifestSource,
    engine: Arc<ContainerEngine>,
    workers: Arc<PodWorkers>,
    desired: DesiredPods,
    interval: Duration,
}

impl SyncLoop {
    pub fn new(
        source: ManifestSource,
        engine: Arc<ContainerEngine>,
        workers: Arc<PodWorkers>,
        desired: DesiredPods,
        interval: Duration,
    ) -> Self {
        Self {
            source,
            engine,
            workers,
            desired,
            interval,
        }
    }

    /// Run the sync loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            manifest = %self.source.path().display(),
            interval_secs = self.interval.as_secs(),
            "Starting sync loop"
        );

        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.sync_once().await {
                        Ok(summary) => debug!(
                            synced = summary.synced,
                            terminated = summary.terminated,
                            deferred = summary.deferred,
                            "Sync pass dispatched"
                        ),
                        Err(e) => warn!(error = %e, "Sync pass failed, will retry"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Sync loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Perform a single sync pass.
    pub async fn sync_once(&self) -> Result<SyncSummary, SyncError> {
        let pods = self.source.load().await?;
        let desired: HashSet<PodUid> = pods.iter().map(|pod| pod.uid.clone()).collect();
        let previous = self.desired.replace(&pods).await;

        let mut removals: BTreeSet<PodUid> = previous.difference(&desired).cloned().collect();
        removals.extend(
            self.engine
                .index()
                .pod_uids()
                .await
                .into_iter()
                .filter(|uid| !desired.contains(uid)),
        );

        let mut summary = SyncSummary::default();
        for pod in pods {
            if self.workers.dispatch_sync(pod)? {
                summary.synced += 1;
            } else {
                summary.deferred += 1;
            }
        }
        for uid in removals {
            if self.workers.dispatch_terminate(uid)? {
                summary.terminated += 1;
            } else {
                summary.deferred += 1;
            }
        }

        Ok(summary)
    }
}
