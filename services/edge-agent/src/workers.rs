//! Background workers.
//!
//! - **Pod workers**: two pools, one syncing pods that should exist and one
//!   terminating pods that should not. A pod is always routed to the same
//!   worker of a pool, so the engine never sees overlapping syncs for a pod.
//! - **GC worker**: runs garbage collection on a fixed period.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::engine::ContainerEngine;
use crate::error::EngineError;
use crate::gc::{GcPolicy, GcReport};
use crate::pod::{Pod, PodUid};
use crate::sync_loop::DesiredPods;

/// Queue depth per worker.
const QUEUE_DEPTH: usize = 64;

/// Worker dispatch errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkerError {
    #[error("worker pool is shut down")]
    Closed,
}

/// Pod sync and termination worker pools.
pub struct PodWorkers {
    additions: Vec<mpsc::Sender<Pod>>,
    removals: Vec<mpsc::Sender<PodUid>>,
    handles: Vec<JoinHandle<()>>,
}

impl PodWorkers {
    /// Spawn `workers` workers per pool.
    pub fn spawn(
        engine: Arc<ContainerEngine>,
        workers: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let workers = workers.max(1);
        let mut additions = Vec::with_capacity(workers);
        let mut removals = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers * 2);

        for worker in 0..workers {
            let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
            additions.push(tx);
            handles.push(tokio::spawn(run_sync_worker(
                worker,
                Arc::clone(&engine),
                rx,
                shutdown.clone(),
            )));

            let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
            removals.push(tx);
            handles.push(tokio::spawn(run_terminate_worker(
                worker,
                Arc::clone(&engine),
                rx,
                shutdown.clone(),
            )));
        }

        info!(workers, "Started pod workers");
        Self {
            additions,
            removals,
            handles,
        }
    }

    /// Queue `pod` for a sync. Returns `false` if its worker's queue is full;
    /// the next sync pass will offer it again.
    pub fn dispatch_sync(&self, pod: Pod) -> Result<bool, WorkerError> {
        let queue = &self.additions[shard(&pod.uid, self.additions.len())];
        offer(queue, pod)
    }

    /// Queue termination of `pod`. Returns `false` if the queue is full.
    pub fn dispatch_terminate(&self, pod: PodUid) -> Result<bool, WorkerError> {
        let queue = &self.removals[shard(&pod, self.removals.len())];
        offer(queue, pod)
    }

    /// Close the queues and wait for every worker to finish.
    pub async fn join(self) {
        drop(self.additions);
        drop(self.removals);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Pod worker panicked");
            }
        }
    }
}

fn shard(pod: &PodUid, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    pod.hash(&mut hasher);
    (hasher.finish() % workers.max(1) as u64) as usize
}

fn offer<T>(queue: &mpsc::Sender<T>, item: T) -> Result<bool, WorkerError> {
    match queue.try_send(item) {
        Ok(()) => Ok(true),
        Err(mpsc::error::TrySendError::Full(_)) => Ok(false),
        Err(mpsc::error::TrySendError::Closed(_)) => Err(WorkerError::Closed),
    }
}

async fn run_sync_worker(
    worker: usize,
    engine: Arc<ContainerEngine>,
    mut queue: mpsc::Receiver<Pod>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            next = queue.recv() => {
                let Some(pod) = next else { break };
                match engine.sync_pod(&pod).await {
                    Ok(()) => {}
                    Err(e) if e.is_backoff() => debug!(pod = %pod.full_name(), "{}", e),
                    Err(e) => warn!(pod = %pod.full_name(), error = %e, "Pod sync failed"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!(worker, "Sync worker stopped");
}

async fn run_terminate_worker(
    worker: usize,
    engine: Arc<ContainerEngine>,
    mut queue: mpsc::Receiver<PodUid>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            next = queue.recv() => {
                let Some(pod) = next else { break };
                match engine.terminate_pod(&pod).await {
                    Ok(()) | Err(EngineError::PodNotFound(_)) => {}
                    Err(e) => warn!(pod_uid = %pod, error = %e, "Pod termination failed"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!(worker, "Terminate worker stopped");
}

/// Periodic garbage collection driver.
pub struct GcWorker {
    engine: Arc<ContainerEngine>,
    desired: DesiredPods,
    policy: GcPolicy,
    interval: Duration,
}

impl GcWorker {
    pub fn new(
        engine: Arc<ContainerEngine>,
        desired: DesiredPods,
        policy: GcPolicy,
        interval: Duration,
    ) -> Self {
        Self {
            engine,
            desired,
            policy,
            interval,
        }
    }

    /// Run until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            min_age_secs = self.policy.min_age.as_secs(),
            "Starting garbage collection worker"
        );

        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.run_once().await {
                        Ok(Some(report)) => debug!(
                            detected = report.detected,
                            evicted = report.evicted.len(),
                            "Garbage collection pass complete"
                        ),
                        Ok(None) => {}
                        Err(e) => error!(error = %e, "Garbage collection failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Garbage collection worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One pass. Skipped (`Ok(None)`) until the desired pods have been
    /// loaded at least once, so a missing manifest never evicts everything.
    pub async fn run_once(&self) -> Result<Option<GcReport>, EngineError> {
        let Some(desired) = self.desired.uids().await else {
            debug!("Desired pods not loaded yet, skipping garbage collection");
            return Ok(None);
        };

        let result = self.engine.run_gc(&desired, &self.policy).await;
        self.engine.prune_backoff();
        result.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_is_stable_and_bounded() {
        let pod = PodUid::from("uid-42");
        let first = shard(&pod, 4);
        assert!(first < 4);
        for _ in 0..10 {
            assert_eq!(shard(&pod, 4), first);
        }
        assert_eq!(shard(&pod, 1), 0);
    }

    #[tokio::test]
    async fn test_offer_reports_full_and_closed() {
        let (tx, rx) = mpsc::channel(1);
        assert_eq!(offer(&tx, 1), Ok(true));
        assert_eq!(offer(&tx, 2), Ok(false));
        drop(rx);
        assert_eq!(offer(&tx, 3), Err(WorkerError::Closed));
    }
}
