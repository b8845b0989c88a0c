//! Container garbage collection.
//!
//! A pass has three phases:
//! 1. Detection: list the runtime, create records for new containers, stamp
//!    `last_used` on containers that belong to a desired pod, and prune
//!    records whose containers disappeared.
//! 2. Selection: order records oldest-use first and drop those used at or
//!    after the pass started or younger than the minimum age.
//! 3. Eviction: stop and remove the survivors with bounded concurrency,
//!    aggregating failures.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::engine::ContainerEngine;
use crate::error::{EngineError, EvictionFailure};
use crate::pod::PodUid;
use crate::records::ContainerRecord;
use crate::runtime::{ContainerId, ContainerState, RuntimeError};

/// Garbage collection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcPolicy {
    /// Containers younger than this are never evicted.
    pub min_age: Duration,

    /// Dead containers kept per pod before a warning is reported; negative
    /// means no limit.
    pub max_per_pod_container: i64,

    /// Dead containers kept on the node before a warning is reported;
    /// negative means no limit.
    pub max_containers: i64,

    /// Evictions in flight at once.
    pub max_concurrent_deletions: usize,
}

impl Default for GcPolicy {
    fn default() -> Self {
        Self {
            min_age: Duration::from_secs(60),
            max_per_pod_container: 1,
            max_containers: -1,
            max_concurrent_deletions: 4,
        }
    }
}

/// Outcome of one garbage collection pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Containers seen by the runtime listing.
    pub detected: usize,

    /// Records dropped because their containers vanished.
    pub pruned: usize,

    /// Containers stopped and removed.
    pub evicted: Vec<ContainerId>,

    /// Dead containers still present on the node, if over `max_containers`.
    pub over_node_limit: Option<usize>,

    /// Pods retaining more dead containers than `max_per_pod_container`.
    pub pods_over_limit: Vec<(PodUid, usize)>,
}

/// A container selected for eviction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub container_id: ContainerId,
    pub record: ContainerRecord,
}

/// Whether a container belonging to `pod` counts as in use.
///
/// Containers without a pod are always considered in use.
pub fn is_container_used(pod: Option<&PodUid>, desired: &HashSet<PodUid>) -> bool {
    match pod {
        None => true,
        Some(pod) => desired.contains(pod),
    }
}

/// Order `records` for eviction and keep those eligible at `reference`.
///
/// Candidates are sorted ascending by `(last_used, first_detected)` with
/// never-used containers first. A record is ineligible if it was used at or
/// after `reference`, or if it was first detected less than `min_age` before
/// `reference`.
pub fn select_candidates(
    records: Vec<(ContainerId, ContainerRecord)>,
    reference: DateTime<Utc>,
    min_age: Duration,
) -> Vec<EvictionCandidate> {
    let min_age = chrono::Duration::from_std(min_age).unwrap_or(chrono::Duration::MAX);

    let mut candidates: Vec<EvictionCandidate> = records
        .into_iter()
        .map(|(container_id, record)| EvictionCandidate {
            container_id,
            record,
        })
        .collect();

    candidates.sort_by(|a, b| {
        (a.record.last_used, a.record.first_detected, &a.container_id).cmp(&(
            b.record.last_used,
            b.record.first_detected,
            &b.container_id,
        ))
    });

    candidates
        .into_iter()
        .filter(|c| {
            if c.record.pod_id.is_none() {
                return false;
            }
            if c.record.last_used.is_some_and(|used| used >= reference) {
                return false;
            }
            reference.signed_duration_since(c.record.first_detected) >= min_age
        })
        .collect()
}

impl ContainerEngine {
    /// Run one garbage collection pass.
    ///
    /// `desired` is the set of pods that should currently exist. Detection
    /// failures abort the pass; eviction failures are collected and returned
    /// once every eviction has finished.
    pub async fn run_gc(
        &self,
        desired: &HashSet<PodUid>,
        policy: &GcPolicy,
    ) -> Result<GcReport, EngineError> {
        let reference = self.clock.now();
        let mut report = self.detect_containers(desired).await?;

        let candidates =
            select_candidates(self.records.snapshot().await, reference, policy.min_age);
        debug!(candidates = candidates.len(), "Selected eviction candidates");

        let (evicted, failures, aborted) = self.evict(candidates, policy).await;
        report.evicted = evicted;

        self.check_limits(policy, &mut report).await;

        if !report.evicted.is_empty() {
            info!(
                evicted = report.evicted.len(),
                detected = report.detected,
                "Garbage collection evicted containers"
            );
        }

        if failures.is_empty() && aborted == 0 {
            Ok(report)
        } else {
            Err(EngineError::GarbageCollection { failures, aborted })
        }
    }

    /// Reconcile the record store with the runtime listing.
    pub async fn detect_containers(
        &self,
        desired: &HashSet<PodUid>,
    ) -> Result<GcReport, EngineError> {
        let listed_at = self.clock.now();
        let containers = self.runtime.list_containers().await?;
        let now = self.clock.now();

        let mut present = HashSet::with_capacity(containers.len());
        for summary in &containers {
            present.insert(summary.id.clone());

            let mut record = match self.records.get(&summary.id).await {
                Some(record) => record,
                None => ContainerRecord {
                    first_detected: summary.created_at,
                    last_used: None,
                    state: summary.state,
                    pod_id: None,
                    pod_resolved: false,
                },
            };

            if !record.pod_resolved {
                match self.runtime.inspect_container(&summary.id).await {
                    Ok(status) => {
                        record.pod_id = status.pod_uid();
                        record.pod_resolved = true;
                    }
                    Err(e) => {
                        debug!(
                            container_id = %summary.id.short(),
                            error = %e,
                            "Failed to look up container labels"
                        );
                    }
                }
            }

            record.state = summary.state;
            if is_container_used(record.pod_id.as_ref(), desired) {
                record.last_used = Some(now);
            }

            self.records.insert(summary.id.clone(), record).await;
        }

        let pruned = self.records.prune_missing(&present, listed_at).await;
        for id in &pruned {
            self.liveness.remove(id).await;
        }
        let records = &self.records;
        let mut unbacked = Vec::new();
        for (pod, handle) in self.index.snapshot().await {
            if !records.contains(&handle.container_id).await {
                unbacked.push((pod, handle.container_id));
            }
        }
        for (pod, id) in unbacked {
            if self.index.remove_if_current(&pod, &id).await {
                debug!(
                    pod_uid = %pod,
                    container_id = %id.short(),
                    "Dropped index entry for vanished container"
                );
            }
        }

        Ok(GcReport {
            detected: containers.len(),
            pruned: pruned.len(),
            ..GcReport::default()
        })
    }

    async fn evict(
        &self,
        candidates: Vec<EvictionCandidate>,
        policy: &GcPolicy,
    ) -> (Vec<ContainerId>, Vec<EvictionFailure>, usize) {
        let semaphore = Arc::new(Semaphore::new(policy.max_concurrent_deletions.max(1)));
        let mut tasks = JoinSet::new();

        for candidate in candidates {
            let reaper = self.reaper();
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                info!(
                    container_id = %candidate.container_id.short(),
                    pod_uid = ?candidate.record.pod_id,
                    "Evicting container"
                );
                let result: Result<(), RuntimeError> = reaper
                    .kill(candidate.record.pod_id.as_ref(), &candidate.container_id)
                    .await;
                (candidate.container_id, result)
            });
        }

        let mut evicted = Vec::new();
        let mut failures = Vec::new();
        let mut aborted = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((container_id, Ok(()))) => evicted.push(container_id),
                Ok((container_id, Err(error))) => {
                    failures.push(EvictionFailure {
                        container_id,
                        error,
                    });
                }
                Err(e) => {
                    error!(error = %e, "Eviction task failed");
                    aborted += 1;
                }
            }
        }

        evicted.sort();
        (evicted, failures, aborted)
    }

    async fn check_limits(&self, policy: &GcPolicy, report: &mut GcReport) {
        let mut total_dead = 0usize;
        let mut per_pod: HashMap<PodUid, usize> = HashMap::new();

        for (_, record) in self.records.snapshot().await {
            if matches!(record.state, ContainerState::Running | ContainerState::Paused) {
                continue;
            }
            total_dead += 1;
            if let Some(pod) = record.pod_id {
                *per_pod.entry(pod).or_default() += 1;
            }
        }

        if let Ok(limit) = usize::try_from(policy.max_containers) {
            if total_dead > limit {
                warn!(dead = total_dead, limit, "Node retains more dead containers than allowed");
                report.over_node_limit = Some(total_dead);
            }
        }

        if let Ok(limit) = usize::try_from(policy.max_per_pod_container) {
            let mut over: Vec<(PodUid, usize)> =
                per_pod.into_iter().filter(|(_, n)| *n > limit).collect();
            over.sort();
            for (pod, count) in &over {
                warn!(
                    pod_uid = %pod,
                    dead = count,
                    limit,
                    "Pod retains more dead containers than allowed"
                );
            }
            report.pods_over_limit = over;
        }
    }
}
