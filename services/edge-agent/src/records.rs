//! Container records and the pod-to-container index.
//!
//! Both maps are guarded by their own lock. Every operation takes the lock
//! for a single step and never holds it across a runtime call, so the
//! executor, the garbage collector and status queries can interleave freely.
//! When both maps are touched, the record store is always updated first on
//! insert and last on removal, keeping every indexed container backed by a
//! record.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::pod::PodUid;
use crate::runtime::{ContainerId, ContainerState};

/// What the agent knows about one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRecord {
    /// When the container was first seen (or created by the agent).
    pub first_detected: DateTime<Utc>,

    /// Last time the container was confirmed to belong to a desired pod.
    /// `None` means never.
    pub last_used: Option<DateTime<Utc>>,

    /// Last observed state.
    pub state: ContainerState,

    /// Owning pod; `None` for containers the agent does not manage.
    pub pod_id: Option<PodUid>,

    /// Whether the pod label lookup has succeeded at least once.
    pub pod_resolved: bool,
}

impl ContainerRecord {
    /// A record for a container the agent just created for `pod`.
    pub fn created(pod: PodUid, now: DateTime<Utc>) -> Self {
        Self {
            first_detected: now,
            last_used: Some(now),
            state: ContainerState::Created,
            pod_id: Some(pod),
            pod_resolved: true,
        }
    }
}

/// Map of container ID to [`ContainerRecord`].
#[derive(Debug, Default)]
pub struct RecordStore {
    records: RwLock<HashMap<ContainerId, ContainerRecord>>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: &ContainerId) -> Option<ContainerRecord> {
        self.records.read().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &ContainerId) -> bool {
        self.records.read().await.contains_key(id)
    }

    pub async fn insert(&self, id: ContainerId, record: ContainerRecord) {
        self.records.write().await.insert(id, record);
    }

    pub async fn remove(&self, id: &ContainerId) -> Option<ContainerRecord> {
        self.records.write().await.remove(id)
    }

    /// Apply `f` to the record for `id`, if there is one.
    pub async fn update<F>(&self, id: &ContainerId, f: F) -> bool
    where
        F: FnOnce(&mut ContainerRecord),
    {
        match self.records.write().await.get_mut(id) {
            Some(record) => {
                f(record);
                true
            }
            None => false,
        }
    }

    pub async fn snapshot(&self) -> Vec<(ContainerId, ContainerRecord)> {
        self.records
            .read()
            .await
            .iter()
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect()
    }

    /// Drop records for containers absent from `present` that were first
    /// detected before `listed_at`. Records created after the listing was
    /// taken are kept. Returns the dropped IDs.
    pub async fn prune_missing(
        &self,
        present: &HashSet<ContainerId>,
        listed_at: DateTime<Utc>,
    ) -> Vec<ContainerId> {
        let mut records = self.records.write().await;
        let stale: Vec<ContainerId> = records
            .iter()
            .filter(|(id, record)| !present.contains(*id) && record.first_detected < listed_at)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            records.remove(id);
        }
        stale
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

/// The container currently representing a pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub container_id: ContainerId,
    pub started_at: DateTime<Utc>,
}

/// Map of pod UID to its current container.
#[derive(Debug, Default)]
pub struct PodContainerIndex {
    entries: RwLock<HashMap<PodUid, ContainerHandle>>,
}

impl PodContainerIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, pod: &PodUid) -> Option<ContainerHandle> {
        self.entries.read().await.get(pod).cloned()
    }

    pub async fn set(&self, pod: PodUid, handle: ContainerHandle) {
        self.entries.write().await.insert(pod, handle);
    }

    /// Set `handle` unless the pod already maps to a container started at or
    /// after it. Returns whether the entry changed.
    pub async fn set_if_newer(&self, pod: PodUid, handle: ContainerHandle) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get(&pod) {
            Some(current) if current.started_at >= handle.started_at => false,
            _ => {
                entries.insert(pod, handle);
                true
            }
        }
    }

    /// Remove the entry for `pod` only if it still points at `id`.
    pub async fn remove_if_current(&self, pod: &PodUid, id: &ContainerId) -> bool {
        let mut entries = self.entries.write().await;
        if entries.get(pod).is_some_and(|h| &h.container_id == id) {
            entries.remove(pod);
            true
        } else {
            false
        }
    }

    pub async fn pod_uids(&self) -> Vec<PodUid> {
        self.entries.read().await.keys().cloned().collect()
    }

    pub async fn snapshot(&self) -> Vec<(PodUid, ContainerHandle)> {
        self.entries
            .read()
            .await
            .iter()
            .map(|(pod, handle)| (pod.clone(), handle.clone()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}
