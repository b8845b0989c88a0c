//! Liveness probe results.
//!
//! Probing itself happens elsewhere; the prober writes results here and the
//! planner reads them. A container with no result is treated as alive.

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::runtime::ContainerId;

/// Outcome of the most recent liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    Success,
    Failure,
}

/// Latest liveness result per container.
#[derive(Debug, Default)]
pub struct LivenessResults {
    results: RwLock<HashMap<ContainerId, ProbeResult>>,
}

impl LivenessResults {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, id: ContainerId, result: ProbeResult) {
        self.results.write().await.insert(id, result);
    }

    pub async fn get(&self, id: &ContainerId) -> Option<ProbeResult> {
        self.results.read().await.get(id).copied()
    }

    /// Whether the latest probe for `id` failed.
    pub async fn is_failing(&self, id: &ContainerId) -> bool {
        self.get(id).await == Some(ProbeResult::Failure)
    }

    pub async fn remove(&self, id: &ContainerId) {
        self.results.write().await.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_result_is_not_failing() {
        let results = LivenessResults::new();
        assert!(!results.is_failing(&ContainerId::from("c1")).await);
    }

    #[tokio::test]
    async fn test_failure_recorded_and_cleared() {
        let results = LivenessResults::new();
        let id = ContainerId::from("c1");

        results.set(id.clone(), ProbeResult::Failure).await;
        assert!(results.is_failing(&id).await);

        results.set(id.clone(), ProbeResult::Success).await;
        assert!(!results.is_failing(&id).await);

        results.remove(&id).await;
        assert_eq!(results.get(&id).await, None);
    }
}
