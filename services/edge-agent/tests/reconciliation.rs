//! Integration tests for pod reconciliation.
//!
//! These tests drive the engine end to end against MockRuntime:
//! 1. Planning against the pod index and the runtime
//! 2. Applying plans with per-pod backoff
//! 3. Terminating pods and rebuilding the index
//! 4. Translating runtime state into pod status
//!
//! A ManualClock is shared by the engine and the runtime so timestamps and
//! backoff windows are deterministic.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use edged_reconcile::ManualClock;
use rstest::rstest;

use edged_agent::container_config::container_name;
use edged_agent::runtime::{
    ContainerStatus, RuntimeCall, CONTAINER_HASH_LABEL, CONTAINER_RESTART_COUNT_LABEL,
    POD_UID_LABEL,
};
use edged_agent::{
    ContainerEngine, ContainerId, ContainerSpec, ContainerState, EngineConfig, EngineError,
    KillReason, MockRuntime, Pod, PodPhase, PodUid, ProbeResult, RestartPolicy,
};

fn t0() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()
}

struct Harness {
    clock: ManualClock,
    runtime: Arc<MockRuntime>,
    engine: ContainerEngine,
}

fn harness() -> Harness {
    let clock = ManualClock::new(t0());
    let runtime = Arc::new(MockRuntime::with_clock(Arc::new(clock.clone())));
    let engine = ContainerEngine::with_clock(
        Arc::clone(&runtime) as Arc<dyn edged_agent::ContainerRuntime>,
        EngineConfig {
            hostname: "edge-1".to_string(),
            ..EngineConfig::default()
        },
        Arc::new(clock.clone()),
    );
    Harness {
        clock,
        runtime,
        engine,
    }
}

fn container(image: &str) -> ContainerSpec {
    ContainerSpec {
        name: "web".to_string(),
        image: image.to_string(),
        command: vec!["nginx".to_string()],
        args: vec!["-g".to_string(), "daemon off;".to_string()],
        env: vec![],
        resources: Default::default(),
        ports: vec![],
        working_dir: None,
    }
}

fn test_pod(uid: &str, policy: RestartPolicy) -> Pod {
    Pod {
        namespace: "edge".to_string(),
        name: format!("pod-{}", uid),
        uid: PodUid::from(uid),
        restart_policy: policy,
        containers: vec![container("nginx:1.25")],
        deletion_requested: false,
    }
}

fn labelled(id: &str, pod: &str, created_at: DateTime<Utc>) -> ContainerStatus {
    ContainerStatus {
        id: ContainerId::from(id),
        name: format!("k8s_web_{}", id),
        image: "nginx:1.25".to_string(),
        state: ContainerState::Running,
        exit_code: 0,
        created_at,
        started_at: Some(created_at),
        finished_at: None,
        reason: None,
        labels: HashMap::from([(POD_UID_LABEL.to_string(), pod.to_string())]),
    }
}

async fn indexed(h: &Harness, pod: &Pod) -> ContainerId {
    h.engine
        .index()
        .get(&pod.uid)
        .await
        .expect("pod should be indexed")
        .container_id
}

fn creates(runtime: &MockRuntime) -> usize {
    runtime
        .mutations()
        .iter()
        .filter(|call| matches!(call, RuntimeCall::Create(_)))
        .count()
}

#[tokio::test]
async fn test_fresh_pod_is_created_and_started() {
    let h = harness();
    let pod = test_pod("uid-1", RestartPolicy::Always);

    h.engine.sync_pod(&pod).await.unwrap();

    let id = indexed(&h, &pod).await;
    let name = container_name(&pod, &pod.containers[0], 0);
    assert_eq!(
        h.runtime.mutations(),
        vec![RuntimeCall::Create(name), RuntimeCall::Start(id.clone())]
    );

    let status = h.runtime.container(&id).unwrap();
    assert_eq!(status.state, ContainerState::Running);
    assert_eq!(status.pod_uid(), Some(pod.uid.clone()));
    assert_eq!(status.spec_hash(), Some(pod.containers[0].spec_hash()));
    assert_eq!(status.label(CONTAINER_RESTART_COUNT_LABEL), Some("0"));

    let record = h.engine.records().get(&id).await.unwrap();
    assert_eq!(record.pod_id, Some(pod.uid.clone()));
    assert_eq!(record.last_used, Some(t0()));
    assert_eq!(record.first_detected, t0());
}

#[tokio::test]
async fn test_plan_is_idempotent() {
    let h = harness();
    let pod = test_pod("uid-1", RestartPolicy::Always);

    let first = h.engine.plan(&pod).await;
    let second = h.engine.plan(&pod).await;
    assert_eq!(first, second);
    assert_eq!(first.containers_to_start, vec![0]);
    assert!(h.runtime.mutations().is_empty());

    h.engine.sync_pod(&pod).await.unwrap();

    let first = h.engine.plan(&pod).await;
    let second = h.engine.plan(&pod).await;
    assert_eq!(first, second);
    assert!(first.is_empty());
}

#[rstest]
#[case(1)]
#[case(3)]
#[case(10)]
#[tokio::test]
async fn test_repeated_syncs_start_once(#[case] passes: usize) {
    let h = harness();
    let pod = test_pod("uid-1", RestartPolicy::Always);

    for _ in 0..passes {
        h.engine.sync_pod(&pod).await.unwrap();
        h.clock.advance(Duration::from_secs(5));
    }

    assert_eq!(creates(&h.runtime), 1);
    assert_eq!(h.runtime.container_ids().len(), 1);
}

#[rstest]
#[case(RestartPolicy::Always, 0, true)]
#[case(RestartPolicy::Always, 1, true)]
#[case(RestartPolicy::OnFailure, 0, false)]
#[case(RestartPolicy::OnFailure, 137, true)]
#[case(RestartPolicy::Never, 0, false)]
#[case(RestartPolicy::Never, 1, false)]
#[tokio::test]
async fn test_exited_container_follows_restart_policy(
    #[case] policy: RestartPolicy,
    #[case] exit_code: i64,
    #[case] restarted: bool,
) {
    let h = harness();
    let pod = test_pod("uid-1", policy);
    h.engine.sync_pod(&pod).await.unwrap();
    let original = indexed(&h, &pod).await;

    h.clock.advance(Duration::from_secs(30));
    h.runtime
        .set_container_state(&original, ContainerState::Exited, exit_code);
    h.runtime.clear_calls();

    h.engine.sync_pod(&pod).await.unwrap();

    assert_eq!(creates(&h.runtime) == 1, restarted);
    let current = indexed(&h, &pod).await;
    if restarted {
        assert_ne!(current, original);
        let status = h.runtime.container(&current).unwrap();
        assert_eq!(status.state, ContainerState::Running);
        assert_eq!(status.label(CONTAINER_RESTART_COUNT_LABEL), Some("1"));
        assert_eq!(status.name, container_name(&pod, &pod.containers[0], 1));
        // The exited container is left for garbage collection.
        assert!(h.runtime.container(&original).is_some());
    } else {
        assert_eq!(current, original);
    }
}

#[tokio::test]
async fn test_only_first_container_is_managed() {
    let h = harness();
    let mut pod = test_pod("uid-1", RestartPolicy::Always);
    let mut sidecar = container("busybox:latest");
    sidecar.name = "sidecar".to_string();
    pod.containers.push(sidecar);

    for _ in 0..3 {
        h.engine.sync_pod(&pod).await.unwrap();
        h.clock.advance(Duration::from_secs(5));
    }

    assert_eq!(creates(&h.runtime), 1);
    assert_eq!(h.runtime.container_ids().len(), 1);
    let id = indexed(&h, &pod).await;
    assert_eq!(h.runtime.container(&id).unwrap().image, "nginx:1.25");
    assert!(h.engine.plan(&pod).await.is_empty());
}

#[rstest]
#[case("garbage")]
#[case("-1")]
#[case("")]
#[tokio::test]
async fn test_unreadable_restart_count_restarts_from_zero(#[case] label: &str) {
    let h = harness();
    let pod = test_pod("uid-1", RestartPolicy::Always);

    let mut status = labelled("exited000001", "uid-1", t0());
    status.state = ContainerState::Exited;
    status.exit_code = 1;
    status
        .labels
        .insert(CONTAINER_RESTART_COUNT_LABEL.to_string(), label.to_string());
    h.runtime.insert_container(status);
    h.engine.init_pod_index().await.unwrap();

    let actions = h.engine.plan(&pod).await;
    assert_eq!(actions.containers_to_start, vec![0]);
    assert_eq!(actions.restart_count, 0);
}

#[tokio::test]
async fn test_spec_change_kills_and_recreates() {
    let h = harness();
    let pod = test_pod("uid-1", RestartPolicy::Always);
    h.engine.sync_pod(&pod).await.unwrap();
    let original = indexed(&h, &pod).await;

    let mut updated = pod.clone();
    updated.containers[0].image = "nginx:1.27".to_string();

    let actions = h.engine.plan(&updated).await;
    assert_eq!(actions.containers_to_start, vec![0]);
    assert_eq!(actions.restart_count, 1);
    let kill = actions.containers_to_kill.get(&original).unwrap();
    assert_eq!(kill.name, "web");
    assert_eq!(
        kill.reason,
        KillReason::SpecChanged {
            current: pod.containers[0].spec_hash(),
            desired: updated.containers[0].spec_hash(),
        }
    );
    assert!(kill.reason.to_string().contains("spec hash changed"));

    h.runtime.clear_calls();
    h.engine.apply(&updated, &actions).await.unwrap();

    let mutations = h.runtime.mutations();
    assert_eq!(mutations[0], RuntimeCall::Stop(original.clone()));
    assert_eq!(mutations[1], RuntimeCall::Remove(original.clone()));
    assert!(h.runtime.container(&original).is_none());
    assert!(h.engine.records().get(&original).await.is_none());

    let replacement = indexed(&h, &updated).await;
    let status = h.runtime.container(&replacement).unwrap();
    assert_eq!(status.image, "nginx:1.27");
    assert_eq!(status.state, ContainerState::Running);
    assert_eq!(status.spec_hash(), Some(updated.containers[0].spec_hash()));
}

#[tokio::test]
async fn test_missing_hash_label_is_left_alone() {
    let h = harness();
    let pod = test_pod("uid-1", RestartPolicy::Always);

    let mut status = labelled("legacy0000001", "uid-1", t0());
    status
        .labels
        .insert(CONTAINER_HASH_LABEL.to_string(), "not-a-hash".to_string());
    h.runtime.insert_container(status);
    h.engine.init_pod_index().await.unwrap();

    let actions = h.engine.plan(&pod).await;
    assert!(actions.is_empty());
}

#[tokio::test]
async fn test_create_failure_backs_off() {
    let h = harness();
    let pod = test_pod("uid-1", RestartPolicy::Always);
    let key = pod.backoff_key();
    h.runtime.set_fail_create(true);

    let err = h.engine.sync_pod(&pod).await.unwrap_err();
    assert!(matches!(err, EngineError::Runtime(_)));
    assert_eq!(h.engine.backoff_attempts(&key), 1);
    assert!(h.engine.index().get(&pod.uid).await.is_none());

    // While backed off nothing touches the runtime.
    h.runtime.clear_calls();
    let err = h.engine.sync_pod(&pod).await.unwrap_err();
    assert!(err.is_backoff());
    assert!(h.runtime.mutations().is_empty());

    let remaining = h.engine.backoff_remaining(&key).unwrap();
    assert!(remaining <= Duration::from_secs(10));
    h.clock.advance(remaining + Duration::from_secs(1));
    h.runtime.heal();

    h.engine.sync_pod(&pod).await.unwrap();
    assert_eq!(h.engine.backoff_attempts(&key), 0);
    assert_eq!(creates(&h.runtime), 1);
}

#[tokio::test]
async fn test_start_failure_keeps_container_indexed() {
    let h = harness();
    let pod = test_pod("uid-1", RestartPolicy::Always);
    h.runtime.set_fail_start(true);

    let err = h.engine.sync_pod(&pod).await.unwrap_err();
    let EngineError::StartFailed { container_id, .. } = err else {
        panic!("expected StartFailed, got {:?}", err);
    };
    assert_eq!(indexed(&h, &pod).await, container_id);
    assert!(h.engine.records().contains(&container_id).await);
    assert_eq!(h.engine.backoff_attempts(&pod.backoff_key()), 1);

    let status = h.engine.pod_status(&pod).await;
    assert_eq!(status.phase, PodPhase::Failed);

    // Once the backoff window passes the created container is replaced.
    h.runtime.heal();
    h.clock.advance(Duration::from_secs(11));
    h.engine.sync_pod(&pod).await.unwrap();

    let replacement = indexed(&h, &pod).await;
    assert_ne!(replacement, container_id);
    assert_eq!(
        h.runtime.container(&replacement).unwrap().state,
        ContainerState::Running
    );
    assert_eq!(h.engine.backoff_attempts(&pod.backoff_key()), 0);
}

#[rstest]
#[case(RestartPolicy::Always, true)]
#[case(RestartPolicy::OnFailure, true)]
#[case(RestartPolicy::Never, false)]
#[tokio::test]
async fn test_liveness_failure_kills_container(
    #[case] policy: RestartPolicy,
    #[case] replaced: bool,
) {
    let h = harness();
    let pod = test_pod("uid-1", policy);
    h.engine.sync_pod(&pod).await.unwrap();
    let original = indexed(&h, &pod).await;

    h.engine
        .liveness()
        .set(original.clone(), ProbeResult::Failure)
        .await;

    let actions = h.engine.plan(&pod).await;
    assert_eq!(
        actions.containers_to_kill.get(&original).map(|k| &k.reason),
        Some(&KillReason::LivenessFailed)
    );
    assert_eq!(!actions.containers_to_start.is_empty(), replaced);

    assert_eq!(
        actions.containers_to_kill.get(&original).map(|k| k.keep),
        Some(!replaced)
    );

    h.engine.apply(&pod, &actions).await.unwrap();
    assert_eq!(h.engine.liveness().get(&original).await, None);

    if replaced {
        assert!(h.runtime.container(&original).is_none());
        assert_ne!(indexed(&h, &pod).await, original);
    } else {
        // Stopped in place and still reported for the pod.
        let status = h.runtime.container(&original).unwrap();
        assert_eq!(status.state, ContainerState::Exited);
        assert_eq!(indexed(&h, &pod).await, original);
        assert_eq!(
            h.engine.records().get(&original).await.unwrap().state,
            ContainerState::Exited
        );
    }

    // Later passes leave the pod alone.
    h.clock.advance(Duration::from_secs(30));
    h.runtime.clear_calls();
    h.engine.sync_pod(&pod).await.unwrap();
    h.engine.sync_pod(&pod).await.unwrap();
    assert!(h.runtime.mutations().is_empty());
}

#[tokio::test]
async fn test_failed_stop_still_removes_on_spec_change() {
    let h = harness();
    let pod = test_pod("uid-1", RestartPolicy::Always);
    h.engine.sync_pod(&pod).await.unwrap();
    let original = indexed(&h, &pod).await;

    let mut updated = pod.clone();
    updated.containers[0].image = "nginx:1.27".to_string();
    h.runtime.fail_stop_for(&original);
    h.runtime.clear_calls();

    h.engine.sync_pod(&updated).await.unwrap();

    assert!(h
        .runtime
        .mutations()
        .contains(&RuntimeCall::Remove(original.clone())));
    assert!(h.runtime.container(&original).is_none());
    assert!(h.engine.records().get(&original).await.is_none());

    let replacement = indexed(&h, &updated).await;
    assert_ne!(replacement, original);
    let status = h.runtime.container(&replacement).unwrap();
    assert_eq!(status.state, ContainerState::Running);
    assert_eq!(status.image, "nginx:1.27");
}

#[tokio::test]
async fn test_failed_kill_aborts_pass() {
    let h = harness();
    let pod = test_pod("uid-1", RestartPolicy::Always);
    h.engine.sync_pod(&pod).await.unwrap();
    let original = indexed(&h, &pod).await;

    let mut updated = pod.clone();
    updated.containers[0].image = "nginx:1.27".to_string();
    h.runtime.fail_remove_for(&original);
    h.runtime.clear_calls();

    let err = h.engine.sync_pod(&updated).await.unwrap_err();
    assert!(matches!(err, EngineError::Runtime(_)));
    assert_eq!(creates(&h.runtime), 0);
    assert_eq!(indexed(&h, &pod).await, original);
}

#[tokio::test]
async fn test_terminate_pod() {
    let h = harness();
    let pod = test_pod("uid-1", RestartPolicy::Always);
    h.engine.sync_pod(&pod).await.unwrap();
    let id = indexed(&h, &pod).await;

    h.engine.terminate_pod(&pod.uid).await.unwrap();

    assert!(h.runtime.container(&id).is_none());
    assert!(h.engine.index().get(&pod.uid).await.is_none());
    assert!(h.engine.records().is_empty().await);

    let err = h.engine.terminate_pod(&pod.uid).await.unwrap_err();
    assert!(matches!(err, EngineError::PodNotFound(uid) if uid == pod.uid));
}

#[tokio::test]
async fn test_deletion_requested_terminates() {
    let h = harness();
    let mut pod = test_pod("uid-1", RestartPolicy::Always);
    h.engine.sync_pod(&pod).await.unwrap();

    pod.deletion_requested = true;
    h.engine.sync_pod(&pod).await.unwrap();
    assert!(h.runtime.container_ids().is_empty());

    // Already gone: still fine.
    h.engine.sync_pod(&pod).await.unwrap();

    let status = h.engine.pod_status(&pod).await;
    assert_eq!(status.phase, PodPhase::Succeeded);
}

#[tokio::test]
async fn test_cleanup_orphaned_pods() {
    let h = harness();
    let pods: Vec<Pod> = ["uid-a", "uid-b", "uid-c"]
        .iter()
        .map(|uid| test_pod(uid, RestartPolicy::Always))
        .collect();
    for pod in &pods {
        h.engine.sync_pod(pod).await.unwrap();
    }

    let desired = HashSet::from([PodUid::from("uid-b")]);
    let mut terminated = h.engine.cleanup_orphaned_pods(&desired).await.unwrap();
    terminated.sort();

    assert_eq!(terminated, vec![PodUid::from("uid-a"), PodUid::from("uid-c")]);
    assert_eq!(h.engine.index().pod_uids().await, vec![PodUid::from("uid-b")]);
    assert_eq!(h.runtime.container_ids().len(), 1);
}

#[tokio::test]
async fn test_cleanup_orphaned_pods_attempts_all() {
    let h = harness();
    let a = test_pod("uid-a", RestartPolicy::Always);
    let c = test_pod("uid-c", RestartPolicy::Always);
    h.engine.sync_pod(&a).await.unwrap();
    h.engine.sync_pod(&c).await.unwrap();
    let stuck = indexed(&h, &a).await;
    h.runtime.fail_remove_for(&stuck);

    let result = h.engine.cleanup_orphaned_pods(&HashSet::new()).await;

    assert!(matches!(result, Err(EngineError::Runtime(_))));
    assert!(h.engine.index().get(&c.uid).await.is_none());
    assert_eq!(indexed(&h, &a).await, stuck);
}

#[tokio::test]
async fn test_init_pod_index_prefers_newest() {
    let h = harness();
    h.runtime
        .insert_container(labelled("old000000001", "uid-1", t0() - chrono::Duration::seconds(100)));
    h.runtime
        .insert_container(labelled("new000000001", "uid-1", t0() - chrono::Duration::seconds(10)));
    let mut unmanaged = labelled("other0000001", "uid-1", t0());
    unmanaged.labels.clear();
    h.runtime.insert_container(unmanaged);

    let indexed_pods = h.engine.init_pod_index().await.unwrap();

    assert_eq!(indexed_pods, 1);
    let handle = h.engine.index().get(&PodUid::from("uid-1")).await.unwrap();
    assert_eq!(handle.container_id, ContainerId::from("new000000001"));
    assert_eq!(handle.started_at, t0() - chrono::Duration::seconds(10));

    assert!(h.engine.records().contains(&ContainerId::from("old000000001")).await);
    assert!(!h.engine.records().contains(&ContainerId::from("other0000001")).await);
}

#[tokio::test]
async fn test_pod_status_reports_running_and_ready() {
    let h = harness();
    let pod = test_pod("uid-1", RestartPolicy::Always);

    let pending = h.engine.pod_status(&pod).await;
    assert_eq!(pending.phase, PodPhase::Pending);
    assert_eq!(
        pending.conditions[0].message.as_deref(),
        Some("containers with unready status: [web]")
    );

    h.engine.sync_pod(&pod).await.unwrap();

    let running = h.engine.pod_status(&pod).await;
    assert_eq!(running.phase, PodPhase::Running);
    assert!(running.conditions[0].status);
    assert!(running.container_statuses[0].ready);

    let id = indexed(&h, &pod).await;
    h.runtime.fail_inspect_for(&id);
    let unknown = h.engine.pod_status(&pod).await;
    assert_eq!(unknown.phase, PodPhase::Unknown);
}

#[tokio::test]
async fn test_pod_status_after_exit() {
    let h = harness();
    let pod = test_pod("uid-1", RestartPolicy::OnFailure);
    h.engine.sync_pod(&pod).await.unwrap();
    let id = indexed(&h, &pod).await;

    h.runtime.set_container_state(&id, ContainerState::Exited, 0);
    assert_eq!(h.engine.pod_status(&pod).await.phase, PodPhase::Succeeded);

    h.runtime.set_container_state(&id, ContainerState::Exited, 2);
    let failed = h.engine.pod_status(&pod).await;
    assert_eq!(failed.phase, PodPhase::Failed);
    assert_eq!(failed.container_statuses[0].restart_count, 0);
}
