use std::collections::BTreeMap;

use respolicy_engine::core::cache::{Cache, CpuKnobDelta, PendingKind, CACHE_SCHEMA_VERSION};
use respolicy_engine::core::common::{CgroupParams, QosClass, ResourceRequest, SchedParams, SchedPolicy};
use respolicy_engine::core::container::{Container, ContainerState};
use respolicy_engine::core::errors::CacheError;
use respolicy_engine::core::pod::Pod;
use respolicy_topology::CpuSet;

fn pod(uid: &str, namespace: &str) -> Pod {
    Pod {
        uid: uid.to_string(),
        namespace: namespace.to_string(),
        name: format!("{}-name", uid),
        qos: QosClass::Burstable,
        labels: BTreeMap::new(),
        annotations: BTreeMap::new(),
        containers: Default::default(),
    }
}

fn container(id: &str, pod_uid: &str, milli: u64) -> Container {
    Container::new(
        id,
        pod_uid,
        id,
        ResourceRequest {
            cpu_milli: milli,
            ..ResourceRequest::default()
        },
    )
}

#[test]
fn containers_link_to_their_pod() {
    let mut cache = Cache::new();
    cache.insert_pod(pod("p0", "default"));
    cache.insert_container(container("c0", "p0", 500));
    cache.insert_container(container("c1", "p0", 250));

    assert_eq!(cache.pod("p0").unwrap().containers.len(), 2);
    assert_eq!(cache.pod_of("c1").unwrap().uid, "p0");
    assert_eq!(cache.lookup_container("c0").unwrap().request.cpu_milli, 500);

    // A pod with containers cannot be removed.
    assert!(cache.remove_pod("p0").is_none());
    cache.remove_container("c0");
    cache.remove_container("c1");
    assert!(cache.remove_pod("p0").is_some());
}

#[test]
fn mutators_mark_controller_pending_sets() {
    let mut cache = Cache::new();
    cache.insert_pod(pod("p0", "default"));
    cache.insert_container(container("c0", "p0", 500));

    cache.set_cpusets(
        "c0",
        CpuSet::parse("1").unwrap(),
        CpuSet::new(),
        CpuSet::parse("0").unwrap(),
    );
    assert_eq!(cache.pending_containers(PendingKind::Cpuset), vec!["c0".to_string()]);
    assert!(cache.pending_containers(PendingKind::Cgroup).is_empty());

    cache.set_cgroup(
        "c0",
        CgroupParams {
            cpu_weight: Some(50),
            blockio_weight: Some(100),
            rdt_class: Some("gold".to_string()),
            ..CgroupParams::default()
        },
    );
    assert_eq!(cache.pending_containers(PendingKind::Cgroup), vec!["c0".to_string()]);
    assert_eq!(cache.pending_containers(PendingKind::Blockio), vec!["c0".to_string()]);
    assert_eq!(cache.pending_containers(PendingKind::Rdt), vec!["c0".to_string()]);

    cache.set_sched(
        "c0",
        Some(SchedParams {
            policy: SchedPolicy::Fifo,
            priority: 10,
            ..SchedParams::default()
        }),
    );
    assert_eq!(cache.pending_containers(PendingKind::Sched), vec!["c0".to_string()]);

    cache.clear_pending(PendingKind::Cpuset);
    assert!(cache.pending_containers(PendingKind::Cpuset).is_empty());
}

#[test]
fn state_transitions_are_guarded() {
    let mut cache = Cache::new();
    cache.insert_pod(pod("p0", "default"));
    cache.insert_container(container("c0", "p0", 0));

    assert_eq!(cache.lookup_container("c0").unwrap().state, ContainerState::Creating);
    assert!(cache.set_state("c0", ContainerState::Created));
    assert!(cache.set_state("c0", ContainerState::Running));
    // Running cannot jump back to Created.
    assert!(!cache.set_state("c0", ContainerState::Created));
    assert!(cache.set_state("c0", ContainerState::Exited));
    assert!(cache.set_state("c0", ContainerState::Stopped));
}

#[test]
// serialize -> deserialize -> serialize yields the identical blob when no
// events intervene.
fn blob_round_trip_is_identical() {
    let mut cache = Cache::new();
    cache.insert_pod(pod("p0", "default"));
    cache.insert_pod(pod("p1", "prod"));
    cache.insert_container(container("c0", "p0", 500));
    cache.insert_container(container("c1", "p1", 1500));
    cache.set_cpusets("c0", CpuSet::parse("2").unwrap(), CpuSet::new(), CpuSet::parse("0").unwrap());
    cache.set_policy_state(serde_json::json!({"grants": ["c0"]}));

    let blob = cache.to_json().unwrap();
    let restored = Cache::from_json(&blob).unwrap();
    assert_eq!(restored.to_json().unwrap(), blob);
    assert_eq!(
        restored.lookup_container("c0").unwrap().assignment.exclusive_cpus,
        CpuSet::parse("2").unwrap()
    );
    // Pending deltas are transient and never persisted.
    assert!(restored.pending_containers(PendingKind::Cpuset).is_empty());
}

#[test]
fn schema_mismatch_is_rejected_wholesale() {
    let mut cache = Cache::new();
    cache.insert_pod(pod("p0", "default"));
    let blob = cache.to_json().unwrap();
    let tampered = blob.replace(
        &format!("\"schema_version\": {}", CACHE_SCHEMA_VERSION),
        "\"schema_version\": 999",
    );
    match Cache::from_json(&tampered) {
        Err(CacheError::SchemaVersion { found, expected }) => {
            assert_eq!(found, 999);
            assert_eq!(expected, CACHE_SCHEMA_VERSION);
        }
        other => panic!("expected SchemaVersion error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn checkpoint_restore_rolls_back_entities_and_deltas() {
    let mut cache = Cache::new();
    cache.insert_pod(pod("p0", "default"));
    cache.insert_container(container("c0", "p0", 500));

    let checkpoint = cache.checkpoint();

    cache.insert_container(container("c1", "p0", 250));
    cache.set_cpusets("c0", CpuSet::parse("3").unwrap(), CpuSet::new(), CpuSet::new());
    cache.push_cpu_knob(3, |knob: &mut CpuKnobDelta| {
        knob.cstates.insert("C6".to_string(), false);
    });

    cache.restore(checkpoint);
    assert!(cache.lookup_container("c1").is_none());
    assert!(cache.lookup_container("c0").unwrap().assignment.exclusive_cpus.is_empty());
    assert!(cache.pending_containers(PendingKind::Cpuset).is_empty());
    assert!(cache.take_cpu_knobs().is_empty());
}

#[test]
fn save_and_load_via_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache");

    let mut cache = Cache::new();
    cache.insert_pod(pod("p0", "kube-system"));
    cache.insert_container(container("c0", "p0", 100));
    cache.save(&path).unwrap();

    let restored = Cache::load(&path).unwrap();
    assert_eq!(restored.pod("p0").unwrap().namespace, "kube-system");
    assert_eq!(restored.lookup_container("c0").unwrap().request.cpu_milli, 100);
}
