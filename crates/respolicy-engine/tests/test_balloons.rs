use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::Path;
use std::rc::Rc;

use sugars::{rc, refcell};

use respolicy_core::Pipeline;
use respolicy_engine::controllers::HostPaths;
use respolicy_engine::core::common::QosClass;
use respolicy_engine::core::config::DaemonConfig;
use respolicy_engine::core::events::lifecycle::{
    ContainerSpec, CreateContainer, PodSpec, RemoveContainer, RemovePodSandbox, RunPodSandbox, StopContainer,
};
use respolicy_engine::core::ResourceRequest;
use respolicy_engine::engine::Engine;
use respolicy_engine::runtime::{AdjustmentSink, RecordingSink};
use respolicy_topology::system::{CoreKind, CpuInfo, MemType, NodeInfo};
use respolicy_topology::{CpuSet, System};

fn name_wrapper(file_name: &str) -> String {
    format!("tests/test-configs/{}", file_name)
}

fn cpu(id: u32, package: u32, numa: u32) -> CpuInfo {
    CpuInfo {
        id,
        package_id: package,
        die_id: 0,
        cluster_id: None,
        core_id: id % 8,
        numa_node: numa,
        core_cpus: [id].into_iter().collect(),
        base_freq_khz: 0,
        min_freq_khz: 0,
        max_freq_khz: 0,
        core_kind: CoreKind::Unknown,
    }
}

// 16 CPUs, 2 packages, 4 NUMA nodes of 4 CPUs each.
fn quad_numa_system() -> System {
    let nodes = (0..4u32)
        .map(|id| NodeInfo {
            id,
            cpus: (id * 4..id * 4 + 4).collect(),
            mem_total_kb: 8 * 1024 * 1024,
            mem_type: MemType::Dram,
            distances: (0..4).map(|other| (other, if other == id { 10 } else { 21 })).collect(),
            hugepages: BTreeMap::new(),
        })
        .collect();
    System::from_parts(
        (0..16).map(|i| cpu(i, i / 8, i / 4)).collect(),
        nodes,
        vec![],
        CpuSet::new(),
    )
}

#[allow(clippy::type_complexity)]
fn build_engine(
    system: System,
    cstate_override: Option<&Path>,
) -> (Pipeline, u32, Rc<RefCell<RecordingSink>>, Rc<RefCell<Engine>>) {
    let mut pipeline = Pipeline::new();
    let ctx = pipeline.create_context("engine");
    let sink = rc!(refcell!(RecordingSink::new()));
    let dyn_sink: Rc<RefCell<dyn AdjustmentSink>> = sink.clone();
    let config = DaemonConfig::from_file(Path::new(&name_wrapper("balloons.yaml"))).unwrap();
    let mut paths = HostPaths::new(Path::new("/nonexistent-host-root"));
    if let Some(dir) = cstate_override {
        paths = paths.with_cstate_override(dir.to_path_buf());
    }
    let engine = rc!(refcell!(Engine::new(
        system,
        config,
        paths,
        dyn_sink,
        None,
        ctx,
    )
    .unwrap()));
    let id = pipeline.add_handler("engine", engine.clone());
    (pipeline, id, sink, engine)
}

fn pod_spec(uid: &str, namespace: &str, qos: QosClass, annotations: &[(&str, &str)]) -> PodSpec {
    PodSpec {
        uid: uid.to_string(),
        namespace: namespace.to_string(),
        name: format!("{}-name", uid),
        qos,
        labels: BTreeMap::new(),
        annotations: annotations
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    }
}

fn ctr_spec(id: &str, pod_uid: &str, milli: u64) -> ContainerSpec {
    ContainerSpec {
        id: id.to_string(),
        pod_uid: pod_uid.to_string(),
        name: id.to_string(),
        request: ResourceRequest {
            cpu_milli: milli,
            ..ResourceRequest::default()
        },
    }
}

fn cstate_file(dir: &Path, cpu: u32, state: &str) -> Option<String> {
    std::fs::read_to_string(dir.join(format!("cpu{}", cpu)).join(state).join("disable")).ok()
}

#[test]
// A lowlatency container is pinned to one CPU with C4/C8 disabled there
// and runs under SCHED_FIFO priority 56.
fn lowlatency_balloon_applies_cstates_and_scheduling() {
    let override_dir = tempfile::tempdir().unwrap();
    let (mut pipeline, engine_id, sink, _engine) = build_engine(quad_numa_system(), Some(override_dir.path()));
    let sender = pipeline.sender("runtime");

    sender.emit(
        RunPodSandbox {
            pod: pod_spec(
                "p1",
                "default",
                QosClass::Burstable,
                &[("balloon.respolicy.io", "lowlatency")],
            ),
        },
        engine_id,
    );
    sender.emit(
        CreateContainer {
            container: ctr_spec("c0", "p1", 750),
        },
        engine_id,
    );
    pipeline.drain();

    let sink = sink.borrow();
    let adjustment = sink.last_for("c0").unwrap();
    let cpus = CpuSet::parse(adjustment.cpuset_cpus.as_ref().unwrap()).unwrap();
    assert_eq!(cpus.len(), 1);

    let sched = adjustment.sched.as_ref().unwrap();
    assert_eq!(sched.policy.number(), 1);
    assert_eq!(sched.priority, 56);

    let pinned = cpus.first().unwrap();
    assert_eq!(cstate_file(override_dir.path(), pinned, "C4").as_deref(), Some("1"));
    assert_eq!(cstate_file(override_dir.path(), pinned, "C8").as_deref(), Some("1"));
}

#[test]
// A composite balance-all-nodes balloon spreads one CPU per NUMA node and
// survives the deletion of its last pod at its minimum instance count.
fn composite_balloon_spreads_over_all_numa_nodes() {
    let (mut pipeline, engine_id, sink, engine) = build_engine(quad_numa_system(), None);
    let sender = pipeline.sender("runtime");

    sender.emit(
        RunPodSandbox {
            pod: pod_spec(
                "p2",
                "default",
                QosClass::Burstable,
                &[("balloon.respolicy.io", "balance-all-nodes")],
            ),
        },
        engine_id,
    );
    sender.emit(
        CreateContainer {
            container: ctr_spec("c0", "p2", 500),
        },
        engine_id,
    );
    sender.emit(
        CreateContainer {
            container: ctr_spec("c1", "p2", 500),
        },
        engine_id,
    );
    pipeline.drain();

    {
        let sink = sink.borrow();
        for id in ["c0", "c1"] {
            let cpus = CpuSet::parse(sink.last_for(id).unwrap().cpuset_cpus.as_ref().unwrap()).unwrap();
            assert_eq!(cpus.len(), 4);
            // One CPU from every NUMA node.
            for node in 0..4u32 {
                let node_cpus: CpuSet = (node * 4..node * 4 + 4).collect();
                assert_eq!(cpus.intersection(&node_cpus).len(), 1);
            }
        }
    }

    sender.emit(
        StopContainer {
            container_id: "c0".to_string(),
        },
        engine_id,
    );
    sender.emit(
        StopContainer {
            container_id: "c1".to_string(),
        },
        engine_id,
    );
    sender.emit(
        RemoveContainer {
            container_id: "c0".to_string(),
        },
        engine_id,
    );
    sender.emit(
        RemoveContainer {
            container_id: "c1".to_string(),
        },
        engine_id,
    );
    sender.emit(
        RemovePodSandbox {
            pod_uid: "p2".to_string(),
        },
        engine_id,
    );
    pipeline.drain();

    // The minimum instance survives, still one CPU per node.
    let engine = engine.borrow();
    let metrics = engine.metrics();
    let balloons = metrics["balloons"].as_array().unwrap();
    let composite = balloons
        .iter()
        .find(|b| b["class"] == "balance-all-nodes")
        .expect("balloon deleted");
    let cpus = CpuSet::parse(composite["cpus"].as_str().unwrap()).unwrap();
    assert_eq!(cpus.len(), 4);
    for node in 0..4u32 {
        let node_cpus: CpuSet = (node * 4..node * 4 + 4).collect();
        assert_eq!(cpus.intersection(&node_cpus).len(), 1);
    }
    assert_eq!(composite["members"].as_u64(), Some(0));
}

#[test]
// A kube-system pod without a class annotation lands in the reserved
// balloon whose CPU set equals the reserved resources.
fn reserved_namespace_lands_in_reserved_balloon() {
    let (mut pipeline, engine_id, sink, _engine) = build_engine(quad_numa_system(), None);
    let sender = pipeline.sender("runtime");

    sender.emit(
        RunPodSandbox {
            pod: pod_spec("p0", "kube-system", QosClass::Burstable, &[]),
        },
        engine_id,
    );
    sender.emit(
        CreateContainer {
            container: ctr_spec("c0", "p0", 300),
        },
        engine_id,
    );
    pipeline.drain();

    let sink = sink.borrow();
    let adjustment = sink.last_for("c0").unwrap();
    assert_eq!(adjustment.cpuset_cpus.as_deref(), Some("0-1"));
    let balloon_env = adjustment.env.iter().find(|e| e.name == "BALLOON").unwrap();
    assert_eq!(balloon_env.value, "reserved[0]");
}

#[test]
// Balloon deflation re-enables every c-state on the freed CPUs while the
// retained CPU keeps its states disabled.
fn deflation_reenables_cstates_on_freed_cpus() {
    let override_dir = tempfile::tempdir().unwrap();
    let (mut pipeline, engine_id, sink, _engine) = build_engine(quad_numa_system(), Some(override_dir.path()));
    let sender = pipeline.sender("runtime");

    sender.emit(
        RunPodSandbox {
            pod: pod_spec(
                "p0",
                "default",
                QosClass::Burstable,
                &[("balloon.respolicy.io", "lowlatency")],
            ),
        },
        engine_id,
    );
    sender.emit(
        CreateContainer {
            container: ctr_spec("keep", "p0", 1000),
        },
        engine_id,
    );
    sender.emit(
        CreateContainer {
            container: ctr_spec("burst", "p0", 3000),
        },
        engine_id,
    );
    pipeline.drain();

    let inflated = CpuSet::parse(
        sink.borrow()
            .last_for("burst")
            .unwrap()
            .cpuset_cpus
            .as_ref()
            .unwrap(),
    )
    .unwrap();
    assert_eq!(inflated.len(), 4);
    for cpu in inflated.iter() {
        assert_eq!(cstate_file(override_dir.path(), cpu, "C4").as_deref(), Some("1"));
    }

    sender.emit(
        StopContainer {
            container_id: "burst".to_string(),
        },
        engine_id,
    );
    pipeline.drain();

    let retained = CpuSet::parse(
        sink.borrow()
            .last_for("keep")
            .unwrap()
            .cpuset_cpus
            .as_ref()
            .unwrap(),
    )
    .unwrap();
    assert_eq!(retained.len(), 1);
    let freed = inflated.difference(&retained);
    assert_eq!(freed.len(), 3);
    for cpu in freed.iter() {
        assert_eq!(cstate_file(override_dir.path(), cpu, "C4").as_deref(), Some("0"));
        assert_eq!(cstate_file(override_dir.path(), cpu, "C8").as_deref(), Some("0"));
    }
    let kept = retained.first().unwrap();
    assert_eq!(cstate_file(override_dir.path(), kept, "C4").as_deref(), Some("1"));
    assert_eq!(cstate_file(override_dir.path(), kept, "C8").as_deref(), Some("1"));
}

#[test]
// Members of one balloon share the balloon's exact CPU set.
fn members_share_the_balloon_cpuset() {
    let (mut pipeline, engine_id, sink, _engine) = build_engine(quad_numa_system(), None);
    let sender = pipeline.sender("runtime");

    sender.emit(
        RunPodSandbox {
            pod: pod_spec(
                "p0",
                "default",
                QosClass::Burstable,
                &[("balloon.respolicy.io", "lowlatency")],
            ),
        },
        engine_id,
    );
    sender.emit(
        CreateContainer {
            container: ctr_spec("c0", "p0", 1000),
        },
        engine_id,
    );
    sender.emit(
        CreateContainer {
            container: ctr_spec("c1", "p0", 1000),
        },
        engine_id,
    );
    pipeline.drain();

    let sink = sink.borrow();
    let cpus0 = sink.last_for("c0").unwrap().cpuset_cpus.clone().unwrap();
    let cpus1 = sink.last_for("c1").unwrap().cpuset_cpus.clone().unwrap();
    assert_eq!(cpus0, cpus1);
    assert_eq!(CpuSet::parse(&cpus0).unwrap().len(), 2);
}

#[test]
// A class capped in both size and instance count rejects what cannot fit.
fn capped_class_rejects_overflow() {
    let (mut pipeline, engine_id, sink, _engine) = build_engine(quad_numa_system(), None);
    let sender = pipeline.sender("runtime");

    sender.emit(
        RunPodSandbox {
            pod: pod_spec(
                "p0",
                "default",
                QosClass::Burstable,
                &[("balloon.respolicy.io", "capped")],
            ),
        },
        engine_id,
    );
    for id in ["c0", "c1", "c2"] {
        sender.emit(
            CreateContainer {
                container: ctr_spec(id, "p0", 1000),
            },
            engine_id,
        );
    }
    pipeline.drain();

    let sink = sink.borrow();
    assert!(sink.last_for("c0").is_some());
    assert!(sink.last_for("c1").is_some());
    assert!(sink.last_for("c2").is_none());
    assert_eq!(sink.failures.len(), 1);
    assert_eq!(sink.failures[0].0, "c2");
    assert!(sink.failures[0].1.contains("not enough free CPUs"));
}
