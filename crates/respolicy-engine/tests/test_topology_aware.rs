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
    ContainerSpec, CreateContainer, PodSpec, RemoveContainer, RunPodSandbox, StopContainer,
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

fn dram_node(id: u32, cpus: &[u32], distances: &[(u32, u32)]) -> NodeInfo {
    NodeInfo {
        id,
        cpus: cpus.iter().copied().collect(),
        mem_total_kb: 8 * 1024 * 1024,
        mem_type: MemType::Dram,
        distances: distances.iter().copied().collect(),
        hugepages: BTreeMap::new(),
    }
}

// 16 CPUs, 2 packages, 4 NUMA nodes of 4 CPUs each.
fn quad_numa_system() -> System {
    let nodes = (0..4u32)
        .map(|id| {
            let cpus: Vec<u32> = (id * 4..id * 4 + 4).collect();
            let distances: Vec<(u32, u32)> = (0..4)
                .map(|other| {
                    let d = if other == id {
                        10
                    } else if other / 2 == id / 2 {
                        12
                    } else {
                        21
                    };
                    (other, d)
                })
                .collect();
            dram_node(id, &cpus, &distances)
        })
        .collect();
    System::from_parts(
        (0..16).map(|i| cpu(i, i / 8, i / 4)).collect(),
        nodes,
        vec![],
        CpuSet::new(),
    )
}

// Two sockets with one DRAM node each, an HBM node next to package 0 and a
// PMEM node next to package 1.
fn hbm_system() -> System {
    let nodes = vec![
        dram_node(0, &[0, 1, 2, 3], &[(0, 10), (1, 21), (2, 17), (3, 28)]),
        dram_node(1, &[4, 5, 6, 7], &[(0, 21), (1, 10), (2, 28), (3, 17)]),
        NodeInfo {
            id: 2,
            cpus: CpuSet::new(),
            mem_total_kb: 4 * 1024 * 1024,
            mem_type: MemType::Hbm,
            distances: [(0, 17), (1, 28), (2, 10), (3, 38)].into_iter().collect(),
            hugepages: BTreeMap::new(),
        },
        NodeInfo {
            id: 3,
            cpus: CpuSet::new(),
            mem_total_kb: 64 * 1024 * 1024,
            mem_type: MemType::Pmem,
            distances: [(0, 28), (1, 17), (2, 38), (3, 10)].into_iter().collect(),
            hugepages: BTreeMap::new(),
        },
    ];
    System::from_parts((0..8).map(|i| cpu(i, i / 4, i / 4)).collect(), nodes, vec![], CpuSet::new())
}

#[allow(clippy::type_complexity)]
fn build_engine(
    system: System,
    config_file: &str,
) -> (Pipeline, u32, Rc<RefCell<RecordingSink>>, Rc<RefCell<Engine>>) {
    let mut pipeline = Pipeline::new();
    let ctx = pipeline.create_context("engine");
    let sink = rc!(refcell!(RecordingSink::new()));
    let dyn_sink: Rc<RefCell<dyn AdjustmentSink>> = sink.clone();
    let config = DaemonConfig::from_file(Path::new(&name_wrapper(config_file))).unwrap();
    let engine = rc!(refcell!(Engine::new(
        system,
        config,
        HostPaths::new(Path::new("/nonexistent-host-root")),
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

fn ctr_spec(id: &str, pod_uid: &str, milli: u64, memory: u64) -> ContainerSpec {
    ContainerSpec {
        id: id.to_string(),
        pod_uid: pod_uid.to_string(),
        name: id.to_string(),
        request: ResourceRequest {
            cpu_milli: milli,
            memory_bytes: memory,
            ..ResourceRequest::default()
        },
    }
}

#[test]
// Two Guaranteed 750m containers of the same pod land on disjoint single
// CPUs of the same NUMA node, with a single-node memory mask.
fn guaranteed_fractional_pair_shares_one_numa_node() {
    let (mut pipeline, engine_id, sink, _engine) = build_engine(quad_numa_system(), "topology-aware.yaml");
    let sender = pipeline.sender("runtime");

    sender.emit(
        RunPodSandbox {
            pod: pod_spec("p0", "default", QosClass::Guaranteed, &[]),
        },
        engine_id,
    );
    sender.emit(
        CreateContainer {
            container: ctr_spec("c0", "p0", 750, 100 * 1024 * 1024),
        },
        engine_id,
    );
    sender.emit(
        CreateContainer {
            container: ctr_spec("c1", "p0", 750, 100 * 1024 * 1024),
        },
        engine_id,
    );
    pipeline.drain();

    let sink = sink.borrow();
    let a0 = sink.last_for("c0").unwrap();
    let a1 = sink.last_for("c1").unwrap();
    let cpus0 = CpuSet::parse(a0.cpuset_cpus.as_ref().unwrap()).unwrap();
    let cpus1 = CpuSet::parse(a1.cpuset_cpus.as_ref().unwrap()).unwrap();
    assert_eq!(cpus0.len(), 1);
    assert_eq!(cpus1.len(), 1);
    assert!(cpus0.is_disjoint(&cpus1));
    // Same NUMA node: both CPUs in 0-3 and a single-node memory mask.
    assert!(cpus0.union(&cpus1).is_subset(&CpuSet::parse("0-3").unwrap()));
    assert_eq!(a0.cpuset_mems.as_deref(), Some("0"));
    assert_eq!(a1.cpuset_mems.as_deref(), Some("0"));
}

#[test]
// Exclusive CPU sets stay pairwise disjoint across pods.
fn exclusive_sets_are_pairwise_disjoint() {
    let (mut pipeline, engine_id, sink, _engine) = build_engine(quad_numa_system(), "topology-aware.yaml");
    let sender = pipeline.sender("runtime");

    let mut sets = Vec::new();
    for i in 0..3 {
        let pod_uid = format!("p{}", i);
        let ctr_id = format!("c{}", i);
        sender.emit(
            RunPodSandbox {
                pod: pod_spec(&pod_uid, "default", QosClass::Guaranteed, &[]),
            },
            engine_id,
        );
        sender.emit(
            CreateContainer {
                container: ctr_spec(&ctr_id, &pod_uid, 2000, 0),
            },
            engine_id,
        );
    }
    pipeline.drain();

    let sink = sink.borrow();
    for i in 0..3 {
        let adjustment = sink.last_for(&format!("c{}", i)).unwrap();
        sets.push(CpuSet::parse(adjustment.cpuset_cpus.as_ref().unwrap()).unwrap());
    }
    for i in 0..3 {
        assert_eq!(sets[i].len(), 2);
        for j in (i + 1)..3 {
            assert!(sets[i].is_disjoint(&sets[j]), "c{} and c{} overlap", i, j);
        }
    }
}

#[test]
// A request exactly matching NUMA capacity is placed at NUMA level.
fn exact_numa_capacity_places_at_numa_level() {
    let (mut pipeline, engine_id, sink, _engine) = build_engine(quad_numa_system(), "topology-aware.yaml");
    let sender = pipeline.sender("runtime");

    sender.emit(
        RunPodSandbox {
            pod: pod_spec("p0", "default", QosClass::Guaranteed, &[]),
        },
        engine_id,
    );
    sender.emit(
        CreateContainer {
            container: ctr_spec("c0", "p0", 4000, 0),
        },
        engine_id,
    );
    pipeline.drain();

    let sink = sink.borrow();
    let cpus = CpuSet::parse(sink.last_for("c0").unwrap().cpuset_cpus.as_ref().unwrap()).unwrap();
    assert_eq!(cpus.to_string(), "0-3");
    assert_eq!(sink.last_for("c0").unwrap().cpuset_mems.as_deref(), Some("0"));
}

#[test]
// A 0-CPU BestEffort container gets no grant and no cpuset adjustment.
fn besteffort_zero_request_gets_nothing() {
    let (mut pipeline, engine_id, sink, engine) = build_engine(quad_numa_system(), "topology-aware.yaml");
    let sender = pipeline.sender("runtime");

    sender.emit(
        RunPodSandbox {
            pod: pod_spec("p0", "default", QosClass::BestEffort, &[]),
        },
        engine_id,
    );
    sender.emit(
        CreateContainer {
            container: ctr_spec("c0", "p0", 0, 0),
        },
        engine_id,
    );
    pipeline.drain();

    assert!(sink.borrow().last_for("c0").is_none());
    assert!(sink.borrow().failures.is_empty());
    let engine = engine.borrow();
    assert!(engine.cache().lookup_container("c0").unwrap().assignment.is_empty());
}

#[test]
// A request larger than the whole machine fails whole; the container stays
// tracked at its runtime default.
fn oversized_request_fails_without_partial_placement() {
    let (mut pipeline, engine_id, sink, engine) = build_engine(quad_numa_system(), "topology-aware.yaml");
    let sender = pipeline.sender("runtime");

    sender.emit(
        RunPodSandbox {
            pod: pod_spec("p0", "default", QosClass::Guaranteed, &[]),
        },
        engine_id,
    );
    sender.emit(
        CreateContainer {
            container: ctr_spec("c0", "p0", 20000, 0),
        },
        engine_id,
    );
    pipeline.drain();

    let sink = sink.borrow();
    assert!(sink.last_for("c0").is_none());
    assert_eq!(sink.failures.len(), 1);
    assert!(sink.failures[0].1.contains("not enough free CPUs"));
    let engine = engine.borrow();
    let container = engine.cache().lookup_container("c0").unwrap();
    assert!(container.assignment.is_empty());
}

#[test]
// Carving exclusive CPUs shrinks the shared pool of an already placed
// Burstable container and re-emits its cpuset.
fn exclusive_carve_refreshes_shared_containers() {
    let (mut pipeline, engine_id, sink, _engine) = build_engine(quad_numa_system(), "topology-aware.yaml");
    let sender = pipeline.sender("runtime");

    sender.emit(
        RunPodSandbox {
            pod: pod_spec("p0", "default", QosClass::Burstable, &[]),
        },
        engine_id,
    );
    sender.emit(
        CreateContainer {
            container: ctr_spec("shared", "p0", 500, 0),
        },
        engine_id,
    );
    pipeline.drain();
    let before = CpuSet::parse(
        sink.borrow()
            .last_for("shared")
            .unwrap()
            .cpuset_cpus
            .as_ref()
            .unwrap(),
    )
    .unwrap();
    assert_eq!(before.len(), 4);

    sender.emit(
        RunPodSandbox {
            pod: pod_spec("p1", "default", QosClass::Guaranteed, &[]),
        },
        engine_id,
    );
    sender.emit(
        CreateContainer {
            container: ctr_spec("excl", "p1", 1000, 0),
        },
        engine_id,
    );
    pipeline.drain();

    let sink = sink.borrow();
    let excl = CpuSet::parse(sink.last_for("excl").unwrap().cpuset_cpus.as_ref().unwrap()).unwrap();
    let after = CpuSet::parse(sink.last_for("shared").unwrap().cpuset_cpus.as_ref().unwrap()).unwrap();
    assert_eq!(excl.len(), 1);
    assert_eq!(after.len(), 3);
    assert!(after.is_disjoint(&excl));
}

#[test]
// Allocate then release restores the pre-allocate pool state: an identical
// request afterwards gets the identical placement.
fn allocate_release_round_trip_restores_pools() {
    let (mut pipeline, engine_id, sink, _engine) = build_engine(quad_numa_system(), "topology-aware.yaml");
    let sender = pipeline.sender("runtime");

    sender.emit(
        RunPodSandbox {
            pod: pod_spec("p0", "default", QosClass::Guaranteed, &[]),
        },
        engine_id,
    );
    sender.emit(
        CreateContainer {
            container: ctr_spec("c0", "p0", 1000, 0),
        },
        engine_id,
    );
    pipeline.drain();
    let first = sink.borrow().last_for("c0").unwrap().cpuset_cpus.clone();

    sender.emit(
        StopContainer {
            container_id: "c0".to_string(),
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
        CreateContainer {
            container: ctr_spec("c1", "p0", 1000, 0),
        },
        engine_id,
    );
    pipeline.drain();

    let second = sink.borrow().last_for("c1").unwrap().cpuset_cpus.clone();
    assert_eq!(first, second);
}

#[test]
// Containers of reserved namespaces draw from the reserved slice only.
fn reserved_namespace_pins_to_reserved_cpus() {
    let (mut pipeline, engine_id, sink, _engine) = build_engine(quad_numa_system(), "topology-aware-reserved.yaml");
    let sender = pipeline.sender("runtime");

    sender.emit(
        RunPodSandbox {
            pod: pod_spec("p0", "kube-system", QosClass::Burstable, &[]),
        },
        engine_id,
    );
    sender.emit(
        CreateContainer {
            container: ctr_spec("c0", "p0", 200, 0),
        },
        engine_id,
    );
    pipeline.drain();

    let sink = sink.borrow();
    assert_eq!(sink.last_for("c0").unwrap().cpuset_cpus.as_deref(), Some("0-1"));
}

#[test]
// A container annotated for HBM memory gets the HBM node local to its
// selected package as its memory mask.
fn memory_type_annotation_selects_local_hbm_node() {
    let (mut pipeline, engine_id, sink, _engine) = build_engine(hbm_system(), "topology-aware.yaml");
    let sender = pipeline.sender("runtime");

    sender.emit(
        RunPodSandbox {
            pod: pod_spec(
                "p0",
                "default",
                QosClass::Guaranteed,
                &[("memory-type.respolicy.io", "hbm")],
            ),
        },
        engine_id,
    );
    sender.emit(
        CreateContainer {
            container: ctr_spec("c0", "p0", 1000, 0),
        },
        engine_id,
    );
    pipeline.drain();

    let sink = sink.borrow();
    let adjustment = sink.last_for("c0").unwrap();
    let cpus = CpuSet::parse(adjustment.cpuset_cpus.as_ref().unwrap()).unwrap();
    // The CPU comes from package 0; the HBM node local to it is node 2.
    assert!(cpus.is_subset(&CpuSet::parse("0-3").unwrap()));
    assert_eq!(adjustment.cpuset_mems.as_deref(), Some("2"));
}
