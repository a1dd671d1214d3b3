use std::rc::Rc;

use respolicy_topology::cpuset::CpuSet;
use respolicy_topology::system::{CoreKind, CpuInfo, MemType, NodeInfo, System};
use respolicy_topology::tree::{CpuTree, TopoLevel};
use respolicy_topology::{AllocationError, CpuAllocator};

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

fn node(id: u32, cpus: &[u32]) -> NodeInfo {
    NodeInfo {
        id,
        cpus: cpus.iter().copied().collect(),
        mem_total_kb: 4 * 1024 * 1024,
        mem_type: MemType::Dram,
        distances: Default::default(),
        hugepages: Default::default(),
    }
}

// 16 CPUs, 2 packages, 4 NUMA nodes of 4 CPUs each.
fn quad_numa_tree() -> Rc<CpuTree> {
    let system = System::from_parts(
        (0..16).map(|i| cpu(i, i / 8, i / 4)).collect(),
        vec![
            node(0, &[0, 1, 2, 3]),
            node(1, &[4, 5, 6, 7]),
            node(2, &[8, 9, 10, 11]),
            node(3, &[12, 13, 14, 15]),
        ],
        vec![],
        CpuSet::new(),
    );
    Rc::new(CpuTree::from_system(&system))
}

#[test]
// A request equal to a NUMA node's capacity must be served from one node,
// not from the package above it.
fn grow_at_exact_numa_capacity() {
    let alloc = CpuAllocator::new(quad_numa_tree(), false);
    let free: CpuSet = (0..16).collect();
    let resize = alloc.resize(&CpuSet::new(), &free, 4).unwrap();
    assert_eq!(resize.add_from.len(), 4);
    assert_eq!(resize.add_from.to_string(), "0-3");
}

#[test]
// Growing an existing set stays next to the CPUs already held.
fn grow_packs_next_to_current() {
    let alloc = CpuAllocator::new(quad_numa_tree(), false);
    let current: CpuSet = [0].into_iter().collect();
    let free: CpuSet = (1..16).collect();
    let resize = alloc.resize(&current, &free, 1).unwrap();
    assert_eq!(resize.add_from.to_string(), "1");
}

#[test]
// Packing fills the smaller free pool; balancing takes from the largest.
fn balancing_flips_free_pool_preference() {
    let tree = quad_numa_tree();
    // node0 already lost one CPU, the other nodes are untouched.
    let free = CpuSet::parse("1-15").unwrap();

    let packer = CpuAllocator::new(tree.clone(), false);
    let resize = packer.resize(&CpuSet::new(), &free, 2).unwrap();
    assert_eq!(resize.add_from.to_string(), "1-3");

    let balancer = CpuAllocator::new(tree, true);
    let resize = balancer.resize(&CpuSet::new(), &free, 2).unwrap();
    assert_eq!(resize.add_from.to_string(), "4-7");
}

#[test]
// Requests above the whole free pool fail whole, without a partial result.
fn grow_beyond_free_pool_fails() {
    let alloc = CpuAllocator::new(quad_numa_tree(), false);
    let free: CpuSet = (0..16).collect();
    let err = alloc.resize(&CpuSet::new(), &free, 17).unwrap_err();
    assert_eq!(
        err,
        AllocationError::NotEnoughFreeCpus {
            requested: 17,
            available: 16
        }
    );
}

#[test]
// Releasing prefers the straggler CPU outside the main topology block.
fn shrink_releases_straggler_first() {
    let alloc = CpuAllocator::new(quad_numa_tree(), false);
    let current = CpuSet::parse("0-3,7").unwrap();
    let free = CpuSet::parse("8-15").unwrap();
    let resize = alloc.resize(&current, &free, -1).unwrap();
    assert_eq!(resize.remove_from.to_string(), "7");
}

#[test]
// A multi-CPU shrink is n single-CPU steps, each releasing a distinct CPU.
fn shrink_many_releases_distinct_cpus() {
    let alloc = CpuAllocator::new(quad_numa_tree(), false);
    let current = CpuSet::parse("0-3,7,11").unwrap();
    let free = CpuSet::new();
    let resize = alloc.resize(&current, &free, -3).unwrap();
    assert_eq!(resize.remove_from.len(), 3);
    assert!(resize.remove_from.is_subset(&current));
    // The two stragglers go before anything from the 0-3 block.
    assert!(resize.remove_from.contains(7));
    assert!(resize.remove_from.contains(11));
}

#[test]
fn zero_delta_recommends_nothing() {
    let alloc = CpuAllocator::new(quad_numa_tree(), false);
    let current = CpuSet::parse("0-1").unwrap();
    let free = CpuSet::parse("2-15").unwrap();
    let resize = alloc.resize(&current, &free, 0).unwrap();
    assert!(resize.add_from.is_empty());
    assert!(resize.remove_from.is_empty());
}

#[test]
// alloc() picks exactly n CPUs out of the recommended superset.
fn alloc_picks_exact_count() {
    let alloc = CpuAllocator::new(quad_numa_tree(), false);
    let free: CpuSet = (0..16).collect();
    let picked = alloc.alloc(&free, 3).unwrap();
    assert_eq!(picked.len(), 3);
    let numa_nodes = alloc.tree().nodes_at_level(TopoLevel::Numa);
    assert!(numa_nodes
        .iter()
        .any(|&n| picked.is_subset(&alloc.tree().node(n).cpus)));
}
