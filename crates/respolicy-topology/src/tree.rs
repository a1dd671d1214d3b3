//! Multi-level CPU hierarchy built from the discovered system.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::cpuset::CpuSet;
use crate::system::System;

/// Topology level, ordered from coarse to fine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopoLevel {
    /// The whole machine.
    System,
    /// A physical package (socket).
    Package,
    /// A die within a package.
    Die,
    /// A NUMA node.
    Numa,
    /// A group of cores sharing an L2 cache.
    #[serde(rename = "l2cache")]
    L2Cluster,
    /// A physical core.
    Core,
    /// A hardware thread.
    Thread,
}

impl std::fmt::Display for TopoLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            TopoLevel::System => "system",
            TopoLevel::Package => "package",
            TopoLevel::Die => "die",
            TopoLevel::Numa => "numa",
            TopoLevel::L2Cluster => "l2cache",
            TopoLevel::Core => "core",
            TopoLevel::Thread => "thread",
        };
        write!(f, "{}", name)
    }
}

/// Index of a node in the tree arena.
pub type NodeId = usize;

/// A single node of the CPU tree.
#[derive(Clone, Debug)]
pub struct TreeNode {
    /// Human-readable name, e.g. `package0/die0/node1/core3`.
    pub name: String,
    /// Topology level of this node.
    pub level: TopoLevel,
    /// Parent node; `None` only for the root.
    pub parent: Option<NodeId>,
    /// Children in deterministic (id) order.
    pub children: Vec<NodeId>,
    /// Union of CPU ids reachable beneath this node.
    pub cpus: CpuSet,
}

/// Arena-backed CPU hierarchy with one leaf per hardware thread.
///
/// The tree is built once from the discovered [`System`] and read-only
/// afterwards; all dynamic allocation state lives outside in free/current
/// CPU sets threaded through the allocator.
#[derive(Clone, Debug)]
pub struct CpuTree {
    nodes: Vec<TreeNode>,
}

impl CpuTree {
    /// Builds the full hierarchy from a discovered system.
    pub fn from_system(system: &System) -> Self {
        let mut tree = Self { nodes: Vec::new() };
        let root = tree.push("system".to_string(), TopoLevel::System, None);

        // package -> die -> numa -> cluster -> core -> thread, with each
        // grouping keyed deterministically by its sysfs ids.
        let mut packages: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
        for cpu in system.cpus() {
            packages.entry(cpu.package_id).or_default().push(cpu.id);
        }

        for (package_id, package_cpus) in packages {
            let package_name = format!("package{}", package_id);
            let package = tree.push(package_name.clone(), TopoLevel::Package, Some(root));

            let mut dies: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
            for &cpu in &package_cpus {
                dies.entry(system.cpu(cpu).unwrap().die_id).or_default().push(cpu);
            }
            for (die_id, die_cpus) in dies {
                let die_name = format!("{}/die{}", package_name, die_id);
                let die = tree.push(die_name.clone(), TopoLevel::Die, Some(package));

                let mut numas: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
                for &cpu in &die_cpus {
                    numas.entry(system.cpu(cpu).unwrap().numa_node).or_default().push(cpu);
                }
                for (numa_id, numa_cpus) in numas {
                    let numa_name = format!("{}/node{}", die_name, numa_id);
                    let numa = tree.push(numa_name.clone(), TopoLevel::Numa, Some(die));
                    tree.build_clusters(system, numa, &numa_name, &numa_cpus);
                }
            }
        }

        tree.fill_cpus(root);
        tree
    }

    fn build_clusters(&mut self, system: &System, numa: NodeId, numa_name: &str, cpus: &[u32]) {
        let mut clusters: BTreeMap<Option<u32>, Vec<u32>> = BTreeMap::new();
        for &cpu in cpus {
            clusters.entry(system.cpu(cpu).unwrap().cluster_id).or_default().push(cpu);
        }
        // Without cluster ids the level is omitted and cores hang off the
        // NUMA node directly.
        let skip_cluster_level = clusters.len() == 1 && clusters.keys().next() == Some(&None);
        for (cluster_id, cluster_cpus) in clusters {
            let (parent, parent_name) = match (skip_cluster_level, cluster_id) {
                (true, _) | (false, None) => (numa, numa_name.to_string()),
                (false, Some(id)) => {
                    let name = format!("{}/cluster{}", numa_name, id);
                    (self.push(name.clone(), TopoLevel::L2Cluster, Some(numa)), name)
                }
            };
            let mut cores: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
            for &cpu in &cluster_cpus {
                cores.entry(system.cpu(cpu).unwrap().core_id).or_default().push(cpu);
            }
            for (core_id, core_cpus) in cores {
                let core_name = format!("{}/core{}", parent_name, core_id);
                let core = self.push(core_name, TopoLevel::Core, Some(parent));
                for cpu in core_cpus {
                    let thread = self.push(format!("cpu{}", cpu), TopoLevel::Thread, Some(core));
                    self.nodes[thread].cpus.add(cpu);
                }
            }
        }
    }

    fn push(&mut self, name: String, level: TopoLevel, parent: Option<NodeId>) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(TreeNode {
            name,
            level,
            parent,
            children: Vec::new(),
            cpus: CpuSet::new(),
        });
        if let Some(parent) = parent {
            self.nodes[parent].children.push(id);
        }
        id
    }

    fn fill_cpus(&mut self, node: NodeId) {
        let children = self.nodes[node].children.clone();
        let mut cpus = self.nodes[node].cpus.clone();
        for child in children {
            self.fill_cpus(child);
            cpus.extend(&self.nodes[child].cpus);
        }
        self.nodes[node].cpus = cpus;
    }

    /// The root node id.
    pub fn root(&self) -> NodeId {
        0
    }

    /// Node accessor.
    pub fn node(&self, id: NodeId) -> &TreeNode {
        &self.nodes[id]
    }

    /// Number of nodes in the tree.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True for a tree with no nodes (never produced by `from_system`).
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Distance of a node from the root.
    pub fn depth(&self, id: NodeId) -> usize {
        let mut depth = 0;
        let mut node = id;
        while let Some(parent) = self.nodes[node].parent {
            depth += 1;
            node = parent;
        }
        depth
    }

    /// Ancestor chain from the root down to (and including) `id`.
    pub fn path_from_root(&self, id: NodeId) -> Vec<NodeId> {
        let mut path = vec![id];
        let mut node = id;
        while let Some(parent) = self.nodes[node].parent {
            path.push(parent);
            node = parent;
        }
        path.reverse();
        path
    }

    /// All node ids at the given level, in arena order.
    pub fn nodes_at_level(&self, level: TopoLevel) -> Vec<NodeId> {
        (0..self.nodes.len()).filter(|&id| self.nodes[id].level == level).collect()
    }

    /// All node ids in breadth-compatible arena order.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> {
        0..self.nodes.len()
    }

    /// The deepest node whose CPU set contains every id of `cpus`.
    pub fn smallest_containing(&self, cpus: &CpuSet) -> NodeId {
        let mut best = self.root();
        let mut node = self.root();
        loop {
            let next = self.nodes[node]
                .children
                .iter()
                .copied()
                .find(|&child| cpus.is_subset(&self.nodes[child].cpus));
            match next {
                Some(child) => {
                    best = child;
                    node = child;
                }
                None => return best,
            }
        }
    }

    /// The leaf holding the given CPU id.
    pub fn leaf_for_cpu(&self, cpu: u32) -> Option<NodeId> {
        self.nodes
            .iter()
            .position(|n| n.level == TopoLevel::Thread && n.cpus.contains(cpu))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::{CoreKind, CpuInfo, MemType, NodeInfo};

    fn cpu(id: u32, package: u32, numa: u32, core: u32) -> CpuInfo {
        CpuInfo {
            id,
            package_id: package,
            die_id: 0,
            cluster_id: None,
            core_id: core,
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
            mem_total_kb: 1024 * 1024,
            mem_type: MemType::Dram,
            distances: Default::default(),
            hugepages: Default::default(),
        }
    }

    #[test]
    fn one_leaf_per_thread_and_unique_parents() {
        let system = System::from_parts(
            (0..8).map(|i| cpu(i, i / 4, i / 2, i)).collect(),
            vec![node(0, &[0, 1]), node(1, &[2, 3]), node(2, &[4, 5]), node(3, &[6, 7])],
            vec![],
            CpuSet::new(),
        );
        let tree = CpuTree::from_system(&system);
        let leaves = tree.nodes_at_level(TopoLevel::Thread);
        assert_eq!(leaves.len(), 8);
        for leaf in leaves {
            assert_eq!(tree.node(leaf).cpus.len(), 1);
        }
        assert_eq!(tree.node(tree.root()).cpus.len(), 8);
        assert_eq!(tree.nodes_at_level(TopoLevel::Package).len(), 2);
        assert_eq!(tree.nodes_at_level(TopoLevel::Numa).len(), 4);
    }

    #[test]
    fn smallest_containing_picks_tightest_node() {
        let system = System::from_parts(
            (0..8).map(|i| cpu(i, i / 4, i / 2, i)).collect(),
            vec![node(0, &[0, 1]), node(1, &[2, 3]), node(2, &[4, 5]), node(3, &[6, 7])],
            vec![],
            CpuSet::new(),
        );
        let tree = CpuTree::from_system(&system);
        let within_numa = CpuSet::parse("2-3").unwrap();
        let id = tree.smallest_containing(&within_numa);
        assert_eq!(tree.node(id).level, TopoLevel::Numa);
        let across_packages = CpuSet::parse("1,6").unwrap();
        let id = tree.smallest_containing(&across_packages);
        assert_eq!(tree.node(id).level, TopoLevel::System);
    }
}
