//! Immutable description of the machine's hardware.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::cpuset::CpuSet;

/// Kind of a CPU core on hybrid architectures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoreKind {
    /// Performance core.
    Performance,
    /// Efficient core.
    Efficient,
    /// Kind not exposed and not inferable.
    Unknown,
}

/// Kind of memory attached to a NUMA node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemType {
    /// Ordinary DRAM local to a CPU node.
    Dram,
    /// High-bandwidth memory.
    Hbm,
    /// Persistent memory.
    Pmem,
    /// CXL-attached memory.
    Cxl,
}

/// A set of acceptable memory types, as parsed from a `memory-type`
/// annotation such as `"dram,hbm"`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemTypeSet(BTreeSet<MemType>);

impl MemTypeSet {
    /// The empty set, meaning "no preference".
    pub fn any() -> Self {
        Self::default()
    }

    /// Parses a comma-separated list of type names.
    pub fn parse(s: &str) -> Option<Self> {
        let mut set = BTreeSet::new();
        for part in s.split(',') {
            match part.trim() {
                "dram" => set.insert(MemType::Dram),
                "hbm" => set.insert(MemType::Hbm),
                "pmem" => set.insert(MemType::Pmem),
                "cxl" => set.insert(MemType::Cxl),
                "" => continue,
                _ => return None,
            };
        }
        Some(Self(set))
    }

    /// True when no preference was expressed.
    pub fn is_any(&self) -> bool {
        self.0.is_empty()
    }

    /// True when `ty` satisfies this preference.
    pub fn matches(&self, ty: MemType) -> bool {
        self.0.is_empty() || self.0.contains(&ty)
    }
}

/// Per-CPU description as discovered from sysfs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CpuInfo {
    /// Logical CPU id.
    pub id: u32,
    /// Physical package (socket) id.
    pub package_id: u32,
    /// Die id within the package; 0 when the kernel does not expose it.
    pub die_id: u32,
    /// L2 cluster id within the die, when exposed.
    pub cluster_id: Option<u32>,
    /// Core id within the package.
    pub core_id: u32,
    /// NUMA node this CPU belongs to.
    pub numa_node: u32,
    /// Hyperthread siblings sharing the core, including this CPU.
    pub core_cpus: CpuSet,
    /// Base frequency in kHz; 0 when unknown.
    pub base_freq_khz: u64,
    /// Minimum frequency in kHz; 0 when unknown.
    pub min_freq_khz: u64,
    /// Maximum frequency in kHz; 0 when unknown.
    pub max_freq_khz: u64,
    /// Performance or efficient core.
    pub core_kind: CoreKind,
}

/// A cache instance shared by a set of CPUs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheInfo {
    /// Cache instance id.
    pub id: u32,
    /// Cache level (1, 2, 3, ...).
    pub level: u32,
    /// CPUs sharing this cache.
    pub shared_cpus: CpuSet,
    /// Size in kB.
    pub size_kb: u64,
}

/// Per-NUMA-node description.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeInfo {
    /// NUMA node id.
    pub id: u32,
    /// CPUs local to this node; empty for memory-only nodes.
    pub cpus: CpuSet,
    /// Total memory in kB.
    pub mem_total_kb: u64,
    /// Kind of memory backing the node.
    pub mem_type: MemType,
    /// Distance vector indexed by node id order of discovery.
    pub distances: BTreeMap<u32, u32>,
    /// Huge page counts keyed by page size in kB.
    pub hugepages: BTreeMap<u64, u64>,
}

/// The discovered hardware description. Built once at startup and
/// read-only afterwards.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct System {
    cpus: BTreeMap<u32, CpuInfo>,
    nodes: BTreeMap<u32, NodeInfo>,
    caches: Vec<CacheInfo>,
    isolated: CpuSet,
}

impl System {
    /// Assembles a system description from its parts.
    ///
    /// Used by discovery and by tests that need a synthetic machine.
    pub fn from_parts(cpus: Vec<CpuInfo>, nodes: Vec<NodeInfo>, caches: Vec<CacheInfo>, isolated: CpuSet) -> Self {
        Self {
            cpus: cpus.into_iter().map(|c| (c.id, c)).collect(),
            nodes: nodes.into_iter().map(|n| (n.id, n)).collect(),
            caches,
            isolated,
        }
    }

    /// All online CPU ids.
    pub fn cpu_ids(&self) -> CpuSet {
        self.cpus.keys().copied().collect()
    }

    /// Per-CPU description.
    pub fn cpu(&self, id: u32) -> Option<&CpuInfo> {
        self.cpus.get(&id)
    }

    /// All CPUs in discovery order.
    pub fn cpus(&self) -> impl Iterator<Item = &CpuInfo> {
        self.cpus.values()
    }

    /// All NUMA node ids.
    pub fn node_ids(&self) -> CpuSet {
        self.nodes.keys().copied().collect()
    }

    /// Per-node description.
    pub fn node(&self, id: u32) -> Option<&NodeInfo> {
        self.nodes.get(&id)
    }

    /// All NUMA nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.values()
    }

    /// All discovered cache instances.
    pub fn caches(&self) -> &[CacheInfo] {
        &self.caches
    }

    /// CPUs isolated at boot (`isolcpus`/`nohz_full`).
    pub fn isolated_cpus(&self) -> &CpuSet {
        &self.isolated
    }

    /// Distinct package ids.
    pub fn package_ids(&self) -> BTreeSet<u32> {
        self.cpus.values().map(|c| c.package_id).collect()
    }

    /// Distance between two NUMA nodes; the kernel's self-distance is 10.
    pub fn node_distance(&self, from: u32, to: u32) -> u32 {
        self.nodes
            .get(&from)
            .and_then(|n| n.distances.get(&to).copied())
            .unwrap_or(u32::MAX)
    }

    /// Ids of nodes carrying the given memory type, nearest-first from
    /// `from`.
    pub fn nodes_by_distance(&self, from: u32, ty: Option<MemType>) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .nodes
            .values()
            .filter(|n| ty.map_or(true, |t| n.mem_type == t))
            .map(|n| n.id)
            .collect();
        ids.sort_by_key(|id| (self.node_distance(from, *id), *id));
        ids
    }

    /// CPUs sharing the L2 cache with `cpu`, when L2 topology is known.
    pub fn l2_group(&self, cpu: u32) -> Option<CpuSet> {
        self.caches
            .iter()
            .find(|c| c.level == 2 && c.shared_cpus.contains(cpu))
            .map(|c| c.shared_cpus.clone())
    }
}
