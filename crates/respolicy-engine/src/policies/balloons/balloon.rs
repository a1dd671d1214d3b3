//! Balloon instances.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use respolicy_topology::{CpuSet, NodeId, System};

use crate::core::cache::Cache;

/// One per-branch slice of a composite balloon.
#[derive(Clone, Debug)]
pub struct BalloonPart {
    /// CPU-tree branch this part draws from.
    pub branch: NodeId,
    /// CPUs currently held by this part.
    pub cpus: CpuSet,
}

/// A named CPU pool instance containers are placed into.
#[derive(Clone, Debug)]
pub struct Balloon {
    /// Class this instance belongs to.
    pub class: String,
    /// Instance number within the class.
    pub instance: u32,
    /// Display name, `class[instance]`.
    pub name: String,
    /// Branch a simple balloon is bound to; `None` for composites and
    /// system-level balloons.
    pub branch: Option<NodeId>,
    /// Per-branch parts of a composite balloon; empty for simple ones.
    pub parts: Vec<BalloonPart>,
    /// The balloon's CPU set; every member is pinned to exactly this set.
    pub cpus: CpuSet,
    /// Memory nodes local to the balloon's CPUs.
    pub mems: CpuSet,
    /// Container ids currently placed in this balloon.
    pub members: BTreeSet<String>,
}

impl Balloon {
    /// Milli-CPUs requested by all members together.
    pub fn used_milli(&self, cache: &Cache) -> u64 {
        self.members
            .iter()
            .filter_map(|id| cache.lookup_container(id))
            .map(|c| c.request.cpu_milli)
            .sum()
    }

    /// Recomputes the local memory nodes from the current CPU set.
    pub fn refresh_mems(&mut self, system: &System) {
        self.mems = self
            .cpus
            .iter()
            .filter_map(|cpu| system.cpu(cpu).map(|c| c.numa_node))
            .collect();
    }
}

/// Serialized form of a balloon, with tree branches stored by node name.
#[derive(Serialize, Deserialize)]
pub struct BalloonRecord {
    pub class: String,
    pub instance: u32,
    pub name: String,
    pub branch: Option<String>,
    pub parts: Vec<(String, CpuSet)>,
    pub cpus: CpuSet,
    pub mems: CpuSet,
    pub members: BTreeSet<String>,
}
