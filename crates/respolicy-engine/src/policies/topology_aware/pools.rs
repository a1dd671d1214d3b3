//! Pool tree of the topology-aware policy.

use respolicy_topology::{CpuSet, CpuTree, NodeId, System, TopoLevel};

/// Index of a pool in the tree arena.
pub type PoolId = usize;

/// A node of the pool tree: a subset of the machine's CPUs and memory at
/// one topology level, from which containers draw grants.
#[derive(Clone, Debug)]
pub struct Pool {
    /// Arena index of this pool.
    pub id: PoolId,
    /// The CPU-tree node this pool mirrors.
    pub node: NodeId,
    /// Name, inherited from the CPU-tree node.
    pub name: String,
    /// Topology level.
    pub level: TopoLevel,
    /// Parent pool; `None` for the root.
    pub parent: Option<PoolId>,
    /// Child pools.
    pub children: Vec<PoolId>,
    /// CPUs of this pool (available minus reserved).
    pub cpus: CpuSet,
    /// Kernel-isolated subset of `cpus`.
    pub isolated: CpuSet,
    /// Local memory nodes, including CPU-less ones attached by distance.
    pub mems: CpuSet,
}

/// The pool hierarchy, mirroring the CPU tree down to NUMA level.
#[derive(Clone, Debug, Default)]
pub struct PoolTree {
    pools: Vec<Pool>,
}

// Pools exist down to the NUMA level; CPU picking below that is the
// allocator's job.
const POOL_LEVELS: [TopoLevel; 4] = [TopoLevel::System, TopoLevel::Package, TopoLevel::Die, TopoLevel::Numa];

impl PoolTree {
    /// Mirrors the CPU tree above `usable` CPUs into pools.
    ///
    /// Nodes with no usable CPU are skipped; memory-only NUMA nodes are
    /// attached to the pool of their nearest CPU-bearing node.
    pub fn build(tree: &CpuTree, system: &System, usable: &CpuSet) -> Self {
        let mut pools = Self::default();
        pools.mirror(tree, system, usable, tree.root(), None);
        pools.attach_memory_only_nodes(system);
        pools.roll_up_mems();
        pools
    }

    fn mirror(
        &mut self,
        tree: &CpuTree,
        system: &System,
        usable: &CpuSet,
        node: NodeId,
        parent: Option<PoolId>,
    ) -> Option<PoolId> {
        let tnode = tree.node(node);
        if !POOL_LEVELS.contains(&tnode.level) {
            return None;
        }
        let cpus = tnode.cpus.intersection(usable);
        if cpus.is_empty() {
            return None;
        }
        let id = self.pools.len();
        let isolated = cpus.intersection(system.isolated_cpus());
        let mems = if tnode.level == TopoLevel::Numa {
            cpus.iter()
                .filter_map(|cpu| system.cpu(cpu).map(|c| c.numa_node))
                .collect()
        } else {
            CpuSet::new()
        };
        self.pools.push(Pool {
            id,
            node,
            name: tnode.name.clone(),
            level: tnode.level,
            parent,
            children: Vec::new(),
            cpus,
            isolated,
            mems,
        });
        if let Some(parent) = parent {
            self.pools[parent].children.push(id);
        }
        for child in tree.node(node).children.clone() {
            self.mirror(tree, system, usable, child, Some(id));
        }
        Some(id)
    }

    // A CPU-less memory node (HBM, PMEM, CXL) belongs to the NUMA pool
    // nearest to it by SLIT distance.
    fn attach_memory_only_nodes(&mut self, system: &System) {
        for node in system.nodes() {
            if !node.cpus.is_empty() {
                continue;
            }
            let mut best: Option<(u32, PoolId)> = None;
            for pool in &self.pools {
                if pool.level != TopoLevel::Numa {
                    continue;
                }
                for mem in pool.mems.iter() {
                    let distance = system.node_distance(mem, node.id);
                    if best.map_or(true, |(d, _)| distance < d) {
                        best = Some((distance, pool.id));
                    }
                }
            }
            if let Some((_, pool)) = best {
                self.pools[pool].mems.add(node.id);
            }
        }
    }

    fn roll_up_mems(&mut self) {
        for id in (0..self.pools.len()).rev() {
            let mems = self.pools[id].mems.clone();
            if let Some(parent) = self.pools[id].parent {
                self.pools[parent].mems.extend(&mems);
            }
        }
    }

    /// Pool accessor.
    pub fn pool(&self, id: PoolId) -> &Pool {
        &self.pools[id]
    }

    /// All pools in arena order.
    pub fn pools(&self) -> &[Pool] {
        &self.pools
    }

    /// Number of pools.
    pub fn len(&self) -> usize {
        self.pools.len()
    }

    /// True when the tree was not built yet.
    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Pools at the given level, in arena order.
    pub fn pools_at_level(&self, level: TopoLevel) -> Vec<PoolId> {
        (0..self.pools.len())
            .filter(|&id| self.pools[id].level == level)
            .collect()
    }

    /// Levels present in the tree, deepest first.
    pub fn levels_deepest_first(&self) -> Vec<TopoLevel> {
        let mut levels: Vec<TopoLevel> = POOL_LEVELS
            .into_iter()
            .filter(|l| self.pools.iter().any(|p| p.level == *l))
            .collect();
        levels.reverse();
        levels
    }

    /// The pool ids of `id`'s subtree, including `id` itself.
    pub fn subtree(&self, id: PoolId) -> Vec<PoolId> {
        let mut out = vec![id];
        let mut i = 0;
        while i < out.len() {
            out.extend(self.pools[out[i]].children.iter().copied());
            i += 1;
        }
        out
    }

    /// Finds a pool by name.
    pub fn by_name(&self, name: &str) -> Option<PoolId> {
        self.pools.iter().position(|p| p.name == name)
    }

    /// The deepest pool whose CPUs contain every id of `cpus`.
    pub fn smallest_containing(&self, cpus: &CpuSet) -> Option<PoolId> {
        if self.pools.is_empty() {
            return None;
        }
        let mut best = 0;
        loop {
            let next = self.pools[best]
                .children
                .iter()
                .copied()
                .find(|&child| cpus.is_subset(&self.pools[child].cpus));
            match next {
                Some(child) => best = child,
                None => return Some(best),
            }
        }
    }
}
