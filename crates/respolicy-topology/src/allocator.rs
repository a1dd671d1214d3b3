//! Topology-aware CPU allocator.
//!
//! The allocator never mutates CPU sets. [`CpuAllocator::resize`] only
//! recommends: it returns a superset of free CPUs to grow from, or a
//! superset of current CPUs to release from, chosen so that the resulting
//! set stays as topologically tight as possible.

use std::cmp::Ordering;
use std::rc::Rc;

use thiserror::Error;

use crate::cpuset::CpuSet;
use crate::tree::{CpuTree, NodeId, TopoLevel};

/// Allocation failure, classified per the error taxonomy.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AllocationError {
    /// The free pool cannot satisfy the requested CPU count.
    #[error("not enough free CPUs: requested {requested}, available {available}")]
    NotEnoughFreeCpus {
        /// CPUs asked for.
        requested: usize,
        /// CPUs actually free.
        available: usize,
    },
    /// The allowed memory nodes cannot hold the requested amount.
    #[error("not enough free memory on nodes [{nodes}]: requested {requested_kb} kB")]
    NotEnoughFreeMemory {
        /// Memory asked for, in kB.
        requested_kb: u64,
        /// Nodes considered.
        nodes: String,
    },
    /// No pool satisfies the container's placement constraints.
    #[error("no pool matches {what}")]
    NoMatchingPool {
        /// Description of the unmatched constraint.
        what: String,
    },
    /// An internal invariant of the allocator was broken.
    #[error("internal allocator invariant broken: {0}")]
    Internal(String),
}

/// Result of a resize recommendation.
#[derive(Clone, Debug, Default)]
pub struct Resize {
    /// Free-CPU superset to pick |delta| CPUs from when growing.
    pub add_from: CpuSet,
    /// Current-CPU superset to release |delta| CPUs from when shrinking.
    pub remove_from: CpuSet,
}

/// Recommends topology-aligned CPU set changes.
pub struct CpuAllocator {
    tree: Rc<CpuTree>,
    topology_balancing: bool,
}

struct Candidate {
    node: NodeId,
    depth: usize,
    // |ancestor.cpus ∩ current| from the root down to this node.
    current_path: Vec<usize>,
    free_here: usize,
}

impl CpuAllocator {
    /// Creates an allocator over the given tree. With `topology_balancing`
    /// the allocator spreads allocations across free pools; without it,
    /// allocations pack and large free pools are kept intact.
    pub fn new(tree: Rc<CpuTree>, topology_balancing: bool) -> Self {
        Self {
            tree,
            topology_balancing,
        }
    }

    /// The tree this allocator recommends against.
    pub fn tree(&self) -> &Rc<CpuTree> {
        &self.tree
    }

    /// Recommends how to grow (`delta > 0`) or shrink (`delta < 0`) the
    /// `current` set given the `free` pool. Does not mutate either set.
    pub fn resize(&self, current: &CpuSet, free: &CpuSet, delta: i64) -> Result<Resize, AllocationError> {
        match delta {
            0 => Ok(Resize::default()),
            d if d > 0 => self.grow(current, free, d as usize),
            d => self.shrink(current, free, (-d) as usize),
        }
    }

    /// Convenience for one-shot allocations: recommends and picks exactly
    /// `n` CPUs from the free pool.
    pub fn alloc(&self, free: &CpuSet, n: usize) -> Result<CpuSet, AllocationError> {
        let mut from = self.resize(&CpuSet::new(), free, n as i64)?.add_from;
        Ok(from.take_first(n))
    }

    fn grow(&self, current: &CpuSet, free: &CpuSet, n: usize) -> Result<Resize, AllocationError> {
        if free.len() < n {
            return Err(AllocationError::NotEnoughFreeCpus {
                requested: n,
                available: free.len(),
            });
        }
        // Prune branches that cannot satisfy the whole delta by themselves.
        let mut candidates: Vec<Candidate> = self
            .tree
            .node_ids()
            .filter(|&id| self.tree.node(id).cpus.intersection(free).len() >= n)
            .map(|id| self.candidate(id, current, free))
            .collect();
        if candidates.is_empty() {
            // Free CPUs outside the tree (offlined mid-flight) still satisfy
            // the request, just without alignment.
            return Ok(Resize {
                add_from: free.clone(),
                remove_from: CpuSet::new(),
            });
        }
        candidates.sort_by(|a, b| self.cmp_grow(a, b));
        let winner = &candidates[0];
        Ok(Resize {
            add_from: self.tree.node(winner.node).cpus.intersection(free),
            remove_from: CpuSet::new(),
        })
    }

    // A shrink of size n is performed as n single-CPU shrinks so that each
    // step keeps the topology invariants.
    fn shrink(&self, current: &CpuSet, free: &CpuSet, n: usize) -> Result<Resize, AllocationError> {
        if current.len() < n {
            return Err(AllocationError::Internal(format!(
                "cannot release {} CPUs out of {}",
                n,
                current.len()
            )));
        }
        let mut remaining = current.clone();
        let mut released = CpuSet::new();
        for _ in 0..n {
            let cpu = self.shrink_one(&remaining, free)?;
            if !remaining.remove(cpu) || released.contains(cpu) {
                return Err(AllocationError::Internal(format!(
                    "shrink step did not release exactly one new CPU (cpu {})",
                    cpu
                )));
            }
            released.add(cpu);
        }
        Ok(Resize {
            add_from: CpuSet::new(),
            remove_from: released,
        })
    }

    fn shrink_one(&self, current: &CpuSet, free: &CpuSet) -> Result<u32, AllocationError> {
        let mut candidates: Vec<Candidate> = self
            .tree
            .nodes_at_level(TopoLevel::Thread)
            .into_iter()
            .filter(|&id| !self.tree.node(id).cpus.intersection(current).is_empty())
            .map(|id| self.candidate(id, current, free))
            .collect();
        if candidates.is_empty() {
            // Current CPUs unknown to the tree are released first.
            return current
                .last()
                .ok_or_else(|| AllocationError::Internal("shrink of empty set".to_string()));
        }
        candidates.sort_by(|a, b| self.cmp_release(a, b));
        let winner = &candidates[0];
        self.tree
            .node(winner.node)
            .cpus
            .intersection(current)
            .last()
            .ok_or_else(|| AllocationError::Internal("winner lost its CPU".to_string()))
    }

    fn candidate(&self, node: NodeId, current: &CpuSet, free: &CpuSet) -> Candidate {
        let current_path = self
            .tree
            .path_from_root(node)
            .into_iter()
            .map(|id| self.tree.node(id).cpus.intersection(current).len())
            .collect();
        Candidate {
            node,
            depth: self.tree.depth(node),
            current_path,
            free_here: self.tree.node(node).cpus.intersection(free).len(),
        }
    }

    // Total order for grow candidates:
    //   1. deeper nodes first (tighter topology);
    //   2. nodes whose current count dominates at every ancestor level
    //      (packs new CPUs next to the ones already held);
    //   3. free-count comparison, sign flipped by topology_balancing:
    //      balancing takes from the largest free pool, packing from the
    //      smallest sufficient one;
    //   4. node name.
    fn cmp_grow(&self, a: &Candidate, b: &Candidate) -> Ordering {
        b.depth
            .cmp(&a.depth)
            .then_with(|| b.current_path.cmp(&a.current_path))
            .then_with(|| {
                if self.topology_balancing {
                    b.free_here.cmp(&a.free_here)
                } else {
                    a.free_here.cmp(&b.free_here)
                }
            })
            .then_with(|| self.tree.node(a.node).name.cmp(&self.tree.node(b.node).name))
    }

    // Total order for release candidates: deeper first, then the thread
    // whose ancestors hold the fewest current CPUs (the straggler), then
    // free count. The free-count sign deliberately does not flip with
    // topology_balancing on the release side; this matches the original
    // allocator behavior.
    fn cmp_release(&self, a: &Candidate, b: &Candidate) -> Ordering {
        b.depth
            .cmp(&a.depth)
            .then_with(|| a.current_path.cmp(&b.current_path))
            .then_with(|| a.free_here.cmp(&b.free_here))
            .then_with(|| self.tree.node(a.node).name.cmp(&self.tree.node(b.node).name))
    }
}
