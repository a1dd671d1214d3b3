//! Topology-aware placement policy.
//!
//! Containers draw grants from a pool tree mirroring the CPU topology.
//! Guaranteed containers get exclusive CPUs carved out of their pool;
//! everything else shares the pool's remaining CPUs. Placement picks the
//! smallest topology level whose capacity suffices and the best-scoring
//! pool at that level.

pub mod pools;

use std::collections::BTreeMap;
use std::rc::Rc;

use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::json;

use respolicy_topology::{AllocationError, CpuAllocator, CpuSet, CpuTree, MemTypeSet, System};

use crate::core::cache::Cache;
use crate::core::common::{cpu_quota_from_milli, cpu_weight_from_milli, CgroupParams, QosClass, CPU_PERIOD_USEC};
use crate::core::config::{parse_config_value, parse_options, CpuPriority, DaemonConfig};
use crate::core::errors::{Error, ProtocolError};
use crate::core::pod::Pod;
use crate::core::policy::{PolicyEvent, ResourcePolicy};

use pools::{PoolId, PoolTree};

// Annotation keys recognized by this policy. Container-scoped forms append
// "/container.<name>".
const ANN_PREFER_ISOLATED: &str = "prefer-isolated-cpus.respolicy.io";
const ANN_PREFER_SHARED: &str = "prefer-shared-cpus.respolicy.io";
const ANN_MEMORY_TYPE: &str = "memory-type.respolicy.io";
const ANN_CPU_PRIORITY: &str = "cpu-priority.respolicy.io";
const ANN_SCHED_CLASS: &str = "scheduling-class.respolicy.io";
const ANN_POOL_HINT: &str = "pool-affinity.respolicy.io";
const ANN_BLOCKIO_WEIGHT: &str = "blockio-weight.respolicy.io";
const ANN_RDT_CLASS: &str = "rdt-class.respolicy.io";

// Scoring weights; lower scores win.
const SCORE_POOL_HINT: f64 = -1000.0;
const SCORE_COLOCATE_POD: f64 = -50.0;
const SCORE_COLOCATE_NAMESPACE: f64 = -10.0;
const SCORE_MEMTYPE_MATCH: f64 = -20.0;
const SCORE_PER_LEVEL_ABOVE_NUMA: f64 = 25.0;

const REBALANCE_MAX_MOVES: u32 = 32;

/// A container's attachment to a pool with an exact CPU/memory assignment.
#[derive(Clone, Debug)]
struct Grant {
    /// `None` marks a grant from the reserved slice outside the pool tree.
    pool: Option<PoolId>,
    exclusive: CpuSet,
    shared_milli: u64,
    mems: CpuSet,
}

#[derive(Serialize, Deserialize)]
struct GrantRecord {
    container: String,
    pool: Option<String>,
    exclusive: CpuSet,
    shared_milli: u64,
    mems: CpuSet,
}

#[derive(Serialize, Deserialize)]
struct PolicyState {
    grants: Vec<GrantRecord>,
}

/// The topology-aware policy.
#[derive(Default)]
pub struct TopologyAwarePolicy {
    config: Option<DaemonConfig>,
    system: Option<System>,
    allocator: Option<CpuAllocator>,
    pools: PoolTree,
    reserved_cpus: CpuSet,
    grants: BTreeMap<String, Grant>,
}

impl TopologyAwarePolicy {
    /// Creates the policy; [`ResourcePolicy::setup`] builds its state.
    pub fn new() -> Self {
        Self::default()
    }

    fn config(&self) -> &DaemonConfig {
        self.config.as_ref().expect("setup not called")
    }

    fn system(&self) -> &System {
        self.system.as_ref().expect("setup not called")
    }

    // Union of every exclusive CPU currently granted.
    fn allocated_exclusive(&self) -> CpuSet {
        let mut out = CpuSet::new();
        for grant in self.grants.values() {
            out.extend(&grant.exclusive);
        }
        out
    }

    // CPUs of the pool usable for shared grants right now.
    fn sharable(&self, pool: PoolId) -> CpuSet {
        let p = self.pools.pool(pool);
        p.cpus.difference(&p.isolated).difference(&self.allocated_exclusive())
    }

    fn free_isolated(&self, pool: PoolId) -> CpuSet {
        self.pools.pool(pool).isolated.difference(&self.allocated_exclusive())
    }

    fn shared_granted_in_subtree(&self, pool: PoolId) -> u64 {
        let subtree = self.pools.subtree(pool);
        self.grants
            .values()
            .filter(|g| g.pool.map_or(false, |p| subtree.contains(&p)))
            .map(|g| g.shared_milli)
            .sum()
    }

    fn free_shared_milli(&self, pool: PoolId) -> i64 {
        self.sharable(pool).len() as i64 * 1000 - self.shared_granted_in_subtree(pool) as i64
    }

    // Whole CPUs that can still be carved out without starving the shared
    // grants already drawing from this pool.
    fn exclusive_headroom(&self, pool: PoolId) -> usize {
        let carvable = (self.free_shared_milli(pool) / 1000).max(0) as usize;
        self.free_isolated(pool).len() + carvable
    }

    fn grants_of_pod_in_subtree(&self, cache: &Cache, pool: PoolId, pod_uid: &str) -> usize {
        let subtree = self.pools.subtree(pool);
        self.grants
            .iter()
            .filter(|(id, g)| {
                g.pool.map_or(false, |p| subtree.contains(&p))
                    && cache.lookup_container(id).map_or(false, |c| c.pod_uid == pod_uid)
            })
            .count()
    }

    fn grants_of_namespace_in_subtree(&self, cache: &Cache, pool: PoolId, namespace: &str) -> usize {
        let subtree = self.pools.subtree(pool);
        self.grants
            .iter()
            .filter(|(id, g)| {
                g.pool.map_or(false, |p| subtree.contains(&p))
                    && cache.pod_of(id).map_or(false, |p| p.namespace == namespace)
            })
            .count()
    }

    fn bool_annotation(pod: &Pod, key: &str, container: &str, default: bool) -> bool {
        pod.effective_annotation(key, container)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    fn memtype_of(pod: &Pod, container: &str) -> MemTypeSet {
        pod.effective_annotation(ANN_MEMORY_TYPE, container)
            .and_then(MemTypeSet::parse)
            .unwrap_or_default()
    }

    fn cpu_priority_of(&self, pod: &Pod, container: &str) -> CpuPriority {
        match pod.effective_annotation(ANN_CPU_PRIORITY, container) {
            Some("high") => CpuPriority::High,
            Some("normal") => CpuPriority::Normal,
            Some("low") => CpuPriority::Low,
            Some("none") => CpuPriority::None,
            _ => self.config().topology_aware.default_cpu_priority,
        }
    }

    // Exclusive CPU count for a request, per the container classification:
    // Guaranteed pods with CPU pinning get whole CPUs, fractional requests
    // rounding up to a single disjoint CPU each.
    fn exclusive_cpus_wanted(&self, pod: &Pod, container: &str, qos: QosClass, milli: u64) -> usize {
        let ta = &self.config().topology_aware;
        if !ta.pin_cpu || qos != QosClass::Guaranteed || milli == 0 {
            return 0;
        }
        if Self::bool_annotation(pod, ANN_PREFER_SHARED, container, ta.prefer_shared_cpus) {
            return 0;
        }
        ((milli + 999) / 1000) as usize
    }

    // Orders candidate CPUs by core kind according to the priority
    // preference, then by id, and takes the first n.
    fn pick_cpus(&self, from: &CpuSet, n: usize, priority: CpuPriority) -> CpuSet {
        use respolicy_topology::CoreKind;
        let rank = |cpu: u32| -> u8 {
            let kind = self.system().cpu(cpu).map(|c| c.core_kind).unwrap_or(CoreKind::Unknown);
            match (priority, kind) {
                (CpuPriority::High, CoreKind::Performance) => 0,
                (CpuPriority::High, CoreKind::Unknown) => 1,
                (CpuPriority::High, CoreKind::Efficient) => 2,
                (CpuPriority::Low, CoreKind::Efficient) => 0,
                (CpuPriority::Low, CoreKind::Unknown) => 1,
                (CpuPriority::Low, CoreKind::Performance) => 2,
                _ => 0,
            }
        };
        let mut ids: Vec<u32> = from.iter().collect();
        ids.sort_by_key(|&cpu| (rank(cpu), cpu));
        ids.into_iter().take(n).collect()
    }

    fn mems_for(&self, pool: PoolId, memtype: &MemTypeSet, mem_bytes: u64) -> Result<CpuSet, Error> {
        let system = self.system();
        let pool_mems = &self.pools.pool(pool).mems;
        let mut chosen: Vec<u32> = pool_mems
            .iter()
            .filter(|&n| system.node(n).map_or(false, |node| memtype.matches(node.mem_type)))
            .collect();
        if chosen.is_empty() {
            if !memtype.is_any() {
                return Err(AllocationError::NoMatchingPool {
                    what: format!("memory type constraint in pool {}", self.pools.pool(pool).name),
                }
                .into());
            }
            chosen = pool_mems.iter().collect();
        }
        let capacity = |nodes: &[u32]| -> u64 {
            nodes
                .iter()
                .filter_map(|&n| system.node(n))
                .map(|node| node.mem_total_kb * 1024)
                .sum()
        };
        // Spill to the next-nearest matching node when local capacity does
        // not cover the request.
        if capacity(&chosen) < mem_bytes && !chosen.is_empty() {
            let origin = chosen[0];
            for candidate in system.nodes_by_distance(origin, None) {
                if chosen.contains(&candidate) {
                    continue;
                }
                let matches = system
                    .node(candidate)
                    .map_or(false, |node| memtype.matches(node.mem_type));
                if !matches {
                    continue;
                }
                chosen.push(candidate);
                if capacity(&chosen) >= mem_bytes {
                    break;
                }
            }
        }
        if capacity(&chosen) < mem_bytes {
            return Err(AllocationError::NotEnoughFreeMemory {
                requested_kb: mem_bytes / 1024,
                nodes: chosen.iter().map(|n| n.to_string()).collect::<Vec<_>>().join(","),
            }
            .into());
        }
        Ok(chosen.into_iter().collect())
    }

    fn score(
        &self,
        cache: &Cache,
        pool: PoolId,
        pod: &Pod,
        container: &str,
        exclusive: usize,
        milli: u64,
        memtype: &MemTypeSet,
    ) -> f64 {
        let ta = &self.config().topology_aware;
        let p = self.pools.pool(pool);
        let mut score = if exclusive > 0 {
            (self.exclusive_headroom(pool) - exclusive) as f64
        } else {
            (self.free_shared_milli(pool) - milli as i64) as f64 / 1000.0
        };
        if pod.effective_annotation(ANN_POOL_HINT, container) == Some(p.name.as_str()) {
            score += SCORE_POOL_HINT;
        }
        if ta.colocate_pods {
            score += SCORE_COLOCATE_POD * self.grants_of_pod_in_subtree(cache, pool, &pod.uid) as f64;
        }
        if ta.colocate_namespaces {
            score += SCORE_COLOCATE_NAMESPACE * self.grants_of_namespace_in_subtree(cache, pool, &pod.namespace) as f64;
        }
        if !memtype.is_any() {
            let system = self.system();
            let matches = p
                .mems
                .iter()
                .any(|n| system.node(n).map_or(false, |node| memtype.matches(node.mem_type)));
            if matches {
                score += SCORE_MEMTYPE_MATCH;
            }
        }
        let levels_above_numa = (respolicy_topology::TopoLevel::Numa as i64 - p.level as i64).max(0);
        score + levels_above_numa as f64 * SCORE_PER_LEVEL_ABOVE_NUMA
    }

    // Picks the pool: the deepest level with any fitting pool, then the
    // minimum score with the pool name as deterministic tie-break.
    fn select_pool(
        &self,
        cache: &Cache,
        pod: &Pod,
        container: &str,
        exclusive: usize,
        milli: u64,
        memtype: &MemTypeSet,
    ) -> Result<PoolId, Error> {
        for level in self.pools.levels_deepest_first() {
            let mut best: Option<(f64, PoolId)> = None;
            for pool in self.pools.pools_at_level(level) {
                let fits = if exclusive > 0 {
                    self.exclusive_headroom(pool) >= exclusive
                } else {
                    self.free_shared_milli(pool) >= milli as i64 && !self.sharable(pool).is_empty()
                };
                if !fits || self.mems_for(pool, memtype, 0).is_err() {
                    continue;
                }
                let score = self.score(cache, pool, pod, container, exclusive, milli, memtype);
                let better = match best {
                    None => true,
                    Some((best_score, best_pool)) => {
                        score < best_score
                            || (score == best_score && self.pools.pool(pool).name < self.pools.pool(best_pool).name)
                    }
                };
                if better {
                    best = Some((score, pool));
                }
            }
            if let Some((_, pool)) = best {
                return Ok(pool);
            }
        }
        Err(AllocationError::NotEnoughFreeCpus {
            requested: if exclusive > 0 { exclusive } else { ((milli + 999) / 1000) as usize },
            available: self.exclusive_headroom(self.pools_root()?),
        }
        .into())
    }

    fn pools_root(&self) -> Result<PoolId, Error> {
        if self.pools.is_empty() {
            return Err(AllocationError::NoMatchingPool {
                what: "empty pool tree".to_string(),
            }
            .into());
        }
        Ok(0)
    }

    fn assign_reserved(&mut self, cache: &mut Cache, id: &str, pod: &Pod, container: &str, request_milli: u64) {
        let mems: CpuSet = self
            .reserved_cpus
            .iter()
            .filter_map(|cpu| self.system().cpu(cpu).map(|c| c.numa_node))
            .collect();
        let grant = Grant {
            pool: None,
            exclusive: CpuSet::new(),
            shared_milli: request_milli,
            mems: mems.clone(),
        };
        let ta = &self.config().topology_aware;
        let cpus = if ta.pin_cpu { self.reserved_cpus.clone() } else { CpuSet::new() };
        let mems = if ta.pin_memory { mems } else { CpuSet::new() };
        cache.set_cpusets(id, CpuSet::new(), cpus, mems);
        self.set_cgroup_params(cache, id, pod, container, request_milli);
        self.grants.insert(id.to_string(), grant);
    }

    fn set_cgroup_params(&self, cache: &mut Cache, id: &str, pod: &Pod, container: &str, milli: u64) {
        let (quota, period, memory_max) = match cache.lookup_container(id) {
            Some(c) => (
                c.request.cpu_limit_milli.map(cpu_quota_from_milli),
                c.request.cpu_limit_milli.map(|_| CPU_PERIOD_USEC),
                c.request.memory_limit_bytes,
            ),
            None => (None, None, None),
        };
        cache.set_cgroup(
            id,
            CgroupParams {
                cpu_weight: Some(cpu_weight_from_milli(milli)),
                cpu_quota_usec: quota,
                cpu_period_usec: period,
                memory_max,
                // Memory-limited containers do not get to swap.
                memory_swap_max: memory_max.map(|_| 0),
                blockio_weight: pod
                    .effective_annotation(ANN_BLOCKIO_WEIGHT, container)
                    .and_then(|v| v.parse().ok()),
                rdt_class: pod
                    .effective_annotation(ANN_RDT_CLASS, container)
                    .map(str::to_string),
            },
        );
    }

    // Resolves the effective scheduling class (annotation over namespace
    // map over QoS map). The annotation may carry inline overrides, e.g.
    // `rt[priority=10,nice=-5]`.
    fn set_sched_class(&self, cache: &mut Cache, id: &str, pod: &Pod, container: &str, qos: QosClass) {
        let config = self.config();
        let ta = &config.topology_aware;
        let class = pod
            .effective_annotation(ANN_SCHED_CLASS, container)
            .map(|s| s.to_string())
            .or_else(|| ta.namespace_scheduling_classes.get(&pod.namespace).cloned())
            .or_else(|| ta.pod_qos_scheduling_classes.get(&qos).cloned());
        if let Some(class) = class {
            let (name, options) = parse_config_value(&class);
            match config.sched_params_for(&name) {
                Some(mut params) => {
                    if let Some(options) = options {
                        let options = parse_options(&options);
                        if let Some(priority) = options.get("priority").and_then(|v| v.parse().ok()) {
                            params.priority = priority;
                        }
                        if let Some(nice) = options.get("nice").and_then(|v| v.parse().ok()) {
                            params.nice = nice;
                        }
                    }
                    cache.set_sched(id, Some(params));
                }
                None => warn!(target: "topology-aware", "unknown scheduling class {:?} for {}", name, id),
            }
        }
    }

    // Shared grants are pinned to their pool's sharable CPUs, which change
    // whenever exclusive CPUs are carved or returned.
    fn refresh_shared_assignments(&mut self, cache: &mut Cache) {
        if !self.config().topology_aware.pin_cpu {
            return;
        }
        let pin_memory = self.config().topology_aware.pin_memory;
        let updates: Vec<(String, CpuSet, CpuSet)> = self
            .grants
            .iter()
            .filter(|(_, g)| g.shared_milli > 0 && g.exclusive.is_empty() && g.pool.is_some())
            .map(|(id, g)| (id.clone(), self.sharable(g.pool.unwrap()), g.mems.clone()))
            .collect();
        for (id, shared, mems) in updates {
            let current = cache.lookup_container(&id).map(|c| c.assignment.shared_cpus.clone());
            if current.as_ref() != Some(&shared) {
                let mems = if pin_memory { mems } else { CpuSet::new() };
                cache.set_cpusets(&id, CpuSet::new(), shared, mems);
            }
        }
    }

    // Moves shared grants out of oversubscribed pools until nothing
    // overflows or no move helps.
    fn rebalance_overflow(&mut self, cache: &mut Cache) -> Result<bool, Error> {
        let mut moved = false;
        for _ in 0..REBALANCE_MAX_MOVES {
            let overflowing = self
                .pools
                .levels_deepest_first()
                .into_iter()
                .flat_map(|level| self.pools.pools_at_level(level))
                .find(|&pool| self.free_shared_milli(pool) < 0);
            let pool = match overflowing {
                Some(pool) => pool,
                None => break,
            };
            let subtree = self.pools.subtree(pool);
            // The largest shared grant moves first; ties break toward the
            // lexicographically first container.
            let victim = self
                .grants
                .iter()
                .filter(|(_, g)| g.pool.map_or(false, |p| subtree.contains(&p)) && g.shared_milli > 0)
                .max_by(|a, b| {
                    a.1.shared_milli
                        .cmp(&b.1.shared_milli)
                        .then_with(|| b.0.cmp(a.0))
                })
                .map(|(id, _)| id.clone());
            let victim = match victim {
                Some(victim) => victim,
                None => break,
            };
            let old = self.grants.remove(&victim).unwrap();
            let (pod, name, milli, mem_bytes) = match (cache.pod_of(&victim).cloned(), cache.lookup_container(&victim))
            {
                (Some(pod), Some(c)) => (pod, c.name.clone(), c.request.cpu_milli, c.request.memory_bytes),
                _ => break,
            };
            let memtype = Self::memtype_of(&pod, &name);
            match self.select_pool(cache, &pod, &name, 0, milli, &memtype) {
                Ok(new_pool) if Some(new_pool) != old.pool => {
                    let mems = self.mems_for(new_pool, &memtype, mem_bytes)?;
                    self.grants.insert(
                        victim.clone(),
                        Grant {
                            pool: Some(new_pool),
                            exclusive: CpuSet::new(),
                            shared_milli: old.shared_milli,
                            mems,
                        },
                    );
                    moved = true;
                }
                _ => {
                    self.grants.insert(victim, old);
                    break;
                }
            }
        }
        if moved {
            self.refresh_shared_assignments(cache);
        }
        Ok(moved)
    }

    fn persist(&self, cache: &mut Cache) {
        let state = PolicyState {
            grants: self
                .grants
                .iter()
                .map(|(id, g)| GrantRecord {
                    container: id.clone(),
                    pool: g.pool.map(|p| self.pools.pool(p).name.clone()),
                    exclusive: g.exclusive.clone(),
                    shared_milli: g.shared_milli,
                    mems: g.mems.clone(),
                })
                .collect(),
        };
        if let Ok(value) = serde_json::to_value(&state) {
            cache.set_policy_state(value);
        }
    }

    fn allocate_inner(&mut self, cache: &mut Cache, id: &str) -> Result<(), Error> {
        let pod = cache
            .pod_of(id)
            .cloned()
            .ok_or_else(|| ProtocolError::Malformed(format!("container {} without a pod", id)))?;
        let (name, request) = {
            let c = cache
                .lookup_container(id)
                .ok_or_else(|| ProtocolError::Malformed(format!("unknown container {}", id)))?;
            (c.name.clone(), c.request.clone())
        };

        if self.config().reserved_pool_namespaces.contains(&pod.namespace) && !self.reserved_cpus.is_empty() {
            self.assign_reserved(cache, id, &pod, &name, request.cpu_milli);
            self.set_sched_class(cache, id, &pod, &name, pod.qos);
            self.persist(cache);
            return Ok(());
        }

        // A 0-CPU BestEffort request creates no grant and carries no
        // cpuset adjustment.
        if request.cpu_milli == 0 {
            return Ok(());
        }

        let ta = &self.config().topology_aware;
        let pin_cpu = ta.pin_cpu;
        let pin_memory = ta.pin_memory;
        let prefer_isolated_default = ta.prefer_isolated_cpus;
        let exclusive_wanted = self.exclusive_cpus_wanted(&pod, &name, pod.qos, request.cpu_milli);
        let memtype = Self::memtype_of(&pod, &name);
        let priority = self.cpu_priority_of(&pod, &name);

        let pool = self.select_pool(cache, &pod, &name, exclusive_wanted, request.cpu_milli, &memtype)?;
        let mems = self.mems_for(pool, &memtype, request.memory_bytes)?;

        let grant = if exclusive_wanted > 0 {
            let prefer_isolated = Self::bool_annotation(&pod, ANN_PREFER_ISOLATED, &name, prefer_isolated_default);
            let free_isolated = self.free_isolated(pool);
            let cpus = if prefer_isolated && free_isolated.len() >= exclusive_wanted {
                self.pick_cpus(&free_isolated, exclusive_wanted, priority)
            } else {
                let allocator = self.allocator.as_ref().expect("setup not called");
                let from = allocator
                    .resize(&CpuSet::new(), &self.sharable(pool), exclusive_wanted as i64)?
                    .add_from;
                self.pick_cpus(&from, exclusive_wanted, priority)
            };
            Grant {
                pool: Some(pool),
                exclusive: cpus,
                shared_milli: 0,
                mems,
            }
        } else {
            Grant {
                pool: Some(pool),
                exclusive: CpuSet::new(),
                shared_milli: request.cpu_milli,
                mems,
            }
        };

        let exclusive = grant.exclusive.clone();
        let shared = if exclusive.is_empty() { self.sharable(pool) } else { CpuSet::new() };
        self.grants.insert(id.to_string(), grant.clone());

        if pin_cpu {
            let mems = if pin_memory { grant.mems.clone() } else { CpuSet::new() };
            cache.set_cpusets(id, exclusive.clone(), shared, mems);
        } else if pin_memory {
            cache.set_cpusets(id, CpuSet::new(), CpuSet::new(), grant.mems.clone());
        }
        self.set_cgroup_params(cache, id, &pod, &name, request.cpu_milli);
        self.set_sched_class(cache, id, &pod, &name, pod.qos);

        if !exclusive.is_empty() {
            self.refresh_shared_assignments(cache);
        }
        self.rebalance_overflow(cache)?;
        self.persist(cache);
        Ok(())
    }
}

impl ResourcePolicy for TopologyAwarePolicy {
    fn name(&self) -> &'static str {
        "topology-aware"
    }

    fn setup(&mut self, system: &System, config: &DaemonConfig) -> Result<(), Error> {
        let tree = Rc::new(CpuTree::from_system(system));
        let available = if config.available.cpu.is_empty() {
            system.cpu_ids()
        } else {
            config.available.cpu.intersection(&system.cpu_ids())
        };
        self.reserved_cpus = config.reserved.cpu.intersection(&available);
        let usable = available.difference(&self.reserved_cpus);
        self.pools = PoolTree::build(&tree, system, &usable);
        self.allocator = Some(CpuAllocator::new(tree, false));
        self.system = Some(system.clone());
        self.config = Some(config.clone());
        self.grants.clear();
        Ok(())
    }

    fn start(&mut self, cache: &mut Cache) -> Result<(), Error> {
        let state: PolicyState = match cache.policy_state() {
            Some(value) => match serde_json::from_value(value.clone()) {
                Ok(state) => state,
                Err(_) => return Ok(()),
            },
            None => return Ok(()),
        };
        for record in state.grants {
            if cache.lookup_container(&record.container).is_none() {
                continue;
            }
            let pool = match &record.pool {
                Some(name) => match self.pools.by_name(name) {
                    Some(id) => Some(id),
                    None => continue,
                },
                None => None,
            };
            self.grants.insert(
                record.container,
                Grant {
                    pool,
                    exclusive: record.exclusive,
                    shared_milli: record.shared_milli,
                    mems: record.mems,
                },
            );
        }
        Ok(())
    }

    fn sync(&mut self, cache: &mut Cache) -> Result<(), Error> {
        let pending: Vec<String> = cache
            .containers()
            .filter(|c| !self.grants.contains_key(&c.id) && !c.failed)
            .filter(|c| {
                c.request.cpu_milli > 0
                    || cache
                        .pod_of(&c.id)
                        .map_or(false, |p| self.config().reserved_pool_namespaces.contains(&p.namespace))
            })
            .map(|c| c.id.clone())
            .collect();
        for id in pending {
            if let Err(e) = self.allocate_inner(cache, &id) {
                warn!(target: "topology-aware", "sync: failed to place {}: {}", id, e);
            }
        }
        Ok(())
    }

    fn allocate(&mut self, cache: &mut Cache, container_id: &str) -> Result<(), Error> {
        self.allocate_inner(cache, container_id)
    }

    fn release(&mut self, cache: &mut Cache, container_id: &str) -> Result<(), Error> {
        if let Some(grant) = self.grants.remove(container_id) {
            cache.clear_assignment(container_id);
            if !grant.exclusive.is_empty() {
                self.refresh_shared_assignments(cache);
            }
            self.persist(cache);
        }
        Ok(())
    }

    fn update(&mut self, cache: &mut Cache, container_id: &str) -> Result<(), Error> {
        let old = self.grants.remove(container_id);
        match self.allocate_inner(cache, container_id) {
            Ok(()) => Ok(()),
            Err(e) => {
                // The container keeps its previous assignment.
                if let Some(old) = old {
                    self.grants.insert(container_id.to_string(), old);
                }
                Err(e)
            }
        }
    }

    fn handle_event(&mut self, cache: &mut Cache, event: PolicyEvent) -> Result<bool, Error> {
        match event {
            PolicyEvent::Rebalance => {
                let moved = self.rebalance_overflow(cache)?;
                if moved {
                    self.persist(cache);
                }
                Ok(moved)
            }
        }
    }

    fn export_metrics(&self) -> serde_json::Value {
        let pools: Vec<_> = self
            .pools
            .pools()
            .iter()
            .map(|p| {
                json!({
                    "name": p.name,
                    "level": p.level.to_string(),
                    "cpus": p.cpus.to_string(),
                    "sharable": self.sharable(p.id).to_string(),
                    "sharedGrantedMilli": self.shared_granted_in_subtree(p.id),
                })
            })
            .collect();
        json!({
            "policy": "topology-aware",
            "grants": self.grants.len(),
            "pools": pools,
        })
    }
}
