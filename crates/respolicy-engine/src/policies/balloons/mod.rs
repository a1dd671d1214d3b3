//! Balloons placement policy.
//!
//! Containers are placed into named CPU pools (balloons) instantiated from
//! configured workload classes. Balloons inflate and deflate with their
//! members' aggregate CPU request, stay bound to a topology branch, and may
//! carry per-CPU kernel knobs (cpufreq, uncore, c-states) plus a scheduling
//! class for their members.

pub mod balloon;

use std::collections::BTreeMap;
use std::rc::Rc;

use indexmap::IndexMap;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;

use respolicy_topology::{AllocationError, CpuAllocator, CpuSet, CpuTree, NodeId, System, TopoLevel};

use crate::core::cache::Cache;
use crate::core::common::{cpu_quota_from_milli, cpu_weight_from_milli, CgroupParams, CPU_PERIOD_USEC};
use crate::core::config::{AllocatorMode, BalloonClassConfig, DaemonConfig};
use crate::core::errors::{Error, ProtocolError};
use crate::core::pod::Pod;
use crate::core::policy::{PolicyEvent, ResourcePolicy};

use balloon::{Balloon, BalloonPart, BalloonRecord};

/// Annotation selecting the balloon class; container-scoped form appends
/// `/container.<name>`.
const ANN_BALLOON: &str = "balloon.respolicy.io";

/// Environment variable naming the balloon a container landed in.
const ENV_BALLOON: &str = "BALLOON";

const ANN_BLOCKIO_WEIGHT: &str = "blockio-weight.respolicy.io";
const ANN_RDT_CLASS: &str = "rdt-class.respolicy.io";

const CLASS_RESERVED: &str = "reserved";
const CLASS_DEFAULT: &str = "default";

#[derive(Serialize, Deserialize)]
struct PolicyState {
    balloons: Vec<BalloonRecord>,
}

/// The balloons policy.
#[derive(Default)]
pub struct BalloonsPolicy {
    config: Option<DaemonConfig>,
    system: Option<System>,
    tree: Option<Rc<CpuTree>>,
    classes: IndexMap<String, BalloonClassConfig>,
    free: CpuSet,
    reserved_cpus: CpuSet,
    balloons: BTreeMap<String, Balloon>,
    assignments: BTreeMap<String, String>,
}

impl BalloonsPolicy {
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

    fn tree(&self) -> &Rc<CpuTree> {
        self.tree.as_ref().expect("setup not called")
    }

    fn class(&self, name: &str) -> &BalloonClassConfig {
        &self.classes[name]
    }

    fn node_by_name(&self, name: &str) -> Option<NodeId> {
        let tree = self.tree();
        tree.node_ids().find(|&id| tree.node(id).name == name)
    }

    // Branches a class at the given level can bind to, in name order.
    fn branches_at(&self, level: TopoLevel) -> Vec<NodeId> {
        let tree = self.tree();
        if level == TopoLevel::System {
            return vec![tree.root()];
        }
        let mut branches = tree.nodes_at_level(level);
        branches.sort_by(|&a, &b| tree.node(a).name.cmp(&tree.node(b).name));
        branches
    }

    fn instances_of(&self, class: &str) -> Vec<String> {
        self.balloons
            .values()
            .filter(|b| b.class == class)
            .map(|b| b.name.clone())
            .collect()
    }

    fn round_up(n: usize, multiple: usize) -> usize {
        if multiple == 0 {
            n
        } else {
            (n + multiple - 1) / multiple * multiple
        }
    }

    // Target CPU count for a balloon serving `total_milli` of requests. A
    // composite balloon keeps at least one CPU per part and sizes in
    // multiples of its part count so every branch stays represented.
    fn needed_cpus(class: &BalloonClassConfig, parts: usize, total_milli: u64) -> usize {
        let mut n = ((total_milli + 999) / 1000) as usize;
        n = n.max(class.min_cpus);
        if parts > 0 {
            n = Self::round_up(n.max(parts), parts);
        }
        n
    }

    fn apply_cpu_knobs(&self, cache: &mut Cache, class: &BalloonClassConfig, cpus: &CpuSet, engage: bool) {
        for cpu in cpus.iter() {
            cache.push_cpu_knob(cpu, |knob| {
                if let Some(freq) = class.cpu_freq {
                    knob.freq_min_khz = Some(if engage { freq.min } else { 0 });
                    knob.freq_max_khz = Some(if engage { freq.max } else { 0 });
                }
                if let Some(uncore) = class.uncore_freq {
                    knob.uncore_min_khz = Some(if engage { uncore.min } else { 0 });
                    knob.uncore_max_khz = Some(if engage { uncore.max } else { 0 });
                }
                for (state, enabled) in &class.c_states {
                    let value = if engage { *enabled } else { true };
                    knob.cstates.insert(state.clone(), value);
                }
            });
        }
    }

    // Grows or shrinks one balloon to `target` CPUs, moving CPUs between
    // the balloon and the free pool and recording knob deltas.
    fn resize_balloon(&mut self, cache: &mut Cache, name: &str, target: usize) -> Result<(), Error> {
        let balloon = self.balloons.get(name).expect("unknown balloon").clone();
        let class = self.class(&balloon.class).clone();
        let current_len = balloon.cpus.len();
        if target == current_len {
            return Ok(());
        }

        let mut balloon = balloon;
        if !balloon.parts.is_empty() {
            let per_part = target / balloon.parts.len();
            self.resize_composite(cache, &mut balloon, &class, per_part)?;
        } else if target > current_len {
            let grown = self.grow_simple(cache, &balloon, &class, target - current_len)?;
            balloon.cpus.extend(&grown);
        } else {
            let shrunk = self.shrink_simple(cache, &balloon, &class, current_len - target)?;
            balloon.cpus.subtract(&shrunk);
        }
        balloon.refresh_mems(self.system.as_ref().expect("setup not called"));
        self.balloons.insert(name.to_string(), balloon);
        Ok(())
    }

    fn grow_simple(
        &mut self,
        cache: &mut Cache,
        balloon: &Balloon,
        class: &BalloonClassConfig,
        delta: usize,
    ) -> Result<CpuSet, Error> {
        let allocator = CpuAllocator::new(self.tree().clone(), class.allocator == AllocatorMode::Balance);
        let pool = match balloon.branch {
            Some(branch) => self.free.intersection(&self.tree().node(branch).cpus),
            None => self.free.clone(),
        };
        let picked = match allocator.resize(&balloon.cpus, &pool, delta as i64) {
            Ok(resize) => {
                let mut from = resize.add_from;
                from.take_first(delta)
            }
            Err(AllocationError::NotEnoughFreeCpus { .. }) if balloon.branch.is_some() => {
                // The bound branch is exhausted; spill across it.
                debug!(target: "balloons", "{}: branch exhausted, spilling", balloon.name);
                let mut from = allocator.resize(&balloon.cpus, &self.free, delta as i64)?.add_from;
                from.take_first(delta)
            }
            Err(e) => return Err(e.into()),
        };
        self.free.subtract(&picked);
        self.apply_cpu_knobs(cache, class, &picked, true);
        Ok(picked)
    }

    fn shrink_simple(
        &mut self,
        cache: &mut Cache,
        balloon: &Balloon,
        class: &BalloonClassConfig,
        delta: usize,
    ) -> Result<CpuSet, Error> {
        let allocator = CpuAllocator::new(self.tree().clone(), class.allocator == AllocatorMode::Balance);
        let removed = allocator.resize(&balloon.cpus, &self.free, -(delta as i64))?.remove_from;
        self.free.extend(&removed);
        self.apply_cpu_knobs(cache, class, &removed, false);
        Ok(removed)
    }

    fn resize_composite(
        &mut self,
        cache: &mut Cache,
        balloon: &mut Balloon,
        class: &BalloonClassConfig,
        per_part: usize,
    ) -> Result<(), Error> {
        let allocator = CpuAllocator::new(self.tree().clone(), class.allocator == AllocatorMode::Balance);
        for part in balloon.parts.iter_mut() {
            let have = part.cpus.len();
            if per_part > have {
                let branch_free = self.free.intersection(&self.tree().node(part.branch).cpus);
                let mut from = allocator.resize(&part.cpus, &branch_free, (per_part - have) as i64)?.add_from;
                let picked = from.take_first(per_part - have);
                self.free.subtract(&picked);
                self.apply_cpu_knobs(cache, class, &picked, true);
                part.cpus.extend(&picked);
            } else if per_part < have {
                let removed = allocator.resize(&part.cpus, &self.free, -((have - per_part) as i64))?.remove_from;
                self.free.extend(&removed);
                self.apply_cpu_knobs(cache, class, &removed, false);
                part.cpus.subtract(&removed);
            }
        }
        balloon.cpus = balloon
            .parts
            .iter()
            .fold(CpuSet::new(), |acc, part| acc.union(&part.cpus));
        Ok(())
    }

    fn create_balloon(&mut self, cache: &mut Cache, class_name: &str) -> Result<String, Error> {
        let class = self.class(class_name).clone();
        let instance = (0..).find(|i| {
            !self
                .balloons
                .values()
                .any(|b| b.class == class_name && b.instance == *i)
        });
        let instance = instance.unwrap();
        let name = format!("{}[{}]", class_name, instance);

        let (branch, parts) = if !class.components.is_empty() {
            let mut parts = Vec::new();
            for component in &class.components {
                let level = self.class(component).topology_level;
                for branch in self.branches_at(level) {
                    parts.push(BalloonPart {
                        branch,
                        cpus: CpuSet::new(),
                    });
                }
            }
            (None, parts)
        } else if class.topology_level == TopoLevel::System {
            (None, Vec::new())
        } else {
            (self.pick_branch(&class), Vec::new())
        };

        let balloon = Balloon {
            class: class_name.to_string(),
            instance,
            name: name.clone(),
            branch,
            parts,
            cpus: CpuSet::new(),
            mems: CpuSet::new(),
            members: Default::default(),
        };
        self.balloons.insert(name.clone(), balloon);

        let min = Self::needed_cpus(&class, self.balloons[&name].parts.len(), 0);
        if min > 0 {
            if let Err(e) = self.resize_balloon(cache, &name, min) {
                self.balloons.remove(&name);
                return Err(e);
            }
        }
        Ok(name)
    }

    // Picks the branch a new simple balloon binds to: packing fills the
    // least-free branch that still fits, balancing takes the most-free one.
    fn pick_branch(&self, class: &BalloonClassConfig) -> Option<NodeId> {
        let tree = self.tree();
        let mut candidates: Vec<(usize, &str, NodeId)> = self
            .branches_at(class.topology_level)
            .into_iter()
            .map(|id| {
                let node = tree.node(id);
                (self.free.intersection(&node.cpus).len(), node.name.as_str(), id)
            })
            .filter(|(free, _, _)| *free >= class.min_cpus)
            .collect();
        match class.allocator {
            AllocatorMode::Pack => candidates.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1))),
            AllocatorMode::Balance => candidates.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1))),
        }
        candidates.first().map(|(_, _, id)| *id)
    }

    fn resolve_class(&self, pod: &Pod, container: &str) -> Result<String, Error> {
        if let Some(explicit) = pod.effective_annotation(ANN_BALLOON, container) {
            if self.classes.contains_key(explicit) {
                return Ok(explicit.to_string());
            }
            return Err(AllocationError::NoMatchingPool {
                what: format!("balloon class {:?}", explicit),
            }
            .into());
        }
        for (name, class) in &self.classes {
            let matched = class.namespaces.iter().any(|pattern| {
                pattern == &pod.namespace
                    || pattern
                        .strip_suffix('*')
                        .map_or(false, |prefix| pod.namespace.starts_with(prefix))
            });
            if matched {
                return Ok(name.clone());
            }
        }
        for (name, class) in &self.classes {
            if class.pod_qos.contains(&pod.qos) {
                return Ok(name.clone());
            }
        }
        if self.config().reserved_pool_namespaces.contains(&pod.namespace) {
            return Ok(CLASS_RESERVED.to_string());
        }
        Ok(CLASS_DEFAULT.to_string())
    }

    fn refresh_members(&self, cache: &mut Cache, name: &str) {
        let balloon = &self.balloons[name];
        for member in balloon.members.clone() {
            cache.set_env(&member, ENV_BALLOON, &balloon.name);
            cache.set_cpusets(&member, CpuSet::new(), balloon.cpus.clone(), balloon.mems.clone());
        }
    }

    fn place_container(&mut self, cache: &mut Cache, id: &str, balloon_name: &str, milli: u64) {
        let class_name = self.balloons[balloon_name].class.clone();
        if let Some(balloon) = self.balloons.get_mut(balloon_name) {
            balloon.members.insert(id.to_string());
        }
        self.assignments.insert(id.to_string(), balloon_name.to_string());
        self.refresh_members(cache, balloon_name);

        let (quota, period, memory_max) = match cache.lookup_container(id) {
            Some(c) => (
                c.request.cpu_limit_milli.map(cpu_quota_from_milli),
                c.request.cpu_limit_milli.map(|_| CPU_PERIOD_USEC),
                c.request.memory_limit_bytes,
            ),
            None => (None, None, None),
        };
        let (blockio_weight, rdt_class) = match (cache.pod_of(id).cloned(), cache.lookup_container(id)) {
            (Some(pod), Some(c)) => (
                pod.effective_annotation(ANN_BLOCKIO_WEIGHT, &c.name)
                    .and_then(|v| v.parse().ok()),
                pod.effective_annotation(ANN_RDT_CLASS, &c.name).map(str::to_string),
            ),
            _ => (None, None),
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
                blockio_weight,
                rdt_class,
            },
        );
        let class = self.class(&class_name);
        if let Some(sched_class) = class.scheduling.clone() {
            if let Some(params) = self.config().sched_params_for(&sched_class) {
                cache.set_sched(id, Some(params));
            }
        }
    }

    // Tries to make room for `milli` more in the given balloon; grows it
    // when necessary. The reserved balloon always accepts its namespaces.
    fn try_fit(&mut self, cache: &mut Cache, name: &str, milli: u64) -> Result<bool, Error> {
        let balloon = &self.balloons[name];
        let class = self.class(&balloon.class).clone();
        let parts = balloon.parts.len();
        if balloon.class == CLASS_RESERVED {
            return Ok(true);
        }
        let total = balloon.used_milli(cache) + milli;
        let target = Self::needed_cpus(&class, parts, total);
        if class.max_cpus > 0 && target > class.max_cpus {
            return Ok(false);
        }
        match self.resize_balloon(cache, name, target) {
            Ok(()) => Ok(true),
            Err(Error::Allocation(AllocationError::NotEnoughFreeCpus { .. })) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn allocate_inner(&mut self, cache: &mut Cache, id: &str) -> Result<(), Error> {
        let pod = cache
            .pod_of(id)
            .cloned()
            .ok_or_else(|| ProtocolError::Malformed(format!("container {} without a pod", id)))?;
        let (name, milli) = {
            let c = cache
                .lookup_container(id)
                .ok_or_else(|| ProtocolError::Malformed(format!("unknown container {}", id)))?;
            (c.name.clone(), c.request.cpu_milli)
        };

        // 0-CPU requests get no balloon and no cpuset adjustment.
        if milli == 0 {
            return Ok(());
        }

        let class_name = self.resolve_class(&pod, &name)?;
        let class = self.class(&class_name).clone();

        let mut candidates = self.instances_of(&class_name);
        candidates.sort_by_key(|name| {
            let used = self.balloons[name].used_milli(cache);
            match class.allocator {
                // Packing fills the most-used instance first, balancing the
                // least-used.
                AllocatorMode::Pack => (std::cmp::Reverse(used), self.balloons[name].instance),
                AllocatorMode::Balance => (std::cmp::Reverse(u64::MAX - used), self.balloons[name].instance),
            }
        });

        for candidate in &candidates {
            if self.try_fit(cache, candidate, milli)? {
                self.place_container(cache, id, candidate, milli);
                self.persist(cache);
                return Ok(());
            }
        }

        let may_create = class.max_balloons == 0 || (candidates.len() as u32) < class.max_balloons;
        if may_create {
            let created = self.create_balloon(cache, &class_name)?;
            if self.try_fit(cache, &created, milli)? {
                self.place_container(cache, id, &created, milli);
                self.persist(cache);
                return Ok(());
            }
            if let Some(balloon) = self.balloons.remove(&created) {
                let class = self.class(&balloon.class).clone();
                self.apply_cpu_knobs(cache, &class, &balloon.cpus, false);
                self.free.extend(&balloon.cpus);
            }
        }
        Err(AllocationError::NotEnoughFreeCpus {
            requested: ((milli + 999) / 1000) as usize,
            available: self.free.len(),
        }
        .into())
    }

    fn release_inner(&mut self, cache: &mut Cache, id: &str) -> Result<(), Error> {
        let balloon_name = match self.assignments.remove(id) {
            Some(name) => name,
            None => return Ok(()),
        };
        cache.clear_assignment(id);
        match self.balloons.get_mut(&balloon_name) {
            Some(balloon) => balloon.members.remove(id),
            None => return Ok(()),
        };
        let (class_name, empty, parts, total) = {
            let balloon = &self.balloons[&balloon_name];
            (
                balloon.class.clone(),
                balloon.members.is_empty(),
                balloon.parts.len(),
                balloon.used_milli(cache),
            )
        };
        let class = self.class(&class_name).clone();

        if empty && class_name != CLASS_RESERVED {
            let instances = self.instances_of(&class_name).len() as u32;
            if instances > class.min_balloons {
                let balloon = self.balloons.remove(&balloon_name).unwrap();
                self.apply_cpu_knobs(cache, &class, &balloon.cpus, false);
                self.free.extend(&balloon.cpus);
                self.persist(cache);
                return Ok(());
            }
        }

        let target = Self::needed_cpus(&class, parts, total);
        if class_name != CLASS_RESERVED && target < self.balloons[&balloon_name].cpus.len() {
            self.resize_balloon(cache, &balloon_name, target)?;
            self.refresh_members(cache, &balloon_name);
        }
        self.persist(cache);
        Ok(())
    }

    fn persist(&self, cache: &mut Cache) {
        let tree = self.tree();
        let state = PolicyState {
            balloons: self
                .balloons
                .values()
                .map(|b| BalloonRecord {
                    class: b.class.clone(),
                    instance: b.instance,
                    name: b.name.clone(),
                    branch: b.branch.map(|id| tree.node(id).name.clone()),
                    parts: b
                        .parts
                        .iter()
                        .map(|p| (tree.node(p.branch).name.clone(), p.cpus.clone()))
                        .collect(),
                    cpus: b.cpus.clone(),
                    mems: b.mems.clone(),
                    members: b.members.clone(),
                })
                .collect(),
        };
        if let Ok(value) = serde_json::to_value(&state) {
            cache.set_policy_state(value);
        }
    }

    fn restore_records(&mut self, cache: &Cache) {
        let state: PolicyState = match cache.policy_state() {
            Some(value) => match serde_json::from_value(value.clone()) {
                Ok(state) => state,
                Err(_) => return,
            },
            None => return,
        };
        for record in state.balloons {
            if !self.classes.contains_key(&record.class) {
                continue;
            }
            let branch = match &record.branch {
                Some(name) => match self.node_by_name(name) {
                    Some(id) => Some(id),
                    None => continue,
                },
                None => None,
            };
            let mut parts = Vec::new();
            for (part_name, cpus) in &record.parts {
                if let Some(id) = self.node_by_name(part_name) {
                    parts.push(BalloonPart {
                        branch: id,
                        cpus: cpus.clone(),
                    });
                }
            }
            let members: std::collections::BTreeSet<String> = record
                .members
                .iter()
                .filter(|id| cache.lookup_container(id).is_some())
                .cloned()
                .collect();
            self.free.subtract(&record.cpus);
            for member in &members {
                self.assignments.insert(member.clone(), record.name.clone());
            }
            self.balloons.insert(
                record.name.clone(),
                Balloon {
                    class: record.class,
                    instance: record.instance,
                    name: record.name,
                    branch,
                    parts,
                    cpus: record.cpus,
                    mems: record.mems,
                    members,
                },
            );
        }
    }

    fn resolve_classes(&mut self, config: &DaemonConfig) {
        self.classes = IndexMap::new();
        for class in &config.balloons.balloon_types {
            self.classes.insert(class.name.clone(), class.clone());
        }
        if !self.classes.contains_key(CLASS_RESERVED) {
            self.classes.insert(
                CLASS_RESERVED.to_string(),
                BalloonClassConfig {
                    name: CLASS_RESERVED.to_string(),
                    min_cpus: self.reserved_cpus.len(),
                    max_cpus: self.reserved_cpus.len(),
                    min_balloons: 1,
                    max_balloons: 1,
                    topology_level: TopoLevel::System,
                    allocator: AllocatorMode::Pack,
                    namespaces: Vec::new(),
                    pod_qos: Vec::new(),
                    cpu_freq: None,
                    uncore_freq: None,
                    c_states: Default::default(),
                    scheduling: None,
                    components: Vec::new(),
                },
            );
        }
        if !self.classes.contains_key(CLASS_DEFAULT) {
            self.classes.insert(
                CLASS_DEFAULT.to_string(),
                BalloonClassConfig {
                    name: CLASS_DEFAULT.to_string(),
                    min_cpus: 0,
                    max_cpus: 0,
                    min_balloons: 1,
                    max_balloons: 1,
                    topology_level: TopoLevel::System,
                    allocator: AllocatorMode::Pack,
                    namespaces: Vec::new(),
                    pod_qos: Vec::new(),
                    cpu_freq: None,
                    uncore_freq: None,
                    c_states: Default::default(),
                    scheduling: None,
                    components: Vec::new(),
                },
            );
        }
    }
}

impl ResourcePolicy for BalloonsPolicy {
    fn name(&self) -> &'static str {
        "balloons"
    }

    fn setup(&mut self, system: &System, config: &DaemonConfig) -> Result<(), Error> {
        let tree = Rc::new(CpuTree::from_system(system));
        let available = if config.available.cpu.is_empty() {
            system.cpu_ids()
        } else {
            config.available.cpu.intersection(&system.cpu_ids())
        };
        self.reserved_cpus = config.reserved.cpu.intersection(&available);
        self.free = available.difference(&self.reserved_cpus);
        self.tree = Some(tree);
        self.system = Some(system.clone());
        self.config = Some(config.clone());
        self.balloons.clear();
        self.assignments.clear();
        self.resolve_classes(config);
        Ok(())
    }

    // Restores persisted balloons, then makes sure the reserved balloon and
    // every class's minBalloons instances exist.
    fn start(&mut self, cache: &mut Cache) -> Result<(), Error> {
        self.restore_records(cache);

        if !self.balloons.values().any(|b| b.class == CLASS_RESERVED) {
            let mut reserved = Balloon {
                class: CLASS_RESERVED.to_string(),
                instance: 0,
                name: format!("{}[0]", CLASS_RESERVED),
                branch: None,
                parts: Vec::new(),
                cpus: self.reserved_cpus.clone(),
                mems: CpuSet::new(),
                members: Default::default(),
            };
            reserved.refresh_mems(self.system.as_ref().expect("setup not called"));
            self.balloons.insert(reserved.name.clone(), reserved);
        }

        let class_names: Vec<String> = self.classes.keys().cloned().collect();
        for class_name in class_names {
            if class_name == CLASS_RESERVED {
                continue;
            }
            let min_balloons = self
                .class(&class_name)
                .min_balloons
                .max(if class_name == CLASS_DEFAULT { 1 } else { 0 });
            while (self.instances_of(&class_name).len() as u32) < min_balloons {
                if let Err(e) = self.create_balloon(cache, &class_name) {
                    warn!(target: "balloons", "cannot pre-create {} balloon: {}", class_name, e);
                    break;
                }
            }
        }
        self.persist(cache);
        Ok(())
    }

    fn sync(&mut self, cache: &mut Cache) -> Result<(), Error> {
        let pending: Vec<String> = cache
            .containers()
            .filter(|c| !self.assignments.contains_key(&c.id) && !c.failed && c.request.cpu_milli > 0)
            .map(|c| c.id.clone())
            .collect();
        for id in pending {
            if let Err(e) = self.allocate_inner(cache, &id) {
                warn!(target: "balloons", "sync: failed to place {}: {}", id, e);
            }
        }
        Ok(())
    }

    fn allocate(&mut self, cache: &mut Cache, container_id: &str) -> Result<(), Error> {
        self.allocate_inner(cache, container_id)
    }

    fn release(&mut self, cache: &mut Cache, container_id: &str) -> Result<(), Error> {
        self.release_inner(cache, container_id)
    }

    fn update(&mut self, cache: &mut Cache, container_id: &str) -> Result<(), Error> {
        let old_balloon = match self.assignments.get(container_id).cloned() {
            Some(name) => name,
            None => return self.allocate_inner(cache, container_id),
        };
        let milli = cache
            .lookup_container(container_id)
            .map(|c| c.request.cpu_milli)
            .unwrap_or(0);

        // Try to grow the current balloon in place first; move only when it
        // cannot fit the new request.
        if self.try_fit(cache, &old_balloon, 0)? {
            let (parts, total, class_name) = {
                let balloon = &self.balloons[&old_balloon];
                (balloon.parts.len(), balloon.used_milli(cache), balloon.class.clone())
            };
            let class = self.class(&class_name).clone();
            let target = Self::needed_cpus(&class, parts, total);
            if class.max_cpus == 0 || target <= class.max_cpus {
                self.resize_balloon(cache, &old_balloon, target)?;
                self.refresh_members(cache, &old_balloon);
                self.place_container(cache, container_id, &old_balloon, milli);
                self.persist(cache);
                return Ok(());
            }
        }

        self.release_inner(cache, container_id)?;
        match self.allocate_inner(cache, container_id) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(target: "balloons", "update: failed to re-place {}: {}", container_id, e);
                Err(e)
            }
        }
    }

    fn handle_event(&mut self, _cache: &mut Cache, event: PolicyEvent) -> Result<bool, Error> {
        match event {
            PolicyEvent::Rebalance => Ok(false),
        }
    }

    fn export_metrics(&self) -> serde_json::Value {
        let balloons: Vec<_> = self
            .balloons
            .values()
            .map(|b| {
                json!({
                    "name": b.name,
                    "class": b.class,
                    "cpus": b.cpus.to_string(),
                    "mems": b.mems.to_string(),
                    "members": b.members.len(),
                })
            })
            .collect();
        json!({
            "policy": "balloons",
            "free": self.free.to_string(),
            "balloons": balloons,
        })
    }
}
