//! Container cache: pods, containers and pending controller deltas.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use respolicy_topology::CpuSet;

use crate::core::common::{Assignment, CgroupParams, SchedParams};
use crate::core::container::{Container, ContainerState};
use crate::core::errors::CacheError;
use crate::core::pod::Pod;

/// Version written into persisted blobs. Migration is strictly
/// forward-incompatible: a mismatch discards the blob wholesale.
pub const CACHE_SCHEMA_VERSION: u32 = 1;

/// The controller a pending delta belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PendingKind {
    /// cpuset.cpus / cpuset.mems changes.
    Cpuset,
    /// cpu.weight / cpu.max / memory limits.
    Cgroup,
    /// Scheduling policy/priority/nice/ioprio.
    Sched,
    /// io.weight.
    Blockio,
    /// resctrl class membership.
    Rdt,
}

/// Pending per-CPU kernel knob changes (cpufreq, uncore, c-states).
///
/// These are side effects of balloon membership, not container cgroup
/// parameters, so they are tracked per CPU id.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuKnobDelta {
    /// scaling_min_freq in kHz; 0 resets to the hardware default.
    pub freq_min_khz: Option<u64>,
    /// scaling_max_freq in kHz; 0 resets to the hardware default.
    pub freq_max_khz: Option<u64>,
    /// Uncore min frequency in kHz; 0 resets.
    pub uncore_min_khz: Option<u64>,
    /// Uncore max frequency in kHz; 0 resets.
    pub uncore_max_khz: Option<u64>,
    /// Per-c-state enablement, keyed by state name (e.g. `C6`).
    pub cstates: BTreeMap<String, bool>,
}

/// Point-in-time copy used to roll a pipeline step back.
pub struct CacheCheckpoint {
    containers: BTreeMap<String, Container>,
    pods: BTreeMap<String, Pod>,
    policy_state: Option<serde_json::Value>,
}

/// Serialized form of the cache.
#[derive(Serialize, Deserialize)]
struct CacheBlob {
    schema_version: u32,
    pods: Vec<Pod>,
    containers: Vec<Container>,
    policy_state: Option<serde_json::Value>,
}

/// State of all pods and containers plus the deltas controllers still have
/// to drain. Mutated only from inside a serialized pipeline step.
#[derive(Default)]
pub struct Cache {
    pods: BTreeMap<String, Pod>,
    containers: BTreeMap<String, Container>,
    pending: BTreeMap<PendingKind, BTreeSet<String>>,
    pending_knobs: BTreeMap<u32, CpuKnobDelta>,
    policy_state: Option<serde_json::Value>,
}

impl Cache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a pod.
    pub fn insert_pod(&mut self, pod: Pod) {
        self.pods.insert(pod.uid.clone(), pod);
    }

    /// Removes a pod once it has no containers left. Returns the pod, or
    /// `None` if it is unknown or still has containers.
    pub fn remove_pod(&mut self, uid: &str) -> Option<Pod> {
        if self.pods.get(uid).map_or(true, |p| !p.containers.is_empty()) {
            return None;
        }
        self.pods.remove(uid)
    }

    /// Pod accessor.
    pub fn pod(&self, uid: &str) -> Option<&Pod> {
        self.pods.get(uid)
    }

    /// All pods in uid order.
    pub fn pods(&self) -> impl Iterator<Item = &Pod> {
        self.pods.values()
    }

    /// Inserts a container and links it to its pod.
    pub fn insert_container(&mut self, container: Container) {
        if let Some(pod) = self.pods.get_mut(&container.pod_uid) {
            pod.containers.insert(container.id.clone());
        }
        self.containers.insert(container.id.clone(), container);
    }

    /// Removes a container, unlinking it from its pod and dropping its
    /// pending deltas.
    pub fn remove_container(&mut self, id: &str) -> Option<Container> {
        let container = self.containers.remove(id)?;
        if let Some(pod) = self.pods.get_mut(&container.pod_uid) {
            pod.containers.remove(id);
        }
        for set in self.pending.values_mut() {
            set.remove(id);
        }
        Some(container)
    }

    /// Container accessor.
    pub fn lookup_container(&self, id: &str) -> Option<&Container> {
        self.containers.get(id)
    }

    /// All containers in id order.
    pub fn containers(&self) -> impl Iterator<Item = &Container> {
        self.containers.values()
    }

    /// The pod owning the given container.
    pub fn pod_of(&self, container_id: &str) -> Option<&Pod> {
        let pod_uid = &self.containers.get(container_id)?.pod_uid;
        self.pods.get(pod_uid)
    }

    /// Transitions a container's state, enforcing the transition matrix.
    pub fn set_state(&mut self, id: &str, next: ContainerState) -> bool {
        match self.containers.get_mut(id) {
            Some(c) if c.state.can_transition(next) => {
                c.state = next;
                true
            }
            _ => false,
        }
    }

    /// Replaces a container's resource request (UpdateContainer).
    pub fn set_request(&mut self, id: &str, request: crate::core::common::ResourceRequest) {
        if let Some(c) = self.containers.get_mut(id) {
            c.request = request;
        }
    }

    /// Assigns CPU and memory sets, marking the cpuset delta pending.
    pub fn set_cpusets(&mut self, id: &str, exclusive: CpuSet, shared: CpuSet, mems: CpuSet) {
        if let Some(c) = self.containers.get_mut(id) {
            c.assignment.exclusive_cpus = exclusive;
            c.assignment.shared_cpus = shared;
            c.assignment.mems = mems;
            self.mark_pending(PendingKind::Cpuset, id);
        }
    }

    /// Sets cgroup CPU/memory parameters, marking the cgroup delta pending.
    /// Blockio and rdt fields mark their own kinds.
    pub fn set_cgroup(&mut self, id: &str, params: CgroupParams) {
        if let Some(c) = self.containers.get_mut(id) {
            let blockio_changed = params.blockio_weight != c.assignment.cgroup.blockio_weight;
            let rdt_changed = params.rdt_class != c.assignment.cgroup.rdt_class;
            c.assignment.cgroup = params;
            self.mark_pending(PendingKind::Cgroup, id);
            if blockio_changed {
                self.mark_pending(PendingKind::Blockio, id);
            }
            if rdt_changed {
                self.mark_pending(PendingKind::Rdt, id);
            }
        }
    }

    /// Sets scheduling parameters, marking the sched delta pending.
    pub fn set_sched(&mut self, id: &str, sched: Option<SchedParams>) {
        if let Some(c) = self.containers.get_mut(id) {
            c.assignment.sched = sched;
            self.mark_pending(PendingKind::Sched, id);
        }
    }

    /// Sets an exported environment entry on the assignment.
    pub fn set_env(&mut self, id: &str, name: &str, value: &str) {
        if let Some(c) = self.containers.get_mut(id) {
            c.assignment.env.insert(name.to_string(), value.to_string());
        }
    }

    /// Clears the whole assignment, marking the cpuset delta pending so the
    /// runtime resets the container to its defaults.
    pub fn clear_assignment(&mut self, id: &str) {
        if let Some(c) = self.containers.get_mut(id) {
            c.assignment = Assignment::default();
            self.mark_pending(PendingKind::Cpuset, id);
        }
    }

    /// Marks or releases the controller-failure quarantine.
    pub fn set_failed(&mut self, id: &str, failed: bool) {
        if let Some(c) = self.containers.get_mut(id) {
            c.failed = failed;
        }
    }

    fn mark_pending(&mut self, kind: PendingKind, id: &str) {
        self.pending.entry(kind).or_default().insert(id.to_string());
    }

    /// Container ids with a pending delta of the given kind.
    pub fn pending_containers(&self, kind: PendingKind) -> Vec<String> {
        self.pending
            .get(&kind)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drops all pending markers of the given kind.
    pub fn clear_pending(&mut self, kind: PendingKind) {
        self.pending.remove(&kind);
    }

    /// Records a per-CPU kernel knob change.
    pub fn push_cpu_knob<F>(&mut self, cpu: u32, f: F)
    where
        F: FnOnce(&mut CpuKnobDelta),
    {
        f(self.pending_knobs.entry(cpu).or_default());
    }

    /// Takes all pending per-CPU knob changes, leaving none behind.
    pub fn take_cpu_knobs(&mut self) -> BTreeMap<u32, CpuKnobDelta> {
        std::mem::take(&mut self.pending_knobs)
    }

    /// Opaque state the active policy persists alongside the entities.
    pub fn set_policy_state(&mut self, state: serde_json::Value) {
        self.policy_state = Some(state);
    }

    /// The persisted policy state, if any.
    pub fn policy_state(&self) -> Option<&serde_json::Value> {
        self.policy_state.as_ref()
    }

    /// Takes a rollback checkpoint of the whole entity state.
    pub fn checkpoint(&self) -> CacheCheckpoint {
        CacheCheckpoint {
            containers: self.containers.clone(),
            pods: self.pods.clone(),
            policy_state: self.policy_state.clone(),
        }
    }

    /// Restores entity state from a checkpoint and drops pending deltas
    /// accumulated since.
    pub fn restore(&mut self, checkpoint: CacheCheckpoint) {
        self.containers = checkpoint.containers;
        self.pods = checkpoint.pods;
        self.policy_state = checkpoint.policy_state;
        self.pending.clear();
        self.pending_knobs.clear();
    }

    /// Serializes the cache into a versioned JSON blob. Pending deltas are
    /// transient and not part of the blob.
    pub fn to_json(&self) -> Result<String, CacheError> {
        let blob = CacheBlob {
            schema_version: CACHE_SCHEMA_VERSION,
            pods: self.pods.values().cloned().collect(),
            containers: self.containers.values().cloned().collect(),
            policy_state: self.policy_state.clone(),
        };
        Ok(serde_json::to_string_pretty(&blob)?)
    }

    /// Restores a cache from a JSON blob. Schema mismatch is an error the
    /// caller handles by rebuilding from the runtime's view.
    pub fn from_json(json: &str) -> Result<Self, CacheError> {
        let probe: serde_json::Value = serde_json::from_str(json)?;
        let found = probe
            .get("schema_version")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32;
        if found != CACHE_SCHEMA_VERSION {
            return Err(CacheError::SchemaVersion {
                found,
                expected: CACHE_SCHEMA_VERSION,
            });
        }
        let blob: CacheBlob = serde_json::from_str(json)?;
        let mut cache = Cache::new();
        for pod in blob.pods {
            cache.pods.insert(pod.uid.clone(), pod);
        }
        for container in blob.containers {
            cache.containers.insert(container.id.clone(), container);
        }
        cache.policy_state = blob.policy_state;
        Ok(cache)
    }

    /// Writes the blob to disk.
    pub fn save(&self, path: &Path) -> Result<(), CacheError> {
        let json = self.to_json()?;
        std::fs::write(path, json).map_err(|source| CacheError::Io {
            path: path.to_string_lossy().into_owned(),
            source,
        })
    }

    /// Loads a blob from disk.
    pub fn load(path: &Path) -> Result<Self, CacheError> {
        let json = std::fs::read_to_string(path).map_err(|source| CacheError::Io {
            path: path.to_string_lossy().into_owned(),
            source,
        })?;
        Self::from_json(&json)
    }
}
