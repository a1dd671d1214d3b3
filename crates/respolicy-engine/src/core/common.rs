//! Common data structures.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use respolicy_topology::CpuSet;

/// Pod quality-of-service class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QosClass {
    /// All containers have equal requests and limits.
    Guaranteed,
    /// At least one container has a request below its limit.
    Burstable,
    /// No requests at all.
    BestEffort,
}

/// Requested resources of a container.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// CPU request in milli-units (1000 = one full CPU).
    pub cpu_milli: u64,
    /// CPU limit in milli-units, when set.
    pub cpu_limit_milli: Option<u64>,
    /// Memory request in bytes.
    pub memory_bytes: u64,
    /// Memory limit in bytes, when set.
    pub memory_limit_bytes: Option<u64>,
    /// Huge page counts keyed by page size in kB.
    pub hugepages: BTreeMap<u64, u64>,
}

impl ResourceRequest {
    /// Number of whole CPUs when the request is an exact multiple of 1000m.
    pub fn full_cpus(&self) -> Option<usize> {
        if self.cpu_milli > 0 && self.cpu_milli % 1000 == 0 {
            Some((self.cpu_milli / 1000) as usize)
        } else {
            None
        }
    }
}

/// Linux scheduling policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SchedPolicy {
    /// SCHED_OTHER, the default.
    Other,
    /// SCHED_FIFO real-time policy.
    Fifo,
    /// SCHED_RR real-time policy.
    Rr,
    /// SCHED_BATCH.
    Batch,
    /// SCHED_IDLE.
    Idle,
}

impl SchedPolicy {
    /// The numeric policy value as reported by `/proc/<pid>/sched`.
    pub fn number(&self) -> u32 {
        match self {
            SchedPolicy::Other => 0,
            SchedPolicy::Fifo => 1,
            SchedPolicy::Rr => 2,
            SchedPolicy::Batch => 3,
            SchedPolicy::Idle => 5,
        }
    }
}

impl Default for SchedPolicy {
    fn default() -> Self {
        SchedPolicy::Other
    }
}

/// Linux scheduling parameters attached to a container.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedParams {
    /// Scheduling policy.
    pub policy: SchedPolicy,
    /// Real-time priority; meaningful for FIFO and RR only.
    pub priority: u32,
    /// Nice value; meaningful for OTHER and BATCH.
    pub nice: i32,
    /// I/O priority 0-7 within the best-effort class, when set.
    pub ioprio: Option<u8>,
}

/// Cgroup parameters pending for a container.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CgroupParams {
    /// cpu.weight (cgroup v2), 1-10000.
    pub cpu_weight: Option<u64>,
    /// cpu.max quota in microseconds per period.
    pub cpu_quota_usec: Option<u64>,
    /// cpu.max period in microseconds.
    pub cpu_period_usec: Option<u64>,
    /// memory.max in bytes.
    pub memory_max: Option<u64>,
    /// memory.swap.max in bytes.
    pub memory_swap_max: Option<u64>,
    /// io.weight, 1-10000.
    pub blockio_weight: Option<u64>,
    /// resctrl class the container's tasks belong to.
    pub rdt_class: Option<String>,
}

/// The resource slice currently assigned to a container.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    /// CPUs owned exclusively; disjoint from every other container's set.
    pub exclusive_cpus: CpuSet,
    /// CPUs shared with other containers of the same pool or balloon.
    pub shared_cpus: CpuSet,
    /// Allowed memory nodes.
    pub mems: CpuSet,
    /// Pending cgroup parameters.
    pub cgroup: CgroupParams,
    /// Scheduling parameters, when a scheduling class applies.
    pub sched: Option<SchedParams>,
    /// Environment entries exported to the container.
    pub env: BTreeMap<String, String>,
}

impl Assignment {
    /// The effective cpuset: exclusive and shared CPUs combined.
    pub fn cpuset(&self) -> CpuSet {
        self.exclusive_cpus.union(&self.shared_cpus)
    }

    /// True when nothing has been assigned.
    pub fn is_empty(&self) -> bool {
        self.exclusive_cpus.is_empty() && self.shared_cpus.is_empty() && self.mems.is_empty()
    }
}

/// An environment entry carried by an adjustment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnvVar {
    /// Variable name.
    pub name: String,
    /// Variable value.
    pub value: String,
}

/// The structured diff returned to the runtime for one container.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Adjustment {
    /// Container the adjustment applies to.
    pub container_id: String,
    /// cpuset.cpus in kernel list syntax.
    pub cpuset_cpus: Option<String>,
    /// cpuset.mems in kernel list syntax.
    pub cpuset_mems: Option<String>,
    /// cpu.weight.
    pub cpu_weight: Option<u64>,
    /// cpu.max quota in microseconds.
    pub cpu_quota_usec: Option<u64>,
    /// cpu.max period in microseconds.
    pub cpu_period_usec: Option<u64>,
    /// memory.max in bytes.
    pub memory_max: Option<u64>,
    /// memory.swap.max in bytes.
    pub memory_swap_max: Option<u64>,
    /// io.weight.
    pub blockio_weight: Option<u64>,
    /// resctrl class.
    pub rdt_class: Option<String>,
    /// Linux scheduling parameters.
    pub sched: Option<SchedParams>,
    /// Environment entries.
    pub env: Vec<EnvVar>,
}

/// cpu.weight derived from a milli-CPU request the way the runtime does it,
/// clamped to the cgroup v2 range.
pub fn cpu_weight_from_milli(milli: u64) -> u64 {
    (milli / 10).clamp(1, 10000)
}

/// cpu.max quota for a milli-CPU limit at the default 100ms period.
pub const CPU_PERIOD_USEC: u64 = 100_000;

/// Quota in microseconds for a milli-CPU limit.
pub fn cpu_quota_from_milli(limit_milli: u64) -> u64 {
    limit_milli * CPU_PERIOD_USEC / 1000
}
