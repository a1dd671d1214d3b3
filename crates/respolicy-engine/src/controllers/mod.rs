//! Controllers translating cache deltas into kernel-facing changes.
//!
//! Controllers drain the cache's pending sets at the end of a pipeline
//! step and never outside one. Container-scoped deltas become runtime
//! adjustments; per-CPU knob deltas (cpufreq, uncore, c-states) are written
//! to sysfs directly. Writes are never batched across containers, and each
//! controller runs under a per-step wall-clock budget: an over-budget or
//! failing container is quarantined and skipped, never stalling the
//! pipeline.

pub mod blockio;
pub mod cgroup;
pub mod cpufreq;
pub mod cpuset;
pub mod cstate;
pub mod rdt;
pub mod sched;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use log::error;

use crate::core::cache::{Cache, PendingKind};
use crate::core::common::Adjustment;
use crate::core::container::Container;
use crate::core::errors::ControllerError;

/// Per-step wall-clock budget for one controller's I/O.
pub const CONTROLLER_BUDGET_MS: u64 = 500;

/// Locations of the kernel filesystems, shifted under `--host-root`.
#[derive(Clone, Debug)]
pub struct HostPaths {
    /// The sysfs mount.
    pub sysfs: PathBuf,
    /// The cgroup v2 mount.
    pub cgroupfs: PathBuf,
    /// Explicit c-state override directory; when `None` the controller
    /// falls back to its environment variable.
    pub cstate_override: Option<PathBuf>,
}

impl HostPaths {
    /// Paths under the given host root (`/` on a bare host).
    pub fn new(host_root: &Path) -> Self {
        Self {
            sysfs: host_root.join("sys"),
            cgroupfs: host_root.join("sys/fs/cgroup"),
            cstate_override: None,
        }
    }

    /// Redirects c-state writes into the given directory.
    pub fn with_cstate_override(mut self, dir: PathBuf) -> Self {
        self.cstate_override = Some(dir);
        self
    }
}

/// A controller drains one pending-delta kind into runtime adjustments.
pub trait Controller {
    /// Controller name, for logs and errors.
    fn name(&self) -> &'static str;

    /// The pending kind this controller drains.
    fn kind(&self) -> PendingKind;

    /// Builds the adjustment for one container's pending delta.
    fn adjust(&mut self, container: &Container) -> Result<Option<Adjustment>, ControllerError>;
}

fn merge(into: &mut Adjustment, from: Adjustment) {
    into.cpuset_cpus = from.cpuset_cpus.or(into.cpuset_cpus.take());
    into.cpuset_mems = from.cpuset_mems.or(into.cpuset_mems.take());
    into.cpu_weight = from.cpu_weight.or(into.cpu_weight.take());
    into.cpu_quota_usec = from.cpu_quota_usec.or(into.cpu_quota_usec.take());
    into.cpu_period_usec = from.cpu_period_usec.or(into.cpu_period_usec.take());
    into.memory_max = from.memory_max.or(into.memory_max.take());
    into.memory_swap_max = from.memory_swap_max.or(into.memory_swap_max.take());
    into.blockio_weight = from.blockio_weight.or(into.blockio_weight.take());
    into.rdt_class = from.rdt_class.or(into.rdt_class.take());
    into.sched = from.sched.or(into.sched.take());
    if !from.env.is_empty() {
        into.env = from.env;
    }
}

/// Drains every pending container delta through the controllers.
///
/// Returns one merged adjustment per touched container. A container whose
/// delta fails, or that is reached after the controller's budget ran out,
/// is marked failed in the cache and skipped.
pub fn drain(controllers: &mut [Box<dyn Controller>], cache: &mut Cache) -> Vec<Adjustment> {
    let mut out: BTreeMap<String, Adjustment> = BTreeMap::new();
    for controller in controllers.iter_mut() {
        let kind = controller.kind();
        let started = Instant::now();
        for id in cache.pending_containers(kind) {
            let spent_ms = started.elapsed().as_millis() as u64;
            if spent_ms > CONTROLLER_BUDGET_MS {
                error!(
                    target: "controllers",
                    "{}",
                    ControllerError::BudgetExceeded {
                        name: controller.name().to_string(),
                        spent_ms,
                        budget_ms: CONTROLLER_BUDGET_MS,
                    }
                );
                cache.set_failed(&id, true);
                continue;
            }
            let container = match cache.lookup_container(&id) {
                Some(c) => c.clone(),
                None => continue,
            };
            match controller.adjust(&container) {
                Ok(Some(adjustment)) => {
                    let entry = out.entry(id.clone()).or_insert_with(|| Adjustment {
                        container_id: id.clone(),
                        ..Adjustment::default()
                    });
                    merge(entry, adjustment);
                }
                Ok(None) => {}
                Err(e) => {
                    error!(target: "controllers", "{}: {} failed for {}: {}", controller.name(), kind_name(kind), id, e);
                    cache.set_failed(&id, true);
                }
            }
        }
        cache.clear_pending(kind);
    }
    out.into_values().collect()
}

fn kind_name(kind: PendingKind) -> &'static str {
    match kind {
        PendingKind::Cpuset => "cpuset delta",
        PendingKind::Cgroup => "cgroup delta",
        PendingKind::Sched => "sched delta",
        PendingKind::Blockio => "blockio delta",
        PendingKind::Rdt => "rdt delta",
    }
}
