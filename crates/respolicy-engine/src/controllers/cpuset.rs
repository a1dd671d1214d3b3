//! Cpuset controller: cpuset.cpus / cpuset.mems adjustments.

use std::path::PathBuf;

use log::debug;

use crate::controllers::Controller;
use crate::core::cache::PendingKind;
use crate::core::common::{Adjustment, EnvVar};
use crate::core::container::Container;
use crate::core::errors::ControllerError;

/// Translates cpuset deltas into runtime adjustments.
///
/// When a cgroupfs root is known, the controller also reads the currently
/// effective cpuset for drift detection; writes always go through the
/// runtime, never past it.
pub struct CpusetController {
    cgroupfs: Option<PathBuf>,
}

impl CpusetController {
    /// Creates the controller; pass the cgroup v2 mount for drift checks.
    pub fn new(cgroupfs: Option<PathBuf>) -> Self {
        Self { cgroupfs }
    }

    fn check_drift(&self, container: &Container, wanted: &str) {
        let root = match &self.cgroupfs {
            Some(root) => root,
            None => return,
        };
        let path = root.join(&container.id).join("cpuset.cpus.effective");
        if let Ok(current) = std::fs::read_to_string(&path) {
            let current = current.trim();
            if !wanted.is_empty() && current != wanted {
                debug!(
                    target: "cpuset",
                    "{}: effective cpuset {:?} drifted from wanted {:?}",
                    container.id, current, wanted
                );
            }
        }
    }
}

impl Controller for CpusetController {
    fn name(&self) -> &'static str {
        "cpuset"
    }

    fn kind(&self) -> PendingKind {
        PendingKind::Cpuset
    }

    fn adjust(&mut self, container: &Container) -> Result<Option<Adjustment>, ControllerError> {
        let cpus = container.assignment.cpuset().to_string();
        let mems = container.assignment.mems.to_string();
        self.check_drift(container, &cpus);
        let env = container
            .assignment
            .env
            .iter()
            .map(|(name, value)| EnvVar {
                name: name.clone(),
                value: value.clone(),
            })
            .collect();
        Ok(Some(Adjustment {
            container_id: container.id.clone(),
            cpuset_cpus: Some(cpus),
            cpuset_mems: Some(mems),
            env,
            ..Adjustment::default()
        }))
    }
}
