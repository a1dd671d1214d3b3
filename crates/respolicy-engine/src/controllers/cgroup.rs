//! Cgroup controller: cpu.weight, cpu.max and memory limit adjustments.

use crate::controllers::Controller;
use crate::core::cache::PendingKind;
use crate::core::common::Adjustment;
use crate::core::container::Container;
use crate::core::errors::ControllerError;

/// Translates cgroup parameter deltas into runtime adjustments.
#[derive(Default)]
pub struct CgroupController {}

impl CgroupController {
    /// Creates the controller.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Controller for CgroupController {
    fn name(&self) -> &'static str {
        "cgroup"
    }

    fn kind(&self) -> PendingKind {
        PendingKind::Cgroup
    }

    fn adjust(&mut self, container: &Container) -> Result<Option<Adjustment>, ControllerError> {
        let params = &container.assignment.cgroup;
        if params.cpu_weight.is_none()
            && params.cpu_quota_usec.is_none()
            && params.memory_max.is_none()
            && params.memory_swap_max.is_none()
        {
            return Ok(None);
        }
        Ok(Some(Adjustment {
            container_id: container.id.clone(),
            cpu_weight: params.cpu_weight,
            cpu_quota_usec: params.cpu_quota_usec,
            cpu_period_usec: params.cpu_period_usec,
            memory_max: params.memory_max,
            memory_swap_max: params.memory_swap_max,
            ..Adjustment::default()
        }))
    }
}
