//! Scheduling controller: policy/priority/nice/ioprio adjustments.

use crate::controllers::Controller;
use crate::core::cache::PendingKind;
use crate::core::common::Adjustment;
use crate::core::container::Container;
use crate::core::errors::ControllerError;

/// Translates scheduling-class deltas into runtime adjustments.
#[derive(Default)]
pub struct SchedController {}

impl SchedController {
    /// Creates the controller.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Controller for SchedController {
    fn name(&self) -> &'static str {
        "sched"
    }

    fn kind(&self) -> PendingKind {
        PendingKind::Sched
    }

    fn adjust(&mut self, container: &Container) -> Result<Option<Adjustment>, ControllerError> {
        match &container.assignment.sched {
            Some(params) => Ok(Some(Adjustment {
                container_id: container.id.clone(),
                sched: Some(params.clone()),
                ..Adjustment::default()
            })),
            None => Ok(None),
        }
    }
}
