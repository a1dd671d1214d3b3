//! Block I/O controller: io.weight adjustments.

use crate::controllers::Controller;
use crate::core::cache::PendingKind;
use crate::core::common::Adjustment;
use crate::core::container::Container;
use crate::core::errors::ControllerError;

/// Translates io.weight deltas into runtime adjustments.
#[derive(Default)]
pub struct BlockioController {}

impl BlockioController {
    /// Creates the controller.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Controller for BlockioController {
    fn name(&self) -> &'static str {
        "blockio"
    }

    fn kind(&self) -> PendingKind {
        PendingKind::Blockio
    }

    fn adjust(&mut self, container: &Container) -> Result<Option<Adjustment>, ControllerError> {
        match container.assignment.cgroup.blockio_weight {
            Some(weight) => Ok(Some(Adjustment {
                container_id: container.id.clone(),
                blockio_weight: Some(weight),
                ..Adjustment::default()
            })),
            None => Ok(None),
        }
    }
}
