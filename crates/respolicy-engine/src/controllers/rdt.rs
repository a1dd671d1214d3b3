//! RDT controller: resctrl class adjustments.

use std::path::PathBuf;

use log::warn;

use crate::controllers::Controller;
use crate::core::cache::PendingKind;
use crate::core::common::Adjustment;
use crate::core::container::Container;
use crate::core::errors::ControllerError;

/// Translates resctrl class deltas into runtime adjustments.
pub struct RdtController {
    sysfs: Option<PathBuf>,
}

impl RdtController {
    /// Creates the controller; the sysfs mount is used to sanity-check that
    /// a referenced resctrl group exists.
    pub fn new(sysfs: Option<PathBuf>) -> Self {
        Self { sysfs }
    }
}

impl Controller for RdtController {
    fn name(&self) -> &'static str {
        "rdt"
    }

    fn kind(&self) -> PendingKind {
        PendingKind::Rdt
    }

    fn adjust(&mut self, container: &Container) -> Result<Option<Adjustment>, ControllerError> {
        let class = match &container.assignment.cgroup.rdt_class {
            Some(class) => class.clone(),
            None => return Ok(None),
        };
        if let Some(sysfs) = &self.sysfs {
            let group = sysfs.join("fs/resctrl").join(&class);
            if !group.is_dir() {
                warn!(target: "rdt", "resctrl group {:?} does not exist for {}", class, container.id);
            }
        }
        Ok(Some(Adjustment {
            container_id: container.id.clone(),
            rdt_class: Some(class),
            ..Adjustment::default()
        }))
    }
}
