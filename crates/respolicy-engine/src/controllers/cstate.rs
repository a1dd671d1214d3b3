//! C-state controller.
//!
//! Enables or disables idle states per CPU by writing the cpuidle
//! `disable` flags. When `RESPOLICY_CSTATE_OVERRIDE_DIR` names a
//! directory, writes land there instead of the real sysfs tree; when it is
//! unset and the real path is absent, the change is logged at debug level
//! and dropped, never persisted elsewhere.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::PathBuf;

use log::{debug, error};

use crate::core::cache::CpuKnobDelta;
use crate::core::errors::ControllerError;

/// Environment variable pointing the controller at an override directory.
pub const CSTATE_OVERRIDE_ENV: &str = "RESPOLICY_CSTATE_OVERRIDE_DIR";

/// Writes cpuidle state enablement flags.
pub struct CstateController {
    sysfs: PathBuf,
    override_dir: Option<PathBuf>,
}

impl CstateController {
    /// Creates the controller, honoring the override environment variable.
    pub fn new(sysfs: PathBuf) -> Self {
        let override_dir = std::env::var_os(CSTATE_OVERRIDE_ENV).map(PathBuf::from);
        Self { sysfs, override_dir }
    }

    /// Creates the controller with an explicit override directory.
    pub fn with_override(sysfs: PathBuf, override_dir: PathBuf) -> Self {
        Self {
            sysfs,
            override_dir: Some(override_dir),
        }
    }

    /// Applies all pending c-state knobs.
    pub fn apply(&mut self, knobs: &BTreeMap<u32, CpuKnobDelta>) {
        for (&cpu, delta) in knobs {
            for (state, enabled) in &delta.cstates {
                self.write_state(cpu, state, *enabled);
            }
        }
    }

    // The disable flag is the inverse of enablement: "0" enables the
    // state, "1" disables it.
    fn write_state(&self, cpu: u32, state: &str, enabled: bool) {
        let value = if enabled { "0" } else { "1" };
        if let Some(dir) = &self.override_dir {
            let path = dir.join(format!("cpu{}", cpu)).join(state).join("disable");
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            if let Err(source) = std::fs::write(&path, value) {
                error!(
                    target: "cstate",
                    "{}",
                    ControllerError::Write {
                        path: path.to_string_lossy().into_owned(),
                        source,
                    }
                );
            }
            return;
        }

        let cpuidle = self.sysfs.join(format!("devices/system/cpu/cpu{}/cpuidle", cpu));
        let entries = match std::fs::read_dir(&cpuidle) {
            Ok(entries) => entries,
            Err(_) => {
                debug!(target: "cstate", "no cpuidle for cpu{}, {} {} dropped", cpu, state, value);
                return;
            }
        };
        for entry in entries.flatten() {
            let name_path = entry.path().join("name");
            let matches = std::fs::read_to_string(&name_path)
                .map(|n| n.trim() == state)
                .unwrap_or(false);
            if !matches {
                continue;
            }
            let path = entry.path().join("disable");
            match std::fs::write(&path, value) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!(target: "cstate", "no disable flag at {:?}", path);
                }
                Err(source) => {
                    error!(
                        target: "cstate",
                        "{}",
                        ControllerError::Write {
                            path: path.to_string_lossy().into_owned(),
                            source,
                        }
                    );
                }
            }
            return;
        }
        debug!(target: "cstate", "cpu{} has no idle state {:?}", cpu, state);
    }
}
