//! CPU and uncore frequency controller.
//!
//! Applies per-CPU knob deltas straight to sysfs. A knob value of 0 resets
//! the scaling limit to the hardware default. Absent sysfs files (no
//! cpufreq driver, no uncore interface) are logged and skipped; actual
//! write failures surface as controller errors.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::PathBuf;

use log::{debug, error};

use respolicy_topology::System;

use crate::core::cache::CpuKnobDelta;
use crate::core::errors::ControllerError;

/// Writes cpufreq and uncore frequency limits under the sysfs mount.
pub struct CpufreqController {
    sysfs: PathBuf,
}

impl CpufreqController {
    /// Creates the controller over the given sysfs mount.
    pub fn new(sysfs: PathBuf) -> Self {
        Self { sysfs }
    }

    /// Applies all pending frequency knobs. Errors are surfaced per write
    /// and do not stop the remaining writes.
    pub fn apply(&mut self, system: &System, knobs: &BTreeMap<u32, CpuKnobDelta>) {
        for (&cpu, delta) in knobs {
            if let Some(min) = delta.freq_min_khz {
                self.write_cpu_freq(cpu, "scaling_min_freq", "cpuinfo_min_freq", min);
            }
            if let Some(max) = delta.freq_max_khz {
                self.write_cpu_freq(cpu, "scaling_max_freq", "cpuinfo_max_freq", max);
            }
            if delta.uncore_min_khz.is_some() || delta.uncore_max_khz.is_some() {
                self.write_uncore(system, cpu, delta);
            }
        }
    }

    fn write_cpu_freq(&self, cpu: u32, file: &str, default_file: &str, khz: u64) {
        let dir = self.sysfs.join(format!("devices/system/cpu/cpu{}/cpufreq", cpu));
        let value = if khz > 0 {
            khz.to_string()
        } else {
            // Reset to the hardware limit.
            match std::fs::read_to_string(dir.join(default_file)) {
                Ok(content) => content.trim().to_string(),
                Err(_) => return,
            }
        };
        self.write(dir.join(file), &value);
    }

    fn write_uncore(&self, system: &System, cpu: u32, delta: &CpuKnobDelta) {
        let (package, die) = match system.cpu(cpu) {
            Some(info) => (info.package_id, info.die_id),
            None => return,
        };
        let dir = self.sysfs.join(format!(
            "devices/system/cpu/intel_uncore_frequency/package_{:02}_die_{:02}",
            package, die
        ));
        if let Some(min) = delta.uncore_min_khz {
            let value = if min > 0 {
                min.to_string()
            } else {
                match std::fs::read_to_string(dir.join("initial_min_freq_khz")) {
                    Ok(content) => content.trim().to_string(),
                    Err(_) => return,
                }
            };
            self.write(dir.join("min_freq_khz"), &value);
        }
        if let Some(max) = delta.uncore_max_khz {
            let value = if max > 0 {
                max.to_string()
            } else {
                match std::fs::read_to_string(dir.join("initial_max_freq_khz")) {
                    Ok(content) => content.trim().to_string(),
                    Err(_) => return,
                }
            };
            self.write(dir.join("max_freq_khz"), &value);
        }
    }

    fn write(&self, path: PathBuf, value: &str) {
        match std::fs::write(&path, value) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(target: "cpufreq", "no such knob {:?}, skipped", path);
            }
            Err(source) => {
                error!(
                    target: "cpufreq",
                    "{}",
                    ControllerError::Write {
                        path: path.to_string_lossy().into_owned(),
                        source,
                    }
                );
            }
        }
    }
}
