//! Daemon configuration files.
//!
//! Configuration is read from YAML with every field optional in the raw
//! form; the resolved form fills in defaults and validates cross-field
//! constraints. Files in a config directory are merged in lexical filename
//! order, later files overriding earlier ones field by field.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use respolicy_topology::{CpuSet, TopoLevel};

use crate::core::common::{QosClass, SchedParams, SchedPolicy};
use crate::core::errors::ConfigError;

/// CPU priority preference for exclusive allocations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CpuPriority {
    /// Prefer performance cores.
    High,
    /// No core-kind preference beyond topology.
    Normal,
    /// Prefer efficient cores.
    Low,
    /// Ignore core kinds entirely.
    None,
}

/// How a balloon class asks the allocator to choose CPUs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocatorMode {
    /// Fill small free pools first, keep large ones intact.
    Pack,
    /// Spread over the largest free pools.
    Balance,
}

/// A frequency range in kHz.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreqRange {
    /// Minimum frequency in kHz; 0 leaves the hardware default.
    #[serde(default)]
    pub min: u64,
    /// Maximum frequency in kHz; 0 leaves the hardware default.
    #[serde(default)]
    pub max: u64,
}

/// CPU set and memory node constraints.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// CPU ids; empty means the whole machine.
    pub cpu: CpuSet,
    /// Memory node ids; empty means all nodes.
    pub memory: CpuSet,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
struct ResourceSpecRaw {
    cpu: Option<String>,
    memory: Option<String>,
}

/// A named set of linux scheduling parameters containers can be mapped to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SchedulingClass {
    /// Class name referenced from policy config and annotations.
    pub name: String,
    /// Scheduling policy.
    #[serde(default)]
    pub policy: SchedPolicy,
    /// Real-time priority.
    #[serde(default)]
    pub priority: u32,
    /// Nice value.
    #[serde(default)]
    pub nice: i32,
    /// I/O priority, when set.
    #[serde(default)]
    pub ioprio: Option<u8>,
}

impl SchedulingClass {
    /// The scheduling parameters this class stands for.
    pub fn params(&self) -> SchedParams {
        SchedParams {
            policy: self.policy,
            priority: self.priority,
            nice: self.nice,
            ioprio: self.ioprio,
        }
    }
}

/// Topology-aware policy options.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TopologyAwareConfig {
    /// Pin containers to their pool's CPUs.
    pub pin_cpu: bool,
    /// Pin containers to their pool's memory nodes.
    pub pin_memory: bool,
    /// Serve whole-CPU Guaranteed requests from kernel-isolated CPUs.
    pub prefer_isolated_cpus: bool,
    /// Never hand out exclusive CPUs unless explicitly requested.
    pub prefer_shared_cpus: bool,
    /// Score pools hosting the same pod higher.
    pub colocate_pods: bool,
    /// Score pools hosting the same namespace higher.
    pub colocate_namespaces: bool,
    /// Default core-kind preference.
    pub default_cpu_priority: CpuPriority,
    /// Namespace to scheduling class mapping.
    pub namespace_scheduling_classes: BTreeMap<String, String>,
    /// Pod QoS to scheduling class mapping.
    pub pod_qos_scheduling_classes: BTreeMap<QosClass, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TopologyAwareRaw {
    #[serde(rename = "pinCPU")]
    pin_cpu: Option<bool>,
    pin_memory: Option<bool>,
    #[serde(rename = "preferIsolatedCPUs")]
    prefer_isolated_cpus: Option<bool>,
    #[serde(rename = "preferSharedCPUs")]
    prefer_shared_cpus: Option<bool>,
    colocate_pods: Option<bool>,
    colocate_namespaces: Option<bool>,
    #[serde(rename = "defaultCPUPriority")]
    default_cpu_priority: Option<CpuPriority>,
    namespace_scheduling_classes: Option<BTreeMap<String, String>>,
    #[serde(rename = "podQoSSchedulingClasses")]
    pod_qos_scheduling_classes: Option<BTreeMap<QosClass, String>>,
}

/// One balloon class definition.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BalloonClassConfig {
    /// Class name.
    pub name: String,
    /// Smallest CPU count an instance may shrink to.
    pub min_cpus: usize,
    /// Largest CPU count an instance may grow to; 0 means unbounded.
    pub max_cpus: usize,
    /// Instances kept alive even when empty.
    pub min_balloons: u32,
    /// Instance cap; 0 means unbounded.
    pub max_balloons: u32,
    /// Topology level instances bind to.
    pub topology_level: TopoLevel,
    /// Pack or balance CPU selection.
    pub allocator: AllocatorMode,
    /// Namespaces assigned to this class by default.
    pub namespaces: Vec<String>,
    /// Pod QoS classes assigned to this class by default.
    pub pod_qos: Vec<QosClass>,
    /// CPU frequency range applied to member CPUs.
    pub cpu_freq: Option<FreqRange>,
    /// Uncore frequency range applied to member packages.
    pub uncore_freq: Option<FreqRange>,
    /// Per-c-state enablement applied to member CPUs.
    pub c_states: BTreeMap<String, bool>,
    /// Scheduling class applied to member containers.
    pub scheduling: Option<String>,
    /// Component class names for composite classes.
    pub components: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BalloonClassRaw {
    name: String,
    #[serde(rename = "minCPUs")]
    min_cpus: Option<usize>,
    #[serde(rename = "maxCPUs")]
    max_cpus: Option<usize>,
    min_balloons: Option<u32>,
    max_balloons: Option<u32>,
    topology_level: Option<TopoLevel>,
    allocator: Option<AllocatorMode>,
    namespaces: Option<Vec<String>>,
    #[serde(rename = "podQoS")]
    pod_qos: Option<Vec<QosClass>>,
    cpu_freq: Option<FreqRange>,
    uncore_freq: Option<FreqRange>,
    #[serde(rename = "cStates")]
    c_states: Option<BTreeMap<String, bool>>,
    scheduling: Option<String>,
    components: Option<Vec<String>>,
}

/// Balloons policy options.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct BalloonsConfig {
    /// Class definitions in declaration order.
    pub balloon_types: Vec<BalloonClassConfig>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BalloonsRaw {
    balloon_types: Option<Vec<BalloonClassRaw>>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DaemonConfigRaw {
    policy: Option<String>,
    available_resources: Option<ResourceSpecRaw>,
    reserved_resources: Option<ResourceSpecRaw>,
    reserved_pool_namespaces: Option<Vec<String>>,
    log_level: Option<String>,
    scheduling_classes: Option<Vec<SchedulingClass>>,
    topology_aware: Option<TopologyAwareRaw>,
    balloons: Option<BalloonsRaw>,
}

impl DaemonConfigRaw {
    // Later files override earlier ones, field by field.
    fn merge(self, over: DaemonConfigRaw) -> DaemonConfigRaw {
        DaemonConfigRaw {
            policy: over.policy.or(self.policy),
            available_resources: over.available_resources.or(self.available_resources),
            reserved_resources: over.reserved_resources.or(self.reserved_resources),
            reserved_pool_namespaces: over.reserved_pool_namespaces.or(self.reserved_pool_namespaces),
            log_level: over.log_level.or(self.log_level),
            scheduling_classes: over.scheduling_classes.or(self.scheduling_classes),
            topology_aware: over.topology_aware.or(self.topology_aware),
            balloons: over.balloons.or(self.balloons),
        }
    }
}

/// Fully resolved daemon configuration.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DaemonConfig {
    /// Active policy name.
    pub policy: String,
    /// Resources the policy may hand out; empty sets mean "everything".
    pub available: ResourceSpec,
    /// Slice of available resources set aside for reserved namespaces.
    pub reserved: ResourceSpec,
    /// Namespaces drawing from the reserved slice.
    pub reserved_pool_namespaces: Vec<String>,
    /// Log verbosity override, if any.
    pub log_level: Option<String>,
    /// Scheduling class definitions shared by all policies.
    pub scheduling_classes: Vec<SchedulingClass>,
    /// Topology-aware policy options.
    pub topology_aware: TopologyAwareConfig,
    /// Balloons policy options.
    pub balloons: BalloonsConfig,
}

impl DaemonConfig {
    /// The built-in defaults: topology-aware policy over the whole machine.
    pub fn default_config() -> Self {
        Self::resolve(DaemonConfigRaw::default()).unwrap()
    }

    /// Parses a single YAML document.
    pub fn from_yaml(yaml: &str, origin: &str) -> Result<Self, ConfigError> {
        let raw: DaemonConfigRaw = serde_yaml::from_str(yaml).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })?;
        Self::resolve(raw)
    }

    /// Reads one config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = Self::read_raw(path)?;
        Self::resolve(raw)
    }

    /// Reads and merges all `.yaml`/`.yml` files of a config directory in
    /// lexical filename order.
    pub fn from_dir(dir: &Path) -> Result<Self, ConfigError> {
        let entries = std::fs::read_dir(dir).map_err(|source| ConfigError::Io {
            path: dir.to_string_lossy().into_owned(),
            source,
        })?;
        let mut files: Vec<_> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("yaml") | Some("yml")
                )
            })
            .collect();
        files.sort();
        let mut merged = DaemonConfigRaw::default();
        for file in files {
            merged = merged.merge(Self::read_raw(&file)?);
        }
        Self::resolve(merged)
    }

    fn read_raw(path: &Path) -> Result<DaemonConfigRaw, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string_lossy().into_owned(),
            source,
        })?;
        serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string_lossy().into_owned(),
            source,
        })
    }

    fn resolve(raw: DaemonConfigRaw) -> Result<Self, ConfigError> {
        let available = Self::resolve_resources("availableResources", raw.available_resources)?;
        let reserved = Self::resolve_resources("reservedResources", raw.reserved_resources)?;
        if !available.cpu.is_empty() && !reserved.cpu.is_subset(&available.cpu) {
            return Err(ConfigError::Invalid {
                option: "reservedResources.cpu".to_string(),
                reason: format!("[{}] is not a subset of available [{}]", reserved.cpu, available.cpu),
            });
        }

        let scheduling_classes = raw.scheduling_classes.unwrap_or_default();
        let class_known = |name: &str| scheduling_classes.iter().any(|c| c.name == name);

        let ta = raw.topology_aware.unwrap_or_default();
        let topology_aware = TopologyAwareConfig {
            pin_cpu: ta.pin_cpu.unwrap_or(true),
            pin_memory: ta.pin_memory.unwrap_or(true),
            prefer_isolated_cpus: ta.prefer_isolated_cpus.unwrap_or(true),
            prefer_shared_cpus: ta.prefer_shared_cpus.unwrap_or(false),
            colocate_pods: ta.colocate_pods.unwrap_or(false),
            colocate_namespaces: ta.colocate_namespaces.unwrap_or(false),
            default_cpu_priority: ta.default_cpu_priority.unwrap_or(CpuPriority::Normal),
            namespace_scheduling_classes: ta.namespace_scheduling_classes.unwrap_or_default(),
            pod_qos_scheduling_classes: ta.pod_qos_scheduling_classes.unwrap_or_default(),
        };
        for class in topology_aware
            .namespace_scheduling_classes
            .values()
            .chain(topology_aware.pod_qos_scheduling_classes.values())
        {
            if !class_known(class) {
                return Err(ConfigError::UnknownSchedulingClass(class.clone()));
            }
        }

        let balloons = Self::resolve_balloons(raw.balloons.unwrap_or_default(), &class_known)?;

        Ok(Self {
            policy: raw.policy.unwrap_or_else(|| "topology-aware".to_string()),
            available,
            reserved,
            reserved_pool_namespaces: raw
                .reserved_pool_namespaces
                .unwrap_or_else(|| vec!["kube-system".to_string()]),
            log_level: raw.log_level,
            scheduling_classes,
            topology_aware,
            balloons,
        })
    }

    fn resolve_resources(option: &str, raw: Option<ResourceSpecRaw>) -> Result<ResourceSpec, ConfigError> {
        let raw = raw.unwrap_or_default();
        let parse = |field: &str, value: Option<String>| -> Result<CpuSet, ConfigError> {
            match value {
                Some(s) => CpuSet::parse(&s).map_err(|e| ConfigError::Invalid {
                    option: format!("{}.{}", option, field),
                    reason: e.to_string(),
                }),
                None => Ok(CpuSet::new()),
            }
        };
        Ok(ResourceSpec {
            cpu: parse("cpu", raw.cpu)?,
            memory: parse("memory", raw.memory)?,
        })
    }

    fn resolve_balloons<F>(raw: BalloonsRaw, class_known: &F) -> Result<BalloonsConfig, ConfigError>
    where
        F: Fn(&str) -> bool,
    {
        let mut balloon_types = Vec::new();
        let raw_types = raw.balloon_types.unwrap_or_default();
        let defined: Vec<String> = raw_types.iter().map(|r| r.name.clone()).collect();
        for raw_class in raw_types {
            let class = BalloonClassConfig {
                min_cpus: raw_class.min_cpus.unwrap_or(0),
                max_cpus: raw_class.max_cpus.unwrap_or(0),
                min_balloons: raw_class.min_balloons.unwrap_or(0),
                max_balloons: raw_class.max_balloons.unwrap_or(0),
                topology_level: raw_class.topology_level.unwrap_or(TopoLevel::Numa),
                allocator: raw_class.allocator.unwrap_or(AllocatorMode::Pack),
                namespaces: raw_class.namespaces.unwrap_or_default(),
                pod_qos: raw_class.pod_qos.unwrap_or_default(),
                cpu_freq: raw_class.cpu_freq,
                uncore_freq: raw_class.uncore_freq,
                c_states: raw_class.c_states.unwrap_or_default(),
                scheduling: raw_class.scheduling,
                components: raw_class.components.unwrap_or_default(),
                name: raw_class.name,
            };
            if class.max_cpus > 0 && class.min_cpus > class.max_cpus {
                return Err(ConfigError::BadBalloonClass {
                    name: class.name,
                    reason: format!("minCPUs {} above maxCPUs {}", class.min_cpus, class.max_cpus),
                });
            }
            if class.max_balloons > 0 && class.min_balloons > class.max_balloons {
                return Err(ConfigError::BadBalloonClass {
                    name: class.name,
                    reason: format!(
                        "minBalloons {} above maxBalloons {}",
                        class.min_balloons, class.max_balloons
                    ),
                });
            }
            for component in &class.components {
                if !defined.contains(component) {
                    return Err(ConfigError::BadBalloonClass {
                        name: class.name,
                        reason: format!("unknown component class {:?}", component),
                    });
                }
            }
            if let Some(scheduling) = &class.scheduling {
                if !class_known(scheduling) {
                    return Err(ConfigError::UnknownSchedulingClass(scheduling.clone()));
                }
            }
            balloon_types.push(class);
        }
        Ok(BalloonsConfig { balloon_types })
    }

    /// Scheduling parameters for a named class, if defined.
    pub fn sched_params_for(&self, class_name: &str) -> Option<SchedParams> {
        self.scheduling_classes
            .iter()
            .find(|c| c.name == class_name)
            .map(|c| c.params())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve() {
        let config = DaemonConfig::default_config();
        assert_eq!(config.policy, "topology-aware");
        assert!(config.topology_aware.pin_cpu);
        assert!(config.topology_aware.prefer_isolated_cpus);
        assert!(!config.topology_aware.prefer_shared_cpus);
        assert_eq!(config.reserved_pool_namespaces, vec!["kube-system".to_string()]);
    }

    #[test]
    fn parses_balloon_classes() {
        let yaml = r#"
policy: balloons
availableResources:
  cpu: "0-15"
reservedResources:
  cpu: "0-1"
schedulingClasses:
  - name: lowlatency-sched
    policy: FIFO
    priority: 56
balloons:
  balloonTypes:
    - name: lowlatency
      minCPUs: 1
      maxCPUs: 4
      topologyLevel: numa
      allocator: pack
      cStates:
        C4: false
        C8: false
      scheduling: lowlatency-sched
"#;
        let config = DaemonConfig::from_yaml(yaml, "test").unwrap();
        assert_eq!(config.policy, "balloons");
        assert_eq!(config.available.cpu.to_string(), "0-15");
        let class = &config.balloons.balloon_types[0];
        assert_eq!(class.name, "lowlatency");
        assert_eq!(class.min_cpus, 1);
        assert_eq!(class.max_cpus, 4);
        assert_eq!(class.c_states.get("C4"), Some(&false));
        let sched = config.sched_params_for("lowlatency-sched").unwrap();
        assert_eq!(sched.policy.number(), 1);
        assert_eq!(sched.priority, 56);
    }

    #[test]
    fn rejects_reserved_outside_available() {
        let yaml = r#"
availableResources:
  cpu: "0-7"
reservedResources:
  cpu: "8-9"
"#;
        assert!(matches!(
            DaemonConfig::from_yaml(yaml, "test"),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn rejects_contradictory_balloon_class() {
        let yaml = r#"
balloons:
  balloonTypes:
    - name: broken
      minCPUs: 8
      maxCPUs: 2
"#;
        assert!(matches!(
            DaemonConfig::from_yaml(yaml, "test"),
            Err(ConfigError::BadBalloonClass { .. })
        ));
    }

    #[test]
    fn rejects_unknown_scheduling_class_reference() {
        let yaml = r#"
balloons:
  balloonTypes:
    - name: rt
      scheduling: nosuch
"#;
        assert!(matches!(
            DaemonConfig::from_yaml(yaml, "test"),
            Err(ConfigError::UnknownSchedulingClass(_))
        ));
    }
}
