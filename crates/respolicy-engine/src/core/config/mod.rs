//! Daemon configuration.

pub mod daemon_config;
pub mod options;

pub use daemon_config::{
    AllocatorMode, BalloonClassConfig, BalloonsConfig, CpuPriority, DaemonConfig, FreqRange, ResourceSpec,
    SchedulingClass, TopologyAwareConfig,
};
pub use options::{parse_config_value, parse_options};
