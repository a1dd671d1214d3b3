//! Resource policy capability surface.

use respolicy_topology::System;

use crate::core::cache::Cache;
use crate::core::config::DaemonConfig;
use crate::core::errors::{ConfigError, Error};
use crate::policies::balloons::BalloonsPolicy;
use crate::policies::template::TemplatePolicy;
use crate::policies::topology_aware::TopologyAwarePolicy;

/// Internal events a policy may react to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolicyEvent {
    /// Re-examine placement of everything.
    Rebalance,
}

/// The capability set every placement policy implements.
///
/// All methods run inside a serialized pipeline step; a policy mutates
/// container assignments only through the cache so that controllers see
/// every change as a pending delta.
pub trait ResourcePolicy {
    /// Policy name as used in configuration.
    fn name(&self) -> &'static str;

    /// Builds policy state from the discovered system and configuration.
    fn setup(&mut self, system: &System, config: &DaemonConfig) -> Result<(), Error>;

    /// Restores internal state persisted in the cache, after a restart.
    fn start(&mut self, cache: &mut Cache) -> Result<(), Error>;

    /// Reconciles all cached containers, allocating any that lack an
    /// assignment.
    fn sync(&mut self, cache: &mut Cache) -> Result<(), Error>;

    /// Assigns resources to one container.
    fn allocate(&mut self, cache: &mut Cache, container_id: &str) -> Result<(), Error>;

    /// Releases one container's resources.
    fn release(&mut self, cache: &mut Cache, container_id: &str) -> Result<(), Error>;

    /// Re-evaluates one container after a resource request change.
    fn update(&mut self, cache: &mut Cache, container_id: &str) -> Result<(), Error>;

    /// Handles an internal policy event. Returns whether anything changed.
    fn handle_event(&mut self, cache: &mut Cache, event: PolicyEvent) -> Result<bool, Error>;

    /// Exports policy metrics as a JSON document.
    fn export_metrics(&self) -> serde_json::Value;
}

/// The concrete policies, tagged.
pub enum Policy {
    /// Pool-tree placement mirroring the CPU topology.
    TopologyAware(TopologyAwarePolicy),
    /// Named CPU-pool workload classes.
    Balloons(BalloonsPolicy),
    /// No-op skeleton for bring-up and tests.
    Template(TemplatePolicy),
}

impl Policy {
    /// Resolves the configured policy value (`name` or `name[options]`)
    /// into a policy value.
    pub fn resolve(config: &DaemonConfig) -> Result<Policy, ConfigError> {
        let (name, _options) = crate::core::config::parse_config_value(&config.policy);
        match name.as_str() {
            "topology-aware" => Ok(Policy::TopologyAware(TopologyAwarePolicy::new())),
            "balloons" => Ok(Policy::Balloons(BalloonsPolicy::new())),
            "template" => Ok(Policy::Template(TemplatePolicy::new())),
            _ => Err(ConfigError::UnknownPolicy(config.policy.clone())),
        }
    }

    fn inner(&mut self) -> &mut dyn ResourcePolicy {
        match self {
            Policy::TopologyAware(p) => p,
            Policy::Balloons(p) => p,
            Policy::Template(p) => p,
        }
    }

    fn inner_ref(&self) -> &dyn ResourcePolicy {
        match self {
            Policy::TopologyAware(p) => p,
            Policy::Balloons(p) => p,
            Policy::Template(p) => p,
        }
    }

    /// Policy name as used in configuration.
    pub fn name(&self) -> &'static str {
        self.inner_ref().name()
    }

    /// See [`ResourcePolicy::setup`].
    pub fn setup(&mut self, system: &System, config: &DaemonConfig) -> Result<(), Error> {
        self.inner().setup(system, config)
    }

    /// See [`ResourcePolicy::start`].
    pub fn start(&mut self, cache: &mut Cache) -> Result<(), Error> {
        self.inner().start(cache)
    }

    /// See [`ResourcePolicy::sync`].
    pub fn sync(&mut self, cache: &mut Cache) -> Result<(), Error> {
        self.inner().sync(cache)
    }

    /// See [`ResourcePolicy::allocate`].
    pub fn allocate(&mut self, cache: &mut Cache, container_id: &str) -> Result<(), Error> {
        self.inner().allocate(cache, container_id)
    }

    /// See [`ResourcePolicy::release`].
    pub fn release(&mut self, cache: &mut Cache, container_id: &str) -> Result<(), Error> {
        self.inner().release(cache, container_id)
    }

    /// See [`ResourcePolicy::update`].
    pub fn update(&mut self, cache: &mut Cache, container_id: &str) -> Result<(), Error> {
        self.inner().update(cache, container_id)
    }

    /// See [`ResourcePolicy::handle_event`].
    pub fn handle_event(&mut self, cache: &mut Cache, event: PolicyEvent) -> Result<bool, Error> {
        self.inner().handle_event(cache, event)
    }

    /// See [`ResourcePolicy::export_metrics`].
    pub fn export_metrics(&self) -> serde_json::Value {
        self.inner_ref().export_metrics()
    }
}
