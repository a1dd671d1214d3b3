//! No-op policy skeleton.
//!
//! Accepts every container without assigning anything. Useful for bring-up
//! against a new runtime and as the minimal example of the policy surface.

use respolicy_topology::System;

use crate::core::cache::Cache;
use crate::core::config::DaemonConfig;
use crate::core::errors::Error;
use crate::core::policy::{PolicyEvent, ResourcePolicy};

/// The template policy.
#[derive(Default)]
pub struct TemplatePolicy {
    containers_seen: u64,
}

impl TemplatePolicy {
    /// Creates the policy.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResourcePolicy for TemplatePolicy {
    fn name(&self) -> &'static str {
        "template"
    }

    fn setup(&mut self, _system: &System, _config: &DaemonConfig) -> Result<(), Error> {
        Ok(())
    }

    fn start(&mut self, _cache: &mut Cache) -> Result<(), Error> {
        Ok(())
    }

    fn sync(&mut self, _cache: &mut Cache) -> Result<(), Error> {
        Ok(())
    }

    fn allocate(&mut self, _cache: &mut Cache, _container_id: &str) -> Result<(), Error> {
        self.containers_seen += 1;
        Ok(())
    }

    fn release(&mut self, _cache: &mut Cache, _container_id: &str) -> Result<(), Error> {
        Ok(())
    }

    fn update(&mut self, _cache: &mut Cache, _container_id: &str) -> Result<(), Error> {
        Ok(())
    }

    fn handle_event(&mut self, _cache: &mut Cache, _event: PolicyEvent) -> Result<bool, Error> {
        Ok(false)
    }

    fn export_metrics(&self) -> serde_json::Value {
        serde_json::json!({ "policy": "template", "containersSeen": self.containers_seen })
    }
}
