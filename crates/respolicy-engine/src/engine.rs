//! Engine wiring and event dispatch.
//!
//! The `Engine` value owns the cache, the active policy and the
//! controllers, and is registered as the pipeline handler for all
//! lifecycle, config and internal policy events. Process-wide state is
//! confined to this value; there are no globals.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::rc::Rc;

use respolicy_core::{cast, log_debug, log_error, log_info, log_warn, Event, EventHandler, PipelineContext};
use respolicy_topology::System;

use crate::controllers;
use crate::controllers::blockio::BlockioController;
use crate::controllers::cgroup::CgroupController;
use crate::controllers::cpufreq::CpufreqController;
use crate::controllers::cpuset::CpusetController;
use crate::controllers::cstate::CstateController;
use crate::controllers::rdt::RdtController;
use crate::controllers::sched::SchedController;
use crate::controllers::{Controller, HostPaths};
use crate::core::cache::Cache;
use crate::core::config::DaemonConfig;
use crate::core::container::{Container, ContainerState};
use crate::core::errors::{Error, ProtocolError};
use crate::core::events::config::ConfigUpdated;
use crate::core::events::lifecycle::{
    ContainerSpec, CreateContainer, PodSpec, RemoveContainer, RemovePodSandbox, RunPodSandbox, StartContainer,
    StopContainer, StopPodSandbox, Synchronize, UpdateContainer,
};
use crate::core::events::policy::{ExportMetrics, Rebalance};
use crate::core::pod::Pod;
use crate::core::policy::{Policy, PolicyEvent};
use crate::runtime::AdjustmentSink;

/// The resource policy engine.
pub struct Engine {
    cache: Cache,
    policy: Policy,
    controllers: Vec<Box<dyn Controller>>,
    cpufreq: CpufreqController,
    cstate: CstateController,
    sink: Rc<RefCell<dyn AdjustmentSink>>,
    system: System,
    config: DaemonConfig,
    cache_path: Option<PathBuf>,
    ctx: PipelineContext,
}

impl Engine {
    /// Wires the engine: resolves the policy, loads or rebuilds the cache,
    /// and builds the controllers for the given host paths.
    pub fn new(
        system: System,
        config: DaemonConfig,
        paths: HostPaths,
        sink: Rc<RefCell<dyn AdjustmentSink>>,
        cache_path: Option<PathBuf>,
        ctx: PipelineContext,
    ) -> Result<Self, Error> {
        let mut policy = Policy::resolve(&config)?;
        policy.setup(&system, &config)?;

        let mut cache = match &cache_path {
            Some(path) if path.exists() => match Cache::load(path) {
                Ok(cache) => {
                    log_info!(ctx, "restored cache from {:?}", path);
                    cache
                }
                Err(e) => {
                    log_warn!(ctx, "discarding cache, rebuilding from runtime state: {}", e);
                    Cache::new()
                }
            },
            _ => Cache::new(),
        };
        policy.start(&mut cache)?;

        let controllers: Vec<Box<dyn Controller>> = vec![
            Box::new(CpusetController::new(Some(paths.cgroupfs.clone()))),
            Box::new(CgroupController::new()),
            Box::new(SchedController::new()),
            Box::new(BlockioController::new()),
            Box::new(RdtController::new(Some(paths.sysfs.clone()))),
        ];

        let cstate = match paths.cstate_override {
            Some(dir) => CstateController::with_override(paths.sysfs.clone(), dir),
            None => CstateController::new(paths.sysfs.clone()),
        };
        Ok(Self {
            cache,
            policy,
            controllers,
            cpufreq: CpufreqController::new(paths.sysfs),
            cstate,
            sink,
            system,
            config,
            cache_path,
            ctx,
        })
    }

    /// Read access to the cache, mainly for tests and the test APIs.
    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// The active policy's exported metrics.
    pub fn metrics(&self) -> serde_json::Value {
        self.policy.export_metrics()
    }

    // Rebuilds the policy's volatile state from the (restored) cache.
    fn reset_policy(&mut self) {
        match Policy::resolve(&self.config) {
            Ok(mut policy) => {
                if let Err(e) = policy.setup(&self.system, &self.config) {
                    log_error!(self.ctx, "policy rebuild failed: {}", e);
                    return;
                }
                if let Err(e) = policy.start(&mut self.cache) {
                    log_error!(self.ctx, "policy state reload failed: {}", e);
                }
                self.policy = policy;
            }
            Err(e) => log_error!(self.ctx, "policy rebuild failed: {}", e),
        }
    }

    // Runs one pipeline step: checkpoint, mutate, then either drain the
    // controllers and emit adjustments, or roll everything back.
    fn step<F>(&mut self, deadline: Option<f64>, failing: Option<&str>, f: F) -> Result<(), Error>
    where
        F: FnOnce(&mut Self) -> Result<(), Error>,
    {
        let checkpoint = self.cache.checkpoint();
        let result = f(self);
        let expired = deadline.map_or(false, |d| self.ctx.time() > d);

        match result {
            Ok(()) if !expired => {
                let adjustments = controllers::drain(&mut self.controllers, &mut self.cache);
                let knobs = self.cache.take_cpu_knobs();
                self.cpufreq.apply(&self.system, &knobs);
                self.cstate.apply(&knobs);
                if !adjustments.is_empty() {
                    self.sink.borrow_mut().adjust(adjustments);
                }
                self.save_cache();
                Ok(())
            }
            Ok(()) => {
                let error: Error = ProtocolError::DeadlineExceeded(failing.unwrap_or("?").to_string()).into();
                self.cache.restore(checkpoint);
                self.reset_policy();
                if let Some(id) = failing {
                    self.sink.borrow_mut().fail(id, error.to_string());
                }
                log_warn!(self.ctx, "step aborted: {}", error);
                Err(error)
            }
            Err(error) => {
                self.cache.restore(checkpoint);
                self.reset_policy();
                if let Some(id) = failing {
                    self.sink.borrow_mut().fail(id, error.to_string());
                }
                log_warn!(self.ctx, "step failed: {}", error);
                Err(error)
            }
        }
    }

    fn save_cache(&self) {
        if let Some(path) = &self.cache_path {
            if let Err(e) = self.cache.save(path) {
                log_warn!(self.ctx, "cache save failed: {}", e);
            }
        }
    }

    fn pod_from_spec(spec: PodSpec) -> Pod {
        Pod {
            uid: spec.uid,
            namespace: spec.namespace,
            name: spec.name,
            qos: spec.qos,
            labels: spec.labels,
            annotations: spec.annotations,
            containers: BTreeSet::new(),
        }
    }

    fn on_synchronize(&mut self, pods: Vec<PodSpec>, containers: Vec<ContainerSpec>, deadline: Option<f64>) {
        log_info!(self.ctx, "synchronizing {} pods, {} containers", pods.len(), containers.len());
        let _ = self.step(deadline, None, |engine| {
            for pod in pods {
                engine.cache.insert_pod(Self::pod_from_spec(pod));
            }
            for spec in containers {
                let mut container = Container::new(&spec.id, &spec.pod_uid, &spec.name, spec.request);
                container.state = ContainerState::Running;
                engine.cache.insert_container(container);
            }
            engine.policy.sync(&mut engine.cache)
        });
    }

    fn on_run_pod_sandbox(&mut self, pod: PodSpec, deadline: Option<f64>) {
        log_debug!(self.ctx, "RunPodSandbox {}/{}", pod.namespace, pod.name);
        let _ = self.step(deadline, None, |engine| {
            engine.cache.insert_pod(Self::pod_from_spec(pod));
            Ok(())
        });
    }

    fn on_stop_pod_sandbox(&mut self, pod_uid: String, deadline: Option<f64>) {
        log_debug!(self.ctx, "StopPodSandbox {}", pod_uid);
        let _ = self.step(deadline, None, |engine| {
            let ids: Vec<String> = engine
                .cache
                .pod(&pod_uid)
                .map(|p| p.containers.iter().cloned().collect())
                .unwrap_or_default();
            for id in ids {
                engine.policy.release(&mut engine.cache, &id)?;
                engine.cache.set_state(&id, ContainerState::Stopped);
            }
            Ok(())
        });
    }

    fn on_remove_pod_sandbox(&mut self, pod_uid: String, deadline: Option<f64>) {
        log_debug!(self.ctx, "RemovePodSandbox {}", pod_uid);
        let _ = self.step(deadline, None, |engine| {
            let ids: Vec<String> = engine
                .cache
                .pod(&pod_uid)
                .map(|p| p.containers.iter().cloned().collect())
                .unwrap_or_default();
            for id in ids {
                engine.policy.release(&mut engine.cache, &id)?;
                engine.cache.remove_container(&id);
            }
            engine.cache.remove_pod(&pod_uid);
            Ok(())
        });
    }

    fn on_create_container(&mut self, spec: ContainerSpec, deadline: Option<f64>) {
        log_debug!(self.ctx, "CreateContainer {}", spec.id);
        let id = spec.id.clone();
        let bare = Container::new(&spec.id, &spec.pod_uid, &spec.name, spec.request.clone());
        let result = self.step(deadline, Some(&id), |engine| {
            if engine.cache.pod(&spec.pod_uid).is_none() {
                return Err(ProtocolError::Malformed(format!(
                    "container {} references unknown pod {}",
                    spec.id, spec.pod_uid
                ))
                .into());
            }
            engine
                .cache
                .insert_container(Container::new(&spec.id, &spec.pod_uid, &spec.name, spec.request.clone()));
            engine.policy.allocate(&mut engine.cache, &spec.id)
        });
        if result.is_err() && self.cache.pod(&bare.pod_uid).is_some() {
            // The runtime still creates the container; track it at its
            // default assignment.
            self.cache.insert_container(bare);
        }
    }

    fn on_start_container(&mut self, container_id: String, deadline: Option<f64>) {
        log_debug!(self.ctx, "StartContainer {}", container_id);
        let _ = self.step(deadline, None, |engine| {
            engine.cache.set_state(&container_id, ContainerState::Created);
            engine.cache.set_state(&container_id, ContainerState::Running);
            Ok(())
        });
    }

    fn on_update_container(&mut self, container_id: String, request: crate::core::common::ResourceRequest, deadline: Option<f64>) {
        log_debug!(self.ctx, "UpdateContainer {}", container_id);
        let _ = self.step(deadline, Some(&container_id), |engine| {
            if engine.cache.lookup_container(&container_id).map_or(false, |c| c.failed) {
                return Err(ProtocolError::Malformed(format!("container {} is quarantined", container_id)).into());
            }
            engine.cache.set_request(&container_id, request);
            engine.policy.update(&mut engine.cache, &container_id)
        });
    }

    fn on_stop_container(&mut self, container_id: String, deadline: Option<f64>) {
        log_debug!(self.ctx, "StopContainer {}", container_id);
        let _ = self.step(deadline, None, |engine| {
            engine.policy.release(&mut engine.cache, &container_id)?;
            engine.cache.set_failed(&container_id, false);
            engine.cache.set_state(&container_id, ContainerState::Stopped);
            Ok(())
        });
    }

    fn on_remove_container(&mut self, container_id: String, deadline: Option<f64>) {
        log_debug!(self.ctx, "RemoveContainer {}", container_id);
        let _ = self.step(deadline, None, |engine| {
            engine.policy.release(&mut engine.cache, &container_id)?;
            engine.cache.remove_container(&container_id);
            Ok(())
        });
    }

    // A config reload is an ordinary event: containers may be re-homed in
    // one atomic step. A bad config keeps the previous one active.
    fn on_config_updated(&mut self, config: DaemonConfig, deadline: Option<f64>) {
        log_info!(self.ctx, "applying updated configuration");
        let mut new_policy = match Policy::resolve(&config) {
            Ok(policy) => policy,
            Err(e) => {
                log_error!(self.ctx, "rejecting config: {}", e);
                return;
            }
        };
        if let Err(e) = new_policy.setup(&self.system, &config) {
            log_error!(self.ctx, "rejecting config: {}", e);
            return;
        }

        let old_config = self.config.clone();
        self.config = config;
        let result = self.step(deadline, None, |engine| {
            engine.policy = new_policy;
            // Old assignments and policy state are recomputed from scratch
            // under the new config, in this one step.
            let ids: Vec<String> = engine.cache.containers().map(|c| c.id.clone()).collect();
            for id in &ids {
                engine.cache.clear_assignment(id);
            }
            engine.cache.set_policy_state(serde_json::Value::Null);
            engine.policy.start(&mut engine.cache)?;
            engine.policy.sync(&mut engine.cache)
        });
        if result.is_err() {
            self.config = old_config;
            self.reset_policy();
            log_error!(self.ctx, "config rollback, previous configuration stays active");
        }
    }

    fn on_rebalance(&mut self, deadline: Option<f64>) {
        let _ = self.step(deadline, None, |engine| {
            engine.policy.handle_event(&mut engine.cache, PolicyEvent::Rebalance).map(|_| ())
        });
    }

    fn on_export_metrics(&mut self) {
        log_debug!(self.ctx, "metrics: {}", self.policy.export_metrics());
    }
}

impl EventHandler for Engine {
    fn on(&mut self, event: Event) {
        let deadline = event.deadline;
        cast!(match event.data {
            Synchronize { pods, containers } => {
                self.on_synchronize(pods, containers, deadline);
            }
            RunPodSandbox { pod } => {
                self.on_run_pod_sandbox(pod, deadline);
            }
            StopPodSandbox { pod_uid } => {
                self.on_stop_pod_sandbox(pod_uid, deadline);
            }
            RemovePodSandbox { pod_uid } => {
                self.on_remove_pod_sandbox(pod_uid, deadline);
            }
            CreateContainer { container } => {
                self.on_create_container(container, deadline);
            }
            StartContainer { container_id } => {
                self.on_start_container(container_id, deadline);
            }
            UpdateContainer { container_id, request } => {
                self.on_update_container(container_id, request, deadline);
            }
            StopContainer { container_id } => {
                self.on_stop_container(container_id, deadline);
            }
            RemoveContainer { container_id } => {
                self.on_remove_container(container_id, deadline);
            }
            ConfigUpdated { config } => {
                self.on_config_updated(config, deadline);
            }
            Rebalance {} => {
                self.on_rebalance(deadline);
            }
            ExportMetrics {} => {
                self.on_export_metrics();
            }
        })
    }
}
