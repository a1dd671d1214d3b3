//! Boundary types toward the container runtime.
//!
//! The wire encoding itself lives outside this crate; requests arrive as
//! structured values and leave as structured adjustments.

use serde::{Deserialize, Serialize};

use respolicy_core::{EventSender, Id};

use crate::core::common::{Adjustment, ResourceRequest};
use crate::core::events::lifecycle;
use crate::core::events::lifecycle::{ContainerSpec, PodSpec};

/// A lifecycle request as delivered by the runtime connection.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum RuntimeRequest {
    /// Existing pods and containers, sent at (re)connect.
    Synchronize {
        pods: Vec<PodSpec>,
        containers: Vec<ContainerSpec>,
    },
    RunPodSandbox {
        pod: PodSpec,
    },
    StopPodSandbox {
        pod_uid: String,
    },
    RemovePodSandbox {
        pod_uid: String,
    },
    CreateContainer {
        container: ContainerSpec,
    },
    StartContainer {
        container_id: String,
    },
    UpdateContainer {
        container_id: String,
        request: ResourceRequest,
    },
    StopContainer {
        container_id: String,
    },
    RemoveContainer {
        container_id: String,
    },
}

impl RuntimeRequest {
    /// Submits this request into the pipeline as its typed event.
    pub fn dispatch(self, sender: &EventSender, engine: Id, deadline: Option<f64>) {
        macro_rules! emit {
            ($event:expr) => {
                match deadline {
                    Some(deadline) => {
                        sender.emit_with_deadline($event, engine, deadline);
                    }
                    None => {
                        sender.emit($event, engine);
                    }
                }
            };
        }
        match self {
            RuntimeRequest::Synchronize { pods, containers } => {
                emit!(lifecycle::Synchronize { pods, containers })
            }
            RuntimeRequest::RunPodSandbox { pod } => emit!(lifecycle::RunPodSandbox { pod }),
            RuntimeRequest::StopPodSandbox { pod_uid } => emit!(lifecycle::StopPodSandbox { pod_uid }),
            RuntimeRequest::RemovePodSandbox { pod_uid } => emit!(lifecycle::RemovePodSandbox { pod_uid }),
            RuntimeRequest::CreateContainer { container } => emit!(lifecycle::CreateContainer { container }),
            RuntimeRequest::StartContainer { container_id } => emit!(lifecycle::StartContainer { container_id }),
            RuntimeRequest::UpdateContainer { container_id, request } => {
                emit!(lifecycle::UpdateContainer { container_id, request })
            }
            RuntimeRequest::StopContainer { container_id } => emit!(lifecycle::StopContainer { container_id }),
            RuntimeRequest::RemoveContainer { container_id } => emit!(lifecycle::RemoveContainer { container_id }),
        }
    }
}

/// Where the engine's adjustments leave the system.
pub trait AdjustmentSink {
    /// Delivers the adjustments of one pipeline step to the runtime.
    fn adjust(&mut self, adjustments: Vec<Adjustment>);

    /// Reports a failed request for one container.
    fn fail(&mut self, container_id: &str, reason: String);
}

/// Sink recording everything it sees. Used by tests and the test APIs.
#[derive(Default)]
pub struct RecordingSink {
    /// All adjustments, in delivery order.
    pub adjustments: Vec<Adjustment>,
    /// All failures as (container id, reason).
    pub failures: Vec<(String, String)>,
}

impl RecordingSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recent adjustment for a container, if any.
    pub fn last_for(&self, container_id: &str) -> Option<&Adjustment> {
        self.adjustments.iter().rev().find(|a| a.container_id == container_id)
    }
}

impl AdjustmentSink for RecordingSink {
    fn adjust(&mut self, adjustments: Vec<Adjustment>) {
        self.adjustments.extend(adjustments);
    }

    fn fail(&mut self, container_id: &str, reason: String) {
        self.failures.push((container_id.to_string(), reason));
    }
}

/// Sink logging adjustments instead of delivering them anywhere.
#[derive(Default)]
pub struct LogSink {}

impl LogSink {
    /// Creates the sink.
    pub fn new() -> Self {
        Self::default()
    }
}

impl AdjustmentSink for LogSink {
    fn adjust(&mut self, adjustments: Vec<Adjustment>) {
        for adjustment in adjustments {
            match serde_json::to_string(&adjustment) {
                Ok(json) => log::info!(target: "runtime", "adjust {}", json),
                Err(_) => log::info!(target: "runtime", "adjust {:?}", adjustment.container_id),
            }
        }
    }

    fn fail(&mut self, container_id: &str, reason: String) {
        log::error!(target: "runtime", "request failed for {}: {}", container_id, reason);
    }
}
