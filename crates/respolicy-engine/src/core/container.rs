//! Container entities.

use serde::{Deserialize, Serialize};

use crate::core::common::{Assignment, ResourceRequest};

/// Container lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerState {
    /// Not running and not being created.
    Stopped,
    /// CreateContainer seen, not yet acknowledged.
    Creating,
    /// Created but not started.
    Created,
    /// Running.
    Running,
    /// Exited on its own.
    Exited,
}

impl ContainerState {
    /// Whether a transition to `next` is allowed.
    pub fn can_transition(self, next: ContainerState) -> bool {
        use ContainerState::*;
        matches!(
            (self, next),
            (Stopped, Creating)
                | (Creating, Created)
                | (Creating, Stopped)
                | (Created, Running)
                | (Created, Stopped)
                | (Running, Exited)
                | (Running, Stopped)
                | (Exited, Stopped)
                | (Exited, Creating)
        )
    }
}

/// A container as tracked by the cache.
///
/// Holds a non-owning back-reference to its pod by uid.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Container {
    /// Stable container id.
    pub id: String,
    /// Uid of the owning pod.
    pub pod_uid: String,
    /// Container name within the pod.
    pub name: String,
    /// Lifecycle state.
    pub state: ContainerState,
    /// Requested resources.
    pub request: ResourceRequest,
    /// Currently assigned resources.
    pub assignment: Assignment,
    /// Set when a controller write failed; quarantined from policy
    /// decisions until released.
    pub failed: bool,
}

impl Container {
    /// Creates a container in the `Creating` state.
    pub fn new(id: &str, pod_uid: &str, name: &str, request: ResourceRequest) -> Self {
        Self {
            id: id.to_string(),
            pod_uid: pod_uid.to_string(),
            name: name.to_string(),
            state: ContainerState::Creating,
            request,
            assignment: Assignment::default(),
            failed: false,
        }
    }
}
