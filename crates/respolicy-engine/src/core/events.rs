//! Pipeline events of the policy engine.

// LIFECYCLE EVENTS ////////////////////////////////////////////////////////////////////////////////

pub mod lifecycle {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Serialize};

    use crate::core::common::{QosClass, ResourceRequest};

    /// Pod description as delivered by the runtime.
    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    pub struct PodSpec {
        pub uid: String,
        pub namespace: String,
        pub name: String,
        pub qos: QosClass,
        #[serde(default)]
        pub labels: BTreeMap<String, String>,
        #[serde(default)]
        pub annotations: BTreeMap<String, String>,
    }

    /// Container description as delivered by the runtime.
    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    pub struct ContainerSpec {
        pub id: String,
        pub pod_uid: String,
        pub name: String,
        #[serde(default)]
        pub request: ResourceRequest,
    }

    /// Existing pods and containers reported at (re)connect.
    #[derive(Clone, Serialize)]
    pub struct Synchronize {
        pub pods: Vec<PodSpec>,
        pub containers: Vec<ContainerSpec>,
    }

    #[derive(Clone, Serialize)]
    pub struct RunPodSandbox {
        pub pod: PodSpec,
    }

    #[derive(Clone, Serialize)]
    pub struct StopPodSandbox {
        pub pod_uid: String,
    }

    #[derive(Clone, Serialize)]
    pub struct RemovePodSandbox {
        pub pod_uid: String,
    }

    #[derive(Clone, Serialize)]
    pub struct CreateContainer {
        pub container: ContainerSpec,
    }

    #[derive(Clone, Serialize)]
    pub struct StartContainer {
        pub container_id: String,
    }

    #[derive(Clone, Serialize)]
    pub struct UpdateContainer {
        pub container_id: String,
        pub request: ResourceRequest,
    }

    #[derive(Clone, Serialize)]
    pub struct StopContainer {
        pub container_id: String,
    }

    #[derive(Clone, Serialize)]
    pub struct RemoveContainer {
        pub container_id: String,
    }
}

// CONFIG EVENTS ///////////////////////////////////////////////////////////////////////////////////

pub mod config {
    use serde::Serialize;

    use crate::core::config::DaemonConfig;

    /// A new configuration was loaded by the watcher. Applied like any
    /// other event, re-homing containers in one atomic step.
    #[derive(Clone, Serialize)]
    pub struct ConfigUpdated {
        pub config: DaemonConfig,
    }
}

// INTERNAL POLICY EVENTS //////////////////////////////////////////////////////////////////////////

pub mod policy {
    use serde::Serialize;

    /// Asks the active policy to re-examine placement.
    #[derive(Clone, Serialize)]
    pub struct Rebalance {}

    /// Periodic metrics export tick.
    #[derive(Clone, Serialize)]
    pub struct ExportMetrics {}
}
