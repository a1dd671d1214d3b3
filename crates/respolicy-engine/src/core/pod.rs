//! Pod entities.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::core::common::QosClass;

/// A pod as tracked by the cache.
///
/// Created on the first event referencing it and destroyed when its last
/// container is removed. Holds no owning references to containers, only
/// their ids.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    /// Stable pod uid.
    pub uid: String,
    /// Kubernetes namespace.
    pub namespace: String,
    /// Pod name.
    pub name: String,
    /// Quality-of-service class.
    pub qos: QosClass,
    /// Pod labels.
    pub labels: BTreeMap<String, String>,
    /// Pod annotations; the policy hints live here.
    pub annotations: BTreeMap<String, String>,
    /// Ids of containers belonging to this pod.
    pub containers: BTreeSet<String>,
}

impl Pod {
    /// Looks up a plain pod-scoped annotation.
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(|s| s.as_str())
    }

    /// Looks up an effective annotation for one container: the
    /// `<key>/container.<name>` form wins over the pod-scoped `<key>`.
    pub fn effective_annotation(&self, key: &str, container_name: &str) -> Option<&str> {
        self.annotations
            .get(&format!("{}/container.{}", key, container_name))
            .or_else(|| self.annotations.get(key))
            .map(|s| s.as_str())
    }
}
