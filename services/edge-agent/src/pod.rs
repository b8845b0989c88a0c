//! Desired-state pod model.
//!
//! A pod arrives from the sync loop and is immutable for the duration of one
//! reconciliation pass. The agent runs a single managed container per pod.

use std::fmt;

use edged_reconcile::SpecHash;
use serde::{Deserialize, Serialize};

use crate::quantity::Quantity;

/// Pod UID as assigned by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PodUid(String);

impl PodUid {
    pub fn new(uid: impl Into<String>) -> Self {
        Self(uid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for PodUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PodUid {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// What to do with a container that has stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RestartPolicy {
    #[default]
    Always,
    OnFailure,
    Never,
}

/// A single environment variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

impl EnvVar {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A port exposed by the container.
///
/// The agent only supports host networking, so `host_port` must equal
/// `container_port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerPort {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub container_port: i32,
    #[serde(default)]
    pub host_port: i32,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "TCP".to_string()
}

/// CPU and memory amounts.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceList {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<Quantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<Quantity>,
}

/// Resource requests and limits.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceRequirements {
    #[serde(default)]
    pub requests: ResourceList,
    #[serde(default)]
    pub limits: ResourceList,
}

/// Desired container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub resources: ResourceRequirements,
    #[serde(default)]
    pub ports: Vec<ContainerPort>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

impl ContainerSpec {
    /// Hash of the fields that require a restart when they change.
    pub fn spec_hash(&self) -> SpecHash {
        let ports: Vec<_> = self
            .ports
            .iter()
            .map(|p| {
                serde_json::json!({
                    "containerPort": p.container_port,
                    "hostPort": p.host_port,
                    "protocol": p.protocol,
                })
            })
            .collect();
        let env: Vec<_> = self
            .env
            .iter()
            .map(|e| serde_json::json!([e.name, e.value]))
            .collect();

        SpecHash::from_json(&serde_json::json!({
            "name": self.name,
            "image": self.image,
            "command": self.command,
            "args": self.args,
            "env": env,
            "resources": {
                "requests": resource_json(&self.resources.requests),
                "limits": resource_json(&self.resources.limits),
            },
            "ports": ports,
            "workingDir": self.working_dir,
        }))
    }
}

fn resource_json(list: &ResourceList) -> serde_json::Value {
    serde_json::json!({
        "cpu": list.cpu.as_ref().map(Quantity::as_str),
        "memory": list.memory.as_ref().map(Quantity::as_str),
    })
}

/// Desired pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pod {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub name: String,
    pub uid: PodUid,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    pub containers: Vec<ContainerSpec>,
    /// Set once the control plane has asked for the pod to be deleted.
    #[serde(default)]
    pub deletion_requested: bool,
}

fn default_namespace() -> String {
    "default".to_string()
}

impl Pod {
    /// `namespace/name`, for logs.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Backoff key; backoff is tracked per pod name.
    pub fn backoff_key(&self) -> String {
        format!("container_{}", self.name)
    }
}
