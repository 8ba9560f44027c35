/*
Copyright 2025 The Skylet Authors.
Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at
    http://www.apache.org/licenses/LICENSE-2.0
Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use serde_derive::Serialize;
use strum_macros::{Display as StrumDisplay, EnumString};

use common::ctx::OperatingSystem;
use common::{SkyletError, DEFAULT_NAMESPACE};

const WORKLOAD_NAME_PREFIX: &str = "skylet";
const MAX_WORKLOAD_NAME_LEN: usize = 63;

pub const TAG_NAMESPACE: &str = "skylet-namespace";
pub const TAG_NAME: &str = "skylet-name";
pub const TAG_REVISION: &str = "skylet-revision";

/// The (namespace, name) key of a pod.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PodIdentity {
    pub namespace: String,
    pub name: String,
}

impl PodIdentity {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_pod(pod: &Pod) -> Result<Self, SkyletError> {
        let name = pod
            .metadata
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| SkyletError::Translation("pod has no name".to_string()))?;
        let namespace = pod
            .metadata
            .namespace
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or(DEFAULT_NAMESPACE.to_string());

        Ok(Self { namespace, name })
    }

    /// A backend-safe name: lowercase alphanumerics and single hyphens, at
    /// most 63 characters. Over-long names keep a hash suffix so that two
    /// long identities never collapse into the same workload.
    pub fn workload_name(&self) -> String {
        let raw = format!("{WORKLOAD_NAME_PREFIX}-{}-{}", self.namespace, self.name);

        let mut name = String::with_capacity(raw.len());
        for c in raw.chars() {
            let c = if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            };
            if c == '-' && name.ends_with('-') {
                continue;
            }
            name.push(c);
        }
        let name = name.trim_end_matches('-').to_string();

        if name.len() <= MAX_WORKLOAD_NAME_LEN {
            return name;
        }

        let suffix = format!("{:08x}", crc32fast::hash(raw.as_bytes()));
        let keep = MAX_WORKLOAD_NAME_LEN - suffix.len() - 1;
        format!("{}-{}", name[..keep].trim_end_matches('-'), suffix)
    }
}

impl Display for PodIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, StrumDisplay, EnumString, Serialize)]
pub enum Protocol {
    #[strum(serialize = "TCP")]
    #[serde(rename = "TCP")]
    Tcp,
    #[strum(serialize = "UDP")]
    #[serde(rename = "UDP")]
    Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PortMapping {
    pub port: u16,
    pub protocol: Protocol,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, StrumDisplay, EnumString, Serialize,
)]
pub enum RestartPolicy {
    #[default]
    Always,
    OnFailure,
    Never,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerDescriptor {
    pub name: String,
    pub image: String,
    pub cpu_millis: u64,
    pub memory_bytes: u64,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub ports: Vec<PortMapping>,
    pub working_dir: Option<String>,
}

/// What should run for a pod, independent of the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkloadDescriptor {
    pub name: String,
    pub namespace: String,
    pub pod_name: String,
    pub containers: Vec<ContainerDescriptor>,
    pub restart_policy: RestartPolicy,
    pub operating_system: OperatingSystem,
}

impl WorkloadDescriptor {
    pub fn identity(&self) -> PodIdentity {
        PodIdentity::new(self.namespace.clone(), self.pod_name.clone())
    }

    /// The JSON encoding of the descriptor; fields keep declaration order
    /// and env entries are sorted, so equal descriptors encode identically.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, SkyletError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn revision(&self) -> Result<String, SkyletError> {
        Ok(format!("{:08x}", crc32fast::hash(&self.canonical_bytes()?)))
    }

    pub fn total_cpu_millis(&self) -> u64 {
        self.containers
            .iter()
            .fold(0, |total, c| total.saturating_add(c.cpu_millis))
    }

    pub fn total_memory_bytes(&self) -> u64 {
        self.containers
            .iter()
            .fold(0, |total, c| total.saturating_add(c.memory_bytes))
    }

    /// Tags written on the backend workload so it can be traced back to its pod.
    pub fn tags(&self) -> Result<BTreeMap<String, String>, SkyletError> {
        Ok(BTreeMap::from([
            (TAG_NAMESPACE.to_string(), self.namespace.clone()),
            (TAG_NAME.to_string(), self.pod_name.clone()),
            (TAG_REVISION.to_string(), self.revision()?),
        ]))
    }
}

/// Backend identifiers of a workload and the descriptor revision it realizes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkloadHandle {
    /// The ECS cluster or the ACI resource group.
    pub scope: String,
    /// The ECS task ARN or the ACI container group name.
    pub id: String,
    pub revision: String,
}

impl Display for WorkloadHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}@{}", self.scope, self.id, self.revision)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, StrumDisplay, EnumString)]
pub enum WorkloadPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl WorkloadPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkloadPhase::Succeeded | WorkloadPhase::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, StrumDisplay)]
pub enum ContainerPhase {
    Waiting,
    Running,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedContainer {
    pub name: String,
    pub phase: ContainerPhase,
    pub exit_code: Option<i32>,
    pub restart_count: i32,
    pub reason: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// The live state of a workload as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedStatus {
    pub phase: WorkloadPhase,
    pub message: Option<String>,
    pub ip: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub containers: Vec<ObservedContainer>,
}

impl ObservedStatus {
    pub fn new(phase: WorkloadPhase) -> Self {
        Self {
            phase,
            message: None,
            ip: None,
            started_at: None,
            containers: vec![],
        }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::new(WorkloadPhase::Unknown)
        }
    }
}

/// The lifecycle state of a reconciler entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, StrumDisplay)]
pub enum EntryState {
    Creating,
    Present,
    Updating,
    Deleting,
    Failed,
}
