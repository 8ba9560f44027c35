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

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::NodeCondition;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

use common::ctx::ProviderConfig;

pub const RESOURCE_CPU: &str = "cpu";
pub const RESOURCE_MEMORY: &str = "memory";
pub const RESOURCE_PODS: &str = "pods";

/// (type, status, reason, message) of the reported node conditions.
const CONDITIONS: [(&str, &str, &str, &str); 5] = [
    ("Ready", "True", "KubeletReady", "kubelet is ready."),
    (
        "OutOfDisk",
        "False",
        "KubeletHasSufficientDisk",
        "kubelet has sufficient disk space available",
    ),
    (
        "MemoryPressure",
        "False",
        "KubeletHasSufficientMemory",
        "kubelet has sufficient memory available",
    ),
    (
        "DiskPressure",
        "False",
        "KubeletHasNoDiskPressure",
        "kubelet has no disk pressure",
    ),
    (
        "NetworkUnavailable",
        "False",
        "RouteCreated",
        "RouteController created a route",
    ),
];

/// Synthetic node capacity and health; the backend is treated as one
/// node with the configured ceilings.
pub struct CapacityReporter {
    cpu: String,
    memory: String,
    pods: String,
}

impl CapacityReporter {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            cpu: config.cpu.clone(),
            memory: config.memory.clone(),
            pods: config.pods.clone(),
        }
    }

    pub fn capacity(&self) -> BTreeMap<String, Quantity> {
        BTreeMap::from([
            (RESOURCE_CPU.to_string(), Quantity(self.cpu.clone())),
            (RESOURCE_MEMORY.to_string(), Quantity(self.memory.clone())),
            (RESOURCE_PODS.to_string(), Quantity(self.pods.clone())),
        ])
    }

    pub fn node_conditions(&self) -> Vec<NodeCondition> {
        self.node_conditions_at(Utc::now())
    }

    // TODO: derive Ready and NetworkUnavailable from backend health, e.g. a
    // failing list_workloads or an unreachable cluster.
    pub fn node_conditions_at(&self, now: DateTime<Utc>) -> Vec<NodeCondition> {
        CONDITIONS
            .iter()
            .map(|(type_, status, reason, message)| NodeCondition {
                type_: type_.to_string(),
                status: status.to_string(),
                last_heartbeat_time: Some(Time(now)),
                last_transition_time: Some(Time(now)),
                reason: Some(reason.to_string()),
                message: Some(message.to_string()),
            })
            .collect()
    }
}
