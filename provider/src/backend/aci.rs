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

//! Azure Container Instances over the Azure Resource Manager REST API.
//! A pod maps to one container group named after the workload.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::{Method, RequestBuilder, Response};
use serde_derive::{Deserialize, Serialize};
use url::Url;

use common::ctx::ProviderConfig;
use common::{BackendError, SkyletError};

use crate::backend::{from_reqwest, from_status, http_client, BackendClient};
use crate::model::{
    ContainerPhase, ObservedContainer, ObservedStatus, WorkloadDescriptor, WorkloadHandle,
    WorkloadPhase, TAG_NAME, TAG_NAMESPACE, TAG_REVISION,
};

pub const BASE_URI: &str = "https://management.azure.com";
const API_VERSION: &str = "2018-10-01";
const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContainerGroup {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<String>,
    #[serde(default)]
    tags: BTreeMap<String, String>,
    properties: ContainerGroupProperties,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContainerGroupProperties {
    #[serde(default)]
    containers: Vec<AciContainer>,
    #[serde(skip_serializing_if = "Option::is_none")]
    os_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    restart_policy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ip_address: Option<IpAddress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    provisioning_state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    instance_view: Option<GroupInstanceView>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IpAddress {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    ports: Vec<AciPort>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ip: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct GroupInstanceView {
    #[serde(default)]
    state: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AciContainer {
    name: String,
    properties: AciContainerProperties,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AciContainerProperties {
    image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    ports: Vec<AciPort>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    environment_variables: Vec<EnvironmentVariable>,
    resources: Resources,
    #[serde(skip_serializing_if = "Option::is_none")]
    instance_view: Option<ContainerInstanceView>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct AciPort {
    port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    protocol: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct EnvironmentVariable {
    name: String,
    value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Resources {
    requests: ResourceRequests,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceRequests {
    cpu: f64,
    #[serde(rename = "memoryInGB")]
    memory_in_gb: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContainerInstanceView {
    #[serde(default)]
    restart_count: i32,
    current_state: Option<ContainerInstanceState>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContainerInstanceState {
    state: Option<String>,
    start_time: Option<DateTime<Utc>>,
    finish_time: Option<DateTime<Utc>>,
    exit_code: Option<i32>,
    detail_status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContainerGroupList {
    #[serde(default)]
    value: Vec<ContainerGroup>,
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Logs {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct ArmErrorBody {
    error: ArmError,
}

#[derive(Debug, Deserialize)]
struct ArmError {
    code: String,
    message: String,
}

/// Rounds up to one decimal, the granularity ACI accepts.
fn round_up_tenth(v: f64) -> f64 {
    (v * 10.0).ceil() / 10.0
}

fn to_container_group(
    descriptor: &WorkloadDescriptor,
    location: &str,
) -> Result<ContainerGroup, BackendError> {
    let invalid = |e: SkyletError| BackendError::Permanent(e.to_string());

    let mut containers = vec![];
    let mut group_ports = vec![];
    for c in &descriptor.containers {
        if c.command.is_empty() && !c.args.is_empty() {
            return Err(BackendError::Permanent(format!(
                "container <{}> sets args without a command, which ACI cannot express",
                c.name
            )));
        }

        let ports: Vec<AciPort> = c
            .ports
            .iter()
            .map(|p| AciPort {
                port: p.port,
                protocol: Some(p.protocol.to_string()),
            })
            .collect();
        group_ports.extend(ports.iter().cloned());

        containers.push(AciContainer {
            name: c.name.clone(),
            properties: AciContainerProperties {
                image: c.image.clone(),
                command: c.command.iter().chain(c.args.iter()).cloned().collect(),
                ports,
                environment_variables: c
                    .env
                    .iter()
                    .map(|(name, value)| EnvironmentVariable {
                        name: name.clone(),
                        value: value.clone(),
                    })
                    .collect(),
                resources: Resources {
                    requests: ResourceRequests {
                        cpu: c.cpu_millis as f64 / 1000.0,
                        memory_in_gb: round_up_tenth(c.memory_bytes as f64 / GIB),
                    },
                },
                instance_view: None,
            },
        });
    }

    let ip_address = if group_ports.is_empty() {
        None
    } else {
        Some(IpAddress {
            kind: "Public".to_string(),
            ports: group_ports,
            ip: None,
        })
    };

    Ok(ContainerGroup {
        name: None,
        location: Some(location.to_string()),
        tags: descriptor.tags().map_err(invalid)?,
        properties: ContainerGroupProperties {
            containers,
            os_type: Some(descriptor.operating_system.to_string()),
            restart_policy: Some(descriptor.restart_policy.to_string()),
            ip_address,
            provisioning_state: None,
            instance_view: None,
        },
    })
}

fn container_phase(state: Option<&str>) -> ContainerPhase {
    match state {
        Some("Running") => ContainerPhase::Running,
        Some("Terminated") => ContainerPhase::Terminated,
        _ => ContainerPhase::Waiting,
    }
}

fn to_observed(group: &ContainerGroup) -> ObservedStatus {
    let props = &group.properties;

    let containers: Vec<ObservedContainer> = props
        .containers
        .iter()
        .map(|c| {
            let view = c.properties.instance_view.clone().unwrap_or_default();
            let current = view.current_state.unwrap_or_default();
            ObservedContainer {
                name: c.name.clone(),
                phase: container_phase(current.state.as_deref()),
                exit_code: current.exit_code,
                restart_count: view.restart_count,
                reason: current.detail_status.filter(|s| !s.is_empty()),
                started_at: current.start_time,
                finished_at: current.finish_time,
            }
        })
        .collect();

    let all_exited_ok = containers
        .iter()
        .all(|c| c.phase == ContainerPhase::Terminated && c.exit_code == Some(0));

    let state = props.instance_view.as_ref().and_then(|v| v.state.as_deref());
    let phase = match (state, props.provisioning_state.as_deref()) {
        (Some("Running"), _) => WorkloadPhase::Running,
        (Some("Succeeded"), _) => WorkloadPhase::Succeeded,
        (Some("Failed"), _) => WorkloadPhase::Failed,
        (Some("Stopped"), _) if all_exited_ok => WorkloadPhase::Succeeded,
        (Some("Stopped"), _) => WorkloadPhase::Failed,
        (Some("Pending" | "Waiting" | "Repairing"), _) => WorkloadPhase::Pending,
        // List responses carry no instance view.
        (None, Some("Succeeded" | "Deleting")) => WorkloadPhase::Running,
        (None, Some("Creating" | "Pending" | "Updating" | "Accepted")) => WorkloadPhase::Pending,
        (None, Some("Failed")) => WorkloadPhase::Failed,
        _ => WorkloadPhase::Unknown,
    };

    let started_at = containers.iter().filter_map(|c| c.started_at).min();

    ObservedStatus {
        phase,
        message: None,
        ip: props.ip_address.as_ref().and_then(|ip| ip.ip.clone()),
        started_at,
        containers,
    }
}

pub struct AciClient {
    http: reqwest::Client,
    base: Url,
    subscription_id: String,
    resource_group: String,
    location: String,
    token: String,
}

impl AciClient {
    pub fn new(config: &ProviderConfig) -> Result<Self, SkyletError> {
        let subscription_id = config.subscription_id.clone().ok_or_else(|| {
            SkyletError::InvalidConfig("SubscriptionID is required by the aci backend".to_string())
        })?;
        let token = config.credentials.azure_token.clone().ok_or_else(|| {
            SkyletError::InvalidConfig("AZURE_ACCESS_TOKEN is required by the aci backend".to_string())
        })?;
        let base = Url::parse(BASE_URI)
            .map_err(|e| SkyletError::InvalidConfig(format!("invalid base uri: {e}")))?;

        Ok(Self {
            http: http_client()?,
            base,
            subscription_id,
            resource_group: config.cluster.clone(),
            location: config.region.clone(),
            token,
        })
    }

    fn url(&self, scope: &str, group: Option<&str>, suffix: &str) -> Result<Url, BackendError> {
        let mut path = format!(
            "subscriptions/{}/resourceGroups/{}/providers/Microsoft.ContainerInstance/containerGroups",
            self.subscription_id, scope
        );
        if let Some(group) = group {
            path.push('/');
            path.push_str(group);
        }
        path.push_str(suffix);

        let mut url = self
            .base
            .join(&path)
            .map_err(|e| BackendError::Permanent(format!("invalid url <{path}>: {e}")))?;
        url.query_pairs_mut().append_pair("api-version", API_VERSION);

        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http.request(method, url).bearer_auth(&self.token)
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response, BackendError> {
        let resp = req.send().await.map_err(from_reqwest)?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let body = resp.text().await.unwrap_or_default();
        let msg = match serde_json::from_str::<ArmErrorBody>(&body) {
            Ok(b) => format!("{}: {}", b.error.code, b.error.message),
            Err(_) => body,
        };

        Err(from_status(status, msg))
    }

    async fn put_group(
        &self,
        descriptor: &WorkloadDescriptor,
    ) -> Result<WorkloadHandle, BackendError> {
        let group = to_container_group(descriptor, &self.location)?;
        let url = self.url(&self.resource_group, Some(&descriptor.name), "")?;

        tracing::debug!("PUT container group <{}> to <{}>", descriptor.name, url);
        self.send(self.request(Method::PUT, url).json(&group)).await?;

        Ok(WorkloadHandle {
            scope: self.resource_group.clone(),
            id: descriptor.name.clone(),
            revision: descriptor
                .revision()
                .map_err(|e| BackendError::Permanent(e.to_string()))?,
        })
    }
}

#[async_trait]
impl BackendClient for AciClient {
    fn scope(&self) -> String {
        self.resource_group.clone()
    }

    async fn create_workload(
        &self,
        descriptor: &WorkloadDescriptor,
    ) -> Result<WorkloadHandle, BackendError> {
        self.put_group(descriptor).await
    }

    async fn delete_workload(&self, handle: &WorkloadHandle) -> Result<(), BackendError> {
        let url = self.url(&handle.scope, Some(&handle.id), "")?;
        match self.send(self.request(Method::DELETE, url)).await {
            Ok(_) => Ok(()),
            Err(BackendError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn get_workload_status(
        &self,
        handle: &WorkloadHandle,
    ) -> Result<ObservedStatus, BackendError> {
        let url = self.url(&handle.scope, Some(&handle.id), "")?;
        let group: ContainerGroup = self
            .send(self.request(Method::GET, url))
            .await?
            .json()
            .await
            .map_err(from_reqwest)?;

        Ok(to_observed(&group))
    }

    async fn list_workloads(
        &self,
        scope: &str,
    ) -> Result<Vec<(WorkloadHandle, ObservedStatus)>, BackendError> {
        let mut next = Some(self.url(scope, None, "")?);
        let mut workloads = vec![];

        while let Some(url) = next.take() {
            let page: ContainerGroupList = self
                .send(self.request(Method::GET, url))
                .await?
                .json()
                .await
                .map_err(from_reqwest)?;

            for group in page.value {
                let Some(name) = group.name.clone() else {
                    continue;
                };
                // Skip groups not created by skylet.
                if !group.tags.contains_key(TAG_NAMESPACE) || !group.tags.contains_key(TAG_NAME) {
                    continue;
                }

                let handle = WorkloadHandle {
                    scope: scope.to_string(),
                    id: name,
                    revision: group.tags.get(TAG_REVISION).cloned().unwrap_or_default(),
                };
                workloads.push((handle, to_observed(&group)));
            }

            next = match page.next_link {
                Some(link) => Some(Url::parse(&link).map_err(|e| {
                    BackendError::Permanent(format!("invalid nextLink <{link}>: {e}"))
                })?),
                None => None,
            };
        }

        Ok(workloads)
    }

    async fn fetch_logs(
        &self,
        handle: &WorkloadHandle,
        container: &str,
        tail: Option<usize>,
    ) -> Result<Bytes, BackendError> {
        let mut url = self.url(
            &handle.scope,
            Some(&handle.id),
            &format!("/containers/{container}/logs"),
        )?;
        if let Some(tail) = tail {
            url.query_pairs_mut().append_pair("tail", &tail.to_string());
        }

        let logs: Logs = self
            .send(self.request(Method::GET, url))
            .await?
            .json()
            .await
            .map_err(from_reqwest)?;

        Ok(Bytes::from(logs.content))
    }

    /// A PUT on an existing container group replaces it in place.
    fn supports_in_place_update(&self) -> bool {
        true
    }

    async fn update_workload(
        &self,
        handle: &WorkloadHandle,
        descriptor: &WorkloadDescriptor,
    ) -> Result<WorkloadHandle, BackendError> {
        if handle.id != descriptor.name {
            return Err(BackendError::Permanent(format!(
                "cannot update <{}> with workload <{}>",
                handle.id, descriptor.name
            )));
        }

        self.put_group(descriptor).await
    }
}
