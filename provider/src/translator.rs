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
use std::str::FromStr;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    Container, ContainerState, ContainerStateRunning, ContainerStateTerminated,
    ContainerStateWaiting, ContainerStatus, Pod, PodCondition, PodSpec, PodStatus,
    ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

use common::ctx::OperatingSystem;
use common::{quantity, SkyletError};

use crate::model::{
    ContainerDescriptor, ContainerPhase, EntryState, ObservedContainer, ObservedStatus,
    PodIdentity, PortMapping, Protocol, RestartPolicy, WorkloadDescriptor, WorkloadPhase,
};

const DEFAULT_CPU_MILLIS: u64 = 100;
const DEFAULT_MEMORY_BYTES: u64 = 128 * 1024 * 1024;
/// Per-container ceilings; larger requests cannot be placed by any backend.
const MAX_CPU_MILLIS: u64 = 1024 * 1000;
const MAX_MEMORY_BYTES: u64 = 64 * 1024 * 1024 * 1024 * 1024;

const RESOURCE_CPU: &str = "cpu";
const RESOURCE_MEMORY: &str = "memory";

const REASON_CONTAINER_CREATING: &str = "ContainerCreating";
const REASON_PROVIDER_FAILED: &str = "ProviderFailed";

fn reject(id: &PodIdentity, msg: impl AsRef<str>) -> SkyletError {
    SkyletError::Translation(format!("pod <{id}> {}", msg.as_ref()))
}

/// Translates a pod into the backend-agnostic workload that realizes it.
/// Features no backend can express are rejected here, before any backend
/// call is made.
pub fn to_descriptor(pod: &Pod, os: OperatingSystem) -> Result<WorkloadDescriptor, SkyletError> {
    let id = PodIdentity::from_pod(pod)?;
    let spec = pod.spec.as_ref().ok_or_else(|| reject(&id, "has no spec"))?;

    check_pod_features(&id, spec)?;

    if spec.containers.is_empty() {
        return Err(reject(&id, "has no containers"));
    }

    let containers = spec
        .containers
        .iter()
        .map(|c| to_container(&id, c))
        .collect::<Result<Vec<_>, _>>()?;

    let restart_policy = match spec.restart_policy.as_deref() {
        None | Some("") => RestartPolicy::default(),
        Some(p) => RestartPolicy::from_str(p)
            .map_err(|_| reject(&id, format!("has an invalid restart policy <{p}>")))?,
    };

    Ok(WorkloadDescriptor {
        name: id.workload_name(),
        namespace: id.namespace,
        pod_name: id.name,
        containers,
        restart_policy,
        operating_system: os,
    })
}

fn check_pod_features(id: &PodIdentity, spec: &PodSpec) -> Result<(), SkyletError> {
    if spec.init_containers.as_ref().is_some_and(|c| !c.is_empty()) {
        return Err(reject(id, "uses init containers, which are not supported"));
    }
    if spec
        .ephemeral_containers
        .as_ref()
        .is_some_and(|c| !c.is_empty())
    {
        return Err(reject(
            id,
            "uses ephemeral containers, which are not supported",
        ));
    }
    if spec.host_network == Some(true) {
        return Err(reject(id, "uses host networking, which is not supported"));
    }

    for volume in spec.volumes.iter().flatten() {
        if volume.empty_dir.is_none() {
            return Err(reject(
                id,
                format!("volume <{}> is not an emptyDir", volume.name),
            ));
        }
    }

    Ok(())
}

fn to_container(id: &PodIdentity, c: &Container) -> Result<ContainerDescriptor, SkyletError> {
    let image = c
        .image
        .clone()
        .filter(|i| !i.is_empty())
        .ok_or_else(|| reject(id, format!("container <{}> has no image", c.name)))?;

    let mut env = BTreeMap::new();
    for var in c.env.iter().flatten() {
        if var.value_from.is_some() {
            return Err(reject(
                id,
                format!(
                    "container <{}> sources env <{}> with valueFrom, which is not supported",
                    c.name, var.name
                ),
            ));
        }
        env.insert(var.name.clone(), var.value.clone().unwrap_or_default());
    }

    let mut ports = vec![];
    for p in c.ports.iter().flatten() {
        let port = u16::try_from(p.container_port)
            .ok()
            .filter(|port| *port > 0)
            .ok_or_else(|| {
                reject(
                    id,
                    format!(
                        "container <{}> has an invalid port <{}>",
                        c.name, p.container_port
                    ),
                )
            })?;
        let protocol = match p.protocol.as_deref() {
            None | Some("") => Protocol::Tcp,
            Some(proto) => Protocol::from_str(proto).map_err(|_| {
                reject(
                    id,
                    format!("container <{}> has an unsupported protocol <{proto}>", c.name),
                )
            })?,
        };
        ports.push(PortMapping { port, protocol });
    }

    let bad_quantity = |e: SkyletError| reject(id, format!("container <{}>: {e}", c.name));

    let cpu_millis = match resource(c.resources.as_ref(), RESOURCE_CPU) {
        Some(q) => quantity::cpu_millis(&q.0).map_err(bad_quantity)?,
        None => DEFAULT_CPU_MILLIS,
    };
    let memory_bytes = match resource(c.resources.as_ref(), RESOURCE_MEMORY) {
        Some(q) => quantity::memory_bytes(&q.0).map_err(bad_quantity)?,
        None => DEFAULT_MEMORY_BYTES,
    };
    if cpu_millis > MAX_CPU_MILLIS {
        return Err(reject(
            id,
            format!("container <{}> requests more than {MAX_CPU_MILLIS}m cpu", c.name),
        ));
    }
    if memory_bytes > MAX_MEMORY_BYTES {
        return Err(reject(
            id,
            format!("container <{}> requests more than {MAX_MEMORY_BYTES} bytes of memory", c.name),
        ));
    }

    Ok(ContainerDescriptor {
        name: c.name.clone(),
        image,
        cpu_millis,
        memory_bytes,
        command: c.command.clone().unwrap_or_default(),
        args: c.args.clone().unwrap_or_default(),
        env,
        ports,
        working_dir: c.working_dir.clone().filter(|d| !d.is_empty()),
    })
}

/// The request for a resource, falling back to its limit.
fn resource<'a>(r: Option<&'a ResourceRequirements>, name: &str) -> Option<&'a Quantity> {
    let r = r?;
    r.requests
        .as_ref()
        .and_then(|q| q.get(name))
        .or_else(|| r.limits.as_ref().and_then(|q| q.get(name)))
}

fn time(t: Option<DateTime<Utc>>) -> Option<Time> {
    t.map(Time)
}

fn pod_phase(state: EntryState, observed: WorkloadPhase) -> WorkloadPhase {
    match (state, observed) {
        (EntryState::Failed, _) => WorkloadPhase::Failed,
        (EntryState::Creating, WorkloadPhase::Unknown) => WorkloadPhase::Pending,
        (_, phase) => phase,
    }
}

fn container_state(
    observed: Option<&ObservedContainer>,
    phase: WorkloadPhase,
) -> (ContainerState, bool) {
    let Some(c) = observed else {
        let reason = match phase {
            WorkloadPhase::Failed => REASON_PROVIDER_FAILED,
            _ => REASON_CONTAINER_CREATING,
        };
        let state = ContainerState {
            waiting: Some(ContainerStateWaiting {
                reason: Some(reason.to_string()),
                message: None,
            }),
            ..Default::default()
        };
        return (state, false);
    };

    match c.phase {
        ContainerPhase::Waiting => (
            ContainerState {
                waiting: Some(ContainerStateWaiting {
                    reason: Some(
                        c.reason
                            .clone()
                            .unwrap_or(REASON_CONTAINER_CREATING.to_string()),
                    ),
                    message: None,
                }),
                ..Default::default()
            },
            false,
        ),
        ContainerPhase::Running => (
            ContainerState {
                running: Some(ContainerStateRunning {
                    started_at: time(c.started_at),
                }),
                ..Default::default()
            },
            phase == WorkloadPhase::Running,
        ),
        ContainerPhase::Terminated => (
            ContainerState {
                terminated: Some(ContainerStateTerminated {
                    exit_code: c.exit_code.unwrap_or_default(),
                    reason: c.reason.clone(),
                    started_at: time(c.started_at),
                    finished_at: time(c.finished_at),
                    ..Default::default()
                }),
                ..Default::default()
            },
            false,
        ),
    }
}

fn condition(type_: &str, ok: bool, at: Option<DateTime<Utc>>) -> PodCondition {
    PodCondition {
        type_: type_.to_string(),
        status: if ok { "True" } else { "False" }.to_string(),
        last_transition_time: time(at),
        ..Default::default()
    }
}

/// Builds the pod status for an observed workload. The result depends only
/// on the inputs; no clock is read, so repeated refreshes of an unchanged
/// workload yield equal statuses.
pub fn to_pod_status(
    observed: &ObservedStatus,
    descriptor: &WorkloadDescriptor,
    state: EntryState,
) -> PodStatus {
    let phase = pod_phase(state, observed.phase);

    let container_statuses: Vec<ContainerStatus> = descriptor
        .containers
        .iter()
        .map(|desired| {
            let live = observed.containers.iter().find(|c| c.name == desired.name);
            let (state, ready) = container_state(live, phase);
            ContainerStatus {
                name: desired.name.clone(),
                image: desired.image.clone(),
                image_id: String::new(),
                ready,
                started: Some(live.is_some_and(|c| c.phase == ContainerPhase::Running)),
                restart_count: live.map(|c| c.restart_count).unwrap_or_default(),
                state: Some(state),
                ..Default::default()
            }
        })
        .collect();

    let all_ready =
        !container_statuses.is_empty() && container_statuses.iter().all(|c| c.ready);
    let conditions = vec![
        condition("PodScheduled", true, observed.started_at),
        condition("Initialized", true, observed.started_at),
        condition("ContainersReady", all_ready, observed.started_at),
        condition("Ready", all_ready, observed.started_at),
    ];

    let reason = match state {
        EntryState::Failed => Some(REASON_PROVIDER_FAILED.to_string()),
        _ => None,
    };

    PodStatus {
        phase: Some(phase.to_string()),
        message: observed.message.clone(),
        reason,
        pod_ip: observed.ip.clone(),
        start_time: time(observed.started_at),
        conditions: Some(conditions),
        container_statuses: Some(container_statuses),
        ..Default::default()
    }
}

/// The status of an entry the backend has not acknowledged yet.
pub fn unacknowledged_status(
    descriptor: &WorkloadDescriptor,
    state: EntryState,
    last_error: Option<&str>,
) -> PodStatus {
    let phase = match state {
        EntryState::Failed => WorkloadPhase::Failed,
        _ => WorkloadPhase::Pending,
    };
    let observed = ObservedStatus {
        message: last_error.map(str::to_string),
        ..ObservedStatus::new(phase)
    };

    to_pod_status(&observed, descriptor, state)
}

/// The last received pod with its status replaced.
pub fn with_status(pod: &Pod, status: PodStatus) -> Pod {
    let mut pod = pod.clone();
    pod.status = Some(status);
    pod
}
