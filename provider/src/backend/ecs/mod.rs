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

//! ECS on the EC2 launch type. A pod maps to one task definition family,
//! named after the workload, and one task started from it.

pub mod api;
pub mod http;
mod sigv4;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use common::ctx::{OperatingSystem, ProviderConfig};
use common::BackendError;
use stdng::{lock_ptr, new_ptr, MutexPtr};

use self::api::*;
use crate::backend::BackendClient;
use crate::model::{
    ContainerPhase, ObservedContainer, ObservedStatus, WorkloadDescriptor, WorkloadHandle,
    WorkloadPhase, TAG_REVISION,
};

pub const STARTED_BY: &str = "skylet";
const LOG_STREAM_PREFIX: &str = "skylet";
const LAUNCH_TYPE: &str = "EC2";
const MAX_CLIENT_TOKEN_LEN: usize = 64;
const MAX_DESCRIBE_BATCH: usize = 100;
const MIB: u64 = 1024 * 1024;

pub type EcsApiPtr = Arc<dyn EcsApi>;

pub struct EcsClient {
    api: EcsApiPtr,
    cluster: String,
    region: String,
    log_group: String,
    execution_role_arn: Option<String>,
    /// Task definitions registered for runs that may still be retried,
    /// by client token.
    registered: MutexPtr<HashMap<String, String>>,
}

/// CPU units, where 1024 units are one vCPU.
fn cpu_units(millis: u64) -> Result<u64, BackendError> {
    millis
        .checked_mul(1024)
        .map(|units| units.div_ceil(1000).max(1))
        .ok_or_else(|| BackendError::Permanent(format!("cpu request of {millis}m is too large")))
}

fn memory_mib(bytes: u64) -> u64 {
    bytes.div_ceil(MIB).max(1)
}

/// The idempotency token of a run: stable for one identity and revision.
fn client_token(descriptor: &WorkloadDescriptor, revision: &str) -> String {
    let id = format!("{:08x}", crc32fast::hash(descriptor.identity().to_string().as_bytes()));
    let mut token = format!("{STARTED_BY}-{id}-{revision}");
    token.truncate(MAX_CLIENT_TOKEN_LEN);
    token
}

/// The task id is the last segment of the task ARN.
fn task_id(task_arn: &str) -> &str {
    task_arn.rsplit('/').next().unwrap_or(task_arn)
}

fn container_phase(status: Option<&str>) -> ContainerPhase {
    match status {
        Some("RUNNING") => ContainerPhase::Running,
        Some("STOPPED") => ContainerPhase::Terminated,
        _ => ContainerPhase::Waiting,
    }
}

fn to_observed(task: &Task) -> ObservedStatus {
    let containers: Vec<ObservedContainer> = task
        .containers
        .iter()
        .map(|c| ObservedContainer {
            name: c.name.clone(),
            phase: container_phase(c.last_status.as_deref()),
            exit_code: c.exit_code,
            restart_count: 0,
            reason: c.reason.clone(),
            started_at: to_datetime(task.started_at),
            finished_at: match c.last_status.as_deref() {
                Some("STOPPED") => to_datetime(task.stopped_at),
                _ => None,
            },
        })
        .collect();

    // Every container skylet registers is essential.
    let all_exited_ok = containers.iter().all(|c| c.exit_code == Some(0));

    let phase = match task.last_status.as_deref() {
        Some("PROVISIONING" | "PENDING" | "ACTIVATING") => WorkloadPhase::Pending,
        Some("RUNNING" | "DEACTIVATING" | "STOPPING" | "DEPROVISIONING") => WorkloadPhase::Running,
        Some("STOPPED") if all_exited_ok => WorkloadPhase::Succeeded,
        Some("STOPPED") => WorkloadPhase::Failed,
        _ => WorkloadPhase::Unknown,
    };

    let ip = task
        .containers
        .iter()
        .flat_map(|c| c.network_interfaces.iter())
        .find_map(|n| n.private_ipv4_address.clone());

    ObservedStatus {
        phase,
        message: task.stopped_reason.clone(),
        ip,
        started_at: to_datetime(task.started_at),
        containers,
    }
}

fn run_failure(failures: &[Failure]) -> BackendError {
    let Some(f) = failures.first() else {
        return BackendError::Permanent("RunTask started no task".to_string());
    };

    let reason = f.reason.clone().unwrap_or_default();
    let msg = format!("RunTask failed: {reason} {}", f.detail.clone().unwrap_or_default());
    // No container instance has room or is connected yet.
    if reason.starts_with("RESOURCE") || reason.starts_with("AGENT") {
        BackendError::Transient(msg)
    } else {
        BackendError::Permanent(msg)
    }
}

impl EcsClient {
    pub fn new(api: EcsApiPtr, config: &ProviderConfig) -> Self {
        Self {
            api,
            cluster: config.cluster.clone(),
            region: config.region.clone(),
            log_group: config.log_group.clone(),
            execution_role_arn: config.execution_role_arn.clone(),
            registered: new_ptr(HashMap::new()),
        }
    }

    fn task_definition(
        &self,
        descriptor: &WorkloadDescriptor,
        tags: &BTreeMap<String, String>,
    ) -> Result<RegisterTaskDefinitionRequest, BackendError> {
        let mut container_definitions = vec![];
        for c in &descriptor.containers {
            container_definitions.push(ContainerDefinition {
                name: c.name.clone(),
                image: c.image.clone(),
                cpu: cpu_units(c.cpu_millis)?,
                memory: memory_mib(c.memory_bytes),
                essential: true,
                entry_point: c.command.clone(),
                command: c.args.clone(),
                environment: c
                    .env
                    .iter()
                    .map(|(name, value)| KeyValuePair {
                        name: name.clone(),
                        value: value.clone(),
                    })
                    .collect(),
                port_mappings: c
                    .ports
                    .iter()
                    .map(|p| PortMapping {
                        container_port: p.port,
                        protocol: p.protocol.to_string().to_lowercase(),
                    })
                    .collect(),
                working_directory: c.working_dir.clone(),
                log_configuration: Some(LogConfiguration {
                    log_driver: "awslogs".to_string(),
                    options: BTreeMap::from([
                        ("awslogs-group".to_string(), self.log_group.clone()),
                        ("awslogs-region".to_string(), self.region.clone()),
                        (
                            "awslogs-stream-prefix".to_string(),
                            LOG_STREAM_PREFIX.to_string(),
                        ),
                        ("awslogs-create-group".to_string(), "true".to_string()),
                    ]),
                }),
            });
        }

        let (network_mode, os_family) = match descriptor.operating_system {
            OperatingSystem::Linux => (Some("bridge".to_string()), "LINUX"),
            OperatingSystem::Windows => (None, "WINDOWS_SERVER_2022_CORE"),
        };

        Ok(RegisterTaskDefinitionRequest {
            family: descriptor.name.clone(),
            container_definitions,
            requires_compatibilities: vec![LAUNCH_TYPE.to_string()],
            network_mode,
            runtime_platform: Some(RuntimePlatform {
                operating_system_family: os_family.to_string(),
            }),
            execution_role_arn: self.execution_role_arn.clone(),
            tags: to_tags(tags),
        })
    }

    /// The task definition of a run; retries of one run reuse the
    /// definition registered by the first attempt, so the client token
    /// keeps matching.
    async fn register(
        &self,
        token: &str,
        descriptor: &WorkloadDescriptor,
        tags: &BTreeMap<String, String>,
    ) -> Result<String, BackendError> {
        let cached = lock_ptr!(self.registered)?.get(token).cloned();
        if let Some(arn) = cached {
            tracing::debug!("Reuse task definition <{arn}> for <{}>", descriptor.name);
            return Ok(arn);
        }

        let registered = self
            .api
            .register_task_definition(&self.task_definition(descriptor, tags)?)
            .await?;
        let arn = registered.task_definition.task_definition_arn;
        tracing::debug!("Registered task definition <{arn}> for <{}>", descriptor.name);

        lock_ptr!(self.registered)?.insert(token.to_string(), arn.clone());
        Ok(arn)
    }

    /// Drops the remembered task definition of a run that will not be retried.
    fn forget(&self, token: &str) -> Result<(), BackendError> {
        lock_ptr!(self.registered)?.remove(token);
        Ok(())
    }

    async fn describe(&self, cluster: &str, arns: &[String]) -> Result<DescribeTasksResponse, BackendError> {
        self.api
            .describe_tasks(&DescribeTasksRequest {
                cluster: cluster.to_string(),
                tasks: arns.to_vec(),
                include: vec!["TAGS".to_string()],
            })
            .await
    }

    async fn describe_one(&self, handle: &WorkloadHandle) -> Result<Task, BackendError> {
        let resp = self.describe(&handle.scope, &[handle.id.clone()]).await?;
        if let Some(task) = resp.tasks.into_iter().next() {
            return Ok(task);
        }

        match resp.failures.first() {
            Some(f) if f.is_missing() => Err(BackendError::NotFound(handle.id.clone())),
            Some(f) => Err(BackendError::Permanent(format!(
                "DescribeTasks failed for <{}>: {}",
                handle.id,
                f.reason.clone().unwrap_or_default()
            ))),
            None => Err(BackendError::NotFound(handle.id.clone())),
        }
    }

    async fn deregister(&self, task_definition: &str) {
        let req = DeregisterTaskDefinitionRequest {
            task_definition: task_definition.to_string(),
        };
        if let Err(e) = self.api.deregister_task_definition(&req).await {
            tracing::warn!("Failed to deregister task definition <{task_definition}>: {e}");
        }
    }

    async fn list_arns(&self, scope: &str, desired_status: &str) -> Result<Vec<String>, BackendError> {
        let mut arns = vec![];
        let mut next_token = None;

        loop {
            let resp = self
                .api
                .list_tasks(&ListTasksRequest {
                    cluster: scope.to_string(),
                    started_by: Some(STARTED_BY.to_string()),
                    desired_status: Some(desired_status.to_string()),
                    next_token: next_token.take(),
                })
                .await?;
            arns.extend(resp.task_arns);

            match resp.next_token {
                Some(token) if !token.is_empty() => next_token = Some(token),
                _ => break,
            }
        }

        Ok(arns)
    }
}

#[async_trait]
impl BackendClient for EcsClient {
    fn scope(&self) -> String {
        self.cluster.clone()
    }

    async fn create_workload(
        &self,
        descriptor: &WorkloadDescriptor,
    ) -> Result<WorkloadHandle, BackendError> {
        let invalid = |e: common::SkyletError| BackendError::Permanent(e.to_string());
        let revision = descriptor.revision().map_err(invalid)?;
        let tags = descriptor.tags().map_err(invalid)?;

        let token = client_token(descriptor, &revision);
        let task_definition = self.register(&token, descriptor, &tags).await?;

        let run = self
            .api
            .run_task(&RunTaskRequest {
                cluster: self.cluster.clone(),
                task_definition: task_definition.clone(),
                count: 1,
                launch_type: LAUNCH_TYPE.to_string(),
                started_by: STARTED_BY.to_string(),
                client_token: token.clone(),
                tags: to_tags(&tags),
            })
            .await;

        let res = match run {
            Ok(resp) => match resp.tasks.into_iter().next() {
                Some(task) => Ok(task),
                None => Err(run_failure(&resp.failures)),
            },
            Err(e) => Err(e),
        };

        // A transient failure is retried with the same task definition;
        // the run may have started a task that the retry must find again.
        let task = match res {
            Ok(task) => {
                self.forget(&token)?;
                task
            }
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => {
                self.forget(&token)?;
                self.deregister(&task_definition).await;
                return Err(e);
            }
        };

        Ok(WorkloadHandle {
            scope: self.cluster.clone(),
            id: task.task_arn,
            revision,
        })
    }

    async fn delete_workload(&self, handle: &WorkloadHandle) -> Result<(), BackendError> {
        let task = match self.describe_one(handle).await {
            Ok(task) => task,
            Err(BackendError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        if task.last_status.as_deref() != Some("STOPPED") {
            let req = StopTaskRequest {
                cluster: handle.scope.clone(),
                task: handle.id.clone(),
                reason: "Deleted by skylet".to_string(),
            };
            match self.api.stop_task(&req).await {
                Ok(()) | Err(BackendError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        if !task.task_definition_arn.is_empty() {
            self.deregister(&task.task_definition_arn).await;
        }

        Ok(())
    }

    async fn get_workload_status(
        &self,
        handle: &WorkloadHandle,
    ) -> Result<ObservedStatus, BackendError> {
        Ok(to_observed(&self.describe_one(handle).await?))
    }

    /// A stopped task lingers in STOPPING for up to its stop timeout; the
    /// STOPPED desired status already guarantees it will not run again.
    async fn is_deleted(&self, handle: &WorkloadHandle) -> Result<bool, BackendError> {
        match self.describe_one(handle).await {
            Ok(task) => Ok(task.last_status.as_deref() == Some("STOPPED")
                || task.desired_status.as_deref() == Some("STOPPED")),
            Err(BackendError::NotFound(_)) => Ok(true),
            Err(e) => Err(e),
        }
    }

    async fn list_workloads(
        &self,
        scope: &str,
    ) -> Result<Vec<(WorkloadHandle, ObservedStatus)>, BackendError> {
        let mut arns = self.list_arns(scope, "RUNNING").await?;
        arns.extend(self.list_arns(scope, "STOPPED").await?);

        let mut workloads = vec![];
        for batch in arns.chunks(MAX_DESCRIBE_BATCH) {
            let resp = self.describe(scope, batch).await?;
            for task in resp.tasks {
                let tags = from_tags(&task.tags);
                let handle = WorkloadHandle {
                    scope: scope.to_string(),
                    id: task.task_arn.clone(),
                    revision: tags.get(TAG_REVISION).cloned().unwrap_or_default(),
                };
                workloads.push((handle, to_observed(&task)));
            }
        }

        Ok(workloads)
    }

    async fn fetch_logs(
        &self,
        handle: &WorkloadHandle,
        container: &str,
        tail: Option<usize>,
    ) -> Result<Bytes, BackendError> {
        let req = GetLogEventsRequest {
            log_group_name: self.log_group.clone(),
            log_stream_name: format!("{LOG_STREAM_PREFIX}/{container}/{}", task_id(&handle.id)),
            limit: tail,
            start_from_head: tail.is_none(),
        };

        let resp = self.api.get_log_events(&req).await?;
        let mut out = String::new();
        for event in resp.events {
            out.push_str(&event.message);
            if !event.message.ends_with('\n') {
                out.push('\n');
            }
        }

        Ok(Bytes::from(out))
    }
}
