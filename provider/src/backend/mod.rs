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

mod aci;
mod ecs;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;

use common::ctx::{BackendKind, ProviderConfig};
use common::{BackendError, SkyletError};

pub use self::aci::AciClient;
pub use self::ecs::api::EcsApi;
pub use self::ecs::http::EcsHttpApi;
pub use self::ecs::EcsClient;

use crate::model::{ObservedStatus, WorkloadDescriptor, WorkloadHandle};

const HTTP_TIMEOUT_SECS: u64 = 30;

pub type BackendPtr = Arc<dyn BackendClient>;

/// Builds the client of the configured backend.
pub fn new(config: &ProviderConfig) -> Result<BackendPtr, SkyletError> {
    if config.region.is_empty() {
        return Err(SkyletError::InvalidConfig(format!(
            "region is required by the {} backend",
            config.backend
        )));
    }

    match config.backend {
        BackendKind::Ecs => Ok(Arc::new(EcsClient::new(
            Arc::new(EcsHttpApi::new(config)?),
            config,
        ))),
        BackendKind::Aci => Ok(Arc::new(AciClient::new(config)?)),
    }
}

#[async_trait]
pub trait BackendClient: Send + Sync + 'static {
    /// The scope workloads are created in: the ECS cluster or ACI resource group.
    fn scope(&self) -> String;

    async fn create_workload(
        &self,
        descriptor: &WorkloadDescriptor,
    ) -> Result<WorkloadHandle, BackendError>;

    /// Deleting a workload that is already gone succeeds.
    async fn delete_workload(&self, handle: &WorkloadHandle) -> Result<(), BackendError>;

    async fn get_workload_status(
        &self,
        handle: &WorkloadHandle,
    ) -> Result<ObservedStatus, BackendError>;

    async fn list_workloads(
        &self,
        scope: &str,
    ) -> Result<Vec<(WorkloadHandle, ObservedStatus)>, BackendError>;

    async fn fetch_logs(
        &self,
        handle: &WorkloadHandle,
        container: &str,
        tail: Option<usize>,
    ) -> Result<Bytes, BackendError>;

    /// Whether a deleted workload is gone or will never run again.
    async fn is_deleted(&self, handle: &WorkloadHandle) -> Result<bool, BackendError> {
        match self.get_workload_status(handle).await {
            Ok(status) => Ok(status.phase.is_terminal()),
            Err(BackendError::NotFound(_)) => Ok(true),
            Err(e) => Err(e),
        }
    }

    fn supports_in_place_update(&self) -> bool {
        false
    }

    async fn update_workload(
        &self,
        handle: &WorkloadHandle,
        _descriptor: &WorkloadDescriptor,
    ) -> Result<WorkloadHandle, BackendError> {
        Err(BackendError::Permanent(format!(
            "in-place update of <{}> is unsupported",
            handle.id
        )))
    }
}

pub(crate) fn http_client() -> Result<reqwest::Client, SkyletError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
        .build()
        .map_err(|e| SkyletError::Internal(format!("failed to build http client: {e}")))
}

/// Classifies a transport failure; anything that never got a response is
/// worth retrying.
pub(crate) fn from_reqwest(err: reqwest::Error) -> BackendError {
    match err.status() {
        Some(status) => from_status(status, err.to_string()),
        None if err.is_builder() => BackendError::Permanent(err.to_string()),
        None => BackendError::Transient(err.to_string()),
    }
}

pub(crate) fn from_status(status: StatusCode, msg: String) -> BackendError {
    match status {
        StatusCode::NOT_FOUND => BackendError::NotFound(msg),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            BackendError::Transient(format!("{status}: {msg}"))
        }
        s if s.is_server_error() => BackendError::Transient(format!("{status}: {msg}")),
        _ => BackendError::Permanent(format!("{status}: {msg}")),
    }
}

/// Keeps the last `tail` lines of a log.
pub(crate) fn tail_lines(content: &str, tail: Option<usize>) -> String {
    let Some(tail) = tail else {
        return content.to_string();
    };

    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(tail);
    let mut out = lines[start..].join("\n");
    if !out.is_empty() && content.ends_with('\n') {
        out.push('\n');
    }

    out
}
