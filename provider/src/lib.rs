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

//! A virtual-kubelet provider presenting an ECS cluster or an ACI resource
//! group as one Kubernetes node.

pub mod backend;
pub mod capacity;
pub mod model;
pub mod reconciler;
pub mod translator;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use k8s_openapi::api::core::v1::{NodeCondition, Pod, PodStatus};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use tokio_util::sync::CancellationToken;

use common::ctx::{OperatingSystem, ProviderConfig};
use common::SkyletError;

use crate::backend::BackendPtr;
use crate::capacity::CapacityReporter;
use crate::reconciler::{Reconciler, RetryPolicy};

pub type ProviderPtr = Arc<dyn Provider>;

/// The contract the node agent drives.
#[async_trait]
pub trait Provider: Send + Sync + 'static {
    async fn create_pod(&self, pod: &Pod, cancel: &CancellationToken) -> Result<(), SkyletError>;

    async fn update_pod(&self, pod: &Pod, cancel: &CancellationToken) -> Result<(), SkyletError>;

    async fn delete_pod(&self, pod: &Pod, cancel: &CancellationToken) -> Result<(), SkyletError>;

    async fn get_pod(
        &self,
        namespace: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Pod>, SkyletError>;

    async fn get_pod_status(
        &self,
        namespace: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<PodStatus>, SkyletError>;

    async fn get_pods(&self, cancel: &CancellationToken) -> Result<Vec<Pod>, SkyletError>;

    async fn get_container_logs(
        &self,
        namespace: &str,
        pod_name: &str,
        container: &str,
        tail: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<Bytes, SkyletError>;

    fn capacity(&self) -> BTreeMap<String, Quantity>;

    fn node_conditions(&self) -> Vec<NodeCondition>;

    fn operating_system(&self) -> String;
}

/// Builds the provider of the configured backend.
pub fn new(config: &ProviderConfig) -> Result<ProviderPtr, SkyletError> {
    tracing::info!("Starting provider with <{config}>");

    let backend = backend::new(config)?;
    Ok(Arc::new(CloudProvider::with_backend(
        backend,
        config,
        RetryPolicy::default(),
    )))
}

pub struct CloudProvider {
    reconciler: Reconciler,
    capacity: CapacityReporter,
    os: OperatingSystem,
}

impl CloudProvider {
    pub fn with_backend(backend: BackendPtr, config: &ProviderConfig, policy: RetryPolicy) -> Self {
        Self {
            reconciler: Reconciler::new(backend, config.operating_system, policy),
            capacity: CapacityReporter::new(config),
            os: config.operating_system,
        }
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }
}

#[async_trait]
impl Provider for CloudProvider {
    async fn create_pod(&self, pod: &Pod, cancel: &CancellationToken) -> Result<(), SkyletError> {
        self.reconciler.create_pod(pod, cancel).await?;
        Ok(())
    }

    async fn update_pod(&self, pod: &Pod, cancel: &CancellationToken) -> Result<(), SkyletError> {
        self.reconciler.update_pod(pod, cancel).await?;
        Ok(())
    }

    async fn delete_pod(&self, pod: &Pod, cancel: &CancellationToken) -> Result<(), SkyletError> {
        self.reconciler.delete_pod(pod, cancel).await
    }

    async fn get_pod(
        &self,
        namespace: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Pod>, SkyletError> {
        self.reconciler.get_pod(namespace, name, cancel).await
    }

    async fn get_pod_status(
        &self,
        namespace: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<PodStatus>, SkyletError> {
        self.reconciler.get_pod_status(namespace, name, cancel).await
    }

    async fn get_pods(&self, cancel: &CancellationToken) -> Result<Vec<Pod>, SkyletError> {
        self.reconciler.get_pods(cancel).await
    }

    async fn get_container_logs(
        &self,
        namespace: &str,
        pod_name: &str,
        container: &str,
        tail: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<Bytes, SkyletError> {
        self.reconciler
            .get_container_logs(namespace, pod_name, container, tail, cancel)
            .await
    }

    fn capacity(&self) -> BTreeMap<String, Quantity> {
        self.capacity.capacity()
    }

    fn node_conditions(&self) -> Vec<NodeCondition> {
        self.capacity.node_conditions()
    }

    fn operating_system(&self) -> String {
        self.os.to_string()
    }
}
