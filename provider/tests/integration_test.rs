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

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio_util::sync::CancellationToken;

use common::ctx::ProviderConfig;
use common::{BackendError, SkyletError};
use skylet::backend::{BackendClient, BackendPtr};
use skylet::model::{
    EntryState, ObservedStatus, WorkloadDescriptor, WorkloadHandle, WorkloadPhase,
};
use skylet::reconciler::RetryPolicy;
use skylet::{CloudProvider, Provider};
use stdng::backoff::Backoff;

const SCOPE: &str = "test-cluster";

const CREATE: &str = "create";
const DELETE: &str = "delete";
const STATUS: &str = "status";
const LIST: &str = "list";
const LOGS: &str = "logs";
const UPDATE: &str = "update";

#[derive(Default)]
struct FakeState {
    workloads: HashMap<String, (WorkloadDescriptor, ObservedStatus)>,
    calls: HashMap<&'static str, usize>,
    failures: HashMap<&'static str, VecDeque<BackendError>>,
    hidden: HashSet<String>,
    /// Deleted workloads and the status polls they still answer.
    lingering: HashMap<String, usize>,
    in_flight: HashSet<String>,
    overlaps: usize,
    next_id: u64,
}

/// An in-memory backend counting calls, with injectable failures.
#[derive(Default)]
struct FakeBackend {
    state: Mutex<FakeState>,
    latency: Duration,
    in_place: bool,
    /// Status polls a deleted workload keeps answering before it is gone.
    linger_polls: usize,
}

/// The workload name a handle id was minted from.
fn workload_of(id: &str) -> String {
    id.rsplit_once('#')
        .map(|(name, _)| name.to_string())
        .unwrap_or(id.to_string())
}

impl FakeBackend {
    fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Default::default()
        }
    }

    fn fail(&self, op: &'static str, err: BackendError, times: usize) {
        let mut state = self.state.lock().unwrap();
        state
            .failures
            .entry(op)
            .or_default()
            .extend((0..times).map(|_| err.clone()));
    }

    fn hide(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.hidden.insert(name.to_string());
    }

    fn calls(&self, op: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.calls.get(op).copied().unwrap_or_default()
    }

    fn total_calls(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.calls.values().sum()
    }

    fn overlaps(&self) -> usize {
        self.state.lock().unwrap().overlaps
    }

    fn workload_count(&self) -> usize {
        self.state.lock().unwrap().workloads.len()
    }

    fn images(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .workloads
            .values()
            .flat_map(|(desc, _)| desc.containers.iter().map(|c| c.image.clone()))
            .collect()
    }

    /// Records the call and returns the next injected failure, if any.
    fn begin(&self, op: &'static str) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        *state.calls.entry(op).or_default() += 1;
        match state.failures.get_mut(op).and_then(|q| q.pop_front()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Runs a mutating call on `name`, flagging any concurrent call on it.
    async fn exclusive<T>(&self, name: &str, f: impl FnOnce(&mut FakeState) -> T) -> T {
        {
            let mut state = self.state.lock().unwrap();
            if !state.in_flight.insert(name.to_string()) {
                state.overlaps += 1;
            }
        }

        tokio::time::sleep(self.latency).await;

        let mut state = self.state.lock().unwrap();
        let res = f(&mut *state);
        state.in_flight.remove(name);
        res
    }
}

fn revision(desc: &WorkloadDescriptor) -> Result<String, BackendError> {
    desc.revision()
        .map_err(|e| BackendError::Permanent(e.to_string()))
}

#[async_trait]
impl BackendClient for FakeBackend {
    fn scope(&self) -> String {
        SCOPE.to_string()
    }

    async fn create_workload(
        &self,
        descriptor: &WorkloadDescriptor,
    ) -> Result<WorkloadHandle, BackendError> {
        self.begin(CREATE)?;
        let revision = revision(descriptor)?;

        self.exclusive(&descriptor.name, |state| {
            state.next_id += 1;
            let id = format!("{}#{}", descriptor.name, state.next_id);
            let observed = ObservedStatus {
                ip: Some("10.0.0.1".to_string()),
                ..ObservedStatus::new(WorkloadPhase::Running)
            };
            state
                .workloads
                .insert(id.clone(), (descriptor.clone(), observed));

            Ok(WorkloadHandle {
                scope: SCOPE.to_string(),
                id,
                revision,
            })
        })
        .await
    }

    async fn delete_workload(&self, handle: &WorkloadHandle) -> Result<(), BackendError> {
        self.begin(DELETE)?;

        let linger = self.linger_polls;
        self.exclusive(&workload_of(&handle.id), |state| {
            if linger == 0 {
                state.workloads.remove(&handle.id);
            } else if state.workloads.contains_key(&handle.id) {
                state.lingering.entry(handle.id.clone()).or_insert(linger);
            }
            Ok(())
        })
        .await
    }

    async fn get_workload_status(
        &self,
        handle: &WorkloadHandle,
    ) -> Result<ObservedStatus, BackendError> {
        self.begin(STATUS)?;

        let mut state = self.state.lock().unwrap();
        if let Some(polls) = state.lingering.get_mut(&handle.id) {
            if *polls == 0 {
                state.lingering.remove(&handle.id);
                state.workloads.remove(&handle.id);
            } else {
                *polls -= 1;
            }
        }
        state
            .workloads
            .get(&handle.id)
            .map(|(_, observed)| observed.clone())
            .ok_or(BackendError::NotFound(handle.id.clone()))
    }

    async fn list_workloads(
        &self,
        scope: &str,
    ) -> Result<Vec<(WorkloadHandle, ObservedStatus)>, BackendError> {
        self.begin(LIST)?;

        let state = self.state.lock().unwrap();
        let mut res = vec![];
        for (id, (desc, observed)) in &state.workloads {
            if state.hidden.contains(&desc.name) {
                continue;
            }
            let handle = WorkloadHandle {
                scope: scope.to_string(),
                id: id.clone(),
                revision: revision(desc)?,
            };
            res.push((handle, observed.clone()));
        }
        Ok(res)
    }

    async fn fetch_logs(
        &self,
        handle: &WorkloadHandle,
        container: &str,
        tail: Option<usize>,
    ) -> Result<Bytes, BackendError> {
        self.begin(LOGS)?;

        let lines: Vec<String> = (1..=3)
            .map(|i| format!("{container}@{}: line {i}", handle.id))
            .collect();
        let skip = tail.map(|n| lines.len().saturating_sub(n)).unwrap_or(0);
        Ok(Bytes::from(lines[skip..].join("\n")))
    }

    fn supports_in_place_update(&self) -> bool {
        self.in_place
    }

    async fn update_workload(
        &self,
        handle: &WorkloadHandle,
        descriptor: &WorkloadDescriptor,
    ) -> Result<WorkloadHandle, BackendError> {
        self.begin(UPDATE)?;
        let revision = revision(descriptor)?;

        self.exclusive(&descriptor.name, |state| {
            let Some(entry) = state.workloads.get_mut(&handle.id) else {
                return Err(BackendError::NotFound(handle.id.clone()));
            };
            entry.0 = descriptor.clone();

            Ok(WorkloadHandle {
                revision,
                ..handle.clone()
            })
        })
        .await
    }
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        backoff: Backoff {
            max_attempts: 5,
            base: Duration::ZERO,
            cap: Duration::ZERO,
        },
        confirm_attempts: 3,
        confirm_interval: Duration::ZERO,
    }
}

fn new_provider(backend: &Arc<FakeBackend>) -> CloudProvider {
    new_provider_with(backend, fast_policy())
}

fn new_provider_with(backend: &Arc<FakeBackend>, policy: RetryPolicy) -> CloudProvider {
    let config = ProviderConfig {
        region: "us-east-1".to_string(),
        cluster: SCOPE.to_string(),
        ..Default::default()
    };
    let backend: BackendPtr = backend.clone();
    CloudProvider::with_backend(backend, &config, policy)
}

fn new_pod(name: &str, image: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "app".to_string(),
                image: Some(image.to_string()),
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn phase_of(pod: &Pod) -> Option<String> {
    pod.status.as_ref().and_then(|s| s.phase.clone())
}

#[tokio::test]
async fn test_create_pod_twice() -> Result<(), SkyletError> {
    let backend = Arc::new(FakeBackend::default());
    let provider = new_provider(&backend);
    let cancel = CancellationToken::new();
    let pod = new_pod("nginx", "nginx:1.27");

    let first = provider.reconciler().create_pod(&pod, &cancel).await?;
    let second = provider.reconciler().create_pod(&pod, &cancel).await?;

    assert_eq!(first, second);
    assert_eq!(backend.calls(CREATE), 1);
    assert_eq!(backend.workload_count(), 1);

    Ok(())
}

#[tokio::test]
async fn test_delete_unknown_pod() -> Result<(), SkyletError> {
    let backend = Arc::new(FakeBackend::default());
    let provider = new_provider(&backend);
    let cancel = CancellationToken::new();
    let pod = new_pod("nginx", "nginx:1.27");

    provider.delete_pod(&pod, &cancel).await?;
    assert_eq!(backend.total_calls(), 0);

    provider.create_pod(&pod, &cancel).await?;
    provider.delete_pod(&pod, &cancel).await?;
    provider.delete_pod(&pod, &cancel).await?;

    assert_eq!(backend.calls(DELETE), 1);
    assert_eq!(backend.workload_count(), 0);
    assert!(provider.get_pod("default", "nginx", &cancel).await?.is_none());

    Ok(())
}

#[tokio::test]
async fn test_get_unknown_pod() -> Result<(), SkyletError> {
    let backend = Arc::new(FakeBackend::default());
    let provider = new_provider(&backend);
    let cancel = CancellationToken::new();

    assert!(provider.get_pod("default", "nginx", &cancel).await?.is_none());
    assert!(provider
        .get_pod_status("default", "nginx", &cancel)
        .await?
        .is_none());
    assert!(provider.get_pods(&cancel).await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_get_pod() -> Result<(), SkyletError> {
    let backend = Arc::new(FakeBackend::default());
    let provider = new_provider(&backend);
    let cancel = CancellationToken::new();
    provider.create_pod(&new_pod("nginx", "nginx:1.27"), &cancel).await?;

    let pod = provider.get_pod("default", "nginx", &cancel).await?;
    assert_eq!(pod.as_ref().and_then(phase_of), Some("Running".to_string()));
    assert_eq!(
        pod.as_ref()
            .and_then(|p| p.status.as_ref())
            .and_then(|s| s.pod_ip.clone()),
        Some("10.0.0.1".to_string())
    );

    // Repeated refreshes of an unchanged workload agree.
    let a = provider.get_pod_status("default", "nginx", &cancel).await?;
    let b = provider.get_pod_status("default", "nginx", &cancel).await?;
    assert_eq!(a, b);

    Ok(())
}

#[tokio::test]
async fn test_backend_unreachable() -> Result<(), SkyletError> {
    let backend = Arc::new(FakeBackend::default());
    let provider = new_provider(&backend);
    let cancel = CancellationToken::new();
    provider.create_pod(&new_pod("nginx", "nginx:1.27"), &cancel).await?;

    backend.fail(
        STATUS,
        BackendError::Transient("connection refused".to_string()),
        100,
    );

    let res = provider.get_pod("default", "nginx", &cancel).await;
    assert!(matches!(
        res.as_ref().map_err(|e| e.root()),
        Err(SkyletError::Backend(BackendError::Transient(_)))
    ));
    assert_eq!(backend.calls(STATUS), 5);

    Ok(())
}

#[tokio::test]
async fn test_update_unchanged_pod() -> Result<(), SkyletError> {
    let backend = Arc::new(FakeBackend::default());
    let provider = new_provider(&backend);
    let cancel = CancellationToken::new();
    let pod = new_pod("nginx", "nginx:1.27");

    provider.create_pod(&pod, &cancel).await?;
    let before = backend.total_calls();

    provider.update_pod(&pod, &cancel).await?;
    assert_eq!(backend.total_calls(), before);

    Ok(())
}

#[tokio::test]
async fn test_update_recreates_workload() -> Result<(), SkyletError> {
    let backend = Arc::new(FakeBackend::default());
    let provider = new_provider(&backend);
    let cancel = CancellationToken::new();

    provider.create_pod(&new_pod("nginx", "nginx:1.27"), &cancel).await?;
    let old = provider.reconciler().entries()?;

    provider.update_pod(&new_pod("nginx", "nginx:1.28"), &cancel).await?;
    let new = provider.reconciler().entries()?;

    assert_eq!(backend.calls(CREATE), 2);
    assert_eq!(backend.calls(DELETE), 1);
    assert_eq!(backend.calls(UPDATE), 0);
    assert_eq!(backend.workload_count(), 1);

    assert_eq!(new.len(), 1);
    assert_eq!(new[0].state, EntryState::Present);
    assert_eq!(new[0].desired.containers[0].image, "nginx:1.28");
    assert_ne!(
        old[0].handle.as_ref().map(|h| &h.id),
        new[0].handle.as_ref().map(|h| &h.id)
    );

    Ok(())
}

#[tokio::test]
async fn test_update_in_place() -> Result<(), SkyletError> {
    let backend = Arc::new(FakeBackend {
        in_place: true,
        ..Default::default()
    });
    let provider = new_provider(&backend);
    let cancel = CancellationToken::new();

    provider.create_pod(&new_pod("nginx", "nginx:1.27"), &cancel).await?;
    let old = provider.reconciler().entries()?;

    provider.update_pod(&new_pod("nginx", "nginx:1.28"), &cancel).await?;
    let new = provider.reconciler().entries()?;

    assert_eq!(backend.calls(CREATE), 1);
    assert_eq!(backend.calls(DELETE), 0);
    assert_eq!(backend.calls(UPDATE), 1);

    let (Some(old), Some(new)) = (old[0].handle.as_ref(), new[0].handle.as_ref()) else {
        return Err(SkyletError::Internal("missing handle".to_string()));
    };
    assert_eq!(old.id, new.id);
    assert_ne!(old.revision, new.revision);

    Ok(())
}

#[tokio::test]
async fn test_failed_recreate_is_retried() -> Result<(), SkyletError> {
    let backend = Arc::new(FakeBackend::default());
    let provider = new_provider(&backend);
    let cancel = CancellationToken::new();

    provider.create_pod(&new_pod("nginx", "nginx:1.27"), &cancel).await?;
    backend.fail(DELETE, BackendError::Permanent("denied".to_string()), 1);

    let pod = new_pod("nginx", "nginx:1.28");
    assert!(provider.update_pod(&pod, &cancel).await.is_err());
    let entries = provider.reconciler().entries()?;
    assert_eq!(entries[0].state, EntryState::Failed);
    assert_eq!(backend.images(), vec!["nginx:1.27"]);

    // The same pod again is not mistaken for an applied update.
    provider.update_pod(&pod, &cancel).await?;
    assert_eq!(backend.calls(DELETE), 2);
    assert_eq!(backend.calls(CREATE), 2);
    assert_eq!(backend.images(), vec!["nginx:1.28"]);

    let entries = provider.reconciler().entries()?;
    assert_eq!(entries[0].state, EntryState::Present);
    assert_eq!(entries[0].desired.containers[0].image, "nginx:1.28");

    Ok(())
}

#[tokio::test]
async fn test_failed_recreate_without_workload_is_retried() -> Result<(), SkyletError> {
    let backend = Arc::new(FakeBackend::default());
    let provider = new_provider(&backend);
    let cancel = CancellationToken::new();

    provider.create_pod(&new_pod("nginx", "nginx:1.27"), &cancel).await?;
    backend.fail(CREATE, BackendError::Permanent("quota".to_string()), 1);

    let pod = new_pod("nginx", "nginx:1.28");
    assert!(provider.update_pod(&pod, &cancel).await.is_err());
    assert_eq!(backend.workload_count(), 0);
    assert!(provider.reconciler().entries()?[0].handle.is_none());

    provider.update_pod(&pod, &cancel).await?;
    assert_eq!(backend.calls(CREATE), 3);
    assert_eq!(backend.images(), vec!["nginx:1.28"]);

    Ok(())
}

#[tokio::test]
async fn test_failed_in_place_update_is_retried() -> Result<(), SkyletError> {
    let backend = Arc::new(FakeBackend {
        in_place: true,
        ..Default::default()
    });
    let provider = new_provider(&backend);
    let cancel = CancellationToken::new();

    provider.create_pod(&new_pod("nginx", "nginx:1.27"), &cancel).await?;
    backend.fail(UPDATE, BackendError::Permanent("invalid".to_string()), 1);

    let pod = new_pod("nginx", "nginx:1.28");
    assert!(provider.update_pod(&pod, &cancel).await.is_err());
    assert_eq!(provider.reconciler().entries()?[0].state, EntryState::Failed);

    provider.update_pod(&pod, &cancel).await?;
    assert_eq!(backend.calls(UPDATE), 2);
    assert_eq!(backend.images(), vec!["nginx:1.28"]);
    assert_eq!(provider.reconciler().entries()?[0].state, EntryState::Present);

    // Now it is applied, and the same pod is a no-op.
    provider.update_pod(&pod, &cancel).await?;
    assert_eq!(backend.calls(UPDATE), 2);

    Ok(())
}

#[tokio::test]
async fn test_cancelled_update_restores_entry() -> Result<(), SkyletError> {
    let backend = Arc::new(FakeBackend {
        latency: Duration::from_millis(100),
        in_place: true,
        ..Default::default()
    });
    let provider = new_provider(&backend);
    let cancel = CancellationToken::new();

    provider.create_pod(&new_pod("nginx", "nginx:1.27"), &cancel).await?;
    let before = provider.reconciler().entries()?;

    let pod = new_pod("nginx", "nginx:1.28");
    let update_cancel = CancellationToken::new();
    let (res, _) = tokio::join!(provider.update_pod(&pod, &update_cancel), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        update_cancel.cancel();
    });
    assert!(matches!(
        res.as_ref().map_err(|e| e.root()),
        Err(SkyletError::Cancelled(_))
    ));

    let after = provider.reconciler().entries()?;
    assert_eq!(after[0].state, EntryState::Present);
    assert_eq!(after[0].desired, before[0].desired);
    assert_eq!(after[0].handle, before[0].handle);

    provider.update_pod(&pod, &cancel).await?;
    assert_eq!(backend.images(), vec!["nginx:1.28"]);

    Ok(())
}

#[tokio::test]
async fn test_update_unknown_pod_creates() -> Result<(), SkyletError> {
    let backend = Arc::new(FakeBackend::default());
    let provider = new_provider(&backend);
    let cancel = CancellationToken::new();

    provider.update_pod(&new_pod("nginx", "nginx:1.27"), &cancel).await?;

    assert_eq!(backend.calls(CREATE), 1);
    assert_eq!(provider.reconciler().entries()?.len(), 1);

    Ok(())
}

#[tokio::test]
async fn test_concurrent_create_delete() -> Result<(), SkyletError> {
    let backend = Arc::new(FakeBackend::with_latency(Duration::from_millis(10)));
    let provider = new_provider(&backend);
    let cancel = CancellationToken::new();
    let pod = new_pod("nginx", "nginx:1.27");

    let ops = (0..16).map(|i| {
        let provider = &provider;
        let pod = &pod;
        let cancel = &cancel;
        async move {
            if i % 2 == 0 {
                provider.create_pod(pod, cancel).await
            } else {
                provider.delete_pod(pod, cancel).await
            }
        }
    });

    for res in join_all(ops).await {
        res?;
    }

    assert_eq!(backend.overlaps(), 0);
    assert!(backend.calls(CREATE) >= 1);

    Ok(())
}

#[tokio::test]
async fn test_different_pods_in_parallel() -> Result<(), SkyletError> {
    let backend = Arc::new(FakeBackend::with_latency(Duration::from_millis(10)));
    let provider = new_provider(&backend);
    let cancel = CancellationToken::new();

    let pods: Vec<Pod> = (0..8).map(|i| new_pod(&format!("pod-{i}"), "busybox")).collect();
    let ops = pods.iter().map(|pod| provider.create_pod(pod, &cancel));
    for res in join_all(ops).await {
        res?;
    }

    assert_eq!(backend.calls(CREATE), 8);
    assert_eq!(provider.get_pods(&cancel).await?.len(), 8);

    Ok(())
}

#[tokio::test]
async fn test_transient_failures_are_retried() -> Result<(), SkyletError> {
    let backend = Arc::new(FakeBackend::default());
    let provider = new_provider(&backend);
    let cancel = CancellationToken::new();

    backend.fail(CREATE, BackendError::Transient("throttled".to_string()), 2);
    provider.create_pod(&new_pod("nginx", "nginx:1.27"), &cancel).await?;

    assert_eq!(backend.calls(CREATE), 3);
    let entries = provider.reconciler().entries()?;
    assert_eq!(entries[0].state, EntryState::Present);
    assert!(entries[0].handle.is_some());

    Ok(())
}

#[tokio::test]
async fn test_permanent_failure() -> Result<(), SkyletError> {
    let backend = Arc::new(FakeBackend::default());
    let provider = new_provider(&backend);
    let cancel = CancellationToken::new();
    let pod = new_pod("nginx", "nginx:1.27");

    backend.fail(CREATE, BackendError::Permanent("bad image".to_string()), 1);
    let res = provider.create_pod(&pod, &cancel).await;

    assert!(matches!(
        res.as_ref().map_err(|e| e.root()),
        Err(SkyletError::Backend(BackendError::Permanent(_)))
    ));
    assert_eq!(backend.calls(CREATE), 1);

    let entries = provider.reconciler().entries()?;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].state, EntryState::Failed);
    assert!(entries[0].handle.is_none());

    let status = provider.get_pod_status("default", "nginx", &cancel).await?;
    assert_eq!(
        status.as_ref().and_then(|s| s.phase.clone()),
        Some("Failed".to_string())
    );
    assert_eq!(
        status.and_then(|s| s.reason),
        Some("ProviderFailed".to_string())
    );

    // A later create re-drives the failed entry.
    provider.create_pod(&pod, &cancel).await?;
    assert_eq!(backend.calls(CREATE), 2);
    assert_eq!(
        provider.reconciler().entries()?[0].state,
        EntryState::Present
    );

    Ok(())
}

#[tokio::test]
async fn test_rejected_pod_is_not_recorded() -> Result<(), SkyletError> {
    let backend = Arc::new(FakeBackend::default());
    let provider = new_provider(&backend);
    let cancel = CancellationToken::new();

    let mut pod = new_pod("nginx", "nginx:1.27");
    if let Some(spec) = pod.spec.as_mut() {
        spec.host_network = Some(true);
    }

    let res = provider.create_pod(&pod, &cancel).await;
    assert!(matches!(
        res.as_ref().map_err(|e| e.root()),
        Err(SkyletError::Translation(_))
    ));
    assert_eq!(backend.total_calls(), 0);
    assert!(provider.reconciler().entries()?.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_get_pods_degrades_to_unknown() -> Result<(), SkyletError> {
    let backend = Arc::new(FakeBackend::default());
    let provider = new_provider(&backend);
    let cancel = CancellationToken::new();

    provider.create_pod(&new_pod("web", "nginx:1.27"), &cancel).await?;
    provider.create_pod(&new_pod("db", "postgres:16"), &cancel).await?;

    // The listing misses "db" and its lookup fails.
    backend.hide("skylet-default-db");
    backend.fail(STATUS, BackendError::Permanent("denied".to_string()), 1);

    let pods = provider.get_pods(&cancel).await?;
    assert_eq!(pods.len(), 2);

    let phase = |name: &str| {
        pods.iter()
            .find(|p| p.metadata.name.as_deref() == Some(name))
            .and_then(phase_of)
    };
    assert_eq!(phase("web"), Some("Running".to_string()));
    assert_eq!(phase("db"), Some("Unknown".to_string()));
    assert_eq!(backend.calls(LIST), 1);

    Ok(())
}

#[tokio::test]
async fn test_get_pods_drops_vanished_workloads() -> Result<(), SkyletError> {
    let backend = Arc::new(FakeBackend::default());
    let provider = new_provider(&backend);
    let cancel = CancellationToken::new();

    provider.create_pod(&new_pod("web", "nginx:1.27"), &cancel).await?;
    backend.state.lock().unwrap().workloads.clear();

    assert!(provider.get_pods(&cancel).await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_unconfirmed_delete() -> Result<(), SkyletError> {
    let backend = Arc::new(FakeBackend {
        linger_polls: usize::MAX,
        ..Default::default()
    });
    let provider = new_provider(&backend);
    let cancel = CancellationToken::new();
    let pod = new_pod("nginx", "nginx:1.27");

    provider.create_pod(&pod, &cancel).await?;
    let res = provider.delete_pod(&pod, &cancel).await;

    assert!(matches!(
        res.as_ref().map_err(|e| e.root()),
        Err(SkyletError::InvalidState(_))
    ));
    assert_eq!(backend.calls(STATUS), 3);
    assert!(provider.reconciler().entries()?.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_delete_waits_for_stopping_workload() -> Result<(), SkyletError> {
    let backend = Arc::new(FakeBackend {
        linger_polls: 2,
        ..Default::default()
    });
    let provider = new_provider(&backend);
    let cancel = CancellationToken::new();
    let pod = new_pod("nginx", "nginx:1.27");

    provider.create_pod(&pod, &cancel).await?;
    provider.delete_pod(&pod, &cancel).await?;

    assert_eq!(backend.calls(STATUS), 3);
    assert_eq!(backend.workload_count(), 0);
    assert!(provider.reconciler().entries()?.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_cancelled_delete_confirmation_keeps_entry() -> Result<(), SkyletError> {
    let backend = Arc::new(FakeBackend {
        linger_polls: usize::MAX,
        ..Default::default()
    });
    let policy = RetryPolicy {
        confirm_attempts: 1000,
        confirm_interval: Duration::from_millis(10),
        ..fast_policy()
    };
    let provider = new_provider_with(&backend, policy);
    let cancel = CancellationToken::new();
    let pod = new_pod("nginx", "nginx:1.27");

    provider.create_pod(&pod, &cancel).await?;
    let before = provider.reconciler().entries()?;

    let delete_cancel = CancellationToken::new();
    let (res, _) = tokio::join!(provider.delete_pod(&pod, &delete_cancel), async {
        tokio::time::sleep(Duration::from_millis(35)).await;
        delete_cancel.cancel();
    });
    assert!(matches!(
        res.as_ref().map_err(|e| e.root()),
        Err(SkyletError::Cancelled(_))
    ));
    assert_eq!(backend.calls(DELETE), 1);
    assert!(backend.calls(STATUS) >= 1);

    let after = provider.reconciler().entries()?;
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].state, EntryState::Present);
    assert_eq!(after[0].handle, before[0].handle);

    Ok(())
}

#[tokio::test]
async fn test_failed_delete_keeps_entry() -> Result<(), SkyletError> {
    let backend = Arc::new(FakeBackend::default());
    let provider = new_provider(&backend);
    let cancel = CancellationToken::new();
    let pod = new_pod("nginx", "nginx:1.27");

    provider.create_pod(&pod, &cancel).await?;
    backend.fail(DELETE, BackendError::Permanent("denied".to_string()), 1);

    assert!(provider.delete_pod(&pod, &cancel).await.is_err());
    let entries = provider.reconciler().entries()?;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].state, EntryState::Failed);
    assert!(entries[0].handle.is_some());

    // The retry goes through.
    provider.delete_pod(&pod, &cancel).await?;
    assert!(provider.reconciler().entries()?.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_cancelled_create() -> Result<(), SkyletError> {
    let backend = Arc::new(FakeBackend::default());
    let provider = new_provider(&backend);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let res = provider.create_pod(&new_pod("nginx", "nginx:1.27"), &cancel).await;

    assert!(matches!(
        res.as_ref().map_err(|e| e.root()),
        Err(SkyletError::Cancelled(_))
    ));
    assert_eq!(backend.total_calls(), 0);
    assert!(provider.reconciler().entries()?.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_container_logs() -> Result<(), SkyletError> {
    let backend = Arc::new(FakeBackend::default());
    let provider = new_provider(&backend);
    let cancel = CancellationToken::new();

    let res = provider
        .get_container_logs("default", "nginx", "app", None, &cancel)
        .await;
    assert!(res.is_err_and(|e| e.is_not_found()));

    provider.create_pod(&new_pod("nginx", "nginx:1.27"), &cancel).await?;
    let logs = provider
        .get_container_logs("default", "nginx", "app", Some(2), &cancel)
        .await?;

    let text = String::from_utf8_lossy(&logs);
    assert_eq!(text.lines().count(), 2);
    assert!(text.ends_with("line 3"));
    assert_eq!(backend.calls(LOGS), 1);

    Ok(())
}

#[tokio::test]
async fn test_node_reporting() {
    let backend = Arc::new(FakeBackend::default());
    let provider: Arc<dyn Provider> = Arc::new(new_provider(&backend));

    let capacity = provider.capacity();
    assert_eq!(capacity.get("cpu").map(|q| q.0.as_str()), Some("20"));
    assert_eq!(capacity.get("memory").map(|q| q.0.as_str()), Some("100Gi"));
    assert_eq!(capacity.get("pods").map(|q| q.0.as_str()), Some("20"));

    let conditions = provider.node_conditions();
    assert_eq!(conditions.len(), 5);
    assert_eq!(conditions[0].type_, "Ready");

    assert_eq!(provider.operating_system(), "Linux");
}
