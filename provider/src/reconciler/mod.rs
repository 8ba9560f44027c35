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

//! Drives each pod's backend workload through its lifecycle.
//!
//! Every entry moves `Creating -> Present -> Updating -> Deleting` and is
//! then removed; `Failed` is reachable from the three transient states.
//! Mutating operations on one identity are serialized by the slot's async
//! lock; reads only clone the entry under the slot's synchronous lock.

mod index;

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use k8s_openapi::api::core::v1::{Pod, PodStatus};
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;

use common::ctx::OperatingSystem;
use common::{BackendError, SkyletError};
use stdng::backoff::{self, Backoff, RetryError};
use stdng::trace_fn;

pub use self::index::ReconcilerEntry;
use self::index::{Index, SlotPtr};
use crate::backend::BackendPtr;
use crate::model::{EntryState, ObservedStatus, PodIdentity, WorkloadHandle, WorkloadPhase};
use crate::translator;

const DEFAULT_CONFIRM_ATTEMPTS: u32 = 5;
const DEFAULT_CONFIRM_INTERVAL_SECS: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Backoff for transient backend failures.
    pub backoff: Backoff,
    /// Polls made to confirm a deleted workload is gone.
    pub confirm_attempts: u32,
    pub confirm_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            backoff: Backoff::default(),
            confirm_attempts: DEFAULT_CONFIRM_ATTEMPTS,
            confirm_interval: Duration::from_secs(DEFAULT_CONFIRM_INTERVAL_SECS),
        }
    }
}

pub struct Reconciler {
    backend: BackendPtr,
    os: OperatingSystem,
    policy: RetryPolicy,
    index: Index,
}

pub type ReconcilerPtr = Arc<Reconciler>;

/// The pod status an entry reports without asking the backend.
fn cached_status(entry: &ReconcilerEntry) -> PodStatus {
    match &entry.handle {
        None => translator::unacknowledged_status(
            &entry.desired,
            entry.state,
            entry.last_error.as_deref(),
        ),
        Some(_) => {
            let observed = entry
                .observed
                .clone()
                .unwrap_or(ObservedStatus::new(WorkloadPhase::Pending));
            translator::to_pod_status(&observed, &entry.desired, entry.state)
        }
    }
}

impl Reconciler {
    pub fn new(backend: BackendPtr, os: OperatingSystem, policy: RetryPolicy) -> Self {
        Self {
            backend,
            os,
            policy,
            index: Index::new(),
        }
    }

    /// Runs a backend call, retrying transient failures.
    async fn call<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        what: &str,
        op: F,
    ) -> Result<T, SkyletError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        match backoff::retry(&self.policy.backoff, cancel, BackendError::is_transient, op).await {
            Ok(v) => Ok(v),
            Err(RetryError::Cancelled) => Err(SkyletError::Cancelled(what.to_string())),
            Err(RetryError::Exhausted { attempts, last }) => {
                tracing::error!("Failed to {what} after {attempts} attempts: {last}");
                Err(SkyletError::Backend(last))
            }
            Err(RetryError::Fatal(e)) => Err(SkyletError::Backend(e)),
        }
    }

    /// Takes the exclusive section of the identity's slot. Slots retired
    /// while waiting are skipped; `insert` controls whether a missing slot
    /// is created.
    async fn lock_slot(
        &self,
        id: &PodIdentity,
        cancel: &CancellationToken,
        insert: bool,
    ) -> Result<Option<(SlotPtr, OwnedMutexGuard<()>)>, SkyletError> {
        loop {
            let slot = if insert {
                self.index.get_or_insert(id)?
            } else {
                match self.index.get(id)? {
                    Some(slot) => slot,
                    None => return Ok(None),
                }
            };

            let guard = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    if insert {
                        if let Some(_guard) = slot.try_lock() {
                            self.discard_if_empty(id, &slot)?;
                        }
                    }
                    return Err(SkyletError::Cancelled(format!("waiting for pod <{id}>")));
                }
                guard = slot.lock() => guard,
            };

            if !slot.is_retired()? {
                return Ok(Some((slot, guard)));
            }
        }
    }

    /// Drops the slot when it holds no entry, e.g. after a rejected create.
    fn discard_if_empty(&self, id: &PodIdentity, slot: &SlotPtr) -> Result<(), SkyletError> {
        if slot.snapshot()?.is_none() {
            self.index.remove(id, slot)?;
        }
        Ok(())
    }

    /// Puts back the entry recorded before a cancelled step; an entry that
    /// did not exist before is removed.
    fn restore(
        &self,
        id: &PodIdentity,
        slot: &SlotPtr,
        previous: Option<ReconcilerEntry>,
    ) -> Result<(), SkyletError> {
        match previous {
            Some(entry) => slot.set(entry),
            None => self.index.remove(id, slot),
        }
    }

    fn fail(&self, slot: &SlotPtr, err: &SkyletError) -> Result<(), SkyletError> {
        let msg = err.to_string();
        slot.update(|e| {
            e.state = EntryState::Failed;
            e.last_error = Some(msg);
        })
    }

    pub async fn create_pod(
        &self,
        pod: &Pod,
        cancel: &CancellationToken,
    ) -> Result<PodStatus, SkyletError> {
        trace_fn!("Reconciler::create_pod");

        let id = PodIdentity::from_pod(pod)?;
        let (slot, _guard) = self
            .lock_slot(&id, cancel, true)
            .await
            .map_err(|e| e.with_pod("create", &id))?
            .ok_or_else(|| SkyletError::Internal(format!("no slot for pod <{id}>")))?;

        self.create_locked(&id, &slot, pod, cancel)
            .await
            .map_err(|e| e.with_pod("create", &id))
    }

    async fn create_locked(
        &self,
        id: &PodIdentity,
        slot: &SlotPtr,
        pod: &Pod,
        cancel: &CancellationToken,
    ) -> Result<PodStatus, SkyletError> {
        let previous = slot.snapshot()?;
        if let Some(entry) = &previous {
            if entry.state != EntryState::Failed || entry.handle.is_some() {
                tracing::debug!("Pod <{id}> already exists in state <{}>", entry.state);
                return Ok(cached_status(entry));
            }
        }

        let desired = match translator::to_descriptor(pod, self.os) {
            Ok(desired) => desired,
            Err(e) => {
                self.discard_if_empty(id, slot)?;
                return Err(e);
            }
        };

        slot.set(ReconcilerEntry {
            identity: id.clone(),
            pod: pod.clone(),
            desired: desired.clone(),
            handle: None,
            state: EntryState::Creating,
            observed: None,
            last_error: None,
        })?;
        tracing::info!("Creating workload <{}> for pod <{id}>", desired.name);

        let res = self
            .call(cancel, "create workload", |_| {
                self.backend.create_workload(&desired)
            })
            .await;

        match res {
            Ok(handle) => {
                tracing::info!("Pod <{id}> is backed by workload <{handle}>");
                slot.update(|e| {
                    e.handle = Some(handle);
                    e.state = EntryState::Present;
                    e.last_error = None;
                })?;
            }
            Err(e @ SkyletError::Cancelled(_)) => {
                self.restore(id, slot, previous)?;
                return Err(e);
            }
            Err(e) => {
                tracing::error!("Failed to create workload for pod <{id}>: {e}");
                self.fail(slot, &e)?;
                return Err(e);
            }
        }

        let entry = slot
            .snapshot()?
            .ok_or_else(|| SkyletError::Internal(format!("pod <{id}> vanished")))?;
        Ok(cached_status(&entry))
    }

    pub async fn update_pod(
        &self,
        pod: &Pod,
        cancel: &CancellationToken,
    ) -> Result<PodStatus, SkyletError> {
        trace_fn!("Reconciler::update_pod");

        let id = PodIdentity::from_pod(pod)?;
        let (slot, _guard) = self
            .lock_slot(&id, cancel, true)
            .await
            .map_err(|e| e.with_pod("update", &id))?
            .ok_or_else(|| SkyletError::Internal(format!("no slot for pod <{id}>")))?;

        // Unknown pods, and failed creates without a workload, go through creation.
        let previous = slot.snapshot()?;
        let Some((entry, handle)) = previous.and_then(|e| e.handle.clone().map(|h| (e, h))) else {
            return self
                .create_locked(&id, &slot, pod, cancel)
                .await
                .map_err(|e| e.with_pod("update", &id));
        };

        self.update_locked(&id, &slot, entry, handle, pod, cancel)
            .await
            .map_err(|e| e.with_pod("update", &id))
    }

    async fn update_locked(
        &self,
        id: &PodIdentity,
        slot: &SlotPtr,
        previous: ReconcilerEntry,
        handle: WorkloadHandle,
        pod: &Pod,
        cancel: &CancellationToken,
    ) -> Result<PodStatus, SkyletError> {
        let desired = translator::to_descriptor(pod, self.os)?;
        // A failed update left the workload behind its descriptor; redo it.
        if desired == previous.desired && previous.state != EntryState::Failed {
            tracing::debug!("Pod <{id}> is unchanged, skip update");
            slot.update(|e| e.pod = pod.clone())?;
            return Ok(cached_status(&previous));
        }

        slot.update(|e| {
            e.pod = pod.clone();
            e.desired = desired.clone();
            e.state = EntryState::Updating;
        })?;

        if self.backend.supports_in_place_update() {
            tracing::info!("Updating workload <{handle}> of pod <{id}> in place");
            let res = self
                .call(cancel, "update workload", |_| {
                    self.backend.update_workload(&handle, &desired)
                })
                .await;

            return match res {
                Ok(new_handle) => {
                    tracing::info!("Pod <{id}> is backed by workload <{new_handle}>");
                    slot.update(|e| {
                        e.handle = Some(new_handle);
                        e.state = EntryState::Present;
                        e.observed = None;
                        e.last_error = None;
                    })?;
                    self.snapshot_status(id, slot)
                }
                Err(e @ SkyletError::Cancelled(_)) => {
                    slot.set(previous)?;
                    Err(e)
                }
                Err(e) => {
                    tracing::error!("Failed to update workload <{handle}> of pod <{id}>: {e}");
                    self.fail(slot, &e)?;
                    Err(e)
                }
            };
        }

        tracing::warn!(
            "Recreating workload <{handle}> of pod <{id}>; the pod is unavailable until the new workload runs"
        );
        let res = self
            .call(cancel, "delete workload", |_| {
                self.backend.delete_workload(&handle)
            })
            .await;
        match res {
            Ok(()) => {}
            Err(e @ SkyletError::Cancelled(_)) => {
                slot.set(previous)?;
                return Err(e);
            }
            Err(e) => {
                tracing::error!("Failed to delete workload <{handle}> of pod <{id}>: {e}");
                self.fail(slot, &e)?;
                return Err(e);
            }
        }

        slot.update(|e| {
            e.handle = None;
            e.observed = None;
            e.state = EntryState::Creating;
        })?;

        let res = self
            .call(cancel, "create workload", |_| {
                self.backend.create_workload(&desired)
            })
            .await;
        match res {
            Ok(new_handle) => {
                tracing::info!("Pod <{id}> is backed by workload <{new_handle}>");
                slot.update(|e| {
                    e.handle = Some(new_handle);
                    e.state = EntryState::Present;
                    e.last_error = None;
                })?;
                self.snapshot_status(id, slot)
            }
            Err(e) => {
                // The old workload is gone; a later create re-drives this entry.
                tracing::error!("Failed to recreate workload for pod <{id}>: {e}");
                self.fail(slot, &e)?;
                Err(e)
            }
        }
    }

    fn snapshot_status(&self, id: &PodIdentity, slot: &SlotPtr) -> Result<PodStatus, SkyletError> {
        let entry = slot
            .snapshot()?
            .ok_or_else(|| SkyletError::Internal(format!("pod <{id}> vanished")))?;
        Ok(cached_status(&entry))
    }

    pub async fn delete_pod(&self, pod: &Pod, cancel: &CancellationToken) -> Result<(), SkyletError> {
        trace_fn!("Reconciler::delete_pod");

        let id = PodIdentity::from_pod(pod)?;
        let Some((slot, _guard)) = self
            .lock_slot(&id, cancel, false)
            .await
            .map_err(|e| e.with_pod("delete", &id))?
        else {
            tracing::debug!("Pod <{id}> is unknown, skip delete");
            return Ok(());
        };

        self.delete_locked(&id, &slot, cancel)
            .await
            .map_err(|e| e.with_pod("delete", &id))
    }

    async fn delete_locked(
        &self,
        id: &PodIdentity,
        slot: &SlotPtr,
        cancel: &CancellationToken,
    ) -> Result<(), SkyletError> {
        let Some(previous) = slot.snapshot()? else {
            self.index.remove(id, slot)?;
            return Ok(());
        };
        let Some(handle) = previous.handle.clone() else {
            tracing::info!("Pod <{id}> has no workload, remove it");
            self.index.remove(id, slot)?;
            return Ok(());
        };

        slot.update(|e| e.state = EntryState::Deleting)?;
        tracing::info!("Deleting workload <{handle}> of pod <{id}>");

        let res = self
            .call(cancel, "delete workload", |_| {
                self.backend.delete_workload(&handle)
            })
            .await;
        match res {
            Ok(()) => {}
            Err(e @ SkyletError::Cancelled(_)) => {
                slot.set(previous)?;
                return Err(e);
            }
            Err(e) => {
                tracing::error!("Failed to delete workload <{handle}> of pod <{id}>: {e}");
                self.fail(slot, &e)?;
                return Err(e);
            }
        }

        let confirmed = match self.confirm_deleted(&handle, cancel).await {
            Ok(confirmed) => confirmed,
            Err(e) => {
                slot.set(previous)?;
                return Err(e);
            }
        };
        self.index.remove(id, slot)?;

        if confirmed {
            tracing::info!("Pod <{id}> deleted");
            Ok(())
        } else {
            tracing::error!(
                "Workload <{handle}> of pod <{id}> still exists after {} polls; dropped it",
                self.policy.confirm_attempts
            );
            Err(SkyletError::InvalidState(format!(
                "deletion of workload <{handle}> was not confirmed"
            )))
        }
    }

    /// Polls until the backend reports the workload deleted.
    async fn confirm_deleted(
        &self,
        handle: &WorkloadHandle,
        cancel: &CancellationToken,
    ) -> Result<bool, SkyletError> {
        let attempts = self.policy.confirm_attempts.max(1);
        for attempt in 1..=attempts {
            let res = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(SkyletError::Cancelled(format!("confirming deletion of <{handle}>")));
                }
                res = self.backend.is_deleted(handle) => res,
            };

            match res {
                Ok(true) => return Ok(true),
                Ok(false) => tracing::debug!("Workload <{handle}> still exists"),
                Err(e) => tracing::warn!("Failed to poll workload <{handle}>: {e}"),
            }

            if attempt < attempts && !backoff::sleep(cancel, self.policy.confirm_interval).await {
                return Err(SkyletError::Cancelled(format!(
                    "confirming deletion of <{handle}>"
                )));
            }
        }

        Ok(false)
    }

    /// Refreshes one entry from the backend. `None` means the pod is
    /// unknown here or gone from the backend.
    async fn refresh(
        &self,
        id: &PodIdentity,
        cancel: &CancellationToken,
    ) -> Result<Option<(ReconcilerEntry, PodStatus)>, SkyletError> {
        let Some(slot) = self.index.get(id)? else {
            return Ok(None);
        };
        let Some(entry) = slot.snapshot()? else {
            return Ok(None);
        };
        let Some(handle) = entry.handle.clone() else {
            let status = cached_status(&entry);
            return Ok(Some((entry, status)));
        };

        let res = self
            .call(cancel, "get workload status", |_| {
                self.backend.get_workload_status(&handle)
            })
            .await;

        match res {
            Ok(observed) => {
                let status = translator::to_pod_status(&observed, &entry.desired, entry.state);
                slot.update(|e| {
                    if e.handle.as_ref() == Some(&handle) {
                        e.observed = Some(observed);
                    }
                })?;
                Ok(Some((entry, status)))
            }
            Err(e) if e.is_not_found() => {
                tracing::warn!("Workload <{handle}> of pod <{id}> is gone from the backend");
                Ok(None)
            }
            Err(e) => Err(e.with_pod("get", id)),
        }
    }

    pub async fn get_pod(
        &self,
        namespace: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Pod>, SkyletError> {
        trace_fn!("Reconciler::get_pod");

        let id = PodIdentity::new(namespace, name);
        let res = self.refresh(&id, cancel).await?;
        Ok(res.map(|(entry, status)| translator::with_status(&entry.pod, status)))
    }

    pub async fn get_pod_status(
        &self,
        namespace: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<PodStatus>, SkyletError> {
        trace_fn!("Reconciler::get_pod_status");

        let id = PodIdentity::new(namespace, name);
        let res = self.refresh(&id, cancel).await?;
        Ok(res.map(|(_, status)| status))
    }

    /// Lists every known pod with its current status: one listing per
    /// backend scope, then individual lookups for entries the listing missed.
    pub async fn get_pods(&self, cancel: &CancellationToken) -> Result<Vec<Pod>, SkyletError> {
        trace_fn!("Reconciler::get_pods");

        let mut entries = vec![];
        for slot in self.index.slots()? {
            if let Some(entry) = slot.snapshot()? {
                entries.push((slot, entry));
            }
        }

        let scopes: BTreeSet<String> = entries
            .iter()
            .filter_map(|(_, e)| e.handle.as_ref().map(|h| h.scope.clone()))
            .collect();

        let mut listed: HashMap<(String, String), ObservedStatus> = HashMap::new();
        for scope in scopes {
            let workloads = self
                .call(cancel, "list workloads", |_| self.backend.list_workloads(&scope))
                .await?;
            for (handle, observed) in workloads {
                listed.insert((handle.scope, handle.id), observed);
            }
        }

        let mut pods = vec![];
        let mut missing = vec![];
        for (slot, entry) in entries {
            let Some(handle) = entry.handle.clone() else {
                pods.push(translator::with_status(&entry.pod, cached_status(&entry)));
                continue;
            };

            match listed.remove(&(handle.scope.clone(), handle.id.clone())) {
                Some(observed) => {
                    let status = translator::to_pod_status(&observed, &entry.desired, entry.state);
                    slot.update(|e| {
                        if e.handle.as_ref() == Some(&handle) {
                            e.observed = Some(observed);
                        }
                    })?;
                    pods.push(translator::with_status(&entry.pod, status));
                }
                None => missing.push(entry),
            }
        }

        let lookups = missing.iter().map(|entry| async move {
            let res = self.refresh(&entry.identity, cancel).await;
            (entry, res)
        });
        for (entry, res) in join_all(lookups).await {
            match res {
                Ok(Some((_, status))) => pods.push(translator::with_status(&entry.pod, status)),
                Ok(None) => {}
                Err(e) if matches!(e.root(), SkyletError::Cancelled(_)) => return Err(e),
                Err(e) => {
                    tracing::warn!("Failed to refresh pod <{}>: {e}", entry.identity);
                    let observed = ObservedStatus::unknown(e.to_string());
                    let status = translator::to_pod_status(&observed, &entry.desired, entry.state);
                    pods.push(translator::with_status(&entry.pod, status));
                }
            }
        }

        Ok(pods)
    }

    pub async fn get_container_logs(
        &self,
        namespace: &str,
        name: &str,
        container: &str,
        tail: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<Bytes, SkyletError> {
        trace_fn!("Reconciler::get_container_logs");

        let id = PodIdentity::new(namespace, name);
        let entry = match self.index.get(&id)? {
            Some(slot) => slot.snapshot()?,
            None => None,
        };
        let Some(entry) = entry else {
            return Err(SkyletError::NotFound(format!("pod <{id}>")));
        };
        let Some(handle) = entry.handle else {
            return Err(SkyletError::InvalidState(format!(
                "pod <{id}> has no workload in state <{}>",
                entry.state
            ))
            .with_pod("get logs of", &id));
        };

        self.call(cancel, "fetch logs", |_| {
            self.backend.fetch_logs(&handle, container, tail)
        })
        .await
        .map_err(|e| e.with_pod("get logs of", &id))
    }

    /// A snapshot of every entry, for inspection.
    pub fn entries(&self) -> Result<Vec<ReconcilerEntry>, SkyletError> {
        let mut entries = vec![];
        for slot in self.index.slots()? {
            if let Some(entry) = slot.snapshot()? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}
