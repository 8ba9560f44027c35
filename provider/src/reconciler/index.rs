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

use std::collections::HashMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use tokio::sync::{Mutex, OwnedMutexGuard};

use common::SkyletError;
use stdng::{lock_ptr, new_ptr, MutexPtr};

use crate::model::{EntryState, ObservedStatus, PodIdentity, WorkloadDescriptor, WorkloadHandle};

/// What the reconciler knows about one pod.
#[derive(Debug, Clone)]
pub struct ReconcilerEntry {
    pub identity: PodIdentity,
    pub pod: Pod,
    pub desired: WorkloadDescriptor,
    /// Set only once the backend acknowledged the workload.
    pub handle: Option<WorkloadHandle>,
    pub state: EntryState,
    pub observed: Option<ObservedStatus>,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
pub struct SlotState {
    pub entry: Option<ReconcilerEntry>,
    /// Set when the slot was removed from the index; holders of a retired
    /// slot must look the identity up again.
    pub retired: bool,
}

/// The per-identity cell of the index: an async lock serializing mutating
/// operations, and the entry itself behind a short synchronous lock.
#[derive(Debug, Default)]
pub struct Slot {
    op_lock: Arc<Mutex<()>>,
    state: MutexPtr<SlotState>,
}

pub type SlotPtr = Arc<Slot>;

impl Slot {
    pub async fn lock(&self) -> OwnedMutexGuard<()> {
        self.op_lock.clone().lock_owned().await
    }

    pub fn try_lock(&self) -> Option<OwnedMutexGuard<()>> {
        self.op_lock.clone().try_lock_owned().ok()
    }

    pub fn snapshot(&self) -> Result<Option<ReconcilerEntry>, SkyletError> {
        let state = lock_ptr!(self.state)?;
        Ok(state.entry.clone())
    }

    pub fn is_retired(&self) -> Result<bool, SkyletError> {
        let state = lock_ptr!(self.state)?;
        Ok(state.retired)
    }

    pub fn set(&self, entry: ReconcilerEntry) -> Result<(), SkyletError> {
        let mut state = lock_ptr!(self.state)?;
        state.entry = Some(entry);
        Ok(())
    }

    /// Applies `f` to the entry, if there is one.
    pub fn update<F>(&self, f: F) -> Result<(), SkyletError>
    where
        F: FnOnce(&mut ReconcilerEntry),
    {
        let mut state = lock_ptr!(self.state)?;
        if let Some(entry) = state.entry.as_mut() {
            f(entry);
        }
        Ok(())
    }

    fn retire(&self) -> Result<(), SkyletError> {
        let mut state = lock_ptr!(self.state)?;
        state.entry = None;
        state.retired = true;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct Index {
    slots: MutexPtr<HashMap<PodIdentity, SlotPtr>>,
}

impl Index {
    pub fn new() -> Self {
        Self {
            slots: new_ptr(HashMap::new()),
        }
    }

    pub fn get(&self, id: &PodIdentity) -> Result<Option<SlotPtr>, SkyletError> {
        let slots = lock_ptr!(self.slots)?;
        Ok(slots.get(id).cloned())
    }

    pub fn get_or_insert(&self, id: &PodIdentity) -> Result<SlotPtr, SkyletError> {
        let mut slots = lock_ptr!(self.slots)?;
        Ok(slots.entry(id.clone()).or_default().clone())
    }

    /// Retires the slot and drops it from the index, unless the identity
    /// already maps to a newer slot.
    pub fn remove(&self, id: &PodIdentity, slot: &SlotPtr) -> Result<(), SkyletError> {
        let mut slots = lock_ptr!(self.slots)?;
        slot.retire()?;
        if slots.get(id).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            slots.remove(id);
        }
        Ok(())
    }

    pub fn slots(&self) -> Result<Vec<SlotPtr>, SkyletError> {
        let slots = lock_ptr!(self.slots)?;
        Ok(slots.values().cloned().collect())
    }

    pub fn len(&self) -> Result<usize, SkyletError> {
        let slots = lock_ptr!(self.slots)?;
        Ok(slots.len())
    }
}
