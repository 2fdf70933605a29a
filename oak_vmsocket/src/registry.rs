//
// Copyright 2026 The Project Oak Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Device instances and the slot table that owns them.

use core::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tokio_util::sync::CancellationToken;

use crate::{
    bdf::Bdf,
    bus::PciFunction,
    config::PollPolicy,
    error::{Error, Result},
    protocol::Connection,
    publish::PublishContext,
    region::MappedRegions,
};

/// One bound VMSocket device.
pub struct Instance {
    index: usize,
    function: PciFunction,
    /// 1 while closed, 0 while open.
    available: AtomicU32,
    /// `None` once the device has been removed.
    regions: RwLock<Option<MappedRegions>>,
    cancel: CancellationToken,
    context: Arc<PublishContext>,
}

impl Instance {
    pub(crate) fn new(
        index: usize,
        function: PciFunction,
        regions: MappedRegions,
        context: Arc<PublishContext>,
    ) -> Self {
        Self {
            index,
            function,
            available: AtomicU32::new(1),
            regions: RwLock::new(Some(regions)),
            cancel: CancellationToken::new(),
            context,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn bdf(&self) -> Bdf {
        self.function.bdf
    }

    pub fn function(&self) -> PciFunction {
        self.function
    }

    /// Name of the published node, e.g. `vmsocket0`.
    pub fn name(&self) -> String {
        format!("{}{}", self.context.name(), self.index)
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire) == 1
    }

    /// Claims the instance for one opener. Never blocks.
    pub(crate) fn try_acquire(&self) -> bool {
        self.available.compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    pub(crate) fn release(&self) {
        if self.available.compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire).is_err() {
            log::warn!("{}: released while not open", self.name());
        }
    }

    /// Token cancelled when the device goes away.
    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Runs `f` against the mapped device.
    ///
    /// Removal waits for `f` to return before unmapping.
    pub(crate) fn with_connection<T>(
        &self,
        poll: &PollPolicy,
        cancel: &CancellationToken,
        f: impl FnOnce(&Connection<'_>) -> T,
    ) -> Result<T> {
        let regions = self.regions.read().unwrap_or_else(PoisonError::into_inner);
        let regions = regions.as_ref().ok_or(Error::NoDevice)?;
        Ok(f(&Connection::new(regions, poll, cancel)))
    }

    /// Stops blocking reads and takes the regions away from any future
    /// operation.
    pub(crate) fn shutdown(&self) -> Option<MappedRegions> {
        self.cancel.cancel();
        self.regions.write().unwrap_or_else(PoisonError::into_inner).take()
    }
}

enum Slot {
    Free,
    /// Held by a device that is still being set up or torn down.
    Reserved(Bdf),
    Occupied(Arc<Instance>),
}

/// Fixed-capacity table of device slots.
pub struct InstanceRegistry {
    slots: Mutex<Vec<Slot>>,
}

impl InstanceRegistry {
    pub fn new(capacity: usize) -> Self {
        Self { slots: Mutex::new((0..capacity).map(|_| Slot::Free).collect()) }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.lock().len()
    }

    /// Number of devices in service.
    pub fn len(&self) -> usize {
        self.lock().iter().filter(|slot| matches!(slot, Slot::Occupied(_))).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reserves the lowest free slot for the device at `bdf`.
    ///
    /// Fails if `bdf` already holds a slot, whether it is in service or still
    /// being set up or torn down.
    pub fn reserve(&self, bdf: Bdf) -> Result<SlotReservation<'_>> {
        let mut slots = self.lock();
        let taken = slots.iter().any(|slot| match slot {
            Slot::Reserved(reserved) => *reserved == bdf,
            Slot::Occupied(instance) => instance.bdf() == bdf,
            Slot::Free => false,
        });
        if taken {
            return Err(Error::ResourceUnavailable(format!("{} is already bound", bdf)));
        }
        let index = slots
            .iter()
            .position(|slot| matches!(slot, Slot::Free))
            .ok_or(Error::ConfigurationExceeded(slots.len()))?;
        slots[index] = Slot::Reserved(bdf);
        Ok(SlotReservation { registry: self, index, committed: false })
    }

    pub fn get(&self, index: usize) -> Option<Arc<Instance>> {
        match self.lock().get(index) {
            Some(Slot::Occupied(instance)) => Some(instance.clone()),
            _ => None,
        }
    }

    pub fn find(&self, bdf: Bdf) -> Option<Arc<Instance>> {
        self.lock().iter().find_map(|slot| match slot {
            Slot::Occupied(instance) if instance.bdf() == bdf => Some(instance.clone()),
            _ => None,
        })
    }

    /// Takes the instance bound to `bdf` out of service. The slot stays
    /// reserved until the returned reservation is dropped.
    pub fn detach(&self, bdf: Bdf) -> Option<(SlotReservation<'_>, Arc<Instance>)> {
        let mut slots = self.lock();
        let index = slots
            .iter()
            .position(|slot| matches!(slot, Slot::Occupied(instance) if instance.bdf() == bdf))?;
        match core::mem::replace(&mut slots[index], Slot::Reserved(bdf)) {
            Slot::Occupied(instance) => {
                Some((SlotReservation { registry: self, index, committed: false }, instance))
            }
            _ => None,
        }
    }

    /// Bus addresses of every device in service.
    pub fn bdfs(&self) -> Vec<Bdf> {
        self.lock()
            .iter()
            .filter_map(|slot| match slot {
                Slot::Occupied(instance) => Some(instance.bdf()),
                _ => None,
            })
            .collect()
    }
}

/// A slot held for a device being added or removed. Freed on drop unless
/// committed.
pub struct SlotReservation<'a> {
    registry: &'a InstanceRegistry,
    index: usize,
    committed: bool,
}

impl SlotReservation<'_> {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Puts `instance` into service in the reserved slot.
    pub fn commit(mut self, instance: Arc<Instance>) {
        self.registry.lock()[self.index] = Slot::Occupied(instance);
        self.committed = true;
    }
}

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.registry.lock()[self.index] = Slot::Free;
        }
    }
}
