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

//! Driver lifecycle: start, device discovery and removal, open, stop.

use std::sync::Arc;

use crate::{
    bdf::Bdf,
    bus::{supported_functions, PciBus, PciFunction},
    config::DriverConfig,
    endpoint::VmSocketFile,
    error::{Error, Result},
    publish::{NodePublisher, PublishContext},
    region::MappedRegions,
    registry::{Instance, InstanceRegistry},
};

/// A device that has been enabled and whose regions are reserved. Undone on
/// drop unless kept.
struct DeviceClaim<'a> {
    bus: &'a dyn PciBus,
    bdf: Bdf,
    kept: bool,
}

impl<'a> DeviceClaim<'a> {
    fn acquire(bus: &'a dyn PciBus, bdf: Bdf, owner: &str) -> Result<Self> {
        bus.enable_device(bdf).map_err(|err| {
            log::error!("{}: cannot enable device: {}", bdf, err);
            Error::ResourceUnavailable(format!("enable failed: {}", err))
        })?;
        if let Err(err) = bus.request_regions(bdf, owner) {
            log::error!("{}: cannot reserve regions: {}", bdf, err);
            bus.disable_device(bdf);
            return Err(Error::ResourceUnavailable(format!("region reservation failed: {}", err)));
        }
        Ok(Self { bus, bdf, kept: false })
    }

    fn keep(mut self) {
        self.kept = true;
    }
}

impl Drop for DeviceClaim<'_> {
    fn drop(&mut self) {
        if !self.kept {
            self.bus.release_regions(self.bdf);
            self.bus.disable_device(self.bdf);
        }
    }
}

pub struct Driver {
    bus: Arc<dyn PciBus>,
    context: Arc<PublishContext>,
    registry: InstanceRegistry,
    config: DriverConfig,
}

impl Driver {
    /// Allocates the device numbers and the device class, then binds to every
    /// supported device already on the bus.
    pub fn start(
        bus: Arc<dyn PciBus>,
        publisher: Arc<dyn NodePublisher>,
        config: DriverConfig,
    ) -> Result<Self> {
        config.validate()?;
        let context = PublishContext::create(publisher, &config.name, config.max_instances)?;
        let driver =
            Self { bus, context, registry: InstanceRegistry::new(config.max_instances), config };
        let bound = driver.probe();
        log::info!("{}: driver started, {} device(s) bound", driver.config.name, bound);
        Ok(driver)
    }

    /// Binds to every supported device on the bus that is not bound yet.
    /// Returns the number of newly bound devices.
    pub fn probe(&self) -> usize {
        let mut bound = 0;
        for function in supported_functions(self.bus.as_ref()) {
            if self.registry.find(function.bdf).is_some() {
                continue;
            }
            match self.on_discover(function) {
                Ok(_) => bound += 1,
                Err(err) => log::error!("{}: probe failed: {}", function, err),
            }
        }
        bound
    }

    /// Binds to a newly discovered function and returns its instance index.
    pub fn on_discover(&self, function: PciFunction) -> Result<usize> {
        if !function.is_supported() {
            log::debug!("{}: not a VMSocket device", function);
            return Err(Error::NoDevice);
        }
        let bdf = function.bdf;
        let bus = self.bus.as_ref();

        // Claims the device for this call; a concurrent discovery of the same
        // function fails here before touching the bus.
        let reservation = self.registry.reserve(bdf).inspect_err(|err| {
            log::error!("{}: cannot reserve a device slot: {}", bdf, err);
        })?;
        let index = reservation.index();
        let claim = DeviceClaim::acquire(bus, bdf, &self.config.name)?;
        let regions = MappedRegions::map(bus, bdf)?;
        let instance = Arc::new(Instance::new(index, function, regions, self.context.clone()));
        let name = instance.name();
        if let Err(err) = self.context.publish(index, &name) {
            if let Some(regions) = instance.shutdown() {
                regions.unmap(bus, bdf);
            }
            return Err(err);
        }
        claim.keep();
        reservation.commit(instance);
        log::info!("{}: registered {} as {}", bdf, name, self.context.dev_num(index));
        Ok(index)
    }

    /// Unbinds the device at `bdf`. Blocked reads on it are cancelled; the
    /// device is unmapped once in-flight operations finish.
    pub fn on_remove(&self, bdf: Bdf) {
        let Some((slot, instance)) = self.registry.detach(bdf) else {
            log::warn!("{}: removal of unknown device ignored", bdf);
            return;
        };
        self.context.unpublish(instance.index());
        if let Some(regions) = instance.shutdown() {
            regions.unmap(self.bus.as_ref(), bdf);
        }
        self.bus.release_regions(bdf);
        self.bus.disable_device(bdf);
        log::info!("{}: removed {}", bdf, instance.name());
        drop(slot);
    }

    /// Opens the device with the given index. Fails with [`Error::Busy`]
    /// instead of waiting if it is already open.
    pub fn open(&self, index: usize) -> Result<VmSocketFile> {
        let instance = self.registry.get(index).ok_or(Error::NoDevice)?;
        if !instance.try_acquire() {
            log::debug!("{}: already open", instance.name());
            return Err(Error::Busy);
        }
        Ok(VmSocketFile::new(instance, self.config.poll.clone()))
    }

    pub fn instance(&self, index: usize) -> Option<Arc<Instance>> {
        self.registry.get(index)
    }

    /// Number of bound devices.
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Unbinds every device and releases the device class and numbers.
    pub fn stop(self) {
        drop(self);
    }

    fn remove_all(&self) {
        for bdf in self.registry.bdfs() {
            self.on_remove(bdf);
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.remove_all();
        log::info!("{}: driver stopped", self.config.name);
    }
}
