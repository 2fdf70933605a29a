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

//! The host PCI facilities the driver relies on.
//!
//! Enumeration, resource reservation and BAR mapping belong to the host; the
//! driver only sees them through [`PciBus`].

use core::fmt::Display;

use crate::{bdf::Bdf, region::IoRegion};

pub const VMSOCKET_VENDOR_ID: u16 = 0x1af4;
pub const VMSOCKET_DEVICE_ID: u16 = 0x6662;

/// Vendor and device ID pair the driver claims, regardless of subsystem IDs.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PciId {
    pub vendor_id: u16,
    pub device_id: u16,
}

impl PciId {
    pub const fn new(vendor_id: u16, device_id: u16) -> Self {
        Self { vendor_id, device_id }
    }

    pub fn matches(&self, function: &PciFunction) -> bool {
        self.vendor_id == function.vendor_id && self.device_id == function.device_id
    }
}

pub const ID_TABLE: &[PciId] = &[PciId::new(VMSOCKET_VENDOR_ID, VMSOCKET_DEVICE_ID)];

/// A function reported by the bus.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PciFunction {
    pub bdf: Bdf,
    pub vendor_id: u16,
    pub device_id: u16,
}

impl PciFunction {
    pub fn is_supported(&self) -> bool {
        ID_TABLE.iter().any(|id| id.matches(self))
    }
}

impl Display for PciFunction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}, {:04x}:{:04x}", self.bdf, self.vendor_id, self.device_id)
    }
}

/// Bus address range of one BAR.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Resource {
    pub start: u64,
    pub len: u64,
}

pub trait PciBus: Send + Sync {
    /// Lists every function currently present on the bus.
    fn functions(&self) -> Vec<PciFunction>;

    fn enable_device(&self, bdf: Bdf) -> Result<(), &'static str>;

    fn disable_device(&self, bdf: Bdf);

    /// Reserves all BARs of the function for `owner`.
    fn request_regions(&self, bdf: Bdf, owner: &str) -> Result<(), &'static str>;

    fn release_regions(&self, bdf: Bdf);

    /// Returns the bus resource behind a BAR, if the BAR is implemented.
    fn resource(&self, bdf: Bdf, bar: u8) -> Option<Resource>;

    /// Maps at most `max_len` bytes of a BAR; zero maps the whole resource.
    fn iomap(&self, bdf: Bdf, bar: u8, max_len: usize) -> Result<Box<dyn IoRegion>, &'static str>;

    /// Tears down a mapping returned by [`PciBus::iomap`].
    fn iounmap(&self, bdf: Bdf, bar: u8, region: Box<dyn IoRegion>);
}

/// Functions on the bus that the driver should bind to.
pub fn supported_functions(bus: &dyn PciBus) -> impl Iterator<Item = PciFunction> {
    bus.functions().into_iter().filter(PciFunction::is_supported)
}
