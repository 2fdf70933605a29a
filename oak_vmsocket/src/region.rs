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

//! Mapping of the four VMSocket BARs.
//!
//! Every device exposes, in BAR order, a register window, an input buffer, an
//! output buffer and a control block. They are mapped in that order and
//! unmapped in reverse; a device is only put into service once all four are
//! mapped.

use core::{mem::size_of, ptr::NonNull};

use strum::{Display, FromRepr};

use crate::{
    bdf::Bdf,
    bus::{PciBus, Resource},
    control::ControlBlock,
    error::{Error, Result},
    registers::REGISTER_WINDOW,
};

/// Byte-addressed access to a mapped BAR.
///
/// Offsets are in bytes. All accessors panic if the access would go outside
/// the region; callers validate sizes when the region is mapped.
pub trait IoRegion: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads a little-endian u32. For the register window this triggers the
    /// device operation behind the offset.
    fn read_u32(&self, offset: usize) -> u32;

    /// Writes a little-endian u32.
    fn write_u32(&self, offset: usize, value: u32);

    fn read_bytes(&self, offset: usize, dest: &mut [u8]);

    fn write_bytes(&self, offset: usize, src: &[u8]);
}

/// A memory-mapped BAR accessed with volatile loads and stores.
///
/// This is the region a [`PciBus`] backed by real hardware hands out from
/// [`PciBus::iomap`], wrapping the address its platform mapping returned.
pub struct Mmio {
    base: NonNull<u8>,
    len: usize,
}

// Safety: the mapping is device memory that does not belong to any thread; all
// accesses go through volatile operations.
unsafe impl Send for Mmio {}
unsafe impl Sync for Mmio {}

impl Mmio {
    /// Wraps an existing mapping.
    ///
    /// # Safety
    ///
    /// `base` must point to `len` bytes of mapped device memory that stay
    /// mapped for the lifetime of the returned value, and `base` must be
    /// aligned to 4 bytes.
    pub unsafe fn new(base: *mut u8, len: usize) -> Option<Self> {
        NonNull::new(base).map(|base| Self { base, len })
    }

    fn check(&self, offset: usize, size: usize, operation: &str) {
        match offset.checked_add(size) {
            Some(end) if end <= self.len => {}
            _ => panic!(
                "invalid MMIO access for {}: [{:#x}, +{}) is outside a region of {} bytes",
                operation, offset, size, self.len
            ),
        }
    }
}

impl IoRegion for Mmio {
    fn len(&self) -> usize {
        self.len
    }

    fn read_u32(&self, offset: usize) -> u32 {
        self.check(offset, size_of::<u32>(), "read");
        assert!(offset % size_of::<u32>() == 0, "unaligned MMIO read at {:#x}", offset);
        // Safety:
        //   - offset is aligned to u32
        //   - we've checked it's within the region
        //   - when calling new() we were promised the memory is valid
        u32::from_le(unsafe { self.base.as_ptr().add(offset).cast::<u32>().read_volatile() })
    }

    fn write_u32(&self, offset: usize, value: u32) {
        self.check(offset, size_of::<u32>(), "write");
        assert!(offset % size_of::<u32>() == 0, "unaligned MMIO write at {:#x}", offset);
        // Safety: as for `read_u32`.
        unsafe { self.base.as_ptr().add(offset).cast::<u32>().write_volatile(value.to_le()) }
    }

    fn read_bytes(&self, offset: usize, dest: &mut [u8]) {
        self.check(offset, dest.len(), "read");
        for (i, byte) in dest.iter_mut().enumerate() {
            // Safety: the whole range was checked above.
            *byte = unsafe { self.base.as_ptr().add(offset + i).read_volatile() };
        }
    }

    fn write_bytes(&self, offset: usize, src: &[u8]) {
        self.check(offset, src.len(), "write");
        for (i, byte) in src.iter().enumerate() {
            // Safety: the whole range was checked above.
            unsafe { self.base.as_ptr().add(offset + i).write_volatile(*byte) };
        }
    }
}

/// The four BARs of a VMSocket device, by BAR number.
#[derive(Copy, Clone, Debug, Display, Eq, FromRepr, Hash, PartialEq)]
#[repr(u8)]
pub enum RegionKind {
    #[strum(to_string = "registers")]
    Registers = 0,
    #[strum(to_string = "input buffer")]
    Input = 1,
    #[strum(to_string = "output buffer")]
    Output = 2,
    #[strum(to_string = "control block")]
    Control = 3,
}

impl RegionKind {
    /// Mapping order.
    pub const ALL: [RegionKind; 4] =
        [RegionKind::Registers, RegionKind::Input, RegionKind::Output, RegionKind::Control];

    pub fn bar(self) -> u8 {
        self as u8
    }

    /// How much of the BAR to map; zero means all of it.
    fn map_len(self) -> usize {
        match self {
            RegionKind::Registers => REGISTER_WINDOW,
            _ => 0,
        }
    }

    /// Smallest usable size of the BAR.
    fn min_len(self) -> usize {
        match self {
            RegionKind::Registers => REGISTER_WINDOW,
            RegionKind::Control => size_of::<ControlBlock>(),
            RegionKind::Input | RegionKind::Output => 0,
        }
    }
}

/// One mapped BAR.
pub struct Region {
    kind: RegionKind,
    resource: Resource,
    io: Box<dyn IoRegion>,
}

impl Region {
    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    /// Bus address of the BAR.
    pub fn start(&self) -> u64 {
        self.resource.start
    }

    /// Number of mapped bytes. For the buffers this is the transfer limit.
    pub fn len(&self) -> usize {
        self.io.len()
    }

    pub fn is_empty(&self) -> bool {
        self.io.is_empty()
    }

    pub fn io(&self) -> &dyn IoRegion {
        self.io.as_ref()
    }
}

fn map_region(
    bus: &dyn PciBus,
    bdf: Bdf,
    kind: RegionKind,
) -> core::result::Result<Region, String> {
    let resource = bus
        .resource(bdf, kind.bar())
        .ok_or_else(|| format!("BAR{} is not implemented", kind.bar()))?;
    let io = bus
        .iomap(bdf, kind.bar(), kind.map_len())
        .map_err(|err| format!("cannot ioremap {}: {}", kind, err))?;
    let region = Region { kind, resource, io };
    if region.len() < kind.min_len() {
        let message =
            format!("{} is {} bytes, need at least {}", kind, region.len(), kind.min_len());
        bus.iounmap(bdf, kind.bar(), region.io);
        return Err(message);
    }
    log::debug!(
        "{}: mapped {} [{:08x}-{:08x}), {} bytes",
        bdf,
        kind,
        region.start(),
        region.start() + resource.len,
        region.len()
    );
    Ok(region)
}

/// Regions mapped so far; unmaps them in reverse order if dropped before
/// [`PartialMapping::finish`].
struct PartialMapping<'a> {
    bus: &'a dyn PciBus,
    bdf: Bdf,
    regions: Vec<Region>,
}

impl PartialMapping<'_> {
    fn finish(mut self) -> Vec<Region> {
        core::mem::take(&mut self.regions)
    }
}

impl Drop for PartialMapping<'_> {
    fn drop(&mut self) {
        while let Some(region) = self.regions.pop() {
            log::debug!("{}: rolling back mapping of {}", self.bdf, region.kind);
            self.bus.iounmap(self.bdf, region.kind.bar(), region.io);
        }
    }
}

/// All four regions of one device. Always complete.
pub struct MappedRegions {
    regions: Vec<Region>,
}

impl MappedRegions {
    /// Maps registers, input buffer, output buffer and control block, in that
    /// order.
    ///
    /// If any region cannot be mapped, the ones mapped before it are unmapped
    /// again before the error is returned.
    pub fn map(bus: &dyn PciBus, bdf: Bdf) -> Result<Self> {
        let mut partial = PartialMapping { bus, bdf, regions: Vec::with_capacity(4) };
        for kind in RegionKind::ALL {
            let region = map_region(bus, bdf, kind).map_err(|message| {
                log::error!("{}: {}", bdf, message);
                Error::ResourceUnavailable(message)
            })?;
            partial.regions.push(region);
        }
        Ok(Self { regions: partial.finish() })
    }

    /// Unmaps all four regions, in reverse mapping order.
    pub fn unmap(mut self, bus: &dyn PciBus, bdf: Bdf) {
        while let Some(region) = self.regions.pop() {
            bus.iounmap(bdf, region.kind.bar(), region.io);
        }
    }

    pub fn region(&self, kind: RegionKind) -> &Region {
        &self.regions[kind as usize]
    }

    pub fn registers(&self) -> &Region {
        self.region(RegionKind::Registers)
    }

    pub fn input(&self) -> &Region {
        self.region(RegionKind::Input)
    }

    pub fn output(&self) -> &Region {
        self.region(RegionKind::Output)
    }

    pub fn control(&self) -> &Region {
        self.region(RegionKind::Control)
    }
}
