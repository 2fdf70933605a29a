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

//! A simulated VMSocket device together with the bus and publisher it lives
//! on.
//!
//! The device runs the host side of the register protocol in the thread that
//! reads the register, so every operation completes synchronously.

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use core::mem::size_of;

use crate::{
    bdf::Bdf,
    bus::{PciBus, PciFunction, Resource, VMSOCKET_DEVICE_ID, VMSOCKET_VENDOR_ID},
    control::{ControlBlock, ControlRegion},
    publish::{DevNum, NodePublisher},
    region::IoRegion,
    registers::Register,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Default size the register BAR reports; the driver maps only part of it.
pub const REGISTER_BAR_SIZE: usize = 0x1000;

/// Plain shared memory standing in for a BAR.
#[derive(Clone)]
pub struct SimMemory {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl SimMemory {
    pub fn new(len: usize) -> Self {
        Self { bytes: Arc::new(Mutex::new(vec![0; len])) }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        lock(&self.bytes).clone()
    }
}

impl IoRegion for SimMemory {
    fn len(&self) -> usize {
        lock(&self.bytes).len()
    }

    fn read_u32(&self, offset: usize) -> u32 {
        let mut value = [0u8; 4];
        self.read_bytes(offset, &mut value);
        u32::from_le_bytes(value)
    }

    fn write_u32(&self, offset: usize, value: u32) {
        self.write_bytes(offset, &value.to_le_bytes());
    }

    fn read_bytes(&self, offset: usize, dest: &mut [u8]) {
        dest.copy_from_slice(&lock(&self.bytes)[offset..offset + dest.len()]);
    }

    fn write_bytes(&self, offset: usize, src: &[u8]) {
        lock(&self.bytes)[offset..offset + src.len()].copy_from_slice(src);
    }
}

struct DeviceState {
    connect_status: i32,
    fsync_status: i32,
    close_status: i32,
    write_limit: Option<usize>,
    echo: bool,
    stalled: bool,
    script: VecDeque<u32>,
    incoming: VecDeque<u8>,
    outgoing: Vec<u8>,
    connected: Option<String>,
    log: Vec<Register>,
}

/// The host side of one VMSocket device.
pub struct SimDevice {
    register_size: usize,
    input: SimMemory,
    output: SimMemory,
    control: SimMemory,
    state: Mutex<DeviceState>,
}

impl SimDevice {
    pub fn new(input_size: usize, output_size: usize) -> Arc<Self> {
        Self::with_control_size(input_size, output_size, size_of::<ControlBlock>())
    }

    pub fn with_control_size(
        input_size: usize,
        output_size: usize,
        control_size: usize,
    ) -> Arc<Self> {
        Self::with_bar_sizes(REGISTER_BAR_SIZE, input_size, output_size, control_size)
    }

    /// A device whose four BARs report the given sizes, in BAR order.
    pub fn with_bar_sizes(
        register_size: usize,
        input_size: usize,
        output_size: usize,
        control_size: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            register_size,
            input: SimMemory::new(input_size),
            output: SimMemory::new(output_size),
            control: SimMemory::new(control_size),
            state: Mutex::new(DeviceState {
                connect_status: 0,
                fsync_status: 0,
                close_status: 0,
                write_limit: None,
                echo: false,
                stalled: false,
                script: VecDeque::new(),
                incoming: VecDeque::new(),
                outgoing: Vec::new(),
                connected: None,
                log: Vec::new(),
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        lock(&self.state)
    }

    pub fn set_connect_status(&self, status: i32) {
        self.state().connect_status = status;
    }

    pub fn set_fsync_status(&self, status: i32) {
        self.state().fsync_status = status;
    }

    pub fn set_close_status(&self, status: i32) {
        self.state().close_status = status;
    }

    /// Accept at most `limit` bytes per write.
    pub fn set_write_limit(&self, limit: Option<usize>) {
        self.state().write_limit = limit;
    }

    /// Loop written bytes back as data to read.
    pub fn set_echo(&self, echo: bool) {
        self.state().echo = echo;
    }

    /// Keep answering reads with "in progress".
    pub fn stall_reads(&self, stalled: bool) {
        self.state().stalled = stalled;
    }

    /// Queues data the host sends to the guest.
    pub fn push_incoming(&self, data: &[u8]) {
        self.state().incoming.extend(data);
    }

    /// Data the guest wrote so far.
    pub fn take_outgoing(&self) -> Vec<u8> {
        core::mem::take(&mut self.state().outgoing)
    }

    /// Values returned by the next read-register accesses, in order. A value
    /// that is within the requested count also delivers that many bytes of
    /// queued data.
    pub fn script_reads(&self, values: impl IntoIterator<Item = u32>) {
        self.state().script.extend(values);
    }

    pub fn connected_path(&self) -> Option<String> {
        self.state().connected.clone()
    }

    /// Every register access so far.
    pub fn register_log(&self) -> Vec<Register> {
        self.state().log.clone()
    }

    /// Current contents of the control block.
    pub fn control(&self) -> ControlBlock {
        ControlRegion::new(&self.control).snapshot()
    }

    fn bar_len(&self, bar: u8) -> Option<usize> {
        match bar {
            0 => Some(self.register_size),
            1 => Some(self.input.len()),
            2 => Some(self.output.len()),
            3 => Some(self.control.len()),
            _ => None,
        }
    }

    /// Copies up to `count` queued bytes into the input buffer.
    fn deliver(&self, state: &mut DeviceState, count: usize) {
        let count = count.min(state.incoming.len()).min(self.input.len());
        let data: Vec<u8> = state.incoming.drain(..count).collect();
        self.input.write_bytes(0, &data);
    }

    fn handle(&self, register: Register) -> u32 {
        let mut state = self.state();
        state.log.push(register);
        let control = ControlRegion::new(&self.control);
        match register {
            Register::Connect => {
                if state.connect_status == 0 {
                    state.connected = Some(control.path());
                }
                state.connect_status as u32
            }
            Register::Read => {
                let requested = control.bytes_to_read();
                if state.stalled {
                    return requested.saturating_add(1);
                }
                if let Some(value) = state.script.pop_front() {
                    if (value as i32) >= 0 && value <= requested {
                        self.deliver(&mut state, value as usize);
                    }
                    return value;
                }
                let count = (requested as usize).min(state.incoming.len()).min(self.input.len());
                self.deliver(&mut state, count);
                count as u32
            }
            Register::Write => {
                let offered = (control.bytes_to_write() as usize).min(self.output.len());
                let accepted = state.write_limit.map_or(offered, |limit| offered.min(limit));
                let mut data = vec![0u8; accepted];
                self.output.read_bytes(0, &mut data);
                if state.echo {
                    state.incoming.extend(&data);
                }
                state.outgoing.extend_from_slice(&data);
                accepted as u32
            }
            Register::Fsync => state.fsync_status as u32,
            Register::Close => {
                if state.close_status == 0 {
                    state.connected = None;
                }
                state.close_status as u32
            }
        }
    }
}

/// The mapped register window of a [`SimDevice`].
pub struct SimRegisters {
    device: Arc<SimDevice>,
    len: usize,
}

impl IoRegion for SimRegisters {
    fn len(&self) -> usize {
        self.len
    }

    fn read_u32(&self, offset: usize) -> u32 {
        assert!(offset + 4 <= self.len, "register read at {:#x} outside the window", offset);
        match Register::from_repr(offset) {
            Some(register) => self.device.handle(register),
            None => u32::MAX,
        }
    }

    fn write_u32(&self, offset: usize, value: u32) {
        log::warn!("ignoring write of {:#x} to read-only register {:#x}", value, offset);
    }

    fn read_bytes(&self, _offset: usize, dest: &mut [u8]) {
        dest.fill(0xff);
    }

    fn write_bytes(&self, offset: usize, _src: &[u8]) {
        log::warn!("ignoring write to read-only register {:#x}", offset);
    }
}

struct Slot {
    function: PciFunction,
    device: Option<Arc<SimDevice>>,
    enabled: bool,
    regions_requested: bool,
    mapped: BTreeSet<u8>,
}

#[derive(Default)]
struct BusState {
    slots: BTreeMap<Bdf, Slot>,
    next: Option<Bdf>,
    fail_map: BTreeSet<(Bdf, u8)>,
    fail_enable: BTreeSet<Bdf>,
    fail_request_regions: BTreeSet<Bdf>,
    map_calls: Vec<(Bdf, u8)>,
    unmap_calls: Vec<(Bdf, u8)>,
}

const FIRST_SLOT: Bdf = match Bdf::new(0, 3, 0) {
    Ok(bdf) => bdf,
    Err(_) => panic!("invalid first slot"),
};

/// A PCI bus populated with simulated functions.
#[derive(Default)]
pub struct SimulatedBus {
    state: Mutex<BusState>,
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BusState> {
        lock(&self.state)
    }

    /// Plugs `device` into the next free device slot, starting at `00:03.0`.
    pub fn add_device(&self, device: Arc<SimDevice>) -> PciFunction {
        let mut state = self.state();
        let mut bdf = state.next.unwrap_or(FIRST_SLOT);
        while state.slots.contains_key(&bdf) {
            bdf = bdf.next_device().unwrap_or_else(|| panic!("simulated bus is full"));
        }
        state.next = bdf.next_device();
        drop(state);
        self.add_device_at(bdf, device)
    }

    pub fn add_device_at(&self, bdf: Bdf, device: Arc<SimDevice>) -> PciFunction {
        let function =
            PciFunction { bdf, vendor_id: VMSOCKET_VENDOR_ID, device_id: VMSOCKET_DEVICE_ID };
        self.insert(function, Some(device));
        function
    }

    /// Plugs in a function that is not a VMSocket device.
    pub fn add_function(&self, bdf: Bdf, vendor_id: u16, device_id: u16) -> PciFunction {
        let function = PciFunction { bdf, vendor_id, device_id };
        self.insert(function, None);
        function
    }

    fn insert(&self, function: PciFunction, device: Option<Arc<SimDevice>>) {
        let slot = Slot {
            function,
            device,
            enabled: false,
            regions_requested: false,
            mapped: BTreeSet::new(),
        };
        self.state().slots.insert(function.bdf, slot);
    }

    /// Unplugs the function at `bdf`.
    pub fn remove_device(&self, bdf: Bdf) {
        self.state().slots.remove(&bdf);
    }

    pub fn fail_map(&self, bdf: Bdf, bar: u8) {
        self.state().fail_map.insert((bdf, bar));
    }

    pub fn fail_enable(&self, bdf: Bdf) {
        self.state().fail_enable.insert(bdf);
    }

    pub fn fail_request_regions(&self, bdf: Bdf) {
        self.state().fail_request_regions.insert(bdf);
    }

    /// Every successful `iomap` call, in order.
    pub fn map_calls(&self) -> Vec<(Bdf, u8)> {
        self.state().map_calls.clone()
    }

    /// Every `iounmap` call, in order.
    pub fn unmap_calls(&self) -> Vec<(Bdf, u8)> {
        self.state().unmap_calls.clone()
    }

    /// Number of BARs of `bdf` currently mapped.
    pub fn mapped_count(&self, bdf: Bdf) -> usize {
        self.state().slots.get(&bdf).map_or(0, |slot| slot.mapped.len())
    }

    pub fn is_enabled(&self, bdf: Bdf) -> bool {
        self.state().slots.get(&bdf).is_some_and(|slot| slot.enabled)
    }

    pub fn regions_requested(&self, bdf: Bdf) -> bool {
        self.state().slots.get(&bdf).is_some_and(|slot| slot.regions_requested)
    }

    fn base_address(bdf: Bdf, bar: u8) -> u64 {
        0x1_0000_0000 + u64::from(u16::from(bdf)) * 0x1000_0000 + u64::from(bar) * 0x400_0000
    }
}

impl PciBus for SimulatedBus {
    fn functions(&self) -> Vec<PciFunction> {
        self.state().slots.values().map(|slot| slot.function).collect()
    }

    fn enable_device(&self, bdf: Bdf) -> Result<(), &'static str> {
        let mut state = self.state();
        if state.fail_enable.contains(&bdf) {
            return Err("injected enable failure");
        }
        let slot = state.slots.get_mut(&bdf).ok_or("no such device")?;
        slot.enabled = true;
        Ok(())
    }

    fn disable_device(&self, bdf: Bdf) {
        if let Some(slot) = self.state().slots.get_mut(&bdf) {
            slot.enabled = false;
        }
    }

    fn request_regions(&self, bdf: Bdf, _owner: &str) -> Result<(), &'static str> {
        let mut state = self.state();
        if state.fail_request_regions.contains(&bdf) {
            return Err("injected reservation failure");
        }
        let slot = state.slots.get_mut(&bdf).ok_or("no such device")?;
        if slot.regions_requested {
            return Err("regions already reserved");
        }
        slot.regions_requested = true;
        Ok(())
    }

    fn release_regions(&self, bdf: Bdf) {
        if let Some(slot) = self.state().slots.get_mut(&bdf) {
            slot.regions_requested = false;
        }
    }

    fn resource(&self, bdf: Bdf, bar: u8) -> Option<Resource> {
        let state = self.state();
        let len = state.slots.get(&bdf)?.device.as_ref()?.bar_len(bar)?;
        Some(Resource { start: Self::base_address(bdf, bar), len: len as u64 })
    }

    fn iomap(
        &self,
        bdf: Bdf,
        bar: u8,
        max_len: usize,
    ) -> Result<Box<dyn IoRegion>, &'static str> {
        let mut state = self.state();
        if state.fail_map.contains(&(bdf, bar)) {
            return Err("injected mapping failure");
        }
        let slot = state.slots.get_mut(&bdf).ok_or("no such device")?;
        let device = slot.device.clone().ok_or("function has no BARs")?;
        let region: Box<dyn IoRegion> = match bar {
            0 => {
                let len = match max_len {
                    0 => device.register_size,
                    len => len.min(device.register_size),
                };
                Box::new(SimRegisters { device, len })
            }
            1 => Box::new(device.input.clone()),
            2 => Box::new(device.output.clone()),
            3 => Box::new(device.control.clone()),
            _ => return Err("no such BAR"),
        };
        slot.mapped.insert(bar);
        state.map_calls.push((bdf, bar));
        Ok(region)
    }

    fn iounmap(&self, bdf: Bdf, bar: u8, region: Box<dyn IoRegion>) {
        let mut state = self.state();
        if let Some(slot) = state.slots.get_mut(&bdf) {
            slot.mapped.remove(&bar);
        }
        state.unmap_calls.push((bdf, bar));
        drop(region);
    }
}

#[derive(Default)]
struct PublisherState {
    regions: usize,
    classes: BTreeSet<String>,
    classes_created: usize,
    classes_destroyed: usize,
    nodes: BTreeMap<DevNum, String>,
    fail_publish: bool,
    fail_create_class: bool,
}

/// Records what the driver publishes.
#[derive(Default)]
pub struct SimPublisher {
    state: Mutex<PublisherState>,
}

/// Major number handed out by [`SimPublisher`].
pub const SIM_MAJOR: u32 = 240;

impl SimPublisher {
    fn state(&self) -> MutexGuard<'_, PublisherState> {
        lock(&self.state)
    }

    /// Names of published nodes, by device number.
    pub fn nodes(&self) -> Vec<String> {
        self.state().nodes.values().cloned().collect()
    }

    pub fn has_class(&self, name: &str) -> bool {
        self.state().classes.contains(name)
    }

    pub fn classes_created(&self) -> usize {
        self.state().classes_created
    }

    pub fn classes_destroyed(&self) -> usize {
        self.state().classes_destroyed
    }

    /// Device number ranges currently allocated.
    pub fn allocated_regions(&self) -> usize {
        self.state().regions
    }

    pub fn fail_publish(&self, fail: bool) {
        self.state().fail_publish = fail;
    }

    pub fn fail_create_class(&self, fail: bool) {
        self.state().fail_create_class = fail;
    }
}

impl NodePublisher for SimPublisher {
    fn alloc_chrdev_region(
        &self,
        _first_minor: u32,
        _count: u32,
        _name: &str,
    ) -> Result<u32, &'static str> {
        self.state().regions += 1;
        Ok(SIM_MAJOR)
    }

    fn unregister_chrdev_region(&self, _first: DevNum, _count: u32) {
        let mut state = self.state();
        state.regions = state.regions.saturating_sub(1);
    }

    fn create_class(&self, name: &str) -> Result<(), &'static str> {
        let mut state = self.state();
        if state.fail_create_class {
            return Err("injected class failure");
        }
        if !state.classes.insert(name.to_string()) {
            return Err("class already exists");
        }
        state.classes_created += 1;
        Ok(())
    }

    fn destroy_class(&self, name: &str) {
        let mut state = self.state();
        if state.classes.remove(name) {
            state.classes_destroyed += 1;
        }
    }

    fn publish(&self, class: &str, number: DevNum, node: &str) -> Result<(), &'static str> {
        let mut state = self.state();
        if state.fail_publish {
            return Err("injected publish failure");
        }
        if !state.classes.contains(class) {
            return Err("no such class");
        }
        if state.nodes.contains_key(&number) {
            return Err("device number in use");
        }
        state.nodes.insert(number, node.to_string());
        Ok(())
    }

    fn unpublish(&self, _class: &str, number: DevNum) {
        self.state().nodes.remove(&number);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::REGISTER_WINDOW;

    #[test]
    fn test_echo_device() {
        let device = SimDevice::new(64, 64);
        device.set_echo(true);
        device.output.write_bytes(0, b"ping");
        device.control.write_u32(1028, 4);
        assert_eq!(device.handle(Register::Write), 4);
        device.control.write_u32(1024, 64);
        assert_eq!(device.handle(Register::Read), 4);
        assert_eq!(&device.input.to_vec()[..4], b"ping");
        assert_eq!(device.take_outgoing(), b"ping".to_vec());
    }

    #[test]
    fn test_unknown_register() {
        let bus = SimulatedBus::new();
        let function = bus.add_device(SimDevice::new(16, 16));
        let registers = bus.iomap(function.bdf, 0, REGISTER_WINDOW).unwrap();
        assert_eq!(registers.len(), REGISTER_WINDOW);
        assert_eq!(registers.read_u32(0x04), u32::MAX);
    }

    #[test]
    fn test_add_device_assigns_slots() {
        let bus = SimulatedBus::new();
        let first = bus.add_device(SimDevice::new(16, 16));
        let second = bus.add_device(SimDevice::new(16, 16));
        assert_eq!(first.bdf.to_string(), "00:03.0");
        assert_eq!(second.bdf.to_string(), "00:04.0");
        assert_eq!(bus.functions().len(), 2);
    }
}
