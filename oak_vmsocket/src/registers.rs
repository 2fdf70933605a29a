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

use strum::{Display, FromRepr};

use crate::region::IoRegion;

/// Size of the register window mapped from BAR0, whatever the BAR reports.
pub const REGISTER_WINDOW: usize = 0x100;

/// Read-only registers. Reading one makes the device perform the operation
/// and returns its result.
#[derive(Copy, Clone, Debug, Display, Eq, FromRepr, Hash, PartialEq)]
#[repr(usize)]
pub enum Register {
    Connect = 0x00,
    Read = 0x20,
    Write = 0x40,
    Fsync = 0x60,
    Close = 0x80,
}

impl Register {
    pub const fn offset(self) -> usize {
        self as usize
    }
}

/// The register window of one device.
pub struct RegisterBank<'a> {
    io: &'a dyn IoRegion,
}

impl<'a> RegisterBank<'a> {
    pub fn new(io: &'a dyn IoRegion) -> Self {
        Self { io }
    }

    /// Triggers the operation and returns the device's signed result.
    pub fn trigger(&self, register: Register) -> i32 {
        self.io.read_u32(register.offset()) as i32
    }
}
