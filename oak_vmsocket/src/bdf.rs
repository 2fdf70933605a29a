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

use core::fmt::Display;

/// Address of a PCI function in the bus-device-function format.
///
/// The driver never looks inside the address; it is the opaque handle the bus
/// hands out on discovery and expects back on every resource request.
///
/// Basic structure: BBBBBBBBDDDDDFFF
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Bdf(u16);

impl Bdf {
    pub const fn new(bus: u8, device: u8, function: u8) -> Result<Self, &'static str> {
        if device > 0b11111 {
            return Err("invalid device number");
        }
        if function > 0b111 {
            return Err("invalid function number");
        }

        Ok(Self((bus as u16) << 8 | (device as u16) << 3 | (function as u16)))
    }

    #[inline]
    pub fn bus(&self) -> u8 {
        (self.0 >> 8) as u8
    }

    #[inline]
    pub fn device(&self) -> u8 {
        ((self.0 >> 3) & 0b11111) as u8
    }

    #[inline]
    pub fn function(&self) -> u8 {
        (self.0 & 0b111) as u8
    }

    /// Returns function 0 of the next device slot, moving on to the next bus
    /// after device 31.
    ///
    /// Returns None after `ff:1f.x`.
    pub fn next_device(&self) -> Option<Self> {
        self.0.checked_add(1 << 3).map(|value| Self(value & !0b111))
    }
}

impl Display for Bdf {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:02x}:{:02x}.{:x}", self.bus(), self.device(), self.function())
    }
}

impl TryFrom<(u8, u8, u8)> for Bdf {
    type Error = &'static str;

    fn try_from((bus, device, function): (u8, u8, u8)) -> Result<Self, Self::Error> {
        Bdf::new(bus, device, function)
    }
}

impl From<Bdf> for u16 {
    fn from(value: Bdf) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use googletest::prelude::*;

    use super::*;

    #[test]
    fn test_new_bdf() {
        assert_that!(Bdf::new(0, 3, 0), ok(displays_as(eq("00:03.0"))));
        assert_that!(Bdf::new(0, 31, 7), ok(displays_as(eq("00:1f.7"))));
        assert_that!(Bdf::new(255, 31, 7), ok(displays_as(eq("ff:1f.7"))));
        assert_that!(Bdf::new(0, 32, 0), err(anything()));
        assert_that!(Bdf::new(0, 31, 8), err(anything()));
    }

    #[test]
    fn test_bdf_fields() {
        let bdf = Bdf::try_from((0x12, 0x05, 0x3)).unwrap();
        assert_eq!(bdf.bus(), 0x12);
        assert_eq!(bdf.device(), 0x05);
        assert_eq!(bdf.function(), 0x3);
        assert_eq!(u16::from(bdf), 0x122b);
    }

    #[test]
    fn test_next_device() {
        let next = |bus, device, function| Bdf::new(bus, device, function).unwrap().next_device();
        let bdf = |bus, device, function| Bdf::new(bus, device, function).unwrap();
        assert_that!(next(0, 3, 0), some(eq(bdf(0, 4, 0))));
        assert_that!(next(0, 3, 5), some(eq(bdf(0, 4, 0))));
        assert_that!(next(0, 31, 0), some(eq(bdf(1, 0, 0))));
        assert_that!(next(255, 31, 0), none());
    }
}
