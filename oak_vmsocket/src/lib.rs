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

//! Guest driver for the VMSocket paravirtual PCI device.
//!
//! A VMSocket device lets a guest talk to a socket on the host through four
//! PCI BARs: a window of read-triggered registers, an input buffer, an output
//! buffer and a control block. The driver binds to every such device on the
//! bus, publishes one file endpoint per device (`vmsocket0`, `vmsocket1`, ...)
//! and turns reads, writes, syncs and a connect-by-path ioctl on those
//! endpoints into register operations.
//!
//! The host facilities the driver needs (PCI access and node publication) are
//! traits, so the driver can run against real hardware or against the
//! simulated device in [`sim`].

pub mod bdf;
pub mod bus;
pub mod config;
pub mod control;
pub mod driver;
pub mod endpoint;
pub mod error;
pub mod protocol;
pub mod publish;
pub mod region;
pub mod registers;
pub mod registry;
pub mod sim;
pub mod user;

pub use crate::{
    bdf::Bdf,
    config::{DriverConfig, PollPolicy},
    driver::Driver,
    endpoint::{FileDescriptor, VmSocketFile, VMSOCKET_IOCTL_CONNECT},
    error::{Errno, Error, Result},
};
