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

//! The register protocol.
//!
//! Every operation follows the same handshake: fill in the control block (and
//! the output buffer for writes), then read the operation's register. The
//! device handles the request while the register read is in flight and
//! returns the result as the register value.
//!
//! Reads are the only operation that can take longer than one round trip:
//! while data is still arriving, the device answers with a value larger than
//! the requested byte count, and the driver polls again.

use std::{thread, time::Instant};

use core::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::{
    config::PollPolicy,
    control::ControlRegion,
    error::{Error, Result},
    region::MappedRegions,
    registers::{Register, RegisterBank},
    user::{UserReader, UserWriter},
};

/// Waits between polls: yields for the first rounds, then sleeps with an
/// exponentially growing interval.
pub struct Backoff<'a> {
    policy: &'a PollPolicy,
    round: u32,
    interval: Duration,
}

impl<'a> Backoff<'a> {
    pub fn new(policy: &'a PollPolicy) -> Self {
        Self { policy, round: 0, interval: policy.initial_interval }
    }

    pub fn wait(&mut self) {
        if self.round < self.policy.spin_rounds {
            thread::yield_now();
        } else {
            thread::sleep(self.interval);
            self.interval = (self.interval * 2).min(self.policy.max_interval);
        }
        self.round = self.round.saturating_add(1);
    }

    /// Number of completed waits.
    pub fn rounds(&self) -> u32 {
        self.round
    }
}

/// Clamps a transfer length to what the device buffer and the 32-bit control
/// block fields can carry.
fn clamp(requested: usize, buffer_len: usize) -> u32 {
    u32::try_from(requested.min(buffer_len)).unwrap_or(u32::MAX)
}

/// Runs the protocol against one mapped device.
pub struct Connection<'a> {
    regions: &'a MappedRegions,
    poll: &'a PollPolicy,
    cancel: &'a CancellationToken,
}

impl<'a> Connection<'a> {
    pub fn new(
        regions: &'a MappedRegions,
        poll: &'a PollPolicy,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self { regions, poll, cancel }
    }

    fn registers(&self) -> RegisterBank<'a> {
        RegisterBank::new(self.regions.registers().io())
    }

    fn control(&self) -> ControlRegion<'a> {
        ControlRegion::new(self.regions.control().io())
    }

    /// Asks the device to connect to the host socket at `path`.
    pub fn connect(&self, path: &str) -> Result<()> {
        let control = self.control();
        control.set_path(path)?;
        let status = self.registers().trigger(Register::Connect);
        if status != 0 {
            log::warn!("connect to {} failed with status {}", path, status);
            return Err(Error::ConnectFailed(status));
        }
        log::info!("connected to {}", control.path());
        Ok(())
    }

    /// Reads at most `dest.len()` bytes, blocking until the device has them
    /// ready.
    pub fn read(&self, dest: &mut dyn UserWriter) -> Result<usize> {
        let input = self.regions.input();
        let bytes_to_read = clamp(dest.len(), input.len());
        self.control().set_bytes_to_read(bytes_to_read);

        let registers = self.registers();
        let started = Instant::now();
        let mut backoff = Backoff::new(self.poll);
        let ready = loop {
            let value = registers.trigger(Register::Read);
            if value < 0 {
                log::error!("read failed with device error {}", value);
                return Err(Error::Device(value));
            }
            if value as u32 <= bytes_to_read {
                break value as usize;
            }
            log::trace!("read in progress: {} bytes pending, asked for {}", value, bytes_to_read);
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if let Some(timeout) = self.poll.timeout {
                if started.elapsed() >= timeout {
                    log::warn!("read gave up after {} polls", backoff.rounds() + 1);
                    return Err(Error::Timeout(timeout));
                }
            }
            backoff.wait();
        };

        let mut buffer = vec![0u8; ready];
        input.io().read_bytes(0, &mut buffer);
        dest.write_from(&buffer).map_err(|_| Error::TransferFault)?;
        Ok(ready)
    }

    /// Hands at most one output buffer worth of `src` to the device.
    ///
    /// Returns how many bytes the device accepted, which may be fewer than
    /// were offered.
    pub fn write(&self, src: &dyn UserReader) -> Result<usize> {
        let output = self.regions.output();
        let bytes_to_write = clamp(src.len(), output.len());

        let mut buffer = vec![0u8; bytes_to_write as usize];
        src.read_into(&mut buffer).map_err(|_| Error::TransferFault)?;
        output.io().write_bytes(0, &buffer);
        self.control().set_bytes_to_write(bytes_to_write);

        let accepted = self.registers().trigger(Register::Write);
        if accepted < 0 {
            log::error!("write failed with device error {}", accepted);
            return Err(Error::Device(accepted));
        }
        Ok(accepted as usize)
    }

    /// Triggers the sync register and returns its status unchanged.
    pub fn flush(&self) -> i32 {
        self.registers().trigger(Register::Fsync)
    }

    /// Triggers the close register and returns its status unchanged.
    pub fn close(&self) -> i32 {
        self.registers().trigger(Register::Close)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        bus::PciBus,
        sim::{SimDevice, SimulatedBus},
        user::{Fault, UserSlice, UserSliceMut},
    };

    struct Faulty;

    impl UserReader for Faulty {
        fn len(&self) -> usize {
            64
        }

        fn read_into(&self, _dest: &mut [u8]) -> core::result::Result<(), Fault> {
            Err(Fault)
        }
    }

    impl UserWriter for Faulty {
        fn len(&self) -> usize {
            64
        }

        fn write_from(&mut self, _src: &[u8]) -> core::result::Result<(), Fault> {
            Err(Fault)
        }
    }

    struct Fixture {
        bus: SimulatedBus,
        device: Arc<SimDevice>,
        regions: Option<MappedRegions>,
        poll: PollPolicy,
        cancel: CancellationToken,
    }

    impl Fixture {
        fn new(input_size: usize, output_size: usize) -> Self {
            let bus = SimulatedBus::new();
            let device = SimDevice::new(input_size, output_size);
            let function = bus.add_device(device.clone());
            let regions = MappedRegions::map(&bus, function.bdf).unwrap();
            let poll = PollPolicy {
                spin_rounds: 2,
                initial_interval: Duration::from_micros(10),
                max_interval: Duration::from_micros(100),
                timeout: Some(Duration::from_secs(5)),
            };
            Self { bus, device, regions: Some(regions), poll, cancel: CancellationToken::new() }
        }

        fn connection(&self) -> Connection<'_> {
            Connection::new(self.regions.as_ref().unwrap(), &self.poll, &self.cancel)
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            if let Some(regions) = self.regions.take() {
                let bdf = self.bus.functions()[0].bdf;
                regions.unmap(&self.bus, bdf);
            }
        }
    }

    #[test]
    fn test_connect() {
        let fixture = Fixture::new(64, 64);
        assert_eq!(fixture.connection().connect("/tmp/sock"), Ok(()));
        assert_eq!(fixture.device.connected_path().as_deref(), Some("/tmp/sock"));
        assert_eq!(fixture.device.register_log(), vec![Register::Connect]);
    }

    #[test]
    fn test_connect_rejected() {
        let fixture = Fixture::new(64, 64);
        fixture.device.set_connect_status(-111);
        assert_eq!(fixture.connection().connect("/tmp/none"), Err(Error::ConnectFailed(-111)));
        assert_eq!(fixture.device.connected_path(), None);
    }

    #[test]
    fn test_connect_path_too_long_skips_register() {
        let fixture = Fixture::new(64, 64);
        let path = "x".repeat(2000);
        assert_eq!(fixture.connection().connect(&path), Err(Error::PathTooLong));
        assert!(fixture.device.register_log().is_empty());
    }

    #[test]
    fn test_write_clamps_to_output_buffer() {
        let fixture = Fixture::new(64, 2048);
        let data = vec![7u8; 4096];
        assert_eq!(fixture.connection().write(&UserSlice::new(&data)), Ok(2048));
        assert_eq!(fixture.device.control().bytes_to_write, 2048);
        assert_eq!(fixture.device.take_outgoing(), vec![7u8; 2048]);
    }

    #[test]
    fn test_short_write() {
        let fixture = Fixture::new(64, 64);
        fixture.device.set_write_limit(Some(10));
        assert_eq!(fixture.connection().write(&UserSlice::new(&[1u8; 40])), Ok(10));
        assert_eq!(fixture.device.control().bytes_to_write, 40);
    }

    #[test]
    fn test_zero_length_write_still_triggers() {
        let fixture = Fixture::new(64, 64);
        assert_eq!(fixture.connection().write(&UserSlice::new(&[])), Ok(0));
        assert_eq!(fixture.device.register_log(), vec![Register::Write]);
        assert_eq!(fixture.device.control().bytes_to_write, 0);
    }

    #[test]
    fn test_write_fault_does_not_trigger() {
        let fixture = Fixture::new(64, 64);
        assert_eq!(fixture.connection().write(&Faulty), Err(Error::TransferFault));
        assert!(fixture.device.register_log().is_empty());
    }

    #[test]
    fn test_read_polls_until_ready() {
        let fixture = Fixture::new(4096, 64);
        let payload: Vec<u8> = (0..80).collect();
        fixture.device.push_incoming(&payload);
        fixture.device.script_reads([150, 150, 80]);

        let mut buffer = [0u8; 100];
        let count = fixture.connection().read(&mut UserSliceMut::new(&mut buffer)).unwrap();
        assert_eq!(count, 80);
        assert_eq!(&buffer[..80], &payload[..]);
        assert_eq!(fixture.device.control().bytes_to_read, 100);
        assert_eq!(fixture.device.register_log(), vec![Register::Read; 3]);
    }

    #[test]
    fn test_read_clamps_to_input_buffer() {
        let fixture = Fixture::new(16, 64);
        fixture.device.push_incoming(&[9u8; 40]);
        let mut buffer = [0u8; 100];
        let count = fixture.connection().read(&mut UserSliceMut::new(&mut buffer)).unwrap();
        assert_eq!(count, 16);
        assert_eq!(fixture.device.control().bytes_to_read, 16);
    }

    #[test]
    fn test_zero_length_read() {
        let fixture = Fixture::new(16, 64);
        fixture.device.push_incoming(&[9u8; 4]);
        let mut buffer = [0u8; 0];
        assert_eq!(fixture.connection().read(&mut UserSliceMut::new(&mut buffer)), Ok(0));
        assert_eq!(fixture.device.register_log(), vec![Register::Read]);
    }

    #[test]
    fn test_read_fault() {
        let fixture = Fixture::new(16, 64);
        fixture.device.push_incoming(&[9u8; 4]);
        assert_eq!(fixture.connection().read(&mut Faulty), Err(Error::TransferFault));
    }

    #[test]
    fn test_read_device_error() {
        let fixture = Fixture::new(16, 64);
        fixture.device.script_reads([u32::MAX]);
        let mut buffer = [0u8; 8];
        assert_eq!(
            fixture.connection().read(&mut UserSliceMut::new(&mut buffer)),
            Err(Error::Device(-1))
        );
    }

    #[test]
    fn test_read_timeout() {
        let mut fixture = Fixture::new(16, 64);
        fixture.poll.timeout = Some(Duration::from_millis(20));
        fixture.device.stall_reads(true);
        let mut buffer = [0u8; 8];
        assert_eq!(
            fixture.connection().read(&mut UserSliceMut::new(&mut buffer)),
            Err(Error::Timeout(Duration::from_millis(20)))
        );
    }

    #[test]
    fn test_read_cancelled() {
        let fixture = Fixture::new(16, 64);
        fixture.device.script_reads([1000, 1000, 1000]);
        fixture.cancel.cancel();
        let mut buffer = [0u8; 8];
        assert_eq!(
            fixture.connection().read(&mut UserSliceMut::new(&mut buffer)),
            Err(Error::Cancelled)
        );
        // The first poll still happens; a completed transfer is never thrown away.
        assert_eq!(fixture.device.register_log(), vec![Register::Read]);
    }

    #[test]
    fn test_flush_and_close_statuses() {
        let fixture = Fixture::new(16, 16);
        fixture.device.set_fsync_status(5);
        fixture.device.set_close_status(-2);
        assert_eq!(fixture.connection().flush(), 5);
        assert_eq!(fixture.connection().close(), -2);
    }

    #[test]
    fn test_backoff_sleeps_after_spinning() {
        let poll = PollPolicy {
            spin_rounds: 1,
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(2),
            timeout: None,
        };
        let mut backoff = Backoff::new(&poll);
        let started = Instant::now();
        backoff.wait();
        backoff.wait();
        backoff.wait();
        backoff.wait();
        assert_eq!(backoff.rounds(), 4);
        // 1ms + 2ms + 2ms (capped).
        assert!(started.elapsed() >= Duration::from_millis(5));
    }
}
