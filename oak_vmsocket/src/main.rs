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

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use oak_vmsocket::{
    sim::{SimDevice, SimPublisher, SimulatedBus},
    user::{UserSlice, UserSliceMut},
    Driver, DriverConfig, FileDescriptor, PollPolicy,
};

/// Runs the driver against simulated echo devices.
#[derive(Parser, Debug)]
struct Args {
    /// Number of simulated devices on the bus.
    #[arg(long, default_value = "1")]
    devices: usize,

    /// Host socket path to connect to.
    #[arg(long, default_value = "/tmp/vmsocket.sock")]
    path: String,

    /// Message written to the device and read back.
    #[arg(long, default_value = "hello from the guest")]
    message: String,

    /// Size of each device's input buffer.
    #[arg(long, default_value = "4096")]
    input_size: usize,

    /// Size of each device's output buffer.
    #[arg(long, default_value = "4096")]
    output_size: usize,

    /// Give up on a read after this many milliseconds; 0 waits forever.
    #[arg(long, default_value = "30000")]
    read_timeout_ms: u64,

    #[arg(long, default_value = "128")]
    max_instances: usize,
}

fn main() -> anyhow::Result<()> {
    let cli = Args::parse();
    env_logger::init();

    let bus = Arc::new(SimulatedBus::new());
    for _ in 0..cli.devices {
        let device = SimDevice::new(cli.input_size, cli.output_size);
        device.set_echo(true);
        bus.add_device(device);
    }
    let publisher = Arc::new(SimPublisher::default());

    let config = DriverConfig {
        max_instances: cli.max_instances,
        poll: PollPolicy {
            timeout: (cli.read_timeout_ms > 0).then(|| Duration::from_millis(cli.read_timeout_ms)),
            ..Default::default()
        },
        ..Default::default()
    };
    let driver = Driver::start(bus, publisher.clone(), config).context("couldn't start driver")?;
    log::info!("published nodes: {:?}", publisher.nodes());

    let mut file = driver.open(0).context("couldn't open vmsocket0")?;
    file.connect(&cli.path).with_context(|| format!("couldn't connect to {}", cli.path))?;

    let written =
        file.write(&UserSlice::new(cli.message.as_bytes())).context("couldn't write message")?;
    log::info!("wrote {} of {} bytes", written, cli.message.len());

    let mut buffer = vec![0u8; written];
    let read = file.read(&mut UserSliceMut::new(&mut buffer)).context("couldn't read reply")?;
    println!("{}", String::from_utf8_lossy(&buffer[..read]));

    let status = file.fsync(false).context("couldn't sync")?;
    log::info!("sync status {}", status);

    file.release().context("couldn't release vmsocket0")?;
    driver.stop();
    Ok(())
}
