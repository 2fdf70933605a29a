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

use core::time::Duration;

use crate::error::{Error, Result};

/// Hard upper bound on the number of devices one driver instance manages.
pub const MAX_INSTANCES: usize = 128;

/// Name used for the device number range, the device class, the region
/// reservation and as the prefix of every published node.
pub const DRIVER_NAME: &str = "vmsocket";

/// How a blocking read waits for the device to finish a transfer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollPolicy {
    /// Polls answered with `yield_now` before the driver starts sleeping.
    pub spin_rounds: u32,
    /// First sleep after the spin phase; doubled on every further poll.
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// Give up with [`Error::Timeout`] after this long. `None` waits until the
    /// device completes or the read is cancelled.
    pub timeout: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            spin_rounds: 16,
            initial_interval: Duration::from_micros(50),
            max_interval: Duration::from_millis(10),
            timeout: Some(Duration::from_secs(30)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DriverConfig {
    pub name: String,
    /// Number of device slots; at most [`MAX_INSTANCES`].
    pub max_instances: usize,
    pub poll: PollPolicy,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            name: DRIVER_NAME.to_string(),
            max_instances: MAX_INSTANCES,
            poll: PollPolicy::default(),
        }
    }
}

impl DriverConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_instances > MAX_INSTANCES {
            return Err(Error::ConfigurationExceeded(MAX_INSTANCES));
        }
        if self.max_instances == 0 {
            return Err(Error::InvalidConfig("at least one device slot is needed".to_string()));
        }
        if self.name.is_empty() {
            return Err(Error::InvalidConfig("driver name must not be empty".to_string()));
        }
        // A zero interval would turn every sleep into a busy loop.
        if self.poll.initial_interval.is_zero() {
            return Err(Error::InvalidConfig("initial poll interval must not be zero".to_string()));
        }
        if self.poll.initial_interval > self.poll.max_interval {
            return Err(Error::InvalidConfig(
                "initial poll interval is larger than the maximum".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = DriverConfig::default();
        assert_eq!(config.max_instances, 128);
        assert_eq!(config.name, "vmsocket");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_capacity_bounds() {
        let config = DriverConfig { max_instances: 129, ..Default::default() };
        assert_eq!(config.validate(), Err(Error::ConfigurationExceeded(128)));
        let config = DriverConfig { max_instances: 0, ..Default::default() };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
        let config = DriverConfig { max_instances: 1, ..Default::default() };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_poll_intervals() {
        let poll = PollPolicy {
            initial_interval: Duration::from_millis(20),
            max_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let config = DriverConfig { poll, ..Default::default() };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_zero_initial_interval() {
        let poll = PollPolicy { initial_interval: Duration::ZERO, ..Default::default() };
        let config = DriverConfig { poll, ..Default::default() };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
        assert_eq!(config.validate().map_err(|err| err.to_status()), Err(-22));
    }

    #[test]
    fn test_empty_name() {
        let config = DriverConfig { name: String::new(), ..Default::default() };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }
}
