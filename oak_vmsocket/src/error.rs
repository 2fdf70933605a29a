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

use strum::{Display, FromRepr};

use crate::control::MAX_PATH_LEN;

/// Status codes handed back to callers of the file endpoint.
#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Copy, Debug, Display, Eq, FromRepr, PartialEq)]
#[repr(isize)]
#[non_exhaustive]
pub enum Errno {
    /// Input/output error
    EIO = -5,
    /// Bad address
    EFAULT = -14,
    /// Device or resource busy
    EBUSY = -16,
    /// No such device
    ENODEV = -19,
    /// Invalid argument
    EINVAL = -22,
    /// Inappropriate ioctl for device
    ENOTTY = -25,
    /// No space left on device
    ENOSPC = -28,
    /// File name too long
    ENAMETOOLONG = -36,
    /// Connection timed out
    ETIMEDOUT = -110,
    /// Operation canceled
    ECANCELED = -125,
}

#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("couldn't acquire device resources: {0}")]
    ResourceUnavailable(String),
    #[error("device is already open")]
    Busy,
    #[error("device rejected the connect request with status {0}")]
    ConnectFailed(i32),
    #[error("path is longer than {} bytes", MAX_PATH_LEN)]
    PathTooLong,
    #[error("path contains a NUL byte or is not valid UTF-8")]
    InvalidPath,
    #[error("caller buffer is not accessible")]
    TransferFault,
    #[error("device reported status {0} on close")]
    CloseFailed(i32),
    #[error("all {0} device slots are in use")]
    ConfigurationExceeded(usize),
    #[error("invalid driver configuration: {0}")]
    InvalidConfig(String),
    #[error("device reported error {0}")]
    Device(i32),
    #[error("device did not complete the transfer within {0:?}")]
    Timeout(Duration),
    #[error("operation was cancelled")]
    Cancelled,
    #[error("no such device")]
    NoDevice,
    #[error("unsupported ioctl request {0:#x}")]
    NotTty(u32),
}

impl Error {
    pub fn errno(&self) -> Errno {
        match self {
            Error::ResourceUnavailable(_) | Error::Busy => Errno::EBUSY,
            Error::ConnectFailed(_) | Error::CloseFailed(_) | Error::Device(_) => Errno::EIO,
            Error::PathTooLong => Errno::ENAMETOOLONG,
            Error::InvalidPath | Error::InvalidConfig(_) => Errno::EINVAL,
            Error::TransferFault => Errno::EFAULT,
            Error::ConfigurationExceeded(_) => Errno::ENOSPC,
            Error::Timeout(_) => Errno::ETIMEDOUT,
            Error::Cancelled => Errno::ECANCELED,
            Error::NoDevice => Errno::ENODEV,
            Error::NotTty(_) => Errno::ENOTTY,
        }
    }

    /// The negative status value a syscall-style caller sees for this error.
    pub fn to_status(&self) -> isize {
        self.errno() as isize
    }
}

pub type Result<T> = core::result::Result<T, Error>;
