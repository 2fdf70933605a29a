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

//! The file endpoint handed to callers that open a device.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::{
    config::PollPolicy,
    control::PATH_CAPACITY,
    error::{Error, Result},
    registry::Instance,
    user::{UserReader, UserSlice, UserSliceMut, UserWriter},
};

/// `_IOW('v', 1, char *)`: connect to the host socket whose NUL-terminated
/// path is passed as the argument.
pub const VMSOCKET_IOCTL_CONNECT: u32 = 0x4008_7601;

pub trait FileDescriptor {
    fn read(&mut self, dest: &mut dyn UserWriter) -> Result<usize>;
    fn write(&mut self, src: &dyn UserReader) -> Result<usize>;
    /// Returns the device's sync status. `datasync` makes no difference to a
    /// device with a single sync register.
    fn fsync(&mut self, datasync: bool) -> Result<i32>;
    fn ioctl(&mut self, request: u32, arg: &dyn UserReader) -> Result<()>;
}

/// An open VMSocket device.
///
/// Only one exists per device at a time. Dropping it releases the device.
pub struct VmSocketFile {
    instance: Arc<Instance>,
    poll: PollPolicy,
    cancel: CancellationToken,
    released: bool,
}

impl VmSocketFile {
    pub(crate) fn new(instance: Arc<Instance>, poll: PollPolicy) -> Self {
        let cancel = instance.cancel_token().child_token();
        Self { instance, poll, cancel, released: false }
    }

    pub fn index(&self) -> usize {
        self.instance.index()
    }

    pub fn name(&self) -> String {
        self.instance.name()
    }

    /// Cancelling the returned token aborts a read blocked on this file.
    pub fn interrupt_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn connect(&mut self, path: &str) -> Result<()> {
        self.instance.with_connection(&self.poll, &self.cancel, |conn| conn.connect(path))?
    }

    /// Closes the connection and makes the device available again.
    ///
    /// The device is released even if it reports an error on close.
    pub fn release(mut self) -> Result<()> {
        self.close()
    }

    fn close(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let status = self.instance.with_connection(&self.poll, &self.cancel, |conn| conn.close());
        self.instance.release();
        match status? {
            0 => {
                log::debug!("{}: closed", self.instance.name());
                Ok(())
            }
            status => {
                log::error!("{}: close failed with status {}", self.instance.name(), status);
                Err(Error::CloseFailed(status))
            }
        }
    }
}

impl FileDescriptor for VmSocketFile {
    fn read(&mut self, dest: &mut dyn UserWriter) -> Result<usize> {
        self.instance.with_connection(&self.poll, &self.cancel, |conn| conn.read(dest))?
    }

    fn write(&mut self, src: &dyn UserReader) -> Result<usize> {
        self.instance.with_connection(&self.poll, &self.cancel, |conn| conn.write(src))?
    }

    fn fsync(&mut self, _datasync: bool) -> Result<i32> {
        self.instance.with_connection(&self.poll, &self.cancel, |conn| conn.flush())
    }

    fn ioctl(&mut self, request: u32, arg: &dyn UserReader) -> Result<()> {
        if request != VMSOCKET_IOCTL_CONNECT {
            log::debug!("{}: unsupported ioctl {:#x}", self.instance.name(), request);
            return Err(Error::NotTty(request));
        }
        let path = read_c_path(arg)?;
        self.connect(&path)
    }
}

impl Drop for VmSocketFile {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::warn!("{}: implicit release: {}", self.instance.name(), err);
        }
    }
}

/// Reads a NUL-terminated path of at most `PATH_CAPACITY` bytes, terminator
/// included.
fn read_c_path(arg: &dyn UserReader) -> Result<String> {
    let mut buffer = vec![0u8; arg.len().min(PATH_CAPACITY)];
    arg.read_into(&mut buffer).map_err(|_| Error::TransferFault)?;
    let end = match buffer.iter().position(|&byte| byte == 0) {
        Some(end) => end,
        None if buffer.len() == PATH_CAPACITY => return Err(Error::PathTooLong),
        None => buffer.len(),
    };
    buffer.truncate(end);
    String::from_utf8(buffer).map_err(|_| Error::InvalidPath)
}

pub fn syscall_read(file: &mut VmSocketFile, buf: *mut u8, count: usize) -> isize {
    // There is no separate caller address space to validate the buffer against.
    let mut dest = unsafe { UserSliceMut::from_raw_parts(buf, count) };
    file.read(&mut dest).map(|count| count as isize).unwrap_or_else(|err| err.to_status())
}

pub fn syscall_write(file: &mut VmSocketFile, buf: *const u8, count: usize) -> isize {
    let src = unsafe { UserSlice::from_raw_parts(buf, count) };
    file.write(&src).map(|count| count as isize).unwrap_or_else(|err| err.to_status())
}

pub fn syscall_fsync(file: &mut VmSocketFile, datasync: bool) -> isize {
    file.fsync(datasync).map(|status| status as isize).unwrap_or_else(|err| err.to_status())
}

pub fn syscall_ioctl(file: &mut VmSocketFile, request: u32, arg: *const u8, len: usize) -> isize {
    let arg = unsafe { UserSlice::from_raw_parts(arg, len) };
    file.ioctl(request, &arg).map(|()| 0).unwrap_or_else(|err| err.to_status())
}
