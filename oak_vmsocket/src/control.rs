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

//! The control block shared with the device.
//!
//! The driver fills it in right before triggering a register; the device reads
//! it while handling the operation. Field order and widths are fixed by the
//! device.

use core::mem::{offset_of, size_of};

use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use crate::{
    error::{Error, Result},
    region::IoRegion,
};

/// Size of the path field, including the terminating NUL.
pub const PATH_CAPACITY: usize = 1024;

/// Longest path that fits next to its NUL terminator.
pub const MAX_PATH_LEN: usize = PATH_CAPACITY - 1;

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ControlBlock {
    /// NUL-terminated path of the host socket to connect to.
    pub path: [u8; PATH_CAPACITY],
    /// Upper bound for the next read.
    pub bytes_to_read: u32,
    /// Number of valid bytes in the output buffer for the next write.
    pub bytes_to_write: u32,
}
static_assertions::assert_eq_size!(ControlBlock, [u8; 1032]);

pub const PATH_OFFSET: usize = offset_of!(ControlBlock, path);
pub const BYTES_TO_READ_OFFSET: usize = offset_of!(ControlBlock, bytes_to_read);
pub const BYTES_TO_WRITE_OFFSET: usize = offset_of!(ControlBlock, bytes_to_write);
static_assertions::const_assert_eq!(BYTES_TO_READ_OFFSET, 1024);
static_assertions::const_assert_eq!(BYTES_TO_WRITE_OFFSET, 1028);

impl ControlBlock {
    /// The path up to (not including) its terminator.
    pub fn path_bytes(&self) -> &[u8] {
        let end = self.path.iter().position(|&byte| byte == 0).unwrap_or(PATH_CAPACITY);
        &self.path[..end]
    }
}

/// Checks that `path` fits the control block. Over-long paths are rejected
/// rather than truncated.
pub fn validate_path(path: &str) -> Result<&[u8]> {
    let bytes = path.as_bytes();
    if bytes.contains(&0) {
        return Err(Error::InvalidPath);
    }
    if bytes.len() > MAX_PATH_LEN {
        return Err(Error::PathTooLong);
    }
    Ok(bytes)
}

/// Typed view of the mapped control region.
pub struct ControlRegion<'a> {
    io: &'a dyn IoRegion,
}

impl<'a> ControlRegion<'a> {
    /// The region must be at least `size_of::<ControlBlock>()` bytes; the
    /// region mapper guarantees that.
    pub fn new(io: &'a dyn IoRegion) -> Self {
        debug_assert!(io.len() >= size_of::<ControlBlock>());
        Self { io }
    }

    /// Stores `path` followed by a NUL terminator.
    pub fn set_path(&self, path: &str) -> Result<()> {
        let bytes = validate_path(path)?;
        self.io.write_bytes(PATH_OFFSET, bytes);
        self.io.write_bytes(PATH_OFFSET + bytes.len(), &[0]);
        Ok(())
    }

    pub fn path(&self) -> String {
        String::from_utf8_lossy(self.snapshot().path_bytes()).into_owned()
    }

    pub fn set_bytes_to_read(&self, count: u32) {
        self.io.write_u32(BYTES_TO_READ_OFFSET, count);
    }

    pub fn bytes_to_read(&self) -> u32 {
        self.io.read_u32(BYTES_TO_READ_OFFSET)
    }

    pub fn set_bytes_to_write(&self, count: u32) {
        self.io.write_u32(BYTES_TO_WRITE_OFFSET, count);
    }

    pub fn bytes_to_write(&self) -> u32 {
        self.io.read_u32(BYTES_TO_WRITE_OFFSET)
    }

    /// Copies the whole record out of device memory.
    pub fn snapshot(&self) -> ControlBlock {
        let mut block = ControlBlock::new_zeroed();
        self.io.read_bytes(0, block.as_mut_bytes());
        block
    }
}
