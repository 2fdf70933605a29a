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

//! Copies between caller-supplied buffers and driver-owned memory.
//!
//! Caller buffers are untrusted: every copy can fail with [`Fault`], and the
//! driver treats a failed copy as if no data was transferred.

use core::slice;

#[derive(thiserror::Error, Clone, Copy, Debug, PartialEq, Eq)]
#[error("bad address")]
pub struct Fault;

/// A caller buffer the driver reads from.
pub trait UserReader {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fills `dest` from the start of the caller buffer.
    fn read_into(&self, dest: &mut [u8]) -> Result<(), Fault>;
}

/// A caller buffer the driver writes to.
pub trait UserWriter {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies `src` to the start of the caller buffer.
    fn write_from(&mut self, src: &[u8]) -> Result<(), Fault>;
}

pub struct UserSlice<'a> {
    data: &'a [u8],
}

impl<'a> UserSlice<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// # Safety
    ///
    /// `ptr` must be valid for reads of `len` bytes for the lifetime of the
    /// returned value.
    pub unsafe fn from_raw_parts(ptr: *const u8, len: usize) -> Self {
        // We should validate that the pointer and length are valid, as these come from the caller
        // and therefore are not to be trusted, but there is no address space to check against.
        Self { data: unsafe { slice::from_raw_parts(ptr, len) } }
    }
}

impl UserReader for UserSlice<'_> {
    fn len(&self) -> usize {
        self.data.len()
    }

    fn read_into(&self, dest: &mut [u8]) -> Result<(), Fault> {
        let source = self.data.get(..dest.len()).ok_or(Fault)?;
        dest.copy_from_slice(source);
        Ok(())
    }
}

pub struct UserSliceMut<'a> {
    data: &'a mut [u8],
}

impl<'a> UserSliceMut<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        Self { data }
    }

    /// # Safety
    ///
    /// `ptr` must be valid for writes of `len` bytes for the lifetime of the
    /// returned value, and nothing else may access that memory meanwhile.
    pub unsafe fn from_raw_parts(ptr: *mut u8, len: usize) -> Self {
        Self { data: unsafe { slice::from_raw_parts_mut(ptr, len) } }
    }
}

impl UserWriter for UserSliceMut<'_> {
    fn len(&self) -> usize {
        self.data.len()
    }

    fn write_from(&mut self, src: &[u8]) -> Result<(), Fault> {
        let dest = self.data.get_mut(..src.len()).ok_or(Fault)?;
        dest.copy_from_slice(src);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_into() {
        let source = UserSlice::new(b"hello world");
        let mut dest = [0u8; 5];
        assert_eq!(source.read_into(&mut dest), Ok(()));
        assert_eq!(&dest, b"hello");

        let mut too_long = [0u8; 12];
        assert_eq!(source.read_into(&mut too_long), Err(Fault));
    }

    #[test]
    fn test_write_from() {
        let mut buffer = [0u8; 4];
        let mut dest = UserSliceMut::new(&mut buffer);
        assert_eq!(dest.len(), 4);
        assert_eq!(dest.write_from(b"ab"), Ok(()));
        assert_eq!(dest.write_from(b"abcde"), Err(Fault));
        assert_eq!(&buffer, b"ab\0\0");
    }

    #[test]
    fn test_raw_parts() {
        let mut backing = *b"raw!";
        let reader = unsafe { UserSlice::from_raw_parts(backing.as_ptr(), backing.len()) };
        assert_eq!(reader.len(), 4);
        let mut copy = [0u8; 4];
        reader.read_into(&mut copy).unwrap();
        assert_eq!(&copy, b"raw!");

        let mut writer = unsafe { UserSliceMut::from_raw_parts(backing.as_mut_ptr(), 2) };
        writer.write_from(b"RA").unwrap();
        assert_eq!(&backing, b"RAw!");
    }
}
