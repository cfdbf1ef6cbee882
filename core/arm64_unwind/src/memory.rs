//! Memory access for the unwinder.
//!
//! Every read the unwinder performs, whether it targets the stack, a saved
//! context record, or the unwind data itself, goes through a
//! [`MemoryAccessor`]. The same unwinding code therefore serves a live
//! process ([`NativeMemory`]) and a captured snapshot ([`SliceMemory`]).
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
use crate::{
    byte_reader::{read_native_bytes, ByteReader},
    error::{Error, UwResult},
};

/// Fallible little-endian reads from a target address space.
#[cfg_attr(test, mockall::automock)]
pub trait MemoryAccessor {
    /// Fills `buffer` with the bytes at `address`.
    fn read_bytes(&self, address: u64, buffer: &mut [u8]) -> UwResult<()>;

    fn read_u8(&self, address: u64) -> UwResult<u8> {
        let mut buffer = [0u8; 1];
        self.read_bytes(address, &mut buffer)?;
        Ok(buffer[0])
    }

    fn read_u32(&self, address: u64) -> UwResult<u32> {
        let mut buffer = [0u8; 4];
        self.read_bytes(address, &mut buffer)?;
        Ok(u32::from_le_bytes(buffer))
    }

    fn read_u64(&self, address: u64) -> UwResult<u64> {
        let mut buffer = [0u8; 8];
        self.read_bytes(address, &mut buffer)?;
        Ok(u64::from_le_bytes(buffer))
    }
}

/// Inclusive-exclusive limits of the stack being unwound.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StackBounds {
    pub low: u64,
    pub high: u64,
}

impl StackBounds {
    pub const fn new(low: u64, high: u64) -> Self {
        Self { low, high }
    }

    /// Returns `true` when `[address, address + size)` lies inside the bounds.
    pub fn contains(&self, address: u64, size: u64) -> bool {
        match address.checked_add(size) {
            Some(end) => address >= self.low && end <= self.high,
            None => false,
        }
    }
}

/// Address of the `size`-byte span `offset` bytes past `base`.
///
/// Addresses built from values read out of the target cannot be trusted;
/// spans that wrap the address space are rejected.
pub(crate) fn span_address(base: u64, offset: u64, size: u64) -> UwResult<u64> {
    match base.checked_add(offset) {
        Some(address) if address.checked_add(size).is_some() => Ok(address),
        _ => {
            log::error!("Span {:016X}+{:X}..+{:X} wraps the address space", base, offset, size);
            Err(Error::StackValidationFailure { address: base, size: offset.saturating_add(size) })
        }
    }
}

/// Reads the current process's address space through raw pointers.
#[derive(Debug)]
pub struct NativeMemory {
    _private: (),
}

impl NativeMemory {
    /// Creates an accessor over the current address space.
    ///
    /// # Safety
    ///
    /// The caller is responsible for every address the unwinder derives from
    /// the context and unwind data it is handed. Reads are not checked first; an
    /// invalid stack or corrupt unwind data can fault.
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl MemoryAccessor for NativeMemory {
    fn read_bytes(&self, address: u64, buffer: &mut [u8]) -> UwResult<()> {
        // SAFETY: `NativeMemory` can only be built through the unsafe `new`,
        // whose caller vouched for the addresses being read.
        unsafe { read_native_bytes(address, buffer) }
    }
}

/// A captured region of a target address space, such as a stack snapshot
/// taken from a minidump.
#[derive(Debug, Clone, Copy)]
pub struct SliceMemory<'a> {
    base: u64,
    bytes: &'a [u8],
}

impl<'a> SliceMemory<'a> {
    pub const fn new(base: u64, bytes: &'a [u8]) -> Self {
        Self { base, bytes }
    }

    pub const fn base(&self) -> u64 {
        self.base
    }

    fn offset_of(&self, address: u64, size: usize) -> UwResult<usize> {
        let failure = Error::StackValidationFailure { address, size: size as u64 };
        let offset = address.checked_sub(self.base).ok_or(failure)?;
        let offset = usize::try_from(offset).map_err(|_| failure)?;
        match offset.checked_add(size) {
            Some(end) if end <= self.bytes.len() => Ok(offset),
            _ => Err(failure),
        }
    }
}

impl MemoryAccessor for SliceMemory<'_> {
    fn read_bytes(&self, address: u64, buffer: &mut [u8]) -> UwResult<()> {
        let offset = self.offset_of(address, buffer.len())?;
        buffer.copy_from_slice(&self.bytes[offset..offset + buffer.len()]);
        Ok(())
    }

    fn read_u8(&self, address: u64) -> UwResult<u8> {
        self.bytes.read8(self.offset_of(address, 1)?)
    }

    fn read_u32(&self, address: u64) -> UwResult<u32> {
        self.bytes.read32(self.offset_of(address, 4)?)
    }

    fn read_u64(&self, address: u64) -> UwResult<u64> {
        self.bytes.read64(self.offset_of(address, 8)?)
    }
}
