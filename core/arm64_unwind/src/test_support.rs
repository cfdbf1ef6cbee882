//! Helpers for building stack and image snapshots in unit tests.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
use crate::memory::SliceMemory;

/// A zero-filled little-endian memory image at a fixed base address.
pub(crate) struct FakeStack {
    base: u64,
    bytes: Vec<u8>,
}

impl FakeStack {
    pub(crate) fn new(base: u64, size: usize) -> Self {
        Self { base, bytes: vec![0; size] }
    }

    pub(crate) fn put_bytes(&mut self, address: u64, bytes: &[u8]) -> &mut Self {
        let offset = (address - self.base) as usize;
        self.bytes[offset..offset + bytes.len()].copy_from_slice(bytes);
        self
    }

    pub(crate) fn put_u8(&mut self, address: u64, value: u8) -> &mut Self {
        self.put_bytes(address, &[value])
    }

    pub(crate) fn put_u32(&mut self, address: u64, value: u32) -> &mut Self {
        self.put_bytes(address, &value.to_le_bytes())
    }

    pub(crate) fn put_u64(&mut self, address: u64, value: u64) -> &mut Self {
        self.put_bytes(address, &value.to_le_bytes())
    }

    /// Writes consecutive 64-bit values starting at `address`.
    pub(crate) fn put_u64s(&mut self, address: u64, values: &[u64]) -> &mut Self {
        for (i, value) in values.iter().enumerate() {
            self.put_u64(address + 8 * i as u64, *value);
        }
        self
    }

    pub(crate) fn memory(&self) -> SliceMemory<'_> {
        SliceMemory::new(self.base, &self.bytes)
    }
}
