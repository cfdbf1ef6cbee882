//! `.pdata` runtime function entries and function lookup.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
use core::fmt;

use super::{packed::PackedUnwindData, xdata::XdataHeader};
use crate::{
    byte_reader::ByteReader,
    error::{Error, UwResult},
    memory::{span_address, MemoryAccessor},
};

/// How the second word of a `.pdata` entry is to be interpreted.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnwindDataKind {
    /// RVA of a full `.xdata` record.
    Full = 0,
    /// Packed unwind data with a single prolog and epilog.
    PackedFunction = 1,
    /// Packed unwind data for a fragment without prolog.
    PackedFragment = 2,
    /// RVA (+3) of the parent `.pdata` entry this one chains to.
    Chained = 3,
}

/// `RuntimeFunction`
/// Source: <https://learn.microsoft.com/en-us/cpp/build/arm64-exception-handling>
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeFunction {
    /// Start of the function RVA.
    pub begin_address: u32,

    /// `.xdata` RVA, packed unwind data, or chained entry RVA, selected by
    /// the low two bits.
    pub unwind_data: u32,
}

impl fmt::Display for RuntimeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RuntimeFunction {{ begin_address: 0x{:08X}, unwind_data: 0x{:08X} }}",
            self.begin_address, self.unwind_data
        )
    }
}

impl RuntimeFunction {
    /// Size of one `.pdata` entry.
    pub const SIZE: usize = 8;

    pub const fn new(begin_address: u32, unwind_data: u32) -> Self {
        Self { begin_address, unwind_data }
    }

    pub const fn kind(&self) -> UnwindDataKind {
        match self.unwind_data & 0x3 {
            0 => UnwindDataKind::Full,
            1 => UnwindDataKind::PackedFunction,
            2 => UnwindDataKind::PackedFragment,
            _ => UnwindDataKind::Chained,
        }
    }

    pub const fn packed(&self) -> PackedUnwindData {
        PackedUnwindData::from_bits(self.unwind_data)
    }

    /// Reads an entry from `bytes`, advancing `index`.
    pub(crate) fn read_with(bytes: &[u8], index: &mut usize) -> UwResult<Self> {
        let begin_address = bytes.read32_with(index)?;
        let unwind_data = bytes.read32_with(index)?;
        Ok(Self { begin_address, unwind_data })
    }

    /// Loads the `.pdata` entry a chained entry points to.
    ///
    /// Only the plain chained form (low three bits `011`) is understood.
    pub fn parent<M: MemoryAccessor + ?Sized>(&self, memory: &M, image_base: u64) -> UwResult<RuntimeFunction> {
        if self.kind() != UnwindDataKind::Chained {
            return Err(Error::invalid(0, "parent requested for an unchained entry"));
        }
        if self.unwind_data & 0x4 != 0 {
            log::error!("    > Unsupported chained entry form: {}", self);
            return Err(Error::UnsupportedVersion { version: self.unwind_data & 0x7 });
        }

        let address = span_address(image_base, (self.unwind_data - 3) as u64, 8)?;
        Ok(Self { begin_address: memory.read_u32(address)?, unwind_data: memory.read_u32(address + 4)? })
    }

    /// Returns the length of the function in bytes.
    pub fn function_length<M: MemoryAccessor + ?Sized>(&self, memory: &M, image_base: u64) -> UwResult<u32> {
        match self.kind() {
            // The length of the function can only be calculated by parsing
            // the [0..=17] bits of the `.xdata` record.
            UnwindDataKind::Full => {
                let address = span_address(image_base, self.unwind_data as u64, 4)?;
                Ok(XdataHeader::from_bits(memory.read_u32(address)?).function_length())
            }
            UnwindDataKind::PackedFunction | UnwindDataKind::PackedFragment => Ok(self.packed().function_length()),
            // A chained entry covers its own range; the descriptor of the
            // parent says nothing about it, so only the parent's length is
            // available.
            UnwindDataKind::Chained => {
                let parent = self.parent(memory, image_base)?;
                if parent.kind() == UnwindDataKind::Chained {
                    return Err(Error::invalid(0, "chained entry points to another chained entry"));
                }
                parent.function_length(memory, image_base)
            }
        }
    }
}

/// A runtime function entry together with the image it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionEntry {
    pub image_base: u64,
    pub function: RuntimeFunction,
}

/// Maps an instruction address to the runtime function covering it.
#[cfg_attr(test, mockall::automock)]
pub trait FunctionLookup {
    /// Returns `None` for addresses with no unwind information (leaf
    /// functions, or code outside every known image).
    fn lookup(&self, control_pc: u64) -> UwResult<Option<FunctionEntry>>;
}

/// Lookup over the sorted `.pdata` table of a single image.
pub struct RuntimeFunctionTable<'a, M: MemoryAccessor + ?Sized> {
    image_base: u64,
    image_size: u64,
    pdata: &'a [u8],
    memory: &'a M,
}

impl<'a, M: MemoryAccessor + ?Sized> RuntimeFunctionTable<'a, M> {
    /// `pdata` is the raw `.pdata` section; `memory` resolves the `.xdata`
    /// headers needed to learn function lengths.
    pub fn new(image_base: u64, image_size: u64, pdata: &'a [u8], memory: &'a M) -> UwResult<Self> {
        if pdata.len() % RuntimeFunction::SIZE != 0 {
            log::error!("    > Invalid exception table size: 0x{:X}", pdata.len());
            return Err(Error::OutOfBoundsRead { index: pdata.len() });
        }
        Ok(Self { image_base, image_size, pdata, memory })
    }

    pub fn len(&self) -> usize {
        self.pdata.len() / RuntimeFunction::SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.pdata.is_empty()
    }

    pub fn entry(&self, index: usize) -> UwResult<RuntimeFunction> {
        let mut offset = index * RuntimeFunction::SIZE;
        RuntimeFunction::read_with(self.pdata, &mut offset)
    }

    /// Binary search for the last entry starting at or below `rva`.
    fn find_candidate(&self, rva: u32) -> UwResult<Option<RuntimeFunction>> {
        let (mut low, mut high) = (0usize, self.len());
        while low < high {
            let mid = low + (high - low) / 2;
            if self.entry(mid)?.begin_address <= rva {
                low = mid + 1;
            } else {
                high = mid;
            }
        }

        if low == 0 {
            return Ok(None);
        }
        self.entry(low - 1).map(Some)
    }
}

impl<M: MemoryAccessor + ?Sized> FunctionLookup for RuntimeFunctionTable<'_, M> {
    fn lookup(&self, control_pc: u64) -> UwResult<Option<FunctionEntry>> {
        if control_pc < self.image_base || control_pc - self.image_base >= self.image_size {
            return Ok(None);
        }
        let rva = (control_pc - self.image_base) as u32;

        let Some(function) = self.find_candidate(rva)? else {
            return Ok(None);
        };

        let length = function.function_length(self.memory, self.image_base)?;
        if rva - function.begin_address >= length {
            log::debug!("    > Runtime function not found for pc_rva {:X}", rva); // debug
            return Ok(None);
        }

        log::debug!("    > Found {} for pc_rva {:X}", function, rva); // debug
        Ok(Some(FunctionEntry { image_base: self.image_base, function }))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::memory::{MockMemoryAccessor, SliceMemory};

    const IMAGE_BASE: u64 = 0x1_0000;
    const IMAGE_SIZE: usize = 0x2000;

    fn make_packed(function_length: u32, flag: u32) -> u32 {
        flag | (((function_length / 4) & 0x7FF) << 2) | (2 << 16) | (4 << 23)
    }

    fn build_pdata(entries: &[(u32, u32)]) -> Vec<u8> {
        entries.iter().flat_map(|&(begin, unwind)| begin.to_le_bytes().into_iter().chain(unwind.to_le_bytes())).collect()
    }

    #[test]
    fn kind_follows_flag_bits() {
        assert_eq!(RuntimeFunction::new(0, 0x100).kind(), UnwindDataKind::Full);
        assert_eq!(RuntimeFunction::new(0, 0x101).kind(), UnwindDataKind::PackedFunction);
        assert_eq!(RuntimeFunction::new(0, 0x102).kind(), UnwindDataKind::PackedFragment);
        assert_eq!(RuntimeFunction::new(0, 0x103).kind(), UnwindDataKind::Chained);
    }

    #[test]
    fn display_formats_fields() {
        let function = RuntimeFunction::new(0x1000, 0x2001);
        assert_eq!(format!("{function}"), "RuntimeFunction { begin_address: 0x00001000, unwind_data: 0x00002001 }");
    }

    #[test]
    fn parent_reads_chained_entry() {
        let mut image = vec![0u8; IMAGE_SIZE];
        image[0x400..0x404].copy_from_slice(&0x100u32.to_le_bytes());
        image[0x404..0x408].copy_from_slice(&make_packed(0x40, 1).to_le_bytes());
        let memory = SliceMemory::new(IMAGE_BASE, &image);

        let chained = RuntimeFunction::new(0x180, 0x403);
        let parent = chained.parent(&memory, IMAGE_BASE).unwrap();
        assert_eq!(parent.begin_address, 0x100);
        assert_eq!(parent.kind(), UnwindDataKind::PackedFunction);
        assert_eq!(chained.function_length(&memory, IMAGE_BASE).unwrap(), 0x40);
    }

    #[test]
    fn parent_rejects_extended_chain_form() {
        let image = vec![0u8; IMAGE_SIZE];
        let memory = SliceMemory::new(IMAGE_BASE, &image);
        let chained = RuntimeFunction::new(0x180, 0x407);
        assert_eq!(chained.parent(&memory, IMAGE_BASE).unwrap_err(), Error::UnsupportedVersion { version: 7 });
    }

    #[test]
    fn unwind_data_past_the_address_space_is_rejected() {
        let mut memory = MockMemoryAccessor::new();
        memory.expect_read_u32().never();
        let image_base = u64::MAX - 0x100;

        assert_eq!(
            RuntimeFunction::new(0x180, 0x203).parent(&memory, image_base),
            Err(Error::StackValidationFailure { address: image_base, size: 0x208 })
        );
        assert_eq!(
            RuntimeFunction::new(0x180, 0x200).function_length(&memory, image_base),
            Err(Error::StackValidationFailure { address: image_base, size: 0x204 })
        );
    }

    #[test]
    fn lookup_finds_packed_and_xdata_entries() {
        let mut image = vec![0u8; IMAGE_SIZE];
        let xdata_rva = 0x600u32;
        let header = (0x60u32 / 4) | (1 << 21) | (1 << 27);
        image[xdata_rva as usize..xdata_rva as usize + 4].copy_from_slice(&header.to_le_bytes());
        let memory = SliceMemory::new(IMAGE_BASE, &image);

        let pdata = build_pdata(&[(0x100, make_packed(0x40, 1)), (0x180, xdata_rva), (0x300, make_packed(0x20, 2))]);
        let table = RuntimeFunctionTable::new(IMAGE_BASE, IMAGE_SIZE as u64, &pdata, &memory).unwrap();
        assert_eq!(table.len(), 3);

        let entry = table.lookup(IMAGE_BASE + 0x120).unwrap().expect("packed entry");
        assert_eq!(entry.image_base, IMAGE_BASE);
        assert_eq!(entry.function.begin_address, 0x100);

        let entry = table.lookup(IMAGE_BASE + 0x1DC).unwrap().expect("xdata entry");
        assert_eq!(entry.function.unwind_data, xdata_rva);

        let entry = table.lookup(IMAGE_BASE + 0x300).unwrap().expect("fragment entry");
        assert_eq!(entry.function.kind(), UnwindDataKind::PackedFragment);
    }

    #[test]
    fn lookup_misses_gaps_and_foreign_addresses() {
        let image = vec![0u8; IMAGE_SIZE];
        let memory = SliceMemory::new(IMAGE_BASE, &image);
        let pdata = build_pdata(&[(0x100, make_packed(0x40, 1)), (0x300, make_packed(0x20, 1))]);
        let table = RuntimeFunctionTable::new(IMAGE_BASE, IMAGE_SIZE as u64, &pdata, &memory).unwrap();

        assert_eq!(table.lookup(IMAGE_BASE + 0x80).unwrap(), None);
        assert_eq!(table.lookup(IMAGE_BASE + 0x140).unwrap(), None);
        assert_eq!(table.lookup(IMAGE_BASE - 4).unwrap(), None);
        assert_eq!(table.lookup(IMAGE_BASE + IMAGE_SIZE as u64).unwrap(), None);
    }

    #[test]
    fn table_rejects_truncated_pdata() {
        let image = vec![0u8; 16];
        let memory = SliceMemory::new(IMAGE_BASE, &image);
        let pdata = [0u8; 12];
        assert!(RuntimeFunctionTable::new(IMAGE_BASE, 16, &pdata, &memory).is_err());
    }
}
