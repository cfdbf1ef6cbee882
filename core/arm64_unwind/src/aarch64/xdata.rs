//! Full `.xdata` unwind records and the search for where unwinding starts.
//!
//! .xdata structure:
//!                      .-------------------------------------------------------------------------------------------------------------------------------.
//!                      | 3 | 2 | 2 | 2 | 2 | 2 | 2 | 2 | 2 | 2 | 2 | 2 | 1 | 1 | 1 | 1 | 1 | 1 | 1 | 1 | 1 | 0 | 0 | 0 | 0 | 0 | 0 | 0 | 0 | 0 | 0 | 0 |
//!                      | 1 | 0 | 9 | 8 | 7 | 6 | 5 | 4 | 3 | 2 | 1 | 0 | 9 | 8 | 7 | 6 | 5 | 4 | 3 | 2 | 1 | 0 | 9 | 8 | 7 | 6 | 5 | 4 | 3 | 2 | 1 | 0 |
//!        .------------>.-------------------------------------------------------------------------------------------------------------------------------.
//!     Header 1         | Code Words        | Epilog count      | E | X | Vers  | Function Length                                                       |
//!        .------------>|-------------------------------------------------------------------------------------------------------------------------------|
//!   Header 2(opt)      | (Reserved)                    | (Extended Code Words)         | (Extended Epilog Count)                                       |
//!        .------------>|-------------------------------------------------------------------------------------------------------------------------------|
//!  Epilog Scope 1(opt) | Epilog Start Index                    | (reserved)    | Epilog Start Offset                                                   |
//!        .------------>|-------------------------------------------------------------------------------------------------------------------------------|
//!  Epilog Scope 2(opt) | (Possibly followed by additional epilog scopes)                                                                               |
//!        .------------>|-------------------------------------------------------------------------------------------------------------------------------|
//!  Unwind codes        | Unwind Code 3                 | Unwind Code 2                 | Unwind Code 1                 | Unwind Code 0                 |
//!                      |-------------------------------------------------------------------------------------------------------------------------------|
//!                      | (Possibly followed by additional words with unwind codes)                                                                     |
//!                      |-------------------------------------------------------------------------------------------------------------------------------|
//!                      | Exception Handler RVA (if X = 1)                                                                                              |
//!                      |-------------------------------------------------------------------------------------------------------------------------------|
//!                      | (Possibly followed by data needed by the exception handler)                                                                   |
//!                      '-------------------------------------------------------------------------------------------------------------------------------'
//!
//!  - 'Header 2' only exists if both the code words and the epilog count of
//!    'Header 1' are 0.
//!  - If E == 1 there are no epilog scopes; the epilog count is instead the
//!    index of the first unwind code of the one and only epilog.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
use core::fmt;

use super::unwind_code::{instruction_count, is_end, opcode_size, CodeStream};
use crate::{
    error::{Error, UwResult},
    memory::{span_address, MemoryAccessor},
};

/// First word of an `.xdata` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XdataHeader(u32);

impl XdataHeader {
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// Function length in 4-byte units.
    pub const fn function_length_units(&self) -> u32 {
        self.0 & 0x3FFFF
    }

    /// Function length in bytes.
    pub const fn function_length(&self) -> u32 {
        self.function_length_units() * 4
    }

    pub const fn version(&self) -> u32 {
        (self.0 >> 18) & 0x3
    }

    /// X: an exception handler follows the unwind codes.
    pub const fn has_handler(&self) -> bool {
        (self.0 >> 20) & 0x1 != 0
    }

    /// E: a single epilog is described inline.
    pub const fn epilog_in_header(&self) -> bool {
        (self.0 >> 21) & 0x1 != 0
    }

    pub const fn epilog_count(&self) -> u32 {
        (self.0 >> 22) & 0x1F
    }

    pub const fn code_words(&self) -> u32 {
        (self.0 >> 27) & 0x1F
    }

    /// Both counts are zero, so the extension word follows.
    pub const fn is_extended(&self) -> bool {
        self.epilog_count() == 0 && self.code_words() == 0
    }

    pub(crate) const fn new(function_length_units: u32, epilog_in_header: bool, epilog_count: u32, code_words: u32) -> Self {
        Self(
            (function_length_units & 0x3FFFF)
                | ((epilog_in_header as u32) << 21)
                | ((epilog_count & 0x1F) << 22)
                | ((code_words & 0x1F) << 27),
        )
    }
}

/// One epilog scope record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpilogScope(u32);

impl EpilogScope {
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Offset of the epilog from the function start, in 4-byte units.
    pub const fn start_offset(&self) -> u32 {
        self.0 & 0x3FFFF
    }

    /// Byte index of the epilog's first unwind code.
    pub const fn start_index(&self) -> u32 {
        self.0 >> 22
    }
}

/// The decoded headers of a full unwind record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XdataRecord {
    pub header: XdataHeader,
    /// Epilog scope records between the header and the codes. Zero when E
    /// is set.
    pub epilog_scope_count: u32,
    /// Index of the inline epilog's first code when E is set.
    pub unwind_index: u32,
    pub code_words: u32,
}

impl fmt::Display for XdataRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "XdataRecord {{ function_length: 0x{:X}, vers: 0x{:X}, x: {}, e: {}, epilog_scopes: {}, unwind_index: {}, code_words: {} }}",
            self.header.function_length(),
            self.header.version(),
            self.header.has_handler() as u8,
            self.header.epilog_in_header() as u8,
            self.epilog_scope_count,
            self.unwind_index,
            self.code_words
        )
    }
}

impl XdataRecord {
    /// Resolves the counts of `header`, using `extension` when the header
    /// calls for the extension word.
    pub fn from_words(header: XdataHeader, extension: Option<u32>) -> UwResult<Self> {
        if header.version() != 0 {
            log::error!("    > Unsupported .xdata version. 'vers' field other than zero");
            return Err(Error::UnsupportedVersion { version: header.version() });
        }

        let (mut epilog_count, code_words) = match (header.is_extended(), extension) {
            (true, Some(extension)) => (extension & 0xFFFF, (extension >> 16) & 0xFF),
            (true, None) => return Err(Error::OutOfBoundsRead { index: 4 }),
            (false, _) => (header.epilog_count(), header.code_words()),
        };

        let mut unwind_index = 0;
        if header.epilog_in_header() {
            unwind_index = epilog_count;
            epilog_count = 0;
        }

        Ok(Self { header, epilog_scope_count: epilog_count, unwind_index, code_words })
    }

    /// Size of the header words.
    pub const fn header_size(&self) -> u64 {
        if self.header.is_extended() {
            8
        } else {
            4
        }
    }

    /// Number of opcode bytes.
    pub const fn code_len(&self) -> usize {
        4 * self.code_words as usize
    }
}

/// Exception handler attached to a full unwind record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LanguageHandler {
    /// Absolute address of the handler routine.
    pub routine: u64,
    /// Absolute address of the handler-specific data.
    pub data: u64,
}

/// A full `.xdata` record living in the target address space.
pub struct RemoteXdata<'a, M: MemoryAccessor + ?Sized> {
    memory: &'a M,
    pub record: XdataRecord,
    scopes: u64,
    codes: u64,
}

impl<'a, M: MemoryAccessor + ?Sized> RemoteXdata<'a, M> {
    /// Reads the headers of the record at `address`.
    pub fn read(memory: &'a M, address: u64) -> UwResult<Self> {
        let header = XdataHeader::from_bits(memory.read_u32(span_address(address, 0, 4)?)?);
        let extension =
            if header.is_extended() { Some(memory.read_u32(span_address(address, 4, 4)?)?) } else { None };
        let record = XdataRecord::from_words(header, extension)?;

        // Scopes, codes and the handler RVA follow the header words.
        let handler_size = if header.has_handler() { 4 } else { 0 };
        let body = 4 * record.epilog_scope_count as u64 + record.code_len() as u64 + handler_size;
        let scopes = span_address(address, record.header_size(), body)?;
        let codes = scopes + 4 * record.epilog_scope_count as u64;
        log::debug!("    > {}", record); // debug
        Ok(Self { memory, record, scopes, codes })
    }

    /// Handler routine and data, if the X bit is set.
    pub fn handler(&self, image_base: u64) -> UwResult<Option<LanguageHandler>> {
        if !self.record.header.has_handler() {
            return Ok(None);
        }
        let handler_rva = self.codes + self.record.code_len() as u64;
        let routine = span_address(image_base, self.memory.read_u32(handler_rva)? as u64, 0)?;
        Ok(Some(LanguageHandler { routine, data: handler_rva + 4 }))
    }
}

impl<M: MemoryAccessor + ?Sized> CodeStream for RemoteXdata<'_, M> {
    fn code_len(&self) -> usize {
        self.record.code_len()
    }

    fn code_byte(&self, index: usize) -> UwResult<u8> {
        self.memory.read_u8(self.codes.wrapping_add(index as u64))
    }

    fn epilog_scope(&self, index: usize) -> UwResult<u32> {
        self.memory.read_u32(self.scopes.wrapping_add(4 * index as u64))
    }
}

/// Where the interpreter begins for a given PC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnwindStart {
    /// Opcode byte index to start at, after skipping.
    pub code_offset: usize,
    /// Opcodes skipped because the instructions they describe have not run
    /// (or have already been undone).
    pub skip_words: u32,
    /// `false` inside a prolog or epilog; the handler must not be reported.
    pub handler_applies: bool,
}

/// Counts the instructions described by the codes starting at `start`, up
/// to the first end marker. Epilogs include the trailing `ret`.
pub fn compute_scope_size<C: CodeStream + ?Sized>(codes: &C, start: usize, is_epilog: bool) -> UwResult<u32> {
    let mut index = start;
    let mut scope_size = 0;
    while index < codes.code_len() {
        let op = codes.code_byte(index)?;
        if is_end(op) {
            break;
        }
        scope_size += instruction_count(op);
        index += opcode_size(op);
    }

    if is_epilog {
        scope_size += 1;
    }
    Ok(scope_size)
}

/// Decides where to start interpreting `codes` for a PC `offset_in_function`
/// instructions into the function.
///
/// In a prolog the codes run from index 0 with the not-yet-executed part
/// skipped. In an epilog they run from the epilog's own index with the
/// already-executed part skipped. Otherwise they run in full from index 0.
pub fn locate<C: CodeStream + ?Sized>(record: &XdataRecord, codes: &C, offset_in_function: u32) -> UwResult<UnwindStart> {
    let function_length = record.header.function_length_units();
    let code_bytes = 4 * record.code_words;
    let mut start = UnwindStart { code_offset: 0, skip_words: 0, handler_applies: true };

    // Each code byte describes at most one instruction, so a prolog can't be
    // longer than the code bytes.
    if offset_in_function < code_bytes {
        let scope_size = compute_scope_size(codes, 0, false)?;
        if offset_in_function < scope_size {
            log::debug!("    > In prolog, skipping {} codes", scope_size - offset_in_function); // debug
            start.skip_words = scope_size - offset_in_function;
            start.handler_applies = false;
            return skip_codes(codes, start);
        }
    }

    if record.header.epilog_in_header() {
        let unwind_index = record.unwind_index;
        if offset_in_function + code_bytes.saturating_sub(unwind_index) >= function_length {
            let scope_size = compute_scope_size(codes, unwind_index as usize, true)?;
            let scope_start = function_length.saturating_sub(scope_size);
            if offset_in_function >= scope_start {
                log::debug!("    > In epilog at code {}", unwind_index); // debug
                start = UnwindStart {
                    code_offset: unwind_index as usize,
                    skip_words: offset_in_function - scope_start,
                    handler_applies: false,
                };
            }
        }
    } else {
        for scope_num in 0..record.epilog_scope_count as usize {
            let scope = EpilogScope::from_bits(codes.epilog_scope(scope_num)?);

            // The scope records are sorted; past our position means no epilog.
            let scope_start = scope.start_offset();
            if offset_in_function < scope_start {
                break;
            }

            let unwind_index = scope.start_index();
            if offset_in_function < scope_start + code_bytes.saturating_sub(unwind_index) {
                let scope_size = compute_scope_size(codes, unwind_index as usize, true)?;
                if offset_in_function < scope_start + scope_size {
                    log::debug!("    > In epilog scope {} at code {}", scope_num, unwind_index); // debug
                    start = UnwindStart {
                        code_offset: unwind_index as usize,
                        skip_words: offset_in_function - scope_start,
                        handler_applies: false,
                    };
                    break;
                }
            }
        }
    }

    skip_codes(codes, start)
}

/// Moves past `skip_words` opcodes, stopping early at an end marker.
fn skip_codes<C: CodeStream + ?Sized>(codes: &C, mut start: UnwindStart) -> UwResult<UnwindStart> {
    let mut remaining = start.skip_words;
    while start.code_offset < codes.code_len() && remaining > 0 {
        let op = codes.code_byte(start.code_offset)?;
        if is_end(op) {
            break;
        }
        start.code_offset += opcode_size(op);
        remaining -= 1;
    }
    Ok(start)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::memory::{MockMemoryAccessor, SliceMemory};

    const BASE: u64 = 0x4000;

    fn record(function_length_units: u32, e: bool, count: u32, code_words: u32) -> XdataRecord {
        XdataRecord::from_words(XdataHeader::new(function_length_units, e, count, code_words), None).unwrap()
    }

    #[test]
    fn header_fields() {
        let header = XdataHeader::from_bits(0x12 | (1 << 20) | (1 << 21) | (3 << 22) | (2 << 27));
        assert_eq!(header.function_length_units(), 0x12);
        assert_eq!(header.function_length(), 0x48);
        assert!(header.has_handler());
        assert!(header.epilog_in_header());
        assert_eq!(header.epilog_count(), 3);
        assert_eq!(header.code_words(), 2);
        assert!(!header.is_extended());
    }

    #[test]
    fn record_rejects_version() {
        let header = XdataHeader::from_bits(0x10 | (1 << 18));
        assert_eq!(XdataRecord::from_words(header, None).unwrap_err(), Error::UnsupportedVersion { version: 1 });
    }

    #[test]
    fn record_uses_extension_word() {
        let header = XdataHeader::from_bits(0x10);
        let record = XdataRecord::from_words(header, Some(0x0021_0040)).unwrap();
        assert_eq!(record.epilog_scope_count, 0x40);
        assert_eq!(record.code_words, 0x21);
        assert_eq!(record.header_size(), 8);
        assert!(XdataRecord::from_words(header, None).is_err());
    }

    #[test]
    fn e_bit_turns_count_into_index() {
        let record = record(0x20, true, 3, 1);
        assert_eq!(record.epilog_scope_count, 0);
        assert_eq!(record.unwind_index, 3);
    }

    #[test]
    fn remote_record_reads_scopes_codes_and_handler() {
        let mut image = vec![0u8; 0x40];
        let header = XdataHeader::new(0x40, false, 2, 1).bits() | (1 << 20);
        image[0..4].copy_from_slice(&header.to_le_bytes());
        image[4..8].copy_from_slice(&(0x30u32 | (1 << 22)).to_le_bytes());
        image[8..12].copy_from_slice(&0x38u32.to_le_bytes());
        image[12..16].copy_from_slice(&[0x81, 0xE4, 0x81, 0xE4]);
        image[16..20].copy_from_slice(&0x1234u32.to_le_bytes());
        let memory = SliceMemory::new(BASE, &image);

        let xdata = RemoteXdata::read(&memory, BASE).unwrap();
        assert_eq!(xdata.record.epilog_scope_count, 2);
        assert_eq!(xdata.code_len(), 4);
        assert_eq!(xdata.code_byte(1).unwrap(), 0xE4);
        assert_eq!(EpilogScope::from_bits(xdata.epilog_scope(0).unwrap()).start_offset(), 0x30);
        assert_eq!(EpilogScope::from_bits(xdata.epilog_scope(0).unwrap()).start_index(), 1);

        let handler = xdata.handler(0x10_0000).unwrap().expect("handler");
        assert_eq!(handler.routine, 0x10_1234);
        assert_eq!(handler.data, BASE + 20);
    }

    #[test]
    fn remote_record_rejects_wrapping_body() {
        let mut memory = MockMemoryAccessor::new();
        memory.expect_read_u32().times(1).returning(|_| Ok(XdataHeader::new(0x40, false, 0, 2).bits()));

        assert_eq!(
            RemoteXdata::read(&memory, u64::MAX - 8).err(),
            Some(Error::StackValidationFailure { address: u64::MAX - 8, size: 12 })
        );
    }

    #[test]
    fn scope_size_counts_instructions() {
        // save_fplr_x, save_regp, set_fp, end
        let codes = [0xE1u8, 0xC8, 0x02, 0x81, 0xE4];
        assert_eq!(compute_scope_size(&codes[..], 0, false).unwrap(), 3);
        assert_eq!(compute_scope_size(&codes[..], 1, true).unwrap(), 3);
        // Custom frames are not instructions.
        let codes = [0xE9u8, 0xE4];
        assert_eq!(compute_scope_size(&codes[..], 0, false).unwrap(), 0);
    }

    #[test]
    fn locate_in_body_runs_everything() {
        let codes = [0xE1u8, 0x81, 0xE4, 0xE3];
        let record = record(0x40, true, 1, 1);
        let start = locate(&record, &codes[..], 0x10).unwrap();
        assert_eq!(start, UnwindStart { code_offset: 0, skip_words: 0, handler_applies: true });
    }

    #[test]
    fn locate_in_prolog_skips_unexecuted_codes() {
        // set_fp, save_fplr_x, alloc_s, end
        let codes = [0xE1u8, 0x81, 0x02, 0xE4];
        let record = record(0x40, false, 0, 1);

        // At the first instruction nothing has run yet.
        let start = locate(&record, &codes[..], 0).unwrap();
        assert_eq!(start, UnwindStart { code_offset: 3, skip_words: 3, handler_applies: false });

        // After the first instruction (alloc), skip set_fp and save_fplr_x.
        let start = locate(&record, &codes[..], 1).unwrap();
        assert_eq!(start, UnwindStart { code_offset: 2, skip_words: 2, handler_applies: false });

        let start = locate(&record, &codes[..], 3).unwrap();
        assert_eq!(start, UnwindStart { code_offset: 0, skip_words: 0, handler_applies: true });
    }

    #[test]
    fn locate_in_header_epilog() {
        // prolog: set_fp, save_fplr_x, end ; epilog from index 1: save_fplr_x, end
        let codes = [0xE1u8, 0x81, 0xE4, 0xE3];
        let record = record(0x40, true, 1, 1);

        // Epilog is 2 instructions (save_fplr_x + ret) at offsets 0x3E and 0x3F.
        let start = locate(&record, &codes[..], 0x3E).unwrap();
        assert_eq!(start, UnwindStart { code_offset: 1, skip_words: 0, handler_applies: false });

        let start = locate(&record, &codes[..], 0x3F).unwrap();
        assert_eq!(start, UnwindStart { code_offset: 2, skip_words: 1, handler_applies: false });

        let start = locate(&record, &codes[..], 0x3D).unwrap();
        assert!(start.handler_applies);
        assert_eq!(start.code_offset, 0);
    }

    #[test]
    fn locate_scans_epilog_scopes_in_order() {
        let mut image = vec![0u8; 0x20];
        image[0..4].copy_from_slice(&XdataHeader::new(0x40, false, 2, 1).bits().to_le_bytes());
        image[4..8].copy_from_slice(&(0x10u32 | (2 << 22)).to_le_bytes());
        image[8..12].copy_from_slice(&(0x30u32 | (2 << 22)).to_le_bytes());
        // prolog: alloc_s, end ; epilog: alloc_s, end
        image[12..16].copy_from_slice(&[0x02, 0xE4, 0x02, 0xE4]);
        let memory = SliceMemory::new(BASE, &image);
        let xdata = RemoteXdata::read(&memory, BASE).unwrap();

        let start = locate(&xdata.record, &xdata, 0x11).unwrap();
        assert_eq!(start, UnwindStart { code_offset: 3, skip_words: 1, handler_applies: false });

        let start = locate(&xdata.record, &xdata, 0x30).unwrap();
        assert_eq!(start, UnwindStart { code_offset: 2, skip_words: 0, handler_applies: false });

        let start = locate(&xdata.record, &xdata, 0x20).unwrap();
        assert_eq!(start, UnwindStart { code_offset: 0, skip_words: 0, handler_applies: true });
    }

    #[test]
    fn skip_never_passes_end_marker() {
        let codes = [0x02u8, 0xE4, 0x02, 0x02];
        let start = skip_codes(&codes[..], UnwindStart { code_offset: 0, skip_words: 10, handler_applies: false }).unwrap();
        assert_eq!(start.code_offset, 1);

        let codes = [0x02u8, 0x02];
        let start = skip_codes(&codes[..], UnwindStart { code_offset: 0, skip_words: 10, handler_applies: false }).unwrap();
        assert_eq!(start.code_offset, 2);
    }
}
