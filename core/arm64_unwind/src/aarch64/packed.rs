//! Packed (compact) unwind data and its expansion into full unwind codes.
//!
//! Packed `.pdata` word:
//!                      .-------------------------------------------------------------------------------------------------------------------------------.
//!                      | 3 | 2 | 2 | 2 | 2 | 2 | 2 | 2 | 2 | 2 | 2 | 2 | 1 | 1 | 1 | 1 | 1 | 1 | 1 | 1 | 1 | 0 | 0 | 0 | 0 | 0 | 0 | 0 | 0 | 0 | 0 | 0 |
//!                      | 1 | 0 | 9 | 8 | 7 | 6 | 5 | 4 | 3 | 2 | 1 | 0 | 9 | 8 | 7 | 6 | 5 | 4 | 3 | 2 | 1 | 0 | 9 | 8 | 7 | 6 | 5 | 4 | 3 | 2 | 1 | 0 |
//!                      .-------------------------------------------------------------------------------------------------------------------------------.
//!                      | Frame Size                        | CR    | H | RegI          | RegF      | Function Length                           | Flag  |
//!                      '-------------------------------------------------------------------------------------------------------------------------------'
//!
//! Rather than interpret the packed form directly, the canonical prolog it
//! describes is synthesized as ordinary unwind codes, so the same locator and
//! interpreter handle both forms.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
use core::fmt;

use super::{
    unwind_code::CodeStream,
    xdata::{XdataHeader, XdataRecord},
};
use crate::{
    byte_reader::ByteReader,
    error::{Error, UwResult},
};

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameChainMode {
    Unchained = 0,
    UnchainedSavedLr = 1,
    ChainedWithPac = 2,
    Chained = 3,
}

impl FrameChainMode {
    const fn from_bits(bits: u32) -> Self {
        match bits & 0x3 {
            0 => Self::Unchained,
            1 => Self::UnchainedSavedLr,
            2 => Self::ChainedWithPac,
            _ => Self::Chained,
        }
    }

    const fn is_chained(self) -> bool {
        matches!(self, Self::Chained | Self::ChainedWithPac)
    }
}

/// `PackedUnwindData`
/// Source: <https://learn.microsoft.com/en-us/cpp/build/arm64-exception-handling#packed-unwind-data>
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PackedUnwindData(u32);

impl PackedUnwindData {
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn flag(&self) -> u32 {
        self.0 & 0x3
    }

    pub const fn is_fragment(&self) -> bool {
        self.flag() == 2
    }

    /// Function length in 4-byte units.
    pub const fn function_length_units(&self) -> u32 {
        (self.0 >> 2) & 0x7FF
    }

    /// Function length in bytes.
    pub const fn function_length(&self) -> u32 {
        self.function_length_units() * 4
    }

    /// Number of saved d8.. registers, minus one (0 means none).
    pub const fn reg_f(&self) -> u32 {
        (self.0 >> 13) & 0x7
    }

    /// Number of saved x19.. registers.
    pub const fn reg_i(&self) -> u32 {
        (self.0 >> 16) & 0xF
    }

    /// Whether x0-x7 are homed.
    pub const fn homes_params(&self) -> bool {
        (self.0 >> 20) & 0x1 != 0
    }

    pub const fn cr(&self) -> FrameChainMode {
        FrameChainMode::from_bits(self.0 >> 21)
    }

    /// Total frame size in 16-byte units.
    pub const fn frame_size(&self) -> u32 {
        (self.0 >> 23) & 0x1FF
    }

    /// Expands this packed descriptor into the equivalent full unwind codes.
    pub fn expand(&self) -> ExpandedUnwindInfo {
        let mut builder = OpBuilder::new();
        let cr = self.cr();
        let reg_i = self.reg_i() as i32;

        // Sizes in 8-byte slots.
        let famsz = self.frame_size() as i32 * 2;
        let intsz = reg_i + (cr == FrameChainMode::UnchainedSavedLr) as i32;
        let fpsz = match self.reg_f() {
            0 => 0,
            reg_f => reg_f as i32 + 1,
        };

        // Homes live in the register save area when there is one; otherwise
        // they are stored with the locals and need no codes.
        let mut savsz = intsz + fpsz;
        if savsz > 0 {
            savsz += self.homes_params() as i32 * 8;
        }
        let savsz = (savsz + 1) & !1; // ALIGN_UP_BY 2
        let locsz = famsz - savsz;

        log::debug!("    > IN(packed): {}", self); // debug
        log::debug!("    > intsz: 0x{:X}, fpsz: 0x{:X}, savsz: 0x{:X}, locsz: 0x{:X}", intsz, fpsz, savsz, locsz); // debug

        // Codes are produced from the outermost (end) inwards and reversed at
        // the end.
        builder.push(&[0xE4]); // end
        if cr == FrameChainMode::ChainedWithPac {
            builder.push(&[0xFC]); // pac
        }

        let mut sav_slot = 0;
        let mut predec_done = false;

        if intsz != 0 {
            // Only x19 + LR: there is no pre-decrementing form of save_lrpair,
            // so the save area is allocated on its own first.
            if reg_i == 1 && cr == FrameChainMode::UnchainedSavedLr {
                builder.alloc(savsz * 8);
                predec_done = true;
            }

            let mut intreg = 0;
            while intreg < (reg_i / 2) * 2 {
                if !predec_done {
                    builder.save_regp_x(intreg, -savsz * 8);
                    predec_done = true;
                } else {
                    builder.save_regp(intreg, sav_slot * 8);
                }
                sav_slot += 2;
                intreg += 2;
            }

            if reg_i % 2 == 1 {
                if cr == FrameChainMode::UnchainedSavedLr {
                    builder.save_lrpair(intreg, sav_slot * 8);
                    sav_slot += 2;
                } else if !predec_done {
                    builder.save_reg_x(intreg, -savsz * 8);
                    sav_slot += 1;
                    predec_done = true;
                } else {
                    builder.save_reg(intreg, sav_slot * 8);
                    sav_slot += 1;
                }
            } else if cr == FrameChainMode::UnchainedSavedLr {
                // LR is x(19 + 11).
                if !predec_done {
                    builder.save_reg_x(11, -savsz * 8);
                    predec_done = true;
                } else {
                    builder.save_reg(11, sav_slot * 8);
                }
                sav_slot += 1;
            }
        }

        if fpsz != 0 {
            let mut fpreg = 0;
            while fpreg < (fpsz / 2) * 2 {
                if !predec_done {
                    builder.save_fregp_x(fpreg, -savsz * 8);
                    predec_done = true;
                } else {
                    builder.save_fregp(fpreg, sav_slot * 8);
                }
                sav_slot += 2;
                fpreg += 2;
            }

            if fpsz % 2 == 1 {
                if !predec_done {
                    builder.save_freg_x(fpreg, -savsz * 8);
                    predec_done = true;
                } else {
                    builder.save_freg(fpreg, sav_slot * 8);
                }
                sav_slot += 1;
            }
        }

        // Homing stores in the save area are four instructions with no unwind
        // effect. Remember where they are so the epilog can leave them out.
        let mut ops_before_nops = None;
        if self.homes_params() && predec_done {
            ops_before_nops = Some(builder.len);
            builder.push(&[0xE3, 0xE3, 0xE3, 0xE3]); // nop x4
        }

        let mut fp_set = false;
        if locsz > 0 {
            if cr.is_chained() {
                if locsz <= 512 / 8 {
                    builder.save_fplr_x(-locsz * 8);
                } else {
                    builder.alloc(locsz * 8);
                    builder.save_fplr(0);
                }
                builder.push(&[0xE1]); // set_fp
                fp_set = true;
            } else {
                builder.alloc(locsz * 8);
            }
        }

        if self.is_fragment() {
            builder.push(&[0xE5]); // end_c
        }

        // With E set, the count is the index of the epilog's first code. The
        // epilog skips set_fp.
        let epilog_in_header = !self.is_fragment();
        let mut epilog_index = (epilog_in_header && fp_set) as u32;

        let used = builder.len;
        builder.codes[..used].reverse();

        let mut used_total = used;
        if let Some(ops_before_nops) = ops_before_nops.filter(|_| epilog_in_header) {
            // Epilog is a copy of the prolog minus the four nops.
            let nops_start = used - ops_before_nops - 4;
            let mut dst = used;
            for src in (0..used).filter(|&i| i < nops_start || i >= nops_start + 4) {
                builder.codes[dst] = builder.codes[src];
                dst += 1;
            }
            epilog_index += used as u32;
            used_total = used * 2 - 4;
        }

        let code_words = used_total.div_ceil(4) as u32;

        // A homed, fully saved frame puts the epilog index past the five bits
        // the first header word has for it.
        let units = self.function_length_units();
        let (header, extension) = if epilog_index > 0x1F || code_words > 0x1F {
            (XdataHeader::new(units, epilog_in_header, 0, 0), Some(epilog_index | (code_words << 16)))
        } else {
            (XdataHeader::new(units, epilog_in_header, epilog_index, code_words), None)
        };

        log::debug!(
            "    > Expanded codes: {:02X?}, epilog index: {}",
            &builder.codes[..used_total],
            epilog_index
        ); // debug

        ExpandedUnwindInfo { header, extension, codes: builder.codes }
    }
}

impl fmt::Display for PackedUnwindData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PackedUnwindData {{ flag: 0x{:X}, function_length: 0x{:X}, reg_f: 0x{:X}, reg_i: 0x{:X}, h: 0x{:X}, cr: 0x{:X}, frame_size: 0x{:X} }}",
            self.flag(),
            self.function_length(),
            self.reg_f(),
            self.reg_i(),
            self.homes_params() as u8,
            self.cr() as u8,
            self.frame_size() * 16
        )
    }
}

/// Size of the synthesized code buffer.
///
/// The longest prolog any packed word can describe is 34 bytes: end, pac,
/// sixteen bytes of integer saves, eight of float saves, four homing nops and
/// four for the local area. Its epilog copy drops the nops, adding 30 more.
pub const EXPANDED_CODES_SIZE: usize = 64;

/// Full-format header and unwind codes synthesized from packed data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExpandedUnwindInfo {
    pub header: XdataHeader,
    /// Extension word, present when the counts do not fit the header.
    pub extension: Option<u32>,
    codes: [u8; EXPANDED_CODES_SIZE],
}

impl ExpandedUnwindInfo {
    pub fn record(&self) -> UwResult<XdataRecord> {
        XdataRecord::from_words(self.header, self.extension)
    }

    /// Number of 32-bit words of unwind codes.
    pub const fn code_words(&self) -> u32 {
        match self.extension {
            Some(extension) => (extension >> 16) & 0xFF,
            None => self.header.code_words(),
        }
    }

    /// The codes covered by the code words.
    pub fn codes(&self) -> &[u8] {
        let len = (4 * self.code_words() as usize).min(EXPANDED_CODES_SIZE);
        &self.codes[..len]
    }
}

impl CodeStream for ExpandedUnwindInfo {
    fn code_len(&self) -> usize {
        self.codes().len()
    }

    fn code_byte(&self, index: usize) -> UwResult<u8> {
        self.codes().read8(index)
    }

    fn epilog_scope(&self, index: usize) -> UwResult<u32> {
        Err(Error::OutOfBoundsRead { index })
    }
}

/// Accumulates codes in reverse byte order.
struct OpBuilder {
    codes: [u8; EXPANDED_CODES_SIZE],
    len: usize,
}

impl OpBuilder {
    const fn new() -> Self {
        Self { codes: [0; EXPANDED_CODES_SIZE], len: 0 }
    }

    /// Appends bytes given in reverse order (last wire byte first).
    fn push(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.codes[self.len] = byte;
            self.len += 1;
        }
    }

    /// Appends a 16-bit opcode given as its big-endian value.
    fn push16(&mut self, value: u16) {
        self.push(&value.to_le_bytes());
    }

    fn alloc(&mut self, size: i32) {
        let units = (size / 16) as u32;
        if size >= 16384 {
            self.push(&(0xE000_0000 | (units & 0x00FF_FFFF)).to_le_bytes()); // alloc_l
        } else if size >= 512 {
            self.push16(0xC000 | (units & 0x7FF) as u16); // alloc_m
        } else {
            self.push(&[(units & 0x1F) as u8]); // alloc_s
        }
    }

    fn save_fplr(&mut self, offset: i32) {
        self.push(&[0x40 | ((offset / 8) & 0x3F) as u8]);
    }

    fn save_fplr_x(&mut self, offset: i32) {
        self.push(&[0x80 | ((-offset / 8 - 1) & 0x3F) as u8]);
    }

    fn save_regp(&mut self, reg: i32, offset: i32) {
        self.push16(0xC800 | ((reg as u16 & 0xF) << 6) | ((offset / 8) as u16 & 0x3F));
    }

    fn save_regp_x(&mut self, reg: i32, offset: i32) {
        self.push16(0xCC00 | ((reg as u16 & 0xF) << 6) | ((-offset / 8 - 1) as u16 & 0x3F));
    }

    fn save_reg(&mut self, reg: i32, offset: i32) {
        self.push16(0xD000 | ((reg as u16 & 0xF) << 6) | ((offset / 8) as u16 & 0x3F));
    }

    fn save_reg_x(&mut self, reg: i32, offset: i32) {
        self.push16(0xD400 | ((reg as u16 & 0xF) << 5) | ((-offset / 8 - 1) as u16 & 0x1F));
    }

    fn save_lrpair(&mut self, reg: i32, offset: i32) {
        self.push16(0xD600 | (((reg / 2) as u16 & 0x7) << 6) | ((offset / 8) as u16 & 0x3F));
    }

    fn save_fregp(&mut self, reg: i32, offset: i32) {
        self.push16(0xD800 | ((reg as u16 & 0x7) << 6) | ((offset / 8) as u16 & 0x3F));
    }

    fn save_fregp_x(&mut self, reg: i32, offset: i32) {
        self.push16(0xDA00 | ((reg as u16 & 0x7) << 6) | ((-offset / 8 - 1) as u16 & 0x3F));
    }

    fn save_freg(&mut self, reg: i32, offset: i32) {
        self.push16(0xDC00 | ((reg as u16 & 0x7) << 6) | ((offset / 8) as u16 & 0x3F));
    }

    fn save_freg_x(&mut self, reg: i32, offset: i32) {
        self.push16(0xDE00 | ((reg as u16 & 0x7) << 5) | ((-offset / 8 - 1) as u16 & 0x1F));
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::{
        aarch64::{interpreter::interpret, restore::RegisterRestorer},
        config::UnwindConfig,
        context::Arm64Context,
        test_support::FakeStack,
    };

    fn packed(flag: u32, len_units: u32, reg_f: u32, reg_i: u32, h: u32, cr: u32, frame_units: u32) -> PackedUnwindData {
        PackedUnwindData::from_bits(
            flag | (len_units << 2) | (reg_f << 13) | (reg_i << 16) | (h << 20) | (cr << 21) | (frame_units << 23),
        )
    }

    #[test]
    fn parse_packed_fields() {
        let data = packed(1, 0x20, 3, 2, 1, 2, 5);
        assert_eq!(data.flag(), 1);
        assert_eq!(data.function_length(), 0x80);
        assert_eq!(data.reg_f(), 3);
        assert_eq!(data.reg_i(), 2);
        assert!(data.homes_params());
        assert_eq!(data.cr(), FrameChainMode::ChainedWithPac);
        assert_eq!(data.frame_size(), 5);
        assert!(!data.is_fragment());
    }

    #[test]
    fn expand_full_featured_frame() {
        // x19-x28, d8-d15, homed params, PAC-chained, 8000-byte frame.
        let expanded = packed(1, 0x100, 7, 10, 1, 2, 500).expand();
        let prolog = [
            0xE1, 0x40, 0xC1, 0xE7, 0xE3, 0xE3, 0xE3, 0xE3, 0xD9, 0x90, 0xD9, 0x0E, 0xD8, 0x8C, 0xD8, 0x0A, 0xCA, 0x08,
            0xC9, 0x86, 0xC9, 0x04, 0xC8, 0x82, 0xCC, 0x19, 0xFC, 0xE4,
        ];
        let epilog = [
            0xE1, 0x40, 0xC1, 0xE7, 0xD9, 0x90, 0xD9, 0x0E, 0xD8, 0x8C, 0xD8, 0x0A, 0xCA, 0x08, 0xC9, 0x86, 0xC9, 0x04,
            0xC8, 0x82, 0xCC, 0x19, 0xFC, 0xE4,
        ];

        let codes = expanded.codes();
        assert_eq!(codes.len(), 52);
        assert_eq!(&codes[..28], &prolog);
        assert_eq!(&codes[28..52], &epilog);

        let record = expanded.record().unwrap();
        assert!(record.header.epilog_in_header());
        assert_eq!(record.unwind_index, 29);
        assert_eq!(record.code_words, 13);
        assert_eq!(record.header.function_length_units(), 0x100);
    }

    #[test]
    fn expand_chained_pair_frame() {
        // x19/x20 then fp/lr, 32-byte frame.
        let expanded = packed(1, 0x20, 0, 2, 0, 3, 2).expand();
        assert_eq!(&expanded.codes()[..5], &[0xE1, 0x81, 0xCC, 0x01, 0xE4]);
        assert_eq!(expanded.header.code_words(), 2);
        assert!(expanded.header.epilog_in_header());
        assert_eq!(expanded.header.epilog_count(), 1);
    }

    #[test]
    fn expand_single_register_with_lr() {
        // x19 + lr: alloc first, then save_lrpair.
        let expanded = packed(1, 0x10, 0, 1, 0, 1, 1).expand();
        assert_eq!(&expanded.codes()[..4], &[0xD6, 0x00, 0x01, 0xE4]);
        assert_eq!(expanded.header.epilog_count(), 0);
    }

    #[test]
    fn expand_even_registers_with_lr() {
        // x19, x20, lr: save_regp_x then save_reg for lr.
        let expanded = packed(1, 0x10, 0, 2, 0, 1, 2).expand();
        assert_eq!(&expanded.codes()[..5], &[0xD2, 0xC2, 0xCC, 0x03, 0xE4]);
    }

    #[test]
    fn expand_odd_registers_and_float() {
        // x19, d8 d9, unchained, no locals.
        let expanded = packed(1, 0x10, 1, 1, 0, 0, 2).expand();
        assert_eq!(&expanded.codes()[..5], &[0xD8, 0x01, 0xD4, 0x03, 0xE4]);
    }

    #[test]
    fn expand_fragment_has_no_epilog() {
        let expanded = packed(2, 0x10, 0, 0, 0, 0, 4).expand();
        assert_eq!(&expanded.codes()[..3], &[0xE5, 0x04, 0xE4]);
        assert!(!expanded.header.epilog_in_header());
        assert_eq!(expanded.header.epilog_count(), 0);
    }

    #[test]
    fn expand_largest_local_area() {
        // 8176 bytes of locals, unchained: alloc_m.
        let expanded = packed(1, 0x10, 0, 0, 0, 0, 0x1FF).expand();
        assert_eq!(&expanded.codes()[..3], &[0xC1, 0xFF, 0xE4]);
    }

    #[test]
    fn expand_longest_prolog_uses_extended_header() {
        // RegI 15, d8-d15, homed params, PAC-chained, largest frame.
        let expanded = packed(1, 0x10, 7, 15, 1, 2, 0x1FF).expand();
        assert!(expanded.header.is_extended());
        assert_eq!(expanded.extension, Some(35 | (16 << 16)));
        assert_eq!(expanded.code_words(), 16);

        let codes = expanded.codes();
        assert_eq!(codes.len(), EXPANDED_CODES_SIZE);
        assert_eq!(&codes[..4], &[0xE1, 0x40, 0xC1, 0xEF]);
        assert_eq!(&codes[4..8], &[0xE3, 0xE3, 0xE3, 0xE3]);
        assert_eq!(&codes[32..36], &[0xFC, 0xE4, 0xE1, 0x40]);
        assert_eq!(&codes[60..], &[0xCC, 0x1F, 0xFC, 0xE4]);

        let record = expanded.record().unwrap();
        assert!(record.header.epilog_in_header());
        assert_eq!(record.unwind_index, 35);
        assert_eq!(record.code_words, 16);
        assert_eq!(expanded.code_len(), 64);
    }

    #[test]
    fn every_packed_word_expands() {
        for flag in 1..=2 {
            for reg_f in 0..8 {
                for reg_i in 0..16 {
                    for h in 0..2 {
                        for cr in 0..4 {
                            for frame_units in 0..0x200 {
                                let data = packed(flag, 0x100, reg_f, reg_i, h, cr, frame_units);
                                let expanded = data.expand();
                                let record = expanded.record().unwrap();
                                assert!(expanded.codes().len() <= EXPANDED_CODES_SIZE, "{}", data);
                                assert!(record.unwind_index as usize <= expanded.codes().len(), "{}", data);
                                assert_eq!(record.code_words, expanded.code_words(), "{}", data);
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn interpreted_expansion_restores_the_described_frame() {
        // Every slot holds a value derived from its own address.
        const S0: u64 = 0x8000;
        let slot = |address: u64| 0xC0DE_0000_0000 | address;
        let mut stack = FakeStack::new(S0, 0x2000);
        for address in (S0..S0 + 0x2000).step_by(8) {
            stack.put_u64(address, slot(address));
        }
        let memory = stack.memory();
        let config = UnwindConfig::out_of_process();

        let mut initial = Arm64Context::with_frame(0x1234, S0, S0, 0x4321);
        for i in 19..29 {
            initial.x[i] = 0x1900 + i as u64;
        }
        for j in 8..16 {
            initial.v[j].low = 0xD800 + j as u64;
        }

        for flag in 1..=2 {
            for reg_f in 0..8u32 {
                for reg_i in 0..=10u32 {
                    for h in 0..2u32 {
                        for cr in 0..4u32 {
                            let chained = cr >= 2;

                            // Save area and frame sizes, in 8-byte slots.
                            let intsz = reg_i + (cr == 1) as u32;
                            let fpsz = if reg_f == 0 { 0 } else { reg_f + 1 };
                            let mut savsz = intsz + fpsz;
                            if savsz > 0 {
                                savsz += 8 * h;
                            }
                            let savsz = (savsz + 1) & !1;
                            let min_units = savsz / 2 + chained as u32;

                            for frame_units in [min_units, min_units.max(0x20), 0x1FF] {
                                let data = packed(flag, 0x100, reg_f, reg_i, h, cr, frame_units);
                                let famsz = 2 * frame_units as u64;
                                let locsz = famsz - savsz as u64;
                                let base = S0 + 8 * locsz;

                                let mut expected = initial;
                                for i in 0..reg_i as u64 {
                                    expected.x[19 + i as usize] = slot(base + 8 * i);
                                }
                                if cr == 1 {
                                    expected.lr = slot(base + 8 * reg_i as u64);
                                }
                                for j in 0..fpsz as u64 {
                                    expected.v[8 + j as usize].low = slot(base + 8 * (intsz as u64 + j));
                                }
                                if chained && locsz > 0 {
                                    expected.fp = slot(S0);
                                    expected.lr = slot(S0 + 8);
                                }
                                expected.sp = S0 + 8 * famsz;
                                expected.pc = expected.lr;

                                let expanded = data.expand();
                                let mut ctx = initial;
                                let mut restorer = RegisterRestorer::new(&memory, None, None);
                                let frame = interpret(&expanded, 0, &mut ctx, &mut restorer, &config).unwrap();
                                assert_eq!(ctx, expected, "{}", data);
                                assert_eq!(frame, expected.sp, "{}", data);
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn expanded_stream_rejects_scopes() {
        let expanded = packed(1, 0x10, 0, 0, 0, 0, 1).expand();
        assert!(expanded.epilog_scope(0).is_err());
        assert_eq!(expanded.code_len(), 4);
    }
}
