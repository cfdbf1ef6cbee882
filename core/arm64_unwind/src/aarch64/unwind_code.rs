//! ARM64 unwind opcode decoding.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
use core::fmt;

use crate::{
    byte_reader::ByteReader,
    error::{Error, UwResult},
};

/// Byte length of opcodes 0xE0..=0xFF.
const UNWIND_CODE_SIZE_TABLE: [u8; 32] =
    [4, 1, 2, 1, 1, 1, 1, 3, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 2, 3, 4, 5, 1, 1, 1, 1];

/// Instructions described by opcodes 0xE0..=0xFF.
const UNWIND_CODE_INSTRUCTION_COUNT_TABLE: [u8; 32] =
    [1, 1, 1, 1, 1, 1, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 1, 1, 1, 1];

/// Byte length of the opcode starting with `op`.
pub const fn opcode_size(op: u8) -> usize {
    match op {
        0x00..=0xBF => 1,
        0xC0..=0xDF => 2,
        _ => UNWIND_CODE_SIZE_TABLE[(op - 0xE0) as usize] as usize,
    }
}

/// Number of prolog/epilog instructions the opcode starting with `op`
/// stands for.
pub const fn instruction_count(op: u8) -> u32 {
    match op {
        0x00..=0xDF => 1,
        _ => UNWIND_CODE_INSTRUCTION_COUNT_TABLE[(op - 0xE0) as usize] as u32,
    }
}

/// `end` or `end_c`.
pub const fn is_end(op: u8) -> bool {
    (op & 0xFE) == 0xE4
}

/// Random access to a block of unwind opcode bytes and, for full `.xdata`
/// records, the epilog scopes in front of it.
pub trait CodeStream {
    /// Number of opcode bytes.
    fn code_len(&self) -> usize;

    /// Reads opcode byte `index`.
    fn code_byte(&self, index: usize) -> UwResult<u8>;

    /// Reads the raw epilog scope record `index`.
    fn epilog_scope(&self, index: usize) -> UwResult<u32>;
}

impl CodeStream for [u8] {
    fn code_len(&self) -> usize {
        self.len()
    }

    fn code_byte(&self, index: usize) -> UwResult<u8> {
        self.read8(index)
    }

    fn epilog_scope(&self, index: usize) -> UwResult<u32> {
        Err(Error::OutOfBoundsRead { index })
    }
}

/// Register file targeted by the generalized `save_any` opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterClass {
    /// 64-bit general purpose register.
    X,
    /// Low 64 bits of a vector register.
    D,
    /// Full 128-bit vector register.
    Q,
}

impl RegisterClass {
    const fn prefix(self) -> char {
        match self {
            RegisterClass::X => 'x',
            RegisterClass::D => 'd',
            RegisterClass::Q => 'q',
        }
    }
}

/// `UnwindCode`
/// Source: <https://learn.microsoft.com/en-us/cpp/build/arm64-exception-handling?view=msvc-170#unwind-codes>
///
/// Sizes are in bytes. Offsets are signed byte offsets from SP; a negative
/// offset means the register was stored with a pre-decrement of SP.
#[rustfmt::skip]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindCode {
    AllocS(u32),                            // 000xxxxx                                     | allocate small stack with size < 512 (2^5 * 16).
    SaveR19R20X(i32),                       // 001zzzzz                                     | save <x19,x20> pair at [sp-#Z*8]!, pre-indexed offset >= -248
    SaveFpLr(i32),                          // 01zzzzzz                                     | save <x29,lr> pair at [sp+#Z*8], offset <= 504.
    SaveFpLrX(i32),                         // 10zzzzzz                                     | save <x29,lr> pair at [sp-(#Z+1)*8]!, pre-indexed offset >= -512
    AllocM(u32),                            // 11000xxx'xxxxxxxx                            | allocate large stack with size < 32K (2^11 * 16).
    SaveRegP { reg: u8, offset: i32 },      // 110010xx'xxzzzzzz                            | save x(19+#X) pair at [sp+#Z*8], offset <= 504
    SaveRegPX { reg: u8, offset: i32 },     // 110011xx'xxzzzzzz                            | save pair x(19+#X) at [sp-(#Z+1)*8]!, pre-indexed offset >= -512
    SaveReg { reg: u8, offset: i32 },       // 110100xx'xxzzzzzz                            | save reg x(19+#X) at [sp+#Z*8], offset <= 504
    SaveRegX { reg: u8, offset: i32 },      // 1101010x'xxxzzzzz                            | save reg x(19+#X) at [sp-(#Z+1)*8]!, pre-indexed offset >= -256
    SaveLrPair { reg: u8, offset: i32 },    // 1101011x'xxzzzzzz                            | save pair <x(19+2*#X),lr> at [sp+#Z*8], offset <= 504
    SaveFRegP { reg: u8, offset: i32 },     // 1101100x'xxzzzzzz                            | save pair d(8+#X) at [sp+#Z*8], offset <= 504
    SaveFRegPX { reg: u8, offset: i32 },    // 1101101x'xxzzzzzz                            | save pair d(8+#X) at [sp-(#Z+1)*8]!, pre-indexed offset >= -512
    SaveFReg { reg: u8, offset: i32 },      // 1101110x'xxzzzzzz                            | save reg d(8+#X) at [sp+#Z*8], offset <= 504
    SaveFRegX { reg: u8, offset: i32 },     // 11011110'xxxzzzzz                            | save reg d(8+#X) at [sp-(#Z+1)*8]!, pre-indexed offset >= -256
    AllocZ(u8),                             // 11011111'zzzzzzzz                            | allocate stack with size z * SVE-VL
    AllocL(u32),                            // 11100000'xxxxxxxx'xxxxxxxx'xxxxxxxx          | allocate large stack with size < 256M (2^24 * 16)
    SetFp,                                  // 11100001                                     | set up x29 with mov x29,sp
    AddFp(u32),                             // 11100010'xxxxxxxx                            | set up x29 with add x29,sp,#x*8
    Nop,                                    // 11100011                                     | no unwind operation is required.
    End,                                    // 11100100                                     | end of unwind code. Implies ret in epilog.
    EndC,                                   // 11100101                                     | end of unwind code in previous chained scope.
    SaveNext,                               // 11100110                                     | save next non-volatile Int or FP register pair.
    SaveAny {                               // 11100111'0pxrrrrr'ffoooooo                   | save any reg: p pair, x writeback, f X/D/Q
        class: RegisterClass,
        reg: u8,
        paired: bool,
        offset: i32,
    },
    TrapFrame,                              // 11101000                                     | custom stack for MSFT_OP_TRAP_FRAME
    MachineFrame,                           // 11101001                                     | custom stack for MSFT_OP_MACHINE_FRAME
    Context,                                // 11101010                                     | custom stack for MSFT_OP_CONTEXT
    EcContext,                              // 11101011                                     | custom stack for MSFT_OP_EC_CONTEXT
    ClearUnwoundToCall,                     // 11101100                                     | custom stack for MSFT_OP_CLEAR_UNWOUND_TO_CALL
    Reserved(u8),                           // 11101101..11110111                           | reserved
    Future(u8),                             // 111110yy'(1-4 bytes) | 111111xx except 0xFC   | reserved for future use, no-op
    PacSignLr,                              // 11111100                                     | sign the return address in lr with pacibsp
}

struct Offset(i32);

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.0 < 0 {
            write!(f, "[sp,#-0x{:X}]!", self.0.unsigned_abs())
        } else {
            write!(f, "[sp,#0x{:X}]", self.0)
        }
    }
}

impl fmt::Display for UnwindCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            UnwindCode::AllocS(size) => write!(f, "AllocS | sub   sp,sp,#0x{size:X}"),
            UnwindCode::SaveR19R20X(offset) => write!(f, "SaveR19R20X | stp   x19,x20,{}", Offset(offset)),
            UnwindCode::SaveFpLr(offset) => write!(f, "SaveFpLr | stp   fp,lr,{}", Offset(offset)),
            UnwindCode::SaveFpLrX(offset) => write!(f, "SaveFpLrX | stp   fp,lr,{}", Offset(offset)),
            UnwindCode::AllocM(size) => write!(f, "AllocM | sub   sp,sp,#0x{size:X}"),
            UnwindCode::SaveRegP { reg, offset } => {
                write!(f, "SaveRegP | stp   x{},x{},{}", reg, reg + 1, Offset(offset))
            }
            UnwindCode::SaveRegPX { reg, offset } => {
                write!(f, "SaveRegPX | stp   x{},x{},{}", reg, reg + 1, Offset(offset))
            }
            UnwindCode::SaveReg { reg, offset } => write!(f, "SaveReg | str   x{},{}", reg, Offset(offset)),
            UnwindCode::SaveRegX { reg, offset } => write!(f, "SaveRegX | str   x{},{}", reg, Offset(offset)),
            UnwindCode::SaveLrPair { reg, offset } => write!(f, "SaveLrPair | stp   x{},lr,{}", reg, Offset(offset)),
            UnwindCode::SaveFRegP { reg, offset } => {
                write!(f, "SaveFRegP | stp   d{},d{},{}", reg, reg + 1, Offset(offset))
            }
            UnwindCode::SaveFRegPX { reg, offset } => {
                write!(f, "SaveFRegPX | stp   d{},d{},{}", reg, reg + 1, Offset(offset))
            }
            UnwindCode::SaveFReg { reg, offset } => write!(f, "SaveFReg | str   d{},{}", reg, Offset(offset)),
            UnwindCode::SaveFRegX { reg, offset } => write!(f, "SaveFRegX | str   d{},{}", reg, Offset(offset)),
            UnwindCode::AllocZ(size) => write!(f, "AllocZ({size})"),
            UnwindCode::AllocL(size) => write!(f, "AllocL | sub   sp,sp,#0x{size:X}"),
            UnwindCode::SetFp => write!(f, "SetFp | mov   fp,sp"),
            UnwindCode::AddFp(offset) => write!(f, "AddFp | add   fp,sp,#0x{offset:X}"),
            UnwindCode::Nop => write!(f, "Nop"),
            UnwindCode::End => write!(f, "End"),
            UnwindCode::EndC => write!(f, "EndC"),
            UnwindCode::SaveNext => write!(f, "SaveNext"),
            UnwindCode::SaveAny { class, reg, paired: true, offset } => {
                let p = class.prefix();
                write!(f, "SaveAny | stp   {p}{},{p}{},{}", reg, reg + 1, Offset(offset))
            }
            UnwindCode::SaveAny { class, reg, paired: false, offset } => {
                write!(f, "SaveAny | str   {}{},{}", class.prefix(), reg, Offset(offset))
            }
            UnwindCode::TrapFrame => write!(f, "MsftOpTrapFrame"),
            UnwindCode::MachineFrame => write!(f, "MsftOpMachineFrame"),
            UnwindCode::Context => write!(f, "MsftOpContext"),
            UnwindCode::EcContext => write!(f, "MsftOpEcContext"),
            UnwindCode::ClearUnwoundToCall => write!(f, "MsftOpClearUnwoundToCall"),
            UnwindCode::Reserved(op) => write!(f, "Reserved(0x{op:02X})"),
            UnwindCode::Future(op) => write!(f, "Future(0x{op:02X})"),
            UnwindCode::PacSignLr => write!(f, "PacSignLr"),
        }
    }
}

impl UnwindCode {
    /// Decodes the opcode starting at `index`. Returns it with its size.
    pub fn decode<C: CodeStream + ?Sized>(codes: &C, index: usize) -> UwResult<(UnwindCode, usize)> {
        let op = codes.code_byte(index)?;
        let size = opcode_size(op);
        if index + size > codes.code_len() {
            log::error!("    > Opcode 0x{:02X} at {} is truncated", op, index);
            return Err(Error::invalid(op, "opcode extends past the end of the unwind codes"));
        }

        let nx = if size > 1 { codes.code_byte(index + 1)? } else { 0 };

        let code = match op {
            0x00..=0x1F => UnwindCode::AllocS(16 * (op & 0x1F) as u32),
            0x20..=0x3F => UnwindCode::SaveR19R20X(-8 * (op & 0x1F) as i32),
            0x40..=0x7F => UnwindCode::SaveFpLr(8 * (op & 0x3F) as i32),
            0x80..=0xBF => UnwindCode::SaveFpLrX(-8 * ((op & 0x3F) as i32 + 1)),
            0xC0..=0xC7 => UnwindCode::AllocM(16 * ((((op & 0x7) as u32) << 8) | nx as u32)),
            0xC8..=0xCB => UnwindCode::SaveRegP { reg: 19 + ((op & 0x3) << 2) + (nx >> 6), offset: 8 * (nx & 0x3F) as i32 },
            0xCC..=0xCF => UnwindCode::SaveRegPX {
                reg: 19 + ((op & 0x3) << 2) + (nx >> 6),
                offset: -8 * ((nx & 0x3F) as i32 + 1),
            },
            0xD0..=0xD3 => UnwindCode::SaveReg { reg: 19 + ((op & 0x3) << 2) + (nx >> 6), offset: 8 * (nx & 0x3F) as i32 },
            0xD4..=0xD5 => UnwindCode::SaveRegX {
                reg: 19 + ((op & 0x1) << 3) + (nx >> 5),
                offset: -8 * ((nx & 0x1F) as i32 + 1),
            },
            0xD6..=0xD7 => UnwindCode::SaveLrPair {
                reg: 19 + 2 * (((op & 0x1) << 2) + (nx >> 6)),
                offset: 8 * (nx & 0x3F) as i32,
            },
            0xD8..=0xD9 => UnwindCode::SaveFRegP { reg: 8 + ((op & 0x1) << 2) + (nx >> 6), offset: 8 * (nx & 0x3F) as i32 },
            0xDA..=0xDB => UnwindCode::SaveFRegPX {
                reg: 8 + ((op & 0x1) << 2) + (nx >> 6),
                offset: -8 * ((nx & 0x3F) as i32 + 1),
            },
            0xDC..=0xDD => UnwindCode::SaveFReg { reg: 8 + ((op & 0x1) << 2) + (nx >> 6), offset: 8 * (nx & 0x3F) as i32 },
            0xDE => UnwindCode::SaveFRegX { reg: 8 + (nx >> 5), offset: -8 * ((nx & 0x1F) as i32 + 1) },
            0xDF => UnwindCode::AllocZ(nx),
            0xE0 => {
                let x = ((nx as u32) << 16)
                    | ((codes.code_byte(index + 2)? as u32) << 8)
                    | codes.code_byte(index + 3)? as u32;
                UnwindCode::AllocL(16 * x)
            }
            0xE1 => UnwindCode::SetFp,
            0xE2 => UnwindCode::AddFp(8 * nx as u32),
            0xE3 => UnwindCode::Nop,
            0xE4 => UnwindCode::End,
            0xE5 => UnwindCode::EndC,
            0xE6 => UnwindCode::SaveNext,
            0xE7 => Self::decode_save_any(nx, codes.code_byte(index + 2)?)?,
            0xE8 => UnwindCode::TrapFrame,
            0xE9 => UnwindCode::MachineFrame,
            0xEA => UnwindCode::Context,
            0xEB => UnwindCode::EcContext,
            0xEC => UnwindCode::ClearUnwoundToCall,
            0xED..=0xF7 => UnwindCode::Reserved(op),
            0xFC => UnwindCode::PacSignLr,
            0xF8..=0xFF => UnwindCode::Future(op),
        };

        Ok((code, size))
    }

    //      11100111 ' 0pxrrrrr ' ffoooooo
    //      p: 0/1 - single/pair
    //      x: 0/1 - positive offset / negative offset with writeback
    //      r: register number
    //      f: 00/01/10 - X / D / Q
    //      o: offset * 16 for x=1 or p=1 or f=Q / else offset * 8
    fn decode_save_any(byte1: u8, byte2: u8) -> UwResult<UnwindCode> {
        if byte1 & 0x80 != 0 {
            return Err(Error::invalid(0xE7, "save_any reserved bit is set"));
        }

        let paired = byte1 & 0x40 != 0;
        let writeback = byte1 & 0x20 != 0;
        let reg = byte1 & 0x1F;
        let class = match byte2 >> 6 {
            0 => RegisterClass::X,
            1 => RegisterClass::D,
            2 => RegisterClass::Q,
            _ => return Err(Error::invalid(0xE7, "save_any register class is reserved")),
        };

        let o = (byte2 & 0x3F) as i32 + writeback as i32;
        let scale = if writeback || paired || class == RegisterClass::Q { 16 } else { 8 };
        let offset = if writeback { -(o * scale) } else { o * scale };

        Ok(UnwindCode::SaveAny { class, reg, paired, offset })
    }
}

/// Forward-only position in a [`CodeStream`].
pub struct OpcodeCursor<'c, C: CodeStream + ?Sized> {
    codes: &'c C,
    position: usize,
}

impl<'c, C: CodeStream + ?Sized> OpcodeCursor<'c, C> {
    pub fn new(codes: &'c C, position: usize) -> Self {
        Self { codes, position }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Decodes the opcode under the cursor and steps past it. `None` once the
    /// stream is exhausted.
    pub fn next_code(&mut self) -> UwResult<Option<(u8, UnwindCode)>> {
        if self.position >= self.codes.code_len() {
            return Ok(None);
        }
        let op = self.codes.code_byte(self.position)?;
        let (code, size) = UnwindCode::decode(self.codes, self.position)?;
        self.position += size;
        Ok(Some((op, code)))
    }
}
