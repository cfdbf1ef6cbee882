//! ARM64 register context.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
use core::fmt::{self, Display, Formatter};

bitflags::bitflags! {
    /// `ContextFlags` of an ARM64 context record.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct ContextFlags: u32 {
        const ARM64 = 0x0040_0000;
        const CONTROL = 0x0040_0001;
        const INTEGER = 0x0040_0002;
        const FLOATING_POINT = 0x0040_0004;
        const DEBUG = 0x0040_0008;
        /// The PC is a return address; the caller should back up one
        /// instruction to find the call site.
        const UNWOUND_TO_CALL = 0x2000_0000;
    }
}

/// Byte offsets of the fields of an in-memory ARM64 `CONTEXT` record.
pub mod layout {
    pub const CONTEXT_FLAGS: u64 = 0x000;
    pub const CPSR: u64 = 0x004;
    pub const X0: u64 = 0x008;
    pub const FP: u64 = 0x0F0;
    pub const LR: u64 = 0x0F8;
    pub const SP: u64 = 0x100;
    pub const PC: u64 = 0x108;
    pub const V0: u64 = 0x110;
    pub const FPCR: u64 = 0x310;
    pub const FPSR: u64 = 0x314;
    pub const SIZE: u64 = 0x390;
}

/// One 128-bit vector register.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Neon128 {
    pub low: u64,
    pub high: u64,
}

/// Full ARM64 register state for one frame.
///
/// Register indices used throughout the crate follow the architectural
/// numbering: 0..=28 are X0..X28, 29 is FP and 30 is LR.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Arm64Context {
    pub flags: ContextFlags,
    pub cpsr: u32,
    pub x: [u64; 29],
    pub fp: u64,
    pub lr: u64,
    pub sp: u64,
    pub pc: u64,
    pub v: [Neon128; 32],
    pub fpcr: u32,
    pub fpsr: u32,
}

impl Arm64Context {
    /// Index of the frame pointer in general register numbering.
    pub const FP_INDEX: u8 = 29;
    /// Index of the link register in general register numbering.
    pub const LR_INDEX: u8 = 30;

    /// Context with only the control registers populated.
    pub fn with_frame(pc: u64, sp: u64, fp: u64, lr: u64) -> Self {
        Self { flags: ContextFlags::CONTROL, pc, sp, fp, lr, ..Default::default() }
    }

    /// Reads general register `index` (0..=30).
    pub fn gpr(&self, index: u8) -> u64 {
        match index {
            Self::FP_INDEX => self.fp,
            Self::LR_INDEX => self.lr,
            n => self.x[n as usize],
        }
    }

    /// Writes general register `index` (0..=30).
    pub fn set_gpr(&mut self, index: u8, value: u64) {
        match index {
            Self::FP_INDEX => self.fp = value,
            Self::LR_INDEX => self.lr = value,
            n => self.x[n as usize] = value,
        }
    }

    pub fn is_unwound_to_call(&self) -> bool {
        self.flags.contains(ContextFlags::UNWOUND_TO_CALL)
    }

    pub fn set_unwound_to_call(&mut self, value: bool) {
        self.flags.set(ContextFlags::UNWOUND_TO_CALL, value);
    }

    /// Captures PC, SP, FP, and LR of the calling function.
    #[cfg(target_arch = "aarch64")]
    #[inline(always)]
    pub fn capture_frame_registers() -> Self {
        let (pc, sp, fp, lr): (u64, u64, u64, u64);
        // SAFETY: Reading PC/SP/FP/LR does not mutate memory and the hardware
        // guarantees those registers exist on aarch64.
        unsafe {
            core::arch::asm!(
                "adr {pc}, .",   // Get current PC (program counter)
                "mov {sp}, sp",  // Get current SP (stack pointer)
                "mov {fp}, x29", // Get current FP (frame pointer)
                "mov {lr}, x30", // Get current LR (link register)
                pc = out(reg) pc,
                sp = out(reg) sp,
                fp = out(reg) fp,
                lr = out(reg) lr,
                options(nomem, nostack, preserves_flags),
            );
        }
        Self::with_frame(pc, sp, fp, lr)
    }
}

impl Display for Arm64Context {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "PC: {:016X}, SP: {:016X}, FP: {:016X}, LR: {:016X}", self.pc, self.sp, self.fp, self.lr)
    }
}

/// Receives the address each register was restored from.
///
/// General registers use the numbering of [`Arm64Context::gpr`]; vector
/// registers are V0..V31.
pub trait ContextPointerSink {
    fn record_general(&mut self, register: u8, address: u64);
    fn record_vector(&mut self, register: u8, address: u64);
}

/// Locations of the nonvolatile registers, for debuggers that need to write
/// back into a caller's frame.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NonvolatileContextPointers {
    /// X19..X28.
    pub x: [Option<u64>; 10],
    pub fp: Option<u64>,
    pub lr: Option<u64>,
    /// D8..D15.
    pub d: [Option<u64>; 8],
}

impl ContextPointerSink for NonvolatileContextPointers {
    fn record_general(&mut self, register: u8, address: u64) {
        match register {
            19..=28 => self.x[register as usize - 19] = Some(address),
            Arm64Context::FP_INDEX => self.fp = Some(address),
            Arm64Context::LR_INDEX => self.lr = Some(address),
            _ => {}
        }
    }

    fn record_vector(&mut self, register: u8, address: u64) {
        if (8..=15).contains(&register) {
            self.d[register as usize - 8] = Some(address);
        }
    }
}
