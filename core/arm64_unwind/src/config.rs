//! Unwinder configuration.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0

bitflags::bitflags! {
    /// Custom-frame opcodes the unwinder is allowed to interpret.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CustomFrames: u8 {
        const TRAP_FRAME = 1 << 0;
        const MACHINE_FRAME = 1 << 1;
        const CONTEXT = 1 << 2;
        const CLEAR_UNWOUND_TO_CALL = 1 << 3;
    }
}

/// Bits of LR kept when stripping a pointer-authentication code.
pub const DEFAULT_PAC_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

/// Frame limit for a single walk.
pub const DEFAULT_MAX_FRAMES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnwindConfig {
    pub custom_frames: CustomFrames,
    /// Strip authentication bits from LR at `pac` opcodes and PAC-chained
    /// compact frames.
    pub strip_pac: bool,
    pub pac_mask: u64,
    pub max_frames: usize,
}

impl UnwindConfig {
    /// Unwinding the current process: every custom frame is understood and
    /// return addresses are stripped of their PAC.
    pub const fn in_process() -> Self {
        Self {
            custom_frames: CustomFrames::all(),
            strip_pac: true,
            pac_mask: DEFAULT_PAC_MASK,
            max_frames: DEFAULT_MAX_FRAMES,
        }
    }

    /// Unwinding a captured target: kernel and context-record frames are
    /// not followed and LR is reported as stored.
    pub const fn out_of_process() -> Self {
        Self {
            custom_frames: CustomFrames::MACHINE_FRAME.union(CustomFrames::CLEAR_UNWOUND_TO_CALL),
            strip_pac: false,
            pac_mask: DEFAULT_PAC_MASK,
            max_frames: DEFAULT_MAX_FRAMES,
        }
    }

    pub const fn with_custom_frames(mut self, custom_frames: CustomFrames) -> Self {
        self.custom_frames = custom_frames;
        self
    }

    pub const fn with_strip_pac(mut self, strip_pac: bool) -> Self {
        self.strip_pac = strip_pac;
        self
    }

    pub const fn with_max_frames(mut self, max_frames: usize) -> Self {
        self.max_frames = max_frames;
        self
    }

    /// Applies the PAC mask to `lr` if stripping is enabled.
    pub const fn strip(&self, lr: u64) -> u64 {
        if self.strip_pac {
            lr & self.pac_mask
        } else {
            lr
        }
    }
}

impl Default for UnwindConfig {
    fn default() -> Self {
        cfg_if::cfg_if! {
            if #[cfg(target_arch = "aarch64")] {
                Self::in_process()
            } else {
                Self::out_of_process()
            }
        }
    }
}
