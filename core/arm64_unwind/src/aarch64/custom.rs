//! Custom frames: fixed-layout structures restored in one step.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
use super::restore::RegisterRestorer;
use crate::{
    config::{CustomFrames, UnwindConfig},
    context::{layout, Arm64Context, ContextFlags},
    error::{Error, UwResult},
    memory::{span_address, MemoryAccessor},
};

/// Byte offsets within an ARM64 kernel trap frame.
mod trap {
    pub const EXCEPTION_ACTIVE: u64 = 0x000;
    pub const VFP_STATE: u64 = 0x010;
    pub const SPSR: u64 = 0x090;
    pub const SP: u64 = 0x098;
    pub const X0: u64 = 0x0A0;
    pub const LR: u64 = 0x138;
    pub const FP: u64 = 0x140;
    pub const PC: u64 = 0x148;
    pub const SIZE: u64 = 0x150;

    /// `ExceptionActive` value of a system-service frame.
    pub const SERVICE_FRAME: u8 = 2;
}

/// Byte offsets within the vector state a trap frame points to.
mod vfp {
    pub const FPCR: u64 = 0x08;
    pub const FPSR: u64 = 0x0C;
    pub const V0: u64 = 0x10;
    pub const SIZE: u64 = V0 + 32 * 16;

    /// Marks FPCR/FPSR that were never saved.
    pub const INVALID: u32 = u32::MAX;
}

const MACHINE_FRAME_SIZE: u64 = 16;

impl<M: MemoryAccessor + ?Sized> RegisterRestorer<'_, '_, M> {
    /// Applies custom opcode `0xE8..=0xEC` at the current SP.
    pub(crate) fn restore_custom_frame(
        &mut self,
        ctx: &mut Arm64Context,
        opcode: u8,
        config: &UnwindConfig,
    ) -> UwResult<()> {
        let (required, feature) = match opcode {
            0xE8 => (CustomFrames::TRAP_FRAME, "trap frame"),
            0xE9 => (CustomFrames::MACHINE_FRAME, "machine frame"),
            0xEA => (CustomFrames::CONTEXT, "context frame"),
            0xEC => (CustomFrames::CLEAR_UNWOUND_TO_CALL, "clear unwound-to-call"),
            0xEB => {
                log::error!("    > EC context frames are not supported");
                return Err(Error::UnsupportedFeature { opcode, feature: "EC context frame" });
            }
            _ => return Err(Error::invalid(opcode, "not a custom frame opcode")),
        };

        if !config.custom_frames.contains(required) {
            log::error!("    > Custom frame 0x{:02X} ({}) is disabled by the configuration", opcode, feature);
            return Err(Error::UnsupportedFeature { opcode, feature });
        }

        match opcode {
            0xE8 => self.restore_trap_frame(ctx),
            0xE9 => self.restore_machine_frame(ctx),
            0xEA => self.restore_context_frame(ctx),
            _ => {
                ctx.set_unwound_to_call(false);
                ctx.pc = ctx.lr;
                Ok(())
            }
        }
    }

    fn restore_trap_frame(&mut self, ctx: &mut Arm64Context) -> UwResult<()> {
        let frame = ctx.sp;
        self.validate(frame, trap::SIZE, 16)?;

        let mut address = frame + trap::X0;
        for register in 0..19u8 {
            self.record_general(register, address);
            ctx.x[register as usize] = self.memory().read_u64(address)?;
            address += 8;
        }

        let vfp_state = self.memory().read_u64(frame + trap::VFP_STATE)?;
        if vfp_state != 0 {
            let vfp_state = span_address(vfp_state, 0, vfp::SIZE)?;
            let fpcr = self.memory().read_u32(vfp_state + vfp::FPCR)?;
            let fpsr = self.memory().read_u32(vfp_state + vfp::FPSR)?;
            if fpcr != vfp::INVALID && fpsr != vfp::INVALID {
                ctx.fpcr = fpcr;
                ctx.fpsr = fpsr;
                self.restore_vectors(ctx, vfp_state + vfp::V0)?;
            }
        }

        ctx.cpsr = self.memory().read_u32(frame + trap::SPSR)?;
        ctx.sp = self.memory().read_u64(frame + trap::SP)?;
        ctx.lr = self.memory().read_u64(frame + trap::LR)?;
        ctx.fp = self.memory().read_u64(frame + trap::FP)?;
        ctx.pc = self.memory().read_u64(frame + trap::PC)?;

        // A system-service frame was entered by a call; interrupts and
        // exceptions stopped at an arbitrary instruction.
        let exception_active = self.memory().read_u8(frame + trap::EXCEPTION_ACTIVE)?;
        ctx.set_unwound_to_call(exception_active == trap::SERVICE_FRAME);

        log::debug!("    > Trap frame at {:016X} (ExceptionActive: {})", frame, exception_active); // debug
        Ok(())
    }

    fn restore_machine_frame(&mut self, ctx: &mut Arm64Context) -> UwResult<()> {
        let frame = ctx.sp;
        self.validate(frame, MACHINE_FRAME_SIZE, 16)?;

        ctx.sp = self.memory().read_u64(frame)?;
        ctx.pc = self.memory().read_u64(frame + 8)?;
        ctx.set_unwound_to_call(false);
        Ok(())
    }

    fn restore_context_frame(&mut self, ctx: &mut Arm64Context) -> UwResult<()> {
        let frame = ctx.sp;
        self.validate(frame, layout::SIZE, 16)?;

        let mut address = frame + layout::X0;
        for register in 0..29u8 {
            self.record_general(register, address);
            ctx.x[register as usize] = self.memory().read_u64(address)?;
            address += 8;
        }
        self.restore_vectors(ctx, frame + layout::V0)?;

        ctx.cpsr = self.memory().read_u32(frame + layout::CPSR)?;
        ctx.fp = self.memory().read_u64(frame + layout::FP)?;
        ctx.lr = self.memory().read_u64(frame + layout::LR)?;
        ctx.sp = self.memory().read_u64(frame + layout::SP)?;
        ctx.pc = self.memory().read_u64(frame + layout::PC)?;
        ctx.fpcr = self.memory().read_u32(frame + layout::FPCR)?;
        ctx.fpsr = self.memory().read_u32(frame + layout::FPSR)?;

        let saved_flags = ContextFlags::from_bits_retain(self.memory().read_u32(frame + layout::CONTEXT_FLAGS)?);
        ctx.set_unwound_to_call(saved_flags.contains(ContextFlags::UNWOUND_TO_CALL));
        Ok(())
    }

    /// Reads V0..V31 as consecutive 128-bit values. The caller has checked
    /// the 512-byte span.
    fn restore_vectors(&mut self, ctx: &mut Arm64Context, mut address: u64) -> UwResult<()> {
        for register in 0..32u8 {
            self.record_vector(register, address);
            ctx.v[register as usize].low = self.memory().read_u64(address)?;
            ctx.v[register as usize].high = self.memory().read_u64(address + 8)?;
            address += 16;
        }
        Ok(())
    }
}
