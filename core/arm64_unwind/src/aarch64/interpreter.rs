//! Executes unwind codes against a register context.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
use super::{
    restore::RegisterRestorer,
    unwind_code::{CodeStream, OpcodeCursor, RegisterClass, UnwindCode},
};
use crate::{
    config::UnwindConfig,
    context::Arm64Context,
    error::{Error, UwResult},
    memory::MemoryAccessor,
};

/// Runs the codes from `start` until an `end` opcode or the end of the
/// stream, undoing each prolog operation in turn.
///
/// On success PC holds the return address (from LR unless a custom frame
/// supplied one) and the returned value is the establisher frame.
pub(crate) fn interpret<C, M>(
    codes: &C,
    start: usize,
    ctx: &mut Arm64Context,
    restorer: &mut RegisterRestorer<'_, '_, M>,
    config: &UnwindConfig,
) -> UwResult<u64>
where
    C: CodeStream + ?Sized,
    M: MemoryAccessor + ?Sized,
{
    let mut cursor = OpcodeCursor::new(codes, start);
    let mut save_nexts = 0u32;
    let mut final_pc_from_lr = true;

    while let Some((op, code)) = cursor.next_code()? {
        log::debug!("    > {}", code); // debug

        // Only paired saves absorb pending save_next opcodes.
        let pairable = matches!(
            code,
            UnwindCode::SaveR19R20X(_)
                | UnwindCode::SaveRegP { .. }
                | UnwindCode::SaveRegPX { .. }
                | UnwindCode::SaveFRegP { .. }
                | UnwindCode::SaveFRegPX { .. }
                | UnwindCode::SaveAny { paired: true, .. }
                | UnwindCode::SaveNext
                | UnwindCode::EndC
        );
        if save_nexts != 0 && !pairable {
            log::error!("    > {} save_next opcode(s) precede non-pairable opcode 0x{:02X}", save_nexts, op);
            return Err(Error::invalid(op, "save_next must be followed by a paired save"));
        }
        let pair_count = 2 + 2 * save_nexts;

        match code {
            UnwindCode::AllocS(size) | UnwindCode::AllocM(size) | UnwindCode::AllocL(size) => {
                ctx.sp = ctx.sp.wrapping_add(size as u64);
            }
            UnwindCode::SaveR19R20X(offset) => {
                restorer.restore_int_range(ctx, offset, 19, pair_count, op)?;
                save_nexts = 0;
            }
            UnwindCode::SaveFpLr(offset) | UnwindCode::SaveFpLrX(offset) => {
                restorer.restore_int_range(ctx, offset, Arm64Context::FP_INDEX, 2, op)?;
            }
            UnwindCode::SaveRegP { reg, offset } | UnwindCode::SaveRegPX { reg, offset } => {
                restorer.restore_int_range(ctx, offset, reg, pair_count, op)?;
                save_nexts = 0;
            }
            UnwindCode::SaveReg { reg, offset } | UnwindCode::SaveRegX { reg, offset } => {
                restorer.restore_int_range(ctx, offset, reg, 1, op)?;
            }
            UnwindCode::SaveLrPair { reg, offset } => {
                restorer.restore_int_range(ctx, offset, reg, 1, op)?;
                restorer.restore_int_range(ctx, offset + 8, Arm64Context::LR_INDEX, 1, op)?;
            }
            UnwindCode::SaveFRegP { reg, offset } | UnwindCode::SaveFRegPX { reg, offset } => {
                restorer.restore_fp_range(ctx, offset, reg, pair_count, op)?;
                save_nexts = 0;
            }
            UnwindCode::SaveFReg { reg, offset } | UnwindCode::SaveFRegX { reg, offset } => {
                restorer.restore_fp_range(ctx, offset, reg, 1, op)?;
            }
            UnwindCode::AllocZ(_) => {
                log::error!("    > SVE-scaled allocations cannot be unwound");
                return Err(Error::invalid(op, "alloc_z is not supported"));
            }
            UnwindCode::SetFp => ctx.sp = ctx.fp,
            UnwindCode::AddFp(offset) => ctx.sp = ctx.fp.wrapping_sub(offset as u64),
            UnwindCode::Nop | UnwindCode::EndC | UnwindCode::Future(_) => {}
            UnwindCode::End => break,
            UnwindCode::SaveNext => save_nexts += 1,
            UnwindCode::SaveAny { class, reg, paired, offset } => {
                let count = 1 + paired as u32 + 2 * save_nexts;
                match class {
                    RegisterClass::X => restorer.restore_int_range(ctx, offset, reg, count, op)?,
                    RegisterClass::D => restorer.restore_fp_range(ctx, offset, reg, count, op)?,
                    RegisterClass::Q => restorer.restore_simd_range(ctx, offset, reg, count, op)?,
                }
                save_nexts = 0;
            }
            UnwindCode::TrapFrame
            | UnwindCode::MachineFrame
            | UnwindCode::Context
            | UnwindCode::EcContext
            | UnwindCode::ClearUnwoundToCall => {
                restorer.restore_custom_frame(ctx, op, config)?;
                final_pc_from_lr = false;
            }
            UnwindCode::PacSignLr => ctx.lr = config.strip(ctx.lr),
            UnwindCode::Reserved(_) => {
                log::error!("    > Reserved opcode 0x{:02X}", op);
                return Err(Error::invalid(op, "reserved opcode"));
            }
        }
    }

    if save_nexts != 0 {
        log::error!("    > Unwind codes end with {} pending save_next opcode(s)", save_nexts);
        return Err(Error::invalid(0xE6, "save_next at the end of the unwind codes"));
    }

    if final_pc_from_lr {
        ctx.pc = ctx.lr;
    }
    Ok(ctx.sp)
}
