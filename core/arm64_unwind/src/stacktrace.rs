//! Frame-walking driver.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
use crate::{
    aarch64::{runtime_function::FunctionLookup, unwind::Unwinder, xdata::LanguageHandler},
    context::Arm64Context,
    error::{Error, UwResult},
    memory::MemoryAccessor,
};
use core::fmt::{self, Display, Formatter};

/// One frame reported by [`StackWalker::walk`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StackFrame {
    /// Position in the walk; 0 is the innermost frame.
    pub index: usize,

    /// The program counter (PC) the frame was unwound from.
    pub pc: u64,

    /// The stack pointer (SP) on entry to the unwind.
    pub sp: u64,

    /// The frame pointer (FP) on entry to the unwind.
    pub fp: u64,

    /// The PC of the caller after the unwind.
    pub return_address: u64,

    /// Base of the image whose `.pdata` described the frame. `None` for
    /// leaf functions.
    pub image_base: Option<u64>,

    /// SP after the unwind.
    pub establisher_frame: u64,

    pub handler: Option<LanguageHandler>,
}

impl Display for StackFrame {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "PC: {:016X}, SP: {:016X}, FP: {:016X}", self.pc, self.sp, self.fp)
    }
}

/// Walks a call stack by repeatedly unwinding the innermost frame.
pub struct StackWalker<'a, M: MemoryAccessor + ?Sized, L: FunctionLookup + ?Sized> {
    unwinder: Unwinder<'a, M>,
    lookup: &'a L,
}

impl<'a, M: MemoryAccessor + ?Sized, L: FunctionLookup + ?Sized> StackWalker<'a, M, L> {
    pub fn new(unwinder: Unwinder<'a, M>, lookup: &'a L) -> Self {
        Self { unwinder, lookup }
    }

    /// Unwinds `ctx` frame by frame, reporting each one to `visitor`, until
    /// the return address is zero or the configured frame limit is reached.
    ///
    /// Returns the number of frames reported. On return `ctx` holds the
    /// state of the outermost frame reached.
    pub fn walk<F>(&self, ctx: &mut Arm64Context, mut visitor: F) -> UwResult<usize>
    where
        F: FnMut(&StackFrame),
    {
        let max_frames = self.unwinder.config().max_frames;

        for index in 0..max_frames {
            let (pc, sp, fp) = (ctx.pc, ctx.sp, ctx.fp);

            // A return address points past the call; the call itself may be
            // the last instruction of the function.
            let lookup_pc = if ctx.is_unwound_to_call() { pc.wrapping_sub(4) } else { pc };
            let entry = self.lookup.lookup(lookup_pc)?;
            let image_base = entry.map(|entry| entry.image_base);
            let function = entry.map(|entry| entry.function);

            let outcome =
                self.unwinder.virtual_unwind(pc, image_base.unwrap_or(0), function.as_ref(), ctx, None)?;

            visitor(&StackFrame {
                index,
                pc,
                sp,
                fp,
                return_address: ctx.pc,
                image_base,
                establisher_frame: outcome.establisher_frame,
                handler: outcome.handler,
            });

            if ctx.pc == 0 {
                log::debug!("Reached the outermost frame after {} frames", index + 1); // debug
                return Ok(index + 1);
            }

            if ctx.pc == pc && ctx.sp == sp {
                log::error!("PC and SP didn't change. Possible stack corruption detected. Stopping stack trace.");
                return Err(Error::MalformedStack { pc, sp });
            }
        }

        log::warn!("Stack trace truncated at {} frames", max_frames);
        Ok(max_frames)
    }

    /// Logs the stack trace starting at `ctx`.
    ///
    /// ```text
    ///       # Child-SP              Return Address         Call Site
    ///       0 0000005E2AEFFC00      00007FFB10CB4508       00007FFB10CB0000+44B0
    ///       1 0000005E2AEFFC20      00007FFB10CB45A0       00007FFB10CB0000+4508
    ///       2 0000005E2AEFFC40      0000000000000000       00007FFB10CB0000+45A0
    /// ```
    pub fn dump(&self, mut ctx: Arm64Context) -> UwResult<usize> {
        log::info!("Dumping stack trace with {}", ctx);
        log::info!("      # Child-SP              Return Address         Call Site");

        let count = self.walk(&mut ctx, |frame| match frame.image_base {
            Some(image_base) => log::info!(
                "     {:>2} {:016X}      {:016X}       {:016X}+{:X}",
                frame.index,
                frame.sp,
                frame.return_address,
                image_base,
                frame.pc.wrapping_sub(image_base)
            ),
            None => log::info!(
                "     {:>2} {:016X}      {:016X}       <leaf>+{:016X}",
                frame.index,
                frame.sp,
                frame.return_address,
                frame.pc
            ),
        })?;

        log::info!("Finished dumping stack trace");
        Ok(count)
    }
}
