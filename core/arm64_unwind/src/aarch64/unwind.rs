//! Virtual unwinding of a single AArch64 frame.
//!
//! The main goal of this module is to undo the operations performed by the
//! prolog of a given function, recovering the caller's registers from the
//! stack. Unwind info in AArch64 comes in three flavors, selected by the low
//! two bits of the `.pdata` entry's second word:
//! 1. Full `.xdata` records, whose RVA is stored in the entry.
//! 2. Packed unwind data for canonical functions, encoded in bits 2-31.
//! 3. Chained entries pointing at another `.pdata` entry.
//!
//! Functions with no entry at all are leaves: the return address is still in
//! LR and SP never moved.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
use super::{
    interpreter::interpret,
    restore::RegisterRestorer,
    runtime_function::{RuntimeFunction, UnwindDataKind},
    xdata::{locate, LanguageHandler, RemoteXdata},
};
use crate::{
    config::UnwindConfig,
    context::{Arm64Context, ContextPointerSink},
    error::{Error, UwResult},
    memory::{span_address, MemoryAccessor, StackBounds},
};

/// Result of unwinding one frame. The caller's registers are written back
/// into the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnwindOutcome {
    /// SP after the unwind; identifies the unwound function's frame.
    pub establisher_frame: u64,
    /// Language handler of the unwound function, when the PC is in its body.
    pub handler: Option<LanguageHandler>,
}

/// Unwinds frames described by ARM64 `.pdata`/`.xdata` unwind data.
pub struct Unwinder<'m, M: MemoryAccessor + ?Sized> {
    memory: &'m M,
    config: UnwindConfig,
    bounds: Option<StackBounds>,
}

impl<'m, M: MemoryAccessor + ?Sized> Unwinder<'m, M> {
    pub fn new(memory: &'m M, config: UnwindConfig) -> Self {
        Self { memory, config, bounds: None }
    }

    /// Rejects register restores outside `bounds`.
    pub fn with_bounds(mut self, bounds: StackBounds) -> Self {
        self.bounds = Some(bounds);
        self
    }

    pub fn config(&self) -> &UnwindConfig {
        &self.config
    }

    pub fn memory(&self) -> &'m M {
        self.memory
    }

    /// Unwinds the function containing `control_pc`, leaving the caller's
    /// state in `ctx`.
    ///
    /// `function` is the `.pdata` entry for `control_pc` in the image loaded
    /// at `image_base`, or `None` for a leaf function. When `pointers` is
    /// given it receives the stack address of every restored register.
    pub fn virtual_unwind(
        &self,
        control_pc: u64,
        image_base: u64,
        function: Option<&RuntimeFunction>,
        ctx: &mut Arm64Context,
        pointers: Option<&mut dyn ContextPointerSink>,
    ) -> UwResult<UnwindOutcome> {
        log::debug!("    > IN: {}", ctx); // debug

        let Some(function) = function else {
            return Self::unwind_leaf(control_pc, ctx);
        };

        // A chained entry is unwound with its parent's data, as if the PC
        // were at the parent's start.
        let (function, control_pc_rva) = match function.kind() {
            UnwindDataKind::Chained => {
                let parent = function.parent(self.memory, image_base)?;
                if parent.kind() == UnwindDataKind::Chained {
                    log::error!("    > Chained entry {} points to another chained entry {}", function, parent);
                    return Err(Error::invalid(0, "chained entry points to another chained entry"));
                }
                (parent, parent.begin_address)
            }
            _ => (*function, control_pc.wrapping_sub(image_base) as u32),
        };
        log::debug!("    > {}", function); // debug

        let offset_in_function = control_pc_rva.wrapping_sub(function.begin_address) / 4;
        let mut restorer = RegisterRestorer::new(self.memory, self.bounds, pointers);

        // Unless a custom frame says otherwise, the caller is resumed at a
        // return address.
        ctx.set_unwound_to_call(true);

        let outcome = match function.kind() {
            UnwindDataKind::Full => {
                let address = span_address(image_base, function.unwind_data as u64, 4)?;
                let xdata = RemoteXdata::read(self.memory, address)?;
                let handler = xdata.handler(image_base)?;
                let start = locate(&xdata.record, &xdata, offset_in_function)?;
                let establisher_frame = interpret(&xdata, start.code_offset, ctx, &mut restorer, &self.config)?;
                UnwindOutcome { establisher_frame, handler: handler.filter(|_| start.handler_applies) }
            }
            _ => {
                let expanded = function.packed().expand();
                let record = expanded.record()?;
                let start = locate(&record, &expanded, offset_in_function)?;
                let establisher_frame = interpret(&expanded, start.code_offset, ctx, &mut restorer, &self.config)?;
                UnwindOutcome { establisher_frame, handler: None }
            }
        };

        log::debug!("    > OUT: {}", ctx); // debug
        Ok(outcome)
    }

    /// A leaf never saved LR, so returning is just `ret`.
    fn unwind_leaf(control_pc: u64, ctx: &mut Arm64Context) -> UwResult<UnwindOutcome> {
        if control_pc == ctx.lr {
            log::error!("    > Leaf function at {:016X} returns to itself", control_pc);
            return Err(Error::MalformedStack { pc: control_pc, sp: ctx.sp });
        }

        ctx.pc = ctx.lr;
        ctx.set_unwound_to_call(true);
        log::debug!("    > OUT(leaf): {}", ctx); // debug
        Ok(UnwindOutcome { establisher_frame: ctx.sp, handler: None })
    }
}
