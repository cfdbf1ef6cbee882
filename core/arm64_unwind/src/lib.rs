//! # ARM64 Virtual Unwind Library
//!
//! ## Introduction
//!
//! This library unwinds AArch64 call frames described by the Windows ARM64
//! exception data: the `.pdata` function table and the `.xdata` unwind
//! records it points to. Given a register context stopped inside a
//! function, [`Unwinder::virtual_unwind`] undoes the effects of that
//! function's prolog and leaves the caller's register state in the context.
//! [`StackWalker`] repeats this to produce a complete stack trace.
//!
//! Every supported descriptor form is handled by a single code path:
//!
//! - leaf functions with no `.pdata` entry,
//! - packed (compact) unwind data, expanded into equivalent unwind codes,
//! - full `.xdata` records, including epilog scopes and language handlers,
//! - chained entries that defer to a parent entry.
//!
//! All memory is read through a [`MemoryAccessor`], so the same unwinder
//! serves the current process ([`NativeMemory`]) and a captured snapshot
//! ([`SliceMemory`]). What each target supports (kernel trap frames,
//! pointer-authentication stripping, and so on) is selected with an
//! [`UnwindConfig`].
//!
//! ## Public API
//!
//! ```ignore
//!    /// Unwinds the function containing `control_pc`, leaving the caller's
//!    /// state in `ctx`.
//!    pub fn virtual_unwind(
//!        &self,
//!        control_pc: u64,
//!        image_base: u64,
//!        function: Option<&RuntimeFunction>,
//!        ctx: &mut Arm64Context,
//!        pointers: Option<&mut dyn ContextPointerSink>,
//!    ) -> UwResult<UnwindOutcome>;
//!
//!    /// Logs the stack trace starting at `ctx`.
//!    ///
//!    /// ```text
//!    ///       # Child-SP              Return Address         Call Site
//!    ///       0 0000005E2AEFFC00      00007FFB10CB4508       00007FFB10CB0000+44B0
//!    ///       1 0000005E2AEFFC20      00007FFB10CB45A0       00007FFB10CB0000+4508
//!    ///       2 0000005E2AEFFC40      0000000000000000       00007FFB10CB0000+45A0
//!    /// ```
//!    pub fn dump(&self, ctx: Arm64Context) -> UwResult<usize>;
//! ```
//!
//! ## API usage
//!
//! ```ignore
//!     // Inside an exception handler, with a snapshot of the faulting stack
//!     let memory = SliceMemory::new(stack_base, &stack_bytes);
//!     let table = RuntimeFunctionTable::new(image_base, image_size, pdata, &memory)?;
//!     let unwinder = Unwinder::new(&memory, UnwindConfig::out_of_process());
//!
//!     let mut ctx = Arm64Context::with_frame(elr, sp, fp, lr);
//!     let function = table.lookup(ctx.pc)?.map(|entry| entry.function);
//!     let outcome = unwinder.virtual_unwind(ctx.pc, image_base, function.as_ref(), &mut ctx, None)?;
//!
//!     // Or the whole stack at once
//!     StackWalker::new(unwinder, &table).dump(Arm64Context::with_frame(elr, sp, fp, lr))?;
//! ```
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0

#![cfg_attr(all(not(feature = "std"), not(test)), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod aarch64;
mod byte_reader;
pub mod config;
pub mod context;
pub mod error;
pub mod memory;
pub mod stacktrace;

#[cfg(test)]
mod test_support;

pub use aarch64::{
    runtime_function::{FunctionEntry, FunctionLookup, RuntimeFunction, RuntimeFunctionTable},
    unwind::{UnwindOutcome, Unwinder},
    xdata::LanguageHandler,
};
pub use config::{CustomFrames, UnwindConfig};
pub use context::{Arm64Context, ContextFlags, ContextPointerSink, NonvolatileContextPointers};
pub use error::{Error, UwResult};
pub use memory::{MemoryAccessor, NativeMemory, SliceMemory, StackBounds};
pub use stacktrace::{StackFrame, StackWalker};
