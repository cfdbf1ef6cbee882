//! Register-range restorers shared by the opcode interpreter and the custom
//! frame handlers.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
use crate::{
    context::{Arm64Context, ContextPointerSink},
    error::{Error, UwResult},
    memory::{span_address, MemoryAccessor, StackBounds},
};

/// Reads saved registers off the stack into a context.
///
/// Negative offsets use pre-decrement addressing: the registers are read from
/// the current SP and SP then moves up by the absolute offset.
pub(crate) struct RegisterRestorer<'a, 'p, M: MemoryAccessor + ?Sized> {
    memory: &'a M,
    bounds: Option<StackBounds>,
    pointers: Option<&'p mut dyn ContextPointerSink>,
}

impl<'a, 'p, M: MemoryAccessor + ?Sized> RegisterRestorer<'a, 'p, M> {
    pub(crate) fn new(
        memory: &'a M,
        bounds: Option<StackBounds>,
        pointers: Option<&'p mut dyn ContextPointerSink>,
    ) -> Self {
        Self { memory, bounds, pointers }
    }

    pub(crate) fn memory(&self) -> &'a M {
        self.memory
    }

    /// Checks `size` bytes at `address` against the declared stack bounds.
    /// Without bounds every span that does not wrap is accepted and the
    /// accessor decides.
    pub(crate) fn validate(&self, address: u64, size: u64, alignment: u64) -> UwResult<()> {
        span_address(address, 0, size)?;
        let Some(bounds) = self.bounds else {
            return Ok(());
        };

        if address % alignment != 0 || !bounds.contains(address, size) {
            log::error!(
                "Stack span {:016X}..+{:X} is outside {:016X}..{:016X} or misaligned",
                address,
                size,
                bounds.low,
                bounds.high
            );
            return Err(Error::StackValidationFailure { address, size });
        }
        Ok(())
    }

    pub(crate) fn record_general(&mut self, register: u8, address: u64) {
        if let Some(pointers) = self.pointers.as_deref_mut() {
            pointers.record_general(register, address);
        }
    }

    pub(crate) fn record_vector(&mut self, register: u8, address: u64) {
        if let Some(pointers) = self.pointers.as_deref_mut() {
            pointers.record_vector(register, address);
        }
    }

    /// Restores general registers `first..first + count` (19..=30).
    pub(crate) fn restore_int_range(
        &mut self,
        ctx: &mut Arm64Context,
        offset: i32,
        first: u8,
        count: u32,
        opcode: u8,
    ) -> UwResult<()> {
        Self::check_range(opcode, first, count, 19, 31, "general register range exceeds x19..x30")?;

        let mut address = Self::source_address(ctx, offset);
        self.validate(address, 8 * count as u64, 8)?;

        for register in first..first + count as u8 {
            self.record_general(register, address);
            let value = self.memory.read_u64(address)?;
            ctx.set_gpr(register, value);
            address += 8;
        }

        Self::writeback(ctx, offset);
        Ok(())
    }

    /// Restores the low halves of `d{first}..d{first + count}` (8..=31).
    pub(crate) fn restore_fp_range(
        &mut self,
        ctx: &mut Arm64Context,
        offset: i32,
        first: u8,
        count: u32,
        opcode: u8,
    ) -> UwResult<()> {
        Self::check_range(opcode, first, count, 8, 32, "floating-point register range exceeds d8..d31")?;

        let mut address = Self::source_address(ctx, offset);
        self.validate(address, 8 * count as u64, 8)?;

        for register in first..first + count as u8 {
            self.record_vector(register, address);
            ctx.v[register as usize].low = self.memory.read_u64(address)?;
            address += 8;
        }

        Self::writeback(ctx, offset);
        Ok(())
    }

    /// Restores full 128-bit `q{first}..q{first + count}` (0..=31).
    pub(crate) fn restore_simd_range(
        &mut self,
        ctx: &mut Arm64Context,
        offset: i32,
        first: u8,
        count: u32,
        opcode: u8,
    ) -> UwResult<()> {
        Self::check_range(opcode, first, count, 0, 32, "vector register range exceeds q0..q31")?;

        let mut address = Self::source_address(ctx, offset);
        self.validate(address, 16 * count as u64, 16)?;

        for register in first..first + count as u8 {
            self.record_vector(register, address);
            ctx.v[register as usize].low = self.memory.read_u64(address)?;
            ctx.v[register as usize].high = self.memory.read_u64(address + 8)?;
            address += 16;
        }

        Self::writeback(ctx, offset);
        Ok(())
    }

    fn check_range(opcode: u8, first: u8, count: u32, low: u32, end: u32, reason: &'static str) -> UwResult<()> {
        let first = first as u32;
        if count == 0 || first < low || first + count > end {
            log::error!("    > Register range {}+{} rejected for opcode 0x{:02X}", first, count, opcode);
            return Err(Error::invalid(opcode, reason));
        }
        Ok(())
    }

    fn source_address(ctx: &Arm64Context, offset: i32) -> u64 {
        if offset >= 0 {
            ctx.sp.wrapping_add(offset as u64)
        } else {
            ctx.sp
        }
    }

    fn writeback(ctx: &mut Arm64Context, offset: i32) {
        if offset < 0 {
            ctx.sp = ctx.sp.wrapping_add(offset.unsigned_abs() as u64);
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::{
        context::NonvolatileContextPointers,
        memory::{MockMemoryAccessor, SliceMemory},
    };

    const BASE: u64 = 0x8000;

    fn stack() -> [u8; 0x100] {
        let mut bytes = [0u8; 0x100];
        for (i, chunk) in bytes.chunks_exact_mut(8).enumerate() {
            chunk.copy_from_slice(&(0x1000 + i as u64).to_le_bytes());
        }
        bytes
    }

    #[test]
    fn int_range_with_offset() {
        let bytes = stack();
        let memory = SliceMemory::new(BASE, &bytes);
        let mut restorer = RegisterRestorer::new(&memory, None, None);
        let mut ctx = Arm64Context { sp: BASE, ..Default::default() };

        restorer.restore_int_range(&mut ctx, 16, 19, 2, 0xC8).unwrap();
        assert_eq!(ctx.x[19], 0x1002);
        assert_eq!(ctx.x[20], 0x1003);
        assert_eq!(ctx.sp, BASE);
    }

    #[test]
    fn int_range_with_writeback_reads_fp_and_lr() {
        let bytes = stack();
        let memory = SliceMemory::new(BASE, &bytes);
        let mut pointers = NonvolatileContextPointers::default();
        let mut restorer = RegisterRestorer::new(&memory, None, Some(&mut pointers));
        let mut ctx = Arm64Context { sp: BASE + 0x10, ..Default::default() };

        restorer.restore_int_range(&mut ctx, -32, 29, 2, 0x83).unwrap();
        assert_eq!(ctx.fp, 0x1002);
        assert_eq!(ctx.lr, 0x1003);
        assert_eq!(ctx.sp, BASE + 0x30);
        drop(restorer);
        assert_eq!(pointers.fp, Some(BASE + 0x10));
        assert_eq!(pointers.lr, Some(BASE + 0x18));
    }

    #[test]
    fn int_range_rejects_bad_indices() {
        let bytes = stack();
        let memory = SliceMemory::new(BASE, &bytes);
        let mut restorer = RegisterRestorer::new(&memory, None, None);
        let mut ctx = Arm64Context { sp: BASE, ..Default::default() };

        assert!(matches!(
            restorer.restore_int_range(&mut ctx, 0, 29, 4, 0xC8),
            Err(Error::InvalidSequence { opcode: 0xC8, .. })
        ));
        assert!(matches!(restorer.restore_int_range(&mut ctx, 0, 4, 1, 0xE7), Err(Error::InvalidSequence { .. })));
        assert_eq!(ctx, Arm64Context { sp: BASE, ..Default::default() });
    }

    #[test]
    fn fp_and_simd_ranges() {
        let bytes = stack();
        let memory = SliceMemory::new(BASE, &bytes);
        let mut restorer = RegisterRestorer::new(&memory, None, None);
        let mut ctx = Arm64Context { sp: BASE, ..Default::default() };

        restorer.restore_fp_range(&mut ctx, 8, 8, 2, 0xD8).unwrap();
        assert_eq!(ctx.v[8].low, 0x1001);
        assert_eq!(ctx.v[9].low, 0x1002);
        assert_eq!(ctx.v[9].high, 0);

        restorer.restore_simd_range(&mut ctx, -32, 0, 2, 0xE7).unwrap();
        assert_eq!(ctx.v[0].low, 0x1000);
        assert_eq!(ctx.v[0].high, 0x1001);
        assert_eq!(ctx.v[1].low, 0x1002);
        assert_eq!(ctx.v[1].high, 0x1003);
        assert_eq!(ctx.sp, BASE + 32);

        assert!(restorer.restore_fp_range(&mut ctx, 0, 31, 2, 0xD8).is_err());
        assert!(restorer.restore_fp_range(&mut ctx, 0, 7, 1, 0xDC).is_err());
        assert!(restorer.restore_simd_range(&mut ctx, 0, 31, 2, 0xE7).is_err());
    }

    #[test]
    fn bounds_reject_spans_and_misalignment() {
        let bytes = stack();
        let memory = SliceMemory::new(BASE, &bytes);
        let bounds = StackBounds::new(BASE, BASE + 0x20);
        let mut restorer = RegisterRestorer::new(&memory, Some(bounds), None);
        let mut ctx = Arm64Context { sp: BASE, ..Default::default() };

        restorer.restore_int_range(&mut ctx, 0x10, 19, 2, 0xC8).unwrap();
        assert_eq!(
            restorer.restore_int_range(&mut ctx, 0x18, 19, 2, 0xC8),
            Err(Error::StackValidationFailure { address: BASE + 0x18, size: 16 })
        );
        assert_eq!(
            restorer.restore_simd_range(&mut ctx, 8, 0, 1, 0xE7),
            Err(Error::StackValidationFailure { address: BASE + 8, size: 16 })
        );
    }

    #[test]
    fn ranges_wrapping_the_address_space_are_rejected() {
        let mut memory = MockMemoryAccessor::new();
        memory.expect_read_u64().never();
        let mut restorer = RegisterRestorer::new(&memory, None, None);
        let mut ctx = Arm64Context { sp: u64::MAX - 15, ..Default::default() };

        assert_eq!(
            restorer.restore_simd_range(&mut ctx, 0, 8, 1, 0xE7),
            Err(Error::StackValidationFailure { address: u64::MAX - 15, size: 16 })
        );
        assert_eq!(
            restorer.restore_int_range(&mut ctx, 8, 19, 2, 0xC8),
            Err(Error::StackValidationFailure { address: u64::MAX - 7, size: 16 })
        );
        assert_eq!(ctx.sp, u64::MAX - 15);
    }

    #[test]
    fn accessor_failures_propagate() {
        let bytes = stack();
        let memory = SliceMemory::new(BASE, &bytes);
        let mut restorer = RegisterRestorer::new(&memory, None, None);
        let mut ctx = Arm64Context { sp: BASE + 0xF8, ..Default::default() };

        assert!(matches!(
            restorer.restore_int_range(&mut ctx, 0, 19, 2, 0xC8),
            Err(Error::StackValidationFailure { .. })
        ));
    }
}
