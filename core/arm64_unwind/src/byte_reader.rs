use crate::error::{Error, UwResult};

/// The `ByteReader` trait provides an easy way to read little-endian
/// u8/u32/u64 fields from a u8 slice. Used for captured memory, packed
/// `.pdata` tables, and locally synthesized unwind codes.
pub(crate) trait ByteReader {
    fn read8(&self, index: usize) -> UwResult<u8>;
    fn read32(&self, index: usize) -> UwResult<u32>;
    fn read64(&self, index: usize) -> UwResult<u64>;
    fn read32_with(&self, index: &mut usize) -> UwResult<u32>;
}

impl ByteReader for [u8] {
    fn read8(&self, index: usize) -> UwResult<u8> {
        self.get(index).copied().ok_or(Error::OutOfBoundsRead { index })
    }

    fn read32(&self, index: usize) -> UwResult<u32> {
        let slice = index.checked_add(4).and_then(|end| self.get(index..end)).ok_or(Error::OutOfBoundsRead { index })?;
        Ok(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
    }

    fn read64(&self, index: usize) -> UwResult<u64> {
        let slice = index.checked_add(8).and_then(|end| self.get(index..end)).ok_or(Error::OutOfBoundsRead { index })?;
        Ok(u64::from_le_bytes([slice[0], slice[1], slice[2], slice[3], slice[4], slice[5], slice[6], slice[7]]))
    }

    fn read32_with(&self, index: &mut usize) -> UwResult<u32> {
        let res = self.read32(*index);
        if res.is_ok() {
            *index += core::mem::size_of::<u32>();
        }
        res
    }
}

// SAFETY: The caller must ensure `address` points to at least `buffer.len()`
// readable bytes for the duration of this read.
pub(crate) unsafe fn read_native_bytes(address: u64, buffer: &mut [u8]) -> UwResult<()> {
    if address == 0 {
        return Err(Error::StackValidationFailure { address, size: buffer.len() as u64 });
    }

    unsafe { core::ptr::copy_nonoverlapping(address as *const u8, buffer.as_mut_ptr(), buffer.len()) };
    Ok(())
}
