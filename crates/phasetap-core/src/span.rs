//! Bounds-checked access to raw process memory.
//!
//! Every read or write of live memory in this crate goes through
//! [`RawSpan`]; the unchecked pointer casts live only inside its two
//! primitives.

use crate::error::{Error, Result};

/// A byte-addressable view of one contiguous region of the current
/// process's address space.
#[derive(Debug, Clone, Copy)]
pub struct RawSpan {
    base: u64,
    len: usize,
}

impl RawSpan {
    /// # Safety
    ///
    /// `base..base + len` must stay mapped and readable for the lifetime of
    /// the span. Writes additionally require the region to be writable at
    /// the time of the call.
    pub unsafe fn new(base: u64, len: usize) -> Self {
        Self { base, len }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, address: u64, len: usize) -> bool {
        address >= self.base
            && len <= self.len
            && address - self.base <= (self.len - len) as u64
    }

    /// The whole span as a byte slice.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the constructor contract guarantees the range is mapped
        // and readable.
        unsafe { std::slice::from_raw_parts(self.base as *const u8, self.len) }
    }

    /// Write `bytes` at the absolute `address`, rejecting anything outside
    /// the span.
    pub fn write(&self, address: u64, bytes: &[u8]) -> Result<()> {
        if !self.contains(address, bytes.len()) {
            return Err(Error::OutOfBounds {
                address,
                len: bytes.len(),
            });
        }
        // SAFETY: bounds were checked against the span, and the
        // constructor contract guarantees the span is mapped; the caller
        // sequences this with the region being writable.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len());
        }
        Ok(())
    }
}
