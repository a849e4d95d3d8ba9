//! Trampoline code builders.
//!
//! Two conforming variants, one per address width, behind the same function
//! surface; `active` is the variant matching the running process. Templates
//! are fixed-size byte arrays with named patch offsets; a template that
//! would not fit its block is rejected by `const` assertions, never at
//! runtime.

pub mod x86;
pub mod x86_64;

#[cfg(target_pointer_width = "64")]
pub use x86_64 as active;

#[cfg(target_pointer_width = "32")]
pub use x86 as active;

use crate::table::{ENTRY_HEADER_WORDS, EntryTableLayout, STRING_SLOT_SIZE};

/// One write the patcher performs inside the target image.
#[derive(Debug, Clone)]
pub struct SitePatch {
    pub address: u64,
    pub bytes: Vec<u8>,
}

/// Absolute addresses of the iteration data inside the trampoline page.
#[derive(Debug, Clone, Copy)]
pub struct TableAddrs {
    /// Relocated string-object slot consulted by the injected loops.
    pub string_slot: u64,
    /// Data portion of the first record (just past its header words).
    pub first_entry_data: u64,
    /// One stride past the last record's data; the loop termination bound.
    pub loop_stop: u64,
    pub stride: u32,
}

impl TableAddrs {
    pub fn compute(
        page: u64,
        iter_offset: usize,
        stub_size: usize,
        layout: &EntryTableLayout,
    ) -> TableAddrs {
        let string_slot = page + (iter_offset + stub_size) as u64;
        let first_entry_data =
            string_slot + (STRING_SLOT_SIZE + ENTRY_HEADER_WORDS * layout.word) as u64;
        TableAddrs {
            string_slot,
            first_entry_data,
            loop_stop: first_entry_data + layout.table_size() as u64,
            stride: layout.stride as u32,
        }
    }
}

pub(crate) fn put(buf: &mut [u8], offset: usize, bytes: &[u8]) {
    buf[offset..offset + bytes.len()].copy_from_slice(bytes);
}

pub(crate) fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
    put(buf, offset, &value.to_le_bytes());
}

pub(crate) fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    put(buf, offset, &value.to_le_bytes());
}

/// Add `delta` to the little-endian u32 at `offset`, wrapping. Used for the
/// displacement corrections applied to relocated instruction bytes.
pub(crate) fn bump_u32(buf: &mut [u8], offset: usize, delta: i32) {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    let value = u32::from_le_bytes(bytes).wrapping_add_signed(delta);
    put_u32(buf, offset, value);
}

/// rel32 displacement reaching `target` from the instruction ending at
/// `next`. Truncation is the instruction set's own wrapping arithmetic.
pub(crate) fn rel32(target: u64, next: u64) -> [u8; 4] {
    (target.wrapping_sub(next) as u32).to_le_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bump_u32_wraps() {
        let mut buf = [0u8; 8];
        put_u32(&mut buf, 2, 0x10);
        bump_u32(&mut buf, 2, -0x20);
        let mut b = [0u8; 4];
        b.copy_from_slice(&buf[2..6]);
        assert_eq!(u32::from_le_bytes(b), 0x10u32.wrapping_sub(0x20));
    }

    #[test]
    fn test_rel32_forward_and_backward() {
        assert_eq!(rel32(0x1000, 0x0f00), 0x100u32.to_le_bytes());
        assert_eq!(rel32(0x0f00, 0x1000), (-0x100i32).to_le_bytes());
    }

    #[test]
    fn test_table_addrs_64bit() {
        let layout = EntryTableLayout {
            count: 3,
            stride: 64,
            word: 8,
        };
        let t = TableAddrs::compute(0x7000_0000, 128, 128, &layout);
        assert_eq!(t.string_slot, 0x7000_0000 + 256);
        assert_eq!(t.first_entry_data, t.string_slot + 64 + 24);
        assert_eq!(t.loop_stop, t.first_entry_data + 3 * 64);
        assert_eq!(t.stride, 64);
    }
}
