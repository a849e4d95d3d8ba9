//! Named-entry table for the iteration stubs.
//!
//! The table is a stride-aligned array of records, one per configured cue
//! name, built once at arming time and read-only thereafter by the injected
//! code. Each record starts with three machine words (length, capacity and
//! a reserved slot) followed by the NUL-terminated name bytes, so the
//! target-side string type can be pointed at the data portion directly.

use crate::error::{Error, Result};

/// Machine words reserved ahead of each record's data.
pub const ENTRY_HEADER_WORDS: usize = 3;

/// Records are aligned to this stride multiple.
pub const ENTRY_ALIGN: usize = 64;

/// Size of the relocated string-object slot placed ahead of the table.
pub const STRING_SLOT_SIZE: usize = 64;

/// Shape of an encoded table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryTableLayout {
    pub count: usize,
    pub stride: usize,
    pub word: usize,
}

impl EntryTableLayout {
    /// Measure a name list. Returns `None` for an empty list; the caller
    /// skips the iteration stub in that case rather than failing.
    pub fn measure<S: AsRef<str>>(names: &[S], word: usize) -> Result<Option<Self>> {
        let mut longest = 0usize;
        let mut count = 0usize;
        for name in names {
            let len = name.as_ref().len();
            if len == 0 {
                continue;
            }
            longest = longest.max(len);
            count += 1;
        }
        if count == 0 {
            return Ok(None);
        }

        let header = ENTRY_HEADER_WORDS * word;
        let stride = (header + longest + 1).div_ceil(ENTRY_ALIGN) * ENTRY_ALIGN;
        // The iteration stubs step with an immediate add; the stride must
        // stay within the positive i32 range.
        if stride > i32::MAX as usize {
            return Err(Error::ConfigInvalid(format!(
                "cue name of {longest} bytes produces an unencodable table stride"
            )));
        }

        Ok(Some(Self {
            count,
            stride,
            word,
        }))
    }

    /// Per-record name capacity, excluding the NUL terminator.
    pub fn capacity(&self) -> usize {
        self.stride - ENTRY_HEADER_WORDS * self.word - 1
    }

    pub fn table_size(&self) -> usize {
        self.stride * self.count
    }

    /// Total page footprint of the iteration data: string slot + records.
    pub fn data_size(&self) -> usize {
        STRING_SLOT_SIZE + self.table_size()
    }
}

fn put_word(buf: &mut [u8], offset: usize, value: usize, word: usize) {
    let bytes = (value as u64).to_le_bytes();
    buf[offset..offset + word].copy_from_slice(&bytes[..word]);
}

/// Encode the records. The returned buffer is `layout.table_size()` bytes;
/// entry N starts at `N * stride`.
pub fn encode_entries<S: AsRef<str>>(names: &[S], layout: &EntryTableLayout) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; layout.table_size()];
    let header = ENTRY_HEADER_WORDS * layout.word;
    let capacity = layout.capacity();

    let mut index = 0usize;
    for name in names {
        let name = name.as_ref();
        if name.is_empty() {
            continue;
        }
        if name.len() > capacity {
            return Err(Error::ConfigInvalid(format!(
                "cue name '{name}' exceeds the table capacity of {capacity} bytes"
            )));
        }
        let at = index * layout.stride;
        put_word(&mut buf, at, name.len(), layout.word);
        put_word(&mut buf, at + layout.word, capacity, layout.word);
        // Third word stays zero; the data follows the header, already
        // NUL-padded by the zero fill.
        buf[at + header..at + header + name.len()].copy_from_slice(name.as_bytes());
        index += 1;
    }

    debug_assert_eq!(index, layout.count);
    Ok(buf)
}
