//! Target-image location.
//!
//! Walks the memory-map listing in order and picks the first region whose
//! final path component exactly matches an allow-listed binary name and
//! whose permissions equal the required mask exactly. A region matching the
//! name but not the mask is skipped, not accepted.

use std::io::BufRead;

use tracing::debug;

use crate::error::{Error, Result};
use crate::maps::{Permissions, RegionMapReader};

/// The maximum filename length on Linux; longer final components can never
/// match an allow-listed name.
const MAX_FILE_NAME: usize = 255;

/// The one code region of the instrumented binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetImage {
    pub start: u64,
    pub end: u64,
}

impl TargetImage {
    pub fn size(&self) -> usize {
        (self.end - self.start) as usize
    }
}

/// Locate the target image in a maps-format listing.
pub fn locate<R: BufRead, S: AsRef<str>>(source: R, names: &[S]) -> Result<TargetImage> {
    for region in RegionMapReader::new(source) {
        if region.perms != Permissions::READ_EXEC_PRIVATE {
            continue;
        }
        let Some(file_name) = region.file_name() else {
            continue;
        };
        if file_name.len() > MAX_FILE_NAME {
            continue;
        }
        if names.iter().any(|n| n.as_ref() == file_name) {
            debug!(
                start = format_args!("{:#x}", region.start),
                end = format_args!("{:#x}", region.end),
                file = file_name,
                "located target image"
            );
            return Ok(TargetImage {
                start: region.start,
                end: region.end,
            });
        }
    }
    Err(Error::NotFound)
}
