//! Status byte protocol.
//!
//! One byte at the start of the trampoline page is the engine's only
//! externally observable output. The injected stubs write it from inside
//! the host process; an out-of-process observer polls it. A single shared
//! byte needs no locking: readers tolerate stale values, and repeats are
//! no-ops on the observer side.

use std::sync::atomic::{AtomicU8, Ordering};

use strum::{Display, FromRepr};

/// The closed set of observable values. Anything else is "unknown, ignore".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromRepr)]
#[repr(u8)]
pub enum Status {
    /// Resume the external timer.
    #[strum(serialize = "resume")]
    Resume = 0,
    /// Pause without marking a boundary.
    #[strum(serialize = "pause")]
    Pause = 1,
    /// Pause and mark a phase boundary.
    #[strum(serialize = "pause + mark boundary")]
    PauseMark = 2,
    /// Terminal sentinel, stored at disarm.
    #[strum(serialize = "finished")]
    Finished = 255,
}

impl Status {
    pub fn from_byte(byte: u8) -> Option<Status> {
        Status::from_repr(byte)
    }
}

/// Store the terminal sentinel into a live status byte with a swap, the
/// same way the injected stubs write it.
///
/// # Safety
///
/// `status` must point at the mapped status byte.
pub unsafe fn store_terminal(status: *mut u8) {
    // SAFETY: caller guarantees the pointer targets the mapped byte.
    let byte = unsafe { AtomicU8::from_ptr(status) };
    byte.swap(Status::Finished as u8, Ordering::SeqCst);
}
