//! Instruction signatures for the supported target builds.
//!
//! A signature is a sparse set of `(offset, byte)` constraints identifying
//! one known instruction sequence in the target image. The constants here
//! are build-specific data tied to one exact binary revision per address
//! width; the scanner itself is binary-agnostic.
//!
//! Offsets in each entry are relative to the match position:
//!
//! - `site_offset`: displacement to the address the patcher rewrites (or,
//!   for the handler-function signatures, to the function entry itself).
//! - `capture`: the original bytes the generated stub replays.
//! - `operand`: a rel32 operand whose absolute target is derived as
//!   `sign_extend(operand) + match + offset + tail`.
//! - `extra`: auxiliary instruction runs consumed by the iteration stubs;
//!   `extra_site` is the secondary patch site those runs are displaced from.

use strum::{Display, EnumCount};

/// Identity of each signature. Discriminants index the per-arch tables, so
/// both tables list their entries in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumCount)]
pub enum SignatureId {
    /// End of a loading phase; the stub resumes the external timer.
    LoadDone,
    /// Start of a menu load; pause without marking a boundary.
    MenuLoad,
    /// Start of a map load; pause and mark a boundary.
    MapLoad,
    /// End of a map load; entry point of the *wait* iteration stub.
    MapLoadDone,
    /// Target-side per-cue stop handler (called by the *skip* stub).
    CueStop,
    /// Target-side per-cue playback query (called by the *wait* stub).
    CueQuery,
    /// Target-side bounded wait primitive (one quantum, microseconds arg).
    HostWait,
}

/// A byte range relative to the match position.
#[derive(Debug, Clone, Copy)]
pub struct CaptureRule {
    pub offset: usize,
    pub len: usize,
}

/// A rel32 operand relative to the match position. The referenced absolute
/// address is `sign_extend(value) + match + offset + tail`, where `tail` is
/// the remaining length of the referencing instruction (the rel32 itself).
#[derive(Debug, Clone, Copy)]
pub struct OperandRule {
    pub offset: usize,
    pub tail: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct SignatureSpec {
    pub id: SignatureId,
    pub pattern: &'static [(usize, u8)],
    /// Bytes touched by pattern, captures and operands; the scan bound for
    /// this signature is `image_len - window`.
    pub window: usize,
    pub site_offset: isize,
    pub capture: Option<CaptureRule>,
    pub operand: Option<OperandRule>,
    pub extra: &'static [CaptureRule],
    pub extra_site: Option<isize>,
}

const NO_EXTRA: &[CaptureRule] = &[];

/// Signature table for the 64-bit build.
pub mod x86_64 {
    use super::*;

    pub const WORD: usize = 8;

    pub static SIGNATURES: [SignatureSpec; 7] = [
        SignatureSpec {
            id: SignatureId::LoadDone,
            pattern: &[(0, 0xe8), (7, 0x7b), (9, 0xbe), (10, 0x06)],
            window: 33,
            site_offset: 19,
            capture: Some(CaptureRule { offset: 19, len: 14 }),
            // call rel32 inside the captured run; target is the
            // quit-message-posted query re-called from the stub.
            operand: Some(OperandRule { offset: 27, tail: 4 }),
            extra: NO_EXTRA,
            extra_site: None,
        },
        SignatureSpec {
            id: SignatureId::MenuLoad,
            pattern: &[(0, 0xc1), (3, 0xe7), (5, 0x8b), (6, 0x80)],
            window: 36,
            site_offset: 20,
            capture: Some(CaptureRule { offset: 20, len: 16 }),
            operand: None,
            extra: NO_EXTRA,
            extra_site: None,
        },
        SignatureSpec {
            id: SignatureId::MapLoad,
            pattern: &[(0, 0xff), (3, 0x4c), (12, 0x4f)],
            window: 128,
            site_offset: 54,
            capture: Some(CaptureRule { offset: 61, len: 7 }),
            // rip-relative load of the global-pointer base.
            operand: Some(OperandRule { offset: 57, tail: 4 }),
            extra: &[
                // Displaced bytes of the cue-fade-out site.
                CaptureRule { offset: 96, len: 18 },
                // Handler-object load replayed at the iteration stub entry.
                CaptureRule { offset: 114, len: 14 },
            ],
            extra_site: Some(96),
        },
        SignatureSpec {
            id: SignatureId::MapLoadDone,
            pattern: &[(0, 0xed), (9, 0x6c), (14, 0x54)],
            window: 65,
            site_offset: 50,
            capture: Some(CaptureRule { offset: 50, len: 10 }),
            // call rel32 to the application-time read re-called by the
            // wait stub after the replay.
            operand: Some(OperandRule { offset: 61, tail: 4 }),
            extra: NO_EXTRA,
            extra_site: None,
        },
        SignatureSpec {
            id: SignatureId::CueStop,
            pattern: &[(0, 0x80), (1, 0x7b), (4, 0xb8), (11, 0x80)],
            window: 12,
            site_offset: -98,
            capture: None,
            operand: None,
            extra: NO_EXTRA,
            extra_site: None,
        },
        SignatureSpec {
            id: SignatureId::CueQuery,
            pattern: &[(0, 0x8b), (1, 0x7b), (5, 0x07), (13, 0x83)],
            window: 14,
            site_offset: -99,
            capture: None,
            operand: None,
            extra: NO_EXTRA,
            extra_site: None,
        },
        SignatureSpec {
            id: SignatureId::HostWait,
            pattern: &[(0, 0x89), (1, 0xf8), (2, 0xba), (9, 0xec)],
            window: 10,
            site_offset: 0,
            capture: None,
            operand: None,
            extra: NO_EXTRA,
            extra_site: None,
        },
    ];
}

/// Signature table for the 32-bit build. No rel32 operands here; the 32-bit
/// stubs reach every target-side function with rel32 calls emitted at build
/// time instead of absolute-register calls.
pub mod x86 {
    use super::*;

    pub const WORD: usize = 4;

    pub static SIGNATURES: [SignatureSpec; 7] = [
        SignatureSpec {
            id: SignatureId::LoadDone,
            pattern: &[(0, 0xe8), (9, 0x06), (10, 0x00), (13, 0xd9)],
            window: 34,
            site_offset: 28,
            capture: Some(CaptureRule { offset: 28, len: 6 }),
            operand: None,
            extra: NO_EXTRA,
            extra_site: None,
        },
        SignatureSpec {
            id: SignatureId::MenuLoad,
            pattern: &[(0, 0x7d), (3, 0x40), (5, 0x8b), (8, 0xc7)],
            window: 44,
            site_offset: 38,
            capture: Some(CaptureRule { offset: 38, len: 6 }),
            operand: None,
            extra: NO_EXTRA,
            extra_site: None,
        },
        SignatureSpec {
            id: SignatureId::MapLoad,
            pattern: &[(0, 0x52), (2, 0x8d), (5, 0x8d), (8, 0x89)],
            window: 136,
            site_offset: 59,
            capture: Some(CaptureRule { offset: 59, len: 5 }),
            operand: None,
            extra: &[
                // Displaced bytes of the cue-fade-out site; the handler-object
                // load is split in two runs around them in this build.
                CaptureRule {
                    offset: 101,
                    len: 24,
                },
                CaptureRule { offset: 96, len: 5 },
                CaptureRule {
                    offset: 125,
                    len: 11,
                },
            ],
            extra_site: Some(96),
        },
        SignatureSpec {
            id: SignatureId::MapLoadDone,
            pattern: &[(0, 0xf2), (1, 0x84), (13, 0x75)],
            window: 63,
            site_offset: 58,
            capture: Some(CaptureRule { offset: 58, len: 5 }),
            operand: None,
            extra: NO_EXTRA,
            extra_site: None,
        },
        SignatureSpec {
            id: SignatureId::CueStop,
            pattern: &[(0, 0x80), (1, 0x7b), (4, 0xb8), (11, 0x80)],
            window: 12,
            site_offset: -126,
            capture: None,
            operand: None,
            extra: NO_EXTRA,
            extra_site: None,
        },
        SignatureSpec {
            id: SignatureId::CueQuery,
            pattern: &[(0, 0x43), (2, 0x8b), (11, 0x65)],
            window: 12,
            site_offset: -119,
            capture: None,
            operand: None,
            extra: NO_EXTRA,
            extra_site: None,
        },
        SignatureSpec {
            id: SignatureId::HostWait,
            pattern: &[(0, 0x53), (3, 0x18), (8, 0xba), (13, 0x89)],
            window: 14,
            site_offset: 0,
            capture: None,
            operand: None,
            extra: NO_EXTRA,
            extra_site: None,
        },
    ];
}

#[cfg(target_pointer_width = "64")]
pub use x86_64 as active;

#[cfg(target_pointer_width = "32")]
pub use x86 as active;

/// Widest signature window of a table; the locator fails closed on images
/// smaller than this.
pub fn max_window(specs: &[SignatureSpec]) -> usize {
    specs.iter().map(|s| s.window).max().unwrap_or(0)
}
