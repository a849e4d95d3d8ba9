//! Trampoline encoding for the 64-bit build.
//!
//! Control transfers into and out of the page use register-indirect jumps
//! carrying full absolute addresses (`push rcx; mov rcx, imm64; jmp rcx`,
//! landing on a `pop rcx` back at the site), so the page can live anywhere
//! in the address space. Status-byte writes are rip-relative `xchg`
//! instructions reaching back to page offset 0.

use crate::config::CuePolicy;
use crate::scanner::SiteSet;
use crate::signature::SignatureId;
use crate::status::Status;
use crate::table::{ENTRY_HEADER_WORDS, STRING_SLOT_SIZE};

use super::{SitePatch, TableAddrs, bump_u32, put, put_u64};

pub const WORD: usize = 8;

/// Notification block: status byte plus the three phase stubs.
pub const NOTIF_BLOCK_SIZE: usize = 128;
pub const SKIP_BLOCK_SIZE: usize = 128;
pub const WAIT_BLOCK_SIZE: usize = 192;

/// Page offset of the status byte, the first byte of the mapping.
pub const STATUS_OFFSET: usize = 0;

/// Page offsets of the stub entry points.
pub const LOAD_DONE_STUB: usize = 1;
pub const MENU_LOAD_STUB: usize = 48;
pub const MAP_LOAD_STUB: usize = 85;
pub const ITER_BLOCK_OFFSET: usize = NOTIF_BLOCK_SIZE;

/// Displaced lengths at each patch site.
pub const LOAD_DONE_PATCH_LEN: usize = 14;
pub const MENU_LOAD_PATCH_LEN: usize = 16;
pub const MAP_LOAD_PATCH_LEN: usize = 14;
pub const CUE_FADE_OUT_PATCH_LEN: usize = 32;
pub const MAP_LOAD_DONE_PATCH_LEN: usize = 15;

/// One yield quantum of the *wait* stub, microseconds.
const WAIT_QUANTUM_US: u32 = 1000;

/// Relocated string-object reset step: slot size plus the record header.
const STRING_RESET: usize = STRING_SLOT_SIZE + ENTRY_HEADER_WORDS * WORD;

const NOP: u8 = 0x90;
const INT3: u8 = 0xcc;

// Template extents against their blocks.
const _: () = assert!(LOAD_DONE_STUB + 47 == MENU_LOAD_STUB);
const _: () = assert!(MENU_LOAD_STUB + 37 == MAP_LOAD_STUB);
const _: () = assert!(MAP_LOAD_STUB + 38 <= NOTIF_BLOCK_SIZE);
const _: () = assert!(123 <= SKIP_BLOCK_SIZE);
const _: () = assert!(192 <= WAIT_BLOCK_SIZE);
// The reset step is encoded as an imm8.
const _: () = assert!(STRING_RESET == 88);

/// `push rcx; mov rcx, imm64; jmp rcx`, 13 bytes; the landing `pop rcx`
/// is placed separately by each patch.
fn jump_abs(buf: &mut [u8], offset: usize, target: u64) {
    buf[offset] = 0x51;
    buf[offset + 1] = 0x48;
    buf[offset + 2] = 0xb9;
    put_u64(buf, offset + 3, target);
    buf[offset + 11] = 0xff;
    buf[offset + 12] = 0xe1;
}

/// `mov rcx, imm64; jmp rcx`, the stub-side return transfer.
fn return_abs(buf: &mut [u8], offset: usize, target: u64) {
    buf[offset] = 0x48;
    buf[offset + 1] = 0xb9;
    put_u64(buf, offset + 2, target);
    buf[offset + 10] = 0xff;
    buf[offset + 11] = 0xe1;
}

/// Build the notification block. The status byte starts at `Resume`.
pub fn notification_block(sites: &SiteSet, _page: u64) -> [u8; NOTIF_BLOCK_SIZE] {
    let mut b = [INT3; NOTIF_BLOCK_SIZE];
    b[STATUS_OFFSET] = Status::Resume as u8;

    // Load-finished stub. The dummy push keeps the stack 16-aligned for
    // the re-emitted call.
    let load = sites.site(SignatureId::LoadDone);
    debug_assert_eq!(load.captured.len(), LOAD_DONE_PATCH_LEN);
    put(&mut b, 1, &[0x51, 0xb1, Status::Resume as u8]);
    // xchg byte ptr [rip - 10], cl → page offset 0
    put(&mut b, 4, &[0x86, 0x0d, 0xf6, 0xff, 0xff, 0xff]);
    put(&mut b, 10, &load.captured[..7]);
    debug_assert!(load.derived.is_some());
    put(&mut b, 17, &[0x48, 0xb9]);
    put_u64(&mut b, 19, load.derived.unwrap_or_default());
    put(&mut b, 27, &[0xff, 0xd1]); // call rcx
    put(&mut b, 29, &load.captured[12..14]);
    b[31] = 0x59; // undo the dummy push
    return_abs(&mut b, 32, load.address + 13);
    put(&mut b, 44, &[NOP; 4]);

    // Menu-load stub. The displaced instructions address the stack; their
    // rsp displacements move by the entry push.
    let menu = sites.site(SignatureId::MenuLoad);
    debug_assert_eq!(menu.captured.len(), MENU_LOAD_PATCH_LEN);
    put(&mut b, MENU_LOAD_STUB, &[0xb1, Status::Pause as u8]);
    // xchg byte ptr [rip - 56], cl → page offset 0
    put(&mut b, 50, &[0x86, 0x0d, 0xc8, 0xff, 0xff, 0xff]);
    let mut replay = [0u8; MENU_LOAD_PATCH_LEN];
    replay.copy_from_slice(&menu.captured);
    bump_u32(&mut replay, 4, WORD as i32);
    bump_u32(&mut replay, 12, WORD as i32);
    put(&mut b, 56, &replay);
    return_abs(&mut b, 72, menu.address + 15);
    b[84] = NOP;

    // Map-load stub. The displaced pair is re-emitted as an absolute load
    // of the global-pointer base followed by the captured dependent load.
    let map = sites.site(SignatureId::MapLoad);
    debug_assert_eq!(map.captured.len(), 7);
    debug_assert!(map.derived.is_some());
    put(&mut b, MAP_LOAD_STUB, &[0xb1, Status::PauseMark as u8]);
    // xchg byte ptr [rip - 93], cl → page offset 0
    put(&mut b, 87, &[0x86, 0x0d, 0xa3, 0xff, 0xff, 0xff]);
    put(&mut b, 93, &[0x48, 0xa1]); // mov rax, [imm64]
    put_u64(&mut b, 95, map.derived.unwrap_or_default());
    put(&mut b, 103, &map.captured);
    return_abs(&mut b, 110, map.address + 13);
    b[122] = NOP;

    b
}

/// Build the *skip* iteration stub: stop every cue unconditionally, then
/// fall through to the displaced fade-out instructions back at the site.
pub fn skip_block(sites: &SiteSet, _page: u64, t: &TableAddrs) -> [u8; SKIP_BLOCK_SIZE] {
    let mut b = [INT3; SKIP_BLOCK_SIZE];
    let map = sites.site(SignatureId::MapLoad);
    debug_assert_eq!(map.extra.len(), 2);
    debug_assert_eq!(map.extra[1].len(), 14);

    // Replayed handler-object load leaves the handler in rdi.
    put(&mut b, 0, &map.extra[1]);
    put(&mut b, 14, &[0x41, 0x54, 0x41, 0x55, 0x41, 0x56, 0x41, 0x57]);
    put(&mut b, 22, &[0x53, 0x53, 0x53]);
    put(&mut b, 25, &[0x49, 0xbc]); // mov r12, string slot
    put_u64(&mut b, 27, t.string_slot);
    put(&mut b, 35, &[0x49, 0xbd]); // mov r13, loop stop
    put_u64(&mut b, 37, t.loop_stop);
    put(&mut b, 45, &[0x49, 0xbe]); // mov r14, cue-stop handler
    put_u64(&mut b, 47, sites.site(SignatureId::CueStop).address);
    put(&mut b, 55, &[0x49, 0x89, 0xff]); // mov r15, rdi
    put(&mut b, 58, &[0x49, 0x8b, 0x1c, 0x24]); // mov rbx, [r12]
    put(&mut b, 62, &[0x4c, 0x89, 0xe6]); // mov rsi, r12
    // Loop: point the relocated string object at the current record, call
    // the handler, step one stride.
    put(&mut b, 65, &[0x49, 0x89, 0x1c, 0x24]); // mov [r12], rbx
    put(&mut b, 69, &[0x41, 0xff, 0xd6]); // call r14
    put(&mut b, 72, &[0x4c, 0x89, 0xff]); // mov rdi, r15
    put(&mut b, 75, &[0x4c, 0x89, 0xe6]); // mov rsi, r12
    put(&mut b, 78, &[0x48, 0x81, 0xc3]); // add rbx, stride
    put(&mut b, 81, &t.stride.to_le_bytes());
    put(&mut b, 85, &[0x4c, 0x39, 0xeb]); // cmp rbx, r13
    put(&mut b, 88, &[0x75, 0xe7]); // jnz loop
    put(&mut b, 90, &[0x5b, 0x5b, 0x5b]);
    // Reset the string object to the first record before leaving.
    put(&mut b, 93, &[0x49, 0x83, 0xc4, STRING_RESET as u8]); // add r12, 88
    put(&mut b, 97, &[0x4d, 0x89, 0x64, 0x24, 0xa8]); // mov [r12 - 88], r12
    put(&mut b, 102, &[0x41, 0x5f, 0x41, 0x5e, 0x41, 0x5d, 0x41, 0x5c]);
    let resume = map
        .extra_address
        .unwrap_or_default()
        .wrapping_add(13);
    return_abs(&mut b, 110, resume);
    b[122] = NOP;
    b
}

/// Build the *wait* iteration stub: query every cue, OR the results, and
/// while anything is active call the host wait primitive for one quantum
/// before re-scanning.
pub fn wait_block(sites: &SiteSet, _page: u64, t: &TableAddrs) -> [u8; WAIT_BLOCK_SIZE] {
    let mut b = [INT3; WAIT_BLOCK_SIZE];
    let map = sites.site(SignatureId::MapLoad);
    let done = sites.site(SignatureId::MapLoadDone);
    debug_assert_eq!(map.extra[1].len(), 14);
    debug_assert_eq!(done.captured.len(), 10);
    debug_assert!(map.derived.is_some() && done.derived.is_some());

    put(&mut b, 0, &[0x48, 0xa1]); // mov rax, [global-pointer base]
    put_u64(&mut b, 2, map.derived.unwrap_or_default());
    put(&mut b, 10, &map.extra[1]); // handler-object load into rdi
    put(&mut b, 24, &[0x41, 0x54, 0x41, 0x55, 0x41, 0x56, 0x41, 0x57]);
    put(&mut b, 32, &[0x53, 0x57]);
    put(&mut b, 34, &[0x31, 0xdb]); // xor ebx, ebx
    put(&mut b, 36, &[0x48, 0xbe]); // mov rsi, string slot
    put_u64(&mut b, 38, t.string_slot);
    put(&mut b, 46, &[0x49, 0xbd]); // mov r13, loop stop
    put_u64(&mut b, 48, t.loop_stop);
    put(&mut b, 56, &[0x49, 0xbe]); // mov r14, cue-query handler
    put_u64(&mut b, 58, sites.site(SignatureId::CueQuery).address);
    put(&mut b, 66, &[0x49, 0xbf]); // mov r15, host wait
    put_u64(&mut b, 68, sites.site(SignatureId::HostWait).address);
    put(&mut b, 76, &[0x4c, 0x8b, 0x26]); // mov r12, [rsi]
    b[79] = 0x56; // push rsi
    // Loop over the records, accumulating active flags in ebx.
    put(&mut b, 80, &[0x48, 0x8b, 0x7c, 0x24, 0x08]); // mov rdi, [rsp + 8]
    put(&mut b, 85, &[0x48, 0x8b, 0x34, 0x24]); // mov rsi, [rsp]
    put(&mut b, 89, &[0x4c, 0x89, 0x26]); // mov [rsi], r12
    put(&mut b, 92, &[0x41, 0xff, 0xd6]); // call r14
    put(&mut b, 95, &[0x09, 0xc3]); // or ebx, eax
    put(&mut b, 97, &[0x49, 0x81, 0xc4]); // add r12, stride
    put(&mut b, 100, &t.stride.to_le_bytes());
    put(&mut b, 104, &[0x4d, 0x39, 0xec]); // cmp r12, r13
    put(&mut b, 107, &[0x75, 0xe3]); // jnz loop
    put(&mut b, 109, &[0x83, 0xfb, 0x00]); // cmp ebx, 0
    put(&mut b, 112, &[0x74, 0x19]); // jz done
    b[114] = 0xbf; // mov edi, quantum
    put(&mut b, 115, &WAIT_QUANTUM_US.to_le_bytes());
    put(&mut b, 119, &[0x41, 0xff, 0xd7]); // call r15
    put(&mut b, 122, &[0x4c, 0x8b, 0x24, 0x24]); // mov r12, [rsp]
    put(&mut b, 126, &[0x49, 0x83, 0xc4, STRING_RESET as u8]);
    put(&mut b, 130, &[0x4d, 0x89, 0x64, 0x24, 0xa8]); // reset string object
    put(&mut b, 135, &[0x31, 0xdb]);
    put(&mut b, 137, &[0xeb, 0xc5]); // jmp loop
    // Done: reset the string object, unwind, replay the displaced bytes
    // and re-emit the displaced call as an absolute one.
    b[139] = 0x5e; // pop rsi
    put(&mut b, 140, &[0x48, 0x89, 0x36]); // mov [rsi], rsi
    put(&mut b, 143, &[0x48, 0x83, 0x06, STRING_RESET as u8]); // add qword [rsi], 88
    put(&mut b, 147, &[0x5f, 0x5b]);
    put(&mut b, 149, &[0x41, 0x5f, 0x41, 0x5e, 0x41, 0x5d]);
    put(&mut b, 155, &done.captured);
    put(&mut b, 165, &[0x48, 0xb9]);
    put_u64(&mut b, 167, done.derived.unwrap_or_default());
    put(&mut b, 175, &[0xff, 0xd1]); // call rcx
    put(&mut b, 177, &[0x41, 0x5c]); // pop r12
    return_abs(&mut b, 179, done.address + 14);
    b[191] = NOP;
    b
}

/// The writes the patcher performs at the injection sites.
pub fn entry_patches(sites: &SiteSet, page: u64, policy: Option<CuePolicy>) -> Vec<SitePatch> {
    let mut patches = Vec::new();

    let load = sites.site(SignatureId::LoadDone);
    let mut bytes = vec![0u8; LOAD_DONE_PATCH_LEN];
    jump_abs(&mut bytes, 0, page + LOAD_DONE_STUB as u64);
    bytes[13] = 0x59; // stub returns here
    patches.push(SitePatch {
        address: load.address,
        bytes,
    });

    let menu = sites.site(SignatureId::MenuLoad);
    let mut bytes = vec![0u8; MENU_LOAD_PATCH_LEN];
    jump_abs(&mut bytes, 0, page + MENU_LOAD_STUB as u64);
    bytes[13] = NOP;
    bytes[14] = NOP;
    bytes[15] = 0x59;
    patches.push(SitePatch {
        address: menu.address,
        bytes,
    });

    let map = sites.site(SignatureId::MapLoad);
    let mut bytes = vec![0u8; MAP_LOAD_PATCH_LEN];
    jump_abs(&mut bytes, 0, page + MAP_LOAD_STUB as u64);
    bytes[13] = 0x59;
    patches.push(SitePatch {
        address: map.address,
        bytes,
    });

    match policy {
        Some(CuePolicy::Skip) => {
            // The displaced fade-out run moves forward by the transfer
            // length; its rip-relative displacement is corrected to match.
            debug_assert_eq!(map.extra[0].len(), 18);
            let mut bytes = vec![0u8; CUE_FADE_OUT_PATCH_LEN];
            jump_abs(&mut bytes, 0, page + ITER_BLOCK_OFFSET as u64);
            bytes[13] = 0x59;
            let mut displaced = map.extra[0].clone();
            bump_u32(&mut displaced, 14, -14);
            put(&mut bytes, 14, &displaced);
            patches.push(SitePatch {
                address: map.extra_address.unwrap_or_default(),
                bytes,
            });
        }
        Some(CuePolicy::Wait) => {
            let done = sites.site(SignatureId::MapLoadDone);
            let mut bytes = vec![0u8; MAP_LOAD_DONE_PATCH_LEN];
            jump_abs(&mut bytes, 0, page + ITER_BLOCK_OFFSET as u64);
            bytes[13] = NOP;
            bytes[14] = 0x59;
            patches.push(SitePatch {
                address: done.address,
                bytes,
            });
        }
        None => {}
    }

    patches
}
