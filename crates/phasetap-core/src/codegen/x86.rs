//! Trampoline encoding for the 32-bit build.
//!
//! Every address fits a rel32, so control transfers in and out of the page
//! are plain `jmp rel32` instructions and the status-byte writes use an
//! absolute-address `xchg` form; no scratch register is borrowed and no
//! landing pops are needed.

use crate::config::CuePolicy;
use crate::scanner::SiteSet;
use crate::signature::SignatureId;
use crate::status::Status;

use super::{SitePatch, TableAddrs, put, put_u32, rel32};

pub const WORD: usize = 4;

pub const NOTIF_BLOCK_SIZE: usize = 64;
pub const SKIP_BLOCK_SIZE: usize = 64;
pub const WAIT_BLOCK_SIZE: usize = 128;

pub const STATUS_OFFSET: usize = 0;

pub const LOAD_DONE_STUB: usize = 1;
pub const MENU_LOAD_STUB: usize = 21;
pub const MAP_LOAD_STUB: usize = 41;
pub const ITER_BLOCK_OFFSET: usize = NOTIF_BLOCK_SIZE;

pub const LOAD_DONE_PATCH_LEN: usize = 6;
pub const MENU_LOAD_PATCH_LEN: usize = 6;
pub const MAP_LOAD_PATCH_LEN: usize = 5;
pub const CUE_FADE_OUT_PATCH_LEN: usize = 40;
pub const MAP_LOAD_DONE_PATCH_LEN: usize = 5;

/// The wait primitive takes its quantum pre-scaled; the stub shifts the
/// accumulated flag left by this amount to reach roughly one millisecond.
const WAIT_QUANTUM_SHIFT: u8 = 10;

const NOP: u8 = 0x90;
const INT3: u8 = 0xcc;

const _: () = assert!(LOAD_DONE_STUB + 20 == MENU_LOAD_STUB);
const _: () = assert!(MENU_LOAD_STUB + 20 == MAP_LOAD_STUB);
const _: () = assert!(MAP_LOAD_STUB + 19 <= NOTIF_BLOCK_SIZE);
const _: () = assert!(59 <= SKIP_BLOCK_SIZE);
const _: () = assert!(105 <= WAIT_BLOCK_SIZE);

/// `jmp rel32` reaching `target` from the instruction at `at`.
fn jump_rel(buf: &mut [u8], offset: usize, at: u64, target: u64) {
    buf[offset] = 0xe9;
    put(buf, offset + 1, &rel32(target, at + 5));
}

/// `call rel32` reaching `target` from the instruction at `at`.
fn call_rel(buf: &mut [u8], offset: usize, at: u64, target: u64) {
    buf[offset] = 0xe8;
    put(buf, offset + 1, &rel32(target, at + 5));
}

fn status_write(buf: &mut [u8], offset: usize, status: Status, page: u64) {
    buf[offset] = 0xb0; // mov al, literal
    buf[offset + 1] = status as u8;
    buf[offset + 2] = 0x86; // xchg [status byte], al
    buf[offset + 3] = 0x05;
    put_u32(buf, offset + 4, (page + STATUS_OFFSET as u64) as u32);
}

pub fn notification_block(sites: &SiteSet, page: u64) -> [u8; NOTIF_BLOCK_SIZE] {
    let mut b = [INT3; NOTIF_BLOCK_SIZE];
    b[STATUS_OFFSET] = Status::Resume as u8;

    let load = sites.site(SignatureId::LoadDone);
    debug_assert_eq!(load.captured.len(), LOAD_DONE_PATCH_LEN);
    status_write(&mut b, LOAD_DONE_STUB, Status::Resume, page);
    put(&mut b, 9, &load.captured);
    jump_rel(&mut b, 15, page + 15, load.address + 6);
    b[20] = NOP;

    let menu = sites.site(SignatureId::MenuLoad);
    debug_assert_eq!(menu.captured.len(), MENU_LOAD_PATCH_LEN);
    status_write(&mut b, MENU_LOAD_STUB, Status::Pause, page);
    put(&mut b, 29, &menu.captured);
    jump_rel(&mut b, 35, page + 35, menu.address + 6);
    b[40] = NOP;

    let map = sites.site(SignatureId::MapLoad);
    debug_assert_eq!(map.captured.len(), MAP_LOAD_PATCH_LEN);
    status_write(&mut b, MAP_LOAD_STUB, Status::PauseMark, page);
    put(&mut b, 49, &map.captured);
    jump_rel(&mut b, 54, page + 54, map.address + 5);
    b[59] = NOP;

    b
}

pub fn skip_block(sites: &SiteSet, page: u64, t: &TableAddrs) -> [u8; SKIP_BLOCK_SIZE] {
    let mut b = [INT3; SKIP_BLOCK_SIZE];
    let block = page + ITER_BLOCK_OFFSET as u64;
    let map = sites.site(SignatureId::MapLoad);
    debug_assert_eq!(map.extra.len(), 3);
    debug_assert_eq!(map.extra[0].len(), 24);

    put(&mut b, 0, &[0x53, 0x53]); // push ebx twice
    b[2] = 0x68; // push string slot
    put_u32(&mut b, 3, t.string_slot as u32);
    b[7] = 0x50; // push eax (handler object)
    b[8] = 0xbb; // mov ebx, first record data
    put_u32(&mut b, 9, t.first_entry_data as u32);
    put(&mut b, 13, &[NOP, NOP, NOP]);
    // Loop.
    put(&mut b, 16, &[0x89, 0x1d]); // mov [string slot], ebx
    put_u32(&mut b, 18, t.string_slot as u32);
    call_rel(&mut b, 22, block + 22, sites.site(SignatureId::CueStop).address);
    put(&mut b, 27, &[0x81, 0xc3]); // add ebx, stride
    put_u32(&mut b, 29, t.stride);
    put(&mut b, 33, &[0x81, 0xfb]); // cmp ebx, loop stop
    put_u32(&mut b, 35, t.loop_stop as u32);
    put(&mut b, 39, &[0x75, 0xe7]); // jnz loop
    put(&mut b, 41, &[0x58, 0x5b, 0x5b, 0x5b]);
    // Replay the first displaced fade-out instructions; the rest stayed
    // in place past the landing point.
    put(&mut b, 45, &map.extra[0][..8]);
    let resume = map.extra_address.unwrap_or_default() + 24;
    jump_rel(&mut b, 53, block + 53, resume);
    b[58] = NOP;
    b
}

pub fn wait_block(sites: &SiteSet, page: u64, t: &TableAddrs) -> [u8; WAIT_BLOCK_SIZE] {
    let mut b = [INT3; WAIT_BLOCK_SIZE];
    let block = page + ITER_BLOCK_OFFSET as u64;
    let map = sites.site(SignatureId::MapLoad);
    let done = sites.site(SignatureId::MapLoadDone);
    debug_assert_eq!(map.extra[1].len() + map.extra[2].len(), 16);
    debug_assert_eq!(done.captured.len(), MAP_LOAD_DONE_PATCH_LEN);

    put(&mut b, 0, &[0x53, 0x56]); // push ebx, push esi
    b[2] = 0x68; // push string slot
    put_u32(&mut b, 3, t.string_slot as u32);
    // Replayed handler-object load leaves the handler in eax.
    put(&mut b, 7, &map.extra[1]);
    put(&mut b, 7 + map.extra[1].len(), &map.extra[2]);
    b[23] = 0x50; // push eax
    b[24] = 0xbb; // mov ebx, first record data
    put_u32(&mut b, 25, t.first_entry_data as u32);
    put(&mut b, 29, &[0x31, 0xf6]); // xor esi, esi
    b[31] = NOP;
    // Loop: query each record, accumulating active flags in esi.
    put(&mut b, 32, &[0x89, 0x1d]); // mov [string slot], ebx
    put_u32(&mut b, 34, t.string_slot as u32);
    call_rel(&mut b, 38, block + 38, sites.site(SignatureId::CueQuery).address);
    put(&mut b, 43, &[0x09, 0xc6]); // or esi, eax
    put(&mut b, 45, &[0x81, 0xc3]); // add ebx, stride
    put_u32(&mut b, 47, t.stride);
    put(&mut b, 51, &[0x81, 0xfb]); // cmp ebx, loop stop
    put_u32(&mut b, 53, t.loop_stop as u32);
    put(&mut b, 57, &[0x75, 0xe5]); // jnz loop
    put(&mut b, 59, &[0x83, 0xfe, 0x00]); // cmp esi, 0
    put(&mut b, 62, &[0x74, 0x1a]); // jz done
    put(&mut b, 64, &[0x8b, 0x1c, 0x24]); // mov ebx, [esp] (handler)
    put(&mut b, 67, &[0xc1, 0xe6, WAIT_QUANTUM_SHIFT]); // shl esi, one quantum
    put(&mut b, 70, &[0x89, 0x34, 0x24]); // mov [esp], esi
    call_rel(&mut b, 73, block + 73, sites.site(SignatureId::HostWait).address);
    put(&mut b, 78, &[0x89, 0x1c, 0x24]); // mov [esp], ebx
    b[81] = 0xbb;
    put_u32(&mut b, 82, t.first_entry_data as u32);
    put(&mut b, 86, &[0x31, 0xf6]);
    put(&mut b, 88, &[0xeb, 0xc6]); // jmp loop
    // Done: unwind and replay the displaced bytes.
    put(&mut b, 90, &[0x5e, 0x5e, 0x5e, 0x5b]);
    put(&mut b, 94, &done.captured);
    jump_rel(&mut b, 99, block + 99, done.address + 5);
    b[104] = NOP;
    b
}

pub fn entry_patches(sites: &SiteSet, page: u64, policy: Option<CuePolicy>) -> Vec<SitePatch> {
    let mut patches = Vec::new();

    let load = sites.site(SignatureId::LoadDone);
    let mut bytes = vec![NOP; LOAD_DONE_PATCH_LEN];
    jump_rel(&mut bytes, 0, load.address, page + LOAD_DONE_STUB as u64);
    patches.push(SitePatch {
        address: load.address,
        bytes,
    });

    let menu = sites.site(SignatureId::MenuLoad);
    let mut bytes = vec![NOP; MENU_LOAD_PATCH_LEN];
    jump_rel(&mut bytes, 0, menu.address, page + MENU_LOAD_STUB as u64);
    patches.push(SitePatch {
        address: menu.address,
        bytes,
    });

    let map = sites.site(SignatureId::MapLoad);
    let mut bytes = vec![0u8; MAP_LOAD_PATCH_LEN];
    jump_rel(&mut bytes, 0, map.address, page + MAP_LOAD_STUB as u64);
    patches.push(SitePatch {
        address: map.address,
        bytes,
    });

    match policy {
        Some(CuePolicy::Skip) => {
            // The handler-object load runs in place ahead of the transfer;
            // the tail of the displaced run stays where the stub rejoins.
            let site = map.extra_address.unwrap_or_default();
            let mut bytes = vec![0u8; CUE_FADE_OUT_PATCH_LEN];
            put(&mut bytes, 0, &map.extra[1]);
            put(&mut bytes, map.extra[1].len(), &map.extra[2]);
            jump_rel(&mut bytes, 16, site + 16, page + ITER_BLOCK_OFFSET as u64);
            put(&mut bytes, 21, &[NOP, NOP, NOP]);
            put(&mut bytes, 24, &map.extra[0][8..24]);
            patches.push(SitePatch {
                address: site,
                bytes,
            });
        }
        Some(CuePolicy::Wait) => {
            let done = sites.site(SignatureId::MapLoadDone);
            let mut bytes = vec![0u8; MAP_LOAD_DONE_PATCH_LEN];
            jump_rel(&mut bytes, 0, done.address, page + ITER_BLOCK_OFFSET as u64);
            patches.push(SitePatch {
                address: done.address,
                bytes,
            });
        }
        None => {}
    }

    patches
}
