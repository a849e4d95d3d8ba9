//! End-to-end arming scenarios against a synthetic executable image.
//!
//! Each test maps an anonymous region, plants the instruction signatures
//! the way the supported binary lays them out, feeds the engine a matching
//! maps listing, and arms for real: trampoline page, patches and all. On
//! success the patched sites are actually executed and the status byte is
//! observed the same way the external monitor observes it.

#![cfg(all(target_os = "linux", target_arch = "x86_64"))]

use std::fs;

use phasetap_core::codegen::x86_64 as arch;
use phasetap_core::maps::{Permissions, RegionMapReader};
use phasetap_core::signature::x86_64::SIGNATURES;
use phasetap_core::signature::SignatureId;
use phasetap_core::{CuePolicy, Engine, EngineConfig, Error, Phase, Status};

const IMAGE_SIZE: usize = 64 * 1024;
const IMAGE_NAME: &str = "FakeGame.bin.x86_64";

/// Offsets of the planted matches inside the image.
const MATCH_AT: [usize; 7] = [0x200, 0x400, 0x600, 0x800, 0xa00, 0xc00, 0xe00];
/// A lone `ret`, the target of the load-done site's displaced call.
const RET_FN_AT: usize = 0x4000;
/// Eight readable bytes standing in for the global-pointer base.
const GP_DATA_AT: usize = 0x4010;

struct FakeImage {
    start: u64,
}

impl FakeImage {
    /// Map, plant and protect a synthetic image. `sabotage` knocks out one
    /// signature's pattern for the failure scenario.
    fn new(sabotage: Option<SignatureId>) -> FakeImage {
        // SAFETY: fresh anonymous mapping, released in Drop.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                IMAGE_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(addr, libc::MAP_FAILED);
        let start = addr as u64;

        // SAFETY: the region was just mapped read+write at this size.
        let image =
            unsafe { std::slice::from_raw_parts_mut(addr as *mut u8, IMAGE_SIZE) };
        image.fill(0x90);

        for (spec, &pos) in SIGNATURES.iter().zip(&MATCH_AT) {
            if sabotage == Some(spec.id) {
                continue;
            }
            for &(off, byte) in spec.pattern {
                image[pos + off] = byte;
            }
        }

        // Displaced call target of the load-done site: rel32 at match+27
        // reaching the ret at RET_FN_AT from match+31.
        let load = MATCH_AT[SignatureId::LoadDone as usize];
        let rel = (RET_FN_AT as i64 - (load + 31) as i64) as i32;
        image[load + 27..load + 31].copy_from_slice(&rel.to_le_bytes());
        // Return landing of the patched load-done site.
        image[load + 19 + 14] = 0xc3;

        // Global-pointer base of the map-load site: rel32 at match+57
        // reaching GP_DATA_AT from match+61.
        let map = MATCH_AT[SignatureId::MapLoad as usize];
        let rel = (GP_DATA_AT as i64 - (map + 61) as i64) as i32;
        image[map + 57..map + 61].copy_from_slice(&rel.to_le_bytes());
        // Return landing of the patched map-load site (site = match + 54).
        image[map + 54 + 14] = 0xc3;

        image[RET_FN_AT] = 0xc3;

        // The engine expects to find the image read+execute.
        // SAFETY: protection change on the region mapped above.
        let rc = unsafe {
            libc::mprotect(addr, IMAGE_SIZE, libc::PROT_READ | libc::PROT_EXEC)
        };
        assert_eq!(rc, 0);

        FakeImage { start }
    }

    fn listing(&self) -> String {
        format!(
            "{:x}-{:x} r-xp 00000000 08:01 4242 /opt/game/{}\n",
            self.start,
            self.start + IMAGE_SIZE as u64,
            IMAGE_NAME
        )
    }

    fn site(&self, id: SignatureId) -> u64 {
        let spec = &SIGNATURES[id as usize];
        (self.start + MATCH_AT[id as usize] as u64)
            .wrapping_add_signed(spec.site_offset as i64)
    }

    /// Execute the (patched) code at one site.
    fn run_site(&self, id: SignatureId) {
        // SAFETY: the site holds a balanced stub entry sequence ending in
        // a planted ret; the region is read+execute.
        unsafe {
            let f: extern "C" fn() = std::mem::transmute(self.site(id) as usize);
            f();
        }
    }

    fn current_permissions(&self) -> Permissions {
        let maps = fs::read_to_string("/proc/self/maps").unwrap();
        RegionMapReader::new(maps.as_bytes())
            .find(|r| r.start == self.start)
            .map(|r| r.perms)
            .unwrap()
    }
}

impl Drop for FakeImage {
    fn drop(&mut self) {
        // SAFETY: unmapping the region created in new.
        unsafe {
            libc::munmap(self.start as *mut libc::c_void, IMAGE_SIZE);
        }
    }
}

fn config(shm_name: &str, cue_names: &[&str]) -> EngineConfig {
    EngineConfig {
        shm_name: shm_name.into(),
        policy: Some(CuePolicy::Wait),
        cue_names: cue_names.iter().map(|s| s.to_string()).collect(),
        image_names: vec![IMAGE_NAME.into()],
    }
}

/// Observer-side view of the status byte, reached through the memfd link
/// the way the external monitor reaches it.
struct ObservedByte {
    addr: *const u8,
}

impl ObservedByte {
    fn attach(shm_name: &str) -> ObservedByte {
        let wanted = format!("/memfd:{shm_name}");
        let deleted = format!("{wanted} (deleted)");
        for entry in fs::read_dir("/proc/self/fd").unwrap() {
            let path = entry.unwrap().path();
            let Ok(link) = fs::read_link(&path) else {
                continue;
            };
            let link = link.to_string_lossy().into_owned();
            if link != wanted && link != deleted {
                continue;
            }
            let file = fs::File::open(&path).unwrap();
            // SAFETY: mapping one readable byte of the sealed memfd.
            let addr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    1,
                    libc::PROT_READ,
                    libc::MAP_SHARED,
                    std::os::fd::AsRawFd::as_raw_fd(&file),
                    0,
                )
            };
            assert_ne!(addr, libc::MAP_FAILED);
            return ObservedByte {
                addr: addr as *const u8,
            };
        }
        panic!("memfd {shm_name} not found in /proc/self/fd");
    }

    fn read(&self) -> u8 {
        // SAFETY: one-byte shared mapping held for the struct's lifetime.
        unsafe { self.addr.read_volatile() }
    }
}

impl Drop for ObservedByte {
    fn drop(&mut self) {
        // SAFETY: unmapping the one-byte mapping from attach.
        unsafe {
            libc::munmap(self.addr as *mut libc::c_void, 1);
        }
    }
}

#[test]
fn scenario_a_full_arm_and_phase_notifications() {
    let image = FakeImage::new(None);
    let mut engine = Engine::new();
    let cfg = config("phasetap-e2e-a", &["intro_voice", "cellar_door", "finale"]);

    engine
        .arm_with(image.listing().as_bytes(), &cfg)
        .unwrap();
    assert_eq!(engine.phase(), Phase::Armed);
    assert_eq!(engine.status_byte(), Some(Status::Resume as u8));

    // Crossing the map-load boundary pauses and marks it.
    image.run_site(SignatureId::MapLoad);
    assert_eq!(engine.status_byte(), Some(Status::PauseMark as u8));

    // Finishing the load resumes.
    image.run_site(SignatureId::LoadDone);
    assert_eq!(engine.status_byte(), Some(Status::Resume as u8));

    // Image protection is back to read+execute.
    assert_eq!(image.current_permissions(), Permissions::READ_EXEC_PRIVATE);
}

#[test]
fn scenario_a_observer_sees_transitions_and_terminal_sentinel() {
    let image = FakeImage::new(None);
    let mut engine = Engine::new();
    let cfg = config("phasetap-e2e-observer", &["one", "two", "three"]);
    engine
        .arm_with(image.listing().as_bytes(), &cfg)
        .unwrap();

    let observer = ObservedByte::attach("phasetap-e2e-observer");
    assert_eq!(Status::from_byte(observer.read()), Some(Status::Resume));

    image.run_site(SignatureId::MapLoad);
    assert_eq!(Status::from_byte(observer.read()), Some(Status::PauseMark));

    // Disarm forces the terminal sentinel; the observer's own mapping of
    // the sealed file outlives the engine's.
    engine.disarm();
    assert_eq!(engine.phase(), Phase::Disarmed);
    assert_eq!(Status::from_byte(observer.read()), Some(Status::Finished));
}

#[test]
fn scenario_b_empty_cue_list_arms_notifications_only() {
    let image = FakeImage::new(None);
    let mut engine = Engine::new();
    let cfg = config("phasetap-e2e-b", &[]);

    engine
        .arm_with(image.listing().as_bytes(), &cfg)
        .unwrap();
    assert_eq!(engine.phase(), Phase::Armed);
    // Only the notification block was allocated.
    assert_eq!(engine.page_size(), Some(arch::NOTIF_BLOCK_SIZE));

    // The notification stubs still fire.
    image.run_site(SignatureId::MapLoad);
    assert_eq!(engine.status_byte(), Some(Status::PauseMark as u8));
    image.run_site(SignatureId::LoadDone);
    assert_eq!(engine.status_byte(), Some(Status::Resume as u8));
}

#[test]
fn scenario_c_missing_signature_aborts_without_leaking_protection() {
    let image = FakeImage::new(Some(SignatureId::MenuLoad));
    let mut engine = Engine::new();
    let cfg = config("phasetap-e2e-c", &["one"]);

    let err = engine
        .arm_with(image.listing().as_bytes(), &cfg)
        .unwrap_err();
    match err {
        Error::PatternNotFound(id) => assert_eq!(id, SignatureId::MenuLoad),
        other => panic!("expected PatternNotFound, got {other:?}"),
    }
    assert_eq!(engine.phase(), Phase::Disarmed);
    assert!(engine.page_addr().is_none());

    // No writable window was leaked: the image still reads back as
    // read+execute, private.
    assert_eq!(image.current_permissions(), Permissions::READ_EXEC_PRIVATE);
}

#[test]
fn skip_policy_arms_the_fade_out_site() {
    let image = FakeImage::new(None);
    let mut engine = Engine::new();
    let mut cfg = config("phasetap-e2e-skip", &["hallway_whispers"]);
    cfg.policy = Some(CuePolicy::Skip);

    engine
        .arm_with(image.listing().as_bytes(), &cfg)
        .unwrap();
    assert_eq!(engine.phase(), Phase::Armed);

    // The fade-out site now opens with the transfer into the page.
    let map_spec = &SIGNATURES[SignatureId::MapLoad as usize];
    let fade_out = image.start
        + MATCH_AT[SignatureId::MapLoad as usize] as u64
        + map_spec.extra_site.unwrap() as u64;
    // SAFETY: reading back one patched byte of the live image.
    let first = unsafe { (fade_out as *const u8).read() };
    assert_eq!(first, 0x51);
}
