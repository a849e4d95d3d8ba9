//! Lifecycle controller.
//!
//! Sequences the one-shot arm at load time (locate, scan, allocate,
//! build, patch) and the disarm at process exit. Any failure while arming
//! releases whatever was acquired and leaves the host running completely
//! uninstrumented; there is no partial-feature fallback and nothing is
//! retried.

use std::fs::File;
use std::io::{BufRead, BufReader};

use tracing::{info, warn};

use crate::codegen::TableAddrs;
use crate::codegen::active as arch;
use crate::config::{CuePolicy, EngineConfig};
use crate::error::{Error, Result};
use crate::locator::{self, TargetImage};
use crate::page::TrampolinePage;
use crate::patcher;
use crate::scanner;
use crate::signature;
use crate::signature::active::{SIGNATURES, WORD};
use crate::table::{self, EntryTableLayout, STRING_SLOT_SIZE};

/// Engine lifecycle states. `Disarmed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Unarmed,
    Arming,
    Armed,
    Disarmed,
}

impl Phase {
    fn name(self) -> &'static str {
        match self {
            Phase::Unarmed => "unarmed",
            Phase::Arming => "arming",
            Phase::Armed => "armed",
            Phase::Disarmed => "disarmed",
        }
    }
}

/// Owns every resource the instrumentation acquires: the trampoline page
/// and the knowledge of where the target image lives.
#[derive(Debug)]
pub struct Engine {
    phase: Phase,
    page: Option<TrampolinePage>,
    image: Option<TargetImage>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Engine {
        Engine {
            phase: Phase::Unarmed,
            page: None,
            image: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn page_addr(&self) -> Option<u64> {
        self.page.as_ref().map(|p| p.addr())
    }

    pub fn page_size(&self) -> Option<usize> {
        self.page.as_ref().map(|p| p.size())
    }

    pub fn status_byte(&self) -> Option<u8> {
        self.page.as_ref().map(|p| p.status_byte())
    }

    pub fn image(&self) -> Option<TargetImage> {
        self.image
    }

    /// Arm against the process's own memory map listing.
    pub fn arm(&mut self, config: &EngineConfig) -> Result<()> {
        match File::open("/proc/self/maps") {
            Ok(maps) => self.arm_with(BufReader::new(maps), config),
            Err(e) => {
                warn!("cannot open memory map listing: {e}");
                self.phase = Phase::Disarmed;
                Err(e.into())
            }
        }
    }

    /// Arm against an arbitrary maps-format listing. The listing must
    /// describe live mappings of this process.
    pub fn arm_with<R: BufRead>(&mut self, maps: R, config: &EngineConfig) -> Result<()> {
        if self.phase != Phase::Unarmed {
            return Err(Error::BadPhase(self.phase.name()));
        }
        self.phase = Phase::Arming;

        match self.try_arm(maps, config) {
            Ok((image, page)) => {
                info!(
                    image_start = format_args!("{:#x}", image.start),
                    page = format_args!("{:#x}", page.addr()),
                    "instrumentation armed"
                );
                self.image = Some(image);
                self.page = Some(page);
                self.phase = Phase::Armed;
                Ok(())
            }
            Err(e) => {
                warn!("arming failed, host continues uninstrumented: {e}");
                self.phase = Phase::Disarmed;
                Err(e)
            }
        }
    }

    fn try_arm<R: BufRead>(
        &mut self,
        maps: R,
        config: &EngineConfig,
    ) -> Result<(TargetImage, TrampolinePage)> {
        let image = locator::locate(maps, &config.image_names)?;
        if image.size() <= signature::max_window(&SIGNATURES) {
            return Err(Error::NotFound);
        }

        // An empty cue list downgrades the policy: the notification stubs
        // still arm, only the iteration stub is skipped.
        let mut policy = config.policy;
        let layout = match policy {
            Some(_) => match EntryTableLayout::measure(&config.cue_names, WORD)? {
                Some(layout) => Some(layout),
                None => {
                    warn!("cue list is empty, arming without the iteration stub");
                    policy = None;
                    None
                }
            },
            None => None,
        };

        // SAFETY: the locator found this range as a live read+execute
        // mapping of the current process; it is only read here.
        let image_bytes = unsafe { crate::span::RawSpan::new(image.start, image.size()) };
        let sites = scanner::scan(image_bytes.as_slice(), image.start, &SIGNATURES)?;

        let (stub_size, page_size) = match (policy, &layout) {
            (Some(CuePolicy::Skip), Some(l)) => (
                arch::SKIP_BLOCK_SIZE,
                arch::NOTIF_BLOCK_SIZE + arch::SKIP_BLOCK_SIZE + l.data_size(),
            ),
            (Some(CuePolicy::Wait), Some(l)) => (
                arch::WAIT_BLOCK_SIZE,
                arch::NOTIF_BLOCK_SIZE + arch::WAIT_BLOCK_SIZE + l.data_size(),
            ),
            _ => (0, arch::NOTIF_BLOCK_SIZE),
        };

        let page = TrampolinePage::allocate(&config.shm_name, page_size)?;
        let span = page.span();
        let page_addr = page.addr();

        span.write(
            page_addr,
            &arch::notification_block(&sites, page_addr),
        )?;

        if let (Some(policy), Some(layout)) = (policy, &layout) {
            let t = TableAddrs::compute(page_addr, arch::ITER_BLOCK_OFFSET, stub_size, layout);
            let block_offset = page_addr + arch::ITER_BLOCK_OFFSET as u64;
            match policy {
                CuePolicy::Skip => {
                    span.write(block_offset, &arch::skip_block(&sites, page_addr, &t))?
                }
                CuePolicy::Wait => {
                    span.write(block_offset, &arch::wait_block(&sites, page_addr, &t))?
                }
            }
            // Point the relocated string object at the first record, then
            // lay the records out behind it.
            span.write(t.string_slot, &t.first_entry_data.to_le_bytes()[..WORD])?;
            let entries = table::encode_entries(&config.cue_names, layout)?;
            span.write(t.string_slot + STRING_SLOT_SIZE as u64, &entries)?;
        }

        let patches = arch::entry_patches(&sites, page_addr, policy);
        patcher::apply(&image, &patches)?;

        Ok((image, page))
    }

    /// Force the terminal status sentinel and release the trampoline.
    /// Safe to call in any phase; the first call wins.
    pub fn disarm(&mut self) {
        if let Some(page) = self.page.take() {
            info!("disarming, status byte set to terminal sentinel");
            drop(page);
        }
        self.phase = Phase::Disarmed;
    }
}
