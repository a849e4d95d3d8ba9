//! # phasetap-core
//!
//! In-process instrumentation engine for the supported game builds. Once
//! loaded into the running host, it:
//!
//! - locates the host's own executable image in the memory map listing,
//! - finds a fixed set of instruction signatures in that image with no
//!   debug symbols, relocations or disassembler,
//! - generates trampoline code in a sealed, shared, executable page,
//! - hot-patches each injection site with a transfer into the page,
//! - publishes load-phase transitions through a single shared status byte
//!   polled by an out-of-process observer,
//! - and optionally skips or throttles cue playback during map loads via a
//!   generated per-entry iteration stub.
//!
//! Everything is armed exactly once at load time and disarmed at process
//! exit. Any arming failure leaves the host completely uninstrumented.

pub mod codegen;
pub mod config;
pub mod engine;
pub mod error;
pub mod locator;
pub mod maps;
pub mod page;
pub mod patcher;
pub mod scanner;
pub mod signature;
pub mod span;
pub mod status;
pub mod table;

pub use config::{CuePolicy, EngineConfig, IMAGE_NAMES, Settings, read_cue_names, sanitize_shm_name};
pub use engine::{Engine, Phase};
pub use error::{Error, Result};
pub use locator::{TargetImage, locate};
pub use maps::{MappedRegion, Permissions, RegionMapReader};
pub use scanner::{InjectionSite, SiteSet, scan};
pub use signature::{SignatureId, SignatureSpec};
pub use status::Status;
