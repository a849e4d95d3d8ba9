//! phasetap agent, injected into the game process via `LD_PRELOAD`.
//!
//! A constructor entry runs the one-shot arm sequence before the host's
//! `main` resumes: load settings, read the cue list, arm the engine. An
//! `atexit` handler disarms on the way out, forcing the terminal status
//! sentinel and releasing the trampoline.
//!
//! The file-interception subsystem living alongside this agent consults
//! exactly one boolean here, [`file_delays_active`]; it is set once on
//! arming success and never mutated again.

mod paths;

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use phasetap_core::{Engine, EngineConfig, Settings};

/// Engine singleton, owned here so the exit handler can reach it.
static ENGINE: Mutex<Option<Engine>> = Mutex::new(None);

/// Set once when arming succeeds.
static ARMED: AtomicBool = AtomicBool::new(false);

/// Boundary flag for the file-interception subsystem: whether configured
/// file-open delays should be applied.
static FILE_DELAYS: AtomicBool = AtomicBool::new(false);

/// Whether the engine armed successfully in this process.
pub fn armed() -> bool {
    ARMED.load(Ordering::Acquire)
}

/// Whether the file-interception subsystem should apply its delays.
/// Consulted, never mutated, by that subsystem.
pub fn file_delays_active() -> bool {
    FILE_DELAYS.load(Ordering::Acquire)
}

/// Agent entry point, called from the loader constructor.
///
/// Runs synchronously so every patch is in place before the host's own
/// entry point resumes. Failures leave the host uninstrumented and are
/// reported through the diagnostic stream; the host must keep launching.
#[unsafe(no_mangle)]
pub extern "C" fn phasetap_init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("phasetap=info".parse().unwrap_or_default()),
        )
        .with_writer(std::io::stderr)
        .try_init();

    let settings = Settings::load_or_reset(paths::settings_path());

    let cue_names = if settings.cue_policy().is_some() {
        match phasetap_core::read_cue_names(paths::cue_list_path()) {
            Ok(names) => names,
            Err(e) => {
                error!("cannot read cue list, not arming: {e}");
                return;
            }
        }
    } else {
        Vec::new()
    };

    let config = match EngineConfig::from_settings(&settings, cue_names) {
        Ok(config) => config,
        Err(e) => {
            error!("invalid configuration, not arming: {e}");
            return;
        }
    };

    let mut engine = Engine::new();
    match engine.arm(&config) {
        Ok(()) => {
            info!("phasetap armed");
            ARMED.store(true, Ordering::Release);
            FILE_DELAYS.store(settings.delay_files, Ordering::Release);
        }
        Err(e) => {
            // The engine already transitioned to Disarmed and released
            // everything it had acquired.
            error!("phasetap not armed: {e}");
        }
    }

    if let Ok(mut slot) = ENGINE.lock() {
        *slot = Some(engine);
    }

    // SAFETY: registering a plain extern "C" exit handler.
    unsafe {
        libc::atexit(phasetap_exit);
    }
}

/// Exit handler: force the terminal sentinel and release the trampoline.
extern "C" fn phasetap_exit() {
    match ENGINE.lock() {
        Ok(mut slot) => {
            if let Some(engine) = slot.as_mut() {
                engine.disarm();
            }
        }
        Err(_) => warn!("engine state poisoned at exit"),
    }
}

/// Constructor attribute for automatic initialization on library load.
#[cfg(all(target_os = "linux", not(test)))]
#[unsafe(link_section = ".init_array")]
#[used]
static INIT: extern "C" fn() = {
    extern "C" fn init() {
        phasetap_init();
    }
    init
};
