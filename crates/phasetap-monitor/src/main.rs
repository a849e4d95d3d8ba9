//! phasetap monitor: the out-of-process observer.
//!
//! Polls the engine's shared status byte on a fixed short interval and
//! reports transitions. A value equal to the previous observation is a
//! no-op; values outside the protocol are ignored.

mod probe;

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use owo_colors::OwoColorize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use phasetap_core::{IMAGE_NAMES, Settings, Status, sanitize_shm_name};

#[derive(Parser)]
#[command(name = "phasetap-monitor")]
#[command(about = "Watch a phasetap-instrumented process's load phases")]
struct Args {
    /// Shared memory name; defaults to the one in the settings file.
    #[arg(short = 'n', long, env = "PHASETAP_SHM_NAME")]
    shm_name: Option<String>,

    /// Settings file consulted when --shm-name is not given.
    #[arg(short, long, default_value = "phasetap.json")]
    settings: PathBuf,

    /// Poll interval in milliseconds.
    #[arg(short, long, default_value_t = 1)]
    interval_ms: u64,

    /// Additional process basename to watch for.
    #[arg(short, long)]
    process_name: Vec<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("phasetap_monitor=info".parse()?))
        .init();

    let args = Args::parse();

    let raw_name = match args.shm_name {
        Some(name) => name,
        None => Settings::load_or_reset(&args.settings).shm_name,
    };
    let shm_name = sanitize_shm_name(&raw_name)?;

    let mut names: Vec<String> = IMAGE_NAMES.iter().map(|s| s.to_string()).collect();
    names.extend(args.process_name);

    info!("waiting for an instrumented process...");
    let pid = probe::find_pid(&names)?;
    let fd_path = probe::find_status_fd(pid, &shm_name)?;
    let status = probe::StatusByte::map(&fd_path)?;

    println!("load detection ready (pid {pid}).");

    let interval = Duration::from_millis(args.interval_ms.max(1));
    let mut previous = status.read();
    report(previous);

    loop {
        thread::sleep(interval);
        let current = status.read();
        if current == previous {
            continue;
        }
        previous = current;
        report(current);
        if current == Status::Finished as u8 {
            break;
        }
    }

    Ok(())
}

fn report(byte: u8) {
    match Status::from_byte(byte) {
        Some(Status::Resume) => println!("{}", "resume timer".green()),
        Some(Status::Pause) => println!("{}", "pause timer".yellow()),
        Some(Status::PauseMark) => println!("{}", "pause timer and mark boundary".cyan()),
        Some(Status::Finished) => println!("{}", "finished".magenta()),
        None => warn!(byte, "unknown status value, ignoring"),
    }
}
