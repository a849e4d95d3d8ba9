//! Host-process and status-byte discovery.
//!
//! Finds the instrumented process by command-line basename, then walks its
//! `/proc/<pid>/fd` directory for the link to the named, sealed memfd and
//! maps its first byte read-only.

use std::fs;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::debug;

/// Find the PID whose command basename matches one of `names`.
pub fn find_pid<S: AsRef<str>>(names: &[S]) -> Result<u32> {
    for entry in fs::read_dir("/proc").context("opening /proc")? {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|s| s.parse::<u32>().ok())
        else {
            continue;
        };
        let Ok(cmdline) = fs::read(entry.path().join("cmdline")) else {
            continue;
        };
        // argv[0] up to the first NUL.
        let argv0 = cmdline.split(|&b| b == 0).next().unwrap_or_default();
        let Ok(argv0) = std::str::from_utf8(argv0) else {
            continue;
        };
        let basename = argv0.rsplit('/').next().unwrap_or_default();
        if names.iter().any(|n| n.as_ref() == basename) {
            debug!(pid, argv0, "found instrumented process");
            return Ok(pid);
        }
    }
    bail!("no running process matches the configured binary names")
}

/// Find the unique fd of `pid` backed by the memfd named `shm_name`.
///
/// Exactly one is required: more than one means the name collides with
/// something else in the process, and guessing would attach the observer
/// to the wrong byte.
pub fn find_status_fd(pid: u32, shm_name: &str) -> Result<PathBuf> {
    let wanted = format!("/memfd:{shm_name}");
    let deleted = format!("{wanted} (deleted)");
    let fd_dir = format!("/proc/{pid}/fd");

    let mut found: Option<PathBuf> = None;
    for entry in fs::read_dir(&fd_dir).with_context(|| format!("opening {fd_dir}"))? {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        let Ok(link) = fs::read_link(entry.path()) else {
            continue;
        };
        let link = link.to_string_lossy();
        if link == wanted || link == deleted {
            if found.is_some() {
                bail!(
                    "shared memory name '{shm_name}' is not unique in process {pid}; \
                     choose a different name and relaunch"
                );
            }
            found = Some(entry.path());
        }
    }
    found.ok_or_else(|| {
        anyhow::anyhow!("process {pid} has no shared memory named '{shm_name}' (not armed?)")
    })
}

/// A read-only, one-byte mapping of the engine's status byte.
pub struct StatusByte {
    addr: *const u8,
    locked: bool,
}

impl StatusByte {
    pub fn map<P: AsRef<Path>>(fd_path: P) -> Result<StatusByte> {
        let file = fs::File::open(fd_path.as_ref())
            .with_context(|| format!("opening {}", fd_path.as_ref().display()))?;
        // SAFETY: mapping one shared readable byte; the fd may be dropped
        // afterwards, the mapping keeps the file alive.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                1,
                libc::PROT_READ,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            bail!(
                "mapping the status byte failed: {}",
                std::io::Error::last_os_error()
            );
        }
        // Keep the byte resident so polling never faults; best effort.
        // SAFETY: locking the byte just mapped.
        let locked = unsafe { libc::mlock(addr, 1) } == 0;
        Ok(StatusByte {
            addr: addr as *const u8,
            locked,
        })
    }

    pub fn read(&self) -> u8 {
        // SAFETY: one-byte mapping held for the struct's lifetime.
        unsafe { self.addr.read_volatile() }
    }
}

impl Drop for StatusByte {
    fn drop(&mut self) {
        // SAFETY: releasing the mapping created in map.
        unsafe {
            if self.locked {
                libc::munlock(self.addr as *const libc::c_void, 1);
            }
            libc::munmap(self.addr as *mut libc::c_void, 1);
        }
    }
}
