//! Trampoline page allocation.
//!
//! One anonymous memfd-backed mapping holds the generated stubs, the
//! relocated string slot and the named-entry table. The backing file is
//! sealed against resize and reseal immediately after mapping, so nothing
//! in or outside the process can later grow or shrink the trampoline. The
//! mapping is shared so an external observer can reach the status byte
//! through `/proc/<pid>/fd`.

use std::io;

use tracing::debug;

use crate::error::{Error, Result};
use crate::span::RawSpan;
use crate::status;

fn resource_error(step: &'static str) -> Error {
    Error::ResourceFailure {
        step,
        errno: io::Error::last_os_error().raw_os_error().unwrap_or(0),
    }
}

/// The sealed, executable trampoline mapping. Exclusively owned by the
/// lifecycle controller for the process lifetime; dropping it stores the
/// terminal status sentinel and releases the mapping and the memfd.
#[derive(Debug)]
pub struct TrampolinePage {
    fd: libc::c_int,
    addr: u64,
    size: usize,
}

impl TrampolinePage {
    /// Create, size, map and seal the page. Any failing step aborts the
    /// whole arm sequence; nothing partially arms.
    pub fn allocate(name: &str, size: usize) -> Result<TrampolinePage> {
        let c_name = std::ffi::CString::new(name)
            .map_err(|_| Error::ConfigInvalid("shared memory name contains NUL".into()))?;

        // SAFETY: plain syscalls; every result is checked before use and
        // acquired resources are released on the failure paths.
        unsafe {
            let fd = libc::memfd_create(c_name.as_ptr(), libc::MFD_ALLOW_SEALING);
            if fd == -1 {
                return Err(resource_error("memfd_create"));
            }

            if libc::ftruncate(fd, size as libc::off_t) == -1 {
                let err = resource_error("ftruncate");
                libc::close(fd);
                return Err(err);
            }

            let addr = libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_SHARED,
                fd,
                0,
            );
            if addr == libc::MAP_FAILED {
                let err = resource_error("mmap");
                libc::close(fd);
                return Err(err);
            }

            let seals = libc::F_SEAL_SEAL
                | libc::F_SEAL_SHRINK
                | libc::F_SEAL_GROW
                | libc::F_SEAL_FUTURE_WRITE;
            if libc::fcntl(fd, libc::F_ADD_SEALS, seals) == -1 {
                let err = resource_error("fcntl(F_ADD_SEALS)");
                libc::munmap(addr, size);
                libc::close(fd);
                return Err(err);
            }

            debug!(
                name,
                size,
                addr = format_args!("{:#x}", addr as u64),
                "trampoline page allocated and sealed"
            );
            Ok(TrampolinePage {
                fd,
                addr: addr as u64,
                size,
            })
        }
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn span(&self) -> RawSpan {
        // SAFETY: the mapping stays alive for as long as self does.
        unsafe { RawSpan::new(self.addr, self.size) }
    }

    /// Read the status byte back; used by the lifecycle tests.
    pub fn status_byte(&self) -> u8 {
        self.span().as_slice()[0]
    }
}

impl Drop for TrampolinePage {
    fn drop(&mut self) {
        // SAFETY: addr/size describe the mapping created in allocate, and
        // the status byte is its first byte.
        unsafe {
            status::store_terminal(self.addr as *mut u8);
            libc::munmap(self.addr as *mut libc::c_void, self.size);
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_write_execute_lifecycle() {
        let page = TrampolinePage::allocate("phasetap-test", 4096).unwrap();
        assert_eq!(page.size(), 4096);
        assert_eq!(page.status_byte(), 0);

        page.span().write(page.addr() + 1, &[0xc3]).unwrap();
        assert_eq!(page.span().as_slice()[1], 0xc3);
    }

    #[test]
    fn test_page_is_sealed_against_resize() {
        let page = TrampolinePage::allocate("phasetap-test-seal", 4096).unwrap();
        // SAFETY: shrinking a sealed memfd must fail; only the return
        // value is observed.
        let rc = unsafe { libc::ftruncate(page.fd, 1024) };
        assert_eq!(rc, -1);
    }

    #[test]
    fn test_invalid_name_is_config_error() {
        assert!(matches!(
            TrampolinePage::allocate("bad\0name", 4096),
            Err(Error::ConfigInvalid(_))
        ));
    }
}
