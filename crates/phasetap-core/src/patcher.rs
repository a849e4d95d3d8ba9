//! Hot patching of the target image.
//!
//! Relaxes the image's protection to read+write, overwrites every injection
//! site with its control transfer, then restores read+execute. The whole
//! relax→patch→restore sequence runs synchronously inside the one-shot
//! load-time callback, before the host's entry point resumes, so the region
//! is never writable while host code executes it.

use tracing::{debug, warn};

use crate::codegen::SitePatch;
use crate::error::{Error, Result};
use crate::locator::TargetImage;
use crate::span::RawSpan;

fn protect(image: &TargetImage, prot: libc::c_int, step: &'static str) -> Result<()> {
    // SAFETY: the range was located as a live mapping of this process;
    // only its protection changes.
    let rc = unsafe {
        libc::mprotect(
            image.start as *mut libc::c_void,
            image.size(),
            prot,
        )
    };
    if rc != 0 {
        return Err(Error::ResourceFailure {
            step,
            errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
        });
    }
    Ok(())
}

/// Apply every patch inside one relax/restore window.
pub fn apply(image: &TargetImage, patches: &[SitePatch]) -> Result<()> {
    // SAFETY: the image was located as a live mapping; writes are bounds
    // checked against it and sequenced inside the writable window.
    let span = unsafe { RawSpan::new(image.start, image.size()) };

    protect(image, libc::PROT_READ | libc::PROT_WRITE, "mprotect(rw)")?;

    let mut result = Ok(());
    for patch in patches {
        debug!(
            address = format_args!("{:#x}", patch.address),
            len = patch.bytes.len(),
            "patching injection site"
        );
        result = span.write(patch.address, &patch.bytes);
        if result.is_err() {
            break;
        }
    }

    // Restore execute-only protection even when a write was rejected; a
    // leaked writable code region is worse than a failed arm.
    let restored = protect(image, libc::PROT_READ | libc::PROT_EXEC, "mprotect(rx)");
    if let Err(e) = &restored {
        warn!("failed to restore image protection: {e}");
    }
    result.and(restored)
}
