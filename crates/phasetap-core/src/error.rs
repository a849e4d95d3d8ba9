use thiserror::Error;

use crate::signature::SignatureId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("target image not found in memory map listing")]
    NotFound,

    #[error("no match for signature {0}: the target binary revision may have changed")]
    PatternNotFound(SignatureId),

    #[error("duplicate match for signature {0}: the target binary revision may have changed")]
    DuplicatePattern(SignatureId),

    #[error("{step} failed with errno {errno}")]
    ResourceFailure { step: &'static str, errno: i32 },

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("access of {len} bytes at {address:#x} is outside the span bounds")]
    OutOfBounds { address: u64, len: usize },

    #[error("engine is in state {0}, arming is attempted exactly once")]
    BadPhase(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this failure points at a binary-revision mismatch rather than
    /// a broken environment.
    pub fn is_revision_mismatch(&self) -> bool {
        matches!(
            self,
            Error::NotFound | Error::PatternNotFound(_) | Error::DuplicatePattern(_)
        )
    }
}
