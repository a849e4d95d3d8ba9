//! Engine configuration.
//!
//! Settings come from a small JSON file next to the host's working
//! directory; the cue-name list is a plain newline-delimited text file
//! maintained by hand. A missing or malformed settings file is rewritten
//! with defaults rather than failing; the host must keep launching even
//! when the tool's own files are broken.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Built-in allow-list of target binary names. One exact revision of each
/// is supported per address width; the signature tables are tied to it.
#[cfg(target_pointer_width = "64")]
pub const IMAGE_NAMES: &[&str] = &["Amnesia_NOSTEAM.bin.x86_64", "Amnesia.bin.x86_64"];

#[cfg(target_pointer_width = "32")]
pub const IMAGE_NAMES: &[&str] = &["Amnesia_NOSTEAM.bin.x86", "Amnesia.bin.x86"];

/// memfd names are limited to 249 bytes, excluding the NUL.
const SHM_NAME_MAX: usize = 249;

/// How the iteration stub treats configured cues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CuePolicy {
    /// Stop every cue unconditionally.
    Skip,
    /// Let cues play, yielding one quantum at a time until none is active.
    Wait,
}

/// On-disk settings, user-edited.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub skip_cues: bool,
    pub delay_cues: bool,
    pub delay_files: bool,
    pub shm_name: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            skip_cues: false,
            delay_cues: true,
            delay_files: false,
            shm_name: "phasetap-status".to_string(),
        }
    }
}

impl Settings {
    /// The cue policy these settings select, if any. Skip wins when both
    /// toggles are set.
    pub fn cue_policy(&self) -> Option<CuePolicy> {
        if self.skip_cues {
            Some(CuePolicy::Skip)
        } else if self.delay_cues {
            Some(CuePolicy::Wait)
        } else {
            None
        }
    }

    /// Load settings, rewriting the file with defaults when it is missing
    /// or malformed. Never fails; the defaults are logged instead.
    pub fn load_or_reset<P: AsRef<Path>>(path: P) -> Settings {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<Settings>(&content) {
                Ok(settings) => {
                    debug!(path = %path.display(), "loaded settings");
                    settings
                }
                Err(e) => {
                    warn!(path = %path.display(), "malformed settings ({e}), resetting to defaults");
                    Self::reset(path)
                }
            },
            Err(e) => {
                warn!(path = %path.display(), "settings unreadable ({e}), resetting to defaults");
                Self::reset(path)
            }
        }
    }

    fn reset(path: &Path) -> Settings {
        let settings = Settings::default();
        match serde_json::to_string_pretty(&settings) {
            Ok(content) => {
                if let Err(e) = fs::write(path, content) {
                    warn!(path = %path.display(), "could not rewrite settings: {e}");
                }
            }
            Err(e) => warn!("could not serialize default settings: {e}"),
        }
        settings
    }
}

/// Sanitize a shared-memory name the way the observer will look it up:
/// alphanumerics, dashes and underscores only, bounded by the memfd limit.
pub fn sanitize_shm_name(raw: &str) -> Result<String> {
    let name: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if name.is_empty() {
        return Err(Error::ConfigInvalid(
            "shared memory name is empty after sanitizing".into(),
        ));
    }
    if name.len() > SHM_NAME_MAX {
        return Err(Error::ConfigInvalid(format!(
            "shared memory name must be at most {SHM_NAME_MAX} characters"
        )));
    }
    Ok(name)
}

/// Read the cue-name list: one name per line, CR tolerated, blank lines
/// skipped. An empty result is legal: the caller downgrades the cue
/// policy instead of failing.
pub fn read_cue_names<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let content = fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// Everything the engine needs to arm.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub shm_name: String,
    pub policy: Option<CuePolicy>,
    pub cue_names: Vec<String>,
    pub image_names: Vec<String>,
}

impl EngineConfig {
    pub fn from_settings(settings: &Settings, cue_names: Vec<String>) -> Result<EngineConfig> {
        Ok(EngineConfig {
            shm_name: sanitize_shm_name(&settings.shm_name)?,
            policy: settings.cue_policy(),
            cue_names,
            image_names: IMAGE_NAMES.iter().map(|s| s.to_string()).collect(),
        })
    }
}
