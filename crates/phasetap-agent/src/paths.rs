//! Configuration file locations.
//!
//! Both files live in the host's working directory by default, next to the
//! game binary the way its other tool files do; environment variables
//! override them for testing and packaging.

use std::env;
use std::path::PathBuf;

const SETTINGS_FILE: &str = "phasetap.json";
const CUE_LIST_FILE: &str = "flashback_names.txt";

pub fn settings_path() -> PathBuf {
    env::var_os("PHASETAP_SETTINGS")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(SETTINGS_FILE))
}

pub fn cue_list_path() -> PathBuf {
    env::var_os("PHASETAP_CUES")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(CUE_LIST_FILE))
}
