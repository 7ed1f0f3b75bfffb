//! Shared-secret file loading.
//!
//! Workers authenticate to the coordinator with a symmetric secret read from
//! a trusted file: a single UTF-8 line, surrounding whitespace ignored.

use std::io;
use std::path::{Path, PathBuf};

/// Default secret file location, `$HOME/.batt-secret`.
pub fn default_path() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".batt-secret")
}

/// Read and trim the secret file.
pub fn load(path: &Path) -> io::Result<String> {
    let raw = std::fs::read_to_string(path)?;
    Ok(raw.trim().to_string())
}
