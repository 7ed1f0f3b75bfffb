//! The opaque fetch-and-build boundary.
//!
//! The worker does not know how to build anything itself; it runs the
//! configured toolchain command as `<cmd> <package>` inside an isolated
//! workspace root and expects the finished binary to land under
//! `<root>/bin`. The environment contract:
//!
//! - `WORKSPACE` points at the isolated root; any inherited value is
//!   replaced so the shared toolchain workspace can never leak in.
//! - For platforms of the form `<os>-<arch>`, `os` and `arch` are set for
//!   the toolchain; inherited values are stripped first.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::process::Command;

/// Cap on how much toolchain output travels back in a `result` error, so a
/// pathological build log cannot blow the wire record limit.
const MAX_OUTPUT: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum ToolchainError {
    #[error("fetch-and-build {status}\n{output}")]
    Failed {
        status: std::process::ExitStatus,
        output: String,
    },
    #[error("couldn't find file")]
    NoBinary,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Run the toolchain for `package` targeting `platform` in `root`.
pub async fn fetch_and_build(
    cmd: &str,
    package: &str,
    platform: &str,
    root: &Path,
) -> Result<(), ToolchainError> {
    let mut command = Command::new(cmd);
    command
        .arg(package)
        .current_dir(root)
        .env_remove("WORKSPACE")
        .env_remove("os")
        .env_remove("arch")
        .env("WORKSPACE", root);
    if let Some((os, arch)) = platform.split_once('-') {
        command.env("os", os).env("arch", arch);
    }

    let output = command.output().await?;
    if !output.status.success() {
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        if combined.len() > MAX_OUTPUT {
            let mut end = MAX_OUTPUT;
            while !combined.is_char_boundary(end) {
                end -= 1;
            }
            combined.truncate(end);
        }
        return Err(ToolchainError::Failed {
            status: output.status,
            output: combined,
        });
    }
    Ok(())
}

/// First regular file under `dir`, walking subdirectories in sorted order.
pub fn find_binary(dir: &Path) -> Result<PathBuf, ToolchainError> {
    first_file(dir)?.ok_or(ToolchainError::NoBinary)
}

fn first_file(dir: &Path) -> std::io::Result<Option<PathBuf>> {
    let mut entries: Vec<_> = match std::fs::read_dir(dir) {
        Ok(entries) => entries.collect::<std::io::Result<_>>()?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let file_type = entry.file_type()?;
        if file_type.is_file() {
            return Ok(Some(entry.path()));
        }
        if file_type.is_dir()
            && let Some(found) = first_file(&entry.path())?
        {
            return Ok(Some(found));
        }
    }
    Ok(None)
}
