//! Content-addressed artifact cache and upload-URL signing.
//!
//! A cache entry is a file named `<sha1>.battd` whose contents hash to that
//! SHA-1. Entries are created only by the `/accept` ingest path after full
//! verification, written to a temp file and renamed into place so a reader
//! opening by path never observes a truncated entry.

use std::io::Write;
use std::path::PathBuf;

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;
use tokio::fs::File;
use tracing::warn;

/// Suffix for cache entries.
pub const CACHE_SUFFIX: &str = ".battd";

/// Largest accepted artifact (32 MiB).
pub const MAX_BINARY_SIZE: u64 = 32 << 20;

/// True for a lowercase hex SHA-1.
pub fn is_valid_sha1(s: &str) -> bool {
    s.len() == 40
        && s.bytes()
            .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

#[derive(Debug, Clone)]
pub struct Cache {
    dir: PathBuf,
}

impl Cache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn entry_path(&self, sha1: &str) -> PathBuf {
        self.dir.join(format!("{sha1}{CACHE_SUFFIX}"))
    }

    /// Open the entry for `sha1`, if present.
    pub async fn open(&self, sha1: &str) -> Option<File> {
        if !is_valid_sha1(sha1) {
            return None;
        }
        File::open(self.entry_path(sha1)).await.ok()
    }

    /// Write a fully verified artifact. Identical hashes are idempotent
    /// overwrites.
    pub async fn store(&self, sha1: &str, bytes: Vec<u8>) -> std::io::Result<()> {
        let dir = self.dir.clone();
        let path = self.entry_path(sha1);
        tokio::task::spawn_blocking(move || {
            let mut tmp = tempfile::Builder::new()
                .prefix(".ingest-")
                .tempfile_in(&dir)?;
            tmp.write_all(&bytes)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                tmp.as_file()
                    .set_permissions(std::fs::Permissions::from_mode(0o644))?;
            }
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .unwrap_or_else(|join_err| {
            warn!(%join_err, "cache write task failed");
            Err(std::io::Error::other("cache write task failed"))
        })
    }
}

/// Key signing one-shot upload URLs: 128 random bytes generated at startup
/// and held only in memory, distinct from the shared worker secret.
pub struct UploadKey {
    mac: Hmac<Sha1>,
}

impl Default for UploadKey {
    fn default() -> Self {
        Self::generate()
    }
}

impl UploadKey {
    pub fn generate() -> Self {
        let mut key = [0u8; 128];
        rand::thread_rng().fill_bytes(&mut key);
        // HMAC accepts keys of any length.
        let mac = Hmac::<Sha1>::new_from_slice(&key).expect("hmac key length");
        Self { mac }
    }

    /// Hex HMAC-SHA1 of `sha1`, embedded in upload URLs as `k`.
    pub fn sign(&self, sha1: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(sha1.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Constant-time check of a presented `k` against `sha1`.
    pub fn verify(&self, sha1: &str, presented: &str) -> bool {
        let Ok(presented) = hex::decode(presented) else {
            return false;
        };
        let mut mac = self.mac.clone();
        mac.update(sha1.as_bytes());
        mac.verify_slice(&presented).is_ok()
    }
}
