//! batt coordinator library.
//!
//! The coordinator accepts HTTP build requests, routes each one to a
//! connected worker that advertises the requested platform, ingests the
//! resulting binary by content hash, caches it on disk, and streams it back
//! to the waiting HTTP client.

#![forbid(unsafe_code)]

pub mod cache;
pub mod http_api;
pub mod registry;
pub mod session;

use std::sync::Arc;

use cache::{Cache, UploadKey};
use registry::Registry;

/// Shared coordinator context handed to every session and HTTP handler.
#[derive(Clone)]
pub struct AppContext {
    /// Platform registry and SHA-1 subscription table.
    pub registry: Arc<Registry>,
    /// Content-addressed artifact cache.
    pub cache: Cache,
    /// In-memory key signing one-shot upload URLs.
    pub upload_key: Arc<UploadKey>,
    /// Base URL advertised to workers for artifact uploads.
    pub base_url: String,
    /// Shared secret workers authenticate with.
    pub secret: String,
}
