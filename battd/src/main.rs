//! batt coordinator daemon.
//!
//! Accepts HTTP build requests, routes them to connected workers over the
//! TCP control plane, and serves artifacts from the content-addressed cache.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, ensure};
use battd::cache::{Cache, UploadKey};
use battd::registry::Registry;
use battd::{AppContext, http_api, session};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "battd")]
#[command(author, version, about = "batt coordinator - distributed builds of command-line programs")]
struct Cli {
    /// Web listen address
    #[arg(long, default_value = ":8082")]
    web: String,

    /// Worker TCP listen address
    #[arg(long, default_value = ":9999")]
    tcp: String,

    /// Artifact cache directory
    #[arg(long, default_value = "/tmp")]
    cachedir: PathBuf,

    /// Base URL workers upload artifacts to
    #[arg(long, default_value = "http://gophorge.com")]
    baseurl: String,

    /// Path to the shared-secret file (default: $HOME/.batt-secret)
    #[arg(long)]
    secretfile: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let secret_path = cli
        .secretfile
        .clone()
        .unwrap_or_else(batt_common::secret::default_path);
    let secret = batt_common::secret::load(&secret_path)
        .with_context(|| format!("reading secret file {}", secret_path.display()))?;
    ensure!(
        !secret.is_empty(),
        "secret file {} is empty",
        secret_path.display()
    );

    let ctx = AppContext {
        registry: Arc::new(Registry::new()),
        cache: Cache::new(&cli.cachedir),
        upload_key: Arc::new(UploadKey::generate()),
        base_url: cli.baseurl.trim_end_matches('/').to_string(),
        secret,
    };

    let tcp_addr = listen_addr(&cli.tcp);
    let tcp_listener = TcpListener::bind(&tcp_addr)
        .await
        .with_context(|| format!("binding worker listener on {tcp_addr}"))?;
    info!(addr = %tcp_addr, "listening for worker connections");
    tokio::spawn(session::accept_workers(tcp_listener, ctx.clone()));

    let web_addr = listen_addr(&cli.web);
    let web_listener = TcpListener::bind(&web_addr)
        .await
        .with_context(|| format!("binding web listener on {web_addr}"))?;
    info!(addr = %web_addr, "listening for web requests");
    axum::serve(web_listener, http_api::create_router(ctx))
        .await
        .context("web server")?;
    Ok(())
}

/// Accept the `:8082` shorthand for "all interfaces".
fn listen_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}
