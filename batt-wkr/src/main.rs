//! batt worker agent.
//!
//! A resilient TCP client: dials the coordinator, authenticates with the
//! shared secret, serves build jobs, and redials with bounded backoff when
//! the connection dies.

#![forbid(unsafe_code)]

mod job;
mod session;
mod toolchain;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "batt-wkr")]
#[command(author, version, about = "batt worker agent - builds packages for the coordinator")]
struct Cli {
    /// Platforms this worker serves (e.g. "linux-amd64")
    #[arg(required = true)]
    platforms: Vec<String>,

    /// Coordinator address
    #[arg(long, default_value = "gophorge.com:9999")]
    server: String,

    /// Path to the shared-secret file (default: $HOME/.batt-secret)
    #[arg(long)]
    secretfile: Option<PathBuf>,

    /// Command run as `<toolchain> <package>` to fetch and build a package
    #[arg(long, default_value = "batt-toolchain")]
    toolchain: String,

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

    let config = session::Config {
        server: cli.server,
        secret,
        platforms: cli.platforms,
        toolchain: cli.toolchain,
    };

    let mut backoff = Backoff::new();
    loop {
        match session::connect(&config).await {
            Ok(live) => {
                backoff.reset();
                let reason = live.run().await;
                warn!(%reason, "session ended");
            }
            Err(err) => warn!("connect failed: {err:#}"),
        }
        let delay = backoff.next();
        info!(?delay, "reconnecting");
        tokio::time::sleep(delay).await;
    }
}

/// Bounded exponential reconnect delay: starts at 10s, doubles per
/// consecutive failure, capped at 120s, reset on a completed handshake.
struct Backoff {
    delay: Duration,
}

impl Backoff {
    const INITIAL: Duration = Duration::from_secs(10);
    const MAX: Duration = Duration::from_secs(120);

    fn new() -> Self {
        Self {
            delay: Self::INITIAL,
        }
    }

    fn reset(&mut self) {
        self.delay = Self::INITIAL;
    }

    fn next(&mut self) -> Duration {
        let delay = self.delay;
        self.delay = (delay * 2).min(Self::MAX);
        delay
    }
}
