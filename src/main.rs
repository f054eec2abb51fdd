//! # IMERG Harvest
//!
//! Acquisition pipeline for daily IMERG precipitation rasters. It crawls the
//! remote directory listings, downloads (and unpacks) the daily rasters, and
//! writes an Open Data Cube dataset document for each of them.
//!
//! ## Usage
//!
//! ```sh
//! imerg_harvest discover 2024
//! imerg_harvest fetch 2024 1
//! imerg_harvest describe 2024
//! ```
//!
//! ## Architecture
//!
//! Three independent stages that talk only through the filesystem:
//! 1. **Discover**: crawl listings into the manifest `urls/{year}.txt`
//! 2. **Fetch**: download every manifest entry to `files/{year}/{prefix}_{YYYYMMDD}.tif`
//! 3. **Describe**: emit `{output_root}/{year}/{prefix}_{YYYYMMDD}.dataset.yaml`
//!
//! Each stage skips work whose output already exists, so re-running a stage
//! resumes it.

use clap::Parser;
use std::error::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod cli;
mod config;
mod crawler;
mod date;
mod error;
mod extract;
mod fetcher;
mod manifest;
mod models;
mod pipeline;
mod storage;
mod synthesizer;
mod transport;

use cli::Cli;

#[tokio::main]
#[instrument]
async fn main() -> Result<(), Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let start_time = std::time::Instant::now();
    let args = Cli::parse();
    info!(
        command = ?args.command,
        variant = %args.variant,
        root = %args.root.display(),
        "Starting"
    );

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing in-flight work");
            on_signal.cancel();
        }
    });

    if let Err(e) = pipeline::run(&args, cancel).await {
        error!(error = %e, "Stage failed");
        return Err(e.into());
    }

    let elapsed = start_time.elapsed();
    info!(
        ?elapsed,
        secs = elapsed.as_secs(),
        millis = elapsed.subsec_millis(),
        "Execution complete"
    );

    Ok(())
}
