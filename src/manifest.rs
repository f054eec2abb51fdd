//! Per-year URL manifests (`urls/{year}.txt`).
//!
//! A manifest is UTF-8 text with one absolute URL per line, sorted and free of
//! duplicates. Each crawl replaces the file wholesale.

use crate::error::{HarvestError, Result};
use crate::storage;
use itertools::Itertools;
use std::path::Path;
use tokio::fs;
use tracing::{info, instrument};

/// Sort and deduplicate URLs into manifest order.
pub fn normalize<I>(urls: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    urls.into_iter()
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
        .sorted()
        .dedup()
        .collect()
}

/// Render URLs exactly as they are stored on disk.
pub fn render(urls: &[String]) -> String {
    urls.iter().map(|u| format!("{u}\n")).collect()
}

/// Replace the manifest at `path` with `urls`.
#[instrument(level = "info", skip_all, fields(path = %path.display(), count = urls.len()))]
pub async fn write_manifest(path: &Path, urls: &[String]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| HarvestError::io(parent, e))?;
    }
    storage::write_atomic(path, render(urls).as_bytes()).await?;
    info!("Manifest written");
    Ok(())
}

/// Read a manifest. A missing file is a stage-fatal [`HarvestError::ManifestMissing`].
#[instrument(level = "info", skip_all, fields(path = %path.display()))]
pub async fn read_manifest(path: &Path) -> Result<Vec<String>> {
    let text = match fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(HarvestError::ManifestMissing(path.to_path_buf()));
        }
        Err(e) => return Err(HarvestError::io(path, e)),
    };
    let urls: Vec<String> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    info!(count = urls.len(), "Manifest read");
    Ok(urls)
}

/// The path segment identifying a month in listing URLs: `/{year}/{MM}/`.
pub fn month_segment(year: i32, month: u32) -> String {
    format!("/{year:04}/{month:02}/")
}

/// Keep only the URLs whose path encodes `year`/`month`.
pub fn filter_month(urls: Vec<String>, year: i32, month: u32) -> Vec<String> {
    let segment = month_segment(year, month);
    urls.into_iter().filter(|u| u.contains(&segment)).collect()
}
