//! Crash-safe placement of pipeline artifacts.
//!
//! Every stage treats "the final path exists" as "the work is done". To keep
//! that true across crashes, artifacts are written to a hidden staging file in
//! the same directory, flushed to disk, and only then renamed into place.

use crate::error::{HarvestError, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

/// Suffix of in-progress staging files.
pub const STAGING_SUFFIX: &str = ".part";

/// Staging path next to `dest`: `dir/.{name}.part`.
pub fn staging_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(".{name}{STAGING_SUFFIX}"))
}

/// Whether `path` names a staging file.
pub fn is_staging(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy())
        .is_some_and(|n| n.starts_with('.') && n.ends_with(STAGING_SUFFIX))
}

/// Whether a completed artifact exists at `path`.
pub async fn is_complete(path: &Path) -> Result<bool> {
    fs::try_exists(path)
        .await
        .map_err(|e| HarvestError::io(path, e))
}

/// Write `bytes` to `dest` through a staging file and an atomic rename.
///
/// On failure the staging file is removed and `dest` is left untouched.
#[instrument(level = "debug", skip_all, fields(dest = %dest.display(), bytes = bytes.len()))]
pub async fn write_atomic(dest: &Path, bytes: &[u8]) -> Result<()> {
    let staging = staging_path(dest);
    if let Err(e) = write_and_sync(&staging, bytes).await {
        let _ = fs::remove_file(&staging).await;
        return Err(e);
    }
    if let Err(e) = fs::rename(&staging, dest).await {
        let _ = fs::remove_file(&staging).await;
        return Err(HarvestError::io(dest, e));
    }
    debug!("Placed artifact");
    Ok(())
}

async fn write_and_sync(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = fs::File::create(path)
        .await
        .map_err(|e| HarvestError::io(path, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| HarvestError::io(path, e))?;
    file.sync_all()
        .await
        .map_err(|e| HarvestError::io(path, e))?;
    Ok(())
}

/// Create `dir` if needed and prove it is writable with a probe file.
#[instrument(level = "info", skip_all, fields(path = %dir.display()))]
pub async fn ensure_writable_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .await
        .map_err(|e| HarvestError::io(dir, e))?;
    let probe = dir.join("..__probe_write__");
    fs::write(&probe, b"")
        .await
        .map_err(|e| HarvestError::io(&probe, e))?;
    if let Err(e) = fs::remove_file(&probe).await {
        warn!(error = %e, "Could not remove write probe");
    }
    info!("Directory is writable");
    Ok(())
}

/// Remove staging files left behind by an interrupted run.
pub async fn sweep_staging(dir: &Path) -> Result<usize> {
    let mut removed = 0;
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(HarvestError::io(dir, e)),
    };
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| HarvestError::io(dir, e))?
    {
        let path = entry.path();
        if is_staging(&path) {
            fs::remove_file(&path)
                .await
                .map_err(|e| HarvestError::io(&path, e))?;
            removed += 1;
        }
    }
    if removed > 0 {
        info!(removed, dir = %dir.display(), "Removed stale staging files");
    }
    Ok(removed)
}
