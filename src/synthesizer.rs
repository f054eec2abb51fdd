//! Metadata synthesizer.
//!
//! Emits one Open Data Cube dataset document per local raster. Documents are
//! created once and left alone afterwards, so every dataset keeps the identity
//! it was first published with.

use crate::config::{Paths, Variant};
use crate::date::{DateExtractor, StemDateExtractor};
use crate::error::{HarvestError, Result};
use crate::models::{DatasetDescription, LocalAsset};
use crate::storage;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use walkdir::WalkDir;

/// Extension of description documents.
pub const DESCRIPTION_SUFFIX: &str = ".dataset.yaml";

/// A raster or description that could not be processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathFailure {
    pub path: PathBuf,
    pub reason: String,
}

/// Outcome of the `describe` stage.
#[derive(Debug, Default)]
pub struct DescribeReport {
    /// Rasters matching the variant prefix.
    pub scanned: usize,
    /// Documents created this run.
    pub written: Vec<PathBuf>,
    pub skipped_existing: usize,
    /// Documents rewritten under `force`.
    pub regenerated: usize,
    pub failures: Vec<PathFailure>,
}

enum Outcome {
    Written(PathBuf),
    Skipped,
    Regenerated,
}

/// Rasters under `root` named `{prefix}_*.tif` whose last `_` part is a
/// `YYYYMMDD` date, in path order.
///
/// Files with the prefix but no parseable date are returned as failures.
pub fn scan_assets(root: &Path, prefix: &str) -> (Vec<LocalAsset>, Vec<PathFailure>) {
    let mut assets = Vec::new();
    let mut failures = Vec::new();
    let lead = format!("{prefix}_");

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "Error accessing entry");
                continue;
            }
        };
        if !entry.file_type().is_file() || storage::is_staging(entry.path()) {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        let Some(stem) = name.strip_suffix(".tif") else {
            continue;
        };
        if !stem.starts_with(&lead) {
            continue;
        }
        let path = entry.path().to_path_buf();
        let Some(date) = StemDateExtractor.extract(stem) else {
            let err = HarvestError::DateToken {
                input: name.to_string(),
            };
            warn!(path = %path.display(), error = %err, "Skipping raster");
            failures.push(PathFailure {
                path,
                reason: err.to_string(),
            });
            continue;
        };
        let year = path
            .parent()
            .and_then(Path::file_name)
            .map(|y| y.to_string_lossy().into_owned())
            .unwrap_or_default();
        assets.push(LocalAsset {
            path,
            year,
            prefix: prefix.to_string(),
            date,
        });
    }
    (assets, failures)
}

/// `{root}/{year}/{stem}.tif` when the product has a measurement root,
/// otherwise the raster's local path.
pub fn measurement_path(variant: &Variant, asset: &LocalAsset) -> String {
    match &variant.product().measurement_root {
        Some(root) => format!(
            "{}/{}/{}.tif",
            root.trim_end_matches('/'),
            asset.year,
            asset.stem()
        ),
        None => asset.path.display().to_string(),
    }
}

async fn existing_id(path: &Path) -> Result<Uuid> {
    let text = fs::read_to_string(path)
        .await
        .map_err(|e| HarvestError::io(path, e))?;
    let doc: DatasetDescription =
        serde_yaml::from_str(&text).map_err(|source| HarvestError::Yaml {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(doc.id)
}

async fn describe_one(
    variant: &Variant,
    paths: &Paths,
    asset: &LocalAsset,
    force: bool,
) -> Result<Outcome> {
    let dir = paths.description_dir(&asset.year);
    fs::create_dir_all(&dir)
        .await
        .map_err(|e| HarvestError::io(&dir, e))?;
    let out = dir.join(format!("{}{DESCRIPTION_SUFFIX}", asset.stem()));

    let exists = storage::is_complete(&out).await?;
    if exists && !force {
        debug!(path = %out.display(), "Description already exists, skipping");
        return Ok(Outcome::Skipped);
    }
    let id = if exists {
        existing_id(&out).await?
    } else {
        Uuid::new_v4()
    };

    let measurement = measurement_path(variant, asset);
    let doc = DatasetDescription::new(id, variant.product(), asset.date, measurement);
    let yaml = serde_yaml::to_string(&doc).map_err(|source| HarvestError::Yaml {
        path: out.clone(),
        source,
    })?;
    storage::write_atomic(&out, yaml.as_bytes()).await?;

    if exists {
        info!(path = %out.display(), %id, "Description regenerated");
        Ok(Outcome::Regenerated)
    } else {
        info!(path = %out.display(), %id, "Created metadata");
        Ok(Outcome::Written(out))
    }
}

/// The `describe` stage: `files/{year}/` (or all of `files/`) →
/// `{output_root}/{year}/*.dataset.yaml`.
///
/// Rasters are handled one at a time in path order. A raster whose document
/// already exists is skipped unless `force` is set.
///
/// # Arguments
///
/// * `variant` - Selects the `{prefix}_` rasters and supplies the product grid
/// * `paths` - Source `files/` root and the description output root
/// * `year` - Restrict the scan to `files/{year}/`; `None` walks every year
/// * `force` - Rewrite existing documents, reusing the `id` recorded in each
///
/// # Returns
///
/// A [`DescribeReport`]. A missing input directory yields an empty report;
/// failing to create an output directory or place a document is stage-fatal.
///
/// # Example
///
/// ```ignore
/// let report = describe(&variant, &paths, Some(2024), false).await?;
/// info!(written = report.written.len(), "Described");
/// ```
#[instrument(level = "info", skip_all, fields(variant = %variant.name(), year = ?year, force))]
pub async fn describe(
    variant: &Variant,
    paths: &Paths,
    year: Option<i32>,
    force: bool,
) -> Result<DescribeReport> {
    let root = match year {
        Some(year) => paths.files_dir(year),
        None => paths.files_root(),
    };
    if !storage::is_complete(&root).await? {
        warn!(path = %root.display(), "Directory does not exist; nothing to describe");
        return Ok(DescribeReport::default());
    }

    let prefix = variant.prefix().to_string();
    let scan_root = root.clone();
    let (assets, failures) = tokio::task::spawn_blocking(move || scan_assets(&scan_root, &prefix))
        .await
        .map_err(|e| HarvestError::io(&root, std::io::Error::other(e)))?;
    info!(assets = assets.len(), undated = failures.len(), "Scanned rasters");

    let mut report = DescribeReport {
        scanned: assets.len() + failures.len(),
        failures,
        ..DescribeReport::default()
    };
    for asset in &assets {
        match describe_one(variant, paths, asset, force).await {
            Ok(Outcome::Written(path)) => report.written.push(path),
            Ok(Outcome::Skipped) => report.skipped_existing += 1,
            Ok(Outcome::Regenerated) => report.regenerated += 1,
            Err(e) if e.is_stage_fatal() => return Err(e),
            Err(e) => {
                warn!(path = %asset.path.display(), error = %e, "Skipping raster");
                report.failures.push(PathFailure {
                    path: asset.path.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }
    Ok(report)
}
