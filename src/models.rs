//! Data models flowing between the pipeline stages.
//!
//! - [`RemoteAsset`]: a link found while crawling, discarded once the manifest is written
//! - [`LocalAsset`]: a raster placed at its deterministic path
//! - [`DatasetDescription`]: the Open Data Cube dataset document for one local asset

use crate::config::ProductSpec;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

/// Schema marker for Open Data Cube dataset documents.
pub const DATASET_SCHEMA: &str = "https://schemas.opendatacube.org/dataset";

/// A remote file discovered in a listing page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAsset {
    pub url: String,
    /// Capture date inferred from the URL, when the variant pattern matches.
    pub date: Option<NaiveDate>,
    pub variant: String,
}

/// A raster on disk named `{prefix}_{YYYYMMDD}.tif`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAsset {
    pub path: PathBuf,
    /// Year directory the asset was found in.
    pub year: String,
    pub prefix: String,
    pub date: NaiveDate,
}

impl LocalAsset {
    /// File stem shared by the raster and its description, e.g. `imerg_l_20240101`.
    ///
    /// Taken from the file on disk, so rasters with extra name parts keep them.
    pub fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}_{}", self.prefix, crate::date::token(self.date)))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ProductRef {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Grid {
    /// `[rows, cols]`
    pub shape: [u32; 2],
    pub transform: [f64; 6],
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Properties {
    /// Capture day at midnight UTC, `YYYY-MM-DDT00:00:00Z`.
    pub datetime: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Measurement {
    pub path: String,
}

/// Open Data Cube dataset document.
///
/// Written once per local asset and never modified afterwards; the `id` is
/// minted when the document is first created.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DatasetDescription {
    #[serde(rename = "$schema")]
    pub schema: String,
    pub id: Uuid,
    pub product: ProductRef,
    pub crs: String,
    pub grids: BTreeMap<String, Grid>,
    pub properties: Properties,
    pub measurements: BTreeMap<String, Measurement>,
}

impl DatasetDescription {
    /// Build the document for a capture date under a fixed product grid.
    pub fn new(id: Uuid, product: &ProductSpec, date: NaiveDate, measurement_path: String) -> Self {
        let grid = Grid {
            shape: product.shape,
            transform: product.transform,
        };
        Self {
            schema: DATASET_SCHEMA.to_string(),
            id,
            product: ProductRef {
                name: product.name.clone(),
            },
            crs: product.crs.clone(),
            grids: BTreeMap::from([("default".to_string(), grid)]),
            properties: Properties {
                datetime: midnight_utc(date),
            },
            measurements: BTreeMap::from([(
                product.measurement.clone(),
                Measurement {
                    path: measurement_path,
                },
            )]),
        }
    }
}

/// ISO-8601 timestamp of midnight UTC on `date`.
pub fn midnight_utc(date: NaiveDate) -> String {
    date.and_time(chrono::NaiveTime::MIN)
        .and_utc()
        .format("%Y-%m-%dT%H:%M:%SZ")
        .to_string()
}
