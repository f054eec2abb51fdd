//! Variant catalog and runtime settings.
//!
//! A *variant* is one IMERG product family: where its listings live, which
//! links in a listing are wanted, how a capture date is read from a URL, and
//! which grid the resulting rasters sit on. Three variants are built in; a YAML
//! file passed with `--config` can add variants or replace built-ins by name:
//!
//! ```yaml
//! variants:
//!   - name: imerg_l
//!     prefix: imerg_l
//!     listing: https://example.org/imerg/gis/{year}/{month}/
//!     layout: monthly
//!     filter: { suffix: ".zip", contains: "3B-DAY-L" }
//!     date_pattern: '\.(\d{8})\.V\d{2}'
//!     member: liquid.tif
//!     product:
//!       name: imerg_l_10KM_daily
//!       crs: "EPSG:4326"
//!       shape: [1800, 3600]
//!       transform: [0.1, 0.0, -180.0, 0.0, -0.1, 90.0]
//!       measurement: Precipitation
//!       measurement_root: /STORAGE/DATA/DATA_10KM_daily/imerg_l
//! ```

use crate::date::{self, RegexDateExtractor};
use crate::error::{HarvestError, Result};
use chrono::NaiveDate;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};
use url::Url;

/// How a variant's remote directory tree is organised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    /// One listing per month: `{year}/{month}/`.
    Monthly,
    /// One listing per calendar day: `{year}/{month}/{day}/...`.
    Daily,
}

/// Which anchors in a listing page are assets of this variant.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LinkFilter {
    /// Required file suffix, e.g. `.1day.tif`.
    pub suffix: String,
    /// Substring distinguishing the wanted product from its siblings.
    #[serde(default)]
    pub contains: String,
}

impl LinkFilter {
    pub fn matches(&self, href: &str) -> bool {
        href.ends_with(&self.suffix) && href.contains(&self.contains)
    }
}

/// Constant product metadata written into every description document.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ProductSpec {
    pub name: String,
    pub crs: String,
    /// Grid shape as `[rows, cols]`.
    pub shape: [u32; 2],
    /// Affine transform `[a, b, c, d, e, f]`.
    pub transform: [f64; 6],
    /// Measurement (band) name.
    pub measurement: String,
    /// Root used for measurement paths. When absent the local asset path is used.
    #[serde(default)]
    pub measurement_root: Option<String>,
}

/// A variant as written in configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct VariantSpec {
    pub name: String,
    /// Prefix of local filenames, `{prefix}_{YYYYMMDD}.tif`.
    pub prefix: String,
    /// Listing URL template with `{year}`, `{month}` and, for daily layouts, `{day}`.
    pub listing: String,
    pub layout: Layout,
    pub filter: LinkFilter,
    /// Regex whose first capture group is the `YYYYMMDD` token.
    pub date_pattern: String,
    /// Identifier of the member to extract when the asset arrives zipped.
    #[serde(default)]
    pub member: Option<String>,
    pub product: ProductSpec,
}

#[derive(Debug, Deserialize)]
struct VariantFile {
    variants: Vec<VariantSpec>,
}

/// A validated variant ready for use by the stages.
#[derive(Debug, Clone)]
pub struct Variant {
    pub spec: VariantSpec,
    extractor: RegexDateExtractor,
}

impl Variant {
    /// Validate `spec` and compile its date pattern.
    pub fn from_spec(spec: VariantSpec) -> Result<Self> {
        let has_day = spec.listing.contains("{day}");
        if !spec.listing.contains("{year}") || !spec.listing.contains("{month}") {
            return Err(HarvestError::Config(format!(
                "listing template for {} must contain {{year}} and {{month}}",
                spec.name
            )));
        }
        match (spec.layout, has_day) {
            (Layout::Daily, false) => {
                return Err(HarvestError::Config(format!(
                    "daily layout for {} needs a {{day}} placeholder",
                    spec.name
                )));
            }
            (Layout::Monthly, true) => {
                return Err(HarvestError::Config(format!(
                    "monthly layout for {} must not use {{day}}",
                    spec.name
                )));
            }
            _ => {}
        }
        if !spec.listing.ends_with('/') {
            return Err(HarvestError::Config(format!(
                "listing template for {} must end with '/'",
                spec.name
            )));
        }
        if spec.prefix.is_empty() || spec.prefix.contains(['/', '\\']) {
            return Err(HarvestError::Config(format!(
                "invalid filename prefix '{}'",
                spec.prefix
            )));
        }
        let extractor = RegexDateExtractor::new(&spec.date_pattern)?;
        Ok(Self { spec, extractor })
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn prefix(&self) -> &str {
        &self.spec.prefix
    }

    pub fn layout(&self) -> Layout {
        self.spec.layout
    }

    pub fn filter(&self) -> &LinkFilter {
        &self.spec.filter
    }

    pub fn member(&self) -> Option<&str> {
        self.spec.member.as_deref()
    }

    pub fn product(&self) -> &ProductSpec {
        &self.spec.product
    }

    /// The date extractor selected for this variant.
    pub fn extractor(&self) -> &RegexDateExtractor {
        &self.extractor
    }

    /// Listing page for a month, or a day when `day` is given.
    pub fn listing_url(&self, year: i32, month: u32, day: Option<u32>) -> Result<Url> {
        let mut raw = self
            .spec
            .listing
            .replace("{year}", &format!("{year:04}"))
            .replace("{month}", &format!("{month:02}"));
        if let Some(day) = day {
            raw = raw.replace("{day}", &format!("{day:02}"));
        }
        Url::parse(&raw).map_err(|e| HarvestError::Config(format!("bad listing URL {raw}: {e}")))
    }

    /// Local raster filename for a capture date.
    pub fn file_name(&self, date: NaiveDate) -> String {
        format!("{}_{}.tif", self.spec.prefix, date::token(date))
    }

    /// Local raster filename for a remote URL, or a date-token error.
    pub fn file_name_for_url(&self, url: &str) -> Result<String> {
        Ok(self.file_name(self.extractor.require(url)?))
    }
}

fn product(name: &str, prefix: &str) -> ProductSpec {
    ProductSpec {
        name: name.to_string(),
        crs: "EPSG:4326".to_string(),
        shape: [1800, 3600],
        transform: [0.1, 0.0, -180.0, 0.0, -0.1, 90.0],
        measurement: "Precipitation".to_string(),
        measurement_root: Some(format!("/STORAGE/DATA/DATA_10KM_daily/{prefix}")),
    }
}

/// The variants known without a configuration file.
pub fn builtin_variants() -> Vec<VariantSpec> {
    vec![
        VariantSpec {
            name: "imerg_e".to_string(),
            prefix: "imerg_e".to_string(),
            listing: "https://jsimpsonhttps.pps.eosdis.nasa.gov/imerg/gis/early/{year}/{month}/"
                .to_string(),
            layout: Layout::Monthly,
            filter: LinkFilter {
                suffix: ".1day.tif".to_string(),
                contains: "0150".to_string(),
            },
            date_pattern: r"\.(\d{8})-S\d{6}".to_string(),
            member: None,
            product: product("imerg_e_10KM_daily", "imerg_e"),
        },
        VariantSpec {
            name: "imerg_f".to_string(),
            prefix: "imerg_f".to_string(),
            listing: "https://arthurhouhttps.pps.eosdis.nasa.gov/gpmdata/{year}/{month}/{day}/gis/"
                .to_string(),
            layout: Layout::Daily,
            filter: LinkFilter {
                suffix: ".tif".to_string(),
                contains: "-DAY-".to_string(),
            },
            date_pattern: r"\.(\d{8})-S\d{6}".to_string(),
            member: None,
            product: product("imerg_f_10KM_daily", "imerg_f"),
        },
        VariantSpec {
            name: "imerg_l".to_string(),
            prefix: "imerg_l".to_string(),
            listing: "https://jsimpsonhttps.pps.eosdis.nasa.gov/imerg/gis/{year}/{month}/"
                .to_string(),
            layout: Layout::Monthly,
            filter: LinkFilter {
                suffix: ".zip".to_string(),
                contains: "3B-DAY-L".to_string(),
            },
            date_pattern: r"\.(\d{8})\.V\d{2}".to_string(),
            member: Some("liquid.tif".to_string()),
            product: product("imerg_l_10KM_daily", "imerg_l"),
        },
    ]
}

/// Built-in variants overlaid with those from `path`, if given.
#[instrument(level = "info", skip_all, fields(path = ?path))]
pub fn load_variants(path: Option<&Path>) -> Result<Vec<VariantSpec>> {
    let mut variants = builtin_variants();
    let Some(path) = path else {
        return Ok(variants);
    };
    let text = std::fs::read_to_string(path).map_err(|e| HarvestError::io(path, e))?;
    let file: VariantFile = serde_yaml::from_str(&text).map_err(|e| HarvestError::Yaml {
        path: path.to_path_buf(),
        source: e,
    })?;
    for spec in file.variants {
        if let Some(existing) = variants.iter_mut().find(|v| v.name == spec.name) {
            debug!(variant = %spec.name, "Overriding built-in variant");
            *existing = spec;
        } else {
            debug!(variant = %spec.name, "Adding variant from config");
            variants.push(spec);
        }
    }
    info!(count = variants.len(), "Loaded variant catalog");
    Ok(variants)
}

/// Look up and validate a variant by name.
pub fn resolve_variant(name: &str, config: Option<&Path>) -> Result<Variant> {
    let variants = load_variants(config)?;
    let known = variants.iter().map(|v| v.name.clone()).collect::<Vec<_>>();
    let spec = variants
        .into_iter()
        .find(|v| v.name == name)
        .ok_or_else(|| {
            HarvestError::Config(format!("unknown variant '{name}' (known: {})", known.join(", ")))
        })?;
    let variant = Variant::from_spec(spec)?;
    debug!(
        variant = %variant.name(),
        date_pattern = variant.extractor().pattern(),
        "Resolved variant"
    );
    Ok(variant)
}

/// What to do when several manifest entries map to one local filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum CollisionPolicy {
    /// The earliest entry in manifest order is downloaded.
    #[default]
    FirstWins,
    /// The latest entry in manifest order is downloaded.
    LastWins,
    /// Colliding entries are all reported as failures.
    Error,
}

/// HTTP Basic credentials.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Filesystem layout shared by all stages.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Working root holding `urls/` and `files/`.
    pub root: PathBuf,
    /// Root for description documents.
    pub output_root: PathBuf,
}

impl Paths {
    pub fn new(root: impl Into<PathBuf>, output_root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            output_root: output_root.into(),
        }
    }

    /// `urls/{year}.txt`
    pub fn manifest(&self, year: i32) -> PathBuf {
        self.root.join("urls").join(format!("{year}.txt"))
    }

    /// `files/`
    pub fn files_root(&self) -> PathBuf {
        self.root.join("files")
    }

    /// `files/{year}/`
    pub fn files_dir(&self, year: i32) -> PathBuf {
        self.files_root().join(year.to_string())
    }

    /// `{output_root}/{year}/`
    pub fn description_dir(&self, year: &str) -> PathBuf {
        self.output_root.join(year)
    }
}
