//! Error taxonomy for the acquisition pipeline.
//!
//! Errors fall into two groups:
//! - **Per-item** errors (transport, date token, container content). These are
//!   logged, recorded in a stage summary, and never abort a batch.
//! - **Stage-fatal** errors (filesystem, missing manifest, bad configuration).
//!   These propagate to `main` and end the process with a non-zero exit code.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias used across the pipeline modules.
pub type Result<T> = std::result::Result<T, HarvestError>;

/// Every failure the pipeline can report.
#[derive(Error, Debug)]
pub enum HarvestError {
    /// The request could not be sent or the body could not be read.
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The request exceeded the configured per-request timeout.
    #[error("request to {url} timed out")]
    Timeout { url: String },

    /// The server answered with a status other than success.
    #[error("{url} answered HTTP {status}")]
    Status { url: String, status: u16 },

    /// No 8-digit capture date could be found in a URL or filename.
    #[error("no date token in {input}")]
    DateToken { input: String },

    /// The container was downloaded but lacks the expected member.
    #[error("member containing '{member}' not found in container from {url}")]
    MissingMember { url: String, member: String },

    /// The container could not be opened or read.
    #[error("unreadable container from {url}: {source}")]
    Container {
        url: String,
        #[source]
        source: zip::result::ZipError,
    },

    /// Two or more manifest entries resolve to the same local filename.
    #[error("{url} collides with {other} on {filename}")]
    Collision {
        url: String,
        other: String,
        filename: String,
    },

    /// The stage was cancelled before this item completed.
    #[error("cancelled")]
    Cancelled,

    /// A required input file is absent.
    #[error("manifest {} does not exist", .0.display())]
    ManifestMissing(PathBuf),

    /// Filesystem failure while reading or placing an artifact.
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A description document could not be (de)serialized.
    #[error("YAML error at {}: {source}", path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// Invalid configuration (unknown variant, bad pattern, bad template).
    #[error("configuration error: {0}")]
    Config(String),
}

impl HarvestError {
    /// Attach a path to an I/O error.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error must abort the running stage instead of being
    /// recorded against a single item.
    pub fn is_stage_fatal(&self) -> bool {
        matches!(
            self,
            Self::ManifestMissing(_) | Self::Io { .. } | Self::Config(_)
        )
    }

    /// Whether retrying the same request could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::Timeout { .. } | Self::Status { .. }
        )
    }
}
