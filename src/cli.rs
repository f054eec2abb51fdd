//! Command-line interface definitions.
//!
//! Each pipeline stage is a subcommand; settings shared by the stages are
//! global flags. Credentials and the variant can also come from the
//! environment.

use crate::config::{CollisionPolicy, Credentials, Paths};
use crate::crawler::CrawlLimits;
use crate::error::{HarvestError, Result};
use crate::fetcher::FetchOptions;
use crate::transport::RetryPolicy;
use clap::{Parser, Subcommand, value_parser};
use std::path::PathBuf;
use std::time::Duration;

/// Acquire IMERG daily precipitation rasters and describe them for Open Data Cube.
///
/// # Examples
///
/// ```sh
/// # Crawl the 2024 listings and write urls/2024.txt
/// imerg_harvest discover 2024
///
/// # Download January only, with credentials from the environment
/// IMERG_USERNAME=me IMERG_PASSWORD=secret imerg_harvest fetch 2024 1
///
/// # Describe everything under files/
/// imerg_harvest --output-root ./dataset describe
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Product variant (imerg_e, imerg_f, imerg_l, or one from --config)
    #[arg(long, global = true, env = "IMERG_VARIANT", default_value = "imerg_l")]
    pub variant: String,

    /// Optional YAML file adding or replacing variants
    #[arg(short, long, global = true, env = "IMERG_CONFIG")]
    pub config: Option<PathBuf>,

    /// Working root holding urls/ and files/
    #[arg(long, global = true, default_value = ".")]
    pub root: PathBuf,

    /// Root directory for description documents
    #[arg(long, global = true, default_value = "dataset")]
    pub output_root: PathBuf,

    /// Basic-auth user for the data server
    #[arg(long, global = true, env = "IMERG_USERNAME")]
    pub username: Option<String>,

    /// Basic-auth password for the data server
    #[arg(long, global = true, env = "IMERG_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Concurrent downloads in the fetch stage
    #[arg(long, global = true, default_value_t = 6)]
    pub workers: usize,

    /// Months crawled concurrently
    #[arg(long, global = true, default_value_t = 4)]
    pub month_workers: usize,

    /// Day listings crawled concurrently within a month
    #[arg(long, global = true, default_value_t = 8)]
    pub day_workers: usize,

    /// Per-request timeout
    #[arg(long, global = true, default_value_t = 120)]
    pub timeout_secs: u64,

    /// Connection timeout
    #[arg(long, global = true, default_value_t = 30)]
    pub connect_timeout_secs: u64,

    /// Attempts per download, including the first
    #[arg(long, global = true, default_value_t = 3, value_parser = value_parser!(u32).range(1..))]
    pub retries: u32,

    /// Sleep between download attempts
    #[arg(long, global = true, default_value_t = 2)]
    pub backoff_secs: u64,

    /// What to do when several URLs map to one local filename
    #[arg(long, global = true, value_enum, default_value_t = CollisionPolicy::FirstWins)]
    pub collision_policy: CollisionPolicy,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Crawl the remote listings of a year and write urls/{year}.txt
    Discover {
        #[arg(value_parser = value_parser!(i32).range(1998..=2100))]
        year: i32,
    },
    /// Download the assets listed in urls/{year}.txt into files/{year}/
    Fetch {
        #[arg(value_parser = value_parser!(i32).range(1998..=2100))]
        year: i32,
        /// Only fetch URLs of this month
        #[arg(value_parser = value_parser!(u32).range(1..=12))]
        month: Option<u32>,
    },
    /// Write a dataset document for every local raster lacking one
    Describe {
        /// Limit to files/{year}/; all years when omitted
        #[arg(value_parser = value_parser!(i32).range(1998..=2100))]
        year: Option<i32>,
        /// Rewrite existing documents, keeping their ids
        #[arg(long)]
        force: bool,
    },
}

impl Cli {
    /// Both credential halves, or neither.
    pub fn credentials(&self) -> Result<Option<Credentials>> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Ok(Some(Credentials {
                username: username.clone(),
                password: password.clone(),
            })),
            (None, None) => Ok(None),
            _ => Err(HarvestError::Config(
                "--username and --password must be given together".to_string(),
            )),
        }
    }

    pub fn paths(&self) -> Paths {
        Paths::new(&self.root, &self.output_root)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn crawl_limits(&self) -> CrawlLimits {
        CrawlLimits {
            month_workers: self.month_workers.max(1),
            day_workers: self.day_workers.max(1),
        }
    }

    pub fn fetch_options(&self) -> FetchOptions {
        FetchOptions {
            workers: self.workers.max(1),
            retry: RetryPolicy {
                max_attempts: self.retries,
                backoff: Duration::from_secs(self.backoff_secs),
            },
            collision: self.collision_policy,
        }
    }
}
