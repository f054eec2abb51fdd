//! Stage wiring: turns a parsed [`Cli`] into one stage run with its
//! transport, variant and filesystem layout, and logs the stage summary.

use crate::cli::{Cli, Command};
use crate::config::{self, Paths, Variant};
use crate::crawler::{self, CrawlLimits, DiscoverSummary};
use crate::error::{HarvestError, Result};
use crate::fetcher::{self, FetchOptions, FetchReport};
use crate::synthesizer::{self, DescribeReport};
use crate::transport::{HttpTransport, Transport};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// What every stage needs besides its transport.
#[derive(Debug, Clone)]
pub struct Context {
    pub variant: Variant,
    pub paths: Paths,
    pub cancel: CancellationToken,
}

pub async fn run_discover<T: Transport>(
    transport: &T,
    ctx: &Context,
    limits: CrawlLimits,
    year: i32,
) -> Result<DiscoverSummary> {
    let summary = crawler::discover(
        transport,
        &ctx.variant,
        limits,
        ctx.cancel.clone(),
        &ctx.paths.manifest(year),
        year,
    )
    .await?;
    info!(
        year = summary.year,
        pages = summary.pages,
        failed_pages = summary.failed_pages,
        urls = summary.urls,
        undated = summary.undated,
        "Discovery finished"
    );
    Ok(summary)
}

pub async fn run_fetch<T: Transport>(
    transport: &T,
    ctx: &Context,
    options: &FetchOptions,
    year: i32,
    month: Option<u32>,
) -> Result<FetchReport> {
    let report = fetcher::fetch(
        transport,
        &ctx.variant,
        &ctx.paths,
        year,
        month,
        options,
        &ctx.cancel,
    )
    .await?;
    for failure in &report.failures {
        warn!(url = %failure.url, reason = %failure.reason, "Not fetched");
    }
    info!(
        considered = report.considered,
        downloaded = report.downloaded.len(),
        skipped_existing = report.skipped_existing,
        duplicates = report.duplicates,
        failures = report.failures.len(),
        cancelled = report.cancelled,
        complete = report.is_complete(),
        "Fetch finished"
    );
    if report.cancelled > 0 {
        return Err(HarvestError::Cancelled);
    }
    Ok(report)
}

pub async fn run_describe(ctx: &Context, year: Option<i32>, force: bool) -> Result<DescribeReport> {
    let report = synthesizer::describe(&ctx.variant, &ctx.paths, year, force).await?;
    for failure in &report.failures {
        warn!(path = %failure.path.display(), reason = %failure.reason, "Not described");
    }
    info!(
        scanned = report.scanned,
        written = report.written.len(),
        skipped_existing = report.skipped_existing,
        regenerated = report.regenerated,
        failures = report.failures.len(),
        "Describe finished"
    );
    Ok(report)
}

fn http_transport(cli: &Cli) -> Result<HttpTransport> {
    let credentials = cli.credentials()?;
    if credentials.is_none() {
        warn!("No credentials configured; requests are sent unauthenticated");
    }
    HttpTransport::new(credentials, cli.timeout(), cli.connect_timeout())
}

/// Run the stage selected on the command line.
#[instrument(level = "info", skip_all, fields(variant = %cli.variant))]
pub async fn run(cli: &Cli, cancel: CancellationToken) -> Result<()> {
    let variant = config::resolve_variant(&cli.variant, cli.config.as_deref())?;
    let ctx = Context {
        variant,
        paths: cli.paths(),
        cancel,
    };

    match cli.command {
        Command::Discover { year } => {
            let transport = http_transport(cli)?;
            run_discover(&transport, &ctx, cli.crawl_limits(), year).await?;
        }
        Command::Fetch { year, month } => {
            let transport = http_transport(cli)?;
            run_fetch(&transport, &ctx, &cli.fetch_options(), year, month).await?;
        }
        Command::Describe { year, force } => {
            run_describe(&ctx, year, force).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::resolve_variant;
    use crate::extract::fixtures::zip_with;
    use crate::models::DatasetDescription;
    use crate::transport::RetryPolicy;
    use crate::transport::fake::{FakeTransport, Reply};
    use std::time::Duration;

    const LATE: &str = "https://jsimpsonhttps.pps.eosdis.nasa.gov/imerg/gis";

    fn day_zip(tag: &str) -> Reply {
        let liquid = format!("rain {tag}").into_bytes();
        Reply::ok(
            "application/x-zip-compressed",
            zip_with(&[
                ("3B-DAY-L.GIS.IMERG.V07B.total.tif", b"t"),
                ("3B-DAY-L.GIS.IMERG.V07B.liquid.tif", &liquid),
            ]),
        )
    }

    fn listing(names: &[&str]) -> Reply {
        let rows: String = names.iter().map(|n| format!(r#"<a href="{n}">{n}</a><br>"#)).collect();
        Reply::ok("text/html", format!("<html><body>{rows}</body></html>").into_bytes())
    }

    #[tokio::test]
    async fn test_discover_fetch_describe_single_month() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context {
            variant: resolve_variant("imerg_l", None).unwrap(),
            paths: Paths::new(dir.path(), dir.path().join("dataset")),
            cancel: CancellationToken::new(),
        };
        let jan = [
            "3B-DAY-L.GIS.IMERG.20240101.V07B.zip",
            "3B-DAY-L.GIS.IMERG.20240115.V07B.zip",
            "3B-DAY-L.GIS.IMERG.20240131.V07B.zip",
        ];
        let feb = ["3B-DAY-L.GIS.IMERG.20240201.V07B.zip"];
        let mut fake = FakeTransport::new()
            .route(&format!("{LATE}/2024/01/"), listing(&jan))
            .route(&format!("{LATE}/2024/02/"), listing(&feb));
        for name in jan {
            fake = fake.route(&format!("{LATE}/2024/01/{name}"), day_zip(name));
        }
        fake = fake.route(&format!("{LATE}/2024/02/{}", feb[0]), day_zip(feb[0]));

        let found = run_discover(&fake, &ctx, CrawlLimits::default(), 2024).await.unwrap();
        assert_eq!(found.urls, 4);

        let options = FetchOptions {
            retry: RetryPolicy {
                max_attempts: 2,
                backoff: Duration::from_millis(1),
            },
            ..FetchOptions::default()
        };
        let fetched = run_fetch(&fake, &ctx, &options, 2024, Some(1)).await.unwrap();
        assert_eq!(fetched.downloaded.len(), 3);
        assert!(fetched.failures.is_empty());
        assert!(!ctx.paths.files_dir(2024).join("imerg_l_20240201.tif").exists());

        let described = run_describe(&ctx, Some(2024), false).await.unwrap();
        assert_eq!(described.written.len(), 3);
        let docs: Vec<DatasetDescription> = described
            .written
            .iter()
            .map(|p| serde_yaml::from_str(&std::fs::read_to_string(p).unwrap()).unwrap())
            .collect();
        let mut ids: Vec<_> = docs.iter().map(|d| d.id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);
        assert!(docs.iter().all(|d| d.properties.datetime.ends_with("T00:00:00Z")));
    }

    #[tokio::test]
    async fn test_fetch_without_manifest_fails() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context {
            variant: resolve_variant("imerg_l", None).unwrap(),
            paths: Paths::new(dir.path(), dir.path().join("dataset")),
            cancel: CancellationToken::new(),
        };
        let err = run_fetch(&FakeTransport::new(), &ctx, &FetchOptions::default(), 2024, None)
            .await
            .unwrap_err();
        assert!(err.is_stage_fatal());
    }
}
