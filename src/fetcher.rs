//! Fetch & extract engine.
//!
//! Materializes each manifest entry as `files/{year}/{prefix}_{YYYYMMDD}.tif`.
//!
//! # Phases
//!
//! 1. **Plan**: derive every URL's filename, drop URLs whose file already
//!    exists, and resolve filename collisions under the configured
//!    [`CollisionPolicy`]. Undated URLs fail here.
//! 2. **Transfer**: a bounded pool of workers, one asset each, runs
//!    fetch → retry → extract → stage → rename. Workers share only the
//!    read-only transport and the task stream.
//! 3. **Barrier**: all outcomes are collected before the report is built.
//!
//! A placed file is always complete, so "file exists" is the only completion
//! marker and re-running against the same manifest transfers nothing.

use crate::config::{CollisionPolicy, Paths, Variant};
use crate::error::{HarvestError, Result};
use crate::extract;
use crate::manifest;
use crate::storage;
use crate::transport::{RetryPolicy, RetryTransport, Transport};
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Knobs for one fetch run.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Concurrent downloads.
    pub workers: usize,
    pub retry: RetryPolicy,
    pub collision: CollisionPolicy,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            workers: 6,
            retry: RetryPolicy::default(),
            collision: CollisionPolicy::default(),
        }
    }
}

/// One asset to transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTask {
    pub url: String,
    pub file_name: String,
    pub dest: PathBuf,
}

/// A manifest entry that did not produce a file this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    pub url: String,
    pub reason: String,
}

impl ItemFailure {
    fn new(url: &str, err: &HarvestError) -> Self {
        Self {
            url: url.to_string(),
            reason: err.to_string(),
        }
    }
}

/// Work left after naming, existence checks and collision handling.
#[derive(Debug, Default)]
pub struct FetchPlan {
    pub tasks: Vec<FetchTask>,
    /// Filenames already on disk.
    pub skipped_existing: Vec<String>,
    /// URLs whose filename is claimed by another URL.
    pub duplicates: Vec<String>,
    pub failures: Vec<ItemFailure>,
}

/// Outcome of the `fetch` stage.
#[derive(Debug, Default)]
pub struct FetchReport {
    /// Manifest entries considered after month filtering.
    pub considered: usize,
    /// Filenames placed this run.
    pub downloaded: Vec<String>,
    pub skipped_existing: usize,
    pub duplicates: usize,
    pub cancelled: usize,
    pub failures: Vec<ItemFailure>,
}

impl FetchReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.cancelled == 0
    }
}

/// Decide which URLs need a transfer into `dir`.
#[instrument(level = "info", skip_all, fields(dir = %dir.display(), urls = urls.len(), ?policy))]
pub async fn plan(
    urls: Vec<String>,
    variant: &Variant,
    dir: &Path,
    policy: CollisionPolicy,
) -> Result<FetchPlan> {
    let mut plan = FetchPlan::default();
    let mut by_name: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for url in urls {
        match variant.file_name_for_url(&url) {
            Ok(name) => by_name.entry(name).or_default().push(url),
            Err(e) => {
                warn!(%url, error = %e, "Cannot find date format in URL");
                plan.failures.push(ItemFailure::new(&url, &e));
            }
        }
    }

    for (file_name, mut claimants) in by_name {
        let dest = dir.join(&file_name);
        if storage::is_complete(&dest).await? {
            debug!(file = %file_name, "File already exists, skipping");
            plan.skipped_existing.push(file_name);
            plan.duplicates.extend(claimants.into_iter().skip(1));
            continue;
        }
        if claimants.len() > 1 {
            warn!(
                file = %file_name,
                urls = ?claimants,
                ?policy,
                "Several URLs map to one filename"
            );
        }
        let winner = match policy {
            _ if claimants.len() == 1 => claimants.remove(0),
            CollisionPolicy::FirstWins => claimants.remove(0),
            CollisionPolicy::LastWins => claimants.remove(claimants.len() - 1),
            CollisionPolicy::Error => {
                for (i, url) in claimants.iter().enumerate() {
                    let other = &claimants[if i == 0 { 1 } else { 0 }];
                    let err = HarvestError::Collision {
                        url: url.clone(),
                        other: other.clone(),
                        filename: file_name.clone(),
                    };
                    plan.failures.push(ItemFailure::new(url, &err));
                }
                continue;
            }
        };
        plan.duplicates.extend(claimants);
        plan.tasks.push(FetchTask {
            url: winner,
            file_name,
            dest,
        });
    }

    info!(
        tasks = plan.tasks.len(),
        existing = plan.skipped_existing.len(),
        duplicates = plan.duplicates.len(),
        failures = plan.failures.len(),
        "Fetch plan ready"
    );
    Ok(plan)
}

/// Full lifecycle of one asset. Returns the number of bytes placed.
#[instrument(level = "info", skip_all, fields(file = %task.file_name))]
async fn fetch_one<R: Transport>(
    transport: &R,
    member: Option<&str>,
    task: &FetchTask,
) -> Result<usize> {
    let t0 = Instant::now();
    let body = transport.get(&task.url).await?;
    let zipped = body.is_zip();
    let bytes = match (zipped, member) {
        (true, Some(member)) => {
            extract::extract_member_blocking(task.url.clone(), body.bytes, member.to_string())
                .await?
        }
        _ => body.bytes,
    };
    storage::write_atomic(&task.dest, &bytes).await?;
    info!(
        bytes = bytes.len(),
        extracted = zipped && member.is_some(),
        elapsed_ms = t0.elapsed().as_millis() as u64,
        "Downloaded"
    );
    Ok(bytes.len())
}

/// Run every task of `plan` through a pool of `options.workers`.
///
/// A stage-fatal error cancels the remaining work and is returned once all
/// workers have stopped.
pub async fn transfer<T: Transport>(
    transport: &T,
    variant: &Variant,
    plan: FetchPlan,
    options: &FetchOptions,
    cancel: &CancellationToken,
) -> Result<FetchReport> {
    let stage = cancel.child_token();
    let retry = RetryTransport::new(transport, options.retry, stage.clone());
    let member = variant.member();

    let outcomes: Vec<(FetchTask, Result<usize>)> = stream::iter(plan.tasks)
        .map(|task| {
            let retry = &retry;
            let stage = &stage;
            async move {
                let res = if stage.is_cancelled() {
                    Err(HarvestError::Cancelled)
                } else {
                    fetch_one(retry, member, &task).await
                };
                if let Err(e) = &res {
                    if e.is_stage_fatal() {
                        error!(url = %task.url, error = %e, "Stage-fatal error; stopping workers");
                        stage.cancel();
                    }
                }
                (task, res)
            }
        })
        .buffer_unordered(options.workers.max(1))
        .collect()
        .await;

    let mut report = FetchReport {
        skipped_existing: plan.skipped_existing.len(),
        duplicates: plan.duplicates.len(),
        failures: plan.failures,
        ..FetchReport::default()
    };
    let mut fatal = None;
    for (task, res) in outcomes {
        match res {
            Ok(_) => report.downloaded.push(task.file_name),
            Err(HarvestError::Cancelled) => report.cancelled += 1,
            Err(e) if e.is_stage_fatal() => {
                fatal.get_or_insert(e);
            }
            Err(e) => {
                warn!(url = %task.url, file = %task.file_name, error = %e, "Skipping file");
                report.failures.push(ItemFailure::new(&task.url, &e));
            }
        }
    }
    if let Some(e) = fatal {
        return Err(e);
    }
    report.downloaded.sort();
    report.failures.sort_by(|a, b| a.url.cmp(&b.url));
    Ok(report)
}

/// The `fetch` stage: manifest `urls/{year}.txt` → `files/{year}/`.
///
/// Entries are optionally narrowed to one month, planned against what is
/// already on disk, then transferred through a pool of `options.workers`.
///
/// # Arguments
///
/// * `transport` - Source of remote bodies; wrapped in a [`RetryTransport`] here
/// * `variant` - Naming rule and optional zip member for the product
/// * `paths` - Working layout holding `urls/` and `files/`
/// * `year` - Manifest to read
/// * `month` - Keep only URLs whose path contains `/{year}/{MM}/`
/// * `options` - Pool size, retry budget and collision policy
/// * `cancel` - Stops outstanding transfers; nothing partial is placed
///
/// # Returns
///
/// A [`FetchReport`] with per-item failures, or a stage-fatal error when
/// the manifest is missing or the target directory cannot be written.
///
/// # Example
///
/// ```ignore
/// let report = fetch(&transport, &variant, &paths, 2024, Some(1), &options, &cancel).await?;
/// info!(downloaded = report.downloaded.len(), "Done");
/// ```
#[instrument(
    level = "info",
    skip_all,
    fields(variant = %variant.name(), year = year, month = ?month)
)]
pub async fn fetch<T: Transport>(
    transport: &T,
    variant: &Variant,
    paths: &Paths,
    year: i32,
    month: Option<u32>,
    options: &FetchOptions,
    cancel: &CancellationToken,
) -> Result<FetchReport> {
    let mut urls = manifest::read_manifest(&paths.manifest(year)).await?;
    if let Some(month) = month {
        let before = urls.len();
        urls = manifest::filter_month(urls, year, month);
        info!(
            month,
            kept = urls.len(),
            dropped = before - urls.len(),
            "Filtered manifest by month"
        );
    }
    let considered = urls.len();

    let dir = paths.files_dir(year);
    storage::ensure_writable_dir(&dir).await?;
    storage::sweep_staging(&dir).await?;

    let plan = plan(urls, variant, &dir, options.collision).await?;
    let mut report = transfer(transport, variant, plan, options, cancel).await?;
    report.considered = considered;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::resolve_variant;
    use crate::extract::fixtures::zip_with;
    use crate::transport::FetchedBody;
    use crate::transport::fake::{FakeTransport, Reply};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const LATE: &str = "https://jsimpsonhttps.pps.eosdis.nasa.gov/imerg/gis";
    const EARLY: &str = "https://jsimpsonhttps.pps.eosdis.nasa.gov/imerg/gis/early";

    fn late_url(month: u32, day: u32) -> String {
        format!("{LATE}/2024/{month:02}/3B-DAY-L.GIS.IMERG.2024{month:02}{day:02}.V07B.zip")
    }

    fn early_url(day: u32, start: &str) -> String {
        format!(
            "{EARLY}/2024/01/3B-HHR-E.MS.MRG.3IMERG.\
             202401{day:02}-S{start}-E022959.0150.V07B.1day.tif"
        )
    }

    fn quick() -> FetchOptions {
        FetchOptions {
            workers: 3,
            retry: RetryPolicy {
                max_attempts: 2,
                backoff: Duration::from_millis(1),
            },
            collision: CollisionPolicy::FirstWins,
        }
    }

    async fn fetch_year(
        transport: &FakeTransport,
        variant: &Variant,
        paths: &Paths,
    ) -> Result<FetchReport> {
        let cancel = CancellationToken::new();
        fetch(transport, variant, paths, 2024, None, &quick(), &cancel).await
    }

    fn write_manifest(paths: &Paths, year: i32, urls: &[String]) {
        let path = paths.manifest(year);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, manifest::render(urls)).unwrap();
    }

    fn liquid_zip(tag: &str) -> Reply {
        let liquid = format!("liquid-{tag}").into_bytes();
        Reply::ok(
            "application/zip",
            zip_with(&[
                ("3B-DAY-L.GIS.IMERG.V07B.total.tif", b"total"),
                ("3B-DAY-L.GIS.IMERG.V07B.liquid.tif", &liquid),
            ]),
        )
    }

    #[tokio::test]
    async fn test_month_filter_and_idempotent_rerun() {
        let variant = resolve_variant("imerg_l", None).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path(), dir.path().join("dataset"));
        let urls = vec![late_url(1, 1), late_url(1, 2), late_url(1, 3), late_url(2, 1)];
        write_manifest(&paths, 2024, &urls);

        let fake = FakeTransport::new()
            .route(&urls[0], liquid_zip("a"))
            .route(&urls[1], liquid_zip("b"))
            .route(&urls[2], liquid_zip("c"))
            .route(&urls[3], liquid_zip("d"));
        let cancel = CancellationToken::new();

        let report = fetch(&fake, &variant, &paths, 2024, Some(1), &quick(), &cancel)
            .await
            .unwrap();
        assert_eq!(report.considered, 3);
        assert_eq!(
            report.downloaded,
            vec!["imerg_l_20240101.tif", "imerg_l_20240102.tif", "imerg_l_20240103.tif"]
        );
        assert!(report.is_complete());
        assert_eq!(fake.calls_to(&urls[3]), 0);
        let files_dir = paths.files_dir(2024);
        assert_eq!(std::fs::read(files_dir.join("imerg_l_20240102.tif")).unwrap(), b"liquid-b");
        assert!(!files_dir.join("imerg_l_20240201.tif").exists());

        let calls_before = fake.calls().len();
        let again = fetch(&fake, &variant, &paths, 2024, Some(1), &quick(), &cancel)
            .await
            .unwrap();
        assert!(again.downloaded.is_empty());
        assert_eq!(again.skipped_existing, 3);
        assert_eq!(fake.calls().len(), calls_before);
    }

    #[tokio::test]
    async fn test_plain_response_is_written_directly() {
        let variant = resolve_variant("imerg_e", None).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path(), dir.path().join("dataset"));
        let url = early_url(5, "020000");
        write_manifest(&paths, 2024, &[url.clone()]);
        let fake =
            FakeTransport::new().route(&url, Reply::ok("image/tiff", b"II*\x00tiff".to_vec()));

        let report = fetch_year(&fake, &variant, &paths).await.unwrap();

        assert_eq!(report.downloaded, vec!["imerg_e_20240105.tif"]);
        let placed = std::fs::read(paths.files_dir(2024).join("imerg_e_20240105.tif")).unwrap();
        assert_eq!(placed, b"II*\x00tiff");
    }

    #[tokio::test]
    async fn test_missing_member_leaves_no_file() {
        let variant = resolve_variant("imerg_l", None).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path(), dir.path().join("dataset"));
        let url = late_url(1, 4);
        write_manifest(&paths, 2024, &[url.clone()]);
        let fake = FakeTransport::new().route(
            &url,
            Reply::ok("application/zip", zip_with(&[("readme.txt", b"no raster")])),
        );

        let report = fetch_year(&fake, &variant, &paths).await.unwrap();

        assert!(report.downloaded.is_empty());
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].reason.contains("liquid.tif"));
        // extraction failures are not retried
        assert_eq!(fake.calls_to(&url), 1);
        let leftovers = std::fs::read_dir(paths.files_dir(2024)).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_failures_do_not_abort_batch() {
        let variant = resolve_variant("imerg_l", None).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path(), dir.path().join("dataset"));
        let good = late_url(3, 1);
        let flaky = late_url(3, 2);
        let dead = late_url(3, 3);
        let undated = format!("{LATE}/2024/03/3B-DAY-L.GIS.IMERG.latest.zip");
        write_manifest(&paths, 2024, &[good.clone(), flaky.clone(), dead.clone(), undated.clone()]);
        let fake = FakeTransport::new()
            .route(&good, liquid_zip("good"))
            .sequence(&flaky, vec![Reply::status(502), liquid_zip("flaky")])
            .route(&dead, Reply::status(500));

        let report = fetch_year(&fake, &variant, &paths).await.unwrap();

        assert_eq!(report.downloaded, vec!["imerg_l_20240301.tif", "imerg_l_20240302.tif"]);
        let failed: Vec<&str> = report.failures.iter().map(|f| f.url.as_str()).collect();
        assert_eq!(failed, vec![dead.as_str(), undated.as_str()]);
        assert_eq!(fake.calls_to(&dead), 2);
        assert_eq!(fake.calls_to(&undated), 0);
        assert!(!report.is_complete());
    }

    #[tokio::test]
    async fn test_missing_manifest_is_fatal() {
        let variant = resolve_variant("imerg_l", None).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path(), dir.path().join("dataset"));
        let err = fetch_year(&FakeTransport::new(), &variant, &paths).await.unwrap_err();
        assert!(matches!(err, HarvestError::ManifestMissing(_)));
    }

    #[tokio::test]
    async fn test_collision_policies() {
        let variant = resolve_variant("imerg_e", None).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let first = early_url(7, "013000");
        let second = early_url(7, "020000");
        let other = early_url(8, "020000");
        let urls = vec![first.clone(), second.clone(), other.clone()];

        let p = plan(urls.clone(), &variant, dir.path(), CollisionPolicy::FirstWins).await.unwrap();
        assert_eq!(p.tasks.len(), 2);
        assert_eq!(p.tasks[0].url, first);
        assert_eq!(p.tasks[0].file_name, "imerg_e_20240107.tif");
        assert_eq!(p.duplicates, vec![second.clone()]);

        let p = plan(urls.clone(), &variant, dir.path(), CollisionPolicy::LastWins).await.unwrap();
        assert_eq!(p.tasks[0].url, second);
        assert_eq!(p.duplicates, vec![first.clone()]);

        let p = plan(urls.clone(), &variant, dir.path(), CollisionPolicy::Error).await.unwrap();
        assert_eq!(p.tasks.len(), 1);
        assert_eq!(p.tasks[0].url, other);
        assert_eq!(p.failures.len(), 2);
        assert!(p.failures.iter().all(|f| f.reason.contains("imerg_e_20240107.tif")));

        std::fs::write(dir.path().join("imerg_e_20240107.tif"), b"done").unwrap();
        let p = plan(urls, &variant, dir.path(), CollisionPolicy::Error).await.unwrap();
        assert_eq!(p.skipped_existing, vec!["imerg_e_20240107.tif"]);
        assert!(p.failures.is_empty());
    }

    #[tokio::test]
    async fn test_naming_is_deterministic() {
        let variant = resolve_variant("imerg_e", None).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let urls = vec![early_url(9, "020000")];
        let a = plan(urls.clone(), &variant, dir.path(), CollisionPolicy::FirstWins).await.unwrap();
        let b = plan(urls, &variant, dir.path(), CollisionPolicy::FirstWins).await.unwrap();
        assert_eq!(a.tasks, b.tasks);
    }

    #[tokio::test]
    async fn test_cancelled_run_places_nothing() {
        let variant = resolve_variant("imerg_l", None).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path(), dir.path().join("dataset"));
        let stalled = late_url(4, 1);
        let queued = late_url(4, 2);
        write_manifest(&paths, 2024, &[stalled.clone(), queued.clone()]);
        let fake = FakeTransport::new()
            .route(&stalled, Reply::Stall)
            .route(&queued, Reply::Stall);
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();

        let options = quick();
        let run = fetch(&fake, &variant, &paths, 2024, None, &options, &cancel);
        let stop = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        };
        let (report, _) = tokio::join!(run, stop);
        let report = report.unwrap();

        assert_eq!(report.cancelled, 2);
        assert!(report.downloaded.is_empty());
        assert_eq!(std::fs::read_dir(paths.files_dir(2024)).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_stale_staging_file_is_not_a_completion_marker() {
        let variant = resolve_variant("imerg_l", None).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path(), dir.path().join("dataset"));
        let url = late_url(5, 1);
        write_manifest(&paths, 2024, &[url.clone()]);
        let files = paths.files_dir(2024);
        std::fs::create_dir_all(&files).unwrap();
        std::fs::write(files.join(".imerg_l_20240501.tif.part"), b"trunc").unwrap();
        let fake = FakeTransport::new().route(&url, liquid_zip("full"));

        let report = fetch_year(&fake, &variant, &paths).await.unwrap();

        assert_eq!(report.downloaded, vec!["imerg_l_20240501.tif"]);
        assert_eq!(std::fs::read(files.join("imerg_l_20240501.tif")).unwrap(), b"liquid-full");
        assert!(!files.join(".imerg_l_20240501.tif.part").exists());
    }

    /// Serves a tiny raster to every URL while tracking how many requests
    /// overlap.
    #[derive(Default)]
    struct GaugeTransport {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Transport for GaugeTransport {
        async fn get(&self, _url: &str) -> Result<FetchedBody> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(FetchedBody {
                status: 200,
                content_type: Some("image/tiff".to_string()),
                bytes: b"II*\x00".to_vec(),
            })
        }
    }

    #[tokio::test]
    async fn test_transfers_respect_worker_limit() {
        let variant = resolve_variant("imerg_e", None).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let urls: Vec<String> = (1..=12).map(|day| early_url(day, "020000")).collect();
        let plan = plan(urls, &variant, dir.path(), CollisionPolicy::FirstWins).await.unwrap();
        let gauge = GaugeTransport::default();
        let options = FetchOptions {
            workers: 2,
            ..quick()
        };

        let report = transfer(&gauge, &variant, plan, &options, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.downloaded.len(), 12);
        let peak = gauge.peak.load(Ordering::SeqCst);
        assert!(peak <= 2, "peak {peak} exceeds 2 workers");
        assert!(peak > 1);
    }

    #[tokio::test]
    async fn test_unwritable_destination_is_stage_fatal() {
        let variant = resolve_variant("imerg_e", None).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("gone");
        let urls: Vec<String> = (1..=4).map(|day| early_url(day, "020000")).collect();
        let plan = plan(urls, &variant, &gone, CollisionPolicy::FirstWins).await.unwrap();
        assert_eq!(plan.tasks.len(), 4);
        let gauge = GaugeTransport::default();
        let cancel = CancellationToken::new();

        let err = transfer(&gauge, &variant, plan, &quick(), &cancel).await.unwrap_err();

        assert!(err.is_stage_fatal(), "{err}");
        assert!(matches!(err, HarvestError::Io { .. }));
        assert!(!gone.exists());
        // the caller's token is not consumed by a stage-local abort
        assert!(!cancel.is_cancelled());
    }
}
