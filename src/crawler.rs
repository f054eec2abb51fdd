//! Remote URL discovery.
//!
//! Walks a variant's dated listing pages for one year and keeps every anchor
//! whose target passes the variant's [`LinkFilter`]. Listings are plain HTML
//! directory indexes, so discovery is a straight scrape of `a[href]`.
//!
//! # Concurrency
//!
//! Months are crawled through a pool of `month_workers`. For daily layouts
//! each month crawls its days through its own pool of `day_workers`, so at
//! most `month_workers × day_workers` listing requests are outstanding.
//!
//! # Failure policy
//!
//! A listing that answers anything but 200, or cannot be fetched at all,
//! contributes zero URLs and a warning. It never aborts the crawl.

use crate::config::{Layout, LinkFilter, Variant};
use crate::date::DateExtractor;
use crate::error::{HarvestError, Result};
use crate::manifest;
use crate::models::RemoteAsset;
use crate::transport::Transport;
use chrono::{Datelike, NaiveDate};
use futures::stream::{self, StreamExt};
use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

static ANCHOR_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("a[href]").expect("static anchor selector"));

/// Pool sizes for the two crawl levels.
#[derive(Debug, Clone, Copy)]
pub struct CrawlLimits {
    pub month_workers: usize,
    pub day_workers: usize,
}

impl Default for CrawlLimits {
    fn default() -> Self {
        Self {
            month_workers: 4,
            day_workers: 8,
        }
    }
}

/// Everything found while crawling one year.
#[derive(Debug, Default)]
pub struct CrawlReport {
    pub assets: Vec<RemoteAsset>,
    /// Listing pages requested.
    pub pages: usize,
    /// Listing pages that yielded nothing because they failed.
    pub failed_pages: Vec<String>,
}

impl CrawlReport {
    /// Manifest-ordered, deduplicated URLs.
    pub fn urls(&self) -> Vec<String> {
        manifest::normalize(self.assets.iter().map(|a| a.url.clone()))
    }

    /// Assets whose URL carries no recognisable capture date.
    pub fn undated(&self) -> usize {
        self.assets.iter().filter(|a| a.date.is_none()).count()
    }
}

/// Outcome of the `discover` stage.
#[derive(Debug)]
pub struct DiscoverSummary {
    pub year: i32,
    pub pages: usize,
    pub failed_pages: usize,
    pub urls: usize,
    pub undated: usize,
}

/// Number of days in `month` of `year`.
pub fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(0)
}

/// Resolve the anchors of a listing page that pass `filter`.
pub fn extract_links(html: &str, base: &Url, filter: &LinkFilter) -> Vec<String> {
    let document = Html::parse_document(html);
    let mut links = Vec::new();
    for element in document.select(&ANCHOR_SELECTOR) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        if !filter.matches(href) {
            continue;
        }
        match base.join(href) {
            Ok(resolved) => links.push(resolved.to_string()),
            Err(e) => debug!(%href, error = %e, "Unresolvable link skipped"),
        }
    }
    links
}

struct PageOutcome {
    url: String,
    links: Option<Vec<String>>,
}

/// Crawls listing pages of one variant through a shared transport.
pub struct Crawler<'a, T> {
    transport: &'a T,
    variant: &'a Variant,
    limits: CrawlLimits,
    cancel: CancellationToken,
}

impl<'a, T> Crawler<'a, T>
where
    T: Transport,
{
    pub fn new(
        transport: &'a T,
        variant: &'a Variant,
        limits: CrawlLimits,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            variant,
            limits,
            cancel,
        }
    }

    /// Listing pages for one month of `year`.
    fn month_pages(&self, year: i32, month: u32) -> Result<Vec<Url>> {
        match self.variant.layout() {
            Layout::Monthly => Ok(vec![self.variant.listing_url(year, month, None)?]),
            Layout::Daily => (1..=days_in_month(year, month))
                .map(|day| self.variant.listing_url(year, month, Some(day)))
                .collect(),
        }
    }

    /// Crawl all twelve months of `year`. Returns once every listing has
    /// answered or failed.
    #[instrument(level = "info", skip_all, fields(variant = %self.variant.name(), year = year))]
    pub async fn crawl_year(&self, year: i32) -> Result<CrawlReport> {
        let plan = (1..=12u32)
            .map(|month| Ok((month, self.month_pages(year, month)?)))
            .collect::<Result<Vec<_>>>()?;

        let months: Vec<Vec<PageOutcome>> = stream::iter(plan)
            .map(|(month, pages)| async move {
                let outcomes = self.crawl_month(pages).await;
                let found: usize = outcomes
                    .iter()
                    .filter_map(|o| o.links.as_ref().map(Vec::len))
                    .sum();
                info!(year, month, found, "Processed month");
                outcomes
            })
            .buffer_unordered(self.limits.month_workers.max(1))
            .collect()
            .await;

        if self.cancel.is_cancelled() {
            return Err(HarvestError::Cancelled);
        }

        let mut report = CrawlReport::default();
        for outcome in months.into_iter().flatten() {
            report.pages += 1;
            match outcome.links {
                Some(links) => {
                    report.assets.extend(links.into_iter().map(|url| RemoteAsset {
                        date: self.variant.extractor().extract(&url),
                        url,
                        variant: self.variant.name().to_string(),
                    }));
                }
                None => report.failed_pages.push(outcome.url),
            }
        }
        report.failed_pages.sort();
        Ok(report)
    }

    async fn crawl_month(&self, pages: Vec<Url>) -> Vec<PageOutcome> {
        stream::iter(pages)
            .map(|page| self.crawl_page(page))
            .buffer_unordered(self.limits.day_workers.max(1))
            .collect()
            .await
    }

    #[instrument(level = "debug", skip_all, fields(url = %page))]
    async fn crawl_page(&self, page: Url) -> PageOutcome {
        let url = page.to_string();
        if self.cancel.is_cancelled() {
            return PageOutcome { url, links: None };
        }
        let res = tokio::select! {
            _ = self.cancel.cancelled() => Err(HarvestError::Cancelled),
            res = self.transport.get(&url) => res,
        };
        let links = match res {
            Ok(body) if body.status == 200 => {
                let links = extract_links(&body.text(), &page, self.variant.filter());
                debug!(count = links.len(), "Listing parsed");
                Some(links)
            }
            Ok(body) => {
                warn!(%url, status = body.status, "Cannot access listing");
                None
            }
            Err(e) => {
                warn!(%url, error = %e, "Listing request failed");
                None
            }
        };
        PageOutcome { url, links }
    }
}

/// Crawl `year` and replace its manifest with the result.
///
/// # Arguments
///
/// * `transport` - Sends the listing requests; failures count as empty pages
/// * `variant` - Listing template, layout and link filter
/// * `limits` - Month and day pool sizes
/// * `cancel` - Aborts the crawl without touching the manifest
/// * `manifest_path` - Usually `urls/{year}.txt`
/// * `year` - Calendar year to enumerate
///
/// # Returns
///
/// A [`DiscoverSummary`] once the manifest is written. The manifest is
/// written even when nothing was found. A cancelled crawl returns
/// [`HarvestError::Cancelled`] and leaves the previous manifest in place.
///
/// # Example
///
/// ```ignore
/// let summary = discover(&transport, &variant, limits, cancel, &path, 2024).await?;
/// info!(urls = summary.urls, "Discovered");
/// ```
#[instrument(level = "info", skip_all, fields(variant = %variant.name(), year = year))]
pub async fn discover<T: Transport>(
    transport: &T,
    variant: &Variant,
    limits: CrawlLimits,
    cancel: CancellationToken,
    manifest_path: &Path,
    year: i32,
) -> Result<DiscoverSummary> {
    let report = Crawler::new(transport, variant, limits, cancel)
        .crawl_year(year)
        .await?;
    let urls = report.urls();
    if urls.is_empty() {
        warn!(year, "No URLs found; writing empty manifest");
    }
    if report.undated() > 0 {
        warn!(
            undated = report.undated(),
            "Some links carry no date token and will fail to fetch"
        );
    }
    manifest::write_manifest(manifest_path, &urls).await?;
    info!(path = %manifest_path.display(), count = urls.len(), "URL list saved");

    Ok(DiscoverSummary {
        year,
        pages: report.pages,
        failed_pages: report.failed_pages.len(),
        urls: urls.len(),
        undated: report.undated(),
    })
}
