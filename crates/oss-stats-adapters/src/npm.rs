//! npm org listing, package metadata, and download-range statistics.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use oss_stats_core::DayOfWeekAverages;
use oss_stats_storage::HttpFetcher;
use serde::Deserialize;
use tracing::debug;

use crate::{AdapterContext, SourceError};

pub const NPM_WEB_SOURCE: &str = "npm-web";
pub const NPM_REGISTRY_SOURCE: &str = "npm-registry";
pub const NPM_DOWNLOADS_SOURCE: &str = "npm-downloads";

/// Longest range the downloads endpoint answers in one call.
pub const DOWNLOAD_WINDOW_DAYS: i64 = 17 * 30;
pub const TRAILING_WINDOW_DAYS: i64 = 30;
const WEEKS_PER_AVERAGE: u64 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NpmOrgPackage {
    pub name: String,
    pub created: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NpmOrgPage {
    pub packages: Vec<NpmOrgPackage>,
    pub has_more: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct DailyDownloads {
    pub day: NaiveDate,
    pub downloads: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub downloads: Vec<DailyDownloads>,
}

impl DownloadRange {
    pub fn total(&self) -> u64 {
        self.downloads.iter().map(|d| d.downloads).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadStats {
    pub total: u64,
    pub day_of_week_averages: DayOfWeekAverages,
}

#[async_trait]
pub trait NpmSource: Send + Sync {
    /// One page of an org's packages; pages start at 0.
    async fn org_packages(
        &self,
        ctx: &AdapterContext,
        org: &str,
        page: u32,
    ) -> Result<NpmOrgPage, SourceError>;

    async fn package_created(
        &self,
        ctx: &AdapterContext,
        name: &str,
    ) -> Result<DateTime<Utc>, SourceError>;

    async fn download_range(
        &self,
        ctx: &AdapterContext,
        name: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<DownloadRange, SourceError>;
}

pub async fn list_all_org_packages(
    source: &dyn NpmSource,
    ctx: &AdapterContext,
    org: &str,
) -> Result<Vec<NpmOrgPackage>, SourceError> {
    let mut packages = Vec::new();
    let mut page = 0;
    loop {
        let listing = source.org_packages(ctx, org, page).await?;
        let empty = listing.packages.is_empty();
        packages.extend(listing.packages);
        if !listing.has_more || empty {
            break;
        }
        page += 1;
    }
    Ok(packages)
}

/// Walks download windows from `created` to `today`, then averages the
/// trailing window per weekday.
pub async fn fetch_download_stats(
    source: &dyn NpmSource,
    ctx: &AdapterContext,
    name: &str,
    created: NaiveDate,
    today: NaiveDate,
) -> Result<DownloadStats, SourceError> {
    let mut from = created.min(today);
    let mut total: u64 = 0;
    loop {
        let to = (from + Duration::days(DOWNLOAD_WINDOW_DAYS)).min(today);
        let range = source.download_range(ctx, name, from, to).await?;
        total = total.saturating_add(range.total());
        debug!(package = name, %from, %to, running_total = total, "download window");

        // Progress is driven by the requested bound so a short `end` cannot stall the walk.
        from = range.end.max(to) + Duration::days(1);
        if range.end >= today || from > today {
            break;
        }
    }

    let trailing = source
        .download_range(ctx, name, today - Duration::days(TRAILING_WINDOW_DAYS), today)
        .await?;

    Ok(DownloadStats {
        total,
        day_of_week_averages: day_of_week_averages(&trailing.downloads),
    })
}

/// Mean of each weekday's last four occurrences, index 0 = Sunday.
pub fn day_of_week_averages(days: &[DailyDownloads]) -> DayOfWeekAverages {
    let mut sorted = days.to_vec();
    sorted.sort_by_key(|d| d.day);

    let mut slots = [0u64; 7];
    for (weekday, slot) in slots.iter_mut().enumerate() {
        let sum: u64 = sorted
            .iter()
            .rev()
            .filter(|d| d.day.weekday().num_days_from_sunday() as usize == weekday)
            .take(WEEKS_PER_AVERAGE as usize)
            .map(|d| d.downloads)
            .sum();
        *slot = (sum + WEEKS_PER_AVERAGE / 2) / WEEKS_PER_AVERAGE;
    }
    DayOfWeekAverages(slots)
}

#[derive(Debug, Deserialize)]
struct ScopeInfo {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct CreatedTs {
    ts: i64,
}

#[derive(Debug, Deserialize)]
struct OrgPackageObject {
    name: String,
    created: Option<CreatedTs>,
}

#[derive(Debug, Default, Deserialize)]
struct OrgPackageUrls {
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrgPackages {
    objects: Vec<OrgPackageObject>,
    #[serde(default)]
    urls: OrgPackageUrls,
}

#[derive(Debug, Deserialize)]
struct OrgPageBody {
    scope: Option<ScopeInfo>,
    packages: Option<OrgPackages>,
    message: Option<String>,
}

pub fn parse_org_page(org: &str, body: &[u8]) -> Result<NpmOrgPage, SourceError> {
    let data: OrgPageBody = serde_json::from_slice(body).map_err(|e| SourceError::Parse {
        what: "npm org page",
        message: e.to_string(),
    })?;

    if data.packages.is_none() && data.message.as_deref() == Some("NotFoundError: Scope not found")
    {
        return Err(SourceError::NotFound {
            kind: "npm org",
            key: org.to_string(),
        });
    }
    if data.scope.as_ref().is_some_and(|s| s.kind == "user") {
        return Err(SourceError::NotAnOrg(org.to_string()));
    }
    let packages = data.packages.ok_or_else(|| SourceError::Parse {
        what: "npm org page",
        message: format!("no packages listed for {org}"),
    })?;

    Ok(NpmOrgPage {
        packages: packages
            .objects
            .into_iter()
            .map(|obj| NpmOrgPackage {
                name: obj.name,
                created: obj
                    .created
                    .and_then(|c| Utc.timestamp_millis_opt(c.ts).single()),
            })
            .collect(),
        has_more: packages.urls.next.is_some_and(|next| !next.is_empty()),
    })
}

#[derive(Debug, Deserialize)]
struct PackageTimes {
    created: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct PackageInfoBody {
    time: Option<PackageTimes>,
    error: Option<String>,
}

pub fn parse_package_created(name: &str, body: &[u8]) -> Result<DateTime<Utc>, SourceError> {
    let data: PackageInfoBody = serde_json::from_slice(body).map_err(|e| SourceError::Parse {
        what: "npm package info",
        message: e.to_string(),
    })?;
    match (data.time, data.error) {
        (_, Some(error)) if error == "Not found" => Err(SourceError::NotFound {
            kind: "npm package",
            key: name.to_string(),
        }),
        (_, Some(error)) => Err(SourceError::Parse {
            what: "npm package info",
            message: error,
        }),
        (Some(time), None) => Ok(time.created),
        (None, None) => Err(SourceError::Parse {
            what: "npm package info",
            message: format!("no creation time for {name}"),
        }),
    }
}

#[derive(Debug, Deserialize)]
struct DownloadRangeBody {
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    #[serde(default)]
    downloads: Vec<DailyDownloads>,
    error: Option<String>,
}

pub fn parse_download_range(
    name: &str,
    from: NaiveDate,
    to: NaiveDate,
    body: &[u8],
) -> Result<DownloadRange, SourceError> {
    let data: DownloadRangeBody = serde_json::from_slice(body).map_err(|e| SourceError::Parse {
        what: "npm download range",
        message: e.to_string(),
    })?;
    if let Some(error) = data.error {
        if error.contains("not found") {
            return Err(SourceError::NotFound {
                kind: "npm package",
                key: name.to_string(),
            });
        }
        return Err(SourceError::Parse {
            what: "npm download range",
            message: error,
        });
    }
    Ok(DownloadRange {
        start: data.start.unwrap_or(from),
        end: data.end.unwrap_or(to),
        downloads: data.downloads,
    })
}

/// [`NpmSource`] over the public npm website, registry, and downloads API.
#[derive(Debug, Clone)]
pub struct HttpNpmSource {
    fetcher: Arc<HttpFetcher>,
}

impl HttpNpmSource {
    pub fn new(fetcher: Arc<HttpFetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl NpmSource for HttpNpmSource {
    async fn org_packages(
        &self,
        ctx: &AdapterContext,
        org: &str,
        page: u32,
    ) -> Result<NpmOrgPage, SourceError> {
        let url = format!("https://www.npmjs.com/org/{org}?page={page}");
        let headers = [("cache-control", "no-cache"), ("x-spiferack", "1")];
        let resp = self
            .fetcher
            .fetch_bytes(ctx.run_id, NPM_WEB_SOURCE, &url, &headers)
            .await
            .map_err(|err| SourceError::from_fetch(err, "npm org", org))?;
        parse_org_page(org, &resp.body)
    }

    async fn package_created(
        &self,
        ctx: &AdapterContext,
        name: &str,
    ) -> Result<DateTime<Utc>, SourceError> {
        let url = format!("https://registry.npmjs.com/{name}");
        let resp = self
            .fetcher
            .fetch_bytes(ctx.run_id, NPM_REGISTRY_SOURCE, &url, &[])
            .await
            .map_err(|err| SourceError::from_fetch(err, "npm package", name))?;
        parse_package_created(name, &resp.body)
    }

    async fn download_range(
        &self,
        ctx: &AdapterContext,
        name: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<DownloadRange, SourceError> {
        let url = format!("https://api.npmjs.org/downloads/range/{from}:{to}/{name}");
        let resp = self
            .fetcher
            .fetch_bytes(ctx.run_id, NPM_DOWNLOADS_SOURCE, &url, &[])
            .await
            .map_err(|err| SourceError::from_fetch(err, "npm package", name))?;
        parse_download_range(name, from, to, &resp.body)
    }
}
