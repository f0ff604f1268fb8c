//! Source fetchers: GitHub repo listings and page data, npm org listings and
//! download statistics.

use chrono::{DateTime, NaiveDate, Utc};
use oss_stats_storage::FetchError;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod github;
pub mod npm;

pub use github::{
    fetch_repo_page_data, list_all_repos, parse_repo_page_counts, AccountKind,
    GithubClientFactory, GithubRepoListing, GithubSource, HttpGithubConnector, HttpGithubSource,
    RepoListPage, RepoPageCounts, RepoPageData,
};
pub use npm::{
    day_of_week_averages, fetch_download_stats, list_all_org_packages, DailyDownloads,
    DownloadRange, DownloadStats, HttpNpmSource, NpmOrgPackage, NpmOrgPage, NpmSource,
};

pub const CRATE_NAME: &str = "oss-stats-adapters";

/// Per-run context threaded through every fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new(run_id: Uuid) -> Self {
        Self::at(run_id, Utc::now())
    }

    pub fn at(run_id: Uuid, fetched_at: DateTime<Utc>) -> Self {
        Self { run_id, fetched_at }
    }

    pub fn today(&self) -> NaiveDate {
        self.fetched_at.date_naive()
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{kind} `{key}` not found")]
    NotFound { kind: &'static str, key: String },
    #[error("`{0}` is an npm user scope, not an org")]
    NotAnOrg(String),
    #[error("{key}: gave up after {attempts} attempts: {message}")]
    Transient {
        key: String,
        attempts: u32,
        message: String,
    },
    #[error(transparent)]
    Fetch(FetchError),
    #[error("parsing {what}: {message}")]
    Parse { what: &'static str, message: String },
}

impl SourceError {
    /// Maps an HTTP 404 onto `NotFound` for the given entity.
    pub fn from_fetch(err: FetchError, kind: &'static str, key: &str) -> Self {
        if err.is_not_found() {
            Self::NotFound {
                kind,
                key: key.to_string(),
            }
        } else {
            Self::Fetch(err)
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Fetch(err) => err.is_not_found(),
            _ => false,
        }
    }
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_selector(selector: &str) -> Result<Selector, SourceError> {
    Selector::parse(selector).map_err(|e| SourceError::Parse {
        what: "css selector",
        message: e.to_string(),
    })
}

pub(crate) fn select_all_attrs(
    document: &Html,
    selector: &str,
    attr: &str,
) -> Result<Vec<String>, SourceError> {
    let sel = parse_selector(selector)?;
    Ok(document
        .select(&sel)
        .filter_map(|n| n.value().attr(attr))
        .filter_map(text_or_none)
        .collect())
}
