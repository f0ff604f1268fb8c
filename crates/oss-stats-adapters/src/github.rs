//! GitHub repo listing (REST API) and per-repo page data (scraped HTML).

use std::sync::Arc;

use async_trait::async_trait;
use oss_stats_storage::HttpFetcher;
use scraper::Html;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{select_all_attrs, AdapterContext, SourceError};

pub const GITHUB_API_SOURCE: &str = "github-api";
pub const GITHUB_WEB_SOURCE: &str = "github-web";
pub const REPOS_PER_PAGE: usize = 100;
pub const DEFAULT_PAGE_ATTEMPTS: u32 = 3;

const API_BASE: &str = "https://api.github.com";
const WEB_BASE: &str = "https://github.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountKind {
    User,
    Organization,
}

/// One repo as reported by the listing API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GithubRepoListing {
    pub owner: String,
    pub name: String,
    pub stargazers_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoListPage {
    pub repos: Vec<GithubRepoListing>,
    pub next_page: Option<u32>,
}

/// Counters read from one render of a repo page; `None` when absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepoPageCounts {
    pub contributor_count: Option<u64>,
    pub dependent_count: Option<u64>,
}

impl RepoPageCounts {
    pub fn is_complete(&self) -> bool {
        self.contributor_count.is_some() && self.dependent_count.is_some()
    }
}

/// Result of the bounded retry loop over the repo page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepoPageData {
    pub contributor_count: Option<u64>,
    pub dependent_count: Option<u64>,
    pub attempts: u32,
    /// Both counters were read; `false` means the loop gave up.
    pub measured: bool,
}

#[async_trait]
pub trait GithubSource: Send + Sync {
    async fn account_kind(&self, ctx: &AdapterContext, owner: &str)
        -> Result<AccountKind, SourceError>;

    async fn list_repos(
        &self,
        ctx: &AdapterContext,
        owner: &str,
        kind: AccountKind,
        page: u32,
    ) -> Result<RepoListPage, SourceError>;

    async fn get_repo(
        &self,
        ctx: &AdapterContext,
        owner: &str,
        name: &str,
    ) -> Result<GithubRepoListing, SourceError>;

    async fn repo_page_counts(
        &self,
        ctx: &AdapterContext,
        owner: &str,
        name: &str,
    ) -> Result<RepoPageCounts, SourceError>;
}

/// Builds an authenticated source from the access token passed with each sync.
pub trait GithubClientFactory: Send + Sync {
    fn connect(&self, access_token: &str) -> Result<Arc<dyn GithubSource>, SourceError>;
}

/// Every repo of `owner`, probing the account kind first.
pub async fn list_all_repos(
    source: &dyn GithubSource,
    ctx: &AdapterContext,
    owner: &str,
) -> Result<Vec<GithubRepoListing>, SourceError> {
    let kind = source.account_kind(ctx, owner).await?;
    let mut repos = Vec::new();
    let mut page = 1;
    loop {
        let listing = source.list_repos(ctx, owner, kind, page).await?;
        debug!(owner, page, count = listing.repos.len(), "listed repos page");
        repos.extend(listing.repos);
        match listing.next_page {
            Some(next) if next > page => page = next,
            _ => break,
        }
    }
    Ok(repos)
}

/// Reads the repo page up to `max_attempts` times until both counters show up.
pub async fn fetch_repo_page_data(
    source: &dyn GithubSource,
    ctx: &AdapterContext,
    owner: &str,
    name: &str,
    max_attempts: u32,
) -> Result<RepoPageData, SourceError> {
    let max_attempts = max_attempts.max(1);
    let mut best = RepoPageCounts::default();
    let mut attempts = 0;
    let mut last_error = None;
    let mut any_success = false;
    while attempts < max_attempts {
        attempts += 1;
        let counts = match source.repo_page_counts(ctx, owner, name).await {
            Ok(counts) => counts,
            Err(err) if err.is_not_found() => return Err(err),
            Err(err) => {
                warn!(owner, repo = name, attempt = attempts, error = %err, "repo page fetch failed");
                last_error = Some(err);
                continue;
            }
        };
        any_success = true;
        best.contributor_count = counts.contributor_count.or(best.contributor_count);
        best.dependent_count = counts.dependent_count.or(best.dependent_count);
        if best.is_complete() {
            break;
        }
        debug!(owner, repo = name, attempt = attempts, "repo page incomplete");
    }

    if !any_success {
        return Err(SourceError::Transient {
            key: format!("{owner}/{name}"),
            attempts,
            message: last_error.map(|e| e.to_string()).unwrap_or_default(),
        });
    }

    Ok(RepoPageData {
        contributor_count: best.contributor_count,
        dependent_count: best.dependent_count,
        attempts,
        measured: best.is_complete(),
    })
}

fn parse_counter(title: &str) -> Option<u64> {
    title.replace(',', "").trim().parse::<u64>().ok().filter(|n| *n > 0)
}

/// Extracts the contributor and dependent counters from a repo page.
///
/// Each counter is the first `span.Counter` under a link ending in the given
/// path whose `title` parses as a non-zero number.
pub fn parse_repo_page_counts(html: &str) -> Result<RepoPageCounts, SourceError> {
    let document = Html::parse_document(html);
    let counter = |suffix: &str| -> Result<Option<u64>, SourceError> {
        let selector = format!(r#"a[href$="{suffix}"] > span.Counter"#);
        Ok(select_all_attrs(&document, &selector, "title")?
            .iter()
            .find_map(|title| parse_counter(title)))
    };
    Ok(RepoPageCounts {
        contributor_count: counter("graphs/contributors")?,
        dependent_count: counter("network/dependents")?,
    })
}

#[derive(Debug, Deserialize)]
struct ApiAccount {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct ApiOwner {
    login: String,
}

#[derive(Debug, Deserialize)]
struct ApiRepo {
    name: String,
    owner: ApiOwner,
    #[serde(default)]
    stargazers_count: u64,
}

impl From<ApiRepo> for GithubRepoListing {
    fn from(repo: ApiRepo) -> Self {
        Self {
            owner: repo.owner.login,
            name: repo.name,
            stargazers_count: repo.stargazers_count,
        }
    }
}

pub fn parse_account_kind(body: &[u8]) -> Result<AccountKind, SourceError> {
    let account: ApiAccount = serde_json::from_slice(body).map_err(|e| SourceError::Parse {
        what: "github account",
        message: e.to_string(),
    })?;
    Ok(if account.kind == "Organization" {
        AccountKind::Organization
    } else {
        AccountKind::User
    })
}

pub fn parse_repo_list(body: &[u8], page: u32) -> Result<RepoListPage, SourceError> {
    let repos: Vec<ApiRepo> = serde_json::from_slice(body).map_err(|e| SourceError::Parse {
        what: "github repo list",
        message: e.to_string(),
    })?;
    let next_page = (repos.len() >= REPOS_PER_PAGE).then_some(page + 1);
    Ok(RepoListPage {
        repos: repos.into_iter().map(Into::into).collect(),
        next_page,
    })
}

/// [`GithubSource`] backed by the REST API and the public web pages.
#[derive(Debug, Clone)]
pub struct HttpGithubSource {
    fetcher: Arc<HttpFetcher>,
    authorization: String,
}

impl HttpGithubSource {
    pub fn new(fetcher: Arc<HttpFetcher>, access_token: &str) -> Self {
        Self {
            fetcher,
            authorization: format!("Bearer {access_token}"),
        }
    }

    async fn api_get(
        &self,
        ctx: &AdapterContext,
        url: &str,
        kind: &'static str,
        key: &str,
    ) -> Result<Vec<u8>, SourceError> {
        let headers = [
            ("authorization", self.authorization.as_str()),
            ("accept", "application/vnd.github+json"),
            ("x-github-api-version", "2022-11-28"),
        ];
        self.fetcher
            .fetch_bytes(ctx.run_id, GITHUB_API_SOURCE, url, &headers)
            .await
            .map(|resp| resp.body)
            .map_err(|err| SourceError::from_fetch(err, kind, key))
    }
}

#[async_trait]
impl GithubSource for HttpGithubSource {
    async fn account_kind(
        &self,
        ctx: &AdapterContext,
        owner: &str,
    ) -> Result<AccountKind, SourceError> {
        let url = format!("{API_BASE}/users/{owner}");
        let body = self.api_get(ctx, &url, "github owner", owner).await?;
        parse_account_kind(&body)
    }

    async fn list_repos(
        &self,
        ctx: &AdapterContext,
        owner: &str,
        kind: AccountKind,
        page: u32,
    ) -> Result<RepoListPage, SourceError> {
        let scope = match kind {
            AccountKind::Organization => "orgs",
            AccountKind::User => "users",
        };
        let url = format!("{API_BASE}/{scope}/{owner}/repos?per_page={REPOS_PER_PAGE}&page={page}");
        let body = self.api_get(ctx, &url, "github owner", owner).await?;
        parse_repo_list(&body, page)
    }

    async fn get_repo(
        &self,
        ctx: &AdapterContext,
        owner: &str,
        name: &str,
    ) -> Result<GithubRepoListing, SourceError> {
        let url = format!("{API_BASE}/repos/{owner}/{name}");
        let key = format!("{owner}/{name}");
        let body = self.api_get(ctx, &url, "github repo", &key).await?;
        let repo: ApiRepo = serde_json::from_slice(&body).map_err(|e| SourceError::Parse {
            what: "github repo",
            message: e.to_string(),
        })?;
        Ok(repo.into())
    }

    async fn repo_page_counts(
        &self,
        ctx: &AdapterContext,
        owner: &str,
        name: &str,
    ) -> Result<RepoPageCounts, SourceError> {
        let url = format!("{WEB_BASE}/{owner}/{name}");
        let key = format!("{owner}/{name}");
        let resp = self
            .fetcher
            .fetch_bytes(ctx.run_id, GITHUB_WEB_SOURCE, &url, &[("accept", "text/html")])
            .await
            .map_err(|err| SourceError::from_fetch(err, "github repo", &key))?;
        parse_repo_page_counts(&String::from_utf8_lossy(&resp.body))
    }
}

/// Shares one fetcher across every token-scoped source it hands out.
#[derive(Debug, Clone)]
pub struct HttpGithubConnector {
    fetcher: Arc<HttpFetcher>,
}

impl HttpGithubConnector {
    pub fn new(fetcher: Arc<HttpFetcher>) -> Self {
        Self { fetcher }
    }
}

impl GithubClientFactory for HttpGithubConnector {
    fn connect(&self, access_token: &str) -> Result<Arc<dyn GithubSource>, SourceError> {
        if access_token.trim().is_empty() {
            return Err(SourceError::Parse {
                what: "github access token",
                message: "token is empty".into(),
            });
        }
        Ok(Arc::new(HttpGithubSource::new(self.fetcher.clone(), access_token)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    struct FlakyPage {
        calls: AtomicU32,
        responses: Vec<RepoPageCounts>,
    }

    #[async_trait]
    impl GithubSource for FlakyPage {
        async fn account_kind(&self, _: &AdapterContext, _: &str) -> Result<AccountKind, SourceError> {
            Ok(AccountKind::User)
        }

        async fn list_repos(
            &self,
            _: &AdapterContext,
            _: &str,
            _: AccountKind,
            _: u32,
        ) -> Result<RepoListPage, SourceError> {
            Ok(RepoListPage { repos: vec![], next_page: None })
        }

        async fn get_repo(&self, _: &AdapterContext, owner: &str, name: &str) -> Result<GithubRepoListing, SourceError> {
            Err(SourceError::NotFound {
                kind: "github repo",
                key: format!("{owner}/{name}"),
            })
        }

        async fn repo_page_counts(&self, _: &AdapterContext, _: &str, _: &str) -> Result<RepoPageCounts, SourceError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            Ok(self.responses.get(n).copied().unwrap_or_default())
        }
    }

    fn ctx() -> AdapterContext {
        AdapterContext::new(Uuid::nil())
    }

    #[tokio::test]
    async fn page_data_stops_once_both_counters_are_read() {
        let source = FlakyPage {
            calls: AtomicU32::new(0),
            responses: vec![
                RepoPageCounts { contributor_count: Some(12), dependent_count: None },
                RepoPageCounts { contributor_count: Some(12), dependent_count: Some(340) },
            ],
        };
        let data = fetch_repo_page_data(&source, &ctx(), "acme", "widget", 3).await.unwrap();
        assert_eq!(data.attempts, 2);
        assert!(data.measured);
        assert_eq!(data.dependent_count, Some(340));
    }

    #[tokio::test]
    async fn page_data_gives_up_after_bound_and_keeps_partial_values() {
        let source = FlakyPage {
            calls: AtomicU32::new(0),
            responses: vec![RepoPageCounts { contributor_count: Some(7), dependent_count: None }],
        };
        let data = fetch_repo_page_data(&source, &ctx(), "acme", "widget", 3).await.unwrap();
        assert_eq!(data.attempts, 3);
        assert!(!data.measured);
        assert_eq!(data.contributor_count, Some(7));
        assert_eq!(data.dependent_count, None);
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn counters_skip_zero_and_unparseable_titles() {
        let html = r#"
            <a href="/acme/widget/graphs/contributors"><span class="Counter" title="">x</span></a>
            <a href="/acme/widget/graphs/contributors"><span class="Counter" title="1,204">1.2k</span></a>
            <a href="/acme/widget/network/dependents"><span class="Counter" title="0">0</span></a>
        "#;
        let counts = parse_repo_page_counts(html).unwrap();
        assert_eq!(counts.contributor_count, Some(1204));
        assert_eq!(counts.dependent_count, None);
    }

    #[test]
    fn repo_list_reports_next_page_only_when_full() {
        let one = br#"[{"name":"w","owner":{"login":"Acme"},"stargazers_count":3}]"#;
        let page = parse_repo_list(one, 1).unwrap();
        assert_eq!(page.next_page, None);
        assert_eq!(page.repos[0].owner, "Acme");

        let full: Vec<serde_json::Value> = (0..REPOS_PER_PAGE)
            .map(|i| serde_json::json!({"name": format!("r{i}"), "owner": {"login": "acme"}, "stargazers_count": i}))
            .collect();
        let body = serde_json::to_vec(&full).unwrap();
        assert_eq!(parse_repo_list(&body, 2).unwrap().next_page, Some(3));
    }

    #[test]
    fn organization_accounts_are_detected() {
        assert_eq!(parse_account_kind(br#"{"type":"Organization"}"#).unwrap(), AccountKind::Organization);
        assert_eq!(parse_account_kind(br#"{"type":"User"}"#).unwrap(), AccountKind::User);
        assert!(parse_account_kind(b"not json").is_err());
    }
}
