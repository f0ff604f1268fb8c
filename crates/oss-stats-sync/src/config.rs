use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use oss_stats_core::RepoRef;
use oss_stats_storage::RateLimit;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "./oss-stats.yaml";
pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 20;
pub const DEFAULT_SCHEDULER_NAMESPACE: &str = "oss-stats";
pub const DEFAULT_WEBHOOK_PATH: &str = "/events/github";
pub const DEFAULT_MIN_STARS: u64 = 1;
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 60 * 60;
pub const DEFAULT_RATE_LIMIT_REFILL_MS: u64 = 1000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("{key} has an invalid value `{value}`")]
    Invalid { key: &'static str, value: String },
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// The tracked owners, orgs, repos and packages, read from YAML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesFile {
    pub github_owners: Vec<String>,
    pub github_repos: Vec<RepoRef>,
    pub npm_orgs: Vec<String>,
    pub npm_packages: Vec<String>,
    pub min_stars: u64,
    pub sync_interval_secs: u64,
    pub webhook_path: String,
}

impl Default for SourcesFile {
    fn default() -> Self {
        Self {
            github_owners: Vec::new(),
            github_repos: Vec::new(),
            npm_orgs: Vec::new(),
            npm_packages: Vec::new(),
            min_stars: DEFAULT_MIN_STARS,
            sync_interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
            webhook_path: DEFAULT_WEBHOOK_PATH.to_string(),
        }
    }
}

/// Reads the sources file; a missing file yields empty lists.
pub fn load_sources_file(path: &Path) -> Result<SourcesFile, ConfigError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(SourcesFile::default()),
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    if text.trim().is_empty() {
        return Ok(SourcesFile::default());
    }
    serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Clone)]
pub struct StatsConfig {
    pub github_access_token: String,
    pub github_webhook_secret: String,
    pub database_url: Option<String>,
    pub config_path: PathBuf,
    pub port: u16,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    /// Outbound request pacing; off unless `OSS_STATS_RATE_LIMIT_BURST` is set.
    pub rate_limit: Option<RateLimit>,
    pub scheduler_namespace: String,
    pub sources: SourcesFile,
}

impl fmt::Debug for StatsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatsConfig")
            .field("github_access_token", &"<redacted>")
            .field("github_webhook_secret", &"<redacted>")
            .field("database_url", &self.database_url.as_ref().map(|_| "<set>"))
            .field("config_path", &self.config_path)
            .field("port", &self.port)
            .field("user_agent", &self.user_agent)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("rate_limit", &self.rate_limit)
            .field("scheduler_namespace", &self.scheduler_namespace)
            .field("sources", &self.sources)
            .finish()
    }
}

impl StatsConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let github_access_token = required("GITHUB_ACCESS_TOKEN")?;
        let github_webhook_secret = required("GITHUB_WEBHOOK_SECRET")?;

        let number = |key: &'static str| -> Result<Option<u64>, ConfigError> {
            get(key)
                .map(|value| {
                    value
                        .trim()
                        .parse::<u64>()
                        .map_err(|_| ConfigError::Invalid { key, value })
                })
                .transpose()
        };

        let port = match number("OSS_STATS_PORT")? {
            Some(port) => u16::try_from(port).map_err(|_| ConfigError::Invalid {
                key: "OSS_STATS_PORT",
                value: port.to_string(),
            })?,
            None => DEFAULT_PORT,
        };
        let http_timeout_secs =
            number("OSS_STATS_HTTP_TIMEOUT_SECS")?.unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS);

        let refill_ms = number("OSS_STATS_RATE_LIMIT_REFILL_MS")?.unwrap_or(DEFAULT_RATE_LIMIT_REFILL_MS);
        let rate_limit = match number("OSS_STATS_RATE_LIMIT_BURST")? {
            Some(burst) => Some(RateLimit {
                burst: u32::try_from(burst).ok().filter(|b| *b > 0).ok_or(ConfigError::Invalid {
                    key: "OSS_STATS_RATE_LIMIT_BURST",
                    value: burst.to_string(),
                })?,
                refill_every: Duration::from_millis(refill_ms.max(1)),
            }),
            None => None,
        };

        let config_path = get("OSS_STATS_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        let sources = load_sources_file(&config_path)?;

        Ok(Self {
            github_access_token,
            github_webhook_secret,
            database_url: get("DATABASE_URL"),
            config_path,
            port,
            user_agent: get("OSS_STATS_USER_AGENT")
                .unwrap_or_else(|| format!("oss-stats/{}", env!("CARGO_PKG_VERSION"))),
            http_timeout_secs,
            rate_limit,
            scheduler_namespace: get("OSS_STATS_SCHEDULER_NAMESPACE")
                .unwrap_or_else(|| DEFAULT_SCHEDULER_NAMESPACE.to_string()),
            sources,
        })
    }

    pub fn sync_args(&self) -> SyncArgs {
        SyncArgs {
            github_access_token: self.github_access_token.clone(),
            github_owners: self.sources.github_owners.clone(),
            github_repos: self.sources.github_repos.clone(),
            npm_orgs: self.sources.npm_orgs.clone(),
            npm_packages: self.sources.npm_packages.clone(),
            min_stars: self.sources.min_stars,
        }
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sources.sync_interval_secs.max(1))
    }
}

fn default_min_stars() -> u64 {
    DEFAULT_MIN_STARS
}

/// Arguments of one sync run, also stored with the recurring job.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncArgs {
    pub github_access_token: String,
    #[serde(default)]
    pub github_owners: Vec<String>,
    #[serde(default)]
    pub github_repos: Vec<RepoRef>,
    #[serde(default)]
    pub npm_orgs: Vec<String>,
    #[serde(default)]
    pub npm_packages: Vec<String>,
    #[serde(default = "default_min_stars")]
    pub min_stars: u64,
}

impl fmt::Debug for SyncArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncArgs")
            .field("github_access_token", &"<redacted>")
            .field("github_owners", &self.github_owners)
            .field("github_repos", &self.github_repos)
            .field("npm_orgs", &self.npm_orgs)
            .field("npm_packages", &self.npm_packages)
            .field("min_stars", &self.min_stars)
            .finish()
    }
}
