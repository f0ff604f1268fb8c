//! Sync orchestration for oss-stats: configuration, the reconciliation layer,
//! the read-side queries, interval scheduling, and clear-and-resync.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use oss_stats_adapters::github::GITHUB_WEB_SOURCE;
use oss_stats_adapters::{HttpGithubConnector, HttpNpmSource, SourceError};
use oss_stats_storage::{HttpClientConfig, HttpFetcher, StoreError};
use thiserror::Error;

pub mod clear;
pub mod config;
pub mod orchestrator;
pub mod query;
pub mod reconcile;
pub mod schedule;

pub use clear::{clear_and_sync, clear_table, ClearAndSyncReport, ClearStats, CLEAR_PAGE_SIZE};
pub use config::{ConfigError, SourcesFile, StatsConfig, SyncArgs};
pub use orchestrator::{
    spawn_scheduled_runs, FailedUnit, SyncLimits, SyncOrchestrator, SyncReport, SyncStats,
    SYNC_JOB_NAME,
};
pub use query::StatsQuery;
pub use reconcile::{
    PackageUpdate, Reconciler, RepoUpdate, StarEventOutcome, UpsertOutcome,
};
pub use schedule::{
    CronIntervalScheduler, InMemoryScheduler, IntervalScheduler, ReplaceOutcome, ScheduledJob,
    ScheduledRun,
};

pub const CRATE_NAME: &str = "oss-stats-sync";

/// Concurrent page scrapes allowed against the GitHub website.
pub const GITHUB_WEB_CONCURRENCY: usize = 10;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{kind} `{key}` not found")]
    NotFound { kind: &'static str, key: String },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("scheduler: {0}")]
    Schedule(String),
    #[error("serializing row: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    pub fn not_found(kind: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            key: key.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Source(err) => err.is_not_found(),
            _ => false,
        }
    }
}

pub fn http_client_config(config: &StatsConfig) -> HttpClientConfig {
    HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        rate_limit: config.rate_limit,
        ..Default::default()
    }
    .with_source_limit(GITHUB_WEB_SOURCE, GITHUB_WEB_CONCURRENCY)
}

/// HTTP-backed GitHub and npm sources sharing one rate-limited fetcher.
pub fn http_sources(
    config: &StatsConfig,
) -> anyhow::Result<(Arc<HttpGithubConnector>, Arc<HttpNpmSource>)> {
    let fetcher = Arc::new(
        HttpFetcher::new(http_client_config(config)).context("building http fetcher")?,
    );
    Ok((
        Arc::new(HttpGithubConnector::new(fetcher.clone())),
        Arc::new(HttpNpmSource::new(fetcher)),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_not_found_counts_as_not_found() {
        let err = SyncError::from(SourceError::NotFound {
            kind: "npm org",
            key: "ghost".into(),
        });
        assert!(err.is_not_found());
        assert!(SyncError::not_found("github owner", "acme").is_not_found());
        assert!(!SyncError::Schedule("boom".into()).is_not_found());
    }
}
