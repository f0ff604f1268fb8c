//! One sync pass: fetch GitHub and npm in parallel, reconcile, then
//! re-register the recurring job.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use oss_stats_adapters::{
    fetch_download_stats, fetch_repo_page_data, list_all_org_packages, list_all_repos,
    AdapterContext, GithubClientFactory, GithubRepoListing, GithubSource, NpmOrgPackage,
    NpmSource, SourceError,
};
use oss_stats_core::{normalize_name, RepoRef};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::SyncArgs;
use crate::reconcile::{PackageUpdate, Reconciler, RepoUpdate, UpsertOutcome};
use crate::schedule::{IntervalScheduler, ScheduledJob, ScheduledRun};
use crate::SyncError;

pub const SYNC_JOB_NAME: &str = "sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncLimits {
    pub owners: usize,
    pub repos_per_owner: usize,
    pub orgs: usize,
    pub packages_per_org: usize,
    pub page_attempts: u32,
}

impl Default for SyncLimits {
    fn default() -> Self {
        Self {
            owners: 5,
            repos_per_owner: 4,
            orgs: 2,
            packages_per_org: 20,
            page_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
}

impl SyncStats {
    pub fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Created => self.created += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::Unchanged => self.unchanged += 1,
        }
    }

    fn merge(&mut self, other: SyncStats) {
        self.created += other.created;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.failed += other.failed;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedUnit {
    pub kind: String,
    pub key: String,
    pub error: String,
}

/// Counts gathered by one unit of work, merged into the run report.
#[derive(Debug, Default)]
struct Tally {
    repos: SyncStats,
    owners: SyncStats,
    packages: SyncStats,
    orgs: SyncStats,
    failed: Vec<FailedUnit>,
    removed_packages: Vec<String>,
}

impl Tally {
    fn fail(&mut self, kind: &str, key: &str, error: &dyn std::fmt::Display) {
        warn!(kind, key, error = %error, "sync unit failed, skipping");
        self.failed.push(FailedUnit {
            kind: kind.to_string(),
            key: key.to_string(),
            error: error.to_string(),
        });
    }

    fn merge(&mut self, other: Tally) {
        self.repos.merge(other.repos);
        self.owners.merge(other.owners);
        self.packages.merge(other.packages);
        self.orgs.merge(other.orgs);
        self.failed.extend(other.failed);
        self.removed_packages.extend(other.removed_packages);
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub repos: SyncStats,
    pub owners: SyncStats,
    pub packages: SyncStats,
    pub orgs: SyncStats,
    pub failed: Vec<FailedUnit>,
    pub removed_packages: Vec<String>,
    pub rescheduled: bool,
}

pub struct SyncOrchestrator {
    github: Arc<dyn GithubClientFactory>,
    npm: Arc<dyn NpmSource>,
    reconciler: Reconciler,
    scheduler: Arc<dyn IntervalScheduler>,
    limits: SyncLimits,
    interval: Duration,
}

impl SyncOrchestrator {
    pub fn new(
        github: Arc<dyn GithubClientFactory>,
        npm: Arc<dyn NpmSource>,
        reconciler: Reconciler,
        scheduler: Arc<dyn IntervalScheduler>,
    ) -> Self {
        Self {
            github,
            npm,
            reconciler,
            scheduler,
            limits: SyncLimits::default(),
            interval: Duration::from_secs(crate::config::DEFAULT_SYNC_INTERVAL_SECS),
        }
    }

    pub fn with_limits(mut self, limits: SyncLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Runs one full pass. Per-unit failures are recorded in the report; the
    /// recurring job is re-registered regardless.
    pub async fn run(&self, args: &SyncArgs) -> Result<SyncReport, SyncError> {
        let run_id = Uuid::new_v4();
        let started_at = self.reconciler.now();
        let ctx = AdapterContext::at(run_id, started_at);
        let span = info_span!("sync_run", %run_id);

        let tally = async {
            info!(
                owners = args.github_owners.len(),
                repos = args.github_repos.len(),
                orgs = args.npm_orgs.len(),
                packages = args.npm_packages.len(),
                "sync started"
            );
            let (mut github, npm) = tokio::join!(self.sync_github(&ctx, args), self.sync_npm(&ctx, args));
            github.merge(npm);
            github
        }
        .instrument(span.clone())
        .await;

        let rescheduled = self.reschedule(args).instrument(span).await;

        let report = SyncReport {
            run_id,
            started_at,
            finished_at: self.reconciler.now(),
            repos: tally.repos,
            owners: tally.owners,
            packages: tally.packages,
            orgs: tally.orgs,
            failed: tally.failed,
            removed_packages: tally.removed_packages,
            rescheduled,
        };
        info!(
            %run_id,
            failed = report.failed.len(),
            rescheduled,
            "sync finished"
        );
        Ok(report)
    }

    async fn reschedule(&self, args: &SyncArgs) -> bool {
        let job = ScheduledJob {
            name: SYNC_JOB_NAME.to_string(),
            interval: self.interval,
            args: args.clone(),
        };
        match self.scheduler.replace_or_create(job).await {
            Ok(outcome) => {
                info!(?outcome, "recurring sync registered");
                true
            }
            Err(err) => {
                warn!(error = %err, "could not register recurring sync");
                false
            }
        }
    }

    async fn sync_github(&self, ctx: &AdapterContext, args: &SyncArgs) -> Tally {
        let mut tally = Tally::default();
        if args.github_owners.is_empty() && args.github_repos.is_empty() {
            return tally;
        }
        let connected = match self.github.connect(&args.github_access_token) {
            Ok(source) => source,
            Err(err) => {
                tally.fail("github", "connect", &err);
                return tally;
            }
        };

        let source = connected.as_ref();
        let min_stars = args.min_stars;
        let owners: Vec<Tally> = stream::iter(args.github_owners.clone())
            .map(|owner| async move { self.sync_owner(source, ctx, &owner, min_stars).await })
            .buffer_unordered(self.limits.owners.max(1))
            .collect()
            .await;
        for owner in owners {
            tally.merge(owner);
        }

        if !args.github_repos.is_empty() {
            tally.merge(self.sync_explicit_repos(source, ctx, &args.github_repos, min_stars).await);
        }
        tally
    }

    async fn sync_owner(
        &self,
        source: &dyn GithubSource,
        ctx: &AdapterContext,
        owner: &str,
        min_stars: u64,
    ) -> Tally {
        let mut tally = Tally::default();
        let listings = match list_all_repos(source, ctx, owner).await {
            Ok(listings) => listings,
            Err(err) => {
                tally.owners.failed += 1;
                tally.fail("github owner", owner, &err);
                return tally;
            }
        };

        let results: Vec<Tally> = stream::iter(listings)
            .map(|listing| self.sync_repo(source, ctx, listing, min_stars))
            .buffer_unordered(self.limits.repos_per_owner.max(1))
            .collect()
            .await;
        for result in results {
            tally.merge(result);
        }

        match self.reconciler.upsert_owner_aggregate(owner).await {
            Ok(outcome) => tally.owners.record(outcome),
            Err(err) => {
                tally.owners.failed += 1;
                tally.fail("github owner", owner, &err);
            }
        }
        tally
    }

    async fn sync_repo(
        &self,
        source: &dyn GithubSource,
        ctx: &AdapterContext,
        listing: GithubRepoListing,
        min_stars: u64,
    ) -> Tally {
        let mut tally = Tally::default();
        let key = format!("{}/{}", listing.owner, listing.name);
        let mut update = RepoUpdate {
            star_count: Some(listing.stargazers_count),
            ..Default::default()
        };

        if listing.stargazers_count >= min_stars {
            match fetch_repo_page_data(source, ctx, &listing.owner, &listing.name, self.limits.page_attempts).await {
                Ok(page) => {
                    if !page.measured {
                        warn!(repo = %key, attempts = page.attempts, "repo page data incomplete");
                    }
                    update.contributor_count = page.contributor_count;
                    update.dependent_count = page.dependent_count;
                }
                Err(err) => warn!(repo = %key, error = %err, "repo page data unavailable"),
            }
        }

        match self
            .reconciler
            .upsert_repo(&listing.owner, &listing.name, update)
            .await
        {
            Ok(outcome) => tally.repos.record(outcome),
            Err(err) => {
                tally.repos.failed += 1;
                tally.fail("github repo", &key, &err);
            }
        }
        tally
    }

    async fn sync_explicit_repos(
        &self,
        source: &dyn GithubSource,
        ctx: &AdapterContext,
        repos: &[RepoRef],
        min_stars: u64,
    ) -> Tally {
        let mut tally = Tally::default();
        let results: Vec<(Option<String>, Tally)> = stream::iter(repos.to_vec())
            .map(|repo| async move {
                match source.get_repo(ctx, &repo.owner, &repo.name).await {
                    Ok(listing) => {
                        let owner = listing.owner.clone();
                        (Some(owner), self.sync_repo(source, ctx, listing, min_stars).await)
                    }
                    Err(err) => {
                        let mut failed = Tally::default();
                        failed.repos.failed += 1;
                        failed.fail("github repo", &repo.to_string(), &err);
                        (None, failed)
                    }
                }
            })
            .buffer_unordered(self.limits.repos_per_owner.max(1))
            .collect()
            .await;

        let mut owners = BTreeSet::new();
        for (owner, result) in results {
            if let Some(owner) = owner {
                owners.insert((normalize_name(&owner), owner));
            }
            tally.merge(result);
        }
        for (_, owner) in owners {
            match self.reconciler.upsert_owner_aggregate(&owner).await {
                Ok(outcome) => tally.owners.record(outcome),
                Err(err) => {
                    tally.owners.failed += 1;
                    tally.fail("github owner", &owner, &err);
                }
            }
        }
        tally
    }

    async fn sync_npm(&self, ctx: &AdapterContext, args: &SyncArgs) -> Tally {
        let mut tally = Tally::default();
        let orgs: Vec<Tally> = stream::iter(args.npm_orgs.clone())
            .map(|org| async move { self.sync_org(ctx, &org).await })
            .buffer_unordered(self.limits.orgs.max(1))
            .collect()
            .await;
        for org in orgs {
            tally.merge(org);
        }

        let packages: Vec<Tally> = stream::iter(args.npm_packages.clone())
            .map(|name| async move { self.sync_direct_package(ctx, &name).await })
            .buffer_unordered(self.limits.packages_per_org.max(1))
            .collect()
            .await;
        for package in packages {
            tally.merge(package);
        }
        tally
    }

    async fn sync_org(&self, ctx: &AdapterContext, org: &str) -> Tally {
        let mut tally = Tally::default();
        let packages = match list_all_org_packages(self.npm.as_ref(), ctx, org).await {
            Ok(packages) => packages,
            Err(err) => {
                tally.orgs.failed += 1;
                tally.fail("npm org", org, &err);
                return tally;
            }
        };

        let results: Vec<Tally> = stream::iter(packages)
            .map(|pkg| self.sync_org_package(ctx, org, pkg))
            .buffer_unordered(self.limits.packages_per_org.max(1))
            .collect()
            .await;
        for result in results {
            tally.merge(result);
        }

        match self.reconciler.upsert_npm_org_aggregate(org).await {
            Ok(outcome) => tally.orgs.record(outcome),
            Err(err) => {
                tally.orgs.failed += 1;
                tally.fail("npm org", org, &err);
            }
        }
        tally
    }

    async fn sync_org_package(&self, ctx: &AdapterContext, org: &str, pkg: NpmOrgPackage) -> Tally {
        let created = match pkg.created {
            Some(created) => Ok(created),
            None => self.npm.package_created(ctx, &pkg.name).await,
        };
        let stats = match created {
            Ok(created) => {
                fetch_download_stats(self.npm.as_ref(), ctx, &pkg.name, created.date_naive(), ctx.today()).await
            }
            Err(err) => Err(err),
        };
        self.apply_package_stats(&pkg.name, Some(org), stats).await
    }

    async fn sync_direct_package(&self, ctx: &AdapterContext, name: &str) -> Tally {
        let stats = match self.npm.package_created(ctx, name).await {
            Ok(created) => {
                fetch_download_stats(self.npm.as_ref(), ctx, name, created.date_naive(), ctx.today()).await
            }
            Err(err) => Err(err),
        };
        self.apply_package_stats(name, None, stats).await
    }

    async fn apply_package_stats(
        &self,
        name: &str,
        org: Option<&str>,
        stats: Result<oss_stats_adapters::DownloadStats, SourceError>,
    ) -> Tally {
        let mut tally = Tally::default();
        match stats {
            Ok(stats) => {
                let update = PackageUpdate {
                    download_count: Some(stats.total),
                    day_of_week_averages: Some(stats.day_of_week_averages),
                };
                match self.reconciler.upsert_npm_package(name, org, update).await {
                    Ok(outcome) => tally.packages.record(outcome),
                    Err(err) => {
                        tally.packages.failed += 1;
                        tally.fail("npm package", name, &err);
                    }
                }
            }
            Err(err) if err.is_not_found() && org.is_some() => {
                match self.reconciler.remove_npm_package(name).await {
                    Ok(true) => tally.removed_packages.push(name.to_string()),
                    Ok(false) => info!(package = name, "package not found, nothing stored"),
                    Err(remove_err) => {
                        tally.packages.failed += 1;
                        tally.fail("npm package", name, &remove_err);
                    }
                }
            }
            Err(err) => {
                tally.packages.failed += 1;
                tally.fail("npm package", name, &err);
            }
        }
        tally
    }
}

/// Feeds every scheduled firing into `orchestrator.run`, one run at a time.
pub fn spawn_scheduled_runs(
    orchestrator: Arc<SyncOrchestrator>,
    mut runs: mpsc::UnboundedReceiver<ScheduledRun>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(run) = runs.recv().await {
            info!(job = %run.job_name, "scheduled sync starting");
            if let Err(err) = orchestrator.run(&run.args).await {
                warn!(job = %run.job_name, error = %err, "scheduled sync failed");
            }
        }
    })
}
