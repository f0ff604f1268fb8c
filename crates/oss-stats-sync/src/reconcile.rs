//! Idempotent upserts that merge fetched values into stored rows and keep
//! owner/org aggregates equal to the sum of their children.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use oss_stats_core::{
    normalize_name, Clock, DayOfWeekAverages, DependentSnapshot, GithubOwner, GithubRepo, NpmOrg,
    NpmPackage,
};
use oss_stats_storage::{DocId, DocumentStore, KeyMatch, Table};
use serde::Serialize;
use tracing::{debug, info};

use crate::SyncError;

/// Freshly fetched repo counters; `None` means "not measured this pass".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepoUpdate {
    pub star_count: Option<u64>,
    pub contributor_count: Option<u64>,
    pub dependent_count: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PackageUpdate {
    pub download_count: Option<u64>,
    pub day_of_week_averages: Option<DayOfWeekAverages>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StarEventOutcome {
    pub repo_created: bool,
    pub owner_star_count: u64,
}

/// Zero and `None` both mean "keep what is stored".
fn merge_count(existing: u64, incoming: Option<u64>) -> u64 {
    match incoming {
        Some(value) if value > 0 => value,
        _ => existing,
    }
}

fn measured(incoming: Option<u64>) -> Option<u64> {
    incoming.filter(|v| *v > 0)
}

fn saturating_sum(values: impl Iterator<Item = u64>) -> u64 {
    values.fold(0, u64::saturating_add)
}

fn to_body<T: Serialize>(row: &T) -> Result<serde_json::Value, SyncError> {
    Ok(serde_json::to_value(row)?)
}

#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn find_row<T: serde::de::DeserializeOwned>(
        &self,
        table: Table,
        key: &KeyMatch,
    ) -> Result<Option<(DocId, T)>, SyncError> {
        match self.store.find(table, key).await? {
            Some(doc) => Ok(Some((doc.id, doc.decode()?))),
            None => Ok(None),
        }
    }

    pub(crate) async fn find_owner(&self, owner: &str) -> Result<Option<(DocId, GithubOwner)>, SyncError> {
        let key = KeyMatch::new().eq("nameNormalized", normalize_name(owner));
        self.find_row(Table::GithubOwners, &key).await
    }

    pub(crate) async fn find_repo(
        &self,
        owner: &str,
        name: &str,
    ) -> Result<Option<(DocId, GithubRepo)>, SyncError> {
        let key = KeyMatch::new()
            .eq("ownerNormalized", normalize_name(owner))
            .eq("nameNormalized", normalize_name(name));
        self.find_row(Table::GithubRepos, &key).await
    }

    pub(crate) async fn find_npm_org(&self, name: &str) -> Result<Option<(DocId, NpmOrg)>, SyncError> {
        self.find_row(Table::NpmOrgs, &KeyMatch::new().eq("name", name))
            .await
    }

    pub(crate) async fn find_npm_package(
        &self,
        name: &str,
    ) -> Result<Option<(DocId, NpmPackage)>, SyncError> {
        self.find_row(Table::NpmPackages, &KeyMatch::new().eq("name", name))
            .await
    }

    async fn repos_of(&self, owner: &str) -> Result<Vec<GithubRepo>, SyncError> {
        let filter = KeyMatch::new().eq("ownerNormalized", normalize_name(owner));
        self.store
            .collect(Table::GithubRepos, &filter)
            .await?
            .iter()
            .map(|doc| doc.decode().map_err(SyncError::from))
            .collect()
    }

    async fn packages_of(&self, org: &str) -> Result<Vec<NpmPackage>, SyncError> {
        let filter = KeyMatch::new().eq("org", org);
        self.store
            .collect(Table::NpmPackages, &filter)
            .await?
            .iter()
            .map(|doc| doc.decode().map_err(SyncError::from))
            .collect()
    }

    /// Inserts or merges one repo row.
    ///
    /// A present counter is never overwritten by a zero or missing incoming
    /// value, and the dependent baseline moves at most once per refresh
    /// interval.
    pub async fn upsert_repo(
        &self,
        owner: &str,
        name: &str,
        update: RepoUpdate,
    ) -> Result<UpsertOutcome, SyncError> {
        let now = self.clock.now();
        let Some((id, existing)) = self.find_repo(owner, name).await? else {
            let dependent = measured(update.dependent_count);
            let row = GithubRepo {
                owner: owner.to_string(),
                owner_normalized: normalize_name(owner),
                name: name.to_string(),
                name_normalized: normalize_name(name),
                star_count: update.star_count.unwrap_or(0),
                contributor_count: update.contributor_count.unwrap_or(0),
                dependent_count: dependent.unwrap_or(0),
                dependent_count_previous: None,
                dependent_count_updated_at: dependent.map(|_| now),
                updated_at: now,
            };
            self.store.insert(Table::GithubRepos, to_body(&row)?).await?;
            debug!(owner, repo = name, "repo created");
            return Ok(UpsertOutcome::Created);
        };

        let star_count = merge_count(existing.star_count, update.star_count);
        let contributor_count = merge_count(existing.contributor_count, update.contributor_count);
        let dependent_count = merge_count(existing.dependent_count, update.dependent_count);

        if star_count == existing.star_count
            && contributor_count == existing.contributor_count
            && dependent_count == existing.dependent_count
        {
            return Ok(UpsertOutcome::Unchanged);
        }

        let mut next = existing.clone();
        next.star_count = star_count;
        next.contributor_count = contributor_count;
        next.updated_at = now;
        if dependent_count != existing.dependent_count {
            next.dependent_count = dependent_count;
            next.dependent_count_updated_at = Some(now);
            let baseline_due = existing
                .dependent_count_previous
                .map_or(true, |prev| prev.is_stale(now));
            if baseline_due && existing.dependent_count > 0 {
                next.dependent_count_previous = Some(DependentSnapshot {
                    count: existing.dependent_count,
                    updated_at: existing.dependent_count_updated_at.unwrap_or(existing.updated_at),
                });
            }
        }

        self.store.patch(id, to_body(&next)?).await?;
        debug!(owner, repo = name, star_count, "repo updated");
        Ok(UpsertOutcome::Updated)
    }

    /// Stores zeros over every counter of a repo, the only way to do so.
    pub async fn reset_repo_counts(&self, owner: &str, name: &str) -> Result<(), SyncError> {
        let (id, _) = self
            .find_repo(owner, name)
            .await?
            .ok_or_else(|| SyncError::not_found("github repo", format!("{owner}/{name}")))?;
        let patch = serde_json::json!({
            "starCount": 0,
            "contributorCount": 0,
            "dependentCount": 0,
            "dependentCountPrevious": null,
            "dependentCountUpdatedAt": null,
            "updatedAt": self.clock.now().timestamp_millis(),
        });
        self.store.patch(id, patch).await?;
        info!(owner, repo = name, "repo counts reset");
        Ok(())
    }

    /// Recomputes an owner's totals from its repos, creating the owner row
    /// on first use.
    pub async fn upsert_owner_aggregate(&self, owner: &str) -> Result<UpsertOutcome, SyncError> {
        let now = self.clock.now();
        let repos = self.repos_of(owner).await?;
        let star_count = saturating_sum(repos.iter().map(|r| r.star_count));
        let contributor_count = saturating_sum(repos.iter().map(|r| r.contributor_count));
        let dependent_count = saturating_sum(repos.iter().map(|r| r.dependent_count));

        let (id, existing, created) = match self.find_owner(owner).await? {
            Some((id, row)) => (Some(id), row, false),
            None => (None, GithubOwner::empty(owner, now), true),
        };

        let baseline_due = existing
            .dependent_count_previous
            .map_or(true, |prev| prev.is_stale(now));
        let counts_changed = star_count != existing.star_count
            || contributor_count != existing.contributor_count
            || dependent_count != existing.dependent_count;

        if !created && !counts_changed && !baseline_due {
            return Ok(UpsertOutcome::Unchanged);
        }

        let mut next = existing.clone();
        next.star_count = star_count;
        next.contributor_count = contributor_count;
        next.dependent_count = dependent_count;
        next.updated_at = now;
        if dependent_count != existing.dependent_count {
            next.dependent_count_updated_at = Some(now);
        }
        if baseline_due {
            // The snapshot keeps the time its count was measured. A zero
            // baseline would exaggerate the implied growth rate.
            let snapshot = if existing.dependent_count > 0 {
                DependentSnapshot {
                    count: existing.dependent_count,
                    updated_at: existing.dependent_count_updated_at.unwrap_or(existing.updated_at),
                }
            } else {
                DependentSnapshot {
                    count: dependent_count,
                    updated_at: now,
                }
            };
            next.dependent_count_previous = Some(snapshot);
        }

        match id {
            Some(id) => self.store.patch(id, to_body(&next)?).await?,
            None => {
                self.store.insert(Table::GithubOwners, to_body(&next)?).await?;
            }
        }
        info!(owner, star_count, contributor_count, dependent_count, repos = repos.len(), "owner aggregate updated");
        Ok(if created {
            UpsertOutcome::Created
        } else {
            UpsertOutcome::Updated
        })
    }

    /// Applies a single repo's new star count from a webhook delivery.
    ///
    /// The owner must already exist. An unknown repo is created with the
    /// given stars. The owner total is clamped at zero.
    pub async fn apply_star_event(
        &self,
        owner: &str,
        name: &str,
        star_count: u64,
    ) -> Result<StarEventOutcome, SyncError> {
        let now = self.clock.now();
        let (owner_id, owner_row) = self
            .find_owner(owner)
            .await?
            .ok_or_else(|| SyncError::not_found("github owner", owner))?;

        let (old_stars, repo_created) = match self.find_repo(owner, name).await? {
            Some((repo_id, repo)) => {
                let patch = serde_json::json!({
                    "starCount": star_count,
                    "updatedAt": now.timestamp_millis(),
                });
                self.store.patch(repo_id, patch).await?;
                (repo.star_count, false)
            }
            None => {
                let row = GithubRepo {
                    owner: owner_row.name.clone(),
                    owner_normalized: owner_row.name_normalized.clone(),
                    name: name.to_string(),
                    name_normalized: normalize_name(name),
                    star_count,
                    contributor_count: 0,
                    dependent_count: 0,
                    dependent_count_previous: None,
                    dependent_count_updated_at: None,
                    updated_at: now,
                };
                self.store.insert(Table::GithubRepos, to_body(&row)?).await?;
                (0, true)
            }
        };

        let total = i128::from(owner_row.star_count) - i128::from(old_stars) + i128::from(star_count);
        let owner_star_count = u64::try_from(total.max(0)).unwrap_or(u64::MAX);
        let patch = serde_json::json!({
            "starCount": owner_star_count,
            "updatedAt": now.timestamp_millis(),
        });
        self.store.patch(owner_id, patch).await?;
        info!(owner, repo = name, star_count, owner_star_count, repo_created, "star event applied");

        Ok(StarEventOutcome {
            repo_created,
            owner_star_count,
        })
    }

    /// Inserts or merges one package row. `org` is only written when given.
    pub async fn upsert_npm_package(
        &self,
        name: &str,
        org: Option<&str>,
        update: PackageUpdate,
    ) -> Result<UpsertOutcome, SyncError> {
        let now = self.clock.now();
        let Some((id, existing)) = self.find_npm_package(name).await? else {
            let row = NpmPackage {
                name: name.to_string(),
                org: org.map(str::to_string),
                download_count: update.download_count.unwrap_or(0),
                download_count_updated_at: now,
                day_of_week_averages: update.day_of_week_averages.unwrap_or_default(),
                updated_at: now,
            };
            self.store.insert(Table::NpmPackages, to_body(&row)?).await?;
            debug!(package = name, org, "package created");
            return Ok(UpsertOutcome::Created);
        };

        let org_changed = org.is_some_and(|o| existing.org.as_deref() != Some(o));
        let download_count = merge_count(existing.download_count, update.download_count);
        let averages = update
            .day_of_week_averages
            .unwrap_or(existing.day_of_week_averages);

        if download_count == existing.download_count && !org_changed {
            return Ok(UpsertOutcome::Unchanged);
        }

        let mut next = existing.clone();
        if org_changed {
            next.org = org.map(str::to_string);
        }
        next.download_count = download_count;
        next.day_of_week_averages = averages;
        next.download_count_updated_at = now;
        next.updated_at = now;
        self.store.patch(id, to_body(&next)?).await?;
        debug!(package = name, download_count, "package updated");
        Ok(UpsertOutcome::Updated)
    }

    /// Deletes a package row if present; returns whether one was removed.
    pub async fn remove_npm_package(&self, name: &str) -> Result<bool, SyncError> {
        match self.find_npm_package(name).await? {
            Some((id, _)) => {
                self.store.delete(id).await?;
                info!(package = name, "package removed");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Recomputes an org's totals from its packages. A zero or unchanged
    /// total leaves the stored row alone.
    pub async fn upsert_npm_org_aggregate(&self, org: &str) -> Result<UpsertOutcome, SyncError> {
        let now = self.clock.now();
        let packages = self.packages_of(org).await?;
        let download_count = saturating_sum(packages.iter().map(|p| p.download_count));
        let averages = packages
            .iter()
            .fold(DayOfWeekAverages::default(), |acc, p| {
                acc.saturating_add(p.day_of_week_averages)
            });

        let existing = self.find_npm_org(org).await?;
        let created = existing.is_none();
        let (id, current) = match existing {
            Some((id, row)) => (Some(id), row),
            None => (None, NpmOrg::empty(org, now)),
        };

        if download_count == 0 || download_count == current.download_count {
            if created {
                self.store.insert(Table::NpmOrgs, to_body(&current)?).await?;
                return Ok(UpsertOutcome::Created);
            }
            return Ok(UpsertOutcome::Unchanged);
        }

        let next = NpmOrg {
            download_count,
            download_count_updated_at: now,
            day_of_week_averages: averages,
            updated_at: now,
            ..current
        };
        match id {
            Some(id) => self.store.patch(id, to_body(&next)?).await?,
            None => {
                self.store.insert(Table::NpmOrgs, to_body(&next)?).await?;
            }
        }
        info!(org, download_count, packages = packages.len(), "org aggregate updated");
        Ok(if created {
            UpsertOutcome::Created
        } else {
            UpsertOutcome::Updated
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use oss_stats_core::{github_dependent_forecast, ManualClock};
    use oss_stats_storage::MemoryStore;

    fn setup() -> (Reconciler, Arc<MemoryStore>, Arc<ManualClock>) {
        let store = Arc::new(MemoryStore::new());
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).single().unwrap();
        let clock = Arc::new(ManualClock::new(start));
        (Reconciler::new(store.clone(), clock.clone()), store, clock)
    }

    fn counts(stars: u64, contributors: u64, dependents: u64) -> RepoUpdate {
        RepoUpdate {
            star_count: Some(stars),
            contributor_count: Some(contributors),
            dependent_count: Some(dependents),
        }
    }

    #[tokio::test]
    async fn repo_upsert_is_idempotent() {
        let (rec, store, _) = setup();
        let first = rec.upsert_repo("Acme", "Widget", counts(10, 4, 2)).await.unwrap();
        let row_after_first = rec.find_repo("acme", "widget").await.unwrap().unwrap().1;
        let second = rec.upsert_repo("Acme", "Widget", counts(10, 4, 2)).await.unwrap();

        assert_eq!(first, UpsertOutcome::Created);
        assert_eq!(second, UpsertOutcome::Unchanged);
        assert_eq!(store.len(Table::GithubRepos).await, 1);
        assert_eq!(rec.find_repo("acme", "widget").await.unwrap().unwrap().1, row_after_first);
        assert_eq!(row_after_first.owner_normalized, "acme");
    }

    #[tokio::test]
    async fn zero_does_not_clobber_measured_counts() {
        let (rec, _, _) = setup();
        rec.upsert_repo("acme", "widget", counts(10, 42, 7)).await.unwrap();
        let outcome = rec
            .upsert_repo(
                "acme",
                "widget",
                RepoUpdate {
                    star_count: Some(11),
                    contributor_count: Some(0),
                    dependent_count: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Updated);
        let repo = rec.find_repo("acme", "widget").await.unwrap().unwrap().1;
        assert_eq!(repo.star_count, 11);
        assert_eq!(repo.contributor_count, 42);
        assert_eq!(repo.dependent_count, 7);
    }

    #[tokio::test]
    async fn reset_is_the_only_way_to_store_zero() {
        let (rec, _, _) = setup();
        rec.upsert_repo("acme", "widget", counts(10, 42, 7)).await.unwrap();
        rec.reset_repo_counts("acme", "widget").await.unwrap();
        let repo = rec.find_repo("acme", "widget").await.unwrap().unwrap().1;
        assert_eq!((repo.star_count, repo.contributor_count, repo.dependent_count), (0, 0, 0));
        assert!(repo.dependent_count_updated_at.is_none());

        assert!(matches!(
            rec.reset_repo_counts("acme", "missing").await,
            Err(SyncError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn owner_aggregate_sums_children() {
        let (rec, _, _) = setup();
        for (i, stars) in [3u64, 5, 0, 100].into_iter().enumerate() {
            rec.upsert_repo("acme", &format!("r{i}"), counts(stars, 1, 2)).await.unwrap();
        }
        rec.upsert_repo("other", "x", counts(999, 9, 9)).await.unwrap();

        assert_eq!(rec.upsert_owner_aggregate("Acme").await.unwrap(), UpsertOutcome::Created);
        let owner = rec.find_owner("acme").await.unwrap().unwrap().1;
        assert_eq!(owner.star_count, 108);
        assert_eq!(owner.contributor_count, 4);
        assert_eq!(owner.dependent_count, 8);
        assert_eq!(owner.name, "Acme");
    }

    #[tokio::test]
    async fn owner_baseline_refresh_is_throttled() {
        let (rec, _, clock) = setup();
        rec.upsert_repo("acme", "a", counts(1, 1, 100)).await.unwrap();
        rec.upsert_owner_aggregate("acme").await.unwrap();
        let first = rec.find_owner("acme").await.unwrap().unwrap().1;
        let baseline = first.dependent_count_previous.unwrap();
        assert_eq!(baseline.count, 100);

        clock.advance(Duration::minutes(10));
        rec.upsert_repo("acme", "a", counts(1, 1, 120)).await.unwrap();
        rec.upsert_owner_aggregate("acme").await.unwrap();
        let second = rec.find_owner("acme").await.unwrap().unwrap().1;
        assert_eq!(second.dependent_count, 120);
        assert_eq!(second.dependent_count_previous, Some(baseline));

        clock.advance(Duration::minutes(50));
        rec.upsert_repo("acme", "a", counts(1, 1, 130)).await.unwrap();
        rec.upsert_owner_aggregate("acme").await.unwrap();
        let third = rec.find_owner("acme").await.unwrap().unwrap().1;
        let refreshed = third.dependent_count_previous.unwrap();
        assert_eq!(refreshed.count, 120);
        assert_eq!(refreshed.updated_at, clock.now() - Duration::minutes(50));
    }

    #[tokio::test]
    async fn hourly_syncs_keep_the_dependent_forecast_moving() {
        let (rec, _, clock) = setup();
        rec.upsert_repo("acme", "a", counts(1, 1, 100)).await.unwrap();
        rec.upsert_owner_aggregate("acme").await.unwrap();

        for dependents in [120u64, 140, 160] {
            let measured_before = clock.now();
            clock.advance(Duration::hours(1));
            rec.upsert_repo("acme", "a", counts(1, 1, dependents)).await.unwrap();
            rec.upsert_owner_aggregate("acme").await.unwrap();

            let owner = rec.find_owner("acme").await.unwrap().unwrap().1;
            let baseline = owner.dependent_count_previous.unwrap();
            assert_eq!(baseline.count, dependents - 20);
            assert_eq!(baseline.updated_at, measured_before);

            let forecast = github_dependent_forecast(
                owner.dependent_count,
                owner.dependent_count_previous.as_ref(),
                owner.updated_at,
            );
            assert!(forecast.range_end > forecast.range_start);
            let half_hour_later = (clock.now() + Duration::minutes(30)).timestamp_millis();
            // 80% of the last +20 over the next hour, half of it elapsed.
            assert_eq!(forecast.estimate(half_hour_later), Some(dependents as i64 + 8));

            let repo = rec.find_repo("acme", "a").await.unwrap().unwrap().1;
            let repo_baseline = repo.dependent_count_previous.unwrap();
            assert_eq!(repo_baseline.count, dependents - 20);
            assert_eq!(repo_baseline.updated_at, measured_before);
        }
    }

    #[tokio::test]
    async fn aggregates_saturate_instead_of_overflowing() {
        let (rec, _, _) = setup();
        rec.upsert_repo("acme", "a", counts(10, 1, 1)).await.unwrap();
        rec.upsert_repo("acme", "b", counts(5, 1, 1)).await.unwrap();
        rec.upsert_owner_aggregate("acme").await.unwrap();

        rec.apply_star_event("acme", "a", u64::MAX).await.unwrap();
        rec.upsert_owner_aggregate("acme").await.unwrap();
        let owner = rec.find_owner("acme").await.unwrap().unwrap().1;
        assert_eq!(owner.star_count, u64::MAX);
        assert_eq!(owner.contributor_count, 2);

        for (name, downloads) in [("@acme/a", u64::MAX), ("@acme/b", 7)] {
            rec.upsert_npm_package(name, Some("acme"), PackageUpdate { download_count: Some(downloads), day_of_week_averages: None })
                .await
                .unwrap();
        }
        rec.upsert_npm_org_aggregate("acme").await.unwrap();
        let org = rec.find_npm_org("acme").await.unwrap().unwrap().1;
        assert_eq!(org.download_count, u64::MAX);
    }

    #[tokio::test]
    async fn unchanged_owner_inside_window_is_not_rewritten() {
        let (rec, _, clock) = setup();
        rec.upsert_repo("acme", "a", counts(5, 1, 1)).await.unwrap();
        rec.upsert_owner_aggregate("acme").await.unwrap();
        clock.advance(Duration::minutes(5));
        assert_eq!(rec.upsert_owner_aggregate("acme").await.unwrap(), UpsertOutcome::Unchanged);
        let owner = rec.find_owner("acme").await.unwrap().unwrap().1;
        assert_ne!(owner.updated_at, clock.now());
    }

    #[tokio::test]
    async fn star_event_clamps_owner_total_at_zero() {
        let (rec, _, _) = setup();
        rec.upsert_repo("acme", "a", counts(10, 1, 1)).await.unwrap();
        rec.upsert_owner_aggregate("acme").await.unwrap();

        // Owner total drifted below the repo's stored stars.
        let (owner_id, _) = rec.find_owner("acme").await.unwrap().unwrap();
        rec.store().patch(owner_id, serde_json::json!({"starCount": 3})).await.unwrap();

        let outcome = rec.apply_star_event("acme", "a", 2).await.unwrap();
        assert_eq!(outcome.owner_star_count, 0);

        // 0 - 2 + MAX never wraps.
        let outcome = rec.apply_star_event("acme", "a", u64::MAX).await.unwrap();
        assert_eq!(outcome.owner_star_count, u64::MAX - 2);
    }

    #[tokio::test]
    async fn star_event_tracks_delta_and_creates_unknown_repos() {
        let (rec, store, _) = setup();
        rec.upsert_repo("acme", "a", counts(10, 1, 1)).await.unwrap();
        rec.upsert_owner_aggregate("acme").await.unwrap();

        let outcome = rec.apply_star_event("acme", "a", 12).await.unwrap();
        assert_eq!(outcome.owner_star_count, 12);
        assert!(!outcome.repo_created);

        let outcome = rec.apply_star_event("ACME", "new-repo", 5).await.unwrap();
        assert!(outcome.repo_created);
        assert_eq!(outcome.owner_star_count, 17);
        assert_eq!(store.len(Table::GithubRepos).await, 2);

        assert!(matches!(
            rec.apply_star_event("nobody", "a", 1).await,
            Err(SyncError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn package_upserts_skip_equal_counts_and_keep_org() {
        let (rec, _, _) = setup();
        let averages = DayOfWeekAverages([1, 2, 3, 4, 5, 6, 7]);
        let update = PackageUpdate {
            download_count: Some(500),
            day_of_week_averages: Some(averages),
        };
        assert_eq!(rec.upsert_npm_package("@acme/a", Some("acme"), update).await.unwrap(), UpsertOutcome::Created);
        assert_eq!(rec.upsert_npm_package("@acme/a", Some("acme"), update).await.unwrap(), UpsertOutcome::Unchanged);

        let outcome = rec
            .upsert_npm_package("@acme/a", None, PackageUpdate { download_count: Some(0), day_of_week_averages: None })
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Unchanged);

        let pkg = rec.find_npm_package("@acme/a").await.unwrap().unwrap().1;
        assert_eq!(pkg.org.as_deref(), Some("acme"));
        assert_eq!(pkg.download_count, 500);
        assert_eq!(pkg.day_of_week_averages, averages);
    }

    #[tokio::test]
    async fn org_aggregate_sums_packages_and_skips_zero() {
        let (rec, _, clock) = setup();
        assert_eq!(rec.upsert_npm_org_aggregate("acme").await.unwrap(), UpsertOutcome::Created);
        let empty = rec.find_npm_org("acme").await.unwrap().unwrap().1;
        assert_eq!(empty.download_count, 0);

        for (name, downloads) in [("@acme/a", 100u64), ("@acme/b", 23)] {
            rec.upsert_npm_package(
                name,
                Some("acme"),
                PackageUpdate {
                    download_count: Some(downloads),
                    day_of_week_averages: Some(DayOfWeekAverages([downloads; 7])),
                },
            )
            .await
            .unwrap();
        }
        rec.upsert_npm_package("solo", None, PackageUpdate { download_count: Some(9), day_of_week_averages: None })
            .await
            .unwrap();

        clock.advance(Duration::minutes(1));
        assert_eq!(rec.upsert_npm_org_aggregate("acme").await.unwrap(), UpsertOutcome::Updated);
        let org = rec.find_npm_org("acme").await.unwrap().unwrap().1;
        assert_eq!(org.download_count, 123);
        assert_eq!(org.day_of_week_averages, DayOfWeekAverages([123; 7]));
        assert_eq!(org.download_count_updated_at, clock.now());

        assert_eq!(rec.upsert_npm_org_aggregate("acme").await.unwrap(), UpsertOutcome::Unchanged);
    }

    #[tokio::test]
    async fn removing_a_package_only_deletes_existing_rows() {
        let (rec, store, _) = setup();
        assert!(!rec.remove_npm_package("ghost").await.unwrap());
        rec.upsert_npm_package("real", None, PackageUpdate { download_count: Some(1), day_of_week_averages: None })
            .await
            .unwrap();
        assert!(rec.remove_npm_package("real").await.unwrap());
        assert_eq!(store.len(Table::NpmPackages).await, 0);
    }
}
