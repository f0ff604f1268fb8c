use std::sync::Arc;

use futures_util::future::try_join_all;
use oss_stats_core::{
    normalize_name, DayOfWeekAverages, GithubOwner, GithubRepo, NpmOrg, NpmPackage,
    NpmPackageSummary,
};
use oss_stats_storage::{DocumentStore, KeyMatch, Table};
use serde::de::DeserializeOwned;

use crate::SyncError;

/// Read side: lookups return `None` for keys that were never synced.
#[derive(Clone)]
pub struct StatsQuery {
    store: Arc<dyn DocumentStore>,
}

impl StatsQuery {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    async fn lookup<T: DeserializeOwned>(
        &self,
        table: Table,
        key: KeyMatch,
    ) -> Result<Option<T>, SyncError> {
        match self.store.find(table, &key).await? {
            Some(doc) => Ok(Some(doc.decode()?)),
            None => Ok(None),
        }
    }

    pub async fn get_github_owner(&self, owner: &str) -> Result<Option<GithubOwner>, SyncError> {
        let key = KeyMatch::new().eq("nameNormalized", normalize_name(owner));
        self.lookup(Table::GithubOwners, key).await
    }

    /// One entry per requested owner, in request order.
    pub async fn get_github_owners(
        &self,
        owners: &[String],
    ) -> Result<Vec<Option<GithubOwner>>, SyncError> {
        try_join_all(owners.iter().map(|owner| self.get_github_owner(owner))).await
    }

    pub async fn get_all_github_owners(
        &self,
        configured: &[String],
    ) -> Result<Vec<GithubOwner>, SyncError> {
        Ok(self
            .get_github_owners(configured)
            .await?
            .into_iter()
            .flatten()
            .collect())
    }

    pub async fn get_github_repo(
        &self,
        owner: &str,
        name: &str,
    ) -> Result<Option<GithubRepo>, SyncError> {
        let key = KeyMatch::new()
            .eq("ownerNormalized", normalize_name(owner))
            .eq("nameNormalized", normalize_name(name));
        self.lookup(Table::GithubRepos, key).await
    }

    pub async fn get_npm_org(&self, name: &str) -> Result<Option<NpmOrg>, SyncError> {
        self.lookup(Table::NpmOrgs, KeyMatch::new().eq("name", name))
            .await
    }

    pub async fn get_npm_orgs(&self, names: &[String]) -> Result<Vec<Option<NpmOrg>>, SyncError> {
        try_join_all(names.iter().map(|name| self.get_npm_org(name))).await
    }

    pub async fn get_all_npm_orgs(&self, configured: &[String]) -> Result<Vec<NpmOrg>, SyncError> {
        Ok(self
            .get_npm_orgs(configured)
            .await?
            .into_iter()
            .flatten()
            .collect())
    }

    pub async fn get_npm_package(&self, name: &str) -> Result<Option<NpmPackage>, SyncError> {
        self.lookup(Table::NpmPackages, KeyMatch::new().eq("name", name))
            .await
    }

    /// Totals across the named packages; unknown names contribute nothing.
    pub async fn get_npm_packages(&self, names: &[String]) -> Result<NpmPackageSummary, SyncError> {
        let packages = try_join_all(names.iter().map(|name| self.get_npm_package(name))).await?;
        Ok(packages.into_iter().flatten().fold(
            NpmPackageSummary {
                download_count: 0,
                day_of_week_averages: DayOfWeekAverages::default(),
                download_count_updated_at: None,
                updated_at: None,
            },
            |acc, pkg| NpmPackageSummary {
                download_count: acc.download_count.saturating_add(pkg.download_count),
                day_of_week_averages: acc
                    .day_of_week_averages
                    .saturating_add(pkg.day_of_week_averages),
                download_count_updated_at: acc
                    .download_count_updated_at
                    .max(Some(pkg.download_count_updated_at)),
                updated_at: acc.updated_at.max(Some(pkg.updated_at)),
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use oss_stats_core::{Clock, ManualClock};
    use oss_stats_storage::MemoryStore;

    use crate::reconcile::{PackageUpdate, Reconciler, RepoUpdate};

    async fn seeded() -> (StatsQuery, Arc<ManualClock>) {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(1_700_000_000, 0).single().unwrap()));
        let rec = Reconciler::new(store.clone(), clock.clone());
        rec.upsert_repo(
            "Acme",
            "widget",
            RepoUpdate {
                star_count: Some(40),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        rec.upsert_owner_aggregate("Acme").await.unwrap();
        for (name, downloads) in [("a", 10u64), ("b", 5)] {
            clock.advance(chrono::Duration::seconds(30));
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
        rec.upsert_npm_org_aggregate("acme").await.unwrap();
        (StatsQuery::new(store), clock)
    }

    #[tokio::test]
    async fn batch_lookups_preserve_order_and_cardinality() {
        let (query, _) = seeded().await;
        let names = vec!["missing".to_string(), "ACME".to_string(), "missing".to_string()];
        let owners = query.get_github_owners(&names).await.unwrap();
        assert_eq!(owners.len(), 3);
        assert!(owners[0].is_none());
        assert_eq!(owners[1].as_ref().map(|o| o.star_count), Some(40));
        assert!(owners[2].is_none());

        let all = query.get_all_github_owners(&names).await.unwrap();
        assert_eq!(all.len(), 1);

        let orgs = query
            .get_npm_orgs(&["acme".to_string(), "nope".to_string()])
            .await
            .unwrap();
        assert_eq!(orgs[0].as_ref().map(|o| o.download_count), Some(15));
        assert!(orgs[1].is_none());
    }

    #[tokio::test]
    async fn package_summary_sums_found_packages() {
        let (query, clock) = seeded().await;
        let summary = query
            .get_npm_packages(&["a".to_string(), "b".to_string(), "ghost".to_string()])
            .await
            .unwrap();
        assert_eq!(summary.download_count, 15);
        assert_eq!(summary.day_of_week_averages, DayOfWeekAverages([15; 7]));
        assert_eq!(summary.updated_at, Some(clock.now()));

        let empty = query.get_npm_packages(&[]).await.unwrap();
        assert_eq!(empty.download_count, 0);
        assert!(empty.updated_at.is_none());
    }

    #[tokio::test]
    async fn single_repo_lookup_is_case_insensitive() {
        let (query, _) = seeded().await;
        let repo = query.get_github_repo("acme", "WIDGET").await.unwrap().unwrap();
        assert_eq!(repo.star_count, 40);
    }
}
