use oss_stats_storage::{DocumentStore, Table};
use serde::Serialize;
use tracing::info;

use crate::config::SyncArgs;
use crate::orchestrator::{SyncOrchestrator, SyncReport};
use crate::SyncError;

pub const CLEAR_PAGE_SIZE: usize = 200;

/// Child tables wiped before a resync; aggregates are recomputed, not cleared.
pub const RESYNC_TABLES: [Table; 2] = [Table::GithubRepos, Table::NpmPackages];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearStats {
    pub pages: usize,
    pub deleted: usize,
}

/// Deletes every row of `table`, one page at a time, until a page reports done.
pub async fn clear_table(
    store: &dyn DocumentStore,
    table: Table,
    page_size: usize,
) -> Result<ClearStats, SyncError> {
    let mut stats = ClearStats::default();
    let mut cursor = None;
    loop {
        let page = store.paginate(table, page_size, cursor).await?;
        stats.pages += 1;
        for doc in &page.docs {
            store.delete(doc.id).await?;
            stats.deleted += 1;
        }
        if page.done || page.cursor.is_none() {
            break;
        }
        cursor = page.cursor;
    }
    info!(%table, pages = stats.pages, deleted = stats.deleted, "table cleared");
    Ok(stats)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearAndSyncReport {
    pub cleared: Vec<(Table, ClearStats)>,
    pub sync: SyncReport,
}

/// Clears the child tables completely, then runs a fresh sync.
pub async fn clear_and_sync(
    orchestrator: &SyncOrchestrator,
    args: &SyncArgs,
) -> Result<ClearAndSyncReport, SyncError> {
    let store = orchestrator.reconciler().store().clone();
    let mut cleared = Vec::with_capacity(RESYNC_TABLES.len());
    for table in RESYNC_TABLES {
        let stats = clear_table(store.as_ref(), table, CLEAR_PAGE_SIZE).await?;
        cleared.push((table, stats));
    }
    let sync = orchestrator.run(args).await?;
    Ok(ClearAndSyncReport { cleared, sync })
}

#[cfg(test)]
mod tests {
    use super::*;
    use oss_stats_storage::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn clearing_450_rows_takes_three_pages() {
        let store = MemoryStore::new();
        for i in 0..450 {
            store
                .insert(Table::NpmPackages, json!({"name": format!("pkg-{i}")}))
                .await
                .unwrap();
        }
        store.insert(Table::NpmOrgs, json!({"name": "kept"})).await.unwrap();

        let stats = clear_table(&store, Table::NpmPackages, 200).await.unwrap();
        assert_eq!(stats, ClearStats { pages: 3, deleted: 450 });
        assert_eq!(store.len(Table::NpmPackages).await, 0);
        assert_eq!(store.len(Table::NpmOrgs).await, 1);
    }

    #[tokio::test]
    async fn clearing_an_empty_table_is_one_page() {
        let store = MemoryStore::new();
        let stats = clear_table(&store, Table::GithubRepos, 200).await.unwrap();
        assert_eq!(stats, ClearStats { pages: 1, deleted: 0 });
        let again = clear_table(&store, Table::GithubRepos, 200).await.unwrap();
        assert_eq!(again, stats);
    }
}
