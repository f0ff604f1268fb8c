use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::document::{
    require_object, split_patch, Cursor, DocId, Document, DocumentStore, KeyMatch, Page,
    StoreError, Table,
};

#[derive(Debug, Default)]
struct MemoryState {
    next_seq: u64,
    rows: BTreeMap<u64, Document>,
    by_id: HashMap<DocId, u64>,
}

impl MemoryState {
    fn table_rows(&self, table: Table) -> impl Iterator<Item = (&u64, &Document)> {
        self.rows.iter().filter(move |(_, doc)| doc.table == table)
    }
}

/// Process-local store used by tests and one-shot CLI runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self, table: Table) -> usize {
        self.state.lock().await.table_rows(table).count()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn find(&self, table: Table, key: &KeyMatch) -> Result<Option<Document>, StoreError> {
        let state = self.state.lock().await;
        let mut hits = state
            .table_rows(table)
            .filter(|(_, doc)| key.matches(&doc.body))
            .map(|(_, doc)| doc);
        let first = hits.next().cloned();
        let extra = hits.count();
        if extra > 0 {
            return Err(StoreError::NotUnique {
                table,
                key: key.to_string(),
                count: extra + 1,
            });
        }
        Ok(first)
    }

    async fn collect(&self, table: Table, filter: &KeyMatch) -> Result<Vec<Document>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .table_rows(table)
            .filter(|(_, doc)| filter.matches(&doc.body))
            .map(|(_, doc)| doc.clone())
            .collect())
    }

    async fn insert(&self, table: Table, body: Value) -> Result<DocId, StoreError> {
        require_object(table, &body)?;
        let mut state = self.state.lock().await;
        if let Some(key) = KeyMatch::unique_key(table, &body) {
            if state.table_rows(table).any(|(_, doc)| key.matches(&doc.body)) {
                return Err(StoreError::Duplicate {
                    table,
                    key: key.to_string(),
                });
            }
        }

        let id = DocId::new();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.rows.insert(seq, Document { id, table, body });
        state.by_id.insert(id, seq);
        Ok(id)
    }

    async fn patch(&self, id: DocId, fields: Value) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let seq = *state.by_id.get(&id).ok_or(StoreError::Missing(id))?;
        let doc = state.rows.get_mut(&seq).ok_or(StoreError::Missing(id))?;
        let (set, remove) = split_patch(&fields);
        if let Value::Object(body) = &mut doc.body {
            for key in remove {
                body.remove(&key);
            }
            body.extend(set);
        }
        Ok(())
    }

    async fn delete(&self, id: DocId) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let seq = state.by_id.remove(&id).ok_or(StoreError::Missing(id))?;
        state.rows.remove(&seq);
        Ok(())
    }

    async fn paginate(
        &self,
        table: Table,
        page_size: usize,
        cursor: Option<Cursor>,
    ) -> Result<Page, StoreError> {
        let state = self.state.lock().await;
        let after = cursor.map(|c| c.0);
        let mut remaining = state
            .table_rows(table)
            .filter(|(seq, _)| after.map_or(true, |a| **seq > a));

        let mut docs = Vec::with_capacity(page_size);
        let mut last = None;
        for (seq, doc) in remaining.by_ref().take(page_size.max(1)) {
            docs.push(doc.clone());
            last = Some(Cursor(*seq));
        }
        let done = remaining.next().is_none();

        Ok(Page {
            docs,
            cursor: last.or(cursor),
            done,
        })
    }
}
