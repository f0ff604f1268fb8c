use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use crate::document::{
    require_object, split_patch, Cursor, DocId, Document, DocumentStore, KeyMatch, Page,
    StoreError, Table,
};

/// Document store over a single `documents` table in Postgres.
///
/// Natural-key uniqueness is enforced by partial unique indexes created by
/// the migrations in `migrations/`.
#[derive(Debug, Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self, migrations_dir: &Path) -> Result<(), StoreError> {
        let migrator = Migrator::new(migrations_dir).await?;
        migrator.run(&self.pool).await?;
        info!(dir = %migrations_dir.display(), "migrations applied");
        Ok(())
    }
}

fn row_to_document(table: Table, row: &PgRow) -> Result<Document, StoreError> {
    let id: Uuid = row.try_get("id")?;
    let Json(body): Json<Value> = row.try_get("body")?;
    Ok(Document {
        id: DocId(id),
        table,
        body,
    })
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn find(&self, table: Table, key: &KeyMatch) -> Result<Option<Document>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, body
              FROM documents
             WHERE table_name = $1 AND body @> $2
             ORDER BY seq
             LIMIT 2
            "#,
        )
        .bind(table.as_str())
        .bind(Json(key.to_json()))
        .fetch_all(&self.pool)
        .await?;

        if rows.len() > 1 {
            return Err(StoreError::NotUnique {
                table,
                key: key.to_string(),
                count: rows.len(),
            });
        }
        rows.first().map(|row| row_to_document(table, row)).transpose()
    }

    async fn collect(&self, table: Table, filter: &KeyMatch) -> Result<Vec<Document>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, body
              FROM documents
             WHERE table_name = $1 AND body @> $2
             ORDER BY seq
            "#,
        )
        .bind(table.as_str())
        .bind(Json(filter.to_json()))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|row| row_to_document(table, row)).collect()
    }

    async fn insert(&self, table: Table, body: Value) -> Result<DocId, StoreError> {
        require_object(table, &body)?;
        let id = DocId::new();
        let result = sqlx::query(
            r#"
            INSERT INTO documents (id, table_name, body)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(id.0)
        .bind(table.as_str())
        .bind(Json(&body))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(id),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                let key = KeyMatch::unique_key(table, &body)
                    .map(|k| k.to_string())
                    .unwrap_or_default();
                Err(StoreError::Duplicate { table, key })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn patch(&self, id: DocId, fields: Value) -> Result<(), StoreError> {
        let (set, remove) = split_patch(&fields);
        let result = sqlx::query(
            r#"
            UPDATE documents
               SET body = (body || $2) - $3::text[]
             WHERE id = $1
            "#,
        )
        .bind(id.0)
        .bind(Json(Value::Object(set)))
        .bind(remove)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Missing(id));
        }
        Ok(())
    }

    async fn delete(&self, id: DocId) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM documents WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Missing(id));
        }
        Ok(())
    }

    async fn paginate(
        &self,
        table: Table,
        page_size: usize,
        cursor: Option<Cursor>,
    ) -> Result<Page, StoreError> {
        let page_size = page_size.max(1);
        let after = cursor.map(|c| c.0 as i64).unwrap_or(0);
        // One extra row tells us whether anything remains.
        let rows = sqlx::query(
            r#"
            SELECT id, seq, body
              FROM documents
             WHERE table_name = $1 AND seq > $2
             ORDER BY seq
             LIMIT $3
            "#,
        )
        .bind(table.as_str())
        .bind(after)
        .bind((page_size + 1) as i64)
        .fetch_all(&self.pool)
        .await?;

        let done = rows.len() <= page_size;
        let mut docs = Vec::with_capacity(page_size);
        let mut last = cursor;
        for row in rows.iter().take(page_size) {
            let seq: i64 = row.try_get("seq")?;
            docs.push(row_to_document(table, row)?);
            last = Some(Cursor(seq as u64));
        }

        Ok(Page {
            docs,
            cursor: last,
            done,
        })
    }
}
