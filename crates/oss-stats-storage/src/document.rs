use std::fmt;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// The four stored row kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Table {
    GithubOwners,
    GithubRepos,
    NpmOrgs,
    NpmPackages,
}

impl Table {
    pub const ALL: [Table; 4] = [
        Table::GithubOwners,
        Table::GithubRepos,
        Table::NpmOrgs,
        Table::NpmPackages,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Table::GithubOwners => "githubOwners",
            Table::GithubRepos => "githubRepos",
            Table::NpmOrgs => "npmOrgs",
            Table::NpmPackages => "npmPackages",
        }
    }

    /// Body fields that together form the table's natural key.
    pub fn unique_fields(self) -> &'static [&'static str] {
        match self {
            Table::GithubOwners => &["nameNormalized"],
            Table::GithubRepos => &["ownerNormalized", "nameNormalized"],
            Table::NpmOrgs | Table::NpmPackages => &["name"],
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocId(pub Uuid);

impl DocId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DocId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: DocId,
    pub table: Table,
    pub body: Value,
}

impl Document {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        serde_json::from_value(self.body.clone()).map_err(|source| StoreError::Decode {
            table: self.table,
            id: self.id,
            source,
        })
    }
}

/// Equality filter over top-level body fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyMatch {
    fields: Map<String, Value>,
}

impl KeyMatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(field.to_string(), value.into());
        self
    }

    /// Natural-key filter extracted from a body, `None` if a key field is absent.
    pub fn unique_key(table: Table, body: &Value) -> Option<Self> {
        let mut key = Self::new();
        for field in table.unique_fields() {
            let value = body.get(*field)?;
            key = key.eq(field, value.clone());
        }
        Some(key)
    }

    pub fn matches(&self, body: &Value) -> bool {
        self.fields
            .iter()
            .all(|(field, expected)| body.get(field) == Some(expected))
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}

impl fmt::Display for KeyMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

/// Opaque resume point for [`DocumentStore::paginate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Cursor(pub u64);

#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub docs: Vec<Document>,
    pub cursor: Option<Cursor>,
    /// No rows remain after this page.
    pub done: bool,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{count} rows in {table} match {key}, expected at most one")]
    NotUnique {
        table: Table,
        key: String,
        count: usize,
    },
    #[error("a row in {table} already has key {key}")]
    Duplicate { table: Table, key: String },
    #[error("no row with id {0}")]
    Missing(DocId),
    #[error("row body for {table} must be a JSON object")]
    NotAnObject { table: Table },
    #[error("decoding {table} row {id}: {source}")]
    Decode {
        table: Table,
        id: DocId,
        #[source]
        source: serde_json::Error,
    },
    #[error("encoding row: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Table-scoped document persistence with unique natural keys.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// The single row matching `key`, erroring if more than one does.
    async fn find(&self, table: Table, key: &KeyMatch) -> Result<Option<Document>, StoreError>;

    /// Every row matching `filter`, in insertion order.
    async fn collect(&self, table: Table, filter: &KeyMatch) -> Result<Vec<Document>, StoreError>;

    async fn insert(&self, table: Table, body: Value) -> Result<DocId, StoreError>;

    /// Shallow-merges `fields` into the row; a `null` field removes the key.
    async fn patch(&self, id: DocId, fields: Value) -> Result<(), StoreError>;

    async fn delete(&self, id: DocId) -> Result<(), StoreError>;

    async fn paginate(
        &self,
        table: Table,
        page_size: usize,
        cursor: Option<Cursor>,
    ) -> Result<Page, StoreError>;
}

pub(crate) fn require_object(table: Table, body: &Value) -> Result<(), StoreError> {
    if body.is_object() {
        Ok(())
    } else {
        Err(StoreError::NotAnObject { table })
    }
}

/// Splits a patch into fields to set and keys to remove.
pub(crate) fn split_patch(fields: &Value) -> (Map<String, Value>, Vec<String>) {
    let mut set = Map::new();
    let mut remove = Vec::new();
    if let Value::Object(map) = fields {
        for (key, value) in map {
            if value.is_null() {
                remove.push(key.clone());
            } else {
                set.insert(key.clone(), value.clone());
            }
        }
    }
    (set, remove)
}
