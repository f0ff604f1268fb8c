//! Persistence and HTTP plumbing for oss-stats.
//!
//! Rows live in a [`DocumentStore`]: an in-memory implementation for tests
//! and one-shot runs, and a Postgres one for deployments. Outbound requests
//! go through [`HttpFetcher`], which bounds concurrency per source.

mod document;
mod http;
mod memory;
mod postgres;

pub use document::{Cursor, DocId, Document, DocumentStore, KeyMatch, Page, StoreError, Table};
pub use http::{
    classify_status, classify_transport_error, ConcurrencyLimits, FetchError, FetchedBody,
    HttpClientConfig, HttpFetcher, RateLimit, RetryDisposition, RetryPolicy, TokenBucket,
};
pub use memory::MemoryStore;
pub use postgres::PgDocumentStore;

pub const CRATE_NAME: &str = "oss-stats-storage";
