//! The external document database this crate composes calls against.
//!
//! `DocumentDatabase` is the seam between the schema layer and whatever store
//! actually holds the documents. The store owns persistence, query execution
//! and transaction commit; this crate never bypasses it.

use crate::error::Result;
use crate::path::DocumentPath;
use crate::query::{Query, QueryTarget};
use crate::transaction::Transaction;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

pub mod memory;

pub use memory::{MemoryDatabase, MemoryDatabaseConfig};

/// A raw document as held by the database, before sanitization
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub path: DocumentPath,
    pub fields: Map<String, Value>,
    /// Bumped on every committed change; used for conflict detection
    pub version: u64,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

/// Primitive operations of a transactional document database.
///
/// Every operation takes an optional transaction. With one, reads must be
/// snapshot-consistent for the attempt and writes must be staged until
/// `commit`, invisible to every other reader before then.
#[async_trait]
pub trait DocumentDatabase: Send + Sync {
    /// Fetch a document; `None` when nothing exists at `path`.
    async fn get(&self, path: &DocumentPath, tx: Option<&Transaction>) -> Result<Option<StoredDocument>>;

    /// Replace the document's fields, creating it if absent.
    async fn set(
        &self,
        path: &DocumentPath,
        fields: Map<String, Value>,
        tx: Option<&Transaction>,
    ) -> Result<()>;

    /// Remove a document. Deleting an absent document is a no-op.
    async fn delete(&self, path: &DocumentPath, tx: Option<&Transaction>) -> Result<()>;

    /// Run a query over one collection instance or a collection group.
    async fn query(
        &self,
        target: &QueryTarget,
        query: &Query,
        tx: Option<&Transaction>,
    ) -> Result<Vec<StoredDocument>>;

    /// Open a new attempt.
    async fn begin_transaction(&self, attempt: usize) -> Result<Transaction>;

    /// Validate and apply an attempt atomically.
    /// Fails with `NestDocError::Conflict` when anything it read has changed.
    async fn commit(&self, tx: &Transaction) -> Result<()>;

    /// Discard an attempt's staged writes.
    async fn rollback(&self, tx: &Transaction) -> Result<()>;

    /// How many attempts `run_transaction` makes before giving up.
    fn max_transaction_attempts(&self) -> usize;
}
