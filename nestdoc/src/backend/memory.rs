// In-memory document database with optimistic transactions

use super::{DocumentDatabase, StoredDocument};
use crate::error::{NestDocError, Result};
use crate::path::DocumentPath;
use crate::query::{Query, QueryTarget};
use crate::transaction::{QueryRecord, StagedWrite, Transaction, TransactionState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

/// Tuning for [`MemoryDatabase`]
#[derive(Debug, Clone)]
pub struct MemoryDatabaseConfig {
    /// Attempts `run_transaction` makes before reporting `TransactionAborted`
    pub max_transaction_attempts: usize,
}

impl Default for MemoryDatabaseConfig {
    fn default() -> Self {
        MemoryDatabaseConfig {
            max_transaction_attempts: 5,
        }
    }
}

#[derive(Default)]
struct MemoryState {
    documents: BTreeMap<DocumentPath, StoredDocument>,
    /// Collection name -> every document path stored under that name
    groups: HashMap<String, BTreeSet<DocumentPath>>,
    version: u64,
}

impl MemoryState {
    fn put(&mut self, path: &DocumentPath, fields: Map<String, Value>, now: DateTime<Utc>) {
        self.version += 1;
        let create_time = self
            .documents
            .get(path)
            .map(|existing| existing.create_time)
            .unwrap_or(now);

        self.documents.insert(
            path.clone(),
            StoredDocument {
                path: path.clone(),
                fields,
                version: self.version,
                create_time,
                update_time: now,
            },
        );
        self.groups
            .entry(path.collection_name().to_string())
            .or_default()
            .insert(path.clone());
    }

    fn remove(&mut self, path: &DocumentPath) {
        if self.documents.remove(path).is_some() {
            self.version += 1;
            if let Some(paths) = self.groups.get_mut(path.collection_name()) {
                paths.remove(path);
            }
        }
    }

    fn current_version(&self, path: &DocumentPath) -> Option<u64> {
        self.documents.get(path).map(|d| d.version)
    }

    fn run_query(&self, target: &QueryTarget, query: &Query) -> Vec<StoredDocument> {
        let Some(paths) = self.groups.get(target.collection_name()) else {
            return Vec::new();
        };

        let mut matches: Vec<&StoredDocument> = paths
            .iter()
            .filter(|path| target.contains(path))
            .filter_map(|path| self.documents.get(path))
            .filter(|doc| query.matches(&doc.fields))
            .collect();

        matches.sort_by(|a, b| query.compare((&a.path, &a.fields), (&b.path, &b.fields)));
        if let Some(limit) = query.max_results() {
            matches.truncate(limit);
        }
        matches.into_iter().cloned().collect()
    }

    /// Returns a description of the first stale read, if any
    fn find_conflict(
        &self,
        reads: &BTreeMap<DocumentPath, Option<u64>>,
        queries: &[QueryRecord],
    ) -> Option<String> {
        for (path, seen) in reads {
            let current = self.current_version(path);
            if current != *seen {
                return Some(format!(
                    "'{path}' changed since it was read (version {seen:?} -> {current:?})"
                ));
            }
        }

        for record in queries {
            let now: Vec<(DocumentPath, u64)> = self
                .run_query(&record.target, &record.query)
                .into_iter()
                .map(|d| (d.path, d.version))
                .collect();
            if now != record.results {
                return Some(format!("results of query on '{}' changed", record.target));
            }
        }

        None
    }
}

/// Fail with a conflict when anything the attempt already observed has moved,
/// so one attempt never mixes two states of the database.
fn ensure_snapshot(state: &MemoryState, tx: &Transaction) -> Result<()> {
    match state.find_conflict(&tx.read_versions(), &tx.recorded_queries()) {
        Some(reason) => {
            log::trace!("Transaction {} snapshot moved: {reason}", tx.id());
            Err(NestDocError::Conflict(reason))
        }
        None => Ok(()),
    }
}

/// A document database held entirely in memory.
///
/// Transactions are optimistic: the versions of everything an attempt reads
/// are recorded on the handle. Each further transactional read re-checks them,
/// and commit checks them again under the write lock. Every call yields to the
/// runtime once, so concurrent callers interleave the way they would against a
/// remote store.
pub struct MemoryDatabase {
    state: RwLock<MemoryState>,
    next_transaction: AtomicU64,
    config: MemoryDatabaseConfig,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::with_config(MemoryDatabaseConfig::default())
    }

    pub fn with_config(config: MemoryDatabaseConfig) -> Self {
        MemoryDatabase {
            state: RwLock::new(MemoryState::default()),
            next_transaction: AtomicU64::new(1),
            config,
        }
    }

    /// Number of stored documents
    pub fn len(&self) -> usize {
        self.state.read().documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().documents.is_empty()
    }

    /// Paths of every stored document, sorted
    pub fn paths(&self) -> Vec<DocumentPath> {
        self.state.read().documents.keys().cloned().collect()
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentDatabase for MemoryDatabase {
    async fn get(&self, path: &DocumentPath, tx: Option<&Transaction>) -> Result<Option<StoredDocument>> {
        tokio::task::yield_now().await;

        match tx {
            None => Ok(self.state.read().documents.get(path).cloned()),
            Some(tx) => {
                tx.begin_read()?;
                if let Some(snapshot) = tx.cached_read(path) {
                    return Ok(snapshot);
                }
                let state = self.state.read();
                ensure_snapshot(&state, tx)?;
                let doc = state.documents.get(path).cloned();
                drop(state);
                tx.record_read(path, doc.clone());
                Ok(doc)
            }
        }
    }

    async fn set(
        &self,
        path: &DocumentPath,
        fields: Map<String, Value>,
        tx: Option<&Transaction>,
    ) -> Result<()> {
        tokio::task::yield_now().await;

        match tx {
            None => {
                self.state.write().put(path, fields, Utc::now());
                Ok(())
            }
            Some(tx) => tx.stage(StagedWrite::Set {
                path: path.clone(),
                fields,
            }),
        }
    }

    async fn delete(&self, path: &DocumentPath, tx: Option<&Transaction>) -> Result<()> {
        tokio::task::yield_now().await;

        match tx {
            None => {
                self.state.write().remove(path);
                Ok(())
            }
            Some(tx) => tx.stage(StagedWrite::Delete { path: path.clone() }),
        }
    }

    async fn query(
        &self,
        target: &QueryTarget,
        query: &Query,
        tx: Option<&Transaction>,
    ) -> Result<Vec<StoredDocument>> {
        tokio::task::yield_now().await;

        let Some(tx) = tx else {
            return Ok(self.state.read().run_query(target, query));
        };

        tx.begin_read()?;
        let state = self.state.read();
        ensure_snapshot(&state, tx)?;
        let results = state.run_query(target, query);
        drop(state);
        tx.record_query(target, query, &results);
        Ok(results)
    }

    async fn begin_transaction(&self, attempt: usize) -> Result<Transaction> {
        let id = self.next_transaction.fetch_add(1, Ordering::Relaxed);
        Ok(Transaction::new(id, attempt))
    }

    async fn commit(&self, tx: &Transaction) -> Result<()> {
        tokio::task::yield_now().await;

        let commit = tx.begin_commit()?;
        let mut state = self.state.write();

        if let Some(reason) = state.find_conflict(&commit.reads, &commit.queries) {
            drop(state);
            tx.finish(TransactionState::Conflict);
            log::trace!("Transaction {} rejected: {reason}", tx.id());
            return Err(NestDocError::Conflict(reason));
        }

        let now = Utc::now();
        for write in commit.writes {
            match write {
                StagedWrite::Set { path, fields } => state.put(&path, fields, now),
                StagedWrite::Delete { path } => state.remove(&path),
            }
        }
        drop(state);

        tx.finish(TransactionState::Committed);
        Ok(())
    }

    async fn rollback(&self, tx: &Transaction) -> Result<()> {
        tx.finish(TransactionState::Failed);
        Ok(())
    }

    fn max_transaction_attempts(&self) -> usize {
        self.config.max_transaction_attempts
    }
}
