// Transaction handles, staged writes and the optimistic retry loop

use crate::backend::{DocumentDatabase, StoredDocument};
use crate::error::{NestDocError, Result};
use crate::path::DocumentPath;
use crate::query::{Query, QueryTarget};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Unique transaction identifier
pub type TransactionId = u64;

/// Lifecycle of one transaction attempt.
///
/// `Started -> Reading -> Writing -> Committing -> Committed | Conflict`.
/// A conflict ends the attempt; the runner starts a new one from `Started`.
/// `Failed` marks an attempt rolled back because its callback returned an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Started,
    Reading,
    Writing,
    Committing,
    Committed,
    Conflict,
    Failed,
}

impl TransactionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::Conflict | TransactionState::Failed
        )
    }
}

/// A write buffered until commit
#[derive(Debug, Clone, PartialEq)]
pub enum StagedWrite {
    Set {
        path: DocumentPath,
        fields: Map<String, Value>,
    },
    Delete {
        path: DocumentPath,
    },
}

impl StagedWrite {
    pub fn path(&self) -> &DocumentPath {
        match self {
            StagedWrite::Set { path, .. } | StagedWrite::Delete { path } => path,
        }
    }
}

/// A query executed inside a transaction, with the (path, version) pairs it returned
#[derive(Debug, Clone)]
pub struct QueryRecord {
    pub target: QueryTarget,
    pub query: Query,
    pub results: Vec<(DocumentPath, u64)>,
}

/// Everything a backend needs to validate and apply a commit
#[derive(Debug, Clone)]
pub struct CommitSet {
    /// Version observed for each read path; `None` when the document was absent
    pub reads: BTreeMap<DocumentPath, Option<u64>>,
    pub queries: Vec<QueryRecord>,
    pub writes: Vec<StagedWrite>,
}

struct TxInner {
    state: TransactionState,
    reads: BTreeMap<DocumentPath, Option<StoredDocument>>,
    queries: Vec<QueryRecord>,
    writes: Vec<StagedWrite>,
}

/// Handle for one transaction attempt.
///
/// Cloning shares the same attempt. Pass it through `CallOptions` /
/// `WriteOptions` to make reads snapshot-consistent and writes staged.
#[derive(Clone)]
pub struct Transaction {
    id: TransactionId,
    attempt: usize,
    inner: Arc<Mutex<TxInner>>,
}

impl Transaction {
    /// Create a fresh attempt. Called by backends from `begin_transaction`.
    pub fn new(id: TransactionId, attempt: usize) -> Self {
        Transaction {
            id,
            attempt,
            inner: Arc::new(Mutex::new(TxInner {
                state: TransactionState::Started,
                reads: BTreeMap::new(),
                queries: Vec::new(),
                writes: Vec::new(),
            })),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// 1-based attempt number within `run_transaction`
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn state(&self) -> TransactionState {
        self.inner.lock().state
    }

    /// Enter (or stay in) the reading phase. Reads after staged writes are rejected.
    pub fn begin_read(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            TransactionState::Started | TransactionState::Reading => {
                inner.state = TransactionState::Reading;
                Ok(())
            }
            TransactionState::Writing => Err(NestDocError::ReadAfterWrite(self.id)),
            _ => Err(NestDocError::TransactionClosed(self.id)),
        }
    }

    /// The snapshot of `path` taken by an earlier read in this attempt.
    /// Outer `None`: not read yet; inner `None`: read as absent.
    pub fn cached_read(&self, path: &DocumentPath) -> Option<Option<StoredDocument>> {
        self.inner.lock().reads.get(path).cloned()
    }

    pub fn record_read(&self, path: &DocumentPath, doc: Option<StoredDocument>) {
        self.inner.lock().reads.entry(path.clone()).or_insert(doc);
    }

    pub fn record_query(&self, target: &QueryTarget, query: &Query, results: &[StoredDocument]) {
        let record = QueryRecord {
            target: target.clone(),
            query: query.clone(),
            results: results.iter().map(|d| (d.path.clone(), d.version)).collect(),
        };
        self.inner.lock().queries.push(record);
    }

    /// Buffer a write for commit
    pub fn stage(&self, write: StagedWrite) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            TransactionState::Started | TransactionState::Reading | TransactionState::Writing => {
                inner.state = TransactionState::Writing;
                inner.writes.push(write);
                Ok(())
            }
            _ => Err(NestDocError::TransactionClosed(self.id)),
        }
    }

    /// Version seen for each path read so far; `None` when it was absent
    pub fn read_versions(&self) -> BTreeMap<DocumentPath, Option<u64>> {
        versions(&self.inner.lock().reads)
    }

    /// Queries executed so far in this attempt
    pub fn recorded_queries(&self) -> Vec<QueryRecord> {
        self.inner.lock().queries.clone()
    }

    /// Move to `Committing` and hand the read/write sets to the backend
    pub fn begin_commit(&self) -> Result<CommitSet> {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() || inner.state == TransactionState::Committing {
            return Err(NestDocError::TransactionClosed(self.id));
        }
        inner.state = TransactionState::Committing;
        Ok(CommitSet {
            reads: versions(&inner.reads),
            queries: inner.queries.clone(),
            writes: std::mem::take(&mut inner.writes),
        })
    }

    /// Record the terminal state of this attempt. Terminal states are final.
    pub fn finish(&self, state: TransactionState) {
        let mut inner = self.inner.lock();
        if !inner.state.is_terminal() {
            inner.state = state;
        }
    }
}

fn versions(reads: &BTreeMap<DocumentPath, Option<StoredDocument>>) -> BTreeMap<DocumentPath, Option<u64>> {
    reads
        .iter()
        .map(|(path, doc)| (path.clone(), doc.as_ref().map(|d| d.version)))
        .collect()
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("attempt", &self.attempt)
            .field("state", &self.state())
            .finish()
    }
}

/// Run `f` inside a transaction, re-invoking it from scratch whenever the
/// commit loses a write conflict.
///
/// The callback may run several times. Transactional reads and writes are
/// discarded between attempts, but any other side effect inside `f` repeats
/// on every retry. Errors returned by `f` roll the attempt back and propagate
/// unchanged. When the backend's attempt budget runs out the result is
/// `TransactionAborted`.
pub async fn run_transaction<D, F, Fut, T>(db: &D, mut f: F) -> Result<T>
where
    D: DocumentDatabase + ?Sized,
    F: FnMut(Transaction) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = db.max_transaction_attempts().max(1);

    for attempt in 1..=max_attempts {
        let tx = db.begin_transaction(attempt).await?;
        log::debug!(
            "Transaction {} attempt {attempt}/{max_attempts} started",
            tx.id()
        );

        let outcome = match f(tx.clone()).await {
            Ok(value) => db.commit(&tx).await.map(|()| value),
            Err(e) => {
                db.rollback(&tx).await?;
                Err(e)
            }
        };

        match outcome {
            Ok(value) => {
                log::debug!("Transaction {} committed on attempt {attempt}", tx.id());
                return Ok(value);
            }
            Err(e) if e.is_conflict() => {
                log::debug!("Transaction {} attempt {attempt} conflicted: {e}", tx.id());
            }
            Err(e) => return Err(e),
        }
    }

    log::warn!("Transaction gave up after {max_attempts} attempts");
    Err(NestDocError::TransactionAborted {
        attempts: max_attempts,
    })
}
