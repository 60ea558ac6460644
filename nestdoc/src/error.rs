use thiserror::Error;

#[derive(Error, Debug)]
pub enum NestDocError {
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Schema mismatch for collection '{collection}' at '{path}': {reason}")]
    SchemaMismatch {
        collection: String,
        path: String,
        reason: String,
    },

    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Collection '{0}' not found in schema")]
    UnknownCollection(String),

    #[error("Unknown fields for collection '{collection}': {}", fields.join(", "))]
    UnknownField {
        collection: String,
        fields: Vec<String>,
    },

    #[error("Document not found: {path}")]
    NotFound { path: String },

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Invalid document data: {0}")]
    InvalidData(String),

    /// A transaction attempt lost a write conflict. Recovered by retrying the
    /// whole attempt; only surfaces when a backend reports it outside
    /// `run_transaction`.
    #[error("Transaction conflict: {0}")]
    Conflict(String),

    #[error("Transaction aborted after {attempts} attempts")]
    TransactionAborted { attempts: usize },

    #[error("Transaction {0} is no longer active")]
    TransactionClosed(u64),

    #[error("Transaction {0} attempted a read after staging writes")]
    ReadAfterWrite(u64),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl NestDocError {
    /// True for the retryable write-conflict condition.
    pub fn is_conflict(&self) -> bool {
        matches!(self, NestDocError::Conflict(_))
    }

    pub fn is_schema_mismatch(&self) -> bool {
        matches!(self, NestDocError::SchemaMismatch { .. })
    }

    pub(crate) fn mismatch(
        collection: &str,
        path: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        NestDocError::SchemaMismatch {
            collection: collection.to_string(),
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        NestDocError::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, NestDocError>;
