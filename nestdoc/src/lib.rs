pub mod backend;
pub mod document;
pub mod error;
pub mod path;
pub mod query;
pub mod sanitize;
pub mod schema;
pub mod store;
pub mod transaction;

#[cfg(test)]
mod testing;

pub use backend::{DocumentDatabase, MemoryDatabase, MemoryDatabaseConfig, StoredDocument};
pub use document::{Document, Subcollection};
pub use error::{NestDocError, Result};
pub use path::{CollectionGroup, CollectionPath, DocumentPath};
pub use query::{Direction, Filter, Operator, OrderBy, Query, QueryTarget};
pub use sanitize::{sanitize, SanitizeOptions};
pub use schema::{AutoIdStrategy, Schema, SchemaDefinition, SchemaNode};
pub use store::{CallOptions, Collection, Store, WriteOptions};
pub use transaction::{run_transaction, Transaction, TransactionState};
