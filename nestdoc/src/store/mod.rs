use crate::backend::{DocumentDatabase, MemoryDatabase};
use crate::document::{self, Document};
use crate::error::{NestDocError, Result};
use crate::path::{self, CollectionPath, DocumentPath};
use crate::query::{Query, QueryTarget};
use crate::sanitize::{self, SanitizeOptions};
use crate::schema::{load_schema, Schema, SchemaNode};
use crate::transaction::{self, Transaction};
use serde::Serialize;
use serde_json::{Map, Value};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

/// The main entry point for nestdoc.
/// Pairs a schema registry with the document database it constrains and hands
/// out collection handles for document operations and queries.
pub struct Store {
    db: Arc<dyn DocumentDatabase>,
    schema: Arc<Schema>,
}

impl Store {
    pub fn new(db: Arc<dyn DocumentDatabase>, schema: Schema) -> Self {
        log::debug!("Opened store with {} schema node(s)", schema.len());
        Store {
            db,
            schema: Arc::new(schema),
        }
    }

    /// Load the schema from a YAML file and attach it to `db`
    pub fn open(db: Arc<dyn DocumentDatabase>, schema_path: &Path) -> Result<Self> {
        let schema = load_schema(schema_path)?;
        Ok(Self::new(db, schema))
    }

    /// A store backed by a fresh [`MemoryDatabase`]
    pub fn in_memory(schema: Schema) -> Self {
        Self::new(Arc::new(MemoryDatabase::new()), schema)
    }

    /// Get a handle to a collection by its schema key
    pub fn collection(&self, key: &str) -> Result<Collection<'_>> {
        let node = self
            .schema
            .node(key)
            .ok_or_else(|| NestDocError::UnknownCollection(key.to_string()))?;
        Ok(Collection {
            store: self,
            node: node.clone(),
        })
    }

    /// Get a handle for a node object. The node must belong to this store's schema.
    pub fn collection_for(&self, node: &SchemaNode) -> Result<Collection<'_>> {
        match self.schema.node(node.key()) {
            Some(registered) if registered.same_node(node) => Ok(Collection {
                store: self,
                node: node.clone(),
            }),
            _ => Err(NestDocError::UnknownCollection(node.key().to_string())),
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn database(&self) -> &Arc<dyn DocumentDatabase> {
        &self.db
    }

    /// Run `f` in a transaction, retrying it from scratch on write conflicts.
    /// See [`transaction::run_transaction`].
    pub async fn run_transaction<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnMut(Transaction) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        transaction::run_transaction(&*self.db, f).await
    }
}

// ── Call options ───────────────────────────────────────────────────

/// Options for operations that write fields
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions<'t> {
    /// Fill absent fields with the node's declared defaults
    pub merge_defaults: bool,
    pub transaction: Option<&'t Transaction>,
}

impl<'t> WriteOptions<'t> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge_defaults(mut self, merge: bool) -> Self {
        self.merge_defaults = merge;
        self
    }

    pub fn transaction(mut self, tx: &'t Transaction) -> Self {
        self.transaction = Some(tx);
        self
    }

    fn sanitize_options(&self) -> SanitizeOptions {
        SanitizeOptions {
            merge_defaults: self.merge_defaults,
        }
    }
}

/// Options for reads, deletes and queries
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOptions<'t> {
    pub transaction: Option<&'t Transaction>,
}

impl<'t> CallOptions<'t> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transaction(mut self, tx: &'t Transaction) -> Self {
        self.transaction = Some(tx);
        self
    }
}

// ── Collection handle ──────────────────────────────────────────────

/// A handle to one schema node within a store.
///
/// Every path argument is resolved against the node's declared ancestry before
/// the database is touched, so a mismatched path never produces I/O.
pub struct Collection<'a> {
    store: &'a Store,
    node: SchemaNode,
}

impl<'a> Collection<'a> {
    pub fn node(&self) -> &SchemaNode {
        &self.node
    }

    /// Location of a document of this node from its id chain, root first
    pub fn doc_path(&self, ids: &[&str]) -> Result<DocumentPath> {
        path::locate_document(&self.node, ids)
    }

    /// Location of the collection instance under the given ancestor ids
    pub fn collection_path(&self, ancestor_ids: &[&str]) -> Result<CollectionPath> {
        path::locate_collection(&self.node, ancestor_ids)
    }

    /// Create a document with a generated id inside the collection at `base`.
    /// For nested nodes `base` must already carry the ancestor ids.
    pub async fn create<T: Serialize + ?Sized>(
        &self,
        base: &str,
        data: &T,
        options: WriteOptions<'_>,
    ) -> Result<Document> {
        let collection = path::resolve_collection(&self.node, base)?;
        let fields = self.prepare(data, &options)?;
        let location = collection.doc(&self.node.generate_id())?;

        log::debug!("Creating {location} ({} field(s))", fields.len());
        self.store
            .db
            .set(&location, fields.clone(), options.transaction)
            .await?;
        Ok(Document::written(&self.node, &self.store.schema, location, fields))
    }

    /// Replace the fields of the document at `path`, creating it if absent
    pub async fn write<T: Serialize + ?Sized>(
        &self,
        path: &str,
        data: &T,
        options: WriteOptions<'_>,
    ) -> Result<Document> {
        let location = path::resolve_document(&self.node, path)?;
        let fields = self.prepare(data, &options)?;

        log::debug!("Writing {location} ({} field(s))", fields.len());
        self.store
            .db
            .set(&location, fields.clone(), options.transaction)
            .await?;
        Ok(Document::written(&self.node, &self.store.schema, location, fields))
    }

    /// Overlay `partial` onto the stored fields of an existing document.
    ///
    /// Reads before it writes, so inside a transaction it must come before
    /// any staged write of the same attempt.
    pub async fn update<T: Serialize + ?Sized>(
        &self,
        path: &str,
        partial: &T,
        options: WriteOptions<'_>,
    ) -> Result<Document> {
        let location = path::resolve_document(&self.node, path)?;
        let partial = self.prepare(partial, &WriteOptions::default())?;

        let existing = self
            .store
            .db
            .get(&location, options.transaction)
            .await?
            .ok_or_else(|| NestDocError::NotFound {
                path: location.to_string(),
            })?;

        let mut fields = sanitize::sanitize(&self.node, &existing.fields, options.sanitize_options());
        for (key, value) in partial {
            fields.insert(key, value);
        }

        log::debug!("Updating {location} ({} field(s))", fields.len());
        self.store
            .db
            .set(&location, fields.clone(), options.transaction)
            .await?;
        Ok(Document::written(&self.node, &self.store.schema, location, fields))
    }

    /// Read the document at `path`; `None` when nothing is stored there
    pub async fn read(&self, path: &str, options: CallOptions<'_>) -> Result<Option<Document>> {
        let location = path::resolve_document(&self.node, path)?;
        let stored = self.store.db.get(&location, options.transaction).await?;

        if stored.is_none() {
            log::trace!("No document at {location}");
        }
        Ok(stored.map(|s| Document::from_stored(&self.node, &self.store.schema, s)))
    }

    pub async fn exists(&self, path: &str, options: CallOptions<'_>) -> Result<bool> {
        let location = path::resolve_document(&self.node, path)?;
        Ok(self.store.db.get(&location, options.transaction).await?.is_some())
    }

    /// Delete the document at `path`. Deleting an absent document is not an error.
    pub async fn delete(&self, path: &str, options: CallOptions<'_>) -> Result<()> {
        let location = path::resolve_document(&self.node, path)?;
        log::debug!("Deleting {location}");
        self.store.db.delete(&location, options.transaction).await
    }

    /// Query the single collection instance at `base`
    pub async fn query(&self, base: &str, query: &Query, options: CallOptions<'_>) -> Result<Vec<Document>> {
        let collection = path::resolve_collection(&self.node, base)?;
        query.validate()?;
        if !constrains_declared_fields(&self.node, query) {
            log::debug!("Query on {collection} names undeclared fields; no results");
            return Ok(Vec::new());
        }

        let target = QueryTarget::Collection(collection);
        let results = self.store.db.query(&target, query, options.transaction).await?;
        log::debug!("Query on {target} returned {} document(s)", results.len());

        Ok(results
            .into_iter()
            .map(|s| Document::from_stored(&self.node, &self.store.schema, s))
            .collect())
    }

    /// Query every collection named like this node, at any depth and under any
    /// ancestors. Each result is decorated through the node declared for its
    /// own location; results from nodes that do not declare every queried
    /// field are left out.
    pub async fn query_group(&self, query: &Query, options: CallOptions<'_>) -> Result<Vec<Document>> {
        query.validate()?;
        let target = QueryTarget::Group(path::collection_group(&self.node));
        if !constrains_declared_fields(&self.node, query) {
            log::debug!("Group query on {target} names undeclared fields; no results");
            return Ok(Vec::new());
        }

        let results = self.store.db.query(&target, query, options.transaction).await?;
        log::debug!("Group query on {target} returned {} document(s)", results.len());

        let schema = &self.store.schema;
        Ok(results
            .into_iter()
            .filter_map(|s| {
                let node = schema.node_for_document(&s.path).unwrap_or(&self.node);
                constrains_declared_fields(node, query).then(|| Document::from_stored(node, schema, s))
            })
            .collect())
    }

    /// Serialize, reject undeclared fields on strict nodes, then sanitize
    fn prepare<T: Serialize + ?Sized>(&self, data: &T, options: &WriteOptions<'_>) -> Result<Map<String, Value>> {
        let input = document::to_fields(data)?;

        if self.node.is_strict() {
            let unknown = sanitize::unknown_fields(&self.node, &input);
            if !unknown.is_empty() {
                return Err(NestDocError::UnknownField {
                    collection: self.node.collection_name().to_string(),
                    fields: unknown,
                });
            }
        }

        Ok(sanitize::sanitize(&self.node, &input, options.sanitize_options()))
    }
}

/// Filters and orderings only ever see sanitized data, so a query naming a
/// field the node does not declare can match nothing.
fn constrains_declared_fields(node: &SchemaNode, query: &Query) -> bool {
    query.referenced_fields().all(|field| node.allows(field))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryDatabaseConfig, StoredDocument};
    use crate::query::{Direction, Operator};
    use crate::schema::parse_schema_str;
    use crate::testing::{init_logging, Deferred};
    use async_trait::async_trait;
    use futures::future::try_join_all;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SCHEMA: &str = r#"
collections:
  profiles:
    fields:
      name: {}
      counter: {}
      plan: { default: free }
  emails:
    parent: profiles
    fields:
      address: {}
      domain: {}
  contactInfo:
    parent: profiles
    fields:
      phone: {}
  contactEmails:
    name: emails
    parent: contactInfo
    fields:
      address: {}
      domain: {}
      verified: { default: false }
  audit:
    parent: profiles
    strict: true
    id: { auto: uuid }
    fields:
      action: {}
"#;

    fn schema() -> Schema {
        let definition = parse_schema_str(SCHEMA).unwrap();
        Schema::from_definition(&definition).unwrap()
    }

    fn test_store() -> Store {
        init_logging();
        Store::in_memory(schema())
    }

    fn ids(docs: &[Document]) -> Vec<String> {
        docs.iter().map(|d| d.location.to_string()).collect()
    }

    /// Counts every call that reaches the database
    struct CountingDatabase {
        inner: MemoryDatabase,
        calls: AtomicUsize,
    }

    impl CountingDatabase {
        fn new() -> Self {
            CountingDatabase {
                inner: MemoryDatabase::new(),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn hit(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl DocumentDatabase for CountingDatabase {
        async fn get(&self, path: &DocumentPath, tx: Option<&Transaction>) -> Result<Option<StoredDocument>> {
            self.hit();
            self.inner.get(path, tx).await
        }

        async fn set(&self, path: &DocumentPath, fields: Map<String, Value>, tx: Option<&Transaction>) -> Result<()> {
            self.hit();
            self.inner.set(path, fields, tx).await
        }

        async fn delete(&self, path: &DocumentPath, tx: Option<&Transaction>) -> Result<()> {
            self.hit();
            self.inner.delete(path, tx).await
        }

        async fn query(&self, target: &QueryTarget, query: &Query, tx: Option<&Transaction>) -> Result<Vec<StoredDocument>> {
            self.hit();
            self.inner.query(target, query, tx).await
        }

        async fn begin_transaction(&self, attempt: usize) -> Result<Transaction> {
            self.inner.begin_transaction(attempt).await
        }

        async fn commit(&self, tx: &Transaction) -> Result<()> {
            self.inner.commit(tx).await
        }

        async fn rollback(&self, tx: &Transaction) -> Result<()> {
            self.inner.rollback(tx).await
        }

        fn max_transaction_attempts(&self) -> usize {
            self.inner.max_transaction_attempts()
        }
    }

    // ── Document operations ────────────────────────────────────────

    #[tokio::test]
    async fn test_write_then_read() {
        let store = test_store();
        let profiles = store.collection("profiles").unwrap();

        let written = profiles
            .write(
                "profiles/john",
                &json!({ "name": "John", "nickname": "JJ" }),
                WriteOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(written.id, "john");
        assert_eq!(written.fields, json!({ "name": "John" }).as_object().cloned().unwrap());

        let read = profiles
            .read("profiles/john", CallOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read, written);
        assert!(read.create_time.is_some());
        assert_eq!(read.get("plan"), None);
    }

    #[tokio::test]
    async fn test_write_merges_defaults_when_asked() {
        let store = test_store();
        let profiles = store.collection("profiles").unwrap();

        let doc = profiles
            .write(
                "profiles/john",
                &json!({ "name": "John" }),
                WriteOptions::new().merge_defaults(true),
            )
            .await
            .unwrap();
        assert_eq!(doc.get("plan"), Some(&json!("free")));

        let doc = profiles
            .write(
                "profiles/jane",
                &json!({ "name": "Jane", "plan": null }),
                WriteOptions::new().merge_defaults(true),
            )
            .await
            .unwrap();
        assert_eq!(doc.get("plan"), Some(&Value::Null));
    }

    #[tokio::test]
    async fn test_write_replaces_previous_fields() {
        let store = test_store();
        let profiles = store.collection("profiles").unwrap();

        profiles
            .write("profiles/john", &json!({ "name": "John", "counter": 1 }), WriteOptions::default())
            .await
            .unwrap();
        profiles
            .write("profiles/john", &json!({ "counter": 2 }), WriteOptions::default())
            .await
            .unwrap();

        let doc = profiles.read("profiles/john", CallOptions::default()).await.unwrap().unwrap();
        assert_eq!(doc.fields, json!({ "counter": 2 }).as_object().cloned().unwrap());
    }

    #[tokio::test]
    async fn test_read_sanitizes_foreign_fields() {
        let store = test_store();
        let location = DocumentPath::parse("profiles/legacy").unwrap();
        store
            .database()
            .set(&location, json!({ "name": "Old", "ssn": "x" }).as_object().cloned().unwrap(), None)
            .await
            .unwrap();

        let doc = store
            .collection("profiles")
            .unwrap()
            .read("profiles/legacy", CallOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.fields, json!({ "name": "Old" }).as_object().cloned().unwrap());
    }

    #[tokio::test]
    async fn test_delete_then_read_is_absent() {
        let store = test_store();
        let profiles = store.collection("profiles").unwrap();
        profiles
            .write("profiles/john", &json!({ "name": "John" }), WriteOptions::default())
            .await
            .unwrap();

        profiles.delete("profiles/john", CallOptions::default()).await.unwrap();
        assert_eq!(profiles.read("profiles/john", CallOptions::default()).await.unwrap(), None);
        assert!(!profiles.exists("profiles/john", CallOptions::default()).await.unwrap());

        // deleting again is a no-op
        profiles.delete("profiles/john", CallOptions::default()).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_generates_ids() {
        let store = test_store();
        let emails = store.collection("emails").unwrap();

        let a = emails
            .create("profiles/john/emails", &json!({ "address": "a@x.com" }), WriteOptions::default())
            .await
            .unwrap();
        let b = emails
            .create("profiles/john/emails", &json!({ "address": "b@x.com" }), WriteOptions::default())
            .await
            .unwrap();

        assert_ne!(a.id, b.id);
        assert_eq!(a.id.len(), 20);
        assert_eq!(a.location.parent().as_str(), "profiles/john/emails");
        assert!(emails.exists(a.location.as_str(), CallOptions::default()).await.unwrap());
    }

    #[tokio::test]
    async fn test_update_overlays_fields() {
        let store = test_store();
        let profiles = store.collection("profiles").unwrap();
        profiles
            .write("profiles/john", &json!({ "name": "John", "counter": 1 }), WriteOptions::default())
            .await
            .unwrap();

        let doc = profiles
            .update("profiles/john", &json!({ "counter": 2, "bogus": true }), WriteOptions::default())
            .await
            .unwrap();
        assert_eq!(
            doc.fields,
            json!({ "name": "John", "counter": 2 }).as_object().cloned().unwrap()
        );

        let err = profiles
            .update("profiles/nobody", &json!({ "counter": 1 }), WriteOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, NestDocError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_strict_node_rejects_unknown_fields() {
        let store = test_store();
        let audit = store.collection("audit").unwrap();

        let err = audit
            .create("profiles/john/audit", &json!({ "action": "login", "ip": "1.2.3.4" }), WriteOptions::default())
            .await
            .unwrap_err();
        match err {
            NestDocError::UnknownField { collection, fields } => {
                assert_eq!(collection, "audit");
                assert_eq!(fields, vec!["ip".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }

        let doc = audit
            .create("profiles/john/audit", &json!({ "action": "login" }), WriteOptions::default())
            .await
            .unwrap();
        assert_eq!(doc.id.len(), 36);
    }

    #[tokio::test]
    async fn test_non_object_input_is_invalid() {
        let store = test_store();
        let err = store
            .collection("profiles")
            .unwrap()
            .write("profiles/john", &vec![1, 2, 3], WriteOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, NestDocError::InvalidData(_)));
    }

    #[tokio::test]
    async fn test_mismatched_paths_fail_before_io() {
        init_logging();
        let db = Arc::new(CountingDatabase::new());
        let store = Store::new(db.clone(), schema());
        let emails = store.collection("contactEmails").unwrap();
        let data = json!({ "address": "a@x.com" });

        let wrong_depth = "profiles/john/emails/e1";
        let wrong_name = "users/john/contactInfo/home/emails/e1";
        for path in [wrong_depth, wrong_name] {
            assert!(emails.write(path, &data, WriteOptions::default()).await.unwrap_err().is_schema_mismatch());
            assert!(emails.read(path, CallOptions::default()).await.unwrap_err().is_schema_mismatch());
            assert!(emails.delete(path, CallOptions::default()).await.unwrap_err().is_schema_mismatch());
        }
        assert!(emails
            .create("profiles/john/emails", &data, WriteOptions::default())
            .await
            .unwrap_err()
            .is_schema_mismatch());
        assert!(emails
            .query("profiles/john/emails", &Query::new(), CallOptions::default())
            .await
            .unwrap_err()
            .is_schema_mismatch());
        assert!(matches!(
            emails.read("profiles//contactInfo/home/emails/e1", CallOptions::default()).await,
            Err(NestDocError::InvalidPath { .. })
        ));

        assert_eq!(db.calls(), 0);
    }

    #[tokio::test]
    async fn test_collection_lookup() {
        let store = test_store();
        assert!(matches!(
            store.collection("nope"),
            Err(NestDocError::UnknownCollection(_))
        ));

        let foreign = SchemaNode::root("profiles").build().unwrap();
        assert!(store.collection_for(&foreign).is_err());

        let registered = store.schema().node("profiles").unwrap().clone();
        let collection = store.collection_for(&registered).unwrap();
        assert_eq!(
            collection.doc_path(&["john"]).unwrap().as_str(),
            "profiles/john"
        );
    }

    #[tokio::test]
    async fn test_open_from_schema_file() {
        let dir = tempfile::tempdir().unwrap();
        let schema_path = dir.path().join("schema.yaml");
        std::fs::write(&schema_path, SCHEMA).unwrap();

        let store = Store::open(Arc::new(MemoryDatabase::new()), &schema_path).unwrap();
        assert_eq!(store.schema().len(), 5);
        assert_eq!(
            store.collection("contactEmails").unwrap().collection_path(&["john", "home"]).unwrap().as_str(),
            "profiles/john/contactInfo/home/emails"
        );
    }

    // ── Queries ────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_instance_query_filters_and_orders() {
        let store = test_store();
        let emails = store.collection("emails").unwrap();

        let john = [
            json!({ "address": "dave@gmail.com", "domain": "gmail" }),
            json!({ "address": "bob@yahoo.com", "domain": "yahoo" }),
            json!({ "address": "alice@gmail.com", "domain": "gmail" }),
            json!({ "address": "carol@gmail.com", "domain": "gmail" }),
            json!({ "address": "erin@hotmail.com", "domain": "hotmail" }),
        ];
        try_join_all(
            john.iter()
                .map(|data| emails.create("profiles/john/emails", data, WriteOptions::default())),
        )
        .await
        .unwrap();
        emails
            .create(
                "profiles/jane/emails",
                &json!({ "address": "aaron@gmail.com", "domain": "gmail" }),
                WriteOptions::default(),
            )
            .await
            .unwrap();

        let query = Query::new()
            .where_eq("domain", "gmail")
            .order_by("address", Direction::Ascending);
        let docs = emails
            .query("profiles/john/emails", &query, CallOptions::default())
            .await
            .unwrap();

        let addresses: Vec<&Value> = docs.iter().filter_map(|d| d.get("address")).collect();
        assert_eq!(
            addresses,
            vec![&json!("alice@gmail.com"), &json!("carol@gmail.com"), &json!("dave@gmail.com")]
        );
        assert!(docs.iter().all(|d| d.location.as_str().starts_with("profiles/john/emails/")));

        let limited = emails
            .query("profiles/john/emails", &query.clone().limit(1), CallOptions::default())
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);

        let none = emails
            .query("profiles/nobody/emails", &query, CallOptions::default())
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_group_query_spans_depths() {
        let store = test_store();
        let shallow = store.collection("emails").unwrap();
        let deep = store.collection("contactEmails").unwrap();

        shallow
            .write("profiles/john/emails/s1", &json!({ "address": "b@gmail.com", "domain": "gmail" }), WriteOptions::default())
            .await
            .unwrap();
        shallow
            .write("profiles/jane/emails/s2", &json!({ "address": "d@yahoo.com", "domain": "yahoo" }), WriteOptions::default())
            .await
            .unwrap();
        deep.write(
            "profiles/jane/contactInfo/home/emails/d1",
            &json!({ "address": "a@gmail.com", "domain": "gmail", "verified": true }),
            WriteOptions::default(),
        )
        .await
        .unwrap();
        deep.write(
            "profiles/john/contactInfo/work/emails/d2",
            &json!({ "address": "c@gmail.com", "domain": "gmail" }),
            WriteOptions::default(),
        )
        .await
        .unwrap();

        let query = Query::new()
            .where_eq("domain", "gmail")
            .order_by("address", Direction::Ascending);

        let from_shallow = shallow.query_group(&query, CallOptions::default()).await.unwrap();
        let from_deep = deep.query_group(&query, CallOptions::default()).await.unwrap();
        assert_eq!(from_shallow, from_deep);
        assert_eq!(
            ids(&from_shallow),
            vec![
                "profiles/jane/contactInfo/home/emails/d1",
                "profiles/john/emails/s1",
                "profiles/john/contactInfo/work/emails/d2",
            ]
        );

        // each result keeps the fields of the node declared at its location
        assert_eq!(from_shallow[0].node().key(), "contactEmails");
        assert_eq!(from_shallow[0].get("verified"), Some(&json!(true)));
        assert_eq!(from_shallow[1].node().key(), "emails");
    }

    #[tokio::test]
    async fn test_query_operators_end_to_end() {
        let store = test_store();
        let profiles = store.collection("profiles").unwrap();
        for (id, counter) in [("a", 1), ("b", 5), ("c", 10)] {
            profiles
                .write(&format!("profiles/{id}"), &json!({ "counter": counter }), WriteOptions::default())
                .await
                .unwrap();
        }

        let query = Query::new()
            .filter("counter", Operator::Gte, 5)
            .order_by("counter", Direction::Descending);
        let docs = profiles.query("profiles", &query, CallOptions::default()).await.unwrap();
        assert_eq!(ids(&docs), vec!["profiles/c", "profiles/b"]);

        let bad = Query::new().filter("counter", Operator::In, 5);
        assert!(matches!(
            profiles.query("profiles", &bad, CallOptions::default()).await,
            Err(NestDocError::InvalidQuery(_))
        ));
    }

    #[tokio::test]
    async fn test_query_on_undeclared_field_matches_nothing() {
        let store = test_store();
        let location = DocumentPath::parse("profiles/legacy").unwrap();
        store
            .database()
            .set(&location, json!({ "name": "Old", "ssn": "123" }).as_object().cloned().unwrap(), None)
            .await
            .unwrap();
        let profiles = store.collection("profiles").unwrap();

        let by_ssn = Query::new().where_eq("ssn", "123");
        assert!(profiles.query("profiles", &by_ssn, CallOptions::default()).await.unwrap().is_empty());
        let ordered = Query::new().order_by("ssn", Direction::Ascending);
        assert!(profiles.query("profiles", &ordered, CallOptions::default()).await.unwrap().is_empty());
        assert!(profiles.query_group(&by_ssn, CallOptions::default()).await.unwrap().is_empty());

        let declared = Query::new().where_eq("name", "Old");
        let docs = profiles.query("profiles", &declared, CallOptions::default()).await.unwrap();
        assert_eq!(ids(&docs), vec!["profiles/legacy"]);
    }

    #[tokio::test]
    async fn test_group_query_drops_nodes_without_the_field() {
        let store = test_store();
        let shallow = store.collection("emails").unwrap();
        let deep = store.collection("contactEmails").unwrap();

        // `verified` is only declared on the nested `emails` collection
        let raw = DocumentPath::parse("profiles/john/emails/s1").unwrap();
        store
            .database()
            .set(&raw, json!({ "address": "s@x.com", "verified": true }).as_object().cloned().unwrap(), None)
            .await
            .unwrap();
        deep.write(
            "profiles/john/contactInfo/home/emails/d1",
            &json!({ "address": "d@x.com", "verified": true }),
            WriteOptions::default(),
        )
        .await
        .unwrap();

        let verified = Query::new().where_eq("verified", true);
        let docs = deep.query_group(&verified, CallOptions::default()).await.unwrap();
        assert_eq!(ids(&docs), vec!["profiles/john/contactInfo/home/emails/d1"]);
        assert!(shallow.query_group(&verified, CallOptions::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_undeclared_field_query_skips_io() {
        let db = Arc::new(CountingDatabase::new());
        let store = Store::new(db.clone(), schema());
        let profiles = store.collection("profiles").unwrap();

        let by_ssn = Query::new().where_eq("ssn", "123");
        assert!(profiles.query("profiles", &by_ssn, CallOptions::default()).await.unwrap().is_empty());
        assert!(profiles.query_group(&by_ssn, CallOptions::default()).await.unwrap().is_empty());
        assert_eq!(db.calls(), 0);
    }

    // ── Transactions ───────────────────────────────────────────────

    #[tokio::test]
    async fn test_staged_writes_invisible_before_commit() {
        let store = test_store();
        let profiles = store.collection("profiles").unwrap();
        let profiles = &profiles;

        store
            .run_transaction(move |tx| async move {
                profiles
                    .write("profiles/john", &json!({ "name": "John" }), WriteOptions::new().transaction(&tx))
                    .await?;
                let outside = profiles.read("profiles/john", CallOptions::default()).await?;
                assert_eq!(outside, None);
                Ok::<_, NestDocError>(())
            })
            .await
            .unwrap();

        assert!(profiles.exists("profiles/john", CallOptions::default()).await.unwrap());
    }

    #[tokio::test]
    async fn test_read_after_write_fails_without_retry() {
        let store = test_store();
        let profiles = store.collection("profiles").unwrap();
        let profiles = &profiles;
        let attempts = AtomicUsize::new(0);
        let attempts = &attempts;

        let err = store
            .run_transaction(move |tx| async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                profiles
                    .write("profiles/a", &json!({ "name": "A" }), WriteOptions::new().transaction(&tx))
                    .await?;
                profiles.read("profiles/b", CallOptions::new().transaction(&tx)).await?;
                Ok::<_, NestDocError>(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, NestDocError::ReadAfterWrite(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(!profiles.exists("profiles/a", CallOptions::default()).await.unwrap());
    }

    #[tokio::test]
    async fn test_retries_exhausted_abort_transaction() {
        init_logging();
        let db = MemoryDatabase::with_config(MemoryDatabaseConfig {
            max_transaction_attempts: 3,
        });
        let store = Store::new(Arc::new(db), schema());
        let profiles = store.collection("profiles").unwrap();
        let profiles = &profiles;
        let attempts = AtomicUsize::new(0);
        let attempts = &attempts;

        profiles
            .write("profiles/a", &json!({ "counter": 0 }), WriteOptions::default())
            .await
            .unwrap();

        let err = store
            .run_transaction(move |tx| async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                profiles.read("profiles/a", CallOptions::new().transaction(&tx)).await?;
                // an out-of-band write lands on every attempt
                profiles
                    .write("profiles/a", &json!({ "counter": n }), WriteOptions::default())
                    .await?;
                profiles
                    .write("profiles/b", &json!({ "counter": n }), WriteOptions::new().transaction(&tx))
                    .await?;
                Ok::<_, NestDocError>(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, NestDocError::TransactionAborted { attempts: 3 }));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(!profiles.exists("profiles/b", CallOptions::default()).await.unwrap());
    }

    #[tokio::test]
    async fn test_conflict_reruns_callback_with_fresh_read() {
        let store = test_store();
        let profiles = store.collection("profiles").unwrap();
        profiles
            .write("profiles/a", &json!({ "name": "original" }), WriteOptions::default())
            .await
            .unwrap();

        let attempts = AtomicUsize::new(0);
        let read_a: Deferred<()> = Deferred::new();
        let a_updated: Deferred<()> = Deferred::new();
        let (profiles, attempts, read_a, a_updated) = (&profiles, &attempts, &read_a, &a_updated);

        let transaction = store.run_transaction(move |tx| async move {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let a = profiles
                .read("profiles/a", CallOptions::new().transaction(&tx))
                .await?
                .ok_or_else(|| NestDocError::NotFound { path: "profiles/a".into() })?;

            if attempt == 1 {
                read_a.resolve(());
                a_updated.wait().await.map_err(NestDocError::Backend)?;
            }

            profiles
                .write(
                    "profiles/b",
                    &json!({ "name": a.get("name") }),
                    WriteOptions::new().transaction(&tx),
                )
                .await?;
            Ok::<_, NestDocError>(attempt)
        });

        let interrupt = async {
            read_a.wait().await.unwrap();
            profiles
                .write("profiles/a", &json!({ "name": "updated" }), WriteOptions::default())
                .await
                .unwrap();
            a_updated.resolve(());
        };

        let (committed_on, ()) = tokio::join!(transaction, interrupt);
        assert_eq!(committed_on.unwrap(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);

        let b = profiles.read("profiles/b", CallOptions::default()).await.unwrap().unwrap();
        assert_eq!(b.get("name"), Some(&json!("updated")));
    }

    #[tokio::test]
    async fn test_transaction_reads_one_snapshot() {
        let store = test_store();
        let profiles = store.collection("profiles").unwrap();
        for id in ["a", "b"] {
            profiles
                .write(&format!("profiles/{id}"), &json!({ "counter": 0 }), WriteOptions::default())
                .await
                .unwrap();
        }

        let attempts = AtomicUsize::new(0);
        let read_a: Deferred<()> = Deferred::new();
        let both_updated: Deferred<()> = Deferred::new();
        let (profiles, attempts, read_a, both_updated) = (&profiles, &attempts, &read_a, &both_updated);
        let counter = |doc: Option<Document>| doc.and_then(|d| d.get("counter").and_then(Value::as_i64));

        let transaction = store.run_transaction(move |tx| async move {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let a = counter(profiles.read("profiles/a", CallOptions::new().transaction(&tx)).await?);

            if attempt == 1 {
                read_a.resolve(());
                both_updated.wait().await.map_err(NestDocError::Backend)?;
            }

            let b = counter(profiles.read("profiles/b", CallOptions::new().transaction(&tx)).await?);
            if a != b {
                return Err(NestDocError::InvalidData(format!("inconsistent snapshot: a={a:?} b={b:?}")));
            }
            Ok::<_, NestDocError>((a, b))
        });

        // both documents move together, atomically
        let interrupt = async {
            read_a.wait().await.unwrap();
            store
                .run_transaction(move |tx| async move {
                    for id in ["a", "b"] {
                        profiles
                            .write(&format!("profiles/{id}"), &json!({ "counter": 1 }), WriteOptions::new().transaction(&tx))
                            .await?;
                    }
                    Ok::<_, NestDocError>(())
                })
                .await
                .unwrap();
            both_updated.resolve(());
        };

        let (observed, ()) = tokio::join!(transaction, interrupt);
        assert_eq!(observed.unwrap(), (Some(1), Some(1)));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_callback_failure_propagates_without_retry() {
        let store = test_store();
        let profiles = store.collection("profiles").unwrap();
        let attempts = AtomicUsize::new(0);
        let upstream: Deferred<()> = Deferred::new();
        let (profiles, attempts, upstream) = (&profiles, &attempts, &upstream);

        let transaction = store.run_transaction(move |tx| async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            profiles
                .write("profiles/a", &json!({ "name": "A" }), WriteOptions::new().transaction(&tx))
                .await?;
            upstream.wait().await.map_err(NestDocError::Backend)?;
            Ok::<_, NestDocError>(())
        });
        let fail = async {
            tokio::task::yield_now().await;
            upstream.reject("upstream unavailable");
        };

        let (outcome, ()) = tokio::join!(transaction, fail);
        assert!(matches!(outcome, Err(NestDocError::Backend(ref reason)) if reason == "upstream unavailable"));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(!profiles.exists("profiles/a", CallOptions::default()).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_increments_serialize() {
        let store = test_store();
        let profiles = store.collection("profiles").unwrap();
        let profiles = &profiles;
        profiles
            .write("profiles/a", &json!({ "counter": 0 }), WriteOptions::default())
            .await
            .unwrap();

        let increment = || {
            store.run_transaction(move |tx| async move {
                let current = profiles
                    .read("profiles/a", CallOptions::new().transaction(&tx))
                    .await?
                    .and_then(|d| d.get("counter").and_then(Value::as_i64))
                    .unwrap_or(0);
                profiles
                    .write("profiles/a", &json!({ "counter": current + 1 }), WriteOptions::new().transaction(&tx))
                    .await?;
                Ok::<_, NestDocError>(())
            })
        };

        let (first, second) = tokio::join!(increment(), increment());
        first.unwrap();
        second.unwrap();

        let doc = profiles.read("profiles/a", CallOptions::default()).await.unwrap().unwrap();
        assert_eq!(doc.get("counter"), Some(&json!(2)));
    }
}
