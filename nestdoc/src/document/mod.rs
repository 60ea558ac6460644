// Documents - sanitized fields decorated with location, metadata and sub-collections

use crate::backend::StoredDocument;
use crate::error::{NestDocError, Result};
use crate::path::{CollectionPath, DocumentPath};
use crate::sanitize::{self, SanitizeOptions};
use crate::schema::{Schema, SchemaNode};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A document of a known schema node, as returned by reads, writes and queries.
///
/// `fields` only ever holds fields the node allows. Timestamps are present on
/// documents fetched from the store and absent on the value returned by a write.
#[derive(Clone)]
pub struct Document {
    pub id: String,
    pub fields: Map<String, Value>,
    pub location: DocumentPath,
    pub create_time: Option<DateTime<Utc>>,
    pub update_time: Option<DateTime<Utc>>,
    node: SchemaNode,
    schema: Arc<Schema>,
}

/// A collection nested under a specific document
#[derive(Debug, Clone, PartialEq)]
pub struct Subcollection {
    pub node: SchemaNode,
    pub path: CollectionPath,
}

impl Document {
    /// Decorate freshly written fields
    pub(crate) fn written(
        node: &SchemaNode,
        schema: &Arc<Schema>,
        location: DocumentPath,
        fields: Map<String, Value>,
    ) -> Self {
        Document {
            id: location.id().to_string(),
            fields,
            location,
            create_time: None,
            update_time: None,
            node: node.clone(),
            schema: Arc::clone(schema),
        }
    }

    /// Sanitize a raw stored document through `node`
    pub(crate) fn from_stored(node: &SchemaNode, schema: &Arc<Schema>, stored: StoredDocument) -> Self {
        let fields = sanitize::sanitize(node, &stored.fields, SanitizeOptions::default());
        Document {
            id: stored.path.id().to_string(),
            fields,
            location: stored.path,
            create_time: Some(stored.create_time),
            update_time: Some(stored.update_time),
            node: node.clone(),
            schema: Arc::clone(schema),
        }
    }

    /// The schema node this document was read or written through
    pub fn node(&self) -> &SchemaNode {
        &self.node
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Decode the fields into a typed value
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(Value::Object(self.fields.clone()))?)
    }

    /// Collections declared under this document's node, keyed by collection name.
    /// Computed from the registry on each call.
    pub fn subcollections(&self) -> Result<BTreeMap<String, Subcollection>> {
        let mut subcollections = BTreeMap::new();
        for child in self.schema.children(&self.node) {
            let path = self.location.child(child.collection_name())?;
            subcollections.insert(
                child.collection_name().to_string(),
                Subcollection {
                    node: child.clone(),
                    path,
                },
            );
        }
        Ok(subcollections)
    }
}

/// Serialized shape of a document: id, path and fields, plus timestamps when known
#[derive(Serialize)]
struct DocumentView<'a> {
    id: &'a str,
    path: &'a str,
    fields: &'a Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    create_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    update_time: Option<DateTime<Utc>>,
}

impl Serialize for Document {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        DocumentView {
            id: &self.id,
            path: self.location.as_str(),
            fields: &self.fields,
            create_time: self.create_time,
            update_time: self.update_time,
        }
        .serialize(serializer)
    }
}

impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.location == other.location && self.fields == other.fields
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("id", &self.id)
            .field("location", &self.location.as_str())
            .field("fields", &self.fields)
            .field("node", &self.node.key())
            .finish()
    }
}

/// Serialize caller input into a field map. Anything but an object is rejected.
pub(crate) fn to_fields<T: Serialize + ?Sized>(data: &T) -> Result<Map<String, Value>> {
    match serde_json::to_value(data)? {
        Value::Object(map) => Ok(map),
        other => Err(NestDocError::InvalidData(format!(
            "expected an object, got {}",
            kind(&other)
        ))),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
