use crate::error::{NestDocError, Result};
use crate::path::{validate_segment, DocumentPath};
use super::types::{AutoIdStrategy, SchemaDefinition};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// A declared collection: its name, allowed fields, defaults and optional parent.
///
/// Nodes are immutable once built and cheap to clone. A nested node holds its
/// parent, so ancestry is resolved by walking `parent()` up to a root.
#[derive(Clone)]
pub struct SchemaNode {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    key: String,
    collection_name: String,
    allowed_fields: BTreeSet<String>,
    defaults: Map<String, Value>,
    parent: Option<SchemaNode>,
    id_strategy: AutoIdStrategy,
    strict: bool,
    depth: usize,
}

impl SchemaNode {
    /// Start building a root collection node
    pub fn root(collection_name: impl Into<String>) -> SchemaNodeBuilder {
        SchemaNodeBuilder::new(collection_name.into(), None)
    }

    /// Start building a node nested under a document of `parent`
    pub fn nested(parent: &SchemaNode, collection_name: impl Into<String>) -> SchemaNodeBuilder {
        SchemaNodeBuilder::new(collection_name.into(), Some(parent.clone()))
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn collection_name(&self) -> &str {
        &self.inner.collection_name
    }

    pub fn allowed_fields(&self) -> &BTreeSet<String> {
        &self.inner.allowed_fields
    }

    pub fn allows(&self, field: &str) -> bool {
        self.inner.allowed_fields.contains(field)
    }

    pub fn defaults(&self) -> &Map<String, Value> {
        &self.inner.defaults
    }

    pub fn parent(&self) -> Option<&SchemaNode> {
        self.inner.parent.as_ref()
    }

    pub fn is_root(&self) -> bool {
        self.inner.parent.is_none()
    }

    /// Number of collections from the root down to and including this one
    pub fn depth(&self) -> usize {
        self.inner.depth
    }

    pub fn id_strategy(&self) -> AutoIdStrategy {
        self.inner.id_strategy
    }

    pub fn is_strict(&self) -> bool {
        self.inner.strict
    }

    /// This node followed by each ancestor up to the root
    pub fn ancestry(&self) -> Ancestry<'_> {
        Ancestry { next: Some(self) }
    }

    /// Collection names from the root down to this node
    pub fn collection_chain(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.ancestry().map(|n| n.collection_name()).collect();
        names.reverse();
        names
    }

    /// Identity comparison: true when both handles refer to the same declared node
    pub fn same_node(&self, other: &SchemaNode) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn generate_id(&self) -> String {
        self.inner.id_strategy.generate()
    }
}

impl PartialEq for SchemaNode {
    fn eq(&self, other: &Self) -> bool {
        self.same_node(other)
    }
}

impl Eq for SchemaNode {}

impl fmt::Debug for SchemaNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaNode")
            .field("key", &self.inner.key)
            .field("collection_name", &self.inner.collection_name)
            .field("allowed_fields", &self.inner.allowed_fields)
            .field("parent", &self.parent().map(|p| p.key()))
            .finish()
    }
}

/// Iterator over a node and its ancestors
pub struct Ancestry<'a> {
    next: Option<&'a SchemaNode>,
}

impl<'a> Iterator for Ancestry<'a> {
    type Item = &'a SchemaNode;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.parent();
        Some(current)
    }
}

/// Builder for [`SchemaNode`]
#[derive(Debug)]
pub struct SchemaNodeBuilder {
    key: Option<String>,
    collection_name: String,
    allowed_fields: BTreeSet<String>,
    defaults: Map<String, Value>,
    parent: Option<SchemaNode>,
    id_strategy: AutoIdStrategy,
    strict: bool,
}

impl SchemaNodeBuilder {
    fn new(collection_name: String, parent: Option<SchemaNode>) -> Self {
        SchemaNodeBuilder {
            key: None,
            collection_name,
            allowed_fields: BTreeSet::new(),
            defaults: Map::new(),
            parent,
            id_strategy: AutoIdStrategy::default(),
            strict: false,
        }
    }

    /// Registry key. Defaults to the collection chain joined with `/`.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn field(mut self, name: impl Into<String>) -> Self {
        self.allowed_fields.insert(name.into());
        self
    }

    pub fn fields<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_fields.extend(names.into_iter().map(Into::into));
        self
    }

    /// Declare a field together with the value used when defaults are merged
    pub fn field_with_default(mut self, name: impl Into<String>, default: impl Into<Value>) -> Self {
        let name = name.into();
        self.allowed_fields.insert(name.clone());
        self.defaults.insert(name, default.into());
        self
    }

    pub fn id_strategy(mut self, strategy: AutoIdStrategy) -> Self {
        self.id_strategy = strategy;
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn build(self) -> Result<SchemaNode> {
        validate_segment(&self.collection_name).map_err(|reason| {
            NestDocError::Schema(format!(
                "Invalid collection name '{}': {reason}",
                self.collection_name
            ))
        })?;
        for field in &self.allowed_fields {
            if field.is_empty() {
                return Err(NestDocError::Schema(format!(
                    "Collection '{}' declares an empty field name",
                    self.collection_name
                )));
            }
        }

        let depth = self.parent.as_ref().map_or(1, |p| p.depth() + 1);
        let key = match self.key {
            Some(key) if key.is_empty() => {
                return Err(NestDocError::Schema("Node key must not be empty".into()));
            }
            Some(key) => key,
            None => match &self.parent {
                Some(parent) => {
                    let mut chain = parent.collection_chain().join("/");
                    chain.push('/');
                    chain.push_str(&self.collection_name);
                    chain
                }
                None => self.collection_name.clone(),
            },
        };

        Ok(SchemaNode {
            inner: Arc::new(NodeInner {
                key,
                collection_name: self.collection_name,
                allowed_fields: self.allowed_fields,
                defaults: self.defaults,
                parent: self.parent,
                id_strategy: self.id_strategy,
                strict: self.strict,
                depth,
            }),
        })
    }
}

/// Registry of declared schema nodes, looked up by key.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    nodes: Vec<SchemaNode>,
    index: HashMap<String, usize>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node. Its parent must already be registered.
    pub fn register(&mut self, node: SchemaNode) -> Result<()> {
        if self.index.contains_key(node.key()) {
            return Err(NestDocError::Schema(format!(
                "Duplicate schema node key '{}'",
                node.key()
            )));
        }

        if let Some(parent) = node.parent() {
            let registered = self
                .node(parent.key())
                .map(|p| p.same_node(parent))
                .unwrap_or(false);
            if !registered {
                return Err(NestDocError::Schema(format!(
                    "Parent '{}' of '{}' is not registered",
                    parent.key(),
                    node.key()
                )));
            }
        }

        let sibling_clash = self.nodes.iter().any(|other| {
            other.collection_name() == node.collection_name()
                && match (other.parent(), node.parent()) {
                    (None, None) => true,
                    (Some(a), Some(b)) => a.same_node(b),
                    _ => false,
                }
        });
        if sibling_clash {
            return Err(NestDocError::Schema(format!(
                "Collection '{}' is declared twice at the same position",
                node.collection_name()
            )));
        }

        log::trace!("Registered schema node '{}'", node.key());
        self.index.insert(node.key().to_string(), self.nodes.len());
        self.nodes.push(node);
        Ok(())
    }

    /// Builder-style registration; returns the registered node
    pub fn add(&mut self, builder: SchemaNodeBuilder) -> Result<SchemaNode> {
        let node = builder.build()?;
        self.register(node.clone())?;
        Ok(node)
    }

    pub fn node(&self, key: &str) -> Option<&SchemaNode> {
        self.index.get(key).map(|&i| &self.nodes[i])
    }

    pub fn nodes(&self) -> impl Iterator<Item = &SchemaNode> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes declared directly under documents of `node`
    pub fn children<'a>(&'a self, node: &'a SchemaNode) -> impl Iterator<Item = &'a SchemaNode> {
        self.nodes
            .iter()
            .filter(move |n| n.parent().map(|p| p.same_node(node)).unwrap_or(false))
    }

    /// The node whose collection chain matches a concrete document location
    pub fn node_for_document(&self, path: &DocumentPath) -> Option<&SchemaNode> {
        let chain: Vec<&str> = path.segments().step_by(2).collect();
        self.nodes.iter().find(|n| n.collection_chain() == chain)
    }

    /// Build a registry from a parsed YAML definition.
    /// Parents are registered before their children regardless of declaration order.
    pub fn from_definition(definition: &SchemaDefinition) -> Result<Self> {
        let mut schema = Schema::new();
        let mut pending: Vec<&String> = definition.collections.keys().collect();

        while !pending.is_empty() {
            let before = pending.len();
            let mut deferred = Vec::new();

            for key in pending {
                let def = &definition.collections[key];
                let parent = match &def.parent {
                    None => None,
                    Some(parent_key) => match schema.node(parent_key) {
                        Some(parent) => Some(parent.clone()),
                        None if definition.collections.contains_key(parent_key) => {
                            deferred.push(key);
                            continue;
                        }
                        None => {
                            return Err(NestDocError::Schema(format!(
                                "Collection '{key}' references unknown parent '{parent_key}'"
                            )));
                        }
                    },
                };

                let name = def.collection_name(key);
                let mut builder = match &parent {
                    Some(parent) => SchemaNode::nested(parent, name),
                    None => SchemaNode::root(name),
                };
                builder = builder
                    .with_key(key.clone())
                    .id_strategy(def.auto_id())
                    .strict(def.strict);

                for (field_name, field_def) in &def.fields {
                    builder = match &field_def.default {
                        Some(default) => {
                            builder.field_with_default(field_name.clone(), serde_json::to_value(default)?)
                        }
                        None => builder.field(field_name.clone()),
                    };
                }

                schema.add(builder)?;
            }

            if deferred.len() == before {
                let keys: Vec<&str> = deferred.iter().map(|k| k.as_str()).collect();
                return Err(NestDocError::Schema(format!(
                    "Parent cycle between collections: {}",
                    keys.join(", ")
                )));
            }
            pending = deferred;
        }

        Ok(schema)
    }
}
