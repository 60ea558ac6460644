// Path resolution - typed document/collection locations, ancestry checks

use crate::error::{NestDocError, Result};
use crate::schema::SchemaNode;
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

fn reserved_pattern() -> &'static Regex {
    static RESERVED: OnceLock<Regex> = OnceLock::new();
    RESERVED.get_or_init(|| Regex::new(r"^__.*__$").expect("reserved segment pattern is valid"))
}

/// Check a single collection-name or document-id segment.
/// Returns the reason on failure so callers can wrap it in their own error.
pub(crate) fn validate_segment(segment: &str) -> std::result::Result<(), String> {
    if segment.is_empty() {
        return Err("segment is empty".into());
    }
    if segment.contains('/') {
        return Err("segment contains '/'".into());
    }
    if segment == "." || segment == ".." {
        return Err("segment must not be '.' or '..'".into());
    }
    if reserved_pattern().is_match(segment) {
        return Err("segments matching __*__ are reserved".into());
    }
    Ok(())
}

fn split_path(path: &str) -> Result<Vec<&str>> {
    if path.is_empty() {
        return Err(NestDocError::invalid_path(path, "path is empty"));
    }
    let segments: Vec<&str> = path.split('/').collect();
    for segment in &segments {
        validate_segment(segment).map_err(|reason| NestDocError::invalid_path(path, reason))?;
    }
    Ok(segments)
}

/// Fully qualified location of a document:
/// `collection/id[/collection/id...]`, always an even number of segments.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocumentPath {
    raw: String,
}

impl DocumentPath {
    pub fn parse(path: &str) -> Result<Self> {
        let segments = split_path(path)?;
        if segments.len() % 2 != 0 {
            return Err(NestDocError::invalid_path(
                path,
                "a document path needs an even number of segments",
            ));
        }
        Ok(DocumentPath { raw: path.to_string() })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> impl DoubleEndedIterator<Item = &str> {
        self.raw.split('/')
    }

    /// The document ID (last segment)
    pub fn id(&self) -> &str {
        self.raw.rsplit('/').next().unwrap_or_default()
    }

    /// The collection containing this document
    pub fn parent(&self) -> CollectionPath {
        let cut = self.raw.rfind('/').unwrap_or(0);
        CollectionPath {
            raw: self.raw[..cut].to_string(),
        }
    }

    pub fn collection_name(&self) -> &str {
        self.segments().rev().nth(1).unwrap_or_default()
    }

    /// Number of collection/id pairs
    pub fn depth(&self) -> usize {
        self.segments().count() / 2
    }

    /// A sub-collection rooted at this document
    pub fn child(&self, collection_name: &str) -> Result<CollectionPath> {
        let raw = format!("{}/{}", self.raw, collection_name);
        validate_segment(collection_name).map_err(|reason| NestDocError::invalid_path(&raw, reason))?;
        Ok(CollectionPath { raw })
    }
}

impl fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl AsRef<str> for DocumentPath {
    fn as_ref(&self) -> &str {
        &self.raw
    }
}

/// Fully qualified location of one collection instance:
/// `collection[/id/collection...]`, always an odd number of segments.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CollectionPath {
    raw: String,
}

impl CollectionPath {
    pub fn parse(path: &str) -> Result<Self> {
        let segments = split_path(path)?;
        if segments.len() % 2 == 0 {
            return Err(NestDocError::invalid_path(
                path,
                "a collection path needs an odd number of segments",
            ));
        }
        Ok(CollectionPath { raw: path.to_string() })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> impl DoubleEndedIterator<Item = &str> {
        self.raw.split('/')
    }

    pub fn collection_name(&self) -> &str {
        self.raw.rsplit('/').next().unwrap_or_default()
    }

    /// The document this collection is nested under, if any
    pub fn parent(&self) -> Option<DocumentPath> {
        self.raw.rfind('/').map(|cut| DocumentPath {
            raw: self.raw[..cut].to_string(),
        })
    }

    /// Number of collection segments
    pub fn depth(&self) -> usize {
        (self.segments().count() + 1) / 2
    }

    /// Location of the document `id` inside this collection
    pub fn doc(&self, id: &str) -> Result<DocumentPath> {
        let raw = format!("{}/{}", self.raw, id);
        validate_segment(id).map_err(|reason| NestDocError::invalid_path(&raw, reason))?;
        Ok(DocumentPath { raw })
    }

    /// True when `doc` lives directly in this collection instance
    pub fn contains(&self, doc: &DocumentPath) -> bool {
        doc.parent() == *self
    }
}

impl fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl AsRef<str> for CollectionPath {
    fn as_ref(&self) -> &str {
        &self.raw
    }
}

/// Every instance of a collection name, at any ancestor chain and depth
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionGroup {
    name: String,
}

impl CollectionGroup {
    pub fn new(name: impl Into<String>) -> Self {
        CollectionGroup { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn contains(&self, doc: &DocumentPath) -> bool {
        doc.collection_name() == self.name
    }
}

impl fmt::Display for CollectionGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "*/{}", self.name)
    }
}

// ── Resolver ───────────────────────────────────────────────────────

/// Check that root-first collection names match the node's declared ancestry
fn check_ancestry<'a>(
    node: &SchemaNode,
    path: &str,
    found: impl Iterator<Item = &'a str>,
) -> Result<()> {
    let found: Vec<&str> = found.collect();
    let expected = node.collection_chain();

    if found.len() != expected.len() {
        return Err(NestDocError::mismatch(
            node.collection_name(),
            path,
            format!(
                "expected {} collection level(s) ({}), found {}",
                expected.len(),
                expected.join("/"),
                found.len()
            ),
        ));
    }

    for (level, (want, got)) in expected.iter().zip(&found).enumerate() {
        if want != got {
            return Err(NestDocError::mismatch(
                node.collection_name(),
                path,
                format!("expected collection '{want}' at level {level}, found '{got}'"),
            ));
        }
    }

    Ok(())
}

/// Resolve and validate the location of a document of `node`
pub fn resolve_document(node: &SchemaNode, path: &str) -> Result<DocumentPath> {
    let doc = DocumentPath::parse(path)?;
    check_ancestry(node, path, doc.segments().step_by(2))?;
    Ok(doc)
}

/// Resolve and validate the location of a collection instance of `node`
pub fn resolve_collection(node: &SchemaNode, path: &str) -> Result<CollectionPath> {
    let collection = CollectionPath::parse(path)?;
    check_ancestry(node, path, collection.segments().step_by(2))?;
    Ok(collection)
}

/// Build a document location from its id chain, root first
pub fn locate_document(node: &SchemaNode, ids: &[&str]) -> Result<DocumentPath> {
    match ids.split_last() {
        Some((id, ancestors)) if ids.len() == node.depth() => {
            locate_collection(node, ancestors)?.doc(id)
        }
        _ => Err(id_count_mismatch(node, ids, node.depth())),
    }
}

/// Build the location of the collection instance holding documents of `node`,
/// given the ids of its ancestor documents, root first
pub fn locate_collection(node: &SchemaNode, ancestor_ids: &[&str]) -> Result<CollectionPath> {
    let expected = node.depth() - 1;
    if ancestor_ids.len() != expected {
        return Err(id_count_mismatch(node, ancestor_ids, expected));
    }

    let mut raw = String::new();
    for (name, id) in node.collection_chain().iter().zip(ancestor_ids) {
        validate_segment(id).map_err(|reason| NestDocError::invalid_path(ancestor_ids.join("/"), reason))?;
        raw.push_str(name);
        raw.push('/');
        raw.push_str(id);
        raw.push('/');
    }
    raw.push_str(node.collection_name());
    Ok(CollectionPath { raw })
}

fn id_count_mismatch(node: &SchemaNode, ids: &[&str], expected: usize) -> NestDocError {
    NestDocError::mismatch(
        node.collection_name(),
        ids.join("/"),
        format!("expected {expected} id(s), got {}", ids.len()),
    )
}

/// The collection-group target for `node`: its name only, ancestry ignored
pub fn collection_group(node: &SchemaNode) -> CollectionGroup {
    CollectionGroup::new(node.collection_name())
}
