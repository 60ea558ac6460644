use crate::schema::SchemaNode;
use serde_json::{Map, Value};

/// Per-call sanitization options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SanitizeOptions {
    /// Fill fields absent from the input with the node's declared defaults
    pub merge_defaults: bool,
}

impl SanitizeOptions {
    pub fn merging_defaults() -> Self {
        SanitizeOptions { merge_defaults: true }
    }
}

/// Restrict `input` to the node's allowed fields, optionally merging defaults.
///
/// Unknown keys are dropped without error. With `merge_defaults`, each declared
/// default whose field is absent from the restricted input is added; values the
/// caller supplied always win, including explicit nulls.
pub fn sanitize(node: &SchemaNode, input: &Map<String, Value>, options: SanitizeOptions) -> Map<String, Value> {
    let mut fields = Map::new();

    for (key, value) in input {
        if node.allows(key) {
            fields.insert(key.clone(), value.clone());
        } else {
            log::debug!(
                "Dropping field '{key}' not declared on collection '{}'",
                node.collection_name()
            );
        }
    }

    if options.merge_defaults {
        apply_defaults(node, &mut fields);
    }

    fields
}

/// Fill absent fields with the node's defaults. Present fields are left untouched.
pub fn apply_defaults(node: &SchemaNode, fields: &mut Map<String, Value>) {
    for (field_name, default) in node.defaults() {
        if node.allows(field_name) && !fields.contains_key(field_name) {
            fields.insert(field_name.clone(), default.clone());
        }
    }
}

/// Input keys that the node does not declare, sorted
pub fn unknown_fields(node: &SchemaNode, input: &Map<String, Value>) -> Vec<String> {
    let mut unknown: Vec<String> = input
        .keys()
        .filter(|key| !node.allows(key))
        .cloned()
        .collect();
    unknown.sort();
    unknown
}
