mod node;
mod parser;
mod types;

pub use node::{Ancestry, Schema, SchemaNode, SchemaNodeBuilder};
pub use parser::{load_schema, parse_schema, parse_schema_str};
pub use types::{AutoIdStrategy, CollectionDefinition, FieldDefinition, IdConfig, SchemaDefinition};
