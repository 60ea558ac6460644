use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Top-level schema definition parsed from a schema YAML file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaDefinition {
    /// Keyed by node key. Ordered so that resolution and error reporting are
    /// deterministic.
    #[serde(default)]
    pub collections: BTreeMap<String, CollectionDefinition>,
}

/// Definition of a single collection node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionDefinition {
    /// Collection name as it appears in paths. Defaults to the map key.
    #[serde(default)]
    pub name: Option<String>,
    /// Key of the parent node; absent for root collections.
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub fields: HashMap<String, FieldDefinition>,
    /// Reject unknown input fields instead of dropping them.
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub id: Option<IdConfig>,
}

impl CollectionDefinition {
    /// The collection name for this definition, falling back to its key
    pub fn collection_name<'a>(&'a self, key: &'a str) -> &'a str {
        self.name.as_deref().unwrap_or(key)
    }

    pub fn auto_id(&self) -> AutoIdStrategy {
        self.id
            .as_ref()
            .and_then(|cfg| cfg.auto.clone())
            .unwrap_or_default()
    }
}

/// Configuration for generated document IDs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdConfig {
    pub auto: Option<AutoIdStrategy>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoIdStrategy {
    /// 20 alphanumeric characters
    #[default]
    Nanoid,
    Uuid,
    Ulid,
}

const ID_ALPHABET: [char; 62] = [
    'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R',
    'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j',
    'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z', '0', '1',
    '2', '3', '4', '5', '6', '7', '8', '9',
];

impl AutoIdStrategy {
    /// Generate a fresh document ID
    pub fn generate(&self) -> String {
        match self {
            AutoIdStrategy::Nanoid => nanoid::nanoid!(20, &ID_ALPHABET),
            AutoIdStrategy::Uuid => uuid::Uuid::new_v4().to_string(),
            AutoIdStrategy::Ulid => ulid::Ulid::new().to_string().to_lowercase(),
        }
    }
}

/// Definition of a single field in a collection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldDefinition {
    #[serde(default)]
    pub default: Option<serde_yaml::Value>,
}
