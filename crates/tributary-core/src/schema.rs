//! Schema registry: broker message type → graph entity/relationship mapping.
//!
//! The registry is a JSON document loaded at startup:
//!
//! ```json
//! {
//!   "type_field": "type",
//!   "mappings": {
//!     "sensor_reading": {
//!       "entity": {
//!         "target_type": "SensorReading",
//!         "id_fields": ["reading_id"],
//!         "fields": { "value": { "kind": "float", "required": true } }
//!       },
//!       "relationships": [
//!         { "target_type": "MEASURED_BY", "target_id_field": "sensor_id" }
//!       ]
//!     }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::SchemaError;

/// The full set of mappings for one pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchemaRegistry {
    /// Payload field carrying the message type.
    #[serde(default = "default_type_field")]
    pub type_field: String,

    /// Broker header carrying the message type; checked before the payload.
    #[serde(default = "default_type_header")]
    pub type_header: String,

    /// Type assumed when neither header nor payload names one.
    #[serde(default)]
    pub default_type: Option<String>,

    /// Mappings keyed by broker message type.
    #[serde(default)]
    pub mappings: BTreeMap<String, MessageMapping>,
}

/// How one broker message type becomes canonical records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageMapping {
    #[serde(default)]
    pub entity: Option<EntityMapping>,

    #[serde(default)]
    pub relationships: Vec<RelationshipMapping>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityMapping {
    pub target_type: String,

    /// Candidate id fields, first present wins.
    #[serde(default = "default_id_fields")]
    pub id_fields: Vec<String>,

    #[serde(default)]
    pub fields: BTreeMap<String, FieldRule>,

    /// Copy unmapped top-level fields as properties.
    #[serde(default)]
    pub passthrough: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelationshipMapping {
    pub target_type: String,

    /// Field holding the source external id. Defaults to the entity's id.
    #[serde(default)]
    pub source_id_field: Option<String>,

    pub target_id_field: String,

    /// When false, a missing target id omits the relationship instead of
    /// rejecting it.
    #[serde(default = "default_true")]
    pub required: bool,

    #[serde(default)]
    pub fields: BTreeMap<String, FieldRule>,
}

/// Coercion rule for one payload field.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FieldRule {
    #[serde(default)]
    pub kind: FieldKind,

    #[serde(default)]
    pub required: bool,

    /// Property name in the graph, if different from the payload field.
    #[serde(default)]
    pub property: Option<String>,

    /// Value used when the field is absent or null.
    #[serde(default)]
    pub default: Option<serde_json::Value>,
}

/// Target type of a coerced field.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    #[default]
    String,
    Integer,
    Float,
    Boolean,
    /// RFC 3339 string or epoch seconds, normalized to RFC 3339 UTC.
    Timestamp,
    /// Kept verbatim, including nested objects and arrays.
    Json,
}

impl FieldKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Timestamp => "timestamp",
            Self::Json => "json",
        }
    }
}

fn default_type_field() -> String {
    "type".to_string()
}

fn default_type_header() -> String {
    "message_type".to_string()
}

fn default_id_fields() -> Vec<String> {
    vec!["id".to_string()]
}

fn default_true() -> bool {
    true
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self {
            type_field: default_type_field(),
            type_header: default_type_header(),
            default_type: None,
            mappings: BTreeMap::new(),
        }
    }
}

impl SchemaRegistry {
    /// Load and validate a registry from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SchemaError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| SchemaError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let registry = Self::from_json(&json)?;

        tracing::info!(
            path = %path.display(),
            mappings = registry.mappings.len(),
            "Schema registry loaded"
        );
        Ok(registry)
    }

    /// Parse and validate a registry from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, SchemaError> {
        let registry: SchemaRegistry = serde_json::from_str(json)?;
        registry.validate()?;
        Ok(registry)
    }

    /// Look up the mapping for a broker message type.
    pub fn resolve(&self, message_type: &str) -> Option<&MessageMapping> {
        self.mappings.get(message_type)
    }

    /// Check every mapping can produce graph-safe records.
    pub fn validate(&self) -> Result<(), SchemaError> {
        for (message_type, mapping) in &self.mappings {
            let invalid = |reason: String| SchemaError::Invalid {
                message_type: message_type.clone(),
                reason,
            };

            if mapping.entity.is_none() && mapping.relationships.is_empty() {
                return Err(invalid("mapping produces no records".to_string()));
            }

            if let Some(entity) = &mapping.entity {
                if !is_graph_identifier(&entity.target_type) {
                    return Err(invalid(format!(
                        "entity type {:?} is not a valid graph identifier",
                        entity.target_type
                    )));
                }
                if entity.id_fields.is_empty() {
                    return Err(invalid("entity mapping has no id_fields".to_string()));
                }
            }

            for rel in &mapping.relationships {
                if !is_graph_identifier(&rel.target_type) {
                    return Err(invalid(format!(
                        "relationship type {:?} is not a valid graph identifier",
                        rel.target_type
                    )));
                }
                if rel.source_id_field.is_none() && mapping.entity.is_none() {
                    return Err(invalid(format!(
                        "relationship {} needs source_id_field when no entity is mapped",
                        rel.target_type
                    )));
                }
                if rel.target_id_field.is_empty() {
                    return Err(invalid(format!(
                        "relationship {} has an empty target_id_field",
                        rel.target_type
                    )));
                }
            }
        }

        if let Some(default_type) = &self.default_type {
            if !self.mappings.contains_key(default_type) {
                tracing::warn!(
                    default_type = %default_type,
                    "Default message type has no mapping"
                );
            }
        }

        Ok(())
    }
}

/// Whether `s` can be interpolated into a Cypher label or relationship type.
pub fn is_graph_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
