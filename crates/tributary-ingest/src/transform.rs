//! Transformer: raw broker payload → canonical entity/relationship records.
//!
//! A transform is a pure function of the message and one registry snapshot.
//! Data defects are attached to the record they affect; only a message type
//! with no mapping is an error, because ingesting it would mean guessing.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use parking_lot::RwLock;
use serde_json::{Map, Value};

use tributary_core::error::SchemaError;
use tributary_core::schema::{
    EntityMapping, FieldKind, FieldRule, MessageMapping, RelationshipMapping,
};
use tributary_core::{
    CanonicalRecord, EntityRecord, Properties, RawMessage, RelationshipRecord, SchemaRegistry,
    TransformError, ValidationError,
};

/// Payload keys never copied by passthrough.
const METADATA_KEYS: &[&str] = &["metadata", "meta", "_meta", "original_headers"];

/// Passthrough property carrying the broker headers as a JSON object string.
const HEADERS_PROPERTY: &str = "_headers";

// ── Output ───────────────────────────────────────────────────────

/// A record plus any validation problems found while building it.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateRecord {
    pub record: CanonicalRecord,
    pub errors: Vec<ValidationError>,
}

impl CandidateRecord {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Human-readable failure reason, one clause per error.
    pub fn failure_reason(&self) -> String {
        self.errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Result of transforming one message.
#[derive(Debug, Clone, PartialEq)]
pub enum Transformed {
    /// Records in payload order; possibly empty.
    Records(Vec<CandidateRecord>),
    /// The payload could not be read at all.
    Rejected(ValidationError),
}

// ── Shared Registry ──────────────────────────────────────────────

/// Hot-swappable schema registry.
///
/// Readers take an `Arc` snapshot, so a reload never changes the registry
/// under a transform that is already running.
#[derive(Clone)]
pub struct SharedRegistry {
    inner: Arc<RwLock<Arc<SchemaRegistry>>>,
}

impl SharedRegistry {
    pub fn new(registry: SchemaRegistry) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(registry))),
        }
    }

    pub fn snapshot(&self) -> Arc<SchemaRegistry> {
        Arc::clone(&self.inner.read())
    }

    pub fn replace(&self, registry: SchemaRegistry) {
        *self.inner.write() = Arc::new(registry);
    }

    /// Load `path` and swap it in. The current registry stays on error.
    pub fn reload(&self, path: impl AsRef<Path>) -> Result<(), SchemaError> {
        let registry = SchemaRegistry::load(path)?;
        self.replace(registry);
        Ok(())
    }
}

// ── Transformer ──────────────────────────────────────────────────

#[derive(Clone)]
pub struct Transformer {
    registry: SharedRegistry,
}

impl Transformer {
    pub fn new(registry: SharedRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub fn transform(&self, message: &RawMessage) -> Result<Transformed, TransformError> {
        let registry = self.registry.snapshot();
        transform_with(&registry, message)
    }
}

/// Transform `message` against a fixed registry.
pub fn transform_with(
    registry: &SchemaRegistry,
    message: &RawMessage,
) -> Result<Transformed, TransformError> {
    let payload: Value = match serde_json::from_slice(&message.payload) {
        Ok(v) => v,
        Err(e) => {
            return Ok(Transformed::Rejected(ValidationError::InvalidPayload {
                reason: e.to_string(),
            }))
        }
    };

    let items = match payload {
        Value::Array(items) => items,
        other => vec![other],
    };

    let mut objects = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        match item {
            Value::Object(map) => objects.push(map),
            _ => return Ok(Transformed::Rejected(ValidationError::NotAnObject { index })),
        }
    }

    let mut out = Vec::new();
    for item in &objects {
        let message_type = resolve_type(registry, message, item);
        let mapping = message_type
            .as_deref()
            .and_then(|t| registry.resolve(t))
            .ok_or_else(|| TransformError::UnresolvableType {
                topic: message.topic.clone(),
                message_type: message_type.clone(),
            })?;
        map_item(registry, mapping, message, item, &mut out);
    }

    Ok(Transformed::Records(out))
}

/// Header, then payload field, then the registry default.
fn resolve_type(
    registry: &SchemaRegistry,
    message: &RawMessage,
    item: &Map<String, Value>,
) -> Option<String> {
    if let Some(t) = message.header(&registry.type_header) {
        if !t.is_empty() {
            return Some(t.to_string());
        }
    }
    if let Some(Value::String(t)) = item.get(&registry.type_field) {
        if !t.is_empty() {
            return Some(t.clone());
        }
    }
    registry.default_type.clone()
}

fn map_item(
    registry: &SchemaRegistry,
    mapping: &MessageMapping,
    message: &RawMessage,
    item: &Map<String, Value>,
    out: &mut Vec<CandidateRecord>,
) {
    let entity = mapping
        .entity
        .as_ref()
        .map(|m| build_entity(registry, m, message, item));

    let relationships: Vec<CandidateRecord> = mapping
        .relationships
        .iter()
        .filter_map(|rel| build_relationship(rel, item, entity.as_ref()))
        .collect();

    out.extend(entity);
    out.extend(relationships);
}

fn build_entity(
    registry: &SchemaRegistry,
    mapping: &EntityMapping,
    message: &RawMessage,
    item: &Map<String, Value>,
) -> CandidateRecord {
    let mut errors = Vec::new();

    let external_id = match extract_id(item, &mapping.id_fields) {
        Ok(id) => id,
        Err(e) => {
            errors.push(e);
            String::new()
        }
    };

    let mut properties = apply_fields(&mapping.fields, item, &mut errors);

    if mapping.passthrough {
        for (key, value) in item {
            let skip = value.is_null()
                || mapping.fields.contains_key(key)
                || mapping.id_fields.contains(key)
                || *key == registry.type_field
                || METADATA_KEYS.contains(&key.as_str());
            if skip || properties.contains_key(key) {
                continue;
            }
            let value = match value {
                Value::Object(_) | Value::Array(_) => Value::String(value.to_string()),
                other => other.clone(),
            };
            properties.insert(key.clone(), value);
        }
        // Graph properties cannot hold maps, so headers travel as JSON text.
        if !message.headers.is_empty() && !properties.contains_key(HEADERS_PROPERTY) {
            let headers: Map<String, Value> = message
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            properties.insert(
                HEADERS_PROPERTY.to_string(),
                Value::String(Value::Object(headers).to_string()),
            );
        }
    }

    CandidateRecord {
        record: CanonicalRecord::Entity(EntityRecord {
            entity_type: mapping.target_type.clone(),
            external_id,
            properties,
        }),
        errors,
    }
}

/// Returns `None` when an optional relationship has no target.
fn build_relationship(
    mapping: &RelationshipMapping,
    item: &Map<String, Value>,
    entity: Option<&CandidateRecord>,
) -> Option<CandidateRecord> {
    let mut errors = Vec::new();

    let target_external_id = match present(item, &mapping.target_id_field) {
        Some(value) => id_value(&mapping.target_id_field, value).unwrap_or_else(|e| {
            errors.push(e);
            String::new()
        }),
        None if !mapping.required => return None,
        None => {
            errors.push(ValidationError::MissingField {
                field: mapping.target_id_field.clone(),
            });
            String::new()
        }
    };

    let source_external_id = match (&mapping.source_id_field, entity) {
        (Some(field), _) => match present(item, field) {
            Some(value) => id_value(field, value).unwrap_or_else(|e| {
                errors.push(e);
                String::new()
            }),
            None => {
                errors.push(ValidationError::MissingField {
                    field: field.clone(),
                });
                String::new()
            }
        },
        (None, Some(entity)) => {
            // The edge hangs off the entity; it cannot commit if the entity can't.
            errors.extend(entity.errors.iter().cloned());
            entity.record.key()
        }
        (None, None) => String::new(),
    };

    let properties = apply_fields(&mapping.fields, item, &mut errors);

    Some(CandidateRecord {
        record: CanonicalRecord::Relationship(RelationshipRecord {
            relationship_type: mapping.target_type.clone(),
            source_external_id,
            target_external_id,
            properties,
        }),
        errors,
    })
}

// ── Field Handling ───────────────────────────────────────────────

fn present<'a>(item: &'a Map<String, Value>, field: &str) -> Option<&'a Value> {
    item.get(field).filter(|v| !v.is_null())
}

fn extract_id(item: &Map<String, Value>, id_fields: &[String]) -> Result<String, ValidationError> {
    for field in id_fields {
        if let Some(value) = present(item, field) {
            return id_value(field, value);
        }
    }
    Err(ValidationError::MissingField {
        field: id_fields.join("|"),
    })
}

fn id_value(field: &str, value: &Value) -> Result<String, ValidationError> {
    match value {
        Value::String(s) if !s.is_empty() => Ok(s.clone()),
        Value::Number(n) if n.is_i64() || n.is_u64() => Ok(n.to_string()),
        other => Err(ValidationError::InvalidField {
            field: field.to_string(),
            expected: "string or integer id".to_string(),
            found: json_type(other).to_string(),
        }),
    }
}

fn apply_fields(
    rules: &std::collections::BTreeMap<String, FieldRule>,
    item: &Map<String, Value>,
    errors: &mut Vec<ValidationError>,
) -> Properties {
    let mut properties = Properties::new();
    for (field, rule) in rules {
        let value = match present(item, field).or(rule.default.as_ref()) {
            Some(v) => v,
            None => {
                if rule.required {
                    errors.push(ValidationError::MissingField {
                        field: field.clone(),
                    });
                }
                continue;
            }
        };
        match coerce(field, rule.kind, value) {
            Ok(v) => {
                let name = rule.property.clone().unwrap_or_else(|| field.clone());
                properties.insert(name, v);
            }
            Err(e) => errors.push(e),
        }
    }
    properties
}

/// Coerce one payload value to `kind`.
pub fn coerce(field: &str, kind: FieldKind, value: &Value) -> Result<Value, ValidationError> {
    let invalid = || ValidationError::InvalidField {
        field: field.to_string(),
        expected: kind.as_str().to_string(),
        found: json_type(value).to_string(),
    };

    match kind {
        FieldKind::Json => Ok(value.clone()),
        FieldKind::String => Ok(match value {
            Value::String(s) => Value::String(s.clone()),
            other => Value::String(other.to_string()),
        }),
        FieldKind::Integer => match value {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Value::from(i))
                } else {
                    match n.as_f64() {
                        Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                            Ok(Value::from(f as i64))
                        }
                        _ => Err(invalid()),
                    }
                }
            }
            Value::String(s) => s.trim().parse::<i64>().map(Value::from).map_err(|_| invalid()),
            _ => Err(invalid()),
        },
        FieldKind::Float => {
            let f = match value {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            };
            match f.and_then(serde_json::Number::from_f64) {
                Some(n) => Ok(Value::Number(n)),
                None => Err(invalid()),
            }
        }
        FieldKind::Boolean => match value {
            Value::Bool(b) => Ok(Value::Bool(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(0) => Ok(Value::Bool(false)),
                Some(1) => Ok(Value::Bool(true)),
                _ => Err(invalid()),
            },
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Ok(Value::Bool(true)),
                "false" | "no" | "0" => Ok(Value::Bool(false)),
                _ => Err(invalid()),
            },
            _ => Err(invalid()),
        },
        FieldKind::Timestamp => {
            let ts: Option<DateTime<Utc>> = match value {
                Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc)),
                Value::Number(n) => {
                    if let Some(secs) = n.as_i64() {
                        Utc.timestamp_opt(secs, 0).single()
                    } else {
                        n.as_f64().and_then(|f| {
                            let secs = f.floor();
                            let nanos = ((f - secs) * 1e9).round() as u32;
                            Utc.timestamp_opt(secs as i64, nanos.min(999_999_999)).single()
                        })
                    }
                }
                _ => None,
            };
            ts.map(|dt| Value::String(dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)))
                .ok_or_else(invalid)
        }
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
