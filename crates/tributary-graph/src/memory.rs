//! In-memory knowledge graph with the same upsert semantics as Neo4j.
//!
//! Used by replay runs (`--dry-run`) and by pipeline tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use tributary_core::{EntityRecord, KnowledgeSink, Properties, RelationshipRecord, SinkError};

#[derive(Debug, Default)]
struct Inner {
    entities: BTreeMap<String, EntityRecord>,
    relationships: BTreeMap<(String, String, String), Properties>,
    writes: u64,
}

/// Idempotent in-memory graph keyed on `external_id`.
#[derive(Debug, Default)]
pub struct MemoryGraph {
    inner: Mutex<Inner>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity(&self, external_id: &str) -> Option<EntityRecord> {
        self.inner.lock().entities.get(external_id).cloned()
    }

    pub fn entity_count(&self) -> usize {
        self.inner.lock().entities.len()
    }

    pub fn relationship_count(&self) -> usize {
        self.inner.lock().relationships.len()
    }

    /// Total upsert calls, including ones that hit an existing record.
    pub fn write_count(&self) -> u64 {
        self.inner.lock().writes
    }
}

#[async_trait]
impl KnowledgeSink for MemoryGraph {
    async fn create_entity(&self, record: &EntityRecord) -> Result<String, SinkError> {
        let mut inner = self.inner.lock();
        inner.writes += 1;
        inner
            .entities
            .entry(record.external_id.clone())
            .and_modify(|existing| {
                existing.entity_type = record.entity_type.clone();
                existing
                    .properties
                    .extend(record.properties.iter().map(|(k, v)| (k.clone(), v.clone())));
            })
            .or_insert_with(|| record.clone());
        Ok(record.external_id.clone())
    }

    async fn create_relationship(&self, record: &RelationshipRecord) -> Result<String, SinkError> {
        let mut inner = self.inner.lock();
        inner.writes += 1;
        for endpoint in [&record.source_external_id, &record.target_external_id] {
            if !inner.entities.contains_key(endpoint) {
                return Err(SinkError::Permanent(format!(
                    "Relationship endpoint not found: {endpoint}"
                )));
            }
        }
        let key = (
            record.relationship_type.clone(),
            record.source_external_id.clone(),
            record.target_external_id.clone(),
        );
        let id = format!("{}-[{}]->{}", key.1, key.0, key.2);
        inner
            .relationships
            .entry(key)
            .or_default()
            .extend(record.properties.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(id)
    }
}
