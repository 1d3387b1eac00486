//! The knowledge-graph sink contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SinkError;
use crate::types::{CanonicalRecord, EntityRecord, RelationshipRecord};

/// Outcome of writing a single record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecordOutcome {
    Committed { id: String },
    Failed { reason: String },
}

/// A knowledge-graph backend.
///
/// Implementations must upsert on `external_id` so that redelivered records
/// never create duplicates.
#[async_trait]
pub trait KnowledgeSink: Send + Sync {
    /// Upsert an entity, returning the backend's id for it.
    async fn create_entity(&self, record: &EntityRecord) -> Result<String, SinkError>;

    /// Upsert a relationship between two existing entities.
    async fn create_relationship(&self, record: &RelationshipRecord) -> Result<String, SinkError>;

    /// Write records in order and report one outcome per record.
    ///
    /// A transient error aborts the call so the caller can retry the whole
    /// batch; a permanent error only fails the record it belongs to.
    async fn submit_batch(
        &self,
        records: &[CanonicalRecord],
    ) -> Result<Vec<RecordOutcome>, SinkError> {
        let mut outcomes = Vec::with_capacity(records.len());
        for record in records {
            let result = match record {
                CanonicalRecord::Entity(e) => self.create_entity(e).await,
                CanonicalRecord::Relationship(r) => self.create_relationship(r).await,
            };
            match result {
                Ok(id) => outcomes.push(RecordOutcome::Committed { id }),
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => outcomes.push(RecordOutcome::Failed {
                    reason: e.to_string(),
                }),
            }
        }
        Ok(outcomes)
    }
}
