//! `KnowledgeSink` implementation for the Neo4j client.

use async_trait::async_trait;

use tributary_core::{EntityRecord, KnowledgeSink, RelationshipRecord, SinkError};

use crate::client::{GraphClient, GraphError};

impl From<GraphError> for SinkError {
    fn from(e: GraphError) -> Self {
        if e.is_transient() {
            SinkError::Transient(e.to_string())
        } else {
            SinkError::Permanent(e.to_string())
        }
    }
}

#[async_trait]
impl KnowledgeSink for GraphClient {
    async fn create_entity(&self, record: &EntityRecord) -> Result<String, SinkError> {
        Ok(self.upsert_entity(record).await?)
    }

    async fn create_relationship(&self, record: &RelationshipRecord) -> Result<String, SinkError> {
        Ok(self.upsert_relationship(record).await?)
    }
}
