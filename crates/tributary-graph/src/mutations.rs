//! Write operations for the knowledge graph.
//!
//! All mutations use MERGE (upsert) semantics keyed on `external_id`.
//! Every entity carries the shared `Entity` label plus its schema type, so
//! relationships can find their endpoints without knowing the endpoint types.

use neo4rs::query;

use tributary_core::schema::is_graph_identifier;
use tributary_core::{EntityRecord, Properties, RelationshipRecord};

use crate::client::{GraphClient, GraphError};

/// Shared label carried by every ingested node.
pub const ENTITY_LABEL: &str = "Entity";

impl GraphClient {
    /// Create the uniqueness constraint that backs idempotent upserts.
    pub async fn ensure_schema(&self) -> Result<(), GraphError> {
        let cypher = format!(
            "CREATE CONSTRAINT entity_external_id IF NOT EXISTS
             FOR (n:{ENTITY_LABEL}) REQUIRE n.external_id IS UNIQUE"
        );
        self.run(query(&cypher)).await?;
        tracing::info!("Knowledge graph schema ensured");
        Ok(())
    }

    /// Upsert an entity node, returning its element id.
    pub async fn upsert_entity(&self, record: &EntityRecord) -> Result<String, GraphError> {
        let label = checked_identifier(&record.entity_type)?;
        let cypher = format!(
            "MERGE (n:{ENTITY_LABEL} {{external_id: $external_id}})
             ON CREATE SET n.first_seen = timestamp()
             SET n:{label}
             SET n += apoc.convert.fromJsonMap($props)
             SET n.entity_type = $entity_type, n.last_seen = timestamp()
             RETURN elementId(n) AS id"
        );

        let q = query(&cypher)
            .param("external_id", record.external_id.clone())
            .param("entity_type", record.entity_type.clone())
            .param("props", props_json(&record.properties)?);

        match self.query_one(q).await? {
            Some(row) => row
                .get::<String>("id")
                .map_err(|e| GraphError::Serialization(e.to_string())),
            None => Err(GraphError::Serialization(format!(
                "MERGE returned no row for entity {}",
                record.external_id
            ))),
        }
    }

    /// Upsert a relationship between two existing entities.
    ///
    /// Fails with `EndpointNotFound` if either endpoint has not been ingested.
    pub async fn upsert_relationship(
        &self,
        record: &RelationshipRecord,
    ) -> Result<String, GraphError> {
        let rel_type = checked_identifier(&record.relationship_type)?;
        let cypher = format!(
            "MATCH (a:{ENTITY_LABEL} {{external_id: $source_id}})
             MATCH (b:{ENTITY_LABEL} {{external_id: $target_id}})
             MERGE (a)-[r:{rel_type}]->(b)
             ON CREATE SET r.first_seen = timestamp()
             SET r += apoc.convert.fromJsonMap($props)
             SET r.last_seen = timestamp()
             RETURN elementId(r) AS id"
        );

        let q = query(&cypher)
            .param("source_id", record.source_external_id.clone())
            .param("target_id", record.target_external_id.clone())
            .param("props", props_json(&record.properties)?);

        match self.query_one(q).await? {
            Some(row) => row
                .get::<String>("id")
                .map_err(|e| GraphError::Serialization(e.to_string())),
            None => Err(GraphError::EndpointNotFound(format!(
                "{} -> {}",
                record.source_external_id, record.target_external_id
            ))),
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────

fn checked_identifier(s: &str) -> Result<&str, GraphError> {
    if is_graph_identifier(s) {
        Ok(s)
    } else {
        Err(GraphError::InvalidIdentifier(s.to_string()))
    }
}

/// Serialize properties for `apoc.convert.fromJsonMap`.
///
/// Neo4j properties cannot hold maps, so nested objects are stored as JSON text.
fn props_json(props: &Properties) -> Result<String, GraphError> {
    let flat: serde_json::Map<String, serde_json::Value> = props
        .iter()
        .map(|(k, v)| {
            let v = match v {
                serde_json::Value::Object(_) => serde_json::Value::String(v.to_string()),
                other => other.clone(),
            };
            (k.clone(), v)
        })
        .collect();
    serde_json::to_string(&flat).map_err(|e| GraphError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_objects_are_flattened_to_text() {
        let mut props = Properties::new();
        props.insert("value".into(), json!(21.5));
        props.insert("location".into(), json!({"lat": 1.0, "lon": 2.0}));
        let encoded: serde_json::Value =
            serde_json::from_str(&props_json(&props).unwrap()).unwrap();
        assert_eq!(encoded["value"], json!(21.5));
        assert!(encoded["location"].is_string());
    }

    #[test]
    fn identifiers_are_checked_before_interpolation() {
        assert!(checked_identifier("SensorReading").is_ok());
        assert!(matches!(
            checked_identifier("x}) DETACH DELETE n"),
            Err(GraphError::InvalidIdentifier(_))
        ));
    }
}
