//! Read-back queries used to verify ingested data.

use neo4rs::query;
use serde::{Deserialize, Serialize};

use crate::client::{GraphClient, GraphError};
use crate::mutations::ENTITY_LABEL;

/// An ingested entity as stored in the graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRow {
    pub external_id: String,
    pub entity_type: String,
    pub properties: serde_json::Value,
}

impl GraphClient {
    /// Fetch an entity by external id.
    pub async fn get_entity(&self, external_id: &str) -> Result<Option<EntityRow>, GraphError> {
        let cypher = format!(
            "MATCH (n:{ENTITY_LABEL} {{external_id: $external_id}})
             RETURN n.external_id AS external_id,
                    n.entity_type AS entity_type,
                    apoc.convert.toJson(properties(n)) AS props"
        );
        let q = query(&cypher).param("external_id", external_id.to_string());

        let Some(row) = self.query_one(q).await? else {
            return Ok(None);
        };

        let props: String = row
            .get("props")
            .map_err(|e| GraphError::Serialization(e.to_string()))?;
        Ok(Some(EntityRow {
            external_id: row.get("external_id").unwrap_or_default(),
            entity_type: row.get("entity_type").unwrap_or_default(),
            properties: serde_json::from_str(&props)
                .map_err(|e| GraphError::Serialization(e.to_string()))?,
        }))
    }

    /// Count ingested entities, optionally restricted to one type.
    pub async fn count_entities(&self, entity_type: Option<&str>) -> Result<i64, GraphError> {
        let q = match entity_type {
            Some(t) => query(&format!(
                "MATCH (n:{ENTITY_LABEL} {{entity_type: $entity_type}}) RETURN count(n) AS cnt"
            ))
            .param("entity_type", t.to_string()),
            None => query(&format!(
                "MATCH (n:{ENTITY_LABEL}) RETURN count(n) AS cnt"
            )),
        };

        match self.query_one(q).await? {
            Some(row) => Ok(row.get::<i64>("cnt").unwrap_or(0)),
            None => Ok(0),
        }
    }
}
