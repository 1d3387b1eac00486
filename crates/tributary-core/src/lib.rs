//! tributary-core: Shared types, schema registry, and error taxonomy for the Tributary pipeline.
//!
//! This crate provides the foundational types used across all Tributary components:
//! - Raw broker messages and their opaque acknowledgment tokens
//! - Canonical entity/relationship records bound for the knowledge graph
//! - Batches and per-batch ingest results
//! - The schema registry that maps broker message types to graph types
//! - The `KnowledgeSink` trait implemented by graph backends
//! - Layered configuration loading
//! - The pipeline error taxonomy

pub mod config;
pub mod error;
pub mod schema;
pub mod sink;
pub mod types;

pub use error::{ConnectionError, ConnectionErrorKind, SinkError, TransformError, ValidationError};
pub use schema::SchemaRegistry;
pub use sink::{KnowledgeSink, RecordOutcome};
pub use types::{
    AckToken, Batch, BatchId, CanonicalRecord, ConnectionState, EntityRecord, IngestResult,
    Properties, RawMessage, RecordFailure, RelationshipRecord,
};
