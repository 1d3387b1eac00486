//! Tributary Graph — knowledge-graph sink backed by Neo4j.
//!
//! This crate is the single mutation point for the knowledge graph.
//! Every write is an upsert keyed on `external_id`, so batches can be
//! resubmitted after a retry or a restart without creating duplicates.

pub mod client;
pub mod memory;
pub mod mutations;
pub mod queries;
pub mod sink;

pub use client::{GraphClient, GraphConfig, GraphError};
pub use memory::MemoryGraph;
