//! tributary-ingest: Streaming ingest from a message broker into the knowledge graph.
//!
//! Three concurrently scheduled stages connected by bounded buffers:
//!
//! ```text
//! [BrokerAdapter pull loop] --bounded channel--> [transform + batch assembly]
//!        ^                                              |
//!        |  ordered acks                     in-flight cap (semaphore)
//!        |                                              v
//!  [ack task] <------- terminal outcomes ------- [sink submission + retry]
//!                                                       |
//!                                               dead-letter store
//! ```
//!
//! Delivery is at-least-once: a message is acknowledged only after every
//! record derived from it has been committed or dead-lettered, and sink
//! writes are upserts keyed on `external_id`.

pub mod ack;
pub mod backoff;
pub mod batch;
pub mod broker;
pub mod config;
pub mod error;
pub mod service;
pub mod stats;
pub mod submit;
pub mod transform;

pub use broker::{BrokerAdapter, MessageStream};
pub use config::{AckPolicy, BrokerConfig, ConfigError, IngestConfig, QueueConfig};
pub use error::{IngestError, Result};
pub use service::{IngestService, ServiceHandle, ServiceState, ServiceStatus};
pub use stats::{IngestStats, StatsSnapshot};
pub use transform::{SharedRegistry, Transformed, Transformer};
