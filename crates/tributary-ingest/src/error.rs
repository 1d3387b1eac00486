//! Error types for the tributary-ingest crate.

use thiserror::Error;

use tributary_core::error::SchemaError;
use tributary_core::{ConnectionError, TransformError};

#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Dead-letter store error: {0}")]
    DeadLetter(#[from] tributary_deadletter::StoreError),

    #[error("Graph error: {0}")]
    Graph(#[from] tributary_graph::GraphError),

    #[error("Acknowledgment {token} would regress the broker position (last acked {last})")]
    AckRegression { token: String, last: String },

    #[error("Invalid service state: cannot {action} while {state}")]
    InvalidState { action: String, state: String },

    #[error("Config error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Task failed: {0}")]
    TaskFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, IngestError>;
