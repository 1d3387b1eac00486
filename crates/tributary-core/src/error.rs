//! Error taxonomy shared by every pipeline stage.
//!
//! | Kind              | Scope      | Disposition                                   |
//! |-------------------|------------|-----------------------------------------------|
//! | `ConnectionError` | adapter    | fatal unless transient; transient → reconnect |
//! | `ValidationError` | per-record | isolated and dead-lettered                    |
//! | `TransformError`  | config     | fatal; halts ingestion for the topic          |
//! | `SinkError`       | per-batch  | transient → retried; permanent → dead-letter  |

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a broker connection failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionErrorKind {
    /// TLS or protocol negotiation failed.
    Handshake,
    /// The broker refused the supplied credentials.
    Credentials,
    /// Socket-level failure or dropped session.
    Io,
    /// The adapter was shut down.
    Closed,
}

impl fmt::Display for ConnectionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Handshake => "handshake",
            Self::Credentials => "credentials",
            Self::Io => "I/O",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// A failure talking to the message broker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Broker {kind} error: {message}")]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
}

impl ConnectionError {
    pub fn handshake(message: impl Into<String>) -> Self {
        Self {
            kind: ConnectionErrorKind::Handshake,
            message: message.into(),
        }
    }

    pub fn credentials(message: impl Into<String>) -> Self {
        Self {
            kind: ConnectionErrorKind::Credentials,
            message: message.into(),
        }
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self {
            kind: ConnectionErrorKind::Io,
            message: message.into(),
        }
    }

    pub fn closed(message: impl Into<String>) -> Self {
        Self {
            kind: ConnectionErrorKind::Closed,
            message: message.into(),
        }
    }

    /// Only I/O failures are retried automatically; handshake and credential
    /// failures need an operator.
    pub fn is_transient(&self) -> bool {
        self.kind == ConnectionErrorKind::Io
    }
}

/// A data defect in a single record or message. Never fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum ValidationError {
    #[error("missing field: {field}")]
    MissingField { field: String },

    #[error("invalid field: {field} (expected {expected}, found {found})")]
    InvalidField {
        field: String,
        expected: String,
        found: String,
    },

    #[error("invalid payload: {reason}")]
    InvalidPayload { reason: String },

    #[error("payload item {index} is not a JSON object")]
    NotAnObject { index: usize },
}

/// A configuration defect discovered while transforming. Fatal for the topic.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    #[error("No schema mapping for message type {message_type:?} on topic {topic}")]
    UnresolvableType {
        topic: String,
        message_type: Option<String>,
    },
}

/// Errors loading or validating the schema registry.
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Failed to read schema registry {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse schema registry: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid mapping for message type {message_type}: {reason}")]
    Invalid {
        message_type: String,
        reason: String,
    },
}

/// A failed write to the knowledge-graph sink.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("Transient sink error: {0}")]
    Transient(String),

    #[error("Sink rejected write: {0}")]
    Permanent(String),

    #[error("Sink call timed out after {0:?}")]
    Timeout(Duration),
}

impl SinkError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}
