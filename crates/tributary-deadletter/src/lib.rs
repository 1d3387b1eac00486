//! Tributary Dead Letters — durable record of everything that failed to ingest.
//!
//! Each entry keeps the original payload (raw broker bytes or the canonical
//! record), the failure reason, and the broker ack token so operators can
//! inspect and replay. Entries are content-hashed with BLAKE3 for tamper
//! evidence and appended to JSON-lines files that are never rewritten.

pub mod hash;
pub mod store;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tributary_core::{AckToken, BatchId, CanonicalRecord, RawMessage};

pub use store::{
    DeadLetterQuery, DeadLetterStore, FileDeadLetterStore, MemoryDeadLetterStore, StoreError,
};

// ── Core Types ───────────────────────────────────────────────────

/// Unique identifier for a dead-letter entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct DeadLetterId(pub Uuid);

impl DeadLetterId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DeadLetterId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DeadLetterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which stage gave up on the data.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The transformer rejected the message or record.
    Validation,
    /// The sink permanently rejected the record.
    SinkRejected,
    /// Transient sink failures outlasted the retry budget.
    RetriesExhausted,
    /// The service stopped before the record could be committed.
    Shutdown,
}

/// The data that failed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum DeadLetterPayload {
    /// Undecoded broker payload, base64-encoded.
    Raw { data: String },
    /// A transformed record that never committed.
    Record { record: CanonicalRecord },
}

impl DeadLetterPayload {
    pub fn raw(bytes: &[u8]) -> Self {
        Self::Raw {
            data: STANDARD.encode(bytes),
        }
    }

    /// Decode a raw payload back to broker bytes for replay.
    pub fn raw_bytes(&self) -> Option<Vec<u8>> {
        match self {
            Self::Raw { data } => STANDARD.decode(data).ok(),
            Self::Record { .. } => None,
        }
    }
}

/// One append-only dead-letter record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetterEntry {
    pub id: DeadLetterId,
    pub topic: String,
    pub ack_token: Option<AckToken>,
    pub batch_id: Option<BatchId>,
    pub kind: FailureKind,
    pub failure_reason: String,
    /// Sink submission attempts made before giving up (0 for validation).
    pub attempts: u32,
    pub payload: DeadLetterPayload,
    pub timestamp: DateTime<Utc>,
    /// BLAKE3 content hash (hex) over every other field.
    pub content_hash: String,
}

impl DeadLetterEntry {
    /// Build a sealed entry for an undecodable or rejected broker message.
    pub fn for_message(message: &RawMessage, kind: FailureKind, reason: &str) -> Self {
        Self::seal(
            &message.topic,
            Some(message.ack_token),
            None,
            kind,
            reason,
            0,
            DeadLetterPayload::raw(&message.payload),
        )
    }

    /// Build a sealed entry for a canonical record.
    #[allow(clippy::too_many_arguments)]
    pub fn for_record(
        topic: &str,
        record: &CanonicalRecord,
        ack_token: AckToken,
        batch_id: Option<BatchId>,
        kind: FailureKind,
        reason: &str,
        attempts: u32,
    ) -> Self {
        Self::seal(
            topic,
            Some(ack_token),
            batch_id,
            kind,
            reason,
            attempts,
            DeadLetterPayload::Record {
                record: record.clone(),
            },
        )
    }

    fn seal(
        topic: &str,
        ack_token: Option<AckToken>,
        batch_id: Option<BatchId>,
        kind: FailureKind,
        reason: &str,
        attempts: u32,
        payload: DeadLetterPayload,
    ) -> Self {
        let mut entry = Self {
            id: DeadLetterId::new(),
            topic: topic.to_string(),
            ack_token,
            batch_id,
            kind,
            failure_reason: reason.to_string(),
            attempts,
            payload,
            timestamp: Utc::now(),
            content_hash: String::new(),
        };
        entry.content_hash = entry.compute_hash();
        entry
    }

    /// Compute the BLAKE3 hash of the entry's content.
    pub fn compute_hash(&self) -> String {
        hash::compute_entry_hash(self)
    }

    /// Verify that the stored content_hash matches a freshly computed hash.
    pub fn verify_integrity(&self) -> bool {
        self.content_hash == self.compute_hash()
    }
}
