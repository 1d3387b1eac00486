//! Core data model for the ingest pipeline.
//!
//! Messages flow left to right: `RawMessage` (broker) → `CanonicalRecord`
//! (transformer) → `Batch` (service) → `IngestResult` (sink outcome).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Property bag for graph records. Ordered so transforms are deterministic.
pub type Properties = BTreeMap<String, serde_json::Value>;

// ── Broker Position ───────────────────────────────────────────────

/// Opaque broker position of a single delivered message.
///
/// `session` increments on every (re)connection; `tag` is the broker's
/// delivery tag within that session. Downstream stages only carry it back
/// to the adapter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AckToken {
    session: u64,
    tag: u64,
}

impl AckToken {
    pub fn new(session: u64, tag: u64) -> Self {
        Self { session, tag }
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }
}

impl fmt::Display for AckToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.session, self.tag)
    }
}

/// A message as received from the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    /// Broker headers plus standard properties (content type, message id).
    pub headers: BTreeMap<String, String>,
    pub received_at: DateTime<Utc>,
    pub ack_token: AckToken,
}

impl RawMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

// ── Canonical Records ─────────────────────────────────────────────

/// A graph entity, upserted by `external_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityRecord {
    #[serde(rename = "type")]
    pub entity_type: String,
    pub external_id: String,
    pub properties: Properties,
}

/// A typed edge between two entities identified by their external ids.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelationshipRecord {
    #[serde(rename = "type")]
    pub relationship_type: String,
    pub source_external_id: String,
    pub target_external_id: String,
    pub properties: Properties,
}

/// A normalized record ready for knowledge-graph submission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CanonicalRecord {
    Entity(EntityRecord),
    Relationship(RelationshipRecord),
}

impl CanonicalRecord {
    /// The schema type this record resolves to.
    pub fn record_type(&self) -> &str {
        match self {
            Self::Entity(e) => &e.entity_type,
            Self::Relationship(r) => &r.relationship_type,
        }
    }

    /// Stable identity of the record, used in logs and failure reports.
    pub fn key(&self) -> String {
        match self {
            Self::Entity(e) => e.external_id.clone(),
            Self::Relationship(r) => format!(
                "{}-[{}]->{}",
                r.source_external_id, r.relationship_type, r.target_external_id
            ),
        }
    }
}

// ── Batches ───────────────────────────────────────────────────────

/// Unique identifier for a batch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BatchId(pub Uuid);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An ordered group of records submitted to the sink as one unit.
///
/// `origins[i]` is the ack token of the message that produced `records[i]`,
/// so a single message's records may span several batches.
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: BatchId,
    pub opened_at: DateTime<Utc>,
    records: Vec<CanonicalRecord>,
    origins: Vec<AckToken>,
}

impl Batch {
    pub fn new() -> Self {
        Self {
            id: BatchId::new(),
            opened_at: Utc::now(),
            records: Vec::new(),
            origins: Vec::new(),
        }
    }

    pub fn push(&mut self, record: CanonicalRecord, origin: AckToken) {
        self.records.push(record);
        self.origins.push(origin);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[CanonicalRecord] {
        &self.records
    }

    pub fn origins(&self) -> &[AckToken] {
        &self.origins
    }

    /// The set of originating ack tokens.
    pub fn ack_tokens(&self) -> BTreeSet<AckToken> {
        self.origins.iter().copied().collect()
    }

    /// Number of records contributed by each originating message.
    pub fn origin_counts(&self) -> BTreeMap<AckToken, usize> {
        let mut counts = BTreeMap::new();
        for token in &self.origins {
            *counts.entry(*token).or_insert(0) += 1;
        }
        counts
    }
}

impl Default for Batch {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a record inside a batch did not commit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordFailure {
    /// Position of the record within its batch.
    pub index: usize,
    pub key: String,
    pub reason: String,
}

/// Per-batch outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestResult {
    pub batch_id: BatchId,
    pub committed: usize,
    pub failed: Vec<RecordFailure>,
    /// Total submission attempts, including the first.
    pub attempts: u32,
}

impl IngestResult {
    pub fn is_fully_committed(&self) -> bool {
        self.failed.is_empty()
    }
}

// ── Connection State ──────────────────────────────────────────────

/// Broker adapter connection state. `Closed` is terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Subscribed,
    Degraded,
    Closed,
}

impl ConnectionState {
    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Disconnected, Connecting) => true,
            (Connecting, Subscribed) | (Connecting, Disconnected) => true,
            (Subscribed, Degraded) => true,
            (Degraded, Subscribed) | (Degraded, Disconnected) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Subscribed => "subscribed",
            Self::Degraded => "degraded",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}
