//! BLAKE3 content hashing for tamper evidence.
//!
//! Computes a deterministic hash of all entry fields (excluding the
//! content_hash itself) so that any modification is detectable.

use serde::Serialize;

use crate::DeadLetterEntry;

/// Hashable representation of an entry (excludes content_hash).
#[derive(Serialize)]
struct HashableEntry<'a> {
    id: &'a crate::DeadLetterId,
    topic: &'a str,
    ack_token: &'a Option<tributary_core::AckToken>,
    batch_id: &'a Option<tributary_core::BatchId>,
    kind: &'a crate::FailureKind,
    failure_reason: &'a str,
    attempts: u32,
    payload: &'a crate::DeadLetterPayload,
    timestamp: &'a chrono::DateTime<chrono::Utc>,
}

/// Compute the BLAKE3 hash of an entry's content.
///
/// Serializes all fields except `content_hash` to canonical JSON,
/// then hashes the bytes with BLAKE3. Returns the hex-encoded hash.
pub fn compute_entry_hash(entry: &DeadLetterEntry) -> String {
    let hashable = HashableEntry {
        id: &entry.id,
        topic: &entry.topic,
        ack_token: &entry.ack_token,
        batch_id: &entry.batch_id,
        kind: &entry.kind,
        failure_reason: &entry.failure_reason,
        attempts: entry.attempts,
        payload: &entry.payload,
        timestamp: &entry.timestamp,
    };

    let json = serde_json::to_vec(&hashable).expect("Entry serialization should not fail");
    blake3::hash(&json).to_hex().to_string()
}
