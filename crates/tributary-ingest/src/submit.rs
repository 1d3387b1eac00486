//! Sink submission with retry, dead-lettering and ack resolution.
//!
//! Each closed batch is submitted by its own task holding an in-flight
//! permit, so a batch stuck in retry never blocks the batches behind it.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{watch, OwnedSemaphorePermit};
use tokio::time::Instant;

use tributary_core::{
    AckToken, Batch, BatchId, CanonicalRecord, IngestResult, KnowledgeSink, RecordFailure,
    RecordOutcome, SinkError,
};
use tributary_deadletter::{DeadLetterEntry, DeadLetterStore, FailureKind};

use crate::ack::{AckCoordinator, Resolution};
use crate::backoff::retry_delay;
use crate::broker::wait_for_signal;
use crate::config::{AckPolicy, RetryConfig};
use crate::stats::IngestStats;

// ── In-flight Registry ───────────────────────────────────────────

/// A batch currently owned by a submission task.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct InFlightBatch {
    pub batch_id: BatchId,
    pub records: usize,
    /// Current attempt number, starting at 1.
    pub attempt: u32,
    pub age_ms: u64,
}

struct InFlightEntry {
    records: usize,
    attempt: u32,
    started: Instant,
}

#[derive(Default)]
pub struct InFlightRegistry {
    batches: Mutex<HashMap<BatchId, InFlightEntry>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, id: BatchId, records: usize) {
        self.batches.lock().insert(
            id,
            InFlightEntry {
                records,
                attempt: 0,
                started: Instant::now(),
            },
        );
    }

    fn set_attempt(&self, id: BatchId, attempt: u32) {
        if let Some(entry) = self.batches.lock().get_mut(&id) {
            entry.attempt = attempt;
        }
    }

    fn attempt(&self, id: BatchId) -> u32 {
        self.batches.lock().get(&id).map_or(0, |entry| entry.attempt)
    }

    fn remove(&self, id: BatchId) {
        self.batches.lock().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.batches.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<InFlightBatch> {
        let mut batches: Vec<InFlightBatch> = self
            .batches
            .lock()
            .iter()
            .map(|(id, entry)| InFlightBatch {
                batch_id: *id,
                records: entry.records,
                attempt: entry.attempt,
                age_ms: entry.started.elapsed().as_millis() as u64,
            })
            .collect();
        batches.sort_by(|a, b| b.age_ms.cmp(&a.age_ms));
        batches
    }
}

// ── Dead-letter Helpers ──────────────────────────────────────────

/// Persist entries on the blocking pool; returns whether the write succeeded.
///
/// File stores fsync every append, which must not stall a runtime worker.
pub(crate) async fn persist_dead_letters(
    store: &Arc<dyn DeadLetterStore>,
    stats: &IngestStats,
    entries: Vec<DeadLetterEntry>,
) -> bool {
    if entries.is_empty() {
        return true;
    }
    let count = entries.len();
    let store = Arc::clone(store);
    let written = tokio::task::spawn_blocking(move || {
        let result = store.append(&entries);
        (result, entries)
    })
    .await;

    let entries = match written {
        Ok((Ok(()), entries)) => entries,
        Ok((Err(e), _)) => {
            tracing::error!(
                error = %e,
                count,
                "Dead-letter write failed; withholding acknowledgment"
            );
            return false;
        }
        Err(e) => {
            tracing::error!(
                error = %e,
                count,
                "Dead-letter writer task failed; withholding acknowledgment"
            );
            return false;
        }
    };

    stats.dead_lettered.fetch_add(count as u64, Ordering::Relaxed);
    for entry in &entries {
        tracing::warn!(
            dead_letter_id = %entry.id,
            topic = %entry.topic,
            kind = ?entry.kind,
            reason = %entry.failure_reason,
            "Dead-lettered"
        );
    }
    true
}

/// Ack resolution for sink-side dead letters.
pub(crate) fn dead_letter_resolution(policy: AckPolicy, persisted: bool) -> Resolution {
    match (persisted, policy) {
        (false, _) => Resolution::Withhold,
        (true, AckPolicy::AckAnyway) => Resolution::Release,
        (true, AckPolicy::Withhold) => Resolution::Withhold,
    }
}

// ── Submitter ────────────────────────────────────────────────────

/// How a batch left the retry loop.
enum Terminal {
    Outcomes(Vec<RecordOutcome>),
    /// Transient failures outlasted the retry budget.
    Exhausted(String),
    /// The sink rejected the batch as a whole.
    Rejected(String),
    /// Shutdown interrupted a retry wait.
    Aborted(String),
}

/// Everything a submission task needs, shared by all of them.
pub struct Submitter {
    pub topic: String,
    pub sink: Arc<dyn KnowledgeSink>,
    pub dead_letters: Arc<dyn DeadLetterStore>,
    pub acks: Arc<AckCoordinator>,
    pub stats: Arc<IngestStats>,
    pub in_flight: Arc<InFlightRegistry>,
    pub retry: RetryConfig,
    pub ack_policy: AckPolicy,
    /// Flips to true when draining gives up waiting on retries.
    pub abort: watch::Receiver<bool>,
}

impl Submitter {
    /// Drive one batch to a terminal outcome, then release its permit.
    pub async fn submit(self: Arc<Self>, batch: Batch, permit: OwnedSemaphorePermit) -> IngestResult {
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        self.stats.in_flight.fetch_add(1, Ordering::Relaxed);
        self.in_flight.insert(batch.id, batch.len());

        let attempted = AssertUnwindSafe(self.attempt_until_terminal(&batch))
            .catch_unwind()
            .await;
        let (terminal, attempts) = match attempted {
            Ok(finished) => finished,
            Err(panic) => {
                let reason = format!("sink panicked: {}", panic_message(panic.as_ref()));
                tracing::error!(batch_id = %batch.id, reason = %reason, "Batch submission panicked");
                (Terminal::Rejected(reason), self.in_flight.attempt(batch.id).max(1))
            }
        };
        let result = self.settle(&batch, terminal, attempts).await;

        self.in_flight.remove(batch.id);
        self.stats.in_flight.fetch_sub(1, Ordering::Relaxed);
        drop(permit);

        if result.is_fully_committed() {
            tracing::info!(
                batch_id = %result.batch_id,
                committed = result.committed,
                attempts = result.attempts,
                "Batch committed"
            );
        } else {
            tracing::warn!(
                batch_id = %result.batch_id,
                committed = result.committed,
                failed = result.failed.len(),
                attempts = result.attempts,
                "Batch finished with failures"
            );
        }
        result
    }

    async fn attempt_until_terminal(&self, batch: &Batch) -> (Terminal, u32) {
        let timeout = self.retry.submit_timeout();
        let mut abort = self.abort.clone();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            self.in_flight.set_attempt(batch.id, attempt);

            let result = match tokio::time::timeout(timeout, self.sink.submit_batch(batch.records())).await {
                Ok(result) => result,
                Err(_) => Err(SinkError::Timeout(timeout)),
            };

            let error = match result {
                Ok(outcomes) => return (Terminal::Outcomes(outcomes), attempt),
                Err(e) if !e.is_transient() => return (Terminal::Rejected(e.to_string()), attempt),
                Err(e) => e,
            };

            if attempt > self.retry.max_retries {
                return (Terminal::Exhausted(error.to_string()), attempt);
            }

            self.stats.retries.fetch_add(1, Ordering::Relaxed);
            let delay = retry_delay(attempt, self.retry.initial_backoff_ms, self.retry.max_backoff_ms);
            tracing::warn!(
                batch_id = %batch.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient sink failure, retrying batch"
            );

            let aborted = tokio::select! {
                _ = tokio::time::sleep(delay) => false,
                _ = wait_for_signal(&mut abort) => true,
            };
            if aborted {
                return (Terminal::Aborted(error.to_string()), attempt);
            }
        }
    }

    /// Record outcomes, write dead letters and resolve acks.
    async fn settle(&self, batch: &Batch, terminal: Terminal, attempts: u32) -> IngestResult {
        let records = batch.records();
        let origins = batch.origins();

        let (outcomes, kind, batch_reason) = match terminal {
            Terminal::Outcomes(outcomes) => (outcomes, FailureKind::SinkRejected, None),
            Terminal::Exhausted(reason) => (
                Vec::new(),
                FailureKind::RetriesExhausted,
                Some(format!("retries exhausted: {reason}")),
            ),
            Terminal::Rejected(reason) => (Vec::new(), FailureKind::SinkRejected, Some(reason)),
            Terminal::Aborted(reason) => (
                Vec::new(),
                FailureKind::Shutdown,
                Some(format!("shutdown during retry: {reason}")),
            ),
        };

        let mut committed: BTreeMap<AckToken, usize> = BTreeMap::new();
        let mut failed_counts: BTreeMap<AckToken, usize> = BTreeMap::new();
        let mut failures = Vec::new();
        let mut entries = Vec::new();

        for (index, (record, origin)) in records.iter().zip(origins).enumerate() {
            let reason = match (&batch_reason, outcomes.get(index)) {
                (Some(reason), _) => reason.clone(),
                (None, Some(RecordOutcome::Committed { .. })) => {
                    *committed.entry(*origin).or_insert(0) += 1;
                    continue;
                }
                (None, Some(RecordOutcome::Failed { reason })) => reason.clone(),
                (None, None) => "sink returned no outcome for record".to_string(),
            };
            *failed_counts.entry(*origin).or_insert(0) += 1;
            failures.push(RecordFailure {
                index,
                key: record.key(),
                reason: reason.clone(),
            });
            entries.push(self.entry(record, *origin, batch.id, kind, &reason, attempts));
        }

        let committed_total: usize = committed.values().sum();
        if committed_total > 0 {
            self.stats.record_committed(committed_total as u64);
        }
        if failures.is_empty() {
            self.stats.committed_batches.fetch_add(1, Ordering::Relaxed);
        }

        self.acks.resolve_counts(&committed, Resolution::Release);
        let persisted = persist_dead_letters(&self.dead_letters, &self.stats, entries).await;
        self.acks.resolve_counts(
            &failed_counts,
            dead_letter_resolution(self.ack_policy, persisted),
        );

        IngestResult {
            batch_id: batch.id,
            committed: committed_total,
            failed: failures,
            attempts,
        }
    }

    fn entry(
        &self,
        record: &CanonicalRecord,
        origin: AckToken,
        batch_id: BatchId,
        kind: FailureKind,
        reason: &str,
        attempts: u32,
    ) -> DeadLetterEntry {
        DeadLetterEntry::for_record(
            &self.topic,
            record,
            origin,
            Some(batch_id),
            kind,
            reason,
            attempts,
        )
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;
    use tokio::sync::Semaphore;
    use tributary_core::{EntityRecord, Properties, RelationshipRecord};
    use tributary_deadletter::{DeadLetterId, DeadLetterQuery, MemoryDeadLetterStore, StoreError};

    use crate::broker::{BrokerAdapter, MemoryBroker};
    use crate::config::BrokerConfig;

    /// Fails the first `failures` batch calls with a transient error.
    struct FlakySink {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl KnowledgeSink for FlakySink {
        async fn create_entity(&self, record: &EntityRecord) -> Result<String, SinkError> {
            if record.external_id.starts_with("bad") {
                return Err(SinkError::Permanent("constraint violated".into()));
            }
            Ok(record.external_id.clone())
        }

        async fn create_relationship(&self, _: &RelationshipRecord) -> Result<String, SinkError> {
            Ok("edge".into())
        }

        async fn submit_batch(
            &self,
            records: &[CanonicalRecord],
        ) -> Result<Vec<RecordOutcome>, SinkError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if records.iter().any(|r| r.key().ends_with("boom")) {
                panic!("driver invariant broken");
            }
            if call < self.failures {
                return Err(SinkError::Transient("connection reset".into()));
            }
            let mut outcomes = Vec::new();
            for record in records {
                if let CanonicalRecord::Entity(e) = record {
                    outcomes.push(match self.create_entity(e).await {
                        Ok(id) => RecordOutcome::Committed { id },
                        Err(e) => RecordOutcome::Failed {
                            reason: e.to_string(),
                        },
                    });
                }
            }
            Ok(outcomes)
        }
    }

    struct Fixture {
        submitter: Arc<Submitter>,
        store: Arc<MemoryDeadLetterStore>,
        stats: Arc<IngestStats>,
        sink: Arc<FlakySink>,
        abort: watch::Sender<bool>,
    }

    fn fixture(failures: u32, max_retries: u32) -> Fixture {
        let adapter = Arc::new(BrokerAdapter::new(
            BrokerConfig::default(),
            Arc::new(MemoryBroker::new()),
            8,
        ));
        let stats = Arc::new(IngestStats::new());
        let (acks, _task) = crate::ack::AckCoordinator::start(adapter, Arc::clone(&stats));
        let store = Arc::new(MemoryDeadLetterStore::new());
        let sink = Arc::new(FlakySink {
            failures,
            calls: AtomicU32::new(0),
        });
        let (abort, abort_rx) = watch::channel(false);
        let submitter = Arc::new(Submitter {
            topic: "udl.sensor".into(),
            sink: sink.clone(),
            dead_letters: store.clone(),
            acks,
            stats: Arc::clone(&stats),
            in_flight: Arc::new(InFlightRegistry::new()),
            retry: RetryConfig {
                max_retries,
                initial_backoff_ms: 100,
                max_backoff_ms: 10_000,
                submit_timeout_secs: 5,
            },
            ack_policy: AckPolicy::AckAnyway,
            abort: abort_rx,
        });
        Fixture {
            submitter,
            store,
            stats,
            sink,
            abort,
        }
    }

    fn batch(ids: &[&str]) -> Batch {
        let mut batch = Batch::new();
        for (i, id) in ids.iter().enumerate() {
            batch.push(
                CanonicalRecord::Entity(EntityRecord {
                    entity_type: "SensorReading".into(),
                    external_id: id.to_string(),
                    properties: Properties::new(),
                }),
                AckToken::new(0, i as u64 + 1),
            );
        }
        batch
    }

    fn permit() -> OwnedSemaphorePermit {
        Arc::new(Semaphore::new(1)).try_acquire_owned().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_then_committed() {
        let f = fixture(2, 3);
        let result = f.submitter.clone().submit(batch(&["r-1"]), permit()).await;

        assert!(result.is_fully_committed());
        assert_eq!(result.attempts, 3);
        let snap = f.stats.snapshot();
        assert_eq!(snap.retries, 2);
        assert_eq!(snap.committed, 1);
        assert_eq!(snap.in_flight, 0);
        assert!(f.store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_dead_letter_once() {
        let f = fixture(u32::MAX, 2);
        let result = f.submitter.clone().submit(batch(&["r-1", "r-2"]), permit()).await;

        assert_eq!(f.sink.calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.attempts, 3);
        assert_eq!(result.failed.len(), 2);
        let entries = f.store.entries();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.kind == FailureKind::RetriesExhausted));
        assert!(entries.iter().all(|e| e.attempts == 3));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_record_failure_only_affects_that_record() {
        let f = fixture(0, 3);
        let result = f
            .submitter
            .clone()
            .submit(batch(&["r-1", "bad-2", "r-3"]), permit())
            .await;

        assert_eq!(result.committed, 2);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].index, 1);
        let entries = f.store.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, FailureKind::SinkRejected);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_interrupts_retry_wait() {
        let f = fixture(u32::MAX, 10);
        let task = tokio::spawn(f.submitter.clone().submit(batch(&["r-1"]), permit()));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        f.abort.send_replace(true);

        let result = task.await.unwrap();
        assert_eq!(result.attempts, 1);
        let entries = f.store.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, FailureKind::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn sink_panic_dead_letters_the_batch() {
        let f = fixture(0, 3);
        let result = f
            .submitter
            .clone()
            .submit(batch(&["r-1", "boom"]), permit())
            .await;

        assert_eq!(result.committed, 0);
        assert_eq!(result.failed.len(), 2);
        assert_eq!(result.attempts, 1);
        let entries = f.store.entries();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.kind == FailureKind::SinkRejected));
        assert!(entries[0].failure_reason.contains("driver invariant broken"));
        assert!(f.submitter.in_flight.is_empty());
        assert_eq!(f.stats.snapshot().in_flight, 0);
    }

    /// Blocks every append until the test lets it through.
    struct GatedStore {
        inner: MemoryDeadLetterStore,
        gate: Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl DeadLetterStore for GatedStore {
        fn append(&self, entries: &[DeadLetterEntry]) -> Result<(), StoreError> {
            let _ = self.gate.lock().recv();
            self.inner.append(entries)
        }

        fn get(&self, id: DeadLetterId) -> Result<DeadLetterEntry, StoreError> {
            self.inner.get(id)
        }

        fn list(&self, query: &DeadLetterQuery) -> Result<Vec<DeadLetterEntry>, StoreError> {
            self.inner.list(query)
        }
    }

    #[tokio::test]
    async fn slow_dead_letter_write_leaves_runtime_responsive() {
        let (release, gate) = std::sync::mpsc::channel();
        let store: Arc<dyn DeadLetterStore> = Arc::new(GatedStore {
            inner: MemoryDeadLetterStore::new(),
            gate: Mutex::new(gate),
        });
        let source = batch(&["r-1"]);
        let entry = DeadLetterEntry::for_record(
            "udl.sensor",
            &source.records()[0],
            AckToken::new(1, 1),
            None,
            FailureKind::SinkRejected,
            "constraint violated",
            1,
        );

        let write = tokio::spawn({
            let store = Arc::clone(&store);
            async move {
                let stats = IngestStats::new();
                let persisted = persist_dead_letters(&store, &stats, vec![entry]).await;
                (persisted, stats.snapshot().dead_lettered)
            }
        });

        // The single-threaded test runtime keeps scheduling timers while the
        // append is parked.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!write.is_finished());

        release.send(()).unwrap();
        assert_eq!(write.await.unwrap(), (true, 1));
        assert_eq!(store.list(&DeadLetterQuery::default()).unwrap().len(), 1);
    }

    #[test]
    fn failed_dead_letter_write_is_never_released() {
        assert_eq!(
            dead_letter_resolution(AckPolicy::AckAnyway, false),
            Resolution::Withhold
        );
        assert_eq!(
            dead_letter_resolution(AckPolicy::AckAnyway, true),
            Resolution::Release
        );
        assert_eq!(
            dead_letter_resolution(AckPolicy::Withhold, true),
            Resolution::Withhold
        );
    }

    #[test]
    fn registry_reports_attempts() {
        let registry = InFlightRegistry::new();
        let id = BatchId::new();
        registry.insert(id, 5);
        registry.set_attempt(id, 2);
        let snap = registry.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].records, 5);
        assert_eq!(snap[0].attempt, 2);
        registry.remove(id);
        assert!(registry.is_empty());
    }
}
