//! End-to-end pipeline tests: in-memory broker, graph and dead-letter store.
//!
//! Time is paused so batch ages, retry backoff and reconnect delays advance
//! instantly whenever the runtime goes idle.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use tributary_core::{
    CanonicalRecord, EntityRecord, KnowledgeSink, RecordOutcome, RelationshipRecord, SchemaRegistry,
    SinkError,
};
use tributary_deadletter::{
    DeadLetterEntry, DeadLetterId, DeadLetterPayload, DeadLetterQuery, DeadLetterStore,
    FailureKind, MemoryDeadLetterStore, StoreError,
};
use tributary_graph::MemoryGraph;
use tributary_ingest::broker::MemoryBroker;
use tributary_ingest::config::{BatchConfig, RetryConfig};
use tributary_ingest::{
    AckPolicy, BrokerAdapter, BrokerConfig, IngestConfig, IngestError, IngestService,
    ServiceState, SharedRegistry, Transformer,
};

const TOPIC: &str = "udl.sensor";

const SCHEMA: &str = r#"{
    "mappings": {
        "sensor_reading": {
            "entity": {
                "target_type": "SensorReading",
                "fields": {
                    "value": { "kind": "float", "required": true },
                    "unit": { "default": "C" }
                }
            }
        }
    }
}"#;

// ── Harness ──────────────────────────────────────────────────────

fn config(max_size: usize, max_age_ms: u64) -> IngestConfig {
    IngestConfig {
        topic: TOPIC.into(),
        batch: BatchConfig {
            max_size,
            max_age_ms,
            check_interval_ms: 250,
        },
        retry: RetryConfig {
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            submit_timeout_secs: 30,
        },
        ..IngestConfig::default()
    }
}

struct Pipeline {
    broker: MemoryBroker,
    store: Arc<MemoryDeadLetterStore>,
    service: Arc<IngestService>,
}

fn pipeline(broker: &MemoryBroker, config: IngestConfig, sink: Arc<dyn KnowledgeSink>) -> Pipeline {
    let store = Arc::new(MemoryDeadLetterStore::new());
    Pipeline {
        broker: broker.clone(),
        service: service(broker, config, sink, store.clone()),
        store,
    }
}

fn service(
    broker: &MemoryBroker,
    config: IngestConfig,
    sink: Arc<dyn KnowledgeSink>,
    store: Arc<dyn DeadLetterStore>,
) -> Arc<IngestService> {
    let registry = SchemaRegistry::from_json(SCHEMA).unwrap();
    let adapter = Arc::new(BrokerAdapter::new(
        BrokerConfig::default(),
        Arc::new(broker.clone()),
        config.buffer_capacity,
    ));
    Arc::new(IngestService::new(
        config,
        adapter,
        Transformer::new(SharedRegistry::new(registry)),
        sink,
        store,
    ))
}

impl Pipeline {
    fn start(&self) -> tokio::task::JoinHandle<tributary_ingest::Result<()>> {
        let service = Arc::clone(&self.service);
        tokio::spawn(async move { service.run().await })
    }

    /// Run until every published message is acknowledged, then stop.
    async fn run_until_drained(&self) {
        let runner = self.start();
        self.broker.wait_until_drained(TOPIC).await;
        self.service.handle().shutdown();
        runner.await.unwrap().unwrap();
    }

    async fn wait_for(&self, condition: impl Fn(&Self) -> bool) {
        while !condition(self) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

fn reading(id: &str, value: f64) -> Vec<u8> {
    json!({ "type": "sensor_reading", "id": id, "value": value })
        .to_string()
        .into_bytes()
}

/// Fails the first `failures` batch submissions, then writes to `graph`.
struct FlakySink {
    graph: MemoryGraph,
    failures: u32,
    calls: AtomicU32,
}

impl FlakySink {
    fn new(failures: u32) -> Self {
        Self {
            graph: MemoryGraph::new(),
            failures,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl KnowledgeSink for FlakySink {
    async fn create_entity(&self, record: &EntityRecord) -> Result<String, SinkError> {
        if record.external_id.starts_with("bad") {
            return Err(SinkError::Permanent("constraint violated".into()));
        }
        self.graph.create_entity(record).await
    }

    async fn create_relationship(&self, record: &RelationshipRecord) -> Result<String, SinkError> {
        self.graph.create_relationship(record).await
    }

    async fn submit_batch(
        &self,
        records: &[CanonicalRecord],
    ) -> Result<Vec<RecordOutcome>, SinkError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(SinkError::Transient("connection reset".into()));
        }
        let mut outcomes = Vec::with_capacity(records.len());
        for record in records {
            let result = match record {
                CanonicalRecord::Entity(e) => self.create_entity(e).await,
                CanonicalRecord::Relationship(r) => self.create_relationship(r).await,
            };
            outcomes.push(match result {
                Ok(id) => RecordOutcome::Committed { id },
                Err(e) => RecordOutcome::Failed {
                    reason: e.to_string(),
                },
            });
        }
        Ok(outcomes)
    }
}

/// Holds every batch for a while and records peak concurrency.
#[derive(Default)]
struct SlowSink {
    graph: MemoryGraph,
    current: AtomicU64,
    peak: AtomicU64,
}

#[async_trait]
impl KnowledgeSink for SlowSink {
    async fn create_entity(&self, record: &EntityRecord) -> Result<String, SinkError> {
        self.graph.create_entity(record).await
    }

    async fn create_relationship(&self, record: &RelationshipRecord) -> Result<String, SinkError> {
        self.graph.create_relationship(record).await
    }

    async fn submit_batch(
        &self,
        records: &[CanonicalRecord],
    ) -> Result<Vec<RecordOutcome>, SinkError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut outcomes = Vec::with_capacity(records.len());
        for record in records {
            if let CanonicalRecord::Entity(e) = record {
                let id = self.create_entity(e).await?;
                outcomes.push(RecordOutcome::Committed { id });
            }
        }
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(outcomes)
    }
}

/// Panics on any batch holding a record whose id starts with "boom".
#[derive(Default)]
struct PanickySink {
    graph: MemoryGraph,
}

#[async_trait]
impl KnowledgeSink for PanickySink {
    async fn create_entity(&self, record: &EntityRecord) -> Result<String, SinkError> {
        self.graph.create_entity(record).await
    }

    async fn create_relationship(&self, record: &RelationshipRecord) -> Result<String, SinkError> {
        self.graph.create_relationship(record).await
    }

    async fn submit_batch(
        &self,
        records: &[CanonicalRecord],
    ) -> Result<Vec<RecordOutcome>, SinkError> {
        if records.iter().any(|r| r.key().starts_with("boom")) {
            panic!("graph driver returned a malformed response");
        }
        self.graph.submit_batch(records).await
    }
}

/// Every append fails, as on a full disk.
struct FailingStore;

impl DeadLetterStore for FailingStore {
    fn append(&self, _entries: &[DeadLetterEntry]) -> Result<(), StoreError> {
        Err(StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "no space left on device",
        )))
    }

    fn get(&self, id: DeadLetterId) -> Result<DeadLetterEntry, StoreError> {
        Err(StoreError::NotFound(id))
    }

    fn list(&self, _query: &DeadLetterQuery) -> Result<Vec<DeadLetterEntry>, StoreError> {
        Ok(Vec::new())
    }
}

// ── Scenarios ────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn batches_commit_and_invalid_record_is_dead_lettered() {
    let broker = MemoryBroker::new();
    for i in 0..10 {
        let payload = if i == 4 {
            json!({ "type": "sensor_reading", "id": "r-4" }).to_string().into_bytes()
        } else {
            reading(&format!("r-{i}"), i as f64)
        };
        broker.publish(TOPIC, payload);
    }
    let graph = Arc::new(MemoryGraph::new());
    let p = pipeline(&broker, config(5, 1_000), graph.clone());

    p.run_until_drained().await;

    let stats = p.service.status().stats;
    assert_eq!(stats.received, 10);
    assert_eq!(stats.submitted, 2);
    assert_eq!(stats.committed, 9);
    assert_eq!(stats.committed_batches, 2);
    assert_eq!(stats.validation_failed, 1);
    assert_eq!(stats.acknowledged, 10);
    assert_eq!(graph.entity_count(), 9);
    assert!(graph.entity("r-4").is_none());

    let entries = p.store.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].kind, FailureKind::Validation);
    assert_eq!(entries[0].failure_reason, "missing field: value");
    assert_eq!(broker.committed(TOPIC), 10);
    assert_eq!(p.service.status().state, ServiceState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn transient_sink_failures_are_retried() {
    let broker = MemoryBroker::new();
    broker.publish(TOPIC, reading("r-1", 20.5));
    let sink = Arc::new(FlakySink::new(2));
    let p = pipeline(&broker, config(1, 1_000), sink.clone());

    p.run_until_drained().await;

    let stats = p.service.status().stats;
    assert_eq!(stats.retries, 2);
    assert_eq!(stats.committed, 1);
    assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
    assert!(p.store.is_empty());
    assert!(sink.graph.entity("r-1").is_some());
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_dead_letter_once_and_ack() {
    let broker = MemoryBroker::new();
    broker.publish(TOPIC, reading("r-1", 20.5));
    let sink = Arc::new(FlakySink::new(u32::MAX));
    let p = pipeline(&broker, config(1, 1_000), sink.clone());

    p.run_until_drained().await;

    assert_eq!(sink.calls.load(Ordering::SeqCst), 4);
    let entries = p.store.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].kind, FailureKind::RetriesExhausted);
    assert!(entries[0].failure_reason.starts_with("retries exhausted"));
    assert_eq!(p.service.status().stats.committed, 0);
    assert_eq!(broker.committed(TOPIC), 1);
}

#[tokio::test(start_paused = true)]
async fn withhold_policy_leaves_rejected_message_unacked() {
    let broker = MemoryBroker::new();
    broker.publish(TOPIC, reading("bad-1", 1.0));
    let sink = Arc::new(FlakySink::new(0));
    let p = pipeline(
        &broker,
        IngestConfig {
            ack_policy: AckPolicy::Withhold,
            ..config(1, 1_000)
        },
        sink,
    );

    let runner = p.start();
    p.wait_for(|p| p.service.status().stats.dead_lettered == 1).await;
    p.service.handle().shutdown();
    runner.await.unwrap().unwrap();

    let entries = p.store.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].kind, FailureKind::SinkRejected);
    assert_eq!(broker.committed(TOPIC), 0);
}

#[tokio::test(start_paused = true)]
async fn in_flight_batches_never_exceed_cap() {
    let broker = MemoryBroker::new();
    for i in 0..20 {
        broker.publish(TOPIC, reading(&format!("r-{i}"), i as f64));
    }
    let sink = Arc::new(SlowSink::default());
    let p = pipeline(
        &broker,
        IngestConfig {
            max_in_flight: 2,
            ..config(1, 1_000)
        },
        sink.clone(),
    );

    p.run_until_drained().await;

    assert_eq!(sink.peak.load(Ordering::SeqCst), 2);
    assert_eq!(sink.graph.entity_count(), 20);
    let stats = p.service.status().stats;
    assert!(stats.backpressure_pauses > 0);
    assert_eq!(stats.in_flight, 0);
}

#[tokio::test(start_paused = true)]
async fn redelivery_after_restart_creates_no_duplicates() {
    let graph = Arc::new(MemoryGraph::new());
    let payloads: Vec<Vec<u8>> = (0..5).map(|i| reading(&format!("r-{i}"), i as f64)).collect();

    for _ in 0..2 {
        let broker = MemoryBroker::new();
        for payload in &payloads {
            broker.publish(TOPIC, payload.clone());
        }
        pipeline(&broker, config(3, 1_000), graph.clone())
            .run_until_drained()
            .await;
    }

    assert_eq!(graph.entity_count(), 5);
    assert_eq!(graph.write_count(), 10);
}

#[tokio::test(start_paused = true)]
async fn reconnect_redelivers_without_duplicates() {
    let broker = MemoryBroker::new();
    for i in 0..5 {
        broker.publish(TOPIC, reading(&format!("r-{i}"), i as f64));
    }
    let graph = Arc::new(MemoryGraph::new());
    let p = pipeline(&broker, config(10, 1_000), graph.clone());

    let runner = p.start();
    p.wait_for(|p| p.service.status().stats.received >= 5).await;
    broker.disconnect_all();
    broker.wait_until_drained(TOPIC).await;
    p.service.handle().shutdown();
    runner.await.unwrap().unwrap();

    let status = p.service.status();
    assert_eq!(status.connection.reconnects, 1);
    assert_eq!(status.connection.session, 2);
    assert_eq!(graph.entity_count(), 5);
    assert_eq!(broker.committed(TOPIC), 5);
    // Releases for the first session's tokens never reach the broker.
    assert_eq!(status.stats.acknowledged, 5);
}

#[tokio::test(start_paused = true)]
async fn transient_first_connect_is_retried() {
    let broker = MemoryBroker::new();
    for i in 0..3 {
        broker.publish(TOPIC, reading(&format!("r-{i}"), i as f64));
    }
    broker.fail_next_connects(1);
    let graph = Arc::new(MemoryGraph::new());
    let p = pipeline(&broker, config(3, 1_000), graph.clone());

    p.run_until_drained().await;

    let status = p.service.status();
    assert!(status.fatal_error.is_none());
    assert_eq!(status.connection.session, 1);
    assert_eq!(broker.committed(TOPIC), 3);
    assert_eq!(graph.entity_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn withheld_message_stalls_acks_visibly() {
    let broker = MemoryBroker::new();
    broker.publish(TOPIC, reading("bad-0", 0.0));
    for i in 1..=5 {
        broker.publish(TOPIC, reading(&format!("r-{i}"), i as f64));
    }
    let sink = Arc::new(FlakySink::new(0));
    let p = pipeline(
        &broker,
        IngestConfig {
            ack_policy: AckPolicy::Withhold,
            ..config(1, 1_000)
        },
        sink.clone(),
    );

    let runner = p.start();
    p.wait_for(|p| {
        let stats = p.service.status().stats;
        stats.committed == 5 && stats.dead_lettered == 1
    })
    .await;

    // Later messages are in the graph but cannot be acknowledged past the
    // withheld one.
    assert_eq!(sink.graph.entity_count(), 5);
    assert_eq!(broker.committed(TOPIC), 0);
    let status = p.service.status();
    assert_eq!(status.stats.acknowledged, 0);
    assert_eq!(status.acks.pending, 6);
    assert_eq!(status.acks.withheld, 1);
    let blocked_on = status.acks.blocked_on.expect("stall is reported");
    assert!(blocked_on.starts_with("1:"), "{blocked_on}");

    p.service.handle().shutdown();
    runner.await.unwrap().unwrap();
    assert_eq!(broker.committed(TOPIC), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_dead_letter_write_withholds_ack() {
    let broker = MemoryBroker::new();
    broker.publish(
        TOPIC,
        json!({ "type": "sensor_reading", "id": "r-0" }).to_string().into_bytes(),
    );
    broker.publish(TOPIC, reading("r-1", 1.0));
    let graph = Arc::new(MemoryGraph::new());
    let service = service(&broker, config(1, 1_000), graph.clone(), Arc::new(FailingStore));

    let runner = tokio::spawn({
        let service = Arc::clone(&service);
        async move { service.run().await }
    });
    while service.status().stats.committed < 1 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let status = service.status();
    assert_eq!(status.stats.validation_failed, 1);
    assert_eq!(status.stats.dead_lettered, 0);
    assert_eq!(status.acks.withheld, 1);
    assert!(graph.entity("r-1").is_some());

    service.handle().shutdown();
    runner.await.unwrap().unwrap();
    // The undurable message is never acknowledged, so neither is r-1 behind it.
    assert_eq!(broker.committed(TOPIC), 0);
}

#[tokio::test(start_paused = true)]
async fn sink_panic_is_dead_lettered_and_ingestion_continues() {
    let broker = MemoryBroker::new();
    broker.publish(TOPIC, reading("r-0", 0.0));
    broker.publish(TOPIC, reading("boom-1", 1.0));
    broker.publish(TOPIC, reading("r-2", 2.0));
    let sink = Arc::new(PanickySink::default());
    let p = pipeline(&broker, config(1, 1_000), sink.clone());

    p.run_until_drained().await;

    let status = p.service.status();
    assert!(status.fatal_error.is_none());
    assert_eq!(status.stats.committed, 2);
    assert_eq!(status.stats.in_flight, 0);
    assert!(status.in_flight.is_empty());
    assert_eq!(broker.committed(TOPIC), 3);

    let entries = p.store.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].kind, FailureKind::SinkRejected);
    assert!(entries[0].failure_reason.contains("sink panicked"));
    assert!(sink.graph.entity("boom-1").is_none());
    assert_eq!(sink.graph.entity_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn unmapped_message_type_halts_without_ack() {
    let broker = MemoryBroker::new();
    broker.publish(TOPIC, reading("r-1", 1.0));
    broker.publish(
        TOPIC,
        json!({ "type": "mystery", "id": "x" }).to_string().into_bytes(),
    );
    let graph = Arc::new(MemoryGraph::new());
    let p = pipeline(&broker, config(5, 60_000), graph.clone());

    let err = p.service.run().await.unwrap_err();
    assert!(matches!(err, IngestError::Transform(_)));

    let status = p.service.status();
    assert_eq!(status.state, ServiceState::Stopped);
    assert!(status.fatal_error.unwrap().contains("mystery"));
    // The reading ahead of it was flushed on the way down; the unmapped one
    // stays on the broker.
    assert_eq!(broker.committed(TOPIC), 1);
    let entries = p.store.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].kind, FailureKind::Shutdown);
    assert_eq!(graph.entity_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_flushes_partial_batch_to_dead_letters() {
    let broker = MemoryBroker::new();
    for i in 0..3 {
        broker.publish(TOPIC, reading(&format!("r-{i}"), i as f64));
    }
    let graph = Arc::new(MemoryGraph::new());
    let p = pipeline(&broker, config(100, 60_000), graph.clone());

    let runner = p.start();
    p.wait_for(|p| p.service.status().stats.transformed == 3).await;
    p.service.handle().shutdown();
    runner.await.unwrap().unwrap();

    let entries = p.store.entries();
    assert_eq!(entries.len(), 3);
    assert!(entries.iter().all(|e| e.kind == FailureKind::Shutdown));
    let batches: BTreeSet<_> = entries.iter().map(|e| e.batch_id).collect();
    assert_eq!(batches.len(), 1);
    assert!(entries[0].batch_id.is_some());
    assert_eq!(graph.entity_count(), 0);
    assert_eq!(broker.committed(TOPIC), 3);
}

#[tokio::test(start_paused = true)]
async fn every_acked_message_lands_in_graph_or_dead_letters() {
    let broker = MemoryBroker::new();
    let mut expected = Vec::new();
    for i in 0..12 {
        let id = match i % 4 {
            0 => format!("bad-{i}"),
            _ => format!("r-{i}"),
        };
        broker.publish(TOPIC, reading(&id, i as f64));
        expected.push(id);
    }
    broker.publish(TOPIC, b"not json".to_vec());
    broker.publish(
        TOPIC,
        json!({ "type": "sensor_reading", "id": "r-missing" }).to_string().into_bytes(),
    );
    expected.push("r-missing".into());

    let sink = Arc::new(FlakySink::new(1));
    let p = pipeline(&broker, config(4, 1_000), sink.clone());
    p.run_until_drained().await;
    assert_eq!(broker.committed(TOPIC), broker.published(TOPIC));

    let entries = p.store.entries();
    let mut dead: BTreeSet<String> = BTreeSet::new();
    let mut raw = 0;
    for entry in &entries {
        match &entry.payload {
            DeadLetterPayload::Record {
                record: CanonicalRecord::Entity(e),
            } => {
                dead.insert(e.external_id.clone());
            }
            DeadLetterPayload::Raw { .. } => {
                assert_eq!(entry.payload.raw_bytes().unwrap(), b"not json".to_vec());
                raw += 1;
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }
    assert_eq!(raw, 1);

    for id in &expected {
        let in_graph = sink.graph.entity(id).is_some();
        assert!(
            in_graph != dead.contains(id),
            "{id} must be in exactly one of graph or dead letters"
        );
    }
    assert_eq!(dead.len(), 4);
}
