//! In-memory broker: a durable per-topic log with a committed position.
//!
//! Used by the pipeline tests and by `--replay`. A new session always starts
//! delivering from the committed position, so anything delivered but not
//! acknowledged in an earlier session is delivered again.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use tributary_core::ConnectionError;

use super::{BrokerConnection, BrokerTransport, Delivery, DeliveryStream};
use crate::config::BrokerConfig;

#[derive(Default)]
struct TopicLog {
    messages: Vec<(Vec<u8>, BTreeMap<String, String>)>,
    /// Number of messages, from the start, that have been acknowledged.
    committed: usize,
}

struct Inner {
    topics: Mutex<BTreeMap<String, TopicLog>>,
    /// Bumped on every publish, ack and injected disconnect.
    changes: watch::Sender<u64>,
    /// Connections opened before this generation are severed.
    generation: AtomicU64,
    refuse_credentials: AtomicBool,
    failing_connects: AtomicU32,
    connects: AtomicU64,
}

impl Inner {
    fn bump(&self) {
        self.changes.send_modify(|v| *v = v.wrapping_add(1));
    }
}

/// Cloneable handle to a shared in-memory broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                topics: Mutex::new(BTreeMap::new()),
                changes,
                generation: AtomicU64::new(0),
                refuse_credentials: AtomicBool::new(false),
                failing_connects: AtomicU32::new(0),
                connects: AtomicU64::new(0),
            }),
        }
    }

    pub fn publish(&self, topic: &str, payload: Vec<u8>) {
        self.publish_with_headers(topic, payload, BTreeMap::new());
    }

    pub fn publish_with_headers(
        &self,
        topic: &str,
        payload: Vec<u8>,
        headers: BTreeMap<String, String>,
    ) {
        self.inner
            .topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .messages
            .push((payload, headers));
        self.inner.bump();
    }

    /// Messages acknowledged so far on `topic`.
    pub fn committed(&self, topic: &str) -> usize {
        self.inner
            .topics
            .lock()
            .get(topic)
            .map_or(0, |log| log.committed)
    }

    /// Messages published to `topic` so far.
    pub fn published(&self, topic: &str) -> usize {
        self.inner
            .topics
            .lock()
            .get(topic)
            .map_or(0, |log| log.messages.len())
    }

    /// Resolve once every published message on `topic` is acknowledged.
    pub async fn wait_until_drained(&self, topic: &str) {
        let mut changes = self.inner.changes.subscribe();
        loop {
            changes.borrow_and_update();
            if self.committed(topic) >= self.published(topic) {
                return;
            }
            if changes.changed().await.is_err() {
                return;
            }
        }
    }

    /// Drop every open session, as if the broker restarted.
    pub fn disconnect_all(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.bump();
    }

    /// Refuse new connections with `ACCESS_REFUSED`.
    pub fn refuse_credentials(&self, refuse: bool) {
        self.inner.refuse_credentials.store(refuse, Ordering::SeqCst);
    }

    /// Fail the next `n` connection attempts with a transient I/O error.
    pub fn fail_next_connects(&self, n: u32) {
        self.inner.failing_connects.store(n, Ordering::SeqCst);
    }

    /// Total successful connections.
    pub fn connect_count(&self) -> u64 {
        self.inner.connects.load(Ordering::SeqCst)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerTransport for MemoryBroker {
    async fn connect(
        &self,
        _config: &BrokerConfig,
    ) -> Result<Arc<dyn BrokerConnection>, ConnectionError> {
        if self.inner.refuse_credentials.load(Ordering::SeqCst) {
            return Err(ConnectionError::credentials(
                "ACCESS_REFUSED - login refused by memory broker",
            ));
        }
        let failing = self
            .inner
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(ConnectionError::io("connection refused"));
        }

        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryConnection {
            inner: Arc::clone(&self.inner),
            generation: self.inner.generation.load(Ordering::SeqCst),
            closed: AtomicBool::new(false),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }))
    }
}

/// One session. Delivery tags start at 1 and map back to log offsets.
struct MemoryConnection {
    inner: Arc<Inner>,
    generation: u64,
    closed: AtomicBool,
    in_flight: Arc<Mutex<HashMap<u64, (String, usize)>>>,
}

impl MemoryConnection {
    fn severed(inner: &Inner, generation: u64) -> bool {
        inner.generation.load(Ordering::SeqCst) != generation
    }
}

struct Cursor {
    inner: Arc<Inner>,
    generation: u64,
    topic: String,
    offset: usize,
    next_tag: u64,
    in_flight: Arc<Mutex<HashMap<u64, (String, usize)>>>,
    changes: watch::Receiver<u64>,
}

impl Cursor {
    fn next_delivery(&mut self) -> Option<Delivery> {
        let topics = self.inner.topics.lock();
        let (payload, headers) = topics.get(&self.topic)?.messages.get(self.offset)?.clone();
        drop(topics);

        let tag = self.next_tag;
        self.in_flight
            .lock()
            .insert(tag, (self.topic.clone(), self.offset));
        self.offset += 1;
        self.next_tag += 1;
        Some(Delivery {
            tag,
            payload,
            headers,
        })
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn consume(&self, topic: &str) -> Result<DeliveryStream, ConnectionError> {
        if self.closed.load(Ordering::SeqCst) || Self::severed(&self.inner, self.generation) {
            return Err(ConnectionError::io("session is no longer open"));
        }
        let offset = self
            .inner
            .topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .committed;

        let cursor = Cursor {
            inner: Arc::clone(&self.inner),
            generation: self.generation,
            topic: topic.to_string(),
            offset,
            next_tag: 1,
            in_flight: Arc::clone(&self.in_flight),
            changes: self.inner.changes.subscribe(),
        };

        let stream = futures::stream::unfold(Some(cursor), |cursor| async move {
            let Some(mut cursor) = cursor else {
                return None;
            };
            loop {
                cursor.changes.borrow_and_update();
                if MemoryConnection::severed(&cursor.inner, cursor.generation) {
                    let err = ConnectionError::io("memory broker dropped the session");
                    return Some((Err(err), None));
                }
                if let Some(delivery) = cursor.next_delivery() {
                    return Some((Ok(delivery), Some(cursor)));
                }
                if cursor.changes.changed().await.is_err() {
                    return None;
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn ack(&self, tag: u64) -> Result<(), ConnectionError> {
        if self.closed.load(Ordering::SeqCst) || Self::severed(&self.inner, self.generation) {
            return Err(ConnectionError::io("session is no longer open"));
        }
        let (topic, offset) = self
            .in_flight
            .lock()
            .remove(&tag)
            .ok_or_else(|| ConnectionError::io(format!("unknown delivery tag {tag}")))?;

        {
            let mut topics = self.inner.topics.lock();
            let log = topics.entry(topic).or_default();
            log.committed = log.committed.max(offset + 1);
        }
        self.inner.bump();
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
