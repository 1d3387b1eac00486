//! Pipeline statistics.
//!
//! One `IngestStats` is created per service and handed to every stage that
//! updates it. Counters are relaxed atomics; readers take a [`StatsSnapshot`]
//! and never touch the data path.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

/// Window for the rolling throughput figure.
const THROUGHPUT_WINDOW_SECS: u64 = 60;

#[derive(Debug)]
pub struct IngestStats {
    /// Raw messages pulled from the broker.
    pub received: AtomicU64,
    /// Records produced by the transformer, valid or not.
    pub transformed: AtomicU64,
    /// Messages or records rejected by validation.
    pub validation_failed: AtomicU64,
    /// Batches handed to the sink (first attempt only).
    pub submitted: AtomicU64,
    pub committed: AtomicU64,
    pub committed_batches: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub retries: AtomicU64,
    pub acknowledged: AtomicU64,
    /// Times consumption paused because `max_in_flight` batches were out.
    pub backpressure_pauses: AtomicU64,
    pub in_flight: AtomicU64,
    throughput: ThroughputMeter,
}

impl IngestStats {
    pub fn new() -> Self {
        Self {
            received: AtomicU64::new(0),
            transformed: AtomicU64::new(0),
            validation_failed: AtomicU64::new(0),
            submitted: AtomicU64::new(0),
            committed: AtomicU64::new(0),
            committed_batches: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            acknowledged: AtomicU64::new(0),
            backpressure_pauses: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            throughput: ThroughputMeter::new(THROUGHPUT_WINDOW_SECS),
        }
    }

    pub fn record_committed(&self, records: u64) {
        self.committed.fetch_add(records, Ordering::Relaxed);
        self.throughput.record(records);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let committed = self.committed.load(Ordering::Relaxed);
        let dead_lettered = self.dead_lettered.load(Ordering::Relaxed);
        let settled = committed + dead_lettered;
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            transformed: self.transformed.load(Ordering::Relaxed),
            validation_failed: self.validation_failed.load(Ordering::Relaxed),
            submitted: self.submitted.load(Ordering::Relaxed),
            committed,
            committed_batches: self.committed_batches.load(Ordering::Relaxed),
            dead_lettered,
            retries: self.retries.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            backpressure_pauses: self.backpressure_pauses.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            success_rate: if settled == 0 {
                1.0
            } else {
                committed as f64 / settled as f64
            },
            throughput_per_sec: self.throughput.rate(),
        }
    }

    /// Zero every counter except `in_flight`, which tracks live batches.
    pub fn reset(&self) {
        for counter in [
            &self.received,
            &self.transformed,
            &self.validation_failed,
            &self.submitted,
            &self.committed,
            &self.committed_batches,
            &self.dead_lettered,
            &self.retries,
            &self.acknowledged,
            &self.backpressure_pauses,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.throughput.clear();
    }
}

impl Default for IngestStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`IngestStats`].
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatsSnapshot {
    pub received: u64,
    pub transformed: u64,
    pub validation_failed: u64,
    pub submitted: u64,
    pub committed: u64,
    pub committed_batches: u64,
    pub dead_lettered: u64,
    pub retries: u64,
    pub acknowledged: u64,
    pub backpressure_pauses: u64,
    pub in_flight: u64,
    /// Committed records over committed plus dead-lettered.
    pub success_rate: f64,
    /// Committed records per second over the last minute.
    pub throughput_per_sec: f64,
}

// ── Throughput ───────────────────────────────────────────────────

/// Per-second buckets over a sliding window.
#[derive(Debug)]
struct ThroughputMeter {
    window_secs: u64,
    origin: Instant,
    buckets: Mutex<VecDeque<(u64, u64)>>,
}

impl ThroughputMeter {
    fn new(window_secs: u64) -> Self {
        Self {
            window_secs,
            origin: Instant::now(),
            buckets: Mutex::new(VecDeque::new()),
        }
    }

    fn now_secs(&self) -> u64 {
        self.origin.elapsed().as_secs()
    }

    fn record(&self, n: u64) {
        let now = self.now_secs();
        let mut buckets = self.buckets.lock();
        let same_second = buckets.back().is_some_and(|(second, _)| *second == now);
        if same_second {
            if let Some((_, count)) = buckets.back_mut() {
                *count += n;
            }
        } else {
            buckets.push_back((now, n));
        }
        Self::evict(&mut buckets, now, self.window_secs);
    }

    fn rate(&self) -> f64 {
        let now = self.now_secs();
        let mut buckets = self.buckets.lock();
        Self::evict(&mut buckets, now, self.window_secs);
        let total: u64 = buckets.iter().map(|(_, count)| count).sum();
        // Early in the run the window is shorter than its nominal length.
        let span = (now + 1).min(self.window_secs);
        total as f64 / span as f64
    }

    fn clear(&self) {
        self.buckets.lock().clear();
    }

    fn evict(buckets: &mut VecDeque<(u64, u64)>, now: u64, window: u64) {
        while let Some(&(second, _)) = buckets.front() {
            if second + window <= now {
                buckets.pop_front();
            } else {
                break;
            }
        }
    }
}
