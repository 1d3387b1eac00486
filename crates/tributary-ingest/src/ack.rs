//! Ordered acknowledgment.
//!
//! Batches finish in any order, but the broker position may only move
//! forward in delivery order. Every message is registered on arrival with
//! the number of records still owed; it becomes releasable once all of them
//! reached a terminal outcome, and is released only when everything
//! delivered before it has been released too.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use tributary_core::AckToken;

use crate::broker::{AckOutcome, BrokerAdapter};
use crate::stats::IngestStats;

/// What to do with a message once its records are settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Release,
    /// Never acknowledge in this session; the broker redelivers it after a
    /// reconnect or restart.
    Withhold,
}

#[derive(Debug)]
struct Entry {
    remaining: usize,
    withheld: bool,
}

/// Snapshot of messages waiting for release.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AckBacklog {
    /// Messages registered but not yet released.
    pub pending: usize,
    /// Pending messages marked withheld.
    pub withheld: usize,
    /// Withheld message at the front of the queue holding back everything
    /// delivered after it until the session changes.
    pub blocked_on: Option<String>,
}

/// Per-message outstanding record counts in delivery order.
#[derive(Debug, Default)]
pub struct AckTracker {
    order: VecDeque<AckToken>,
    entries: HashMap<AckToken, Entry>,
    /// Last head reported as blocking, so the warning fires once per head.
    blocked_on: Option<AckToken>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a newly delivered message owing `records` outcomes.
    pub fn register(&mut self, token: AckToken, records: usize) {
        if self.entries.contains_key(&token) {
            tracing::warn!(token = %token, "Duplicate ack registration ignored");
            return;
        }
        self.order.push_back(token);
        self.entries.insert(
            token,
            Entry {
                remaining: records,
                withheld: false,
            },
        );
    }

    /// Settle `records` of the message's outstanding records.
    pub fn resolve(&mut self, token: AckToken, records: usize, resolution: Resolution) {
        let Some(entry) = self.entries.get_mut(&token) else {
            tracing::warn!(token = %token, "Resolution for unregistered message ignored");
            return;
        };
        entry.remaining = entry.remaining.saturating_sub(records);
        if resolution == Resolution::Withhold {
            entry.withheld = true;
        }
    }

    /// Pop every message at the front that can be acknowledged now.
    ///
    /// A withheld message blocks the queue until the session it belongs to
    /// is gone, at which point the broker has already requeued it.
    pub fn drain_ready(&mut self, current_session: u64) -> Vec<AckToken> {
        let mut ready = Vec::new();
        while let Some(&front) = self.order.front() {
            let Some(entry) = self.entries.get(&front) else {
                self.order.pop_front();
                continue;
            };
            if entry.remaining > 0 {
                break;
            }
            let withheld = entry.withheld;
            if withheld && front.session() >= current_session {
                if self.blocked_on != Some(front) {
                    self.blocked_on = Some(front);
                    tracing::warn!(
                        token = %front,
                        behind = self.order.len() - 1,
                        "Withheld message is holding back acknowledgments until the broker session changes"
                    );
                }
                break;
            }
            self.order.pop_front();
            self.entries.remove(&front);
            if withheld {
                tracing::debug!(token = %front, "Dropping withheld ack from a previous session");
            } else {
                ready.push(front);
            }
        }
        ready
    }

    pub fn backlog(&self) -> AckBacklog {
        let head = self
            .order
            .front()
            .and_then(|token| self.entries.get(token).map(|entry| (token, entry)));
        let blocked_on = match head {
            Some((token, entry)) if entry.withheld && entry.remaining == 0 => Some(token.to_string()),
            _ => None,
        };
        AckBacklog {
            pending: self.order.len(),
            withheld: self.entries.values().filter(|e| e.withheld).count(),
            blocked_on,
        }
    }
}

/// Shares an [`AckTracker`] between the assembly loop and submission tasks
/// and feeds released tokens to a single ack task, which preserves order.
pub struct AckCoordinator {
    tracker: Mutex<AckTracker>,
    sender: Mutex<Option<mpsc::UnboundedSender<AckToken>>>,
    adapter: Arc<BrokerAdapter>,
}

impl AckCoordinator {
    /// Create the coordinator and spawn its ack task.
    pub fn start(adapter: Arc<BrokerAdapter>, stats: Arc<IngestStats>) -> (Arc<Self>, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let coordinator = Arc::new(Self {
            tracker: Mutex::new(AckTracker::new()),
            sender: Mutex::new(Some(tx)),
            adapter: Arc::clone(&adapter),
        });
        let task = tokio::spawn(run_ack_task(adapter, stats, rx));
        (coordinator, task)
    }

    pub fn register(&self, token: AckToken, records: usize) {
        let mut tracker = self.tracker.lock();
        tracker.register(token, records);
        self.flush(&mut tracker);
    }

    pub fn resolve(&self, token: AckToken, records: usize, resolution: Resolution) {
        let mut tracker = self.tracker.lock();
        tracker.resolve(token, records, resolution);
        self.flush(&mut tracker);
    }

    /// Settle a whole batch's worth of records at once.
    pub fn resolve_counts(&self, counts: &BTreeMap<AckToken, usize>, resolution: Resolution) {
        let mut tracker = self.tracker.lock();
        for (token, records) in counts {
            tracker.resolve(*token, *records, resolution);
        }
        self.flush(&mut tracker);
    }

    pub fn backlog(&self) -> AckBacklog {
        self.tracker.lock().backlog()
    }

    /// Stop accepting releases; the ack task exits once it has sent the rest.
    pub fn close(&self) {
        self.sender.lock().take();
    }

    // Sends happen under the tracker lock so channel order is release order.
    fn flush(&self, tracker: &mut AckTracker) {
        let ready = tracker.drain_ready(self.adapter.session());
        if ready.is_empty() {
            return;
        }
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            tracing::warn!(count = ready.len(), "Ack coordinator closed; releases dropped");
            return;
        };
        for token in ready {
            if sender.send(token).is_err() {
                tracing::warn!(token = %token, "Ack task gone; release dropped");
            }
        }
    }
}

async fn run_ack_task(
    adapter: Arc<BrokerAdapter>,
    stats: Arc<IngestStats>,
    mut rx: mpsc::UnboundedReceiver<AckToken>,
) {
    while let Some(token) = rx.recv().await {
        match adapter.acknowledge(token).await {
            Ok(AckOutcome::Acknowledged) => {
                stats.acknowledged.fetch_add(1, Ordering::Relaxed);
            }
            Ok(AckOutcome::Stale) => {}
            Err(e) => {
                tracing::error!(token = %token, error = %e, "Broker acknowledgment failed");
            }
        }
    }
    tracing::debug!("Ack task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(tag: u64) -> AckToken {
        AckToken::new(1, tag)
    }

    #[test]
    fn releases_in_delivery_order() {
        let mut tracker = AckTracker::new();
        tracker.register(t(1), 2);
        tracker.register(t(2), 1);
        tracker.register(t(3), 1);

        tracker.resolve(t(3), 1, Resolution::Release);
        tracker.resolve(t(2), 1, Resolution::Release);
        assert!(tracker.drain_ready(1).is_empty(), "message 1 still owes records");

        tracker.resolve(t(1), 1, Resolution::Release);
        assert!(tracker.drain_ready(1).is_empty());
        tracker.resolve(t(1), 1, Resolution::Release);
        assert_eq!(tracker.drain_ready(1), vec![t(1), t(2), t(3)]);
        assert_eq!(tracker.backlog(), AckBacklog::default());
    }

    #[test]
    fn message_without_records_is_ready_immediately() {
        let mut tracker = AckTracker::new();
        tracker.register(t(1), 0);
        assert_eq!(tracker.drain_ready(1), vec![t(1)]);
    }

    #[test]
    fn withheld_message_blocks_until_session_changes() {
        let mut tracker = AckTracker::new();
        tracker.register(t(1), 1);
        tracker.register(t(2), 1);
        tracker.resolve(t(1), 1, Resolution::Withhold);
        tracker.resolve(t(2), 1, Resolution::Release);
        assert!(tracker.drain_ready(1).is_empty());
        let backlog = tracker.backlog();
        assert_eq!(backlog.pending, 2);
        assert_eq!(backlog.withheld, 1);
        assert_eq!(backlog.blocked_on.as_deref(), Some(t(1).to_string().as_str()));

        // After a reconnect the withheld delivery is requeued by the broker.
        assert_eq!(tracker.drain_ready(2), vec![t(2)]);
        assert_eq!(tracker.backlog(), AckBacklog::default());
    }

    #[test]
    fn unsettled_head_is_not_reported_as_blocked() {
        let mut tracker = AckTracker::new();
        tracker.register(t(1), 2);
        tracker.register(t(2), 1);
        tracker.resolve(t(1), 1, Resolution::Withhold);
        assert!(tracker.drain_ready(1).is_empty());

        let backlog = tracker.backlog();
        assert_eq!(backlog.pending, 2);
        assert_eq!(backlog.withheld, 1);
        assert!(backlog.blocked_on.is_none());
    }

    #[test]
    fn unknown_tokens_are_ignored() {
        let mut tracker = AckTracker::new();
        tracker.resolve(t(9), 1, Resolution::Release);
        assert!(tracker.drain_ready(1).is_empty());
    }
}
