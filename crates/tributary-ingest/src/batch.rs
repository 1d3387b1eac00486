//! Batch assembly with size and age thresholds.

use std::time::Duration;

use tokio::time::Instant;

use tributary_core::{AckToken, Batch, CanonicalRecord};

/// Accumulates records into the open batch.
///
/// A batch is opened by its first record and closes when it reaches
/// `max_size` records or its first record is `max_age` old, whichever comes
/// first. Closed batches never exceed `max_size`.
pub struct BatchAssembler {
    max_size: usize,
    max_age: Duration,
    open: Option<(Batch, Instant)>,
}

impl BatchAssembler {
    pub fn new(max_size: usize, max_age: Duration) -> Self {
        Self {
            max_size: max_size.max(1),
            max_age,
            open: None,
        }
    }

    /// Add a record; returns the batch if this record filled it.
    pub fn push(&mut self, record: CanonicalRecord, origin: AckToken) -> Option<Batch> {
        let (batch, _) = self
            .open
            .get_or_insert_with(|| (Batch::new(), Instant::now()));
        batch.push(record, origin);
        if batch.len() >= self.max_size {
            return self.take();
        }
        None
    }

    /// Whether the open batch has reached its age limit.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.open
            .as_ref()
            .is_some_and(|(_, opened)| now.saturating_duration_since(*opened) >= self.max_age)
    }

    /// Close the open batch if it has reached its age limit.
    pub fn take_expired(&mut self, now: Instant) -> Option<Batch> {
        if self.is_expired(now) {
            self.take()
        } else {
            None
        }
    }

    /// Close the open batch regardless of thresholds.
    pub fn take(&mut self) -> Option<Batch> {
        self.open.take().map(|(batch, _)| batch)
    }

    pub fn len(&self) -> usize {
        self.open.as_ref().map_or(0, |(batch, _)| batch.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
