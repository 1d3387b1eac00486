//! Dead-letter storage — trait + append-only file implementation.
//!
//! Entries are stored as JSON lines organized by date and topic:
//! ```text
//! {root}/
//!   2024/
//!     01/
//!       15/
//!         {topic}.jsonl
//! ```
//!
//! Files are only ever opened in append mode; nothing is overwritten.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::{DeadLetterEntry, DeadLetterId, FailureKind};

/// Errors that can occur during dead-letter storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Dead-letter entry not found: {0}")]
    NotFound(DeadLetterId),

    #[error("Integrity check failed for dead-letter entry {0}: stored hash does not match content")]
    IntegrityViolation(DeadLetterId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Query parameters for listing entries.
#[derive(Debug, Default)]
pub struct DeadLetterQuery {
    /// Filter by topic.
    pub topic: Option<String>,
    /// Filter by failure kind.
    pub kind: Option<FailureKind>,
    /// Only include entries written at or after this time.
    pub from: Option<DateTime<Utc>>,
    /// Only include entries written at or before this time.
    pub to: Option<DateTime<Utc>>,
}

/// Trait for dead-letter persistence backends.
pub trait DeadLetterStore: Send + Sync {
    /// Durably append entries. `Ok` means every entry is on stable storage;
    /// on error, entries written before the failure remain.
    fn append(&self, entries: &[DeadLetterEntry]) -> Result<(), StoreError>;

    /// Retrieve an entry by ID, verifying integrity.
    fn get(&self, id: DeadLetterId) -> Result<DeadLetterEntry, StoreError>;

    /// List entries matching the query, ordered by timestamp ascending.
    fn list(&self, query: &DeadLetterQuery) -> Result<Vec<DeadLetterEntry>, StoreError>;
}

// ── File Store ───────────────────────────────────────────────────

/// File-system backed, append-only dead-letter store.
pub struct FileDeadLetterStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileDeadLetterStore {
    /// Create a new store rooted at the given directory.
    /// Creates the directory if it doesn't exist.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    /// Build the file path for an entry based on its timestamp and topic.
    fn entry_path(&self, entry: &DeadLetterEntry) -> PathBuf {
        let date = entry.timestamp.format("%Y/%m/%d");
        self.root
            .join(format!("{}/{}.jsonl", date, sanitize_topic(&entry.topic)))
    }

    /// Ids of every stored entry whose hash no longer matches its content.
    pub fn verify_all(&self) -> Result<Vec<DeadLetterId>, StoreError> {
        let mut entries = Vec::new();
        collect_entries_recursive(&self.root, &DeadLetterQuery::default(), &mut entries)?;
        Ok(entries
            .into_iter()
            .filter(|e| !e.verify_integrity())
            .map(|e| e.id)
            .collect())
    }
}

impl DeadLetterStore for FileDeadLetterStore {
    fn append(&self, entries: &[DeadLetterEntry]) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }

        let _guard = self.write_lock.lock();
        for entry in entries {
            let path = self.entry_path(entry);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }

            let mut line = serde_json::to_vec(entry)?;
            line.push(b'\n');

            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            file.write_all(&line)?;
            file.sync_data()?;

            tracing::debug!(
                entry_id = %entry.id,
                path = %path.display(),
                "Dead-letter entry appended"
            );
        }

        Ok(())
    }

    fn get(&self, id: DeadLetterId) -> Result<DeadLetterEntry, StoreError> {
        let mut entries = Vec::new();
        collect_entries_recursive(&self.root, &DeadLetterQuery::default(), &mut entries)?;

        let entry = entries
            .into_iter()
            .find(|e| e.id == id)
            .ok_or(StoreError::NotFound(id))?;

        if !entry.verify_integrity() {
            return Err(StoreError::IntegrityViolation(id));
        }

        Ok(entry)
    }

    fn list(&self, query: &DeadLetterQuery) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let mut results = Vec::new();
        collect_entries_recursive(&self.root, query, &mut results)?;
        results.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(results)
    }
}

/// Recursively collect entries matching a query.
fn collect_entries_recursive(
    dir: &Path,
    query: &DeadLetterQuery,
    results: &mut Vec<DeadLetterEntry>,
) -> Result<(), StoreError> {
    if !dir.is_dir() {
        return Ok(());
    }

    let entries = fs::read_dir(dir)?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_entries_recursive(&path, query, results)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
            let reader = BufReader::new(fs::File::open(&path)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let dead_letter: DeadLetterEntry = serde_json::from_str(&line)?;
                if matches_query(&dead_letter, query) {
                    results.push(dead_letter);
                }
            }
        }
    }

    Ok(())
}

/// Check whether an entry matches the given query filters.
fn matches_query(entry: &DeadLetterEntry, query: &DeadLetterQuery) -> bool {
    if let Some(topic) = &query.topic {
        if &entry.topic != topic {
            return false;
        }
    }
    if let Some(kind) = &query.kind {
        if &entry.kind != kind {
            return false;
        }
    }
    if let Some(from) = &query.from {
        if &entry.timestamp < from {
            return false;
        }
    }
    if let Some(to) = &query.to {
        if &entry.timestamp > to {
            return false;
        }
    }
    true
}

/// Topics may contain separators that are unsafe in file names.
fn sanitize_topic(topic: &str) -> String {
    topic
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

// ── Memory Store ─────────────────────────────────────────────────

/// In-memory store for tests and dry runs.
#[derive(Default)]
pub struct MemoryDeadLetterStore {
    entries: Mutex<Vec<DeadLetterEntry>>,
}

impl MemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<DeadLetterEntry> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl DeadLetterStore for MemoryDeadLetterStore {
    fn append(&self, entries: &[DeadLetterEntry]) -> Result<(), StoreError> {
        self.entries.lock().extend_from_slice(entries);
        Ok(())
    }

    fn get(&self, id: DeadLetterId) -> Result<DeadLetterEntry, StoreError> {
        self.entries
            .lock()
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    fn list(&self, query: &DeadLetterQuery) -> Result<Vec<DeadLetterEntry>, StoreError> {
        Ok(self
            .entries
            .lock()
            .iter()
            .filter(|e| matches_query(e, query))
            .cloned()
            .collect())
    }
}
