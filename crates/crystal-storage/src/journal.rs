//! Append-only mutation journal, keyed by plane identifiers.
//!
//! The storage engine consumes the journal through a narrow trait: record a
//! mutation, read back the records between two positions, and (on operator
//! confirmation) reset the position after an inconsistency. Durability of
//! the journal itself is the embedding application's concern.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// One recorded mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalRecord {
    /// Position assigned when the record was appended (1-based).
    pub position: u64,
    /// Plane the mutation applies to.
    pub plane: u32,
    /// Opaque mutation payload, interpreted by the document type.
    pub data: Vec<u8>,
}

/// The journal surface the storage engine depends on.
pub trait Journal: Send + Sync {
    /// Appends a record for `plane` and returns its position.
    fn record(&self, plane: u32, data: Vec<u8>) -> u64;

    /// The position the next append will receive minus one; zero when empty.
    fn current_position(&self) -> u64;

    /// Records for `plane` with positions in `(start, end]`.
    fn entries_between(&self, plane: u32, start: u64, end: u64) -> Vec<JournalRecord>;

    /// Rewinds the journal to `position`, discarding later records.
    fn reset_position(&self, position: u64);
}

/// In-memory journal implementation.
#[derive(Default)]
pub struct MemoryJournal {
    records: Mutex<Vec<JournalRecord>>,
    position: AtomicU64,
}

impl MemoryJournal {
    /// Creates an empty journal.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Journal for MemoryJournal {
    fn record(&self, plane: u32, data: Vec<u8>) -> u64 {
        let position = self.position.fetch_add(1, Ordering::SeqCst) + 1;
        self.records.lock().push(JournalRecord {
            position,
            plane,
            data,
        });
        position
    }

    fn current_position(&self) -> u64 {
        self.position.load(Ordering::SeqCst)
    }

    fn entries_between(&self, plane: u32, start: u64, end: u64) -> Vec<JournalRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.plane == plane && r.position > start && r.position <= end)
            .cloned()
            .collect()
    }

    fn reset_position(&self, position: u64) {
        let mut records = self.records.lock();
        records.retain(|r| r.position <= position);
        self.position.store(position, Ordering::SeqCst);
    }
}
