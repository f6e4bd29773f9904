use serde::{Deserialize, Serialize};

use crate::Operation;

/// One replicated slot of a room's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub operation: Operation,
}

/// A room's in-memory operation log.
///
/// Indices are 1-based and contiguous; index 0 is the empty log's
/// sentinel with term 0.
#[derive(Debug, Default)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
}

impl RaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_index(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    /// The term of the entry at `index`, or `None` if the log has no
    /// such entry. Index 0 always exists with term 0.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }

        self.entries.get(index as usize - 1).map(|e| e.term)
    }

    pub fn entry(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }

        self.entries.get(index as usize - 1)
    }

    pub fn append(&mut self, entry: LogEntry) {
        debug_assert_eq!(entry.index, self.last_index() + 1, "log must stay contiguous");
        self.entries.push(entry);
    }

    /// Discards every entry after `index`, keeping `[1..=index]`.
    pub fn truncate_after(&mut self, index: u64) {
        self.entries.truncate(index as usize);
    }

    /// Copies out up to `max` entries starting at `from`.
    pub fn slice_from(&self, from: u64, max: usize) -> Vec<LogEntry> {
        if from == 0 || from > self.last_index() {
            return Vec::new();
        }

        self.entries[from as usize - 1..]
            .iter()
            .take(max)
            .cloned()
            .collect()
    }
}
