//! The append-only journal of local mutations awaiting remote replay
//!
//! Each entry snapshots the full task payload at the time of the write, so a
//! replay does not depend on the current cache row. The journal is never the
//! source of truth for a task; the cache row is.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::Task;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            EntryKind::Create => "create",
            EntryKind::Update => "update",
            EntryKind::Delete => "delete",
        })
    }
}

/// The replay lifecycle of one entry.
///
/// `InFlight` only ever exists in memory while the engine holds the entry; a
/// crash mid-flight leaves the persisted state `Queued`, which is exactly the
/// re-run semantics we want.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Queued,
    InFlight,
    /// Network error, 5xx or timeout; will be retried on the next sync
    TransientFailure,
    /// Authentication or another non-404 4xx; parked until the user clears or
    /// retries the queue
    PermanentFailure,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Monotonic local sequence number; replay is FIFO over this
    pub seq: u64,
    pub kind: EntryKind,
    pub list_id: String,
    /// May be a pending identifier until the create that minted it is replayed
    pub task_id: String,
    /// Full snapshot of the task at the time of the write, not a diff
    pub payload: Task,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub state: EntryState,
}

impl JournalEntry {
    pub fn new(seq: u64, kind: EntryKind, payload: Task) -> Self {
        Self {
            seq,
            kind,
            list_id: payload.list_id().to_string(),
            task_id: payload.id().to_string(),
            created_at: Utc::now(),
            retry_count: 0,
            last_error: None,
            state: EntryState::Queued,
            payload,
        }
    }

    /// Whether the dispatcher should pick this entry up
    pub fn is_replayable(&self) -> bool {
        !matches!(self.state, EntryState::PermanentFailure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_entries_start_queued() {
        let task = Task::new("pending-1", "errands", "buy stamps").unwrap();
        let entry = JournalEntry::new(7, EntryKind::Create, task);
        assert_eq!(entry.seq, 7);
        assert_eq!(entry.task_id, "pending-1");
        assert_eq!(entry.list_id, "errands");
        assert_eq!(entry.state, EntryState::Queued);
        assert!(entry.is_replayable());
    }

    #[test]
    fn permanent_failures_are_not_replayable() {
        let task = Task::new("t", "l", "x").unwrap();
        let mut entry = JournalEntry::new(1, EntryKind::Update, task);
        entry.state = EntryState::PermanentFailure;
        assert!(!entry.is_replayable());
    }
}
