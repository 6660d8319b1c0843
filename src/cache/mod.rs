//! The durable local store of the canonical model
//!
//! The cache is the authoritative copy of the user's tasks. It implements the
//! same [`TaskSource`] surface as every remote, with one extra twist: every
//! mutation appends a journal entry in the same commit, so the dispatcher can
//! replay it later without ever losing a write, and locally created tasks get
//! a reserved *pending* identifier until a remote hands out the real one.
//!
//! Storage is a single `data.json` per backend, replaced atomically (write to
//! a temporary file, then rename), which is what makes "mutation + journal
//! append" one transaction. An exclusive file lock serializes writers across
//! processes; coordination never happens through shared memory.

pub mod journal;

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use csscolorparser::Color;
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::error::{CbError, CbResult};
use crate::model::{ListSyncMeta, Task, TaskFilter, TaskList};
use crate::traits::{SourceCapabilities, TaskSource};
use journal::{EntryKind, EntryState, JournalEntry};

const MAIN_FILE: &str = "data.json";
const LOCK_FILE: &str = "cache.lock";

/// The reserved namespace for locally minted identifiers. No remote is allowed
/// to use it; incoming tasks carrying it are rejected during a pull.
pub const PENDING_PREFIX: &str = "pending-";

pub fn is_pending_id(id: &str) -> bool {
    id.starts_with(PENDING_PREFIX)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct ListRecord {
    list: TaskList,
    tasks: HashMap<String, Task>,
    /// Tasks whose local copy diverged from the last-known remote copy
    locally_modified: HashSet<String>,
    meta: ListSyncMeta,
}

impl ListRecord {
    fn new(list: TaskList) -> Self {
        Self {
            list,
            tasks: HashMap::new(),
            locally_modified: HashSet::new(),
            meta: ListSyncMeta::default(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct CachedData {
    lists: HashMap<String, ListRecord>,
    journal: Vec<JournalEntry>,
    next_seq: u64,
    next_pending: u64,
    /// pending identifier to the real one a remote assigned for it; entries
    /// are dropped once no journal entry references the pending side
    pending_map: HashMap<String, String>,
}

/// A folder-backed store of lists, tasks, the change journal and the
/// pending-identifier map
#[derive(Debug)]
pub struct Cache {
    backing_folder: PathBuf,
    // Held for the lifetime of the cache; the OS drops the lock with the handle
    _lock: File,
    data: CachedData,
}

impl Cache {
    /// Open (or initialize) the cache in a folder, taking the writer lock.
    ///
    /// Blocks until any concurrent writer releases the folder, which is how
    /// two dispatcher instances racing on the same configuration stay safe.
    pub fn open(folder: &Path) -> CbResult<Self> {
        std::fs::create_dir_all(folder).map_err(|source| CbError::Storage {
            path: folder.to_path_buf(),
            source,
        })?;

        let lock_path = folder.join(LOCK_FILE);
        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)
            .map_err(|source| CbError::Storage {
                path: lock_path.clone(),
                source,
            })?;
        lock.lock_exclusive().map_err(|source| CbError::Storage {
            path: lock_path,
            source,
        })?;

        let main_file = folder.join(MAIN_FILE);
        let data = match std::fs::File::open(&main_file) {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => CachedData::default(),
            Err(source) => {
                return Err(CbError::Storage {
                    path: main_file,
                    source,
                })
            }
            Ok(file) => serde_json::from_reader(file).map_err(|source| CbError::StoreFormat {
                path: main_file,
                source,
            })?,
        };

        Ok(Self {
            backing_folder: folder.to_path_buf(),
            _lock: lock,
            data,
        })
    }

    pub fn folder(&self) -> &Path {
        &self.backing_folder
    }

    /// Persist the whole store atomically. Called at the end of every mutation,
    /// so a mutation and its journal entry always land together or not at all.
    fn commit(&self) -> CbResult<()> {
        let main_file = self.backing_folder.join(MAIN_FILE);
        let tmp_file = self.backing_folder.join(format!("{}.tmp", MAIN_FILE));

        let bytes = serde_json::to_vec_pretty(&self.data).map_err(|source| CbError::StoreFormat {
            path: main_file.clone(),
            source,
        })?;
        std::fs::write(&tmp_file, bytes).map_err(|source| CbError::Storage {
            path: tmp_file.clone(),
            source,
        })?;
        std::fs::rename(&tmp_file, &main_file).map_err(|source| CbError::Storage {
            path: main_file,
            source,
        })
    }

    fn record(&self, list_id: &str) -> CbResult<&ListRecord> {
        self.data.lists.get(list_id).ok_or_else(|| CbError::NotFound {
            what: "list",
            id: list_id.to_string(),
        })
    }

    fn record_mut(&mut self, list_id: &str) -> CbResult<&mut ListRecord> {
        self.data
            .lists
            .get_mut(list_id)
            .ok_or_else(|| CbError::NotFound {
                what: "list",
                id: list_id.to_string(),
            })
    }

    fn append_journal(&mut self, kind: EntryKind, payload: Task) {
        let seq = self.data.next_seq;
        self.data.next_seq += 1;
        self.data.journal.push(JournalEntry::new(seq, kind, payload));
    }

    /// Mint the next pending identifier. Only called from `add_task`, inside
    /// the same commit as the row it names.
    fn mint_pending_id(&mut self) -> String {
        let n = self.data.next_pending;
        self.data.next_pending += 1;
        format!("{}{}", PENDING_PREFIX, n)
    }

    // ---- journal surface (consumed by the sync engine and the queue commands) ----

    /// All entries, FIFO by sequence number
    pub fn journal_entries(&self) -> Vec<JournalEntry> {
        let mut entries = self.data.journal.clone();
        entries.sort_by_key(|e| e.seq);
        entries
    }

    /// Whether any entry is worth handing to the dispatcher
    pub fn has_replayable_entries(&self) -> bool {
        self.data.journal.iter().any(|e| e.is_replayable())
    }

    /// The current state of one entry. The engine re-reads entries by sequence
    /// number because an earlier replay may have rewritten identifiers.
    pub fn journal_entry(&self, seq: u64) -> Option<JournalEntry> {
        self.data.journal.iter().find(|e| e.seq == seq).cloned()
    }

    /// Whether any journal entry still references this task
    pub fn journal_references(&self, task_id: &str) -> bool {
        self.data.journal.iter().any(|e| e.task_id == task_id)
    }

    /// Whether a create entry for this task is still queued, meaning the task
    /// was created locally and the remote has not acknowledged it yet
    pub fn has_queued_create(&self, task_id: &str) -> bool {
        self.data
            .journal
            .iter()
            .any(|e| e.task_id == task_id && e.kind == EntryKind::Create)
    }

    /// Drop every journal entry referencing a task, regardless of kind.
    /// Used when a conflict resolution or a remote deletion supersedes the
    /// queued local changes.
    pub fn drop_journal_entries_for(&mut self, task_id: &str) -> CbResult<()> {
        self.data.journal.retain(|e| e.task_id != task_id);
        self.gc_pending_map();
        self.commit()
    }

    /// Delete the entry for (task, kind); called on successful replay.
    /// Also drops pending-map entries that nothing references anymore.
    pub fn remove_journal_entry(&mut self, task_id: &str, kind: EntryKind) -> CbResult<()> {
        let position = self
            .data
            .journal
            .iter()
            .position(|e| e.task_id == task_id && e.kind == kind);
        if let Some(idx) = position {
            self.data.journal.remove(idx);
        }
        self.gc_pending_map();
        self.commit()
    }

    fn gc_pending_map(&mut self) {
        let journal = &self.data.journal;
        self.data
            .pending_map
            .retain(|pending, _| journal.iter().any(|e| &e.task_id == pending));
    }

    /// Record a recoverable failure on an entry and keep it queued
    pub fn bump_retry(&mut self, seq: u64, error_text: &str) -> CbResult<()> {
        if let Some(entry) = self.data.journal.iter_mut().find(|e| e.seq == seq) {
            entry.retry_count += 1;
            entry.last_error = Some(error_text.to_string());
            entry.state = EntryState::TransientFailure;
        }
        self.commit()
    }

    /// Park an entry until the user clears or resets the queue
    pub fn mark_permanent_failure(&mut self, seq: u64, error_text: &str) -> CbResult<()> {
        if let Some(entry) = self.data.journal.iter_mut().find(|e| e.seq == seq) {
            entry.last_error = Some(error_text.to_string());
            entry.state = EntryState::PermanentFailure;
        }
        self.commit()
    }

    /// Drop queue entries: all of them, or only the permanently failed ones
    pub fn clear_queue(&mut self, failed_only: bool) -> CbResult<usize> {
        let before = self.data.journal.len();
        if failed_only {
            self.data
                .journal
                .retain(|e| e.state != EntryState::PermanentFailure);
        } else {
            self.data.journal.clear();
        }
        self.gc_pending_map();
        let removed = before - self.data.journal.len();
        self.commit()?;
        Ok(removed)
    }

    /// Put every failed entry back in the queue for another attempt
    pub fn retry_failed(&mut self) -> CbResult<usize> {
        let mut reset = 0;
        for entry in &mut self.data.journal {
            if matches!(
                entry.state,
                EntryState::PermanentFailure | EntryState::TransientFailure
            ) {
                entry.state = EntryState::Queued;
                reset += 1;
            }
        }
        self.commit()?;
        Ok(reset)
    }

    // ---- pending identifier surface ----

    /// The identifier to use on the wire right now: the real one if the
    /// pending identifier has already been acknowledged, otherwise unchanged
    pub fn translate_pending(&self, task_id: &str) -> String {
        self.data
            .pending_map
            .get(task_id)
            .cloned()
            .unwrap_or_else(|| task_id.to_string())
    }

    /// Rewrite a pending identifier to the real one a remote assigned.
    ///
    /// In one commit this updates the task row, every parent reference to it,
    /// every outstanding journal entry (identifier and payload alike) and the
    /// pending map. The create entry itself is *not* removed here; the engine
    /// does that afterwards, so a crash in between leaves a create entry whose
    /// replay the remote will answer with "already exists".
    pub fn rewrite_pending_id(
        &mut self,
        list_id: &str,
        pending_id: &str,
        real_id: &str,
    ) -> CbResult<()> {
        if !is_pending_id(pending_id) {
            return Err(CbError::invalid_input(format!(
                "{:?} is not a pending identifier",
                pending_id
            )));
        }

        let record = self.record_mut(list_id)?;
        if let Some(mut task) = record.tasks.remove(pending_id) {
            task.set_id(real_id);
            record.tasks.insert(real_id.to_string(), task);
        }
        if record.locally_modified.remove(pending_id) {
            record.locally_modified.insert(real_id.to_string());
        }
        // Subtasks may point at the renamed task
        for task in record.tasks.values_mut() {
            if task.parent_id() == Some(pending_id) {
                task.set_parent_id(Some(real_id.to_string()));
            }
        }

        for entry in &mut self.data.journal {
            if entry.task_id == pending_id {
                entry.task_id = real_id.to_string();
            }
            if entry.payload.id() == pending_id {
                entry.payload.set_id(real_id);
            }
            if entry.payload.parent_id() == Some(pending_id) {
                entry.payload.set_parent_id(Some(real_id.to_string()));
            }
        }

        self.data
            .pending_map
            .insert(pending_id.to_string(), real_id.to_string());
        self.commit()
    }

    // ---- divergence tracking ----

    pub fn mark_locally_modified(&mut self, list_id: &str, task_id: &str) -> CbResult<()> {
        self.record_mut(list_id)?
            .locally_modified
            .insert(task_id.to_string());
        self.commit()
    }

    pub fn is_locally_modified(&self, list_id: &str, task_id: &str) -> bool {
        self.data
            .lists
            .get(list_id)
            .map(|r| r.locally_modified.contains(task_id))
            .unwrap_or(false)
    }

    pub fn clear_locally_modified(&mut self, list_id: &str, task_id: &str) -> CbResult<()> {
        self.record_mut(list_id)?.locally_modified.remove(task_id);
        self.commit()
    }

    // ---- per-list sync metadata (the engine is the only writer) ----

    pub fn list_meta(&self, list_id: &str) -> Option<&ListSyncMeta> {
        self.data.lists.get(list_id).map(|r| &r.meta)
    }

    pub fn set_list_meta(&mut self, list_id: &str, meta: ListSyncMeta) -> CbResult<()> {
        self.record_mut(list_id)?.meta = meta;
        self.commit()
    }

    // ---- surface reserved for the sync engine: no journaling ----

    /// Make the local copy of a list match what a remote reported
    pub fn absorb_remote_list(&mut self, list: TaskList) -> CbResult<()> {
        let id = list.id().to_string();
        match self.data.lists.get_mut(&id) {
            Some(record) => record.list = list,
            None => {
                self.data.lists.insert(id, ListRecord::new(list));
            }
        }
        self.commit()
    }

    /// Insert or overwrite a task with the remote's copy. The task stops
    /// counting as locally modified, and identifiers in the reserved pending
    /// namespace are rejected outright.
    pub fn absorb_remote_task(&mut self, list_id: &str, task: Task) -> CbResult<()> {
        if is_pending_id(task.id()) {
            return Err(CbError::invalid_input(format!(
                "remote task uses the reserved pending namespace: {:?}",
                task.id()
            )));
        }
        let record = self.record_mut(list_id)?;
        record.locally_modified.remove(task.id());
        record.tasks.insert(task.id().to_string(), task);
        self.commit()
    }

    /// Remove a task that disappeared from the remote, without journaling
    pub fn absorb_remote_delete(&mut self, list_id: &str, task_id: &str) -> CbResult<()> {
        let record = self.record_mut(list_id)?;
        record.tasks.remove(task_id);
        record.locally_modified.remove(task_id);
        self.commit()
    }

    /// One task, straight from the store
    pub fn get_task(&self, list_id: &str, task_id: &str) -> Option<&Task> {
        self.data.lists.get(list_id).and_then(|r| r.tasks.get(task_id))
    }

    /// Compare user-visible content with another cache. Only used by tests
    /// that check both ends converged after a sync.
    pub fn has_same_observable_content_as(&self, other: &Cache) -> bool {
        if !crate::utils::keys_are_the_same(&self.data.lists, &other.data.lists) {
            return false;
        }
        self.data.lists.iter().all(|(id, record)| {
            let theirs = &other.data.lists[id];
            crate::utils::keys_are_the_same(&record.tasks, &theirs.tasks)
                && record.tasks.iter().all(|(task_id, task)| {
                    theirs.tasks[task_id].has_same_observable_content_as(task)
                })
        })
    }
}

#[async_trait]
impl TaskSource for Cache {
    async fn list_lists(&self) -> CbResult<Vec<TaskList>> {
        Ok(self
            .data
            .lists
            .values()
            .filter(|r| !r.list.is_deleted())
            .map(|r| r.list.clone())
            .collect())
    }

    async fn list_deleted_lists(&self) -> CbResult<Vec<TaskList>> {
        Ok(self
            .data
            .lists
            .values()
            .filter(|r| r.list.is_deleted())
            .map(|r| r.list.clone())
            .collect())
    }

    async fn get_tasks(&self, list_id: &str, filter: &TaskFilter) -> CbResult<Vec<Task>> {
        let record = self.record(list_id)?;
        Ok(record
            .tasks
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect())
    }

    async fn add_task(&mut self, list_id: &str, task: &Task) -> CbResult<String> {
        task.validate()?;
        self.record(list_id)?;

        let pending_id = self.mint_pending_id();
        let mut stored = task.clone();
        stored.set_id(&pending_id);
        stored.set_list_id(list_id);

        let record = self.record_mut(list_id)?;
        record.tasks.insert(pending_id.clone(), stored.clone());

        self.append_journal(EntryKind::Create, stored);
        self.commit()?;
        Ok(pending_id)
    }

    async fn update_task(&mut self, list_id: &str, task: &Task) -> CbResult<()> {
        task.validate()?;
        let record = self.record_mut(list_id)?;
        if !record.tasks.contains_key(task.id()) {
            return Err(CbError::NotFound {
                what: "task",
                id: task.id().to_string(),
            });
        }
        let mut stored = task.clone();
        stored.set_list_id(list_id);
        record.tasks.insert(stored.id().to_string(), stored.clone());
        record.locally_modified.insert(stored.id().to_string());

        self.append_journal(EntryKind::Update, stored);
        self.commit()
    }

    async fn delete_task(&mut self, list_id: &str, task_id: &str) -> CbResult<()> {
        let record = self.record_mut(list_id)?;
        let removed = record.tasks.remove(task_id).ok_or_else(|| CbError::NotFound {
            what: "task",
            id: task_id.to_string(),
        })?;
        record.locally_modified.remove(task_id);

        self.append_journal(EntryKind::Delete, removed);
        self.commit()
    }

    async fn create_list(
        &mut self,
        name: &str,
        description: Option<&str>,
        color: Option<&Color>,
    ) -> CbResult<String> {
        if name.trim().is_empty() {
            return Err(CbError::invalid_input("list name must not be empty"));
        }
        if self.data.lists.values().any(|r| r.list.name() == name) {
            return Err(CbError::Conflict {
                what: "list",
                id: name.to_string(),
            });
        }
        let id = uuid::Uuid::new_v4().to_hyphenated().to_string();
        let list = TaskList::new(&id, name)
            .with_description(description.map(|d| d.to_string()))
            .with_color(color.cloned());
        self.data.lists.insert(id.clone(), ListRecord::new(list));
        self.commit()?;
        Ok(id)
    }

    async fn delete_list(&mut self, list_id: &str) -> CbResult<()> {
        self.record_mut(list_id)?.list.set_deleted(true);
        self.commit()
    }

    async fn rename_list(&mut self, list_id: &str, new_name: &str) -> CbResult<()> {
        if new_name.trim().is_empty() {
            return Err(CbError::invalid_input("list name must not be empty"));
        }
        let clash = self
            .data
            .lists
            .iter()
            .any(|(id, r)| id != list_id && r.list.name() == new_name);
        if clash {
            return Err(CbError::Conflict {
                what: "list",
                id: new_name.to_string(),
            });
        }
        self.record_mut(list_id)?.list.set_name(new_name);
        self.commit()
    }

    async fn restore_list(&mut self, list_id: &str) -> CbResult<()> {
        self.record_mut(list_id)?.list.set_deleted(false);
        self.commit()
    }

    async fn purge_list(&mut self, list_id: &str) -> CbResult<()> {
        self.record(list_id)?;
        self.data.lists.remove(list_id);
        self.commit()
    }

    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities::TRASH | SourceCapabilities::RENAME
    }

    fn display_name(&self) -> String {
        "local cache".to_string()
    }

    fn type_tag(&self) -> &'static str {
        "cache"
    }

    fn context(&self) -> String {
        self.backing_folder.display().to_string()
    }
}
