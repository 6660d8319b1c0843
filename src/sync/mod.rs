//! Reconciliation between the cache and one remote
//!
//! The engine holds handles to exactly two sources and only ever mutates the
//! cache; remote writes go through the journal replay. Push drains the
//! journal FIFO, pull absorbs remote state list by list (short-circuiting on
//! unchanged revision tags), and a full sync is push followed by a forced
//! pull.

pub mod conflict;

use std::collections::HashSet;

use chrono::Utc;

pub use conflict::{ConflictStrategy, Resolution, KEEP_BOTH_SUFFIX};

use crate::cache::journal::{EntryKind, JournalEntry};
use crate::cache::{is_pending_id, Cache};
use crate::error::{CbResult, ErrorKind};
use crate::model::{ListSyncMeta, Task, TaskFilter, TaskList};
use crate::traits::TaskSource;

/// What one engine invocation should do
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncMode {
    /// Drain the journal onto the remote, nothing else
    Push,
    /// Absorb remote state; `forced` ignores revision tags
    Pull { forced: bool },
    /// Push, then pull ignoring revision tags
    Full,
}

/// Counters for one engine invocation, for log lines and `sync status`
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SyncReport {
    pub pushed: usize,
    pub push_failures: usize,
    pub lists_pulled: usize,
    pub lists_skipped: usize,
    pub tasks_absorbed: usize,
    pub tasks_deleted_locally: usize,
    pub conflicts: usize,
}

impl SyncReport {
    fn merge(&mut self, other: SyncReport) {
        self.pushed += other.pushed;
        self.push_failures += other.push_failures;
        self.lists_pulled += other.lists_pulled;
        self.lists_skipped += other.lists_skipped;
        self.tasks_absorbed += other.tasks_absorbed;
        self.tasks_deleted_locally += other.tasks_deleted_locally;
        self.conflicts += other.conflicts;
    }
}

/// One step a dry run would take; nothing is applied
#[derive(Clone, Debug, PartialEq)]
pub enum PlannedAction {
    PushCreate { list_id: String, summary: String },
    PushUpdate { list_id: String, task_id: String },
    PushDelete { list_id: String, task_id: String },
    SkipUnchangedList { list_id: String },
    AbsorbRemoteTask { list_id: String, task_id: String },
    OverwriteLocalTask { list_id: String, task_id: String },
    DeleteLocalTask { list_id: String, task_id: String },
    ResolveConflict { list_id: String, task_id: String },
}

/// The reconciliation engine for one (cache, remote) pair
pub struct SyncEngine<'a, R: TaskSource + Send + Sync + ?Sized> {
    cache: &'a mut Cache,
    remote: &'a mut R,
    strategy: ConflictStrategy,
}

impl<'a, R: TaskSource + Send + Sync + ?Sized> SyncEngine<'a, R> {
    pub fn new(cache: &'a mut Cache, remote: &'a mut R) -> Self {
        Self {
            cache,
            remote,
            strategy: ConflictStrategy::default(),
        }
    }

    pub fn with_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub async fn run(&mut self, mode: SyncMode) -> CbResult<SyncReport> {
        match mode {
            SyncMode::Push => self.push().await,
            SyncMode::Pull { forced } => self.pull(forced).await,
            SyncMode::Full => {
                let mut report = self.push().await?;
                report.merge(self.pull(true).await?);
                Ok(report)
            }
        }
    }

    // ---- push ----

    /// Drain the journal in FIFO order. One failing entry never blocks the
    /// rest; its failure is recorded on the entry and the drain continues.
    pub async fn push(&mut self) -> CbResult<SyncReport> {
        let mut report = SyncReport::default();
        let seqs: Vec<u64> = self.cache.journal_entries().iter().map(|e| e.seq).collect();

        for seq in seqs {
            // Re-read: an earlier create may have rewritten this entry's identifiers
            let entry = match self.cache.journal_entry(seq) {
                Some(entry) => entry,
                None => continue,
            };
            if !entry.is_replayable() {
                log::debug!(
                    "Skipping journal entry {} ({} {}), parked after: {}",
                    entry.seq,
                    entry.kind,
                    entry.task_id,
                    entry.last_error.as_deref().unwrap_or("unknown error")
                );
                continue;
            }

            let native_list = match self.resolve_native_list(&entry.list_id).await {
                Ok(id) => id,
                Err(err) => {
                    report.push_failures += 1;
                    self.record_failure(&entry, &err)?;
                    continue;
                }
            };

            match self.replay_entry(&entry, &native_list).await {
                Ok(()) => report.pushed += 1,
                Err(err) => {
                    report.push_failures += 1;
                    self.record_failure(&entry, &err)?;
                }
            }
        }
        Ok(report)
    }

    /// Apply one journal entry to the remote and retire it on success
    async fn replay_entry(&mut self, entry: &JournalEntry, native_list: &str) -> CbResult<()> {
        let wire_id = self.cache.translate_pending(&entry.task_id);

        match entry.kind {
            EntryKind::Create => {
                let mut payload = entry.payload.clone();
                payload.set_id(&wire_id);
                if let Some(parent) = payload.parent_id() {
                    let parent = self.cache.translate_pending(parent);
                    payload.set_parent_id(Some(parent));
                }

                match self.remote.add_task(native_list, &payload).await {
                    Ok(real_id) => {
                        let retire_id = if is_pending_id(&entry.task_id) {
                            // One atomic local update: task row, parent refs,
                            // journal entries, pending map
                            self.cache
                                .rewrite_pending_id(&entry.list_id, &entry.task_id, &real_id)?;
                            real_id.clone()
                        } else {
                            if real_id != wire_id {
                                log::warn!(
                                    "Replayed create of {} came back under a new identifier {}",
                                    wire_id,
                                    real_id
                                );
                            }
                            entry.task_id.clone()
                        };
                        // Only now is the create entry safe to drop
                        self.cache
                            .remove_journal_entry(&retire_id, EntryKind::Create)?;
                        self.clear_divergence_if_settled(&entry.list_id, &retire_id)?;
                        Ok(())
                    }
                    // A conflict on a create whose identifier is already real
                    // means a previous run (or a racing dispatcher) already
                    // applied it; absorb the success
                    Err(err)
                        if err.kind() == ErrorKind::Conflict && !is_pending_id(&wire_id) =>
                    {
                        log::info!(
                            "Create of {} was already applied remotely, retiring the entry",
                            wire_id
                        );
                        self.cache.remove_journal_entry(&wire_id, EntryKind::Create)?;
                        Ok(())
                    }
                    Err(err) => Err(err),
                }
            }
            EntryKind::Update => {
                let mut payload = entry.payload.clone();
                payload.set_id(&wire_id);
                if let Some(parent) = payload.parent_id() {
                    let parent = self.cache.translate_pending(parent);
                    payload.set_parent_id(Some(parent));
                }
                self.remote.update_task(native_list, &payload).await?;
                self.cache
                    .remove_journal_entry(&entry.task_id, EntryKind::Update)?;
                self.clear_divergence_if_settled(&entry.list_id, &wire_id)?;
                Ok(())
            }
            EntryKind::Delete => {
                match self.remote.delete_task(native_list, &wire_id).await {
                    Ok(()) => {}
                    // Idempotent absence: someone else already deleted it
                    Err(err) if err.kind() == ErrorKind::NotFound => {
                        log::debug!("{} was already absent remotely", wire_id);
                    }
                    Err(err) => return Err(err),
                }
                self.cache
                    .remove_journal_entry(&entry.task_id, EntryKind::Delete)?;
                Ok(())
            }
        }
    }

    /// The divergence flag only clears once no queued entry still references
    /// the task; otherwise a pull could overwrite changes that are not on the
    /// remote yet.
    fn clear_divergence_if_settled(&mut self, list_id: &str, task_id: &str) -> CbResult<()> {
        if !self.cache.journal_references(task_id) {
            self.cache.clear_locally_modified(list_id, task_id)?;
        }
        Ok(())
    }

    /// Record a replay failure on the entry, per the retry state machine:
    /// transient errors stay queued with a bumped retry count, everything else
    /// is parked until the user clears or retries the queue.
    fn record_failure(&mut self, entry: &JournalEntry, err: &crate::error::CbError) -> CbResult<()> {
        let text = err.to_string();
        if err.is_retryable() {
            log::warn!(
                "Entry {} ({} {}) failed, will retry: {}",
                entry.seq,
                entry.kind,
                entry.task_id,
                text
            );
            self.cache.bump_retry(entry.seq, &text)
        } else {
            log::error!(
                "Entry {} ({} {}) failed permanently: {}",
                entry.seq,
                entry.kind,
                entry.task_id,
                text
            );
            self.cache.mark_permanent_failure(entry.seq, &text)
        }
    }

    /// The identifier the remote knows this list by, creating the list on the
    /// remote when it only exists locally. Lists are matched by identifier
    /// first, then by display name (unique per provider).
    async fn resolve_native_list(&mut self, list_id: &str) -> CbResult<String> {
        if let Some(native) = self
            .cache
            .list_meta(list_id)
            .and_then(|m| m.native_id.clone())
        {
            return Ok(native);
        }

        let local_list = self
            .cache
            .list_lists()
            .await?
            .into_iter()
            .find(|l| l.id() == list_id)
            .ok_or_else(|| crate::error::CbError::NotFound {
                what: "list",
                id: list_id.to_string(),
            })?;

        let remote_lists = self.remote.list_lists().await?;
        let native = if remote_lists.iter().any(|l| l.id() == list_id) {
            list_id.to_string()
        } else if let Some(matching) = remote_lists.iter().find(|l| l.name() == local_list.name())
        {
            matching.id().to_string()
        } else {
            log::info!("Creating list {:?} on {}", local_list.name(), self.remote.display_name());
            self.remote
                .create_list(
                    local_list.name(),
                    local_list.description(),
                    local_list.color(),
                )
                .await?
        };

        let mut meta = self.cache.list_meta(list_id).cloned().unwrap_or_default();
        meta.native_id = Some(native.clone());
        self.cache.set_list_meta(list_id, meta)?;
        Ok(native)
    }

    // ---- pull ----

    /// The local list record a remote list belongs to: either the record that
    /// already tracks it as its native id, or one keyed by the remote id itself.
    async fn local_list_for(&self, remote_list_id: &str) -> CbResult<Option<String>> {
        let mut lists = self.cache.list_lists().await?;
        lists.extend(self.cache.list_deleted_lists().await?);
        for list in lists {
            if list.id() == remote_list_id {
                return Ok(Some(list.id().to_string()));
            }
            if self
                .cache
                .list_meta(list.id())
                .and_then(|m| m.native_id.as_deref())
                == Some(remote_list_id)
            {
                return Ok(Some(list.id().to_string()));
            }
        }
        Ok(None)
    }

    pub async fn pull(&mut self, forced: bool) -> CbResult<SyncReport> {
        let mut report = SyncReport::default();
        let remote_lists = self.remote.list_lists().await?;

        for remote_list in remote_lists {
            match self.pull_list(&remote_list, forced).await {
                Ok(list_report) => report.merge(list_report),
                Err(err) => {
                    // One broken list must not abort the rest of the pull
                    log::warn!(
                        "Unable to pull list {} ({}): {}, skipping this time",
                        remote_list.name(),
                        remote_list.id(),
                        err
                    );
                }
            }
        }
        Ok(report)
    }

    async fn pull_list(&mut self, remote_list: &TaskList, forced: bool) -> CbResult<SyncReport> {
        let mut report = SyncReport::default();

        let local_id = match self.local_list_for(remote_list.id()).await? {
            Some(id) => id,
            None => {
                // First sighting: absorb the list under its remote identifier
                self.cache.absorb_remote_list(remote_list.clone())?;
                remote_list.id().to_string()
            }
        };

        let meta = self.cache.list_meta(&local_id).cloned().unwrap_or_default();
        let remote_tag = remote_list.revision_tag().map(String::from);
        if !forced && remote_tag.is_some() && meta.revision_tag == remote_tag {
            log::debug!(
                "List {} is unchanged (revision {:?}), skipping enumeration",
                remote_list.name(),
                remote_tag
            );
            report.lists_skipped += 1;
            return Ok(report);
        }

        let remote_tasks = self
            .remote
            .get_tasks(remote_list.id(), &TaskFilter::all())
            .await?;

        let mut seen: HashSet<String> = HashSet::new();
        for remote_task in remote_tasks {
            if is_pending_id(remote_task.id()) {
                log::error!(
                    "Remote task {} uses the reserved pending namespace, ignoring it",
                    remote_task.id()
                );
                continue;
            }
            seen.insert(remote_task.id().to_string());

            let known = self.cache.get_task(&local_id, remote_task.id()).cloned();
            match known {
                None => {
                    self.cache.absorb_remote_task(&local_id, remote_task)?;
                    report.tasks_absorbed += 1;
                }
                Some(_) if !self.cache.is_locally_modified(&local_id, remote_task.id()) => {
                    self.cache.absorb_remote_task(&local_id, remote_task)?;
                    report.tasks_absorbed += 1;
                }
                Some(local_task) => {
                    report.conflicts += 1;
                    self.settle_conflict(&local_id, local_task, remote_task, &meta)
                        .await?;
                }
            }
        }

        // Tasks that vanished from the remote disappear locally too, unless
        // they were created here after the last sync
        let local_tasks = self.cache.get_tasks(&local_id, &TaskFilter::all()).await?;
        for task in local_tasks {
            let id = task.id().to_string();
            if seen.contains(&id) {
                continue;
            }
            if is_pending_id(&id) || self.cache.has_queued_create(&id) {
                continue;
            }
            log::debug!("{} vanished from the remote, deleting the local copy", id);
            self.cache.drop_journal_entries_for(&id)?;
            self.cache.absorb_remote_delete(&local_id, &id)?;
            report.tasks_deleted_locally += 1;
        }

        // Absorb the list attributes under the local identifier, then the
        // bookkeeping that makes the next pull short-circuit
        let mut absorbed = TaskList::new(&local_id, remote_list.name())
            .with_description(remote_list.description().map(String::from))
            .with_color(remote_list.color().cloned())
            .with_revision_tag(remote_tag.clone());
        absorbed.set_deleted(remote_list.is_deleted());
        self.cache.absorb_remote_list(absorbed)?;

        self.cache.set_list_meta(
            &local_id,
            ListSyncMeta {
                last_synced: Some(Utc::now()),
                revision_tag: remote_tag,
                native_id: Some(remote_list.id().to_string()),
            },
        )?;

        report.lists_pulled += 1;
        Ok(report)
    }

    /// Apply the configured strategy to one both-sides-modified task
    async fn settle_conflict(
        &mut self,
        local_list_id: &str,
        local_task: Task,
        remote_task: Task,
        meta: &ListSyncMeta,
    ) -> CbResult<()> {
        let resolution = self.strategy.resolve(
            &local_task,
            &remote_task,
            meta.last_synced,
            self.remote.authoritative_fields(),
        );
        log::info!(
            "Conflict on {} ({}): resolving with {}",
            local_task.id(),
            local_task.summary(),
            self.strategy
        );

        match resolution {
            Resolution::TakeRemote => {
                self.cache.drop_journal_entries_for(local_task.id())?;
                self.cache.absorb_remote_task(local_list_id, remote_task)?;
            }
            Resolution::KeepLocal => {
                // The queued journal entries will push the local version
            }
            Resolution::DuplicateLocal => {
                let mut copy = local_task.clone();
                let mut summary = copy.summary().to_string();
                summary.push_str(KEEP_BOTH_SUFFIX);
                copy.set_summary(&summary)?;
                // The copy is a brand-new local task: pending id plus a
                // queued create
                self.cache.add_task(local_list_id, &copy).await?;

                self.cache.drop_journal_entries_for(local_task.id())?;
                self.cache.absorb_remote_task(local_list_id, remote_task)?;
            }
            Resolution::Merged(merged) => {
                // Supersede the stale queued changes, absorb the merge, then
                // queue it for push as a fresh update
                self.cache.drop_journal_entries_for(local_task.id())?;
                self.cache
                    .absorb_remote_task(local_list_id, merged.clone())?;
                self.cache.update_task(local_list_id, &merged).await?;
            }
        }
        Ok(())
    }

    // ---- dry run ----

    /// What a full sync would do right now, without touching either side
    pub async fn plan(&mut self) -> CbResult<Vec<PlannedAction>> {
        let mut actions = Vec::new();

        for entry in self.cache.journal_entries() {
            if !entry.is_replayable() {
                continue;
            }
            actions.push(match entry.kind {
                EntryKind::Create => PlannedAction::PushCreate {
                    list_id: entry.list_id.clone(),
                    summary: entry.payload.summary().to_string(),
                },
                EntryKind::Update => PlannedAction::PushUpdate {
                    list_id: entry.list_id.clone(),
                    task_id: entry.task_id.clone(),
                },
                EntryKind::Delete => PlannedAction::PushDelete {
                    list_id: entry.list_id.clone(),
                    task_id: entry.task_id.clone(),
                },
            });
        }

        for remote_list in self.remote.list_lists().await? {
            let local_id = match self.local_list_for(remote_list.id()).await? {
                Some(id) => id,
                None => remote_list.id().to_string(),
            };
            let meta = self.cache.list_meta(&local_id).cloned().unwrap_or_default();
            let remote_tag = remote_list.revision_tag().map(String::from);
            if remote_tag.is_some() && meta.revision_tag == remote_tag {
                actions.push(PlannedAction::SkipUnchangedList { list_id: local_id });
                continue;
            }

            let remote_tasks = self
                .remote
                .get_tasks(remote_list.id(), &TaskFilter::all())
                .await?;
            let mut seen = HashSet::new();
            for remote_task in &remote_tasks {
                seen.insert(remote_task.id().to_string());
                let action = match self.cache.get_task(&local_id, remote_task.id()) {
                    None => PlannedAction::AbsorbRemoteTask {
                        list_id: local_id.clone(),
                        task_id: remote_task.id().to_string(),
                    },
                    Some(_) if !self.cache.is_locally_modified(&local_id, remote_task.id()) => {
                        PlannedAction::OverwriteLocalTask {
                            list_id: local_id.clone(),
                            task_id: remote_task.id().to_string(),
                        }
                    }
                    Some(_) => PlannedAction::ResolveConflict {
                        list_id: local_id.clone(),
                        task_id: remote_task.id().to_string(),
                    },
                };
                actions.push(action);
            }

            if let Ok(local_tasks) = self.cache.get_tasks(&local_id, &TaskFilter::all()).await {
                for task in local_tasks {
                    if !seen.contains(task.id())
                        && !is_pending_id(task.id())
                        && !self.cache.has_queued_create(task.id())
                    {
                        actions.push(PlannedAction::DeleteLocalTask {
                            list_id: local_id.clone(),
                            task_id: task.id().to_string(),
                        });
                    }
                }
            }
        }

        Ok(actions)
    }
}
