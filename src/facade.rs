//! The operation surface the CLI shell calls
//!
//! Every verb here is bound to one configured backend. Mutations validate
//! user input first (nothing invalid ever reaches the cache), then commit the
//! canonical row and its journal entry in one cache transaction, and finally
//! ask the dispatcher to run in the background. Nothing in the foreground
//! path waits on the network.

use std::path::PathBuf;

use csscolorparser::Color;

use crate::cache::journal::JournalEntry;
use crate::cache::Cache;
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::error::{CbError, CbResult};
use crate::model::{parse_priority_input, Task, TaskDate, TaskFilter, TaskList, TaskStatus};
use crate::registry;
use crate::sync::{ConflictStrategy, PlannedAction, SyncEngine, SyncMode, SyncReport};
use crate::traits::TaskSource;

/// The user-supplied fields of a new or changed task. Status and priority
/// arrive as raw text, exactly as typed; they are validated here before any
/// mutation happens.
#[derive(Clone, Debug, Default)]
pub struct TaskDraft {
    pub summary: String,
    pub description: Option<String>,
    pub status: Option<String>,
    pub priority: Option<String>,
    pub due: Option<TaskDate>,
    pub start: Option<TaskDate>,
    pub categories: Vec<String>,
    pub parent_id: Option<String>,
}

impl TaskDraft {
    pub fn titled<S: ToString>(summary: S) -> Self {
        Self {
            summary: summary.to_string(),
            ..Self::default()
        }
    }
}

/// The `sync status` summary for one backend
#[derive(Clone, Debug)]
pub struct SyncStatus {
    pub queued_entries: usize,
    pub failed_entries: usize,
    /// Each list with the sync bookkeeping the engine keeps for it
    pub lists: Vec<(TaskList, crate::model::ListSyncMeta)>,
}

/// Task verbs for one backend
pub struct TaskOps {
    config: Config,
    config_path: Option<PathBuf>,
    backend_name: String,
}

impl TaskOps {
    pub fn new<S: ToString>(
        config: Config,
        config_path: Option<PathBuf>,
        backend_name: S,
    ) -> CbResult<Self> {
        let backend_name = backend_name.to_string();
        if config.backend(&backend_name).is_none() {
            return Err(CbError::NotFound {
                what: "backend",
                id: backend_name,
            });
        }
        Ok(Self {
            config,
            config_path,
            backend_name,
        })
    }

    /// The cache is opened per operation so the writer lock is never held
    /// while the foreground idles
    fn open_cache(&self) -> CbResult<Cache> {
        Cache::open(&self.config.cache_folder_for(&self.backend_name))
    }

    /// Ask for a background drain; failures are logged and swallowed, the
    /// local commit already happened
    fn nudge_dispatcher(&self) {
        let dispatcher = Dispatcher::new(self.config.clone(), self.config_path.clone());
        if let Err(err) = dispatcher.request_run() {
            log::warn!("Unable to start a background sync: {}", err);
        }
    }

    /// Build and validate a task from raw user input, before any mutation
    fn materialize(&self, list_id: &str, draft: &TaskDraft) -> CbResult<Task> {
        let mut task = Task::new("", list_id, &draft.summary)?;
        task.set_description(draft.description.clone());
        if let Some(status_text) = &draft.status {
            let status = TaskStatus::parse_common(status_text).ok_or_else(|| {
                CbError::invalid_input(format!("unknown status {:?}", status_text))
            })?;
            task.set_status(status);
        }
        if let Some(priority_text) = &draft.priority {
            task.set_priority(parse_priority_input(priority_text)?)?;
        }
        task.set_due(draft.due)?;
        task.set_start(draft.start)?;
        task.set_categories(draft.categories.clone());
        task.set_parent_id(draft.parent_id.clone());
        task.validate()?;
        Ok(task)
    }

    /// Find one task by identifier or by unique summary substring
    async fn resolve_task(&self, cache: &Cache, list_id: &str, lookup: &str) -> CbResult<Task> {
        if let Some(task) = cache.get_task(list_id, lookup) {
            return Ok(task.clone());
        }
        let matches = cache.find_tasks_by_summary(list_id, lookup).await?;
        match matches.len() {
            0 => Err(CbError::NotFound {
                what: "task",
                id: lookup.to_string(),
            }),
            1 => Ok(matches.into_iter().next().expect("len checked")),
            n => Err(CbError::invalid_input(format!(
                "{:?} matches {} tasks, be more specific",
                lookup, n
            ))),
        }
    }

    // ---- task verbs ----

    /// Create a task. Returns the stored copy, which carries a pending
    /// identifier until a sync replaces it with the remote's one.
    pub async fn add(&self, list_id: &str, draft: TaskDraft) -> CbResult<Task> {
        let task = self.materialize(list_id, &draft)?;
        let mut cache = self.open_cache()?;
        let pending_id = cache.add_task(list_id, &task).await?;
        let stored = cache
            .get_task(list_id, &pending_id)
            .cloned()
            .expect("the task was just inserted");
        drop(cache);

        self.nudge_dispatcher();
        Ok(stored)
    }

    /// Replace a task wholesale
    pub async fn update(&self, list_id: &str, task: &Task) -> CbResult<()> {
        task.validate()?;
        let mut cache = self.open_cache()?;
        cache.update_task(list_id, task).await?;
        drop(cache);

        self.nudge_dispatcher();
        Ok(())
    }

    /// Mark a task (found by id or summary) as done
    pub async fn complete(&self, list_id: &str, lookup: &str) -> CbResult<Task> {
        let mut cache = self.open_cache()?;
        let mut task = self.resolve_task(&cache, list_id, lookup).await?;
        task.set_status(TaskStatus::Done);
        cache.update_task(list_id, &task).await?;
        drop(cache);

        self.nudge_dispatcher();
        Ok(task)
    }

    /// Delete a task (found by id or summary)
    pub async fn delete(&self, list_id: &str, lookup: &str) -> CbResult<()> {
        let mut cache = self.open_cache()?;
        let task = self.resolve_task(&cache, list_id, lookup).await?;
        cache.delete_task(list_id, task.id()).await?;
        drop(cache);

        self.nudge_dispatcher();
        Ok(())
    }

    /// Read tasks straight from the cache; never touches the network
    pub async fn get(&self, list_id: &str, filter: &TaskFilter) -> CbResult<Vec<Task>> {
        let cache = self.open_cache()?;
        cache.get_tasks(list_id, filter).await
    }

    // ---- list verbs ----

    pub async fn lists(&self) -> CbResult<Vec<TaskList>> {
        self.open_cache()?.list_lists().await
    }

    pub async fn trashed_lists(&self) -> CbResult<Vec<TaskList>> {
        self.open_cache()?.list_deleted_lists().await
    }

    pub async fn create_list(
        &self,
        name: &str,
        description: Option<&str>,
        color: Option<&Color>,
    ) -> CbResult<String> {
        let mut cache = self.open_cache()?;
        let id = cache.create_list(name, description, color).await?;
        drop(cache);
        self.nudge_dispatcher();
        Ok(id)
    }

    pub async fn delete_list(&self, list_id: &str) -> CbResult<()> {
        self.open_cache()?.delete_list(list_id).await
    }

    pub async fn rename_list(&self, list_id: &str, new_name: &str) -> CbResult<()> {
        self.open_cache()?.rename_list(list_id, new_name).await
    }

    pub async fn restore_list(&self, list_id: &str) -> CbResult<()> {
        self.open_cache()?.restore_list(list_id).await
    }

    pub async fn purge_list(&self, list_id: &str) -> CbResult<()> {
        self.open_cache()?.purge_list(list_id).await
    }

    // ---- queue verbs ----

    /// The journal as it stands, for `sync queue`
    pub fn queue(&self) -> CbResult<Vec<JournalEntry>> {
        Ok(self.open_cache()?.journal_entries())
    }

    /// Drop queued entries; `failed_only` keeps everything that can still replay
    pub fn queue_clear(&self, failed_only: bool) -> CbResult<usize> {
        self.open_cache()?.clear_queue(failed_only)
    }

    /// Put failed entries back in the queue
    pub fn queue_retry(&self) -> CbResult<usize> {
        self.open_cache()?.retry_failed()
    }

    /// Everything `sync status` prints: per-list bookkeeping plus queue counts
    pub async fn sync_status(&self) -> CbResult<SyncStatus> {
        let cache = self.open_cache()?;
        let mut lists = Vec::new();
        for list in cache.list_lists().await? {
            let meta = cache.list_meta(list.id()).cloned().unwrap_or_default();
            lists.push((list, meta));
        }

        let queue = cache.journal_entries();
        let failed = queue
            .iter()
            .filter(|e| e.state == crate::cache::journal::EntryState::PermanentFailure)
            .count();
        Ok(SyncStatus {
            queued_entries: queue.len(),
            failed_entries: failed,
            lists,
        })
    }

    // ---- synchronous sync commands ----

    fn remote(&self) -> CbResult<crate::registry::BoxedSource> {
        let backend = self
            .config
            .backend(&self.backend_name)
            .expect("checked in the constructor");
        registry::global().construct(backend)
    }

    /// Run the sync engine in the foreground, for the `sync` command family
    pub async fn sync(&self, mode: SyncMode, strategy: ConflictStrategy) -> CbResult<SyncReport> {
        let mut cache = self.open_cache()?;
        let mut remote = self.remote()?;
        SyncEngine::new(&mut cache, remote.as_mut())
            .with_strategy(strategy)
            .run(mode)
            .await
    }

    /// What a sync would do, for `sync --dry-run`
    pub async fn sync_plan(&self) -> CbResult<Vec<PlannedAction>> {
        let mut cache = self.open_cache()?;
        let mut remote = self.remote()?;
        SyncEngine::new(&mut cache, remote.as_mut()).plan().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::is_pending_id;
    use crate::cache::journal::EntryKind;

    fn ops_with_backend(tag: &str, name: &str) -> (tempfile::TempDir, TaskOps) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.cache_root = Some(dir.path().to_path_buf());
        config
            .backends
            .push(crate::config::BackendConfig::new(name, tag));
        let ops = TaskOps::new(config, None, name).unwrap();
        (dir, ops)
    }

    async fn seed_list(ops: &TaskOps, name: &str) -> String {
        ops.create_list(name, None, None).await.unwrap()
    }

    #[tokio::test]
    async fn add_returns_a_pending_task_and_queues_a_create() {
        let (_dir, ops) = ops_with_backend("memory", "facade-add");
        let list_id = seed_list(&ops, "errands").await;

        let stored = ops
            .add(&list_id, TaskDraft::titled("buy stamps"))
            .await
            .unwrap();
        assert!(is_pending_id(stored.id()));

        let queue = ops.queue().unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].kind, EntryKind::Create);

        let visible = ops.get(&list_id, &TaskFilter::all()).await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].summary(), "buy stamps");
        crate::providers::memory::MemorySource::reset("facade-add");
    }

    #[tokio::test]
    async fn invalid_input_is_rejected_before_any_mutation() {
        let (_dir, ops) = ops_with_backend("memory", "facade-invalid");
        let list_id = seed_list(&ops, "errands").await;

        let empty_summary = ops.add(&list_id, TaskDraft::titled("  ")).await;
        assert!(matches!(empty_summary, Err(CbError::InvalidInput { .. })));

        let mut bad_priority = TaskDraft::titled("x");
        bad_priority.priority = Some("10".into());
        assert!(ops.add(&list_id, bad_priority).await.is_err());

        let mut negative_priority = TaskDraft::titled("x");
        negative_priority.priority = Some("-1".into());
        assert!(ops.add(&list_id, negative_priority).await.is_err());

        let mut bad_status = TaskDraft::titled("x");
        bad_status.status = Some("someday".into());
        assert!(ops.add(&list_id, bad_status).await.is_err());

        // Nothing reached the cache or the journal
        assert!(ops.get(&list_id, &TaskFilter::all()).await.unwrap().is_empty());
        assert!(ops.queue().unwrap().is_empty());
        crate::providers::memory::MemorySource::reset("facade-invalid");
    }

    #[tokio::test]
    async fn status_inputs_accept_letters_and_names() {
        let (_dir, ops) = ops_with_backend("memory", "facade-status");
        let list_id = seed_list(&ops, "errands").await;

        let mut draft = TaskDraft::titled("processing task");
        draft.status = Some("P".into());
        let stored = ops.add(&list_id, draft).await.unwrap();
        assert_eq!(stored.status(), TaskStatus::InProgress);

        let mut draft = TaskDraft::titled("cancelled task");
        draft.status = Some("cancelled".into());
        let stored = ops.add(&list_id, draft).await.unwrap();
        assert_eq!(stored.status(), TaskStatus::Cancelled);
        crate::providers::memory::MemorySource::reset("facade-status");
    }

    #[tokio::test]
    async fn complete_finds_tasks_by_summary_and_stamps_them() {
        let (_dir, ops) = ops_with_backend("memory", "facade-complete");
        let list_id = seed_list(&ops, "errands").await;
        ops.add(&list_id, TaskDraft::titled("water the plants"))
            .await
            .unwrap();

        let done = ops.complete(&list_id, "Plants").await.unwrap();
        assert_eq!(done.status(), TaskStatus::Done);
        assert!(done.completed_at().is_some());

        // Ambiguous lookups are refused
        ops.add(&list_id, TaskDraft::titled("water the garden"))
            .await
            .unwrap();
        assert!(ops.complete(&list_id, "water").await.is_err());
        crate::providers::memory::MemorySource::reset("facade-complete");
    }

    #[tokio::test]
    async fn facade_survives_an_unreachable_backend_config() {
        // The backend cannot even be constructed (no token), but local verbs
        // keep working: the foreground never touches the network
        let (_dir, ops) = ops_with_backend("rest", "facade-offline");
        let list_id = seed_list(&ops, "errands").await;
        let stored = ops
            .add(&list_id, TaskDraft::titled("works offline"))
            .await
            .unwrap();
        assert!(is_pending_id(stored.id()));
        assert_eq!(ops.queue().unwrap().len(), 1);
    }
}
