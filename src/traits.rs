//! The operation surface shared by every task source
//!
//! Both remote adapters and the local cache implement [`TaskSource`]; the sync
//! engine only ever talks to this trait, which is what lets integration tests
//! swap a real server for the in-memory source.

use async_trait::async_trait;
use bitflags::bitflags;
use csscolorparser::Color;

use crate::error::{CbError, CbResult};
use crate::model::{Task, TaskFilter, TaskList, TaskStatus};

bitflags! {
    /// What a provider can do beyond the mandatory surface
    pub struct SourceCapabilities: u8 {
        /// Deleted lists land in a restorable trash
        const TRASH = 1;
        /// Lists can be renamed in place
        const RENAME = 2;
        /// `find_tasks_by_summary` runs on the server
        const SERVER_SEARCH = 4;
        /// The provider can introspect the environment to decide whether it applies
        const AUTO_DETECT = 8;
    }
}

bitflags! {
    /// Task fields, used to declare which side wins a both-ends-modified merge
    pub struct FieldMask: u16 {
        const SUMMARY     = 1;
        const DESCRIPTION = 2;
        const STATUS      = 4;
        const PRIORITY    = 8;
        const DUE         = 16;
        const START       = 32;
        const CATEGORIES  = 64;
        const PARENT      = 128;
    }
}

/// This trait must be implemented by every task source, either the local cache
/// or a remote provider.
///
/// Every operation is total: it either succeeds or reports a typed [`CbError`],
/// whose [`kind`](CbError::kind) is what callers branch on.
#[async_trait]
pub trait TaskSource {
    /// Enumerate all lists that are not soft-deleted
    async fn list_lists(&self) -> CbResult<Vec<TaskList>>;

    /// Enumerate soft-deleted lists. Empty on providers without a trash.
    async fn list_deleted_lists(&self) -> CbResult<Vec<TaskList>> {
        Ok(Vec::new())
    }

    /// Return the tasks of a list that match the filter.
    /// Ordering is provider-defined; use [`TaskSource::sort_tasks`] for presentation.
    async fn get_tasks(&self, list_id: &str, filter: &TaskFilter) -> CbResult<Vec<Task>>;

    /// Case-insensitive substring match on the summary. Server-side where the
    /// provider supports it, otherwise this client-side fallback.
    async fn find_tasks_by_summary(&self, list_id: &str, needle: &str) -> CbResult<Vec<Task>> {
        let needle = needle.to_lowercase();
        let tasks = self.get_tasks(list_id, &TaskFilter::all()).await?;
        Ok(tasks
            .into_iter()
            .filter(|t| t.summary().to_lowercase().contains(&needle))
            .collect())
    }

    /// Create a task and return its identifier.
    ///
    /// The returned identifier is authoritative and **may differ** from
    /// `task.id()`: remotes that assign their own identifiers ignore the one
    /// they were handed, and no remote is ever allowed to adopt a pending one.
    async fn add_task(&mut self, list_id: &str, task: &Task) -> CbResult<String>;

    /// Replace the task carrying `task.id()`. Fails with a `not_found` kind if absent.
    async fn update_task(&mut self, list_id: &str, task: &Task) -> CbResult<()>;

    /// Remove a task. Fails with a `not_found` kind if absent, which journal
    /// replay treats as idempotent success.
    async fn delete_task(&mut self, list_id: &str, task_id: &str) -> CbResult<()>;

    /// Create a list and return its identifier
    async fn create_list(
        &mut self,
        name: &str,
        description: Option<&str>,
        color: Option<&Color>,
    ) -> CbResult<String>;

    async fn delete_list(&mut self, list_id: &str) -> CbResult<()>;

    async fn rename_list(&mut self, list_id: &str, new_name: &str) -> CbResult<()>;

    /// Bring a soft-deleted list back. `unsupported` on providers without a trash.
    async fn restore_list(&mut self, list_id: &str) -> CbResult<()> {
        let _ = list_id;
        Err(CbError::Unsupported {
            operation: "restore_list",
            provider: self.display_name(),
        })
    }

    /// Irrevocably remove a soft-deleted list. `unsupported` on providers without a trash.
    async fn purge_list(&mut self, list_id: &str) -> CbResult<()> {
        let _ = list_id;
        Err(CbError::Unsupported {
            operation: "purge_list",
            provider: self.display_name(),
        })
    }

    /// Parse a user-supplied status: the common abbreviations and canonical
    /// names always work, and providers layer their native vocabulary on top
    /// so that the same input means the same thing regardless of the remote.
    fn parse_status_input(&self, text: &str) -> CbResult<TaskStatus> {
        TaskStatus::parse_common(text)
            .ok_or_else(|| CbError::invalid_input(format!("unknown status {:?}", text)))
    }

    /// The provider's preferred spelling of a status, for presentation
    fn status_display(&self, status: TaskStatus) -> String {
        status.as_str().to_string()
    }

    /// The canonical presentation sort: priority ascending with undefined (0)
    /// last, ties broken by creation time
    fn sort_tasks(&self, tasks: &mut [Task]) {
        tasks.sort_by(|a, b| {
            let key = |t: &Task| (t.priority() == 0, t.priority(), *t.created_at());
            key(a).cmp(&key(b))
        });
    }

    /// An ANSI escape for rendering this priority. Purely cosmetic; may be empty.
    fn priority_color(&self, priority: u8) -> &'static str {
        match priority {
            1 | 2 => "\x1b[31m",
            3 | 4 => "\x1b[33m",
            5 | 6 => "\x1b[36m",
            _ => "",
        }
    }

    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities::empty()
    }

    /// Which fields the remote side wins when both ends changed them since the
    /// last sync and the merge strategy has to break the tie. Status and
    /// completion-adjacent fields default to the remote, wording to the local copy.
    fn authoritative_fields(&self) -> FieldMask {
        FieldMask::STATUS | FieldMask::DUE | FieldMask::START
    }

    /// A human-readable name for log lines and prompts
    fn display_name(&self) -> String;

    /// The stable provider-family tag used by the registry
    fn type_tag(&self) -> &'static str;

    /// Where this source points (host, file path, ...), for diagnostics
    fn context(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    struct Bare;

    #[async_trait]
    impl TaskSource for Bare {
        async fn list_lists(&self) -> CbResult<Vec<TaskList>> {
            Ok(Vec::new())
        }
        async fn get_tasks(&self, _list_id: &str, _filter: &TaskFilter) -> CbResult<Vec<Task>> {
            let mut urgent = Task::new("a", "l", "urgent").unwrap();
            urgent.set_priority(1).unwrap();
            let mut low = Task::new("b", "l", "low").unwrap();
            low.set_priority(9).unwrap();
            let undefined = Task::new("c", "l", "Fix the squeaky door").unwrap();
            Ok(vec![low, undefined, urgent])
        }
        async fn add_task(&mut self, _list_id: &str, _task: &Task) -> CbResult<String> {
            unimplemented!()
        }
        async fn update_task(&mut self, _list_id: &str, _task: &Task) -> CbResult<()> {
            unimplemented!()
        }
        async fn delete_task(&mut self, _list_id: &str, _task_id: &str) -> CbResult<()> {
            unimplemented!()
        }
        async fn create_list(
            &mut self,
            _name: &str,
            _description: Option<&str>,
            _color: Option<&Color>,
        ) -> CbResult<String> {
            unimplemented!()
        }
        async fn delete_list(&mut self, _list_id: &str) -> CbResult<()> {
            unimplemented!()
        }
        async fn rename_list(&mut self, _list_id: &str, _new_name: &str) -> CbResult<()> {
            unimplemented!()
        }
        fn display_name(&self) -> String {
            "bare".into()
        }
        fn type_tag(&self) -> &'static str {
            "bare"
        }
        fn context(&self) -> String {
            "nowhere".into()
        }
    }

    #[test]
    fn default_sort_puts_undefined_priority_last() {
        let source = Bare;
        let mut urgent = Task::new("a", "l", "urgent").unwrap();
        urgent.set_priority(1).unwrap();
        let mut low = Task::new("b", "l", "low").unwrap();
        low.set_priority(9).unwrap();
        let mut undefined = Task::new("c", "l", "whenever").unwrap();
        undefined.set_timestamps(Utc::now() - Duration::days(1), Utc::now());

        let mut tasks = vec![undefined, low, urgent];
        source.sort_tasks(&mut tasks);
        let priorities: Vec<u8> = tasks.iter().map(|t| t.priority()).collect();
        assert_eq!(priorities, vec![1, 9, 0]);
    }

    #[tokio::test]
    async fn default_summary_search_is_case_insensitive() {
        let source = Bare;
        let hits = source.find_tasks_by_summary("l", "SQUEAKY").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].summary(), "Fix the squeaky door");
    }

    #[test]
    fn trash_surface_defaults() {
        assert!(futures_block(Bare.list_deleted_lists()).unwrap().is_empty());
        let refused = futures_block(Bare.restore_list("l"));
        assert!(matches!(refused, Err(CbError::Unsupported { .. })));
    }

    // Tiny helper so default-impl tests don't each need a runtime
    fn futures_block<F: std::future::Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(fut)
    }
}
