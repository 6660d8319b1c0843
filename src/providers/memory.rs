//! An in-memory task source
//!
//! This is what the test harness syncs against instead of a real server: it
//! assigns server-style identifiers, bumps per-list revision tags on every
//! mutation, and can be told to fail on purpose. Stores are process-global and
//! looked up by name, so the registry can hand a dispatcher the same store a
//! test is inspecting.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use csscolorparser::Color;
use once_cell::sync::Lazy;

use crate::cache::is_pending_id;
use crate::error::{CbError, CbResult};
use crate::model::{Task, TaskFilter, TaskList};
use crate::traits::{SourceCapabilities, TaskSource};

static STORES: Lazy<Mutex<HashMap<String, Arc<Mutex<MemoryState>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Forced-failure counters: set `(m, n)` to make an operation fail `n` times
/// after `m` initial successes.
#[derive(Clone, Copy, Debug, Default)]
pub struct FaultPlan {
    /// When true, every operation is allowed
    pub is_suspended: bool,

    pub list_lists_behaviour: (u32, u32),
    pub get_tasks_behaviour: (u32, u32),
    pub add_task_behaviour: (u32, u32),
    pub update_task_behaviour: (u32, u32),
    pub delete_task_behaviour: (u32, u32),
}

impl FaultPlan {
    /// Everything fails at once, `n_fails` times
    pub fn fail_now(n_fails: u32) -> Self {
        Self {
            is_suspended: false,
            list_lists_behaviour: (0, n_fails),
            get_tasks_behaviour: (0, n_fails),
            add_task_behaviour: (0, n_fails),
            update_task_behaviour: (0, n_fails),
            delete_task_behaviour: (0, n_fails),
        }
    }

    fn check(counter: &mut (u32, u32), descr: &str) -> CbResult<()> {
        if counter.0 > 0 {
            counter.0 -= 1;
            Ok(())
        } else if counter.1 > 0 {
            counter.1 -= 1;
            log::debug!("Forcing {} to fail ({} more to come)", descr, counter.1);
            Err(CbError::transient(format!("mocked {} failure", descr)))
        } else {
            Ok(())
        }
    }
}

#[derive(Debug)]
struct ListState {
    list: TaskList,
    tasks: HashMap<String, Task>,
}

/// Everything a memory store knows; tests reach in through
/// [`MemorySource::with_state`]
#[derive(Debug, Default)]
pub struct MemoryState {
    lists: HashMap<String, ListState>,
    revision_counter: u64,
    fault_plan: FaultPlan,
    /// How many times `get_tasks` has run, for the short-circuit tests
    pub enumerations: u64,
    /// Authentication failures on demand, to exercise the permanent-failure path
    pub reject_credentials: bool,
}

fn gate<F>(state: &mut MemoryState, descr: &str, pick: F) -> CbResult<()>
where
    F: FnOnce(&mut FaultPlan) -> &mut (u32, u32),
{
    if state.fault_plan.is_suspended {
        return Ok(());
    }
    FaultPlan::check(pick(&mut state.fault_plan), descr)
}

impl MemoryState {
    fn bump_revision(&mut self, list_id: &str) {
        self.revision_counter += 1;
        let tag = format!("rev-{}", self.revision_counter);
        if let Some(state) = self.lists.get_mut(list_id) {
            state.list.set_revision_tag(Some(tag));
        }
    }

    fn check_auth(&self, name: &str) -> CbResult<()> {
        if self.reject_credentials {
            Err(CbError::Unauthorized {
                context: format!("memory store {}", name),
            })
        } else {
            Ok(())
        }
    }
}

/// A [`TaskSource`] over a named process-global [`MemoryState`]
#[derive(Debug)]
pub struct MemorySource {
    name: String,
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySource {
    /// Open the store with this name, creating it empty on first use.
    /// Every `MemorySource` opened under one name shares the same state.
    pub fn shared<S: ToString>(name: S) -> Self {
        let name = name.to_string();
        let state = STORES
            .lock()
            .unwrap()
            .entry(name.clone())
            .or_insert_with(|| Arc::new(Mutex::new(MemoryState::default())))
            .clone();
        Self { name, state }
    }

    /// Drop the named store, for test isolation
    pub fn reset<S: AsRef<str>>(name: S) {
        STORES.lock().unwrap().remove(name.as_ref());
    }

    pub fn set_fault_plan(&self, plan: FaultPlan) {
        self.state.lock().unwrap().fault_plan = plan;
    }

    /// Run a closure against the raw store state
    pub fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    /// Seed a list without going through the provider surface
    pub fn seed_list(&self, list: TaskList) {
        let mut state = self.state.lock().unwrap();
        let id = list.id().to_string();
        state.lists.insert(
            id.clone(),
            ListState {
                list,
                tasks: HashMap::new(),
            },
        );
        state.bump_revision(&id);
    }

    /// Seed a task with a chosen identifier, as if it had been created remotely
    pub fn seed_task(&self, list_id: &str, task: Task) {
        let mut state = self.state.lock().unwrap();
        if let Some(list) = state.lists.get_mut(list_id) {
            list.tasks.insert(task.id().to_string(), task);
        }
        state.bump_revision(list_id);
    }

    /// A copy of one stored list, revision tag included
    pub fn list(&self, list_id: &str) -> Option<TaskList> {
        let state = self.state.lock().unwrap();
        state.lists.get(list_id).map(|l| l.list.clone())
    }

    pub fn task(&self, list_id: &str, task_id: &str) -> Option<Task> {
        let state = self.state.lock().unwrap();
        state
            .lists
            .get(list_id)
            .and_then(|l| l.tasks.get(task_id))
            .cloned()
    }

    pub fn task_count(&self, list_id: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.lists.get(list_id).map(|l| l.tasks.len()).unwrap_or(0)
    }

    /// How many times `get_tasks` has been answered; the revision-tag
    /// short-circuit tests count enumerations with this
    pub fn enumeration_count(&self) -> u64 {
        self.state.lock().unwrap().enumerations
    }
}

#[async_trait]
impl TaskSource for MemorySource {
    async fn list_lists(&self) -> CbResult<Vec<TaskList>> {
        let mut state = self.state.lock().unwrap();
        state.check_auth(&self.name)?;
        gate(&mut state, "list_lists", |p| &mut p.list_lists_behaviour)?;
        Ok(state.lists.values().map(|l| l.list.clone()).collect())
    }

    async fn get_tasks(&self, list_id: &str, filter: &TaskFilter) -> CbResult<Vec<Task>> {
        let mut state = self.state.lock().unwrap();
        state.check_auth(&self.name)?;
        gate(&mut state, "get_tasks", |p| &mut p.get_tasks_behaviour)?;
        state.enumerations += 1;
        let list = state.lists.get(list_id).ok_or_else(|| CbError::NotFound {
            what: "list",
            id: list_id.to_string(),
        })?;
        Ok(list
            .tasks
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect())
    }

    async fn add_task(&mut self, list_id: &str, task: &Task) -> CbResult<String> {
        let mut state = self.state.lock().unwrap();
        state.check_auth(&self.name)?;
        gate(&mut state, "add_task", |p| &mut p.add_task_behaviour)?;

        let list = state.lists.get_mut(list_id).ok_or_else(|| CbError::NotFound {
            what: "list",
            id: list_id.to_string(),
        })?;

        // A client re-issuing a create it already got an id for is answered
        // like any server would: the resource exists
        if !task.id().is_empty() && !is_pending_id(task.id()) {
            if list.tasks.contains_key(task.id()) {
                return Err(CbError::Conflict {
                    what: "task",
                    id: task.id().to_string(),
                });
            }
        }

        let real_id = format!("task-{}", uuid::Uuid::new_v4().to_hyphenated());
        let mut stored = task.clone();
        stored.set_id(&real_id);
        stored.set_list_id(list_id);
        list.tasks.insert(real_id.clone(), stored);
        state.bump_revision(list_id);
        Ok(real_id)
    }

    async fn update_task(&mut self, list_id: &str, task: &Task) -> CbResult<()> {
        let mut state = self.state.lock().unwrap();
        state.check_auth(&self.name)?;
        gate(&mut state, "update_task", |p| &mut p.update_task_behaviour)?;

        let list = state.lists.get_mut(list_id).ok_or_else(|| CbError::NotFound {
            what: "list",
            id: list_id.to_string(),
        })?;
        if !list.tasks.contains_key(task.id()) {
            return Err(CbError::NotFound {
                what: "task",
                id: task.id().to_string(),
            });
        }
        let mut stored = task.clone();
        stored.set_list_id(list_id);
        list.tasks.insert(stored.id().to_string(), stored);
        state.bump_revision(list_id);
        Ok(())
    }

    async fn delete_task(&mut self, list_id: &str, task_id: &str) -> CbResult<()> {
        let mut state = self.state.lock().unwrap();
        state.check_auth(&self.name)?;
        gate(&mut state, "delete_task", |p| &mut p.delete_task_behaviour)?;

        let list = state.lists.get_mut(list_id).ok_or_else(|| CbError::NotFound {
            what: "list",
            id: list_id.to_string(),
        })?;
        match list.tasks.remove(task_id) {
            Some(_) => {
                state.bump_revision(list_id);
                Ok(())
            }
            None => Err(CbError::NotFound {
                what: "task",
                id: task_id.to_string(),
            }),
        }
    }

    async fn create_list(
        &mut self,
        name: &str,
        description: Option<&str>,
        color: Option<&Color>,
    ) -> CbResult<String> {
        let mut state = self.state.lock().unwrap();
        state.check_auth(&self.name)?;
        if state.lists.values().any(|l| l.list.name() == name) {
            return Err(CbError::Conflict {
                what: "list",
                id: name.to_string(),
            });
        }
        let id = format!("list-{}", uuid::Uuid::new_v4().to_hyphenated());
        let list = TaskList::new(&id, name)
            .with_description(description.map(|d| d.to_string()))
            .with_color(color.cloned());
        state.lists.insert(
            id.clone(),
            ListState {
                list,
                tasks: HashMap::new(),
            },
        );
        state.bump_revision(&id);
        Ok(id)
    }

    async fn delete_list(&mut self, list_id: &str) -> CbResult<()> {
        let mut state = self.state.lock().unwrap();
        state.check_auth(&self.name)?;
        state.lists.remove(list_id).ok_or_else(|| CbError::NotFound {
            what: "list",
            id: list_id.to_string(),
        })?;
        Ok(())
    }

    async fn rename_list(&mut self, list_id: &str, new_name: &str) -> CbResult<()> {
        let mut state = self.state.lock().unwrap();
        state.check_auth(&self.name)?;
        let clash = state
            .lists
            .iter()
            .any(|(id, l)| id != list_id && l.list.name() == new_name);
        if clash {
            return Err(CbError::Conflict {
                what: "list",
                id: new_name.to_string(),
            });
        }
        let list = state.lists.get_mut(list_id).ok_or_else(|| CbError::NotFound {
            what: "list",
            id: list_id.to_string(),
        })?;
        list.list.set_name(new_name);
        state.bump_revision(list_id);
        Ok(())
    }

    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities::RENAME
    }

    fn display_name(&self) -> String {
        format!("memory store {}", self.name)
    }

    fn type_tag(&self) -> &'static str {
        "memory"
    }

    fn context(&self) -> String {
        format!("memory://{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn assigns_its_own_identifiers() {
        let mut source = MemorySource::shared("assigns-ids");
        let list_id = source.create_list("inbox", None, None).await.unwrap();

        let draft = Task::new("pending-3", &list_id, "water the plants").unwrap();
        let real = source.add_task(&list_id, &draft).await.unwrap();

        assert!(!is_pending_id(&real));
        assert_ne!(real, "pending-3");
        assert_eq!(source.task(&list_id, &real).unwrap().summary(), "water the plants");
        MemorySource::reset("assigns-ids");
    }

    #[tokio::test]
    async fn recreate_with_known_id_is_a_conflict() {
        let mut source = MemorySource::shared("recreate");
        let list_id = source.create_list("inbox", None, None).await.unwrap();
        let draft = Task::new("", &list_id, "x").unwrap();
        let real = source.add_task(&list_id, &draft).await.unwrap();

        let mut replay = draft.clone();
        replay.set_id(&real);
        let second = source.add_task(&list_id, &replay).await;
        assert!(matches!(second, Err(CbError::Conflict { .. })));
        MemorySource::reset("recreate");
    }

    #[tokio::test]
    async fn revision_tag_changes_on_every_mutation() {
        let mut source = MemorySource::shared("revisions");
        let list_id = source.create_list("inbox", None, None).await.unwrap();
        let tag_before = source.list_lists().await.unwrap()[0]
            .revision_tag()
            .map(String::from);

        let draft = Task::new("", &list_id, "x").unwrap();
        source.add_task(&list_id, &draft).await.unwrap();

        let tag_after = source.list_lists().await.unwrap()[0]
            .revision_tag()
            .map(String::from);
        assert_ne!(tag_before, tag_after);
        MemorySource::reset("revisions");
    }

    #[tokio::test]
    async fn fault_plan_fails_then_recovers() {
        let mut source = MemorySource::shared("faulty");
        let list_id = source.create_list("inbox", None, None).await.unwrap();
        source.set_fault_plan(FaultPlan {
            add_task_behaviour: (0, 2),
            ..FaultPlan::default()
        });

        let draft = Task::new("", &list_id, "x").unwrap();
        assert!(source.add_task(&list_id, &draft).await.unwrap_err().is_retryable());
        assert!(source.add_task(&list_id, &draft).await.is_err());
        assert!(source.add_task(&list_id, &draft).await.is_ok());
        MemorySource::reset("faulty");
    }
}
