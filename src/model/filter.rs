//! The filter predicate accepted by every `get_tasks` implementation

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::{Task, TaskStatus};

/// Restricts which tasks a query returns. Every `None` field is unconstrained.
///
/// Evaluation is defined on a single task and has no side effects, so remotes
/// are free to push whatever subset of it they can express into their query
/// language and apply the rest client-side.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskFilter {
    /// Keep only tasks whose status is any of these
    pub statuses: Option<HashSet<TaskStatus>>,
    /// Reject tasks whose status is any of these
    pub exclude_statuses: Option<HashSet<TaskStatus>>,
    pub due_after: Option<DateTime<Utc>>,
    pub due_before: Option<DateTime<Utc>>,
    pub created_after: Option<DateTime<Utc>>,
}

impl TaskFilter {
    /// The unconstrained filter
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_statuses<I: IntoIterator<Item = TaskStatus>>(statuses: I) -> Self {
        Self {
            statuses: Some(statuses.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn is_unconstrained(&self) -> bool {
        self == &Self::default()
    }

    pub fn matches(&self, task: &Task) -> bool {
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&task.status()) {
                return false;
            }
        }
        if let Some(excluded) = &self.exclude_statuses {
            if excluded.contains(&task.status()) {
                return false;
            }
        }
        if let Some(after) = &self.due_after {
            match task.due() {
                Some(due) if due.instant() >= *after => {}
                _ => return false,
            }
        }
        if let Some(before) = &self.due_before {
            match task.due() {
                Some(due) if due.instant() <= *before => {}
                _ => return false,
            }
        }
        if let Some(created_after) = &self.created_after {
            if task.created_at() < created_after {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::task::TaskDate;
    use chrono::{Duration, NaiveDate};

    fn task(status: TaskStatus, due: Option<NaiveDate>) -> Task {
        let mut t = Task::new("t", "l", "x").unwrap();
        t.set_status(status);
        t.set_due(due.map(TaskDate::AllDay)).unwrap();
        t
    }

    #[test]
    fn unconstrained_matches_everything() {
        let filter = TaskFilter::all();
        assert!(filter.matches(&task(TaskStatus::Todo, None)));
        assert!(filter.matches(&task(TaskStatus::Cancelled, None)));
    }

    #[test]
    fn status_inclusion_and_exclusion() {
        let only_open = TaskFilter::with_statuses([TaskStatus::Todo, TaskStatus::InProgress]);
        assert!(only_open.matches(&task(TaskStatus::Todo, None)));
        assert!(!only_open.matches(&task(TaskStatus::Done, None)));

        let not_cancelled = TaskFilter {
            exclude_statuses: Some([TaskStatus::Cancelled].iter().cloned().collect()),
            ..TaskFilter::default()
        };
        assert!(not_cancelled.matches(&task(TaskStatus::Done, None)));
        assert!(!not_cancelled.matches(&task(TaskStatus::Cancelled, None)));
    }

    #[test]
    fn due_window_requires_a_due_date() {
        let date = NaiveDate::from_ymd_opt(2026, 6, 1).unwrap();
        let noon = TaskDate::AllDay(date).instant();
        let window = TaskFilter {
            due_after: Some(noon - Duration::days(1)),
            due_before: Some(noon + Duration::days(1)),
            ..TaskFilter::default()
        };

        assert!(window.matches(&task(TaskStatus::Todo, Some(date))));
        // A task without a due date cannot fall inside a due window
        assert!(!window.matches(&task(TaskStatus::Todo, None)));
        let far = date.checked_add_days(chrono::Days::new(30)).unwrap();
        assert!(!window.matches(&task(TaskStatus::Todo, Some(far))));
    }
}
