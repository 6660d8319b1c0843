//! The canonical task type every provider translates to and from

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CbError, CbResult};

/// Highest meaningful priority. 0 is "undefined", not "higher than 1".
pub const PRIORITY_MAX: u8 = 9;

/// The canonical status vocabulary.
///
/// Remotes with a poorer vocabulary (e.g. open/closed only) are responsible for
/// round-tripping the missing states through whatever native mechanism they have.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    Done,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Todo,
        TaskStatus::InProgress,
        TaskStatus::Done,
        TaskStatus::Cancelled,
    ];

    /// The canonical spelling, used in displays and in the markdown annotations
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Todo => "todo",
            TaskStatus::InProgress => "in-progress",
            TaskStatus::Done => "done",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Parse the spellings every provider accepts: single letters (t/p/d/c) and
    /// the full canonical names, case-insensitively. Provider-native spellings
    /// are layered on top by each provider's `parse_status_input`.
    pub fn parse_common(text: &str) -> Option<TaskStatus> {
        match text.trim().to_ascii_lowercase().as_str() {
            "t" | "todo" => Some(TaskStatus::Todo),
            "p" | "processing" | "in-progress" | "inprogress" => Some(TaskStatus::InProgress),
            "d" | "done" => Some(TaskStatus::Done),
            "c" | "cancelled" | "canceled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A date that may or may not carry a time of day.
///
/// CalDAV expresses all-day due dates as bare DATE values, the markdown
/// provider only ever has dates, and the REST family always has instants;
/// keeping both shapes avoids inventing midnight times that the user never set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskDate {
    AllDay(NaiveDate),
    At(DateTime<Utc>),
}

impl TaskDate {
    /// The instant used for ordering and filter comparisons.
    /// An all-day date counts as midnight UTC that day.
    pub fn instant(&self) -> DateTime<Utc> {
        match self {
            TaskDate::AllDay(d) => Utc
                .from_utc_datetime(&d.and_hms_opt(0, 0, 0).expect("midnight always exists")),
            TaskDate::At(dt) => *dt,
        }
    }
}

impl PartialOrd for TaskDate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.instant().cmp(&other.instant()))
    }
}

impl std::fmt::Display for TaskDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskDate::AllDay(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            TaskDate::At(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%SZ")),
        }
    }
}

/// A to-do task, in the one representation everything but the provider
/// adapters agrees on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Opaque identifier, unique within its list. Stable once the remote has
    /// acknowledged the task; before that it carries the reserved pending prefix.
    id: String,
    /// The list this task belongs to
    list_id: String,
    summary: String,
    description: Option<String>,
    status: TaskStatus,
    /// 0 = undefined, 1 = highest, 9 = lowest
    priority: u8,
    created_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
    /// Set if and only if `status == Done`
    completed_at: Option<DateTime<Utc>>,
    due: Option<TaskDate>,
    start: Option<TaskDate>,
    categories: Vec<String>,
    /// Another task in the same list this one is a subtask of
    parent_id: Option<String>,
}

impl Task {
    /// Create a task with defaulted timestamps. The summary is validated here
    /// so that no code path can put an unnamed task in the cache.
    pub fn new<S: ToString, L: ToString>(id: S, list_id: L, summary: &str) -> CbResult<Self> {
        if summary.trim().is_empty() {
            return Err(CbError::invalid_input("task summary must not be empty"));
        }
        let now = Utc::now();
        Ok(Self {
            id: id.to_string(),
            list_id: list_id.to_string(),
            summary: summary.to_string(),
            description: None,
            status: TaskStatus::Todo,
            priority: 0,
            created_at: now,
            modified_at: now,
            completed_at: None,
            due: None,
            start: None,
            categories: Vec::new(),
            parent_id: None,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }
    pub fn list_id(&self) -> &str {
        &self.list_id
    }
    pub fn summary(&self) -> &str {
        &self.summary
    }
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
    pub fn status(&self) -> TaskStatus {
        self.status
    }
    pub fn priority(&self) -> u8 {
        self.priority
    }
    pub fn created_at(&self) -> &DateTime<Utc> {
        &self.created_at
    }
    pub fn modified_at(&self) -> &DateTime<Utc> {
        &self.modified_at
    }
    pub fn completed_at(&self) -> Option<&DateTime<Utc>> {
        self.completed_at.as_ref()
    }
    pub fn due(&self) -> Option<&TaskDate> {
        self.due.as_ref()
    }
    pub fn start(&self) -> Option<&TaskDate> {
        self.start.as_ref()
    }
    pub fn categories(&self) -> &[String] {
        &self.categories
    }
    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    /// Replace the identifier. Used when a remote assigns the authoritative id
    /// for a task that was created under a pending one.
    pub fn set_id<S: ToString>(&mut self, id: S) {
        self.id = id.to_string();
    }

    pub(crate) fn set_list_id<S: ToString>(&mut self, list_id: S) {
        self.list_id = list_id.to_string();
    }

    pub fn set_summary(&mut self, summary: &str) -> CbResult<()> {
        if summary.trim().is_empty() {
            return Err(CbError::invalid_input("task summary must not be empty"));
        }
        self.summary = summary.to_string();
        self.touch();
        Ok(())
    }

    pub fn set_description(&mut self, description: Option<String>) {
        self.description = description;
        self.touch();
    }

    /// Transition the status, maintaining the completion timestamp: entering
    /// `Done` stamps it, leaving `Done` clears it.
    pub fn set_status(&mut self, status: TaskStatus) {
        if self.status == status {
            return;
        }
        self.completed_at = match status {
            TaskStatus::Done => Some(Utc::now()),
            _ => None,
        };
        self.status = status;
        self.touch();
    }

    pub fn set_priority(&mut self, priority: u8) -> CbResult<()> {
        if priority > PRIORITY_MAX {
            return Err(CbError::invalid_input(format!(
                "priority {} is out of range 0..=9",
                priority
            )));
        }
        self.priority = priority;
        self.touch();
        Ok(())
    }

    pub fn set_due(&mut self, due: Option<TaskDate>) -> CbResult<()> {
        Self::check_window(self.start.as_ref(), due.as_ref())?;
        self.due = due;
        self.touch();
        Ok(())
    }

    pub fn set_start(&mut self, start: Option<TaskDate>) -> CbResult<()> {
        Self::check_window(start.as_ref(), self.due.as_ref())?;
        self.start = start;
        self.touch();
        Ok(())
    }

    pub fn set_categories(&mut self, categories: Vec<String>) {
        self.categories = categories;
        self.touch();
    }

    pub fn set_parent_id(&mut self, parent_id: Option<String>) {
        self.parent_id = parent_id;
        self.touch();
    }

    /// Overwrite both timestamps, for providers reconstructing a task from
    /// remote data that carries its own history.
    pub fn set_timestamps(&mut self, created_at: DateTime<Utc>, modified_at: DateTime<Utc>) {
        self.created_at = created_at;
        self.modified_at = modified_at;
    }

    /// Force the completion timestamp, for providers whose wire format carries one.
    /// Callers must keep the status invariant themselves; `validate` will catch slips.
    pub fn set_completed_at(&mut self, completed_at: Option<DateTime<Utc>>) {
        self.completed_at = completed_at;
    }

    fn touch(&mut self) {
        self.modified_at = Utc::now();
    }

    fn check_window(start: Option<&TaskDate>, due: Option<&TaskDate>) -> CbResult<()> {
        if let (Some(s), Some(d)) = (start, due) {
            if s.instant() > d.instant() {
                return Err(CbError::invalid_input(format!(
                    "start date {} is after due date {}",
                    s, d
                )));
            }
        }
        Ok(())
    }

    /// Check every model invariant at once. Providers call this after parsing
    /// remote data, the facade before committing user input.
    pub fn validate(&self) -> CbResult<()> {
        if self.summary.trim().is_empty() {
            return Err(CbError::invalid_input("task summary must not be empty"));
        }
        if self.priority > PRIORITY_MAX {
            return Err(CbError::invalid_input(format!(
                "priority {} is out of range 0..=9",
                self.priority
            )));
        }
        Self::check_window(self.start.as_ref(), self.due.as_ref())?;
        match (self.status, self.completed_at.is_some()) {
            (TaskStatus::Done, false) => Err(CbError::invalid_input(
                "a done task must carry a completion timestamp",
            )),
            (s, true) if s != TaskStatus::Done => Err(CbError::invalid_input(
                "only a done task may carry a completion timestamp",
            )),
            _ => Ok(()),
        }
    }

    /// Compare user-visible content, ignoring identifiers and timestamps.
    /// Mostly useful in tests that compare both ends after a sync.
    pub fn has_same_observable_content_as(&self, other: &Task) -> bool {
        self.summary == other.summary
            && self.description == other.description
            && self.status == other.status
            && self.priority == other.priority
            && self.due == other.due
            && self.start == other.start
            && self.categories == other.categories
    }
}

/// Validate a priority supplied as free-form user input, where values outside
/// the u8 range must be rejected rather than wrapped.
pub fn parse_priority_input(text: &str) -> CbResult<u8> {
    let n: i64 = text
        .trim()
        .parse()
        .map_err(|_| CbError::invalid_input(format!("{:?} is not a priority", text)))?;
    if !(0..=PRIORITY_MAX as i64).contains(&n) {
        return Err(CbError::invalid_input(format!(
            "priority {} is out of range 0..=9",
            n
        )));
    }
    Ok(n as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_must_not_be_empty() {
        assert!(Task::new("t1", "l1", "").is_err());
        assert!(Task::new("t1", "l1", "   ").is_err());
        assert!(Task::new("t1", "l1", "water the plants").is_ok());
    }

    #[test]
    fn priority_bounds() {
        let mut task = Task::new("t1", "l1", "x").unwrap();
        assert!(task.set_priority(0).is_ok());
        assert!(task.set_priority(9).is_ok());
        assert!(task.set_priority(10).is_err());

        assert_eq!(parse_priority_input("0").unwrap(), 0);
        assert_eq!(parse_priority_input("9").unwrap(), 9);
        assert!(parse_priority_input("-1").is_err());
        assert!(parse_priority_input("10").is_err());
        assert!(parse_priority_input("urgent").is_err());
    }

    #[test]
    fn completion_timestamp_follows_status() {
        let mut task = Task::new("t1", "l1", "x").unwrap();
        assert!(task.completed_at().is_none());

        task.set_status(TaskStatus::Done);
        assert!(task.completed_at().is_some());
        task.validate().unwrap();

        task.set_status(TaskStatus::InProgress);
        assert!(task.completed_at().is_none());
        task.validate().unwrap();
    }

    #[test]
    fn start_may_equal_due_but_not_exceed_it() {
        let mut task = Task::new("t1", "l1", "x").unwrap();
        let d = NaiveDate::from_ymd_opt(2026, 3, 14).unwrap();

        task.set_due(Some(TaskDate::AllDay(d))).unwrap();
        assert!(task.set_start(Some(TaskDate::AllDay(d))).is_ok());

        let later = d.succ_opt().unwrap();
        assert!(task.set_start(Some(TaskDate::AllDay(later))).is_err());
    }

    #[test]
    fn status_spellings() {
        assert_eq!(TaskStatus::parse_common("T"), Some(TaskStatus::Todo));
        assert_eq!(
            TaskStatus::parse_common("Processing"),
            Some(TaskStatus::InProgress)
        );
        assert_eq!(TaskStatus::parse_common("done"), Some(TaskStatus::Done));
        assert_eq!(TaskStatus::parse_common("C"), Some(TaskStatus::Cancelled));
        assert_eq!(TaskStatus::parse_common("someday"), None);
    }
}
