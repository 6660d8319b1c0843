//! The REST provider: JSON task APIs behind a bearer token
//!
//! The remote follows the conventional projects/tasks shape with per-action
//! endpoints (`close`, `reopen`). Its data model is poorer than the canonical
//! one: only open/closed statuses (the other two ride along as labels) and a
//! 1-4 priority scale, so the translation layer here is where the fidelity
//! decisions live.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use csscolorparser::Color;
use http::Method;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::BackendConfig;
use crate::credentials;
use crate::error::{CbError, CbResult};
use crate::model::{Task, TaskDate, TaskFilter, TaskList, TaskStatus};
use crate::traits::{SourceCapabilities, TaskSource};

const HTTP_TIMEOUT: Duration = Duration::from_secs(8);

/// Label spellings used to round-trip the statuses the remote cannot store
const LABEL_IN_PROGRESS: &str = "in-progress";
const LABEL_CANCELLED: &str = "cancelled";

#[derive(Clone, Debug, Serialize, Deserialize)]
struct RestProject {
    id: String,
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    color: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct RestDue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    datetime: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
struct RestTask {
    id: String,
    project_id: String,
    content: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    is_completed: bool,
    /// Remote scale: 1 (default) to 4 (urgent)
    #[serde(default)]
    priority: u8,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    due: Option<RestDue>,
    #[serde(default)]
    parent_id: Option<String>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    completed_at: Option<DateTime<Utc>>,
}

/// The write shape. Creation never includes a client-chosen identifier; the
/// server assigns one and returns it in the response body.
#[derive(Clone, Debug, Default, Serialize)]
struct RestTaskWrite {
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    project_id: Option<String>,
    priority: u8,
    labels: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    due_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    due_datetime: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_id: Option<String>,
}

/// canonical 1-2 are urgent, 3-4 high, 5-6 medium, everything else low.
/// Undefined (0) writes as the remote default.
fn priority_to_remote(priority: u8) -> u8 {
    match priority {
        1 | 2 => 4,
        3 | 4 => 3,
        5 | 6 => 2,
        _ => 1,
    }
}

/// The inverse, with the remote default (1) reading back as "no signal"
fn priority_from_remote(priority: u8) -> u8 {
    match priority {
        4 => 1,
        3 => 3,
        2 => 5,
        _ => 0,
    }
}

/// The canonical status is derived from (closed?, labels)
fn status_from_remote(is_completed: bool, labels: &[String]) -> TaskStatus {
    let has = |l: &str| labels.iter().any(|x| x == l);
    match (is_completed, has(LABEL_CANCELLED), has(LABEL_IN_PROGRESS)) {
        (true, true, _) => TaskStatus::Cancelled,
        (true, false, _) => TaskStatus::Done,
        (false, _, true) => TaskStatus::InProgress,
        (false, _, false) => TaskStatus::Todo,
    }
}

/// Whether a canonical status lands on the closed side of the remote
fn status_is_closed(status: TaskStatus) -> bool {
    matches!(status, TaskStatus::Done | TaskStatus::Cancelled)
}

/// The label set for a task: its categories plus the status rider labels
fn labels_for(task: &Task) -> Vec<String> {
    let mut labels: Vec<String> = task
        .categories()
        .iter()
        .filter(|c| c.as_str() != LABEL_IN_PROGRESS && c.as_str() != LABEL_CANCELLED)
        .cloned()
        .collect();
    match task.status() {
        TaskStatus::InProgress => labels.push(LABEL_IN_PROGRESS.to_string()),
        TaskStatus::Cancelled => labels.push(LABEL_CANCELLED.to_string()),
        _ => {}
    }
    labels
}

fn write_shape(task: &Task, project_id: Option<&str>) -> RestTaskWrite {
    let (due_date, due_datetime) = match task.due() {
        Some(TaskDate::AllDay(d)) => (Some(d.format("%Y-%m-%d").to_string()), None),
        Some(TaskDate::At(dt)) => (None, Some(dt.to_rfc3339())),
        None => (None, None),
    };
    RestTaskWrite {
        content: task.summary().to_string(),
        description: task.description().map(|d| d.to_string()),
        project_id: project_id.map(|p| p.to_string()),
        priority: priority_to_remote(task.priority()),
        labels: labels_for(task),
        due_date,
        due_datetime,
        parent_id: task.parent_id().map(|p| p.to_string()),
    }
}

fn canonical_task(remote: RestTask, list_id: &str) -> CbResult<Task> {
    let mut task = Task::new(&remote.id, list_id, &remote.content)?;
    task.set_description(remote.description.clone().filter(|d| !d.is_empty()));

    let status = status_from_remote(remote.is_completed, &remote.labels);
    task.set_status(status);
    task.set_priority(priority_from_remote(remote.priority))?;

    let due = remote.due.as_ref().and_then(|due| {
        if let Some(datetime) = due.datetime.as_deref() {
            DateTime::parse_from_rfc3339(datetime)
                .ok()
                .map(|dt| TaskDate::At(dt.with_timezone(&Utc)))
        } else {
            due.date
                .as_deref()
                .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
                .map(TaskDate::AllDay)
        }
    });
    task.set_due(due)?;

    task.set_categories(
        remote
            .labels
            .iter()
            .filter(|l| l.as_str() != LABEL_IN_PROGRESS && l.as_str() != LABEL_CANCELLED)
            .cloned()
            .collect(),
    );
    task.set_parent_id(remote.parent_id.clone());

    let created = remote.created_at.unwrap_or_else(Utc::now);
    task.set_timestamps(created, Utc::now());
    if status == TaskStatus::Done {
        task.set_completed_at(Some(remote.completed_at.unwrap_or_else(Utc::now)));
    } else {
        task.set_completed_at(None);
    }
    task.validate()?;
    Ok(task)
}

/// The ordered requests that replace one task.
///
/// The remote rejects field edits on closed items, so the edit's place in the
/// sequence depends on which side of open/closed the task ends up: a task
/// staying (or landing) closed is edited first and closed last, while a task
/// ending up open is reopened first so the edit hits an editable item.
/// Reopening an already-open item is a no-op on this API family.
fn update_plan(task: &Task) -> CbResult<Vec<(Method, String, Option<serde_json::Value>)>> {
    let body = serde_json::to_value(write_shape(task, None))
        .map_err(|err| CbError::invalid_input(err.to_string()))?;
    let edit = (Method::POST, format!("tasks/{}", task.id()), Some(body));
    let action = |verb: &str| -> (Method, String, Option<serde_json::Value>) {
        (Method::POST, format!("tasks/{}/{}", task.id(), verb), None)
    };

    Ok(if status_is_closed(task.status()) {
        vec![edit, action("close")]
    } else {
        vec![action("reopen"), edit]
    })
}

/// Map an error reply the way this API family reports problems: some answers
/// carry no body at all, some only say "not found" in prose
fn map_rest_error(status: StatusCode, body: &str, context: &'static str, id: &str) -> CbError {
    if body.to_ascii_lowercase().contains("not found") {
        return CbError::NotFound {
            what: context,
            id: id.to_string(),
        };
    }
    CbError::from_status(status, context, id, body)
}

/// A task source backed by a bearer-token REST API
#[derive(Debug)]
pub struct RestRemote {
    backend_name: String,
    base_url: Url,
    token: String,
    client: reqwest::Client,
}

impl RestRemote {
    pub fn new(config: &BackendConfig) -> CbResult<Self> {
        let creds = credentials::resolve(config);
        let token = creds.token.or(creds.password).ok_or_else(|| CbError::Unauthorized {
            context: format!("backend {} (no API token found)", config.name),
        })?;

        let base = config
            .url
            .as_deref()
            .ok_or_else(|| CbError::invalid_input(format!("backend {} has no url", config.name)))?;
        let mut base_url = Url::parse(base)
            .map_err(|err| CbError::invalid_input(format!("bad url {:?}: {}", base, err)))?;
        // Embedded credentials are only a credential source, never sent on the wire
        let _ = base_url.set_username("");
        let _ = base_url.set_password(None);
        if !base_url.path().ends_with('/') {
            base_url.set_path(&format!("{}/", base_url.path()));
        }

        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|err| CbError::transient(format!("cannot build an HTTP client: {}", err)))?;

        Ok(Self {
            backend_name: config.name.clone(),
            base_url,
            token,
            client,
        })
    }

    fn endpoint(&self, path: &str) -> CbResult<Url> {
        self.base_url
            .join(path)
            .map_err(|err| CbError::invalid_input(format!("bad endpoint {:?}: {}", path, err)))
    }

    /// One JSON request; the bearer token only ever travels in the header
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
        context: &'static str,
        id: &str,
    ) -> CbResult<(StatusCode, String)> {
        let url = self.endpoint(path)?;
        let mut request = self
            .client
            .request(method.clone(), url.clone())
            .bearer_auth(&self.token);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|source| CbError::HttpRequest {
                url: url.clone(),
                method: method.clone(),
                source,
            })?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|source| CbError::HttpRequest {
                url,
                method,
                source,
            })?;
        if !status.is_success() {
            return Err(map_rest_error(status, &text, context, id));
        }
        Ok((status, text))
    }

    fn parse_json<T: serde::de::DeserializeOwned>(text: &str, what: &'static str) -> CbResult<T> {
        serde_json::from_str(text).map_err(|err| CbError::Remote {
            status: StatusCode::OK,
            snippet: format!("unparseable {} payload: {}", what, err),
        })
    }
}

#[async_trait]
impl TaskSource for RestRemote {
    async fn list_lists(&self) -> CbResult<Vec<TaskList>> {
        let (_, text) = self
            .request(Method::GET, "projects", None, "project", "")
            .await?;
        let projects: Vec<RestProject> = Self::parse_json(&text, "project list")?;
        Ok(projects
            .into_iter()
            .map(|p| {
                let color = p.color.as_deref().and_then(|c| csscolorparser::parse(c).ok());
                TaskList::new(&p.id, &p.name).with_color(color)
            })
            .collect())
    }

    async fn get_tasks(&self, list_id: &str, filter: &TaskFilter) -> CbResult<Vec<Task>> {
        let path = format!("tasks?project_id={}", list_id);
        let (_, text) = self.request(Method::GET, &path, None, "list", list_id).await?;
        let remote_tasks: Vec<RestTask> = Self::parse_json(&text, "task list")?;

        let mut tasks = Vec::new();
        for remote in remote_tasks {
            match canonical_task(remote, list_id) {
                Ok(task) => {
                    if filter.matches(&task) {
                        tasks.push(task);
                    }
                }
                Err(err) => log::warn!("Skipping an unparseable remote task: {}", err),
            }
        }
        Ok(tasks)
    }

    async fn add_task(&mut self, list_id: &str, task: &Task) -> CbResult<String> {
        let body = serde_json::to_value(write_shape(task, Some(list_id)))
            .map_err(|err| CbError::invalid_input(err.to_string()))?;
        let (_, text) = self
            .request(Method::POST, "tasks", Some(body), "task", task.id())
            .await?;
        let created: RestTask = Self::parse_json(&text, "created task")?;

        // The remote cannot represent a closed state at creation time
        if status_is_closed(task.status()) {
            let path = format!("tasks/{}/close", created.id);
            self.request(Method::POST, &path, None, "task", &created.id)
                .await?;
        }
        Ok(created.id)
    }

    async fn update_task(&mut self, list_id: &str, task: &Task) -> CbResult<()> {
        let _ = list_id;
        for (method, path, body) in update_plan(task)? {
            self.request(method, &path, body, "task", task.id()).await?;
        }
        Ok(())
    }

    async fn delete_task(&mut self, list_id: &str, task_id: &str) -> CbResult<()> {
        let _ = list_id;
        let path = format!("tasks/{}", task_id);
        self.request(Method::DELETE, &path, None, "task", task_id)
            .await?;
        Ok(())
    }

    async fn create_list(
        &mut self,
        name: &str,
        description: Option<&str>,
        color: Option<&Color>,
    ) -> CbResult<String> {
        // The project shape has no description field; it is dropped here
        let _ = description;
        let mut body = serde_json::json!({ "name": name });
        if let Some(color) = color {
            body["color"] = serde_json::Value::String(color.to_hex_string());
        }
        let (_, text) = self
            .request(Method::POST, "projects", Some(body), "project", name)
            .await?;
        let project: RestProject = Self::parse_json(&text, "created project")?;
        Ok(project.id)
    }

    async fn delete_list(&mut self, list_id: &str) -> CbResult<()> {
        let path = format!("projects/{}", list_id);
        self.request(Method::DELETE, &path, None, "project", list_id)
            .await?;
        Ok(())
    }

    async fn rename_list(&mut self, list_id: &str, new_name: &str) -> CbResult<()> {
        let path = format!("projects/{}", list_id);
        let body = serde_json::json!({ "name": new_name });
        self.request(Method::POST, &path, Some(body), "project", list_id)
            .await?;
        Ok(())
    }

    fn parse_status_input(&self, text: &str) -> CbResult<TaskStatus> {
        // This family talks in open/closed
        match text.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(TaskStatus::Todo),
            "closed" => Ok(TaskStatus::Done),
            _ => TaskStatus::parse_common(text)
                .ok_or_else(|| CbError::invalid_input(format!("unknown status {:?}", text))),
        }
    }

    fn status_display(&self, status: TaskStatus) -> String {
        match status {
            TaskStatus::Todo => "open",
            TaskStatus::InProgress => "open (in-progress)",
            TaskStatus::Done => "closed",
            TaskStatus::Cancelled => "closed (cancelled)",
        }
        .to_string()
    }

    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities::RENAME
    }

    fn display_name(&self) -> String {
        self.backend_name.clone()
    }

    fn type_tag(&self) -> &'static str {
        "rest"
    }

    fn context(&self) -> String {
        self.base_url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_mapping_is_the_documented_table() {
        // write side
        assert_eq!(priority_to_remote(0), 1);
        assert_eq!(priority_to_remote(1), 4);
        assert_eq!(priority_to_remote(2), 4);
        assert_eq!(priority_to_remote(3), 3);
        assert_eq!(priority_to_remote(4), 3);
        assert_eq!(priority_to_remote(5), 2);
        assert_eq!(priority_to_remote(6), 2);
        assert_eq!(priority_to_remote(7), 1);
        assert_eq!(priority_to_remote(9), 1);
        // read side: the remote default carries no signal
        assert_eq!(priority_from_remote(4), 1);
        assert_eq!(priority_from_remote(3), 3);
        assert_eq!(priority_from_remote(2), 5);
        assert_eq!(priority_from_remote(1), 0);
        assert_eq!(priority_from_remote(0), 0);
    }

    #[test]
    fn status_is_synthesized_from_closed_flag_and_labels() {
        let labels = |l: &[&str]| l.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        assert_eq!(status_from_remote(false, &labels(&[])), TaskStatus::Todo);
        assert_eq!(
            status_from_remote(false, &labels(&["in-progress"])),
            TaskStatus::InProgress
        );
        assert_eq!(status_from_remote(true, &labels(&[])), TaskStatus::Done);
        assert_eq!(
            status_from_remote(true, &labels(&["cancelled"])),
            TaskStatus::Cancelled
        );
        // An open task keeps a stale cancelled label readable as open
        assert_eq!(
            status_from_remote(false, &labels(&["cancelled"])),
            TaskStatus::Todo
        );
    }

    #[test]
    fn labels_carry_categories_plus_status_riders() {
        let mut task = Task::new("t", "l", "x").unwrap();
        task.set_categories(vec!["errand".into()]);
        task.set_status(TaskStatus::InProgress);
        assert_eq!(labels_for(&task), vec!["errand", "in-progress"]);

        task.set_status(TaskStatus::Done);
        assert_eq!(labels_for(&task), vec!["errand"]);
    }

    #[test]
    fn write_shape_has_no_identifier_field() {
        let mut task = Task::new("pending-12", "l", "Renew the passport").unwrap();
        task.set_priority(1).unwrap();
        task.set_due(Some(TaskDate::AllDay(
            NaiveDate::from_ymd_opt(2026, 4, 2).unwrap(),
        )))
        .unwrap();

        let value = serde_json::to_value(write_shape(&task, Some("proj-1"))).unwrap();
        let object = value.as_object().unwrap();
        assert!(!object.contains_key("id"));
        assert_eq!(object["content"], "Renew the passport");
        assert_eq!(object["project_id"], "proj-1");
        assert_eq!(object["priority"], 4);
        assert_eq!(object["due_date"], "2026-04-02");
        assert!(!object.contains_key("due_datetime"));
    }

    #[test]
    fn remote_payload_roundtrips_to_canonical() {
        let payload = r#"{
            "id": "7001",
            "project_id": "p1",
            "content": "Book the ferry",
            "description": "",
            "is_completed": false,
            "priority": 3,
            "labels": ["travel", "in-progress"],
            "due": { "date": "2026-07-10" },
            "parent_id": "7000",
            "created_at": "2026-06-01T08:00:00Z"
        }"#;
        let remote: RestTask = serde_json::from_str(payload).unwrap();
        let task = canonical_task(remote, "p1").unwrap();

        assert_eq!(task.id(), "7001");
        assert_eq!(task.status(), TaskStatus::InProgress);
        assert_eq!(task.priority(), 3);
        assert_eq!(task.categories(), ["travel"]);
        assert_eq!(task.parent_id(), Some("7000"));
        assert_eq!(
            task.due(),
            Some(&TaskDate::AllDay(NaiveDate::from_ymd_opt(2026, 7, 10).unwrap()))
        );
    }

    #[test]
    fn closing_updates_edit_first_then_close() {
        let mut task = Task::new("7001", "p1", "Book the ferry").unwrap();
        task.set_status(TaskStatus::Done);

        let plan = update_plan(&task).unwrap();
        let paths: Vec<&str> = plan.iter().map(|(_, path, _)| path.as_str()).collect();
        assert_eq!(paths, ["tasks/7001", "tasks/7001/close"]);
        // The field edit carries the body, the action does not
        assert!(plan[0].2.is_some());
        assert!(plan[1].2.is_none());

        task.set_status(TaskStatus::Cancelled);
        let paths: Vec<String> = update_plan(&task)
            .unwrap()
            .into_iter()
            .map(|(_, path, _)| path)
            .collect();
        assert_eq!(paths, ["tasks/7001", "tasks/7001/close"]);
    }

    #[test]
    fn reopening_updates_reopen_first_then_edit() {
        // A task that is (or may still be) closed remotely must be reopened
        // before the field edit, or the edit bounces off the closed item
        let mut task = Task::new("7001", "p1", "Book the ferry").unwrap();
        task.set_status(TaskStatus::Done);
        task.set_status(TaskStatus::InProgress);

        let plan = update_plan(&task).unwrap();
        let paths: Vec<&str> = plan.iter().map(|(_, path, _)| path.as_str()).collect();
        assert_eq!(paths, ["tasks/7001/reopen", "tasks/7001"]);
        assert!(plan[0].2.is_none());
        assert!(plan[1].2.is_some());

        // Plain open tasks get the same safe order
        let open = Task::new("7002", "p1", "Pack").unwrap();
        let paths: Vec<String> = update_plan(&open)
            .unwrap()
            .into_iter()
            .map(|(_, path, _)| path)
            .collect();
        assert_eq!(paths, ["tasks/7002/reopen", "tasks/7002"]);
    }

    #[test]
    fn error_bodies_saying_not_found_map_to_the_kind() {
        let err = map_rest_error(StatusCode::BAD_REQUEST, "Task not found", "task", "t9");
        assert!(matches!(err, CbError::NotFound { .. }));

        let bare = map_rest_error(StatusCode::BAD_REQUEST, "", "task", "t9");
        assert!(!matches!(bare, CbError::NotFound { .. }));
    }

    #[test]
    fn token_never_lands_in_the_url() {
        std::env::set_var("CORKBOARD_REST_UNIT_TOKEN", "tk-secret");
        let mut config = BackendConfig::new("rest-unit", "rest");
        config.url = Some("https://user:pw@tasks.example.com/api/v1".into());

        let remote = RestRemote::new(&config).unwrap();
        assert_eq!(remote.base_url.username(), "");
        assert!(remote.base_url.password().is_none());
        assert!(remote.base_url.path().ends_with('/'));
    }
}
