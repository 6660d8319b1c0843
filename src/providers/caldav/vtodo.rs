//! Translating the canonical task to and from iCalendar VTODO envelopes

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use ics::components::Parameter as IcsParameter;
use ics::components::Property as IcsProperty;
use ics::properties::{
    Categories, Completed, Created, Description, LastModified, PercentComplete, Priority,
    RelatedTo, Status, Summary,
};
use ics::{ICalendar, ToDo};

use crate::error::{CbError, CbResult};
use crate::model::{Task, TaskDate, TaskStatus};

const PROD_ID: &str = "-//corkboard//tasks//EN";

/// Build the single-VTODO iCalendar envelope a CalDAV server expects on PUT
pub fn build_vtodo(task: &Task, uid: &str) -> String {
    let s_last_modified = format_date_time(task.modified_at());

    let mut todo = ToDo::new(uid, s_last_modified.clone());
    todo.push(Created::new(format_date_time(task.created_at())));
    todo.push(LastModified::new(s_last_modified));
    todo.push(Summary::new(task.summary()));

    if let Some(description) = task.description() {
        todo.push(Description::new(description));
    }

    if task.priority() > 0 {
        todo.push(Priority::new(task.priority().to_string()));
    }

    if let Some(due) = task.due() {
        todo.push(date_property("DUE", due));
    }
    if let Some(start) = task.start() {
        todo.push(date_property("DTSTART", start));
    }

    if !task.categories().is_empty() {
        todo.push(Categories::new(task.categories().join(",")));
    }

    if let Some(parent) = task.parent_id() {
        let mut related = RelatedTo::new(parent);
        related.add(IcsParameter::new("RELTYPE", "PARENT"));
        todo.push(related);
    }

    match task.status() {
        TaskStatus::Todo => todo.push(Status::needs_action()),
        TaskStatus::InProgress => todo.push(Status::in_process()),
        TaskStatus::Cancelled => todo.push(Status::cancelled()),
        TaskStatus::Done => {
            todo.push(PercentComplete::new("100"));
            if let Some(dt) = task.completed_at() {
                todo.push(Completed::new(format_date_time(dt)));
            }
            todo.push(Status::completed());
        }
    }

    let mut calendar = ICalendar::new("2.0", PROD_ID);
    calendar.add_todo(todo);
    calendar.to_string()
}

fn date_property(name: &'static str, date: &TaskDate) -> IcsProperty<'static> {
    match date {
        TaskDate::AllDay(d) => {
            let mut prop = IcsProperty::new(name, d.format("%Y%m%d").to_string());
            prop.add(IcsParameter::new("VALUE", "DATE"));
            prop
        }
        TaskDate::At(dt) => IcsProperty::new(name, format_date_time(dt)),
    }
}

fn format_date_time(dt: &DateTime<Utc>) -> String {
    dt.format("%Y%m%dT%H%M%SZ").to_string()
}

/// Parse a VTODO envelope fetched from a CalDAV server into a canonical task.
///
/// `item` names the resource in error messages, `list_id` becomes the task's
/// list. The identifier is the VTODO UID.
pub fn parse_vtodo(content: &str, list_id: &str, item: &str) -> CbResult<Task> {
    let mut reader = ical::IcalParser::new(content.as_bytes());
    let parsed = match reader.next() {
        None => {
            return Err(CbError::IcalParse {
                item: item.to_string(),
                detail: "empty calendar data".into(),
            })
        }
        Some(Err(err)) => {
            return Err(CbError::IcalParse {
                item: item.to_string(),
                detail: err.to_string(),
            })
        }
        Some(Ok(calendar)) => calendar,
    };

    let todo = parsed.todos.first().ok_or_else(|| CbError::IcalParse {
        item: item.to_string(),
        detail: "no VTODO component".into(),
    })?;

    let mut uid = None;
    let mut summary = None;
    let mut description = None;
    let mut status = TaskStatus::Todo;
    let mut priority = 0u8;
    let mut created = None;
    let mut last_modified = None;
    let mut completed_at = None;
    let mut due = None;
    let mut start = None;
    let mut categories = Vec::new();
    let mut parent = None;

    for prop in &todo.properties {
        match prop.name.as_str() {
            "UID" => uid = prop.value.clone(),
            "SUMMARY" => summary = prop.value.clone(),
            "DESCRIPTION" => description = prop.value.clone(),
            "STATUS" => {
                status = match prop.value.as_deref() {
                    Some("COMPLETED") => TaskStatus::Done,
                    Some("IN-PROCESS") => TaskStatus::InProgress,
                    Some("CANCELLED") => TaskStatus::Cancelled,
                    _ => TaskStatus::Todo,
                }
            }
            "PRIORITY" => {
                // RFC5545 priorities already are 0 (undefined) to 9 (lowest);
                // anything unparseable degrades to undefined
                priority = prop
                    .value
                    .as_deref()
                    .and_then(|v| v.parse::<u8>().ok())
                    .filter(|p| *p <= 9)
                    .unwrap_or(0);
            }
            "CREATED" => created = parse_date_time_value(&prop.value),
            // DTSTAMP and LAST-MODIFIED carry the same meaning for a VTODO
            "DTSTAMP" | "LAST-MODIFIED" => {
                last_modified = parse_date_time_value(&prop.value).or(last_modified)
            }
            "COMPLETED" => completed_at = parse_date_time_value(&prop.value),
            "DUE" => due = parse_task_date(&prop.value),
            "DTSTART" => start = parse_task_date(&prop.value),
            "CATEGORIES" => {
                if let Some(value) = &prop.value {
                    categories = value
                        .split(',')
                        .map(|c| c.trim().to_string())
                        .filter(|c| !c.is_empty())
                        .collect();
                }
            }
            "RELATED-TO" => {
                let reltype = prop.params.as_ref().and_then(|params| {
                    params
                        .iter()
                        .find(|(name, _)| name == "RELTYPE")
                        .and_then(|(_, values)| values.first().cloned())
                });
                // RELTYPE defaults to PARENT when absent
                if reltype.as_deref().unwrap_or("PARENT") == "PARENT" {
                    parent = prop.value.clone();
                }
            }
            _ => {}
        }
    }

    let uid = uid.ok_or_else(|| CbError::IcalParse {
        item: item.to_string(),
        detail: "missing UID".into(),
    })?;
    let summary = summary.ok_or_else(|| CbError::IcalParse {
        item: item.to_string(),
        detail: "missing SUMMARY".into(),
    })?;

    let mut task = Task::new(&uid, list_id, &summary).map_err(|err| CbError::IcalParse {
        item: item.to_string(),
        detail: err.to_string(),
    })?;
    task.set_description(description);
    task.set_status(status);
    let _ = task.set_priority(priority);
    // Windows are set together; a server sending start > due keeps only the due
    let _ = task.set_due(due);
    if task.set_start(start).is_err() {
        log::warn!("Task {} has a start date after its due date, dropping the start", uid);
    }
    task.set_categories(categories);
    task.set_parent_id(parent);

    let now = Utc::now();
    task.set_timestamps(created.unwrap_or(now), last_modified.unwrap_or(now));
    if status == TaskStatus::Done {
        task.set_completed_at(Some(completed_at.unwrap_or(now)));
    } else {
        if completed_at.is_some() {
            log::warn!(
                "Task {:?} carries a COMPLETED timestamp but its STATUS is not completed",
                uid
            );
        }
        task.set_completed_at(None);
    }

    task.validate()?;
    Ok(task)
}

fn parse_date_time(s: &str) -> Option<DateTime<Utc>> {
    Utc.datetime_from_str(s, "%Y%m%dT%H%M%SZ")
        .or_else(|_| Utc.datetime_from_str(s, "%Y%m%dT%H%M%S"))
        .ok()
}

fn parse_date_time_value(value: &Option<String>) -> Option<DateTime<Utc>> {
    value.as_deref().and_then(|s| {
        let parsed = parse_date_time(s);
        if parsed.is_none() {
            log::warn!("Invalid timestamp: {}", s);
        }
        parsed
    })
}

fn parse_task_date(value: &Option<String>) -> Option<TaskDate> {
    let s = value.as_deref()?;
    if s.len() == 8 {
        NaiveDate::parse_from_str(s, "%Y%m%d").ok().map(TaskDate::AllDay)
    } else {
        parse_date_time(s).map(TaskDate::At)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_and_parses_back() {
        let mut task = Task::new("ignored", "errands", "Buy envelopes").unwrap();
        task.set_description(Some("The padded kind".into()));
        task.set_priority(3).unwrap();
        task.set_status(TaskStatus::InProgress);
        task.set_due(Some(TaskDate::AllDay(
            NaiveDate::from_ymd_opt(2026, 9, 1).unwrap(),
        )))
        .unwrap();
        task.set_categories(vec!["shopping".into(), "office".into()]);
        task.set_parent_id(Some("srv-parent".into()));

        let ical_text = build_vtodo(&task, "uid-123");
        assert!(ical_text.contains("BEGIN:VTODO"));
        assert!(ical_text.contains("UID:uid-123"));
        assert!(ical_text.contains("STATUS:IN-PROCESS"));
        assert!(ical_text.contains("DUE;VALUE=DATE:20260901"));

        let parsed = parse_vtodo(&ical_text, "errands", "uid-123.ics").unwrap();
        assert_eq!(parsed.id(), "uid-123");
        assert_eq!(parsed.list_id(), "errands");
        assert!(parsed.has_same_observable_content_as(&task));
        assert_eq!(parsed.parent_id(), Some("srv-parent"));
    }

    #[test]
    fn done_tasks_carry_their_completion_stamp() {
        let mut task = Task::new("x", "l", "Mail the letter").unwrap();
        task.set_status(TaskStatus::Done);

        let ical_text = build_vtodo(&task, "uid-9");
        assert!(ical_text.contains("STATUS:COMPLETED"));
        assert!(ical_text.contains("PERCENT-COMPLETE:100"));
        assert!(ical_text.contains("COMPLETED:"));

        let parsed = parse_vtodo(&ical_text, "l", "uid-9.ics").unwrap();
        assert_eq!(parsed.status(), TaskStatus::Done);
        assert!(parsed.completed_at().is_some());
        parsed.validate().unwrap();
    }

    #[test]
    fn foreign_envelopes_parse_without_optional_fields() {
        let foreign = "BEGIN:VCALENDAR\r\n\
            VERSION:2.0\r\n\
            PRODID:-//Nextcloud Tasks//EN\r\n\
            BEGIN:VTODO\r\n\
            UID:abc-def\r\n\
            DTSTAMP:20260110T120000Z\r\n\
            SUMMARY:Shovel the driveway\r\n\
            STATUS:NEEDS-ACTION\r\n\
            END:VTODO\r\n\
            END:VCALENDAR\r\n";

        let task = parse_vtodo(foreign, "chores", "abc-def.ics").unwrap();
        assert_eq!(task.id(), "abc-def");
        assert_eq!(task.summary(), "Shovel the driveway");
        assert_eq!(task.status(), TaskStatus::Todo);
        assert_eq!(task.priority(), 0);
        assert!(task.due().is_none());
    }

    #[test]
    fn missing_uid_is_an_error() {
        let bad = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nPRODID:x\r\nBEGIN:VTODO\r\nDTSTAMP:20260110T120000Z\r\nSUMMARY:No uid\r\nEND:VTODO\r\nEND:VCALENDAR\r\n";
        assert!(parse_vtodo(bad, "l", "x.ics").is_err());
    }
}
