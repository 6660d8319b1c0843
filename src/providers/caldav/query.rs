//! Building REPORT calendar-query bodies from the canonical filter

use chrono::{DateTime, Utc};

use crate::model::{TaskFilter, TaskStatus};

/// The REPORT body for one list.
///
/// Whatever the query language can express is pushed to the server; the rest
/// (exclude-statuses, multi-status unions, created-after) is filtered
/// client-side by the caller re-running [`TaskFilter::matches`] on the result.
pub fn calendar_query_body(filter: &TaskFilter) -> String {
    let mut fragments = String::new();

    // CalDAV prop-filters combine with AND, so only a single requested status
    // can be expressed server-side; unions fall back to client-side filtering
    if let Some(statuses) = &filter.statuses {
        if statuses.len() == 1 {
            let status = statuses.iter().next().expect("len checked");
            fragments.push_str(&status_fragment(*status));
        }
    }

    if filter.due_after.is_some() || filter.due_before.is_some() {
        fragments.push_str(&time_range_fragment(filter.due_after, filter.due_before));
    }

    format!(
        r#"
    <c:calendar-query xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav">
        <d:prop>
            <d:getetag />
            <c:calendar-data />
        </d:prop>
        <c:filter>
            <c:comp-filter name="VCALENDAR">
                <c:comp-filter name="VTODO">
{}                </c:comp-filter>
            </c:comp-filter>
        </c:filter>
    </c:calendar-query>
"#,
        fragments
    )
}

fn status_fragment(status: TaskStatus) -> String {
    match status {
        // Open tasks are the ones a server never stamped as completed; many
        // servers omit STATUS entirely for them, so the reliable query is
        // "COMPLETED property is not defined"
        TaskStatus::Todo => String::from(
            "                    <c:prop-filter name=\"COMPLETED\">\n\
             \x20                       <c:is-not-defined />\n\
             \x20                   </c:prop-filter>\n",
        ),
        other => {
            let spelling = match other {
                TaskStatus::InProgress => "IN-PROCESS",
                TaskStatus::Done => "COMPLETED",
                TaskStatus::Cancelled => "CANCELLED",
                TaskStatus::Todo => unreachable!(),
            };
            format!(
                "                    <c:prop-filter name=\"STATUS\">\n\
                 \x20                       <c:text-match collation=\"i;ascii-casemap\">{}</c:text-match>\n\
                 \x20                   </c:prop-filter>\n",
                spelling
            )
        }
    }
}

fn time_range_fragment(after: Option<DateTime<Utc>>, before: Option<DateTime<Utc>>) -> String {
    let mut attrs = String::new();
    if let Some(start) = after {
        attrs.push_str(&format!(" start=\"{}\"", start.format("%Y%m%dT%H%M%SZ")));
    }
    if let Some(end) = before {
        attrs.push_str(&format!(" end=\"{}\"", end.format("%Y%m%dT%H%M%SZ")));
    }
    format!(
        "                    <c:prop-filter name=\"DUE\">\n\
         \x20                       <c:time-range{} />\n\
         \x20                   </c:prop-filter>\n",
        attrs
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn unconstrained_filter_queries_all_todos() {
        let body = calendar_query_body(&TaskFilter::all());
        assert!(body.contains("<c:comp-filter name=\"VTODO\">"));
        assert!(!body.contains("prop-filter"));
    }

    #[test]
    fn open_tasks_are_queried_by_missing_completion() {
        let body = calendar_query_body(&TaskFilter::with_statuses([TaskStatus::Todo]));
        assert!(body.contains("<c:prop-filter name=\"COMPLETED\">"));
        assert!(body.contains("<c:is-not-defined />"));
        assert!(!body.contains("text-match"));
    }

    #[test]
    fn named_statuses_use_a_text_match() {
        let body = calendar_query_body(&TaskFilter::with_statuses([TaskStatus::InProgress]));
        assert!(body.contains(">IN-PROCESS</c:text-match>"));
    }

    #[test]
    fn status_unions_stay_client_side() {
        let body = calendar_query_body(&TaskFilter::with_statuses([
            TaskStatus::Todo,
            TaskStatus::Done,
        ]));
        assert!(!body.contains("prop-filter"));
    }

    #[test]
    fn due_window_becomes_a_time_range() {
        let filter = TaskFilter {
            due_after: Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()),
            due_before: Some(Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap()),
            ..TaskFilter::default()
        };
        let body = calendar_query_body(&filter);
        assert!(body.contains("<c:prop-filter name=\"DUE\">"));
        assert!(body.contains("start=\"20260101T000000Z\""));
        assert!(body.contains("end=\"20260201T000000Z\""));
    }
}
