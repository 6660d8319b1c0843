//! The CalDAV provider: VTODO items over WebDAV with calendar extensions

pub mod query;
pub mod vtodo;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use csscolorparser::Color;
use http::Method;
use minidom::Element;
use reqwest::header::{CONTENT_TYPE, HeaderValue};
use reqwest::StatusCode;
use url::Url;

use crate::config::BackendConfig;
use crate::credentials;
use crate::error::{CbError, CbResult};
use crate::model::{Task, TaskFilter, TaskList, TaskStatus};
use crate::traits::{SourceCapabilities, TaskSource};
use crate::utils::xml::{find_elem, find_elems};

/// Inner per-request deadline; the dispatcher's outer per-remote deadline is 10 s
const HTTP_TIMEOUT: Duration = Duration::from_secs(8);

/// Plain HTTP is only ever allowed on these ports
const HTTP_PORT_WHITELIST: [u16; 3] = [80, 8080, 8000];

static HTTP_WARNING_EMITTED: AtomicBool = AtomicBool::new(false);
static TLS_WARNING_EMITTED: AtomicBool = AtomicBool::new(false);

static LIST_DISCOVERY_BODY: &str = r#"
    <d:propfind xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav" xmlns:cs="http://calendarserver.org/ns/" xmlns:x1="http://apple.com/ns/ical/" xmlns:nc="http://nextcloud.com/ns">
       <d:prop>
         <d:displayname />
         <d:resourcetype />
         <cs:getctag />
         <c:supported-calendar-component-set />
         <c:calendar-description />
         <x1:calendar-color />
         <nc:deleted-at />
       </d:prop>
    </d:propfind>
"#;

/// A URL plus the credentials needed to dereference it
#[derive(Clone, Debug)]
struct DavEndpoint {
    url: Url,
    username: String,
    password: String,
}

/// A task source backed by a CalDAV collection
/// (`{scheme}://{host}/remote.php/dav/calendars/{user}/`)
#[derive(Debug)]
pub struct CalDavRemote {
    backend_name: String,
    root: DavEndpoint,
    client: reqwest::Client,
}

impl CalDavRemote {
    pub fn new(config: &BackendConfig) -> CbResult<Self> {
        let creds = credentials::resolve(config);
        let host = creds
            .host
            .clone()
            .ok_or_else(|| CbError::invalid_input(format!("backend {} has no host", config.name)))?;
        let username = creds.username.clone().ok_or_else(|| {
            CbError::invalid_input(format!("backend {} has no username", config.name))
        })?;
        let password = creds.password.clone().unwrap_or_default();

        let scheme = Self::pick_scheme(config, &host)?;
        let root_url = Url::parse(&format!(
            "{}://{}/remote.php/dav/calendars/{}/",
            scheme, host, username
        ))
        .map_err(|err| CbError::invalid_input(format!("bad host {:?}: {}", host, err)))?;

        let mut builder = reqwest::Client::builder().timeout(HTTP_TIMEOUT);
        if config.insecure_tls {
            if !config.suppress_insecure_tls_warning
                && !TLS_WARNING_EMITTED.swap(true, Ordering::SeqCst)
            {
                eprintln!(
                    "WARNING: TLS certificate verification is disabled for backend {}",
                    config.name
                );
            }
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder.build().map_err(|err| {
            CbError::transient(format!("cannot build an HTTP client: {}", err))
        })?;

        Ok(Self {
            backend_name: config.name.clone(),
            root: DavEndpoint {
                url: root_url,
                username,
                password,
            },
            client,
        })
    }

    /// HTTPS unless plain HTTP is explicitly allowed *and* the port is whitelisted
    fn pick_scheme(config: &BackendConfig, host: &str) -> CbResult<&'static str> {
        if !config.allow_http {
            return Ok("https");
        }
        let probe = Url::parse(&format!("http://{}/", host))
            .map_err(|err| CbError::invalid_input(format!("bad host {:?}: {}", host, err)))?;
        match probe.port_or_known_default() {
            Some(port) if HTTP_PORT_WHITELIST.contains(&port) => {
                if !config.suppress_allow_http_warning
                    && !HTTP_WARNING_EMITTED.swap(true, Ordering::SeqCst)
                {
                    eprintln!(
                        "WARNING: backend {} uses unencrypted HTTP on port {}; credentials travel in the clear",
                        config.name, port
                    );
                }
                Ok("http")
            }
            _ => Ok("https"),
        }
    }

    fn list_endpoint(&self, list_id: &str) -> CbResult<DavEndpoint> {
        let url = self
            .root
            .url
            .join(&format!("{}/", list_id))
            .map_err(|err| CbError::invalid_input(format!("bad list id {:?}: {}", list_id, err)))?;
        Ok(DavEndpoint {
            url,
            username: self.root.username.clone(),
            password: self.root.password.clone(),
        })
    }

    fn task_url(&self, list_id: &str, task_id: &str) -> CbResult<Url> {
        Ok(self
            .list_endpoint(list_id)?
            .url
            .join(&format!("{}.ics", task_id))
            .map_err(|err| CbError::invalid_input(format!("bad task id {:?}: {}", task_id, err)))?)
    }

    fn trash_url(&self, list_id: &str) -> CbResult<Url> {
        let trash = format!(
            "/remote.php/dav/trashbin/{}/calendars/{}",
            self.root.username, list_id
        );
        let mut url = self.root.url.clone();
        url.set_path(&trash);
        Ok(url)
    }

    async fn dav_request(
        &self,
        method: Method,
        endpoint: &DavEndpoint,
        body: String,
        depth: Option<u32>,
        extra: &[(&'static str, String)],
    ) -> CbResult<(StatusCode, String)> {
        let url = endpoint.url.clone();
        let mut request = self
            .client
            .request(method.clone(), url.clone())
            .header(CONTENT_TYPE, "application/xml")
            .basic_auth(&endpoint.username, Some(&endpoint.password))
            .body(body);
        if let Some(depth) = depth {
            request = request.header("Depth", depth);
        }
        for (name, value) in extra {
            request = request.header(*name, HeaderValue::from_str(value).map_err(|err| {
                CbError::invalid_input(format!("bad header value for {}: {}", name, err))
            })?);
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
        Ok((status, text))
    }

    /// Issue a request and pull every `<{item}>` element out of the multistatus reply
    async fn request_and_extract_elems(
        &self,
        method: &str,
        endpoint: &DavEndpoint,
        body: String,
        depth: u32,
        item: &str,
    ) -> CbResult<Vec<Element>> {
        let method: Method = method.parse().expect("invalid method name");
        let (status, text) = self
            .dav_request(method, endpoint, body, Some(depth), &[])
            .await?;
        if !status.is_success() {
            return Err(CbError::from_status(status, "collection", endpoint.url.as_str(), &text));
        }

        let element: Element = text
            .parse()
            .map_err(|source| CbError::DomParse { text, source })?;
        Ok(find_elems(&element, item)
            .iter()
            .map(|elem| (*elem).clone())
            .collect())
    }

    async fn discover_lists(&self) -> CbResult<Vec<TaskList>> {
        let responses = self
            .request_and_extract_elems(
                "PROPFIND",
                &self.root,
                LIST_DISCOVERY_BODY.to_string(),
                1,
                "response",
            )
            .await?;

        let mut lists = Vec::new();
        for response in responses {
            let href = match find_elem(&response, "href") {
                Some(h) => h.text(),
                None => continue,
            };

            // Only calendar collections; this also drops the collection root
            let is_calendar = find_elem(&response, "resourcetype")
                .map(|rt| rt.children().any(|c| c.name() == "calendar"))
                .unwrap_or(false);
            if !is_calendar {
                continue;
            }

            // The root collection advertises an empty component set; real
            // lists must support VTODO
            let supports_todo = find_elem(&response, "supported-calendar-component-set")
                .map(|set| set.children().any(|c| c.attr("name") == Some("VTODO")))
                .unwrap_or(false);
            if !supports_todo {
                continue;
            }

            let id = match href.trim_end_matches('/').rsplit('/').next() {
                Some(segment) if !segment.is_empty() => segment.to_string(),
                _ => continue,
            };

            let name = find_elem(&response, "displayname")
                .map(|e| e.text())
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| id.clone());

            let description = find_elem(&response, "calendar-description")
                .map(|e| e.text())
                .filter(|t| !t.is_empty());

            let color = find_elem(&response, "calendar-color")
                .and_then(|col| col.texts().next().and_then(|t| csscolorparser::parse(t).ok()));

            let revision_tag = find_elem(&response, "getctag")
                .map(|e| e.text())
                .filter(|t| !t.is_empty());

            let deleted = find_elem(&response, "deleted-at")
                .map(|e| !e.text().is_empty())
                .unwrap_or(false);

            let mut list = TaskList::new(&id, name)
                .with_description(description)
                .with_color(color)
                .with_revision_tag(revision_tag);
            list.set_deleted(deleted);
            log::debug!("Found calendar {} ({})", list.name(), id);
            lists.push(list);
        }
        Ok(lists)
    }
}

#[async_trait]
impl TaskSource for CalDavRemote {
    async fn list_lists(&self) -> CbResult<Vec<TaskList>> {
        Ok(self
            .discover_lists()
            .await?
            .into_iter()
            .filter(|l| !l.is_deleted())
            .collect())
    }

    async fn list_deleted_lists(&self) -> CbResult<Vec<TaskList>> {
        Ok(self
            .discover_lists()
            .await?
            .into_iter()
            .filter(|l| l.is_deleted())
            .collect())
    }

    async fn get_tasks(&self, list_id: &str, filter: &TaskFilter) -> CbResult<Vec<Task>> {
        let endpoint = self.list_endpoint(list_id)?;
        let body = query::calendar_query_body(filter);
        let responses = self
            .request_and_extract_elems("REPORT", &endpoint, body, 1, "response")
            .await?;

        let mut tasks = Vec::new();
        for response in responses {
            let href = match find_elem(&response, "href") {
                Some(h) => h.text(),
                None => continue,
            };
            let data = match find_elem(&response, "calendar-data") {
                Some(d) => d.text(),
                None => {
                    log::warn!("No calendar-data for {}, skipping it", href);
                    continue;
                }
            };
            match vtodo::parse_vtodo(&data, list_id, &href) {
                Err(err) => {
                    log::warn!("Unparseable task at {}: {}", href, err);
                    continue;
                }
                // The query pushed only part of the filter to the server
                Ok(task) => {
                    if filter.matches(&task) {
                        tasks.push(task);
                    }
                }
            }
        }
        Ok(tasks)
    }

    async fn add_task(&mut self, list_id: &str, task: &Task) -> CbResult<String> {
        // Never let a pending identifier reach the server: mint a proper UID,
        // unless this is the idempotent replay of an already-acknowledged create
        let uid = if task.id().is_empty() || crate::cache::is_pending_id(task.id()) {
            uuid::Uuid::new_v4().to_hyphenated().to_string()
        } else {
            task.id().to_string()
        };
        let url = self.task_url(list_id, &uid)?;
        let ical_text = vtodo::build_vtodo(task, &uid);

        let response = self
            .client
            .put(url.clone())
            .header("If-None-Match", "*")
            .header(CONTENT_TYPE, "text/calendar")
            .basic_auth(&self.root.username, Some(&self.root.password))
            .body(ical_text)
            .send()
            .await
            .map_err(|source| CbError::HttpRequest {
                url: url.clone(),
                method: Method::PUT,
                source,
            })?;

        let status = response.status();
        if status == StatusCode::PRECONDITION_FAILED {
            return Err(CbError::Conflict {
                what: "task",
                id: uid,
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CbError::from_status(status, "task", &uid, &body));
        }
        Ok(uid)
    }

    async fn update_task(&mut self, list_id: &str, task: &Task) -> CbResult<()> {
        let url = self.task_url(list_id, task.id())?;
        let ical_text = vtodo::build_vtodo(task, task.id());

        let response = self
            .client
            .put(url.clone())
            // Only replace something that exists; a create must go through add_task
            .header("If-Match", "*")
            .header(CONTENT_TYPE, "text/calendar")
            .basic_auth(&self.root.username, Some(&self.root.password))
            .body(ical_text)
            .send()
            .await
            .map_err(|source| CbError::HttpRequest {
                url: url.clone(),
                method: Method::PUT,
                source,
            })?;

        let status = response.status();
        if status == StatusCode::PRECONDITION_FAILED {
            return Err(CbError::NotFound {
                what: "task",
                id: task.id().to_string(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CbError::from_status(status, "task", task.id(), &body));
        }
        Ok(())
    }

    async fn delete_task(&mut self, list_id: &str, task_id: &str) -> CbResult<()> {
        let url = self.task_url(list_id, task_id)?;
        let response = self
            .client
            .delete(url.clone())
            .basic_auth(&self.root.username, Some(&self.root.password))
            .send()
            .await
            .map_err(|source| CbError::HttpRequest {
                url: url.clone(),
                method: Method::DELETE,
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CbError::from_status(status, "task", task_id, &body));
        }
        Ok(())
    }

    async fn create_list(
        &mut self,
        name: &str,
        description: Option<&str>,
        color: Option<&Color>,
    ) -> CbResult<String> {
        let list_id = slugify(name);
        let endpoint = self.list_endpoint(&list_id)?;

        let color_fragment = color
            .map(|c| {
                format!(
                    "<x1:calendar-color xmlns:x1=\"http://apple.com/ns/ical/\">{}</x1:calendar-color>",
                    c.to_hex_string().to_ascii_uppercase()
                )
            })
            .unwrap_or_default();
        let description_fragment = description
            .map(|d| format!("<c:calendar-description>{}</c:calendar-description>", d))
            .unwrap_or_default();

        let body = format!(
            r#"<?xml version="1.0" encoding="utf-8" ?>
    <d:mkcol xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav">
        <d:set>
            <d:prop>
                <d:resourcetype><d:collection /><c:calendar /></d:resourcetype>
                <d:displayname>{}</d:displayname>
                {}
                {}
                <c:supported-calendar-component-set>
                    <c:comp name="VTODO" />
                </c:supported-calendar-component-set>
            </d:prop>
        </d:set>
    </d:mkcol>
"#,
            name, description_fragment, color_fragment
        );

        let method = Method::from_bytes(b"MKCOL").expect("valid method name");
        let (status, text) = self.dav_request(method, &endpoint, body, None, &[]).await?;
        if !status.is_success() {
            return Err(CbError::from_status(status, "list", &list_id, &text));
        }
        Ok(list_id)
    }

    async fn delete_list(&mut self, list_id: &str) -> CbResult<()> {
        let endpoint = self.list_endpoint(list_id)?;
        let (status, text) = self
            .dav_request(Method::DELETE, &endpoint, String::new(), None, &[])
            .await?;
        if !status.is_success() {
            return Err(CbError::from_status(status, "list", list_id, &text));
        }
        Ok(())
    }

    async fn rename_list(&mut self, list_id: &str, new_name: &str) -> CbResult<()> {
        let endpoint = self.list_endpoint(list_id)?;
        let body = format!(
            r#"<?xml version="1.0" encoding="utf-8" ?>
    <d:propertyupdate xmlns:d="DAV:">
        <d:set>
            <d:prop><d:displayname>{}</d:displayname></d:prop>
        </d:set>
    </d:propertyupdate>
"#,
            new_name
        );
        let method = Method::from_bytes(b"PROPPATCH").expect("valid method name");
        let (status, text) = self.dav_request(method, &endpoint, body, None, &[]).await?;
        if !status.is_success() {
            return Err(CbError::from_status(status, "list", list_id, &text));
        }
        Ok(())
    }

    async fn restore_list(&mut self, list_id: &str) -> CbResult<()> {
        let source = DavEndpoint {
            url: self.trash_url(list_id)?,
            username: self.root.username.clone(),
            password: self.root.password.clone(),
        };
        let destination = self.list_endpoint(list_id)?.url.to_string();
        let method = Method::from_bytes(b"MOVE").expect("valid method name");
        let (status, text) = self
            .dav_request(
                method,
                &source,
                String::new(),
                None,
                &[("Destination", destination)],
            )
            .await?;
        if !status.is_success() {
            return Err(CbError::from_status(status, "list", list_id, &text));
        }
        Ok(())
    }

    async fn purge_list(&mut self, list_id: &str) -> CbResult<()> {
        let endpoint = DavEndpoint {
            url: self.trash_url(list_id)?,
            username: self.root.username.clone(),
            password: self.root.password.clone(),
        };
        let (status, text) = self
            .dav_request(Method::DELETE, &endpoint, String::new(), None, &[])
            .await?;
        if !status.is_success() {
            return Err(CbError::from_status(status, "list", list_id, &text));
        }
        Ok(())
    }

    fn parse_status_input(&self, text: &str) -> CbResult<TaskStatus> {
        // iCalendar spellings on top of the common ones
        match text.trim().to_ascii_uppercase().as_str() {
            "NEEDS-ACTION" => Ok(TaskStatus::Todo),
            "IN-PROCESS" => Ok(TaskStatus::InProgress),
            "COMPLETED" => Ok(TaskStatus::Done),
            "CANCELLED" => Ok(TaskStatus::Cancelled),
            _ => TaskStatus::parse_common(text)
                .ok_or_else(|| CbError::invalid_input(format!("unknown status {:?}", text))),
        }
    }

    fn status_display(&self, status: TaskStatus) -> String {
        match status {
            TaskStatus::Todo => "NEEDS-ACTION",
            TaskStatus::InProgress => "IN-PROCESS",
            TaskStatus::Done => "COMPLETED",
            TaskStatus::Cancelled => "CANCELLED",
        }
        .to_string()
    }

    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities::TRASH | SourceCapabilities::RENAME
    }

    fn display_name(&self) -> String {
        self.backend_name.clone()
    }

    fn type_tag(&self) -> &'static str {
        "caldav"
    }

    fn context(&self) -> String {
        self.root.url.to_string()
    }
}

/// Collection identifiers are derived from the display name the way servers
/// conventionally do it: lowercased, runs of non-alphanumerics collapsed to one dash
fn slugify(name: &str) -> String {
    let mut slug = String::new();
    let mut last_dash = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        uuid::Uuid::new_v4().to_hyphenated().to_string()
    } else {
        slug
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(host: &str) -> BackendConfig {
        let mut config = BackendConfig::new("unit-caldav", "caldav");
        config.host = Some(host.to_string());
        config.username = Some("john".to_string());
        config.suppress_allow_http_warning = true;
        config
    }

    #[test]
    fn urls_follow_the_collection_layout() {
        let remote = CalDavRemote::new(&backend("cloud.example.org")).unwrap();
        assert_eq!(
            remote.root.url.as_str(),
            "https://cloud.example.org/remote.php/dav/calendars/john/"
        );
        assert_eq!(
            remote.list_endpoint("errands").unwrap().url.as_str(),
            "https://cloud.example.org/remote.php/dav/calendars/john/errands/"
        );
        assert_eq!(
            remote.task_url("errands", "uid-1").unwrap().as_str(),
            "https://cloud.example.org/remote.php/dav/calendars/john/errands/uid-1.ics"
        );
    }

    #[test]
    fn https_is_the_default_even_when_http_is_allowed() {
        let mut config = backend("cloud.example.org:8443");
        config.allow_http = true;
        let remote = CalDavRemote::new(&config).unwrap();
        assert!(remote.root.url.as_str().starts_with("https://"));
    }

    #[test]
    fn http_needs_both_the_flag_and_a_whitelisted_port() {
        let remote = CalDavRemote::new(&backend("cloud.example.org:8080")).unwrap();
        assert!(remote.root.url.as_str().starts_with("https://"));

        let mut config = backend("cloud.example.org:8080");
        config.allow_http = true;
        let remote = CalDavRemote::new(&config).unwrap();
        assert!(remote.root.url.as_str().starts_with("http://"));
    }

    #[test]
    fn native_status_spellings_parse() {
        let remote = CalDavRemote::new(&backend("cloud.example.org")).unwrap();
        assert_eq!(
            remote.parse_status_input("needs-action").unwrap(),
            TaskStatus::Todo
        );
        assert_eq!(
            remote.parse_status_input("IN-PROCESS").unwrap(),
            TaskStatus::InProgress
        );
        assert_eq!(remote.parse_status_input("d").unwrap(), TaskStatus::Done);
        assert!(remote.parse_status_input("blocked").is_err());
    }

    #[test]
    fn slugs_are_filesystem_and_url_safe() {
        assert_eq!(slugify("My shopping list"), "my-shopping-list");
        assert_eq!(slugify("Déjà vu!!"), "d-j-vu");
        assert!(!slugify("...").is_empty());
    }
}
