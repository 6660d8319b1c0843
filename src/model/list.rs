//! Task lists and the per-list bookkeeping the sync engine maintains

use chrono::{DateTime, Utc};
use csscolorparser::Color;
use serde::{Deserialize, Serialize};

/// A named collection of tasks.
///
/// The identifier is opaque and provider-local: the "same" logical list may be
/// a collection URL segment on a CalDAV server, a numeric project id on a REST
/// remote and a heading slug in a markdown file. Display names are what stays
/// unique per provider.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskList {
    id: String,
    name: String,
    description: Option<String>,
    color: Option<Color>,
    /// Opaque value supplied by the remote that changes whenever any task in
    /// the list changes. `None` for remotes without one.
    revision_tag: Option<String>,
    /// Soft-delete marker; a trashed list stays restorable on providers with a trash
    deleted: bool,
}

impl TaskList {
    pub fn new<S: ToString, N: ToString>(id: S, name: N) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: None,
            color: None,
            revision_tag: None,
            deleted: false,
        }
    }

    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }

    pub fn with_color(mut self, color: Option<Color>) -> Self {
        self.color = color;
        self
    }

    pub fn with_revision_tag(mut self, revision_tag: Option<String>) -> Self {
        self.revision_tag = revision_tag;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
    pub fn color(&self) -> Option<&Color> {
        self.color.as_ref()
    }
    pub fn revision_tag(&self) -> Option<&str> {
        self.revision_tag.as_deref()
    }
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn set_name<N: ToString>(&mut self, name: N) {
        self.name = name.to_string();
    }

    pub fn set_revision_tag(&mut self, revision_tag: Option<String>) {
        self.revision_tag = revision_tag;
    }

    pub fn set_deleted(&mut self, deleted: bool) {
        self.deleted = deleted;
    }
}

/// Sync bookkeeping the engine keeps per list. The engine is its only writer.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ListSyncMeta {
    /// When the last fully successful pull of this list finished
    pub last_synced: Option<DateTime<Utc>>,
    /// The remote revision tag observed during that pull
    pub revision_tag: Option<String>,
    /// The native identifier the remote used for this list last time we looked.
    /// Remotes occasionally rename lists; see the queue documentation for what
    /// happens to journal entries written under the old identifier.
    pub native_id: Option<String>,
}
