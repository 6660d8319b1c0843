//! This crate keeps a local, authoritative copy of your task lists and syncs
//! it with whatever remotes you point it at.
//!
//! Three remote families are built in: CalDAV collections (VTODO over WebDAV,
//! the kind Nextcloud serves), token-authenticated REST task APIs, and plain
//! markdown files with checkbox items living in a git working tree. Each is an
//! adapter behind the single [`traits::TaskSource`] surface, which the local
//! [`cache::Cache`] implements too.
//!
//! ## How a change travels
//!
//! A mutating operation goes through the [`facade::TaskOps`] verbs: it is
//! validated, committed to the cache together with a journal entry (one
//! transaction), and the foreground returns immediately. The detached
//! [`dispatch::Dispatcher`] then replays the journal against every configured
//! remote; tasks created offline carry a reserved *pending* identifier until
//! the remote's answer lets the [`sync::SyncEngine`] rewrite it everywhere.
//!
//! Reads never touch the network; a `sync` command runs the engine in the
//! foreground when you want to wait for it.
//!
//! ## Conflicts
//!
//! A task modified on both ends since the last sync is settled by a pluggable
//! [`sync::ConflictStrategy`]: keep the server's copy, keep yours, keep both,
//! or merge field by field.

pub mod cache;
pub mod config;
pub mod credentials;
pub mod dispatch;
pub mod error;
pub mod facade;
pub mod model;
pub mod providers;
pub mod registry;
pub mod sync;
pub mod traits;
pub mod utils;

pub use cache::Cache;
pub use error::{CbError, CbResult, ErrorKind};
pub use facade::{TaskDraft, TaskOps};
pub use model::{Task, TaskFilter, TaskList, TaskStatus};
pub use sync::{ConflictStrategy, SyncEngine, SyncMode};
pub use traits::TaskSource;
