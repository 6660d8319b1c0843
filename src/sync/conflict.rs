//! Pluggable resolution for tasks that diverged on both ends since the last sync

use chrono::{DateTime, Utc};

use crate::model::{Task, TaskStatus};
use crate::traits::FieldMask;

/// How one sync pass settles conflicts. Every strategy is deterministic given
/// identical inputs; `Merge` additionally needs the provider-declared field
/// mask to break ties.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictStrategy {
    /// Discard the local change, keep the remote copy
    ServerWins,
    /// Push the local change even though the remote moved
    LocalWins,
    /// Keep the remote copy and re-create the local version next to it
    KeepBoth,
    /// Field-level: whichever side moved after the last sync wins each field;
    /// the provider mask decides fields both sides moved
    Merge,
}

impl Default for ConflictStrategy {
    fn default() -> Self {
        ConflictStrategy::ServerWins
    }
}

impl std::fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ConflictStrategy::ServerWins => "server_wins",
            ConflictStrategy::LocalWins => "local_wins",
            ConflictStrategy::KeepBoth => "keep_both",
            ConflictStrategy::Merge => "merge",
        })
    }
}

/// What the engine should do with one conflicting task
#[derive(Clone, Debug, PartialEq)]
pub enum Resolution {
    TakeRemote,
    KeepLocal,
    /// Absorb the remote copy and re-create the local version under a fresh
    /// (pending) identifier with a marker suffix on the summary
    DuplicateLocal,
    /// Absorb this merged task and queue it for push
    Merged(Task),
}

/// The suffix `KeepBoth` appends to the re-created local copy
pub const KEEP_BOTH_SUFFIX: &str = " (local copy)";

impl ConflictStrategy {
    pub fn resolve(
        &self,
        local: &Task,
        remote: &Task,
        last_sync: Option<DateTime<Utc>>,
        remote_wins: FieldMask,
    ) -> Resolution {
        match self {
            ConflictStrategy::ServerWins => Resolution::TakeRemote,
            ConflictStrategy::LocalWins => Resolution::KeepLocal,
            ConflictStrategy::KeepBoth => Resolution::DuplicateLocal,
            ConflictStrategy::Merge => {
                Resolution::Merged(merge(local, remote, last_sync, remote_wins))
            }
        }
    }
}

/// Which side supplies one field of the merged task
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Side {
    Local,
    Remote,
}

fn merge(
    local: &Task,
    remote: &Task,
    last_sync: Option<DateTime<Utc>>,
    remote_wins: FieldMask,
) -> Task {
    // Task-level modification times are all we have, so "this side changed the
    // field" is approximated by "this side changed at all since the last sync"
    let local_moved = last_sync.map(|t| *local.modified_at() > t).unwrap_or(true);
    let remote_moved = last_sync.map(|t| *remote.modified_at() > t).unwrap_or(true);

    let side = |field: FieldMask| -> Side {
        match (local_moved, remote_moved) {
            (true, false) => Side::Local,
            (false, true) => Side::Remote,
            // Both moved (or neither, which should not reach a conflict):
            // the provider mask names the fields the remote owns
            _ => {
                if remote_wins.contains(field) {
                    Side::Remote
                } else {
                    Side::Local
                }
            }
        }
    };

    let pick = |field: FieldMask| -> &Task {
        match side(field) {
            Side::Local => local,
            Side::Remote => remote,
        }
    };

    let mut merged = remote.clone();
    merged.set_id(local.id());
    merged.set_completed_at(None);
    merged.set_status(TaskStatus::Todo);

    let summary_source = pick(FieldMask::SUMMARY);
    if merged.set_summary(summary_source.summary()).is_err() {
        // Cannot happen for tasks that passed validation, but never let a
        // merge drop a summary
        let _ = merged.set_summary(remote.summary());
    }
    merged.set_description(pick(FieldMask::DESCRIPTION).description().map(String::from));
    let _ = merged.set_priority(pick(FieldMask::PRIORITY).priority());
    merged.set_categories(pick(FieldMask::CATEGORIES).categories().to_vec());
    merged.set_parent_id(pick(FieldMask::PARENT).parent_id().map(String::from));

    // The due/start window is kept consistent: apply the due first, and drop
    // the start if the picked combination would invert the window
    let _ = merged.set_start(None);
    let _ = merged.set_due(pick(FieldMask::DUE).due().cloned());
    if merged
        .set_start(pick(FieldMask::START).start().cloned())
        .is_err()
    {
        log::warn!(
            "Merged task {} would have start after due, dropping the start",
            local.id()
        );
    }

    let status_source = pick(FieldMask::STATUS);
    merged.set_status(status_source.status());
    if status_source.status() == TaskStatus::Done {
        merged.set_completed_at(status_source.completed_at().cloned());
        if merged.completed_at().is_none() {
            merged.set_completed_at(Some(Utc::now()));
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn pair() -> (Task, Task, DateTime<Utc>) {
        let last_sync = Utc::now() - Duration::hours(1);
        let mut local = Task::new("t1", "l", "Original").unwrap();
        local.set_timestamps(last_sync - Duration::days(1), last_sync - Duration::minutes(5));
        let mut remote = local.clone();
        remote.set_timestamps(last_sync - Duration::days(1), last_sync - Duration::minutes(5));
        (local, remote, last_sync)
    }

    #[test]
    fn fixed_strategies_do_not_look_at_the_tasks() {
        let (local, remote, last_sync) = pair();
        assert_eq!(
            ConflictStrategy::ServerWins.resolve(&local, &remote, Some(last_sync), FieldMask::empty()),
            Resolution::TakeRemote
        );
        assert_eq!(
            ConflictStrategy::LocalWins.resolve(&local, &remote, Some(last_sync), FieldMask::empty()),
            Resolution::KeepLocal
        );
        assert_eq!(
            ConflictStrategy::KeepBoth.resolve(&local, &remote, Some(last_sync), FieldMask::empty()),
            Resolution::DuplicateLocal
        );
    }

    #[test]
    fn merge_takes_each_side_where_only_it_moved() {
        let (mut local, remote, last_sync) = pair();
        // Only the local side moved after the last sync
        local.set_summary("Local wording").unwrap();

        let resolved = ConflictStrategy::Merge.resolve(
            &local,
            &remote,
            Some(last_sync),
            FieldMask::STATUS | FieldMask::DUE,
        );
        match resolved {
            Resolution::Merged(merged) => {
                assert_eq!(merged.summary(), "Local wording");
                assert_eq!(merged.id(), "t1");
            }
            other => panic!("expected a merge, got {:?}", other),
        }
    }

    #[test]
    fn merge_tie_break_follows_the_provider_mask() {
        let (mut local, mut remote, last_sync) = pair();
        // Both sides moved: local renamed, remote completed
        local.set_summary("Local wording").unwrap();
        remote.set_status(TaskStatus::Done);
        remote.set_summary("Remote wording").unwrap();

        let mask = FieldMask::STATUS; // remote owns status, local the rest
        let resolved = ConflictStrategy::Merge.resolve(&local, &remote, Some(last_sync), mask);
        match resolved {
            Resolution::Merged(merged) => {
                assert_eq!(merged.summary(), "Local wording");
                assert_eq!(merged.status(), TaskStatus::Done);
                assert!(merged.completed_at().is_some());
                merged.validate().unwrap();
            }
            other => panic!("expected a merge, got {:?}", other),
        }
    }

    #[test]
    fn merge_is_deterministic() {
        let (mut local, mut remote, last_sync) = pair();
        local.set_summary("Local wording").unwrap();
        remote.set_status(TaskStatus::Done);

        let a = ConflictStrategy::Merge.resolve(&local, &remote, Some(last_sync), FieldMask::STATUS);
        let b = ConflictStrategy::Merge.resolve(&local, &remote, Some(last_sync), FieldMask::STATUS);
        match (a, b) {
            (Resolution::Merged(x), Resolution::Merged(y)) => {
                assert!(x.has_same_observable_content_as(&y))
            }
            _ => panic!("expected merges"),
        }
    }
}
