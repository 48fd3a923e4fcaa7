//! Field-level state tracking for document instances.
//!
//! Snapshots hold the encoded (storage-form) document taken after a load,
//! insert or save. Diffs between snapshots are flat maps from dotted field
//! path to new value, ready to be used as a `$set` body.

use crate::error::{Error, Result, StateErrorKind};
use crate::schema::DocumentSettings;
use bson::{Bson, Document};
use std::time::Instant;

/// Encoded state of a document at one point in time.
#[derive(Debug, Clone)]
pub struct Snapshot {
    data: Document,
    taken_at: Instant,
}

impl Snapshot {
    pub fn new(data: Document) -> Self {
        Self {
            data,
            taken_at: Instant::now(),
        }
    }

    pub fn data(&self) -> &Document {
        &self.data
    }

    pub fn taken_at(&self) -> Instant {
        self.taken_at
    }
}

/// Tracking switches, read once from the schema settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatePolicy {
    pub enabled: bool,
    pub save_previous: bool,
    pub replace_objects: bool,
}

impl From<&DocumentSettings> for StatePolicy {
    fn from(settings: &DocumentSettings) -> Self {
        Self {
            enabled: settings.use_state_management,
            save_previous: settings.state_management_save_previous,
            replace_objects: settings.state_management_replace_objects,
        }
    }
}

/// Saved and previously-saved snapshots of one instance.
#[derive(Debug, Clone, Default)]
pub struct StateTracker {
    policy: StatePolicy,
    saved: Option<Snapshot>,
    previous_saved: Option<Snapshot>,
}

impl StateTracker {
    pub fn new(policy: StatePolicy) -> Self {
        Self {
            policy,
            saved: None,
            previous_saved: None,
        }
    }

    pub fn policy(&self) -> StatePolicy {
        self.policy
    }

    /// Record `current` as the saved state. No-op when tracking is off.
    #[tracing::instrument(level = "trace", skip(self, current))]
    pub fn save(&mut self, current: Document) {
        if !self.policy.enabled {
            return;
        }
        if self.policy.save_previous {
            self.previous_saved = self.saved.take();
        }
        tracing::trace!(fields = current.len(), "Saving document state");
        self.saved = Some(Snapshot::new(current));
    }

    pub fn saved(&self) -> Option<&Document> {
        self.saved.as_ref().map(Snapshot::data)
    }

    pub fn previous_saved(&self) -> Option<&Document> {
        self.previous_saved.as_ref().map(Snapshot::data)
    }

    fn require_saved(&self) -> Result<&Document> {
        if !self.policy.enabled {
            return Err(Error::state(StateErrorKind::Disabled));
        }
        self.saved().ok_or_else(|| Error::state(StateErrorKind::NotSaved))
    }

    fn require_previous(&self) -> Result<()> {
        if !self.policy.enabled {
            return Err(Error::state(StateErrorKind::Disabled));
        }
        if !self.policy.save_previous {
            return Err(Error::state(StateErrorKind::PreviousDisabled));
        }
        Ok(())
    }

    /// Whether `current` differs from the saved state.
    pub fn is_changed(&self, current: &Document) -> Result<bool> {
        Ok(self.require_saved()? != current)
    }

    /// Whether the last save changed anything relative to the one before.
    pub fn has_changed(&self) -> Result<bool> {
        self.require_previous()?;
        Ok(match (&self.previous_saved, &self.saved) {
            (Some(previous), Some(saved)) => previous.data != saved.data,
            _ => false,
        })
    }

    /// Dotted-path changes from the saved state to `current`.
    pub fn get_changes(&self, current: &Document) -> Result<Document> {
        let saved = self.require_saved()?;
        Ok(collect_changes(saved, current, self.policy.replace_objects))
    }

    /// Dotted-path changes from the previous saved state to the saved state.
    pub fn get_previous_changes(&self) -> Result<Document> {
        self.require_previous()?;
        Ok(match (&self.previous_saved, &self.saved) {
            (Some(previous), Some(saved)) => {
                collect_changes(&previous.data, &saved.data, self.policy.replace_objects)
            }
            _ => Document::new(),
        })
    }

    /// The saved state to restore, or `None` when nothing changed.
    pub fn rollback_target(&self, current: &Document) -> Result<Option<&Document>> {
        let saved = self.require_saved()?;
        Ok((saved != current).then_some(saved))
    }
}

/// Flat diff between two encoded documents.
///
/// Embedded documents are diffed into dotted paths unless `replace_objects`
/// is set. An embedded document that lost keys is emitted whole under its
/// own path, since `$set` cannot drop keys below it. A top-level key that
/// disappeared maps to null, which `save_changes` turns into `$unset` when
/// nulls are not kept.
pub fn collect_changes(old: &Document, new: &Document, replace_objects: bool) -> Document {
    let mut changes = diff_level(old, new, replace_objects);
    for key in old.keys().filter(|k| !new.contains_key(*k)) {
        changes.insert(key.clone(), Bson::Null);
    }
    changes
}

fn lost_keys(old: &Document, new: &Document) -> bool {
    old.keys().any(|k| !new.contains_key(k))
}

fn diff_level(old: &Document, new: &Document, replace_objects: bool) -> Document {
    let mut changes = Document::new();
    for (key, new_value) in new {
        let old_value = old.get(key);
        if old_value == Some(new_value) {
            continue;
        }
        match (old_value, new_value) {
            (Some(Bson::Document(old_doc)), Bson::Document(new_doc))
                if !replace_objects && !lost_keys(old_doc, new_doc) =>
            {
                for (path, value) in diff_level(old_doc, new_doc, replace_objects) {
                    changes.insert(format!("{key}.{path}"), value);
                }
            }
            _ => {
                changes.insert(key.clone(), new_value.clone());
            }
        }
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn tracking(save_previous: bool, replace_objects: bool) -> StateTracker {
        StateTracker::new(StatePolicy {
            enabled: true,
            save_previous,
            replace_objects,
        })
    }

    #[test]
    fn disabled_tracking_reports_policy_error() {
        let tracker = StateTracker::new(StatePolicy::default());
        let err = tracker.is_changed(&doc! {}).expect_err("disabled");
        assert_eq!(err.state_kind(), Some(StateErrorKind::Disabled));
    }

    #[test]
    fn unsaved_state_is_an_error() {
        let tracker = tracking(false, false);
        let err = tracker.get_changes(&doc! {}).expect_err("not saved");
        assert_eq!(err.state_kind(), Some(StateErrorKind::NotSaved));
        let err = tracker.get_previous_changes().expect_err("previous off");
        assert_eq!(err.state_kind(), Some(StateErrorKind::PreviousDisabled));
    }

    #[test]
    fn save_then_diff_is_empty_and_idempotent() {
        let mut tracker = tracking(false, false);
        let current = doc! { "name": "a", "n": 1 };
        tracker.save(current.clone());
        assert!(!tracker.is_changed(&current).expect("saved"));
        assert!(tracker.get_changes(&current).expect("saved").is_empty());

        let changed = doc! { "name": "b", "n": 1 };
        let first = tracker.get_changes(&changed).expect("saved");
        let second = tracker.get_changes(&changed).expect("saved");
        assert_eq!(first, doc! { "name": "b" });
        assert_eq!(first, second);
    }

    #[test]
    fn nested_leaf_change_is_dotted() {
        let mut tracker = tracking(false, false);
        tracker.save(doc! { "addr": { "city": "A", "zip": "1" }, "n": 1 });
        let changes = tracker
            .get_changes(&doc! { "addr": { "city": "B", "zip": "1" }, "n": 1 })
            .expect("saved");
        assert_eq!(changes, doc! { "addr.city": "B" });
    }

    #[test]
    fn replace_objects_emits_whole_value() {
        let mut tracker = tracking(false, true);
        tracker.save(doc! { "addr": { "city": "A", "zip": "1" } });
        let changes = tracker
            .get_changes(&doc! { "addr": { "city": "B", "zip": "1" } })
            .expect("saved");
        assert_eq!(changes, doc! { "addr": { "city": "B", "zip": "1" } });
    }

    #[test]
    fn key_set_changes_touch_only_the_affected_field() {
        let old = doc! { "_id": 7, "addr": { "city": "A", "zip": "1" }, "n": 1 };
        let dropped = doc! { "_id": 7, "addr": { "city": "A" }, "n": 1 };
        assert_eq!(collect_changes(&old, &dropped, false), doc! { "addr": { "city": "A" } });

        let added = doc! { "_id": 7, "addr": { "city": "A", "zip": "1", "unit": 4 }, "n": 1 };
        assert_eq!(collect_changes(&old, &added, false), doc! { "addr.unit": 4 });

        let top_removed = doc! { "_id": 7, "addr": { "city": "A", "zip": "1" } };
        assert_eq!(collect_changes(&old, &top_removed, false), doc! { "n": Bson::Null });

        let top_added = doc! { "_id": 7, "addr": { "city": "A", "zip": "1" }, "n": 1, "tag": "x" };
        assert_eq!(collect_changes(&old, &top_added, false), doc! { "tag": "x" });
    }

    #[test]
    fn previous_changes_track_last_save() {
        let mut tracker = tracking(true, false);
        assert!(tracker.get_previous_changes().expect("enabled").is_empty());
        tracker.save(doc! { "n": 1 });
        tracker.save(doc! { "n": 2 });
        assert!(tracker.has_changed().expect("enabled"));
        assert_eq!(tracker.get_previous_changes().expect("enabled"), doc! { "n": 2 });
    }

    #[test]
    fn rollback_target_only_when_changed() {
        let mut tracker = tracking(false, false);
        let saved = doc! { "_id": 1, "n": 1 };
        tracker.save(saved.clone());
        assert!(tracker.rollback_target(&saved).expect("saved").is_none());
        let target = tracker
            .rollback_target(&doc! { "_id": 1, "n": 5 })
            .expect("saved");
        assert_eq!(target, Some(&saved));
    }
}
