//! The `Document` trait and lifecycle hooks.

use crate::error::{Result, ValidationError};
use crate::schema::SchemaDescriptor;
use crate::value::{ModelValue, Value};
use bson::Bson;

/// A typed model stored in (or embedded into) a collection.
///
/// Implementations describe their schema once, flatten themselves into
/// [`Value`]s for encoding and rebuild themselves from stored documents.
pub trait Document: Sized + Send + Sync + 'static {
    /// Static schema descriptor, typically held in a `OnceLock`.
    fn schema() -> &'static SchemaDescriptor;

    /// Declared fields in order, including `id`.
    fn to_fields(&self) -> Vec<(&'static str, Value)>;

    /// Rebuild an instance from its stored form.
    fn from_document(doc: &bson::Document) -> Result<Self>;

    fn id(&self) -> Option<Bson>;

    fn set_id(&mut self, id: Bson);

    /// Lifecycle hooks for this type.
    fn hooks() -> EventHooks<Self> {
        EventHooks::new()
    }

    /// Model-level validation run by saves when `validate_on_save` is set.
    fn validate(&self) -> std::result::Result<(), ValidationError> {
        Ok(())
    }

    /// Resolved forward links, for cascading writes and deletes.
    fn linked_documents_mut(&mut self) -> Vec<&mut dyn LinkedDocument> {
        Vec::new()
    }

    fn to_model_value(&self) -> ModelValue {
        ModelValue::new(Self::schema(), self.to_fields())
    }
}

/// Anything a read can hydrate from a stored document.
pub trait FromStored: Sized {
    fn from_stored(doc: &bson::Document) -> Result<Self>;

    /// Projection a read should request for this type.
    fn projection() -> Option<bson::Document> {
        None
    }
}

impl FromStored for bson::Document {
    fn from_stored(doc: &bson::Document) -> Result<Self> {
        Ok(doc.clone())
    }
}

/// Type-erased view of a linked document for cascades.
pub trait LinkedDocument: Send {
    fn linked_schema(&self) -> &'static SchemaDescriptor;
    fn linked_id(&self) -> Option<Bson>;
    fn assign_id(&mut self, id: Bson);
    fn linked_value(&self) -> ModelValue;
    fn nested_links_mut(&mut self) -> Vec<&mut dyn LinkedDocument>;
}

impl<T: Document> LinkedDocument for T {
    fn linked_schema(&self) -> &'static SchemaDescriptor {
        T::schema()
    }

    fn linked_id(&self) -> Option<Bson> {
        self.id()
    }

    fn assign_id(&mut self, id: Bson) {
        self.set_id(id);
    }

    fn linked_value(&self) -> ModelValue {
        self.to_model_value()
    }

    fn nested_links_mut(&mut self) -> Vec<&mut dyn LinkedDocument> {
        self.linked_documents_mut()
    }
}

/// Write action a hook is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Insert,
    Replace,
    Save,
    SaveChanges,
    Update,
    Delete,
    ValidateOnSave,
}

/// When a hook runs relative to its action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Before,
    After,
}

pub type HookFn<T> = Box<dyn Fn(&mut T) -> Result<()> + Send + Sync>;

/// Ordered hook list keyed by (event kind, phase).
pub struct EventHooks<T> {
    hooks: Vec<(EventKind, Phase, HookFn<T>)>,
}

impl<T> Default for EventHooks<T> {
    fn default() -> Self {
        Self { hooks: Vec::new() }
    }
}

impl<T> std::fmt::Debug for EventHooks<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.hooks.iter().map(|(kind, phase, _)| (kind, phase)))
            .finish()
    }
}

impl<T> EventHooks<T> {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn before<F>(self, kinds: &[EventKind], hook: F) -> Self
    where
        F: Fn(&mut T) -> Result<()> + Send + Sync + Clone + 'static,
    {
        self.register(kinds, Phase::Before, hook)
    }

    #[must_use]
    pub fn after<F>(self, kinds: &[EventKind], hook: F) -> Self
    where
        F: Fn(&mut T) -> Result<()> + Send + Sync + Clone + 'static,
    {
        self.register(kinds, Phase::After, hook)
    }

    fn register<F>(mut self, kinds: &[EventKind], phase: Phase, hook: F) -> Self
    where
        F: Fn(&mut T) -> Result<()> + Send + Sync + Clone + 'static,
    {
        for kind in kinds {
            self.hooks.push((*kind, phase, Box::new(hook.clone())));
        }
        self
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run the matching hooks in registration order. The first error stops the run.
    pub fn run(&self, kind: EventKind, phase: Phase, target: &mut T) -> Result<()> {
        for (k, p, hook) in &self.hooks {
            if *k == kind && *p == phase {
                hook(target)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn hooks_run_in_order_for_matching_event() {
        let hooks = EventHooks::<Vec<&'static str>>::new()
            .before(&[EventKind::Insert, EventKind::Replace], |log: &mut Vec<&'static str>| {
                log.push("first");
                Ok(())
            })
            .before(&[EventKind::Insert], |log: &mut Vec<&'static str>| {
                log.push("second");
                Ok(())
            })
            .after(&[EventKind::Insert], |log: &mut Vec<&'static str>| {
                log.push("after");
                Ok(())
            });
        assert_eq!(hooks.len(), 4);

        let mut log = Vec::new();
        hooks.run(EventKind::Insert, Phase::Before, &mut log).expect("hooks");
        assert_eq!(log, vec!["first", "second"]);

        log.clear();
        hooks.run(EventKind::Replace, Phase::Before, &mut log).expect("hooks");
        assert_eq!(log, vec!["first"]);
    }

    #[test]
    fn hook_error_stops_the_run() {
        let hooks = EventHooks::<u32>::new()
            .before(&[EventKind::Delete], |_: &mut u32| Err(Error::Custom("refused".into())))
            .before(&[EventKind::Delete], |n: &mut u32| {
                *n += 1;
                Ok(())
            });
        let mut n = 0;
        assert!(hooks.run(EventKind::Delete, Phase::Before, &mut n).is_err());
        assert_eq!(n, 0);
    }
}
