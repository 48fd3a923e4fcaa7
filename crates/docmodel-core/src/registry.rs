//! Process-wide schema registry.
//!
//! Registration is two-phase: every descriptor of a batch is first
//! registered by name, then every link target is resolved against the
//! combined set and the link map is computed. A batch with an unresolved
//! target is rejected as a whole.

use crate::error::{Error, Result, SchemaErrorKind};
use crate::link::{self, LinkMap};
use crate::schema::SchemaDescriptor;
use bson::{Bson, Document, doc};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

/// A registered schema with its resolved references.
#[derive(Debug)]
pub struct RegisteredSchema {
    pub descriptor: &'static SchemaDescriptor,
    pub links: LinkMap,
}

type Entries = HashMap<&'static str, Arc<RegisteredSchema>>;

fn registry() -> &'static RwLock<Entries> {
    static REGISTRY: OnceLock<RwLock<Entries>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

fn poisoned() -> Error {
    Error::Custom("schema registry lock poisoned".to_string())
}

/// Register a batch of schemas.
///
/// Re-registering the same descriptor is a no-op; a different descriptor
/// under a registered name is rejected.
#[tracing::instrument(level = "debug", skip(descriptors), fields(count = descriptors.len()))]
pub fn init_documents(descriptors: &[&'static SchemaDescriptor]) -> Result<()> {
    let mut entries = registry().write().map_err(|_| poisoned())?;

    // Phase 1: names.
    let mut names: HashMap<&'static str, &'static SchemaDescriptor> = entries
        .iter()
        .map(|(name, entry)| (*name, entry.descriptor))
        .collect();
    let mut pending = Vec::new();
    for descriptor in descriptors {
        match names.get(descriptor.name) {
            Some(existing) if std::ptr::eq(*existing, *descriptor) => {
                tracing::trace!(schema = descriptor.name, "Schema already registered");
            }
            Some(_) => {
                return Err(Error::schema(
                    SchemaErrorKind::DuplicateName,
                    format!("schema name '{}' is already registered", descriptor.name),
                ));
            }
            None => {
                names.insert(descriptor.name, *descriptor);
                pending.push(*descriptor);
            }
        }
    }

    // Phase 2: references.
    let resolve = |name: &str| names.get(name).copied();
    let mut resolved = Vec::with_capacity(pending.len());
    for descriptor in pending {
        let links = link::detect(descriptor, &resolve)?;
        tracing::debug!(
            schema = descriptor.name,
            collection = descriptor.collection_name(),
            links = links.len(),
            "Registered schema"
        );
        resolved.push(RegisteredSchema { descriptor, links });
    }
    for entry in resolved {
        entries.insert(entry.descriptor.name, Arc::new(entry));
    }
    Ok(())
}

/// Look up a registered schema by name.
pub fn lookup(name: &str) -> Result<Arc<RegisteredSchema>> {
    let entries = registry().read().map_err(|_| poisoned())?;
    entries.get(name).cloned().ok_or_else(|| {
        Error::schema(
            SchemaErrorKind::NotInitialized,
            format!("schema '{name}' is not initialized; call init_documents first"),
        )
    })
}

/// Look up the registered entry for a descriptor.
pub fn registered(schema: &'static SchemaDescriptor) -> Result<Arc<RegisteredSchema>> {
    lookup(schema.name)
}

/// Discriminator filter for reads of a polymorphic child schema.
///
/// Matches the schema's own class path and every registered descendant.
pub fn class_filter(schema: &SchemaDescriptor) -> Result<Option<Document>> {
    if !schema.is_polymorphic_child() {
        return Ok(None);
    }
    if schema.settings.union_doc.is_some() {
        let Some((key, alias)) = schema.discriminator() else {
            return Ok(None);
        };
        return Ok(Some(doc! { key: alias }));
    }
    let Some(path) = schema.class_path.as_deref() else {
        return Ok(None);
    };
    let prefix = format!("{path}.");
    let entries = registry().read().map_err(|_| poisoned())?;
    let mut paths: Vec<&str> = entries
        .values()
        .filter_map(|entry| entry.descriptor.class_path.as_deref())
        .filter(|p| p.starts_with(&prefix))
        .collect();
    paths.sort_unstable();
    let mut values = vec![Bson::String(path.to_string())];
    values.extend(paths.into_iter().map(|p| Bson::String(p.to_string())));
    Ok(Some(doc! { schema.settings.class_id.as_str(): { "$in": values } }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{FieldInfo, FieldType};
    use crate::schema::DocumentSettings;

    fn leak(schema: SchemaDescriptor) -> &'static SchemaDescriptor {
        Box::leak(Box::new(schema))
    }

    #[test]
    fn two_phase_resolves_forward_references_in_any_order() {
        let author = leak(
            SchemaDescriptor::document("RegAuthor")
                .field(FieldInfo::new("books", FieldType::list(FieldType::BackLink("RegBook"))).original_field("author"))
                .build(),
        );
        let book = leak(
            SchemaDescriptor::document("RegBook")
                .field(FieldInfo::new("author", FieldType::Link("RegAuthor")))
                .build(),
        );
        init_documents(&[author, book]).expect("register");
        let entry = lookup("RegAuthor").expect("registered");
        assert_eq!(entry.links.len(), 1);
        init_documents(&[author]).expect("idempotent");
    }

    #[test]
    fn unresolved_reference_fails_whole_batch() {
        let orphan = leak(
            SchemaDescriptor::document("RegOrphan")
                .field(FieldInfo::new("parent", FieldType::Link("RegMissing")))
                .build(),
        );
        let sibling = leak(SchemaDescriptor::document("RegSibling").build());
        let err = init_documents(&[sibling, orphan]).expect_err("missing target");
        assert!(matches!(
            err,
            Error::Schema(ref e) if e.kind == SchemaErrorKind::UnresolvedReference
        ));
        assert!(lookup("RegSibling").is_err());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let a = leak(SchemaDescriptor::document("RegDup").build());
        let b = leak(SchemaDescriptor::document("RegDup").build());
        init_documents(&[a]).expect("register");
        let err = init_documents(&[b]).expect_err("duplicate");
        assert!(err.to_string().contains("RegDup"));
    }

    #[test]
    fn class_filter_includes_descendants() {
        let settings = DocumentSettings::new().collection("reg_vehicles").is_root(true);
        let vehicle = leak(SchemaDescriptor::document("RegVehicle").settings(settings.clone()).class_path("RegVehicle").build());
        let car = leak(SchemaDescriptor::document("RegCar").settings(settings.clone()).class_path("RegVehicle.Car").build());
        let sport = leak(SchemaDescriptor::document("RegSport").settings(settings).class_path("RegVehicle.Car.Sport").build());
        init_documents(&[vehicle, car, sport]).expect("register");

        assert_eq!(class_filter(vehicle).expect("filter"), None);
        assert_eq!(
            class_filter(car).expect("filter"),
            Some(doc! { "_class_id": { "$in": ["RegVehicle.Car", "RegVehicle.Car.Sport"] } })
        );
    }
}
