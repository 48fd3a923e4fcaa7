//! Link resolution for reads.
//!
//! Reads that fetch links run as aggregation pipelines: every reference
//! field contributes a group of `$lookup` stages, nested references expand
//! inside the lookup's sub-pipeline up to a nesting depth. Servers from
//! major version 5 accept `localField`/`foreignField` together with a
//! sub-pipeline; older servers get the `let` + `$expr` form whenever a
//! sub-pipeline is needed.

use bson::{Bson, Document, doc};
use docmodel_core::{
    Connection, Cx, Error, FindOptions, Link, LinkKind, LinkMap, Outcome, ReferenceInfo,
    SchemaDescriptor, Session,
};
use std::collections::{HashMap, HashSet};

/// First server major version with correlated `$lookup` sub-pipelines.
pub const NATIVE_LOOKUP_VERSION: u32 = 5;

/// Lookup stages for every reference field of `schema`, in declaration order.
///
/// `nesting_depth` overrides the schema's per-field depth limits.
#[tracing::instrument(level = "trace", skip(schema, links), fields(schema = schema.name))]
pub fn lookup_stages(
    schema: &SchemaDescriptor,
    links: &LinkMap,
    server_version: u32,
    nesting_depth: Option<u32>,
) -> Vec<Document> {
    let mut stages = Vec::new();
    for info in links.iter() {
        let depth = nesting_depth.unwrap_or_else(|| schema.nesting_depth_for(info.field_name));
        push_lookup(info, server_version, depth, &mut stages);
    }
    stages
}

fn push_lookup(info: &ReferenceInfo, server_version: u32, depth: u32, out: &mut Vec<Document>) {
    if depth == 0 {
        return;
    }
    let mut nested = Vec::new();
    if let Some(links) = &info.nested {
        for child in links.iter() {
            push_lookup(child, server_version, depth - 1, &mut nested);
        }
    }
    let native = server_version >= NATIVE_LOOKUP_VERSION || nested.is_empty();
    let from = info.target.collection_name();
    let handle_id = format!("{}.$id", info.lookup_field_name);

    let (as_field, local, foreign) = match info.kind {
        LinkKind::Direct => (format!("_link_{}", info.field_name), handle_id.clone(), "_id".to_string()),
        LinkKind::BackDirect => (format!("_link_{}", info.field_name), "_id".to_string(), handle_id.clone()),
        LinkKind::List => (info.lookup_field_name.to_string(), handle_id.clone(), "_id".to_string()),
        LinkKind::BackList => (info.field_name.to_string(), "_id".to_string(), handle_id.clone()),
    };

    let mut lookup = doc! { "from": from };
    if native {
        lookup.insert("localField", local);
        lookup.insert("foreignField", foreign);
        lookup.insert("as", as_field.as_str());
        if !nested.is_empty() {
            lookup.insert("pipeline", nested);
        }
    } else {
        let (link_id, condition) = match info.kind {
            LinkKind::Direct => (
                format!("${handle_id}"),
                doc! { "$eq": ["$_id", "$$link_id"] },
            ),
            LinkKind::BackDirect => (
                "$_id".to_string(),
                doc! { "$eq": [format!("${handle_id}"), "$$link_id"] },
            ),
            LinkKind::List => (
                format!("${handle_id}"),
                doc! { "$in": ["$_id", "$$link_id"] },
            ),
            LinkKind::BackList => (
                "$_id".to_string(),
                doc! { "$in": ["$$link_id", format!("${handle_id}")] },
            ),
        };
        let mut pipeline = vec![doc! { "$match": { "$expr": condition } }];
        pipeline.extend(nested);
        lookup.insert("let", doc! { "link_id": link_id });
        lookup.insert("as", as_field.as_str());
        lookup.insert("pipeline", pipeline);
    }
    out.push(doc! { "$lookup": lookup });

    if !info.kind.is_list() {
        let target = if info.kind.is_back() {
            info.field_name
        } else {
            info.lookup_field_name
        };
        let joined = format!("${as_field}");
        out.push(doc! { "$unwind": { "path": joined.as_str(), "preserveNullAndEmptyArrays": true } });
        out.push(doc! {
            "$set": {
                target: {
                    "$cond": {
                        "if": { "$ifNull": [joined.as_str(), false] },
                        "then": joined.as_str(),
                        "else": format!("${target}"),
                    }
                }
            }
        });
        out.push(doc! { "$unset": as_field });
    }
}

/// Rewrite `<link>.id` filter keys to the stored identity path.
///
/// Joined documents carry their identity as `_id`; unresolved handles as
/// `$id`.
pub fn convert_ids(filter: &Document, links: &LinkMap, fetch_links: bool) -> Document {
    let mut out = Document::new();
    for (key, value) in filter {
        let key = match key.split_once('.') {
            Some((head, "id")) if is_link_key(links, head) => {
                if fetch_links {
                    format!("{head}._id")
                } else {
                    format!("{head}.$id")
                }
            }
            _ => key.clone(),
        };
        out.insert(key, convert_value(value, links, fetch_links));
    }
    out
}

fn convert_value(value: &Bson, links: &LinkMap, fetch_links: bool) -> Bson {
    match value {
        Bson::Document(d) => Bson::Document(convert_ids(d, links, fetch_links)),
        Bson::Array(items) => Bson::Array(
            items
                .iter()
                .map(|item| convert_value(item, links, fetch_links))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn is_link_key(links: &LinkMap, key: &str) -> bool {
    links.iter().any(|info| {
        if info.kind.is_back() {
            info.field_name == key
        } else {
            info.lookup_field_name == key
        }
    })
}

fn id_key(id: &Bson) -> String {
    id.to_string()
}

/// Resolve a list of links in one round trip.
///
/// Links are deduplicated by target id (first occurrence wins) and keep
/// their order. Handles are fetched with a single `$in` query; a handle
/// whose target no longer exists is dropped with a warning. Handles
/// pointing at different collections are rejected.
#[tracing::instrument(level = "debug", skip(cx, conn, links, session), fields(links = links.len()))]
pub async fn fetch_list<T, C>(
    cx: &Cx,
    conn: &C,
    links: Vec<Link<T>>,
    session: Option<&Session>,
) -> Outcome<Vec<Link<T>>, Error>
where
    T: docmodel_core::Document,
    C: Connection,
{
    let mut seen = HashSet::new();
    let mut unique = Vec::with_capacity(links.len());
    for link in links {
        match link.id() {
            Some(id) if !seen.insert(id_key(&id)) => {}
            _ => unique.push(link),
        }
    }

    let mut collection: Option<String> = None;
    let mut pending = Vec::new();
    for link in &unique {
        if let Link::Ref(handle) = link {
            match &collection {
                Some(c) if *c != handle.collection => {
                    return Outcome::Err(Error::unsupported(
                        "fetch_list",
                        format!(
                            "links point at different collections: '{}' and '{}'",
                            c, handle.collection
                        ),
                    ));
                }
                Some(_) => {}
                None => collection = Some(handle.collection.clone()),
            }
            pending.push(handle.id.clone());
        }
    }

    let Some(collection) = collection else {
        return Outcome::Ok(unique);
    };

    let filter = doc! { "_id": { "$in": pending } };
    let found = match conn
        .find(cx, &collection, &filter, &FindOptions::default(), session)
        .await
    {
        Outcome::Ok(docs) => docs,
        Outcome::Err(e) => return Outcome::Err(e),
        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
        Outcome::Panicked(p) => return Outcome::Panicked(p),
    };

    let mut by_id: HashMap<String, T> = HashMap::with_capacity(found.len());
    for stored in &found {
        let Some(id) = stored.get("_id") else {
            continue;
        };
        match T::from_document(stored) {
            Ok(doc) => {
                by_id.insert(id_key(id), doc);
            }
            Err(e) => return Outcome::Err(e),
        }
    }

    let mut resolved = Vec::with_capacity(unique.len());
    for link in unique {
        match link {
            Link::Ref(handle) => match by_id.remove(&id_key(&handle.id)) {
                Some(doc) => resolved.push(Link::new(doc)),
                None => {
                    tracing::warn!(
                        collection = %handle.collection,
                        id = %handle.id,
                        "Dropping link to missing document"
                    );
                }
            },
            fetched => resolved.push(fetched),
        }
    }
    tracing::debug!(resolved = resolved.len(), "Resolved link list");
    Outcome::Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use docmodel_core::registry;
    use docmodel_core::{DocumentSettings, FieldInfo, FieldType, init_documents};
    use std::sync::OnceLock;

    fn owner() -> &'static SchemaDescriptor {
        static S: OnceLock<SchemaDescriptor> = OnceLock::new();
        S.get_or_init(|| {
            SchemaDescriptor::document("LnkOwner")
                .settings(DocumentSettings::new().collection("owners"))
                .field(FieldInfo::new("pet", FieldType::Link("LnkPet")))
                .field(FieldInfo::new("toys", FieldType::list(FieldType::Link("LnkToy"))))
                .build()
        })
    }

    fn pet() -> &'static SchemaDescriptor {
        static S: OnceLock<SchemaDescriptor> = OnceLock::new();
        S.get_or_init(|| {
            SchemaDescriptor::document("LnkPet")
                .settings(DocumentSettings::new().collection("pets"))
                .field(FieldInfo::new("vet", FieldType::optional(FieldType::Link("LnkVet"))))
                .field(FieldInfo::new("owner", FieldType::BackLink("LnkOwner")).original_field("pet"))
                .build()
        })
    }

    fn toy() -> &'static SchemaDescriptor {
        static S: OnceLock<SchemaDescriptor> = OnceLock::new();
        S.get_or_init(|| {
            SchemaDescriptor::document("LnkToy")
                .settings(DocumentSettings::new().collection("toys"))
                .build()
        })
    }

    fn vet() -> &'static SchemaDescriptor {
        static S: OnceLock<SchemaDescriptor> = OnceLock::new();
        S.get_or_init(|| {
            SchemaDescriptor::document("LnkVet")
                .settings(DocumentSettings::new().collection("vets"))
                .build()
        })
    }

    fn links_of(schema: &'static SchemaDescriptor) -> LinkMap {
        init_documents(&[owner(), pet(), toy(), vet()]).expect("register");
        registry::registered(schema).expect("registered").links.clone()
    }

    #[test]
    fn direct_link_emits_four_stages() {
        let links = links_of(toy());
        assert!(links.is_empty());

        let links = links_of(owner());
        let stages = lookup_stages(owner(), &links, 6, Some(1));
        assert_eq!(stages.len(), 5);
        assert_eq!(
            stages[0],
            doc! { "$lookup": { "from": "pets", "localField": "pet.$id", "foreignField": "_id", "as": "_link_pet" } }
        );
        assert_eq!(
            stages[1],
            doc! { "$unwind": { "path": "$_link_pet", "preserveNullAndEmptyArrays": true } }
        );
        assert_eq!(
            stages[2],
            doc! { "$set": { "pet": { "$cond": {
                "if": { "$ifNull": ["$_link_pet", false] },
                "then": "$_link_pet",
                "else": "$pet",
            } } } }
        );
        assert_eq!(stages[3], doc! { "$unset": "_link_pet" });
        assert_eq!(
            stages[4],
            doc! { "$lookup": { "from": "toys", "localField": "toys.$id", "foreignField": "_id", "as": "toys" } }
        );
    }

    #[test]
    fn nested_links_expand_into_sub_pipeline() {
        let links = links_of(owner());
        let stages = lookup_stages(owner(), &links, 6, Some(2));
        let lookup = stages[0].get_document("$lookup").expect("lookup");
        let pipeline = lookup.get_array("pipeline").expect("nested pipeline");
        // vet: four stages; owner back link: four stages.
        assert_eq!(pipeline.len(), 8);
        let back = pipeline[4].as_document().expect("stage");
        assert_eq!(
            back,
            &doc! { "$lookup": { "from": "owners", "localField": "_id", "foreignField": "pet.$id", "as": "_link_owner" } }
        );
    }

    #[test]
    fn old_servers_use_let_form_when_nesting() {
        let links = links_of(owner());
        let stages = lookup_stages(owner(), &links, 4, Some(2));
        let lookup = stages[0].get_document("$lookup").expect("lookup");
        assert_eq!(lookup.get_document("let").expect("let"), &doc! { "link_id": "$pet.$id" });
        let pipeline = lookup.get_array("pipeline").expect("pipeline");
        assert_eq!(
            pipeline[0].as_document().expect("match"),
            &doc! { "$match": { "$expr": { "$eq": ["$_id", "$$link_id"] } } }
        );
        assert!(lookup.get("localField").is_none());

        // Without nesting the native form is used regardless of version.
        let toys = &stages[stages.len() - 1];
        assert!(toys.get_document("$lookup").expect("lookup").contains_key("localField"));
    }

    #[test]
    fn depth_limits_expansion() {
        let links = links_of(owner());
        assert!(lookup_stages(owner(), &links, 6, Some(0)).is_empty());
        let shallow = lookup_stages(owner(), &links, 6, Some(1));
        let lookup = shallow[0].get_document("$lookup").expect("lookup");
        assert!(!lookup.contains_key("pipeline"));
    }

    #[test]
    fn link_id_paths_are_rewritten() {
        let links = links_of(owner());
        let filter = doc! { "pet.id": 5, "$or": [{ "toys.id": 1 }, { "name": "x" }], "other.id": 2 };
        assert_eq!(
            convert_ids(&filter, &links, false),
            doc! { "pet.$id": 5, "$or": [{ "toys.$id": 1 }, { "name": "x" }], "other.id": 2 }
        );
        assert_eq!(
            convert_ids(&doc! { "pet.id": 5 }, &links, true),
            doc! { "pet._id": 5 }
        );
    }
}
