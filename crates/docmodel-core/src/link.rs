//! Cross-document references.
//!
//! A [`Link`] is stored as a handle (`{"$ref": collection, "$id": id}`) and
//! may be resolved into the target document by reads. A [`BackLink`] is
//! never stored; reads materialize it from the forward link on the other
//! side. [`detect`] derives the [`LinkMap`] a schema's reads expand.

use crate::decode::{FromBson, describe};
use crate::document::{Document, LinkedDocument};
use crate::error::{Error, Result, SchemaErrorKind};
use crate::field::FieldType;
use crate::schema::SchemaDescriptor;
use crate::value::{LinkValue, Value};
use bson::{Bson, doc};
use std::collections::HashSet;

/// Reference handle: target collection plus identity.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkRef {
    pub collection: String,
    pub id: Bson,
}

impl LinkRef {
    pub fn new(collection: impl Into<String>, id: impl Into<Bson>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }

    pub fn to_bson(&self) -> Bson {
        Bson::Document(doc! { "$ref": self.collection.clone(), "$id": self.id.clone() })
    }

    /// Parse a stored handle. Returns `None` for anything that is not one.
    pub fn from_document(doc: &bson::Document) -> Option<Self> {
        let collection = doc.get_str("$ref").ok()?;
        let id = doc.get("$id")?;
        Some(Self::new(collection, id.clone()))
    }
}

/// A forward reference to a document of type `T`.
#[derive(Debug, Clone, PartialEq)]
pub enum Link<T> {
    Ref(LinkRef),
    Resolved(Box<T>),
}

impl<T: Document> Link<T> {
    /// Link to an instance. Cascading writes persist it if needed.
    pub fn new(doc: T) -> Self {
        Link::Resolved(Box::new(doc))
    }

    pub fn from_id(id: impl Into<Bson>) -> Self {
        Link::Ref(LinkRef::new(T::schema().collection_name(), id))
    }

    pub fn id(&self) -> Option<Bson> {
        match self {
            Link::Ref(r) => Some(r.id.clone()),
            Link::Resolved(doc) => doc.id(),
        }
    }

    pub fn is_fetched(&self) -> bool {
        matches!(self, Link::Resolved(_))
    }

    pub fn get(&self) -> Option<&T> {
        match self {
            Link::Resolved(doc) => Some(doc),
            Link::Ref(_) => None,
        }
    }

    pub fn get_mut(&mut self) -> Option<&mut T> {
        match self {
            Link::Resolved(doc) => Some(doc),
            Link::Ref(_) => None,
        }
    }

    /// Erased access to a resolved target, for cascading writes.
    pub fn linked_mut(&mut self) -> Option<&mut dyn LinkedDocument> {
        match self {
            Link::Resolved(doc) => Some(&mut **doc),
            Link::Ref(_) => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Link::Ref(r) => Value::Link(LinkValue::Handle(r.clone())),
            Link::Resolved(doc) => Value::Link(LinkValue::Resolved(Box::new(doc.to_model_value()))),
        }
    }
}

impl<T: Document> FromBson for Link<T> {
    fn from_bson(value: &Bson) -> Result<Self> {
        match value {
            Bson::Document(d) => match LinkRef::from_document(d) {
                Some(r) => Ok(Link::Ref(r)),
                None => T::from_document(d).map(Link::new),
            },
            other => Err(Error::decode("link", describe(other))),
        }
    }
}

/// A back reference to a document of type `T`.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum BackLink<T> {
    #[default]
    Unfetched,
    Resolved(Box<T>),
}

impl<T: Document> BackLink<T> {
    pub fn get(&self) -> Option<&T> {
        match self {
            BackLink::Resolved(doc) => Some(doc),
            BackLink::Unfetched => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            BackLink::Resolved(doc) => Value::BackLink(Some(Box::new(doc.to_model_value()))),
            BackLink::Unfetched => Value::BackLink(None),
        }
    }
}

impl<T: Document> FromBson for BackLink<T> {
    fn from_bson(value: &Bson) -> Result<Self> {
        match value {
            Bson::Null => Ok(BackLink::Unfetched),
            Bson::Document(d) => T::from_document(d).map(|doc| BackLink::Resolved(Box::new(doc))),
            other => Err(Error::decode("back link", describe(other))),
        }
    }
}

/// Shape of a reference field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Direct,
    List,
    BackDirect,
    BackList,
}

impl LinkKind {
    pub fn is_back(self) -> bool {
        matches!(self, LinkKind::BackDirect | LinkKind::BackList)
    }

    pub fn is_list(self) -> bool {
        matches!(self, LinkKind::List | LinkKind::BackList)
    }
}

/// Resolved description of one reference field.
#[derive(Debug, Clone)]
pub struct ReferenceInfo {
    /// Field name on the owning schema
    pub field_name: &'static str,
    /// Stored key of the field carrying the handle (on the target for back references)
    pub lookup_field_name: &'static str,
    pub target: &'static SchemaDescriptor,
    pub kind: LinkKind,
    pub optional: bool,
    /// References of the target, absent where a cycle was cut
    pub nested: Option<LinkMap>,
}

/// Reference fields of a schema in declaration order.
#[derive(Debug, Clone, Default)]
pub struct LinkMap {
    entries: Vec<ReferenceInfo>,
}

impl LinkMap {
    pub fn get(&self, field: &str) -> Option<&ReferenceInfo> {
        self.entries.iter().find(|r| r.field_name == field)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReferenceInfo> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn classify(ty: &FieldType) -> Option<(LinkKind, &'static str, bool)> {
    let (base, optional) = ty.unwrap_optional();
    let (kind, target) = match base {
        FieldType::Link(target) => (LinkKind::Direct, *target),
        FieldType::BackLink(target) => (LinkKind::BackDirect, *target),
        FieldType::List(inner) => match inner.unwrap_optional().0 {
            FieldType::Link(target) => (LinkKind::List, *target),
            FieldType::BackLink(target) => (LinkKind::BackList, *target),
            _ => return None,
        },
        _ => return None,
    };
    Some((kind, target, optional))
}

/// Build the reference map of `schema`, resolving targets by name.
///
/// Nested maps are expanded recursively; a target already on the current
/// path is recorded without nested references.
pub fn detect(
    schema: &'static SchemaDescriptor,
    resolve: &dyn Fn(&str) -> Option<&'static SchemaDescriptor>,
) -> Result<LinkMap> {
    let mut visited = HashSet::new();
    visited.insert(schema.name);
    detect_inner(schema, resolve, &mut visited)
}

fn detect_inner(
    schema: &'static SchemaDescriptor,
    resolve: &dyn Fn(&str) -> Option<&'static SchemaDescriptor>,
    visited: &mut HashSet<&'static str>,
) -> Result<LinkMap> {
    let mut entries = Vec::new();
    for field in &schema.fields {
        let Some((kind, target_name, optional)) = classify(&field.ty) else {
            continue;
        };
        let target = resolve(target_name).ok_or_else(|| {
            Error::schema(
                SchemaErrorKind::UnresolvedReference,
                format!(
                    "field '{}' of '{}' refers to unknown schema '{}'",
                    field.name, schema.name, target_name
                ),
            )
        })?;

        let lookup_field_name = if kind.is_back() {
            let original = field.original_field.ok_or_else(|| {
                Error::schema(
                    SchemaErrorKind::UnknownField,
                    format!("back link '{}.{}' has no original field", schema.name, field.name),
                )
            })?;
            let forward = target.field(original).ok_or_else(|| {
                Error::schema(
                    SchemaErrorKind::UnknownField,
                    format!("'{}' has no field '{}'", target.name, original),
                )
            })?;
            forward.stored_name()
        } else {
            field.stored_name()
        };

        let nested = if visited.insert(target.name) {
            let nested = detect_inner(target, resolve, visited);
            visited.remove(target.name);
            let nested = nested?;
            (!nested.is_empty()).then_some(nested)
        } else {
            None
        };

        entries.push(ReferenceInfo {
            field_name: field.name,
            lookup_field_name,
            target,
            kind,
            optional,
            nested,
        });
    }
    Ok(LinkMap { entries })
}
