//! Schema descriptors, per-document settings and codec tables.

use crate::error::Result;
use crate::field::{FieldInfo, FieldType};
use crate::value::Value;
use bson::Bson;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Behavior switches for a stored document type.
///
/// Loadable from any serde format; every key is optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentSettings {
    /// Collection name; defaults to the schema name.
    pub name: Option<String>,
    pub use_cache: bool,
    pub cache_capacity: usize,
    #[serde(with = "duration_secs")]
    pub cache_expiration: Duration,
    pub use_state_management: bool,
    pub state_management_save_previous: bool,
    pub state_management_replace_objects: bool,
    pub use_revision: bool,
    pub keep_nulls: bool,
    pub validate_on_save: bool,
    /// Discriminator key for polymorphic collections.
    pub class_id: String,
    pub is_root: bool,
    /// Union collection this document is stored in.
    pub union_doc: Option<String>,
    /// Discriminator value inside the union collection.
    pub union_doc_alias: Option<String>,
    pub max_nesting_depth: u32,
    pub max_nesting_depths_per_field: BTreeMap<String, u32>,
}

impl Default for DocumentSettings {
    fn default() -> Self {
        Self {
            name: None,
            use_cache: false,
            cache_capacity: 32,
            cache_expiration: Duration::from_secs(600),
            use_state_management: false,
            state_management_save_previous: false,
            state_management_replace_objects: false,
            use_revision: false,
            keep_nulls: true,
            validate_on_save: false,
            class_id: "_class_id".to_string(),
            is_root: false,
            union_doc: None,
            union_doc_alias: None,
            max_nesting_depth: 3,
            max_nesting_depths_per_field: BTreeMap::new(),
        }
    }
}

impl DocumentSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collection(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn use_cache(mut self, capacity: usize, expiration: Duration) -> Self {
        self.use_cache = true;
        self.cache_capacity = capacity;
        self.cache_expiration = expiration;
        self
    }

    pub fn use_state_management(mut self, enabled: bool) -> Self {
        self.use_state_management = enabled;
        self
    }

    pub fn save_previous(mut self, enabled: bool) -> Self {
        self.state_management_save_previous = enabled;
        self
    }

    pub fn replace_objects(mut self, enabled: bool) -> Self {
        self.state_management_replace_objects = enabled;
        self
    }

    pub fn use_revision(mut self, enabled: bool) -> Self {
        self.use_revision = enabled;
        self
    }

    pub fn keep_nulls(mut self, enabled: bool) -> Self {
        self.keep_nulls = enabled;
        self
    }

    pub fn validate_on_save(mut self, enabled: bool) -> Self {
        self.validate_on_save = enabled;
        self
    }

    pub fn is_root(mut self, enabled: bool) -> Self {
        self.is_root = enabled;
        self
    }

    pub fn union_doc(mut self, collection: impl Into<String>, alias: Option<&str>) -> Self {
        self.union_doc = Some(collection.into());
        self.union_doc_alias = alias.map(str::to_string);
        self
    }

    pub fn max_nesting_depth(mut self, depth: u32) -> Self {
        self.max_nesting_depth = depth;
        self
    }

    pub fn max_nesting_depth_for(mut self, field: impl Into<String>, depth: u32) -> Self {
        self.max_nesting_depths_per_field.insert(field.into(), depth);
        self
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// A custom encoder for one value type.
pub type CodecFn = Arc<dyn Fn(&Value) -> Result<Bson> + Send + Sync>;

/// Type name to codec table.
#[derive(Clone, Default)]
pub struct Codecs {
    entries: Vec<(String, CodecFn)>,
}

impl Codecs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a codec. Later registrations for the same name win.
    pub fn register<F>(&mut self, type_name: impl Into<String>, codec: F)
    where
        F: Fn(&Value) -> Result<Bson> + Send + Sync + 'static,
    {
        let type_name = type_name.into();
        self.entries.retain(|(name, _)| *name != type_name);
        self.entries.push((type_name, Arc::new(codec)));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn get(&self, type_name: &str) -> Option<&CodecFn> {
        self.entries
            .iter()
            .find(|(name, _)| name == type_name)
            .map(|(_, codec)| codec)
    }

    /// Exact type match first, then the nearest ancestor.
    pub fn find(&self, value: &Value) -> Option<&CodecFn> {
        if self.entries.is_empty() {
            return None;
        }
        self.get(value.type_name()).or_else(|| {
            value
                .ancestor_names()
                .into_iter()
                .find_map(|ancestor| self.get(ancestor))
        })
    }
}

impl fmt::Debug for Codecs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(name, _)| name))
            .finish()
    }
}

/// Static description of a model type.
#[derive(Debug)]
pub struct SchemaDescriptor {
    /// Schema name, unique per registry
    pub name: &'static str,
    /// Whether instances are stored in their own collection
    pub is_document: bool,
    pub settings: DocumentSettings,
    pub fields: Vec<FieldInfo>,
    pub codecs: Codecs,
    /// Dotted inheritance path (`"Vehicle.Car"`) for polymorphic collections
    pub class_path: Option<String>,
}

impl SchemaDescriptor {
    /// Start a stored document schema. An `id` field aliased to `_id` is added.
    pub fn document(name: &'static str) -> SchemaBuilder {
        SchemaBuilder::new(name, true)
    }

    /// Start an embedded (non-stored) model schema.
    pub fn embedded(name: &'static str) -> SchemaBuilder {
        SchemaBuilder::new(name, false)
    }

    pub fn collection_name(&self) -> &str {
        self.settings
            .union_doc
            .as_deref()
            .or(self.settings.name.as_deref())
            .unwrap_or(self.name)
    }

    pub fn field(&self, name: &str) -> Option<&FieldInfo> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Discriminator key and value written into stored documents.
    pub fn discriminator(&self) -> Option<(&str, &str)> {
        if self.settings.union_doc.is_some() {
            let alias = self.settings.union_doc_alias.as_deref().unwrap_or(self.name);
            return Some((self.settings.class_id.as_str(), alias));
        }
        self.class_path
            .as_deref()
            .map(|path| (self.settings.class_id.as_str(), path))
    }

    /// Whether reads need a discriminator filter.
    pub fn is_polymorphic_child(&self) -> bool {
        self.settings.union_doc.is_some()
            || self
                .class_path
                .as_deref()
                .is_some_and(|path| path.contains('.'))
    }

    /// Nesting depth for a field's link expansion.
    pub fn nesting_depth_for(&self, field: &str) -> u32 {
        self.settings
            .max_nesting_depths_per_field
            .get(field)
            .copied()
            .unwrap_or(self.settings.max_nesting_depth)
    }
}

/// Builder for [`SchemaDescriptor`].
#[derive(Debug)]
pub struct SchemaBuilder {
    descriptor: SchemaDescriptor,
}

impl SchemaBuilder {
    fn new(name: &'static str, is_document: bool) -> Self {
        let fields = if is_document {
            vec![FieldInfo::new("id", FieldType::optional(FieldType::Scalar("object_id"))).alias("_id")]
        } else {
            Vec::new()
        };
        Self {
            descriptor: SchemaDescriptor {
                name,
                is_document,
                settings: DocumentSettings::default(),
                fields,
                codecs: Codecs::new(),
                class_path: None,
            },
        }
    }

    #[must_use]
    pub fn settings(mut self, settings: DocumentSettings) -> Self {
        self.descriptor.settings = settings;
        self
    }

    /// Add a field. A field named `id` replaces the default identity field.
    #[must_use]
    pub fn field(mut self, field: FieldInfo) -> Self {
        if let Some(existing) = self.descriptor.fields.iter_mut().find(|f| f.name == field.name) {
            *existing = field;
        } else {
            self.descriptor.fields.push(field);
        }
        self
    }

    #[must_use]
    pub fn codec<F>(mut self, type_name: &str, codec: F) -> Self
    where
        F: Fn(&Value) -> Result<Bson> + Send + Sync + 'static,
    {
        self.descriptor.codecs.register(type_name, codec);
        self
    }

    /// Place this schema in a polymorphic hierarchy.
    #[must_use]
    pub fn class_path(mut self, path: impl Into<String>) -> Self {
        self.descriptor.class_path = Some(path.into());
        self
    }

    pub fn build(self) -> SchemaDescriptor {
        self.descriptor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_defaults() {
        let s = DocumentSettings::default();
        assert!(s.keep_nulls);
        assert!(!s.use_revision);
        assert_eq!(s.cache_capacity, 32);
        assert_eq!(s.class_id, "_class_id");
        assert_eq!(s.max_nesting_depth, 3);
    }

    #[test]
    fn settings_load_from_json_with_partial_keys() {
        let s: DocumentSettings = serde_json::from_str(
            r#"{"name": "products", "use_revision": true, "cache_expiration": 2.5}"#,
        )
        .expect("valid settings");
        assert_eq!(s.name.as_deref(), Some("products"));
        assert!(s.use_revision);
        assert_eq!(s.cache_expiration, Duration::from_millis(2500));
        assert!(s.keep_nulls);
    }

    #[test]
    fn document_builder_adds_identity_field() {
        let schema = SchemaDescriptor::document("Product")
            .field(FieldInfo::new("name", FieldType::Scalar("str")))
            .build();
        assert_eq!(schema.fields[0].stored_name(), "_id");
        assert_eq!(schema.collection_name(), "Product");
        assert!(schema.discriminator().is_none());

        let embedded = SchemaDescriptor::embedded("Address").build();
        assert!(embedded.fields.is_empty());
    }

    #[test]
    fn codec_lookup_prefers_exact_over_ancestor() {
        let mut codecs = Codecs::new();
        codecs.register("int", |_| Ok(Bson::String("ancestor".into())));
        codecs.register("int32", |_| Ok(Bson::String("exact".into())));
        let codec = codecs.find(&Value::Int32(1)).expect("codec");
        assert_eq!(codec(&Value::Int32(1)).expect("encode"), Bson::String("exact".into()));
        let codec = codecs.find(&Value::Int64(1)).expect("codec");
        assert_eq!(codec(&Value::Int64(1)).expect("encode"), Bson::String("ancestor".into()));
        assert!(codecs.find(&Value::Bool(true)).is_none());
    }

    #[test]
    fn polymorphic_discriminator() {
        let car = SchemaDescriptor::document("Car")
            .settings(DocumentSettings::new().collection("vehicles"))
            .class_path("Vehicle.Car")
            .build();
        assert_eq!(car.discriminator(), Some(("_class_id", "Vehicle.Car")));
        assert!(car.is_polymorphic_child());

        let union = SchemaDescriptor::document("Cat")
            .settings(DocumentSettings::new().union_doc("pets", Some("cat")))
            .build();
        assert_eq!(union.collection_name(), "pets");
        assert_eq!(union.discriminator(), Some(("_class_id", "cat")));
    }
}
