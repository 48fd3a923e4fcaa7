//! Reduction of [`Value`]s to driver-native BSON.
//!
//! Resolution order per value: custom codec by exact type, custom codec by
//! ancestor, native passthrough, built-in codecs, typed models, maps, lists,
//! and finally the mapping fallback of custom values.

use crate::decimal;
use crate::error::{Error, Result};
use crate::schema::{Codecs, SchemaDescriptor};
use crate::value::{LinkValue, Map, ModelValue, Value};
use bson::spec::BinarySubtype;
use bson::{Binary, Bson, Document};
use std::collections::HashSet;

/// Configured encoder. Cheap to build per call.
#[derive(Debug, Clone)]
pub struct Encoder<'a> {
    exclude: HashSet<String>,
    codecs: Option<&'a Codecs>,
    keep_nulls: bool,
    to_db: bool,
}

impl Default for Encoder<'_> {
    fn default() -> Self {
        Self {
            exclude: HashSet::new(),
            codecs: None,
            keep_nulls: true,
            to_db: false,
        }
    }
}

impl<'a> Encoder<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encoder for storing documents of `schema`.
    pub fn for_storage(schema: &'a SchemaDescriptor) -> Self {
        Self::new()
            .codecs(&schema.codecs)
            .keep_nulls(schema.settings.keep_nulls)
            .to_db(true)
    }

    /// Top-level stored keys to leave out.
    #[must_use]
    pub fn exclude<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude = fields.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn codecs(mut self, codecs: &'a Codecs) -> Self {
        self.codecs = Some(codecs);
        self
    }

    #[must_use]
    pub fn keep_nulls(mut self, keep: bool) -> Self {
        self.keep_nulls = keep;
        self
    }

    #[must_use]
    pub fn to_db(mut self, to_db: bool) -> Self {
        self.to_db = to_db;
        self
    }

    /// Encoder for a nested level: no exclusions, child codecs when present.
    fn nested<'b>(&self, schema: Option<&'b SchemaDescriptor>) -> Encoder<'b>
    where
        'a: 'b,
    {
        let codecs = match schema {
            Some(s) if !s.codecs.is_empty() => Some(&s.codecs),
            _ => self.codecs,
        };
        Encoder {
            exclude: HashSet::new(),
            codecs,
            keep_nulls: self.keep_nulls,
            to_db: self.to_db,
        }
    }

    pub fn encode(&self, value: &Value) -> Result<Bson> {
        if let Some(codec) = self.codecs.and_then(|c| c.find(value)) {
            return codec(value);
        }
        match value {
            Value::Null => Ok(Bson::Null),
            Value::Bool(v) => Ok(Bson::Boolean(*v)),
            Value::Int32(v) => Ok(Bson::Int32(*v)),
            Value::Int64(v) => Ok(Bson::Int64(*v)),
            Value::Double(v) => Ok(Bson::Double(*v)),
            Value::String(v) => Ok(Bson::String(v.clone())),
            Value::ObjectId(v) => Ok(Bson::ObjectId(*v)),
            Value::DateTime(v) => Ok(Bson::DateTime(bson::DateTime::from_millis(
                v.timestamp_millis(),
            ))),
            Value::Bson(v) => Ok(v.clone()),

            Value::IpAddr(v) => Ok(Bson::String(v.to_string())),
            Value::Path(v) => Ok(Bson::String(v.to_string_lossy().into_owned())),
            Value::Secret(v) => Ok(Bson::String(v.expose_secret().to_string())),
            Value::Duration(v) => {
                let micros = v
                    .num_microseconds()
                    .ok_or_else(|| Error::encoding("timedelta", "duration out of range"))?;
                Ok(Bson::Double(micros as f64 / 1_000_000.0))
            }
            Value::Enum(e) => self.encode(&e.value),
            Value::Bytes(v) => Ok(Bson::Binary(Binary {
                subtype: BinarySubtype::Generic,
                bytes: v.clone(),
            })),
            Value::Decimal(v) => Ok(Bson::Decimal128(decimal::to_decimal128(v))),
            Value::Uuid(v) => Ok(Bson::Binary(Binary {
                subtype: BinarySubtype::Uuid,
                bytes: v.as_bytes().to_vec(),
            })),
            Value::Pattern(p) => Ok(Bson::RegularExpression(bson::Regex {
                pattern: p.as_str().to_string(),
                options: p.options().to_string(),
            })),
            Value::Link(link) => self.encode_link(link),
            Value::BackLink(back) => match back {
                Some(model) if !self.to_db => self.nested(Some(model.schema)).encode_model(model).map(Bson::Document),
                _ => Ok(Bson::Null),
            },

            Value::Model(model) => self.encode_model(model).map(Bson::Document),
            Value::Map(map) => self.nested(None).encode_map(map).map(Bson::Document),
            Value::List(items) => items
                .iter()
                .map(|item| self.nested(None).encode(item))
                .collect::<Result<Vec<_>>>()
                .map(Bson::Array),
            Value::Custom(custom) => match &custom.fallback {
                Some(map) => self.nested(None).encode_map(map).map(Bson::Document),
                None => Err(Error::encoding(
                    custom.type_name.clone(),
                    "no codec registered and no mapping form",
                )),
            },
        }
    }

    fn encode_link(&self, link: &LinkValue) -> Result<Bson> {
        match link {
            LinkValue::Handle(r) => Ok(r.to_bson()),
            LinkValue::Resolved(model) if !self.to_db => {
                self.nested(Some(model.schema)).encode_model(model).map(Bson::Document)
            }
            LinkValue::Resolved(model) => {
                let id = model.id().ok_or_else(|| {
                    Error::encoding(model.schema.name, "linked document has no id")
                })?;
                let id = self.nested(None).encode(id)?;
                Ok(crate::link::LinkRef::new(model.schema.collection_name(), id).to_bson())
            }
        }
    }

    /// Encode a typed instance into its stored document.
    pub fn encode_model(&self, model: &ModelValue) -> Result<Document> {
        let schema = model.schema;
        let mut doc = Document::new();
        if let Some((key, value)) = schema.discriminator() {
            doc.insert(key, value);
        }
        let nested = self.nested(Some(schema));
        for (name, value) in &model.fields {
            let field = schema.field(name);
            let stored = field.map_or(*name, |f| f.stored_name());
            if self.exclude.contains(stored) {
                continue;
            }
            let is_back_link =
                matches!(value, Value::BackLink(_)) || field.is_some_and(|f| f.ty.is_back_link());
            if self.to_db && is_back_link {
                continue;
            }
            if value.is_null() && (stored == "_id" || !self.keep_nulls) {
                continue;
            }
            let encoded = nested
                .encode(value)
                .map_err(|e| annotate(e, schema.name, name))?;
            doc.insert(stored, encoded);
        }
        Ok(doc)
    }

    pub fn encode_map(&self, map: &Map) -> Result<Document> {
        let mut doc = Document::new();
        for (key, value) in map.iter() {
            if self.exclude.contains(key) {
                continue;
            }
            doc.insert(key, self.encode(value)?);
        }
        Ok(doc)
    }
}

fn annotate(err: Error, schema: &str, field: &str) -> Error {
    match err {
        Error::Encoding(mut e) if !e.message.contains(" in field ") => {
            e.message = format!("{} in field '{schema}.{field}'", e.message);
            Error::Encoding(e)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{FieldInfo, FieldType};
    use crate::link::LinkRef;
    use crate::schema::{DocumentSettings, SchemaDescriptor};
    use crate::value::{CustomValue, EnumValue, Pattern, SecretString};
    use bson::doc;
    use chrono::TimeDelta;
    use rust_decimal::Decimal;
    use std::net::IpAddr;
    use std::str::FromStr;
    use std::sync::OnceLock;

    fn owner() -> &'static SchemaDescriptor {
        static S: OnceLock<SchemaDescriptor> = OnceLock::new();
        S.get_or_init(|| {
            SchemaDescriptor::document("Owner")
                .settings(DocumentSettings::new().collection("owners"))
                .field(FieldInfo::new("name", FieldType::optional(FieldType::Scalar("str"))))
                .field(FieldInfo::new("pet", FieldType::Link("Pet")))
                .field(FieldInfo::new("fans", FieldType::list(FieldType::BackLink("Fan"))).original_field("idol"))
                .build()
        })
    }

    fn pet() -> &'static SchemaDescriptor {
        static S: OnceLock<SchemaDescriptor> = OnceLock::new();
        S.get_or_init(|| {
            SchemaDescriptor::document("Pet")
                .settings(DocumentSettings::new().collection("pets"))
                .build()
        })
    }

    #[test]
    fn built_in_scalars() {
        let enc = Encoder::new();
        assert_eq!(
            enc.encode(&Value::from(IpAddr::from([10, 0, 0, 1]))).expect("ip"),
            Bson::String("10.0.0.1".into())
        );
        assert_eq!(
            enc.encode(&Value::Duration(TimeDelta::milliseconds(1500))).expect("duration"),
            Bson::Double(1.5)
        );
        assert_eq!(
            enc.encode(&Value::Secret(SecretString::new("pw"))).expect("secret"),
            Bson::String("pw".into())
        );
        assert_eq!(
            enc.encode(&Value::Enum(EnumValue::new("Color", "red"))).expect("enum"),
            Bson::String("red".into())
        );
        let Bson::Decimal128(d) = enc
            .encode(&Value::Decimal(Decimal::from_str("1.25").expect("decimal")))
            .expect("decimal")
        else {
            panic!("decimal encodes to Decimal128");
        };
        assert_eq!(
            decimal::from_decimal128(&d).expect("decode"),
            Decimal::from_str("1.25").expect("decimal")
        );
        let re = enc
            .encode(&Value::Pattern(Pattern::new("^a", "i").expect("pattern")))
            .expect("pattern");
        assert_eq!(
            re,
            Bson::RegularExpression(bson::Regex {
                pattern: "^a".into(),
                options: "i".into()
            })
        );
    }

    #[test]
    fn codecs_take_precedence_over_built_ins() {
        let mut codecs = Codecs::new();
        codecs.register("ip_address", |v| Ok(Bson::String(format!("ip:{}", v.type_name()))));
        let enc = Encoder::new().codecs(&codecs);
        assert_eq!(
            enc.encode(&Value::from(IpAddr::from([10, 0, 0, 1]))).expect("ip"),
            Bson::String("ip:ipv4_address".into())
        );
    }

    #[test]
    fn custom_values_fall_back_to_mapping_or_fail() {
        let enc = Encoder::new();
        let mut map = Map::new();
        map.insert("amount", 5);
        let with_map = CustomValue::new("Money", ()).with_fallback(map);
        assert_eq!(enc.encode(&Value::Custom(with_map)).expect("mapping"), Bson::Document(doc! { "amount": 5 }));
        let bare = CustomValue::new("Opaque", ());
        let err = enc.encode(&Value::Custom(bare)).expect_err("no codec");
        assert!(matches!(err, Error::Encoding(_)));
    }

    #[test]
    fn storage_encoding_reduces_links_and_drops_back_links() {
        let pet_value = ModelValue::new(pet(), vec![("id", Value::Int32(9))]);
        let model = ModelValue::new(
            owner(),
            vec![
                ("id", Value::Null),
                ("name", Value::Null),
                ("pet", Value::Link(LinkValue::Resolved(Box::new(pet_value)))),
                ("fans", Value::List(vec![Value::BackLink(None)])),
            ],
        );
        let stored = Encoder::for_storage(owner()).encode_model(&model).expect("encode");
        assert_eq!(
            stored,
            doc! { "name": Bson::Null, "pet": { "$ref": "pets", "$id": 9 } }
        );

        let no_nulls = Encoder::for_storage(owner()).keep_nulls(false).encode_model(&model).expect("encode");
        assert!(!no_nulls.contains_key("name"));

        let handle = ModelValue::new(
            owner(),
            vec![("pet", Value::Link(LinkValue::Handle(LinkRef::new("pets", 3))))],
        );
        let out = Encoder::new().encode_model(&handle).expect("encode");
        assert_eq!(out, doc! { "pet": { "$ref": "pets", "$id": 3 } });
    }

    #[test]
    fn discriminator_is_injected_and_exclusions_apply() {
        static CAR: OnceLock<SchemaDescriptor> = OnceLock::new();
        let car = CAR.get_or_init(|| {
            SchemaDescriptor::document("Car")
                .class_path("Vehicle.Car")
                .field(FieldInfo::new("wheels", FieldType::Scalar("int32")))
                .field(FieldInfo::new("color", FieldType::Scalar("str")))
                .build()
        });
        let model = ModelValue::new(
            car,
            vec![("wheels", Value::Int32(4)), ("color", Value::from("red"))],
        );
        let out = Encoder::new().exclude(["color"]).encode_model(&model).expect("encode");
        assert_eq!(out, doc! { "_class_id": "Vehicle.Car", "wheels": 4 });
    }

    #[test]
    fn unresolved_id_in_stored_link_fails() {
        let pet_value = ModelValue::new(pet(), vec![("id", Value::Null)]);
        let model = ModelValue::new(
            owner(),
            vec![("pet", Value::Link(LinkValue::Resolved(Box::new(pet_value))))],
        );
        let err = Encoder::for_storage(owner()).encode_model(&model).expect_err("no id");
        assert!(err.to_string().contains("Owner.pet"), "{err}");
    }
}
