//! Dynamic document values.
//!
//! `Value` is the pre-encoding representation of anything a model field,
//! filter operand or update operand can hold. The [`Encoder`](crate::Encoder)
//! reduces it to driver-native [`Bson`].

use crate::link::LinkRef;
use crate::schema::SchemaDescriptor;
use bson::Bson;
use bson::oid::ObjectId;
use chrono::{DateTime, TimeDelta, Utc};
use rust_decimal::Decimal;
use std::any::Any;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// A dynamically-typed document value.
#[derive(Debug, Clone)]
pub enum Value {
    /// Null / missing value
    Null,
    /// Boolean value
    Bool(bool),
    /// 32-bit signed integer
    Int32(i32),
    /// 64-bit signed integer
    Int64(i64),
    /// 64-bit floating point
    Double(f64),
    /// Text string
    String(String),
    /// Arbitrary precision decimal
    Decimal(Decimal),
    /// UUID
    Uuid(Uuid),
    /// Binary data
    Bytes(Vec<u8>),
    /// UTC timestamp
    DateTime(DateTime<Utc>),
    /// Signed duration, stored as seconds
    Duration(TimeDelta),
    /// IPv4 or IPv6 address
    IpAddr(IpAddr),
    /// Filesystem path
    Path(PathBuf),
    /// Secret string, masked in debug output
    Secret(SecretString),
    /// Enum variant, stored as its underlying value
    Enum(EnumValue),
    /// Compiled regular expression
    Pattern(Pattern),
    /// Document identifier
    ObjectId(ObjectId),
    /// Forward reference to another document
    Link(LinkValue),
    /// Back reference, materialized only by reads
    BackLink(Option<Box<ModelValue>>),
    /// Typed document instance
    Model(ModelValue),
    /// Ordered mapping (embedded models, plain dicts, operator bodies)
    Map(Map),
    /// Sequence of values
    List(Vec<Value>),
    /// Already driver-native value
    Bson(Bson),
    /// Application-defined type resolved through the codec table
    Custom(CustomValue),
}

/// An enum variant carrying its declaring type name.
#[derive(Debug, Clone, PartialEq)]
pub struct EnumValue {
    pub type_name: &'static str,
    pub value: Box<Value>,
}

impl EnumValue {
    pub fn new(type_name: &'static str, value: impl Into<Value>) -> Self {
        Self {
            type_name,
            value: Box::new(value.into()),
        }
    }
}

/// A secret string. Debug output never shows the contents.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Access the raw secret.
    pub fn expose_secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretString(\"**********\")")
    }
}

/// A compiled pattern together with its driver option flags.
#[derive(Debug, Clone)]
pub struct Pattern {
    regex: regex::Regex,
    options: String,
}

impl Pattern {
    /// Compile a pattern. `options` uses driver flag letters (`i`, `m`, `s`, `x`).
    pub fn new(pattern: &str, options: &str) -> crate::Result<Self> {
        let regex = regex::RegexBuilder::new(pattern)
            .case_insensitive(options.contains('i'))
            .multi_line(options.contains('m'))
            .dot_matches_new_line(options.contains('s'))
            .ignore_whitespace(options.contains('x'))
            .build()
            .map_err(|e| crate::Error::argument(format!("invalid pattern '{pattern}': {e}")))?;
        let mut flags: Vec<char> = options.chars().collect();
        flags.sort_unstable();
        flags.dedup();
        Ok(Self {
            regex,
            options: flags.into_iter().collect(),
        })
    }

    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }

    pub fn options(&self) -> &str {
        &self.options
    }

    pub fn regex(&self) -> &regex::Regex {
        &self.regex
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str() && self.options == other.options
    }
}

/// Value-level view of a reference field.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkValue {
    /// Not yet fetched: target collection and id
    Handle(LinkRef),
    /// Fetched instance
    Resolved(Box<ModelValue>),
}

/// A typed document instance flattened to its declared fields.
#[derive(Debug, Clone)]
pub struct ModelValue {
    pub schema: &'static SchemaDescriptor,
    pub fields: Vec<(&'static str, Value)>,
}

impl ModelValue {
    pub fn new(schema: &'static SchemaDescriptor, fields: Vec<(&'static str, Value)>) -> Self {
        Self { schema, fields }
    }

    /// Look up a field by its declared name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| *n == name).map(|(_, v)| v)
    }

    /// The identity field value, if set.
    pub fn id(&self) -> Option<&Value> {
        self.get("id").filter(|v| !v.is_null())
    }
}

impl PartialEq for ModelValue {
    fn eq(&self, other: &Self) -> bool {
        self.schema.name == other.schema.name && self.fields == other.fields
    }
}

/// An application type the built-in codecs do not know.
///
/// `type_name` and `ancestors` drive codec lookup; `fallback` is the
/// mapping form used when no codec matches.
#[derive(Clone)]
pub struct CustomValue {
    pub type_name: String,
    pub ancestors: Vec<String>,
    pub fallback: Option<Map>,
    inner: Arc<dyn Any + Send + Sync>,
}

impl CustomValue {
    pub fn new<T: Any + Send + Sync>(type_name: impl Into<String>, inner: T) -> Self {
        Self {
            type_name: type_name.into(),
            ancestors: Vec::new(),
            fallback: None,
            inner: Arc::new(inner),
        }
    }

    /// Declare ancestor type names, most specific first.
    #[must_use]
    pub fn with_ancestors<I, S>(mut self, ancestors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ancestors = ancestors.into_iter().map(Into::into).collect();
        self
    }

    /// Provide a mapping form used when no codec is registered.
    #[must_use]
    pub fn with_fallback(mut self, map: Map) -> Self {
        self.fallback = Some(map);
        self
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }
}

impl fmt::Debug for CustomValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomValue")
            .field("type_name", &self.type_name)
            .field("ancestors", &self.ancestors)
            .field("fallback", &self.fallback)
            .finish_non_exhaustive()
    }
}

impl PartialEq for CustomValue {
    fn eq(&self, other: &Self) -> bool {
        self.type_name == other.type_name
            && self.fallback == other.fallback
            && Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Insertion-ordered string-keyed map of values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Map {
    entries: Vec<(String, Value)>,
}

impl Map {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a key. Replacing keeps the original position.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let key = key.into();
        let value = value.into();
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            return Some(std::mem::replace(&mut slot.1, value));
        }
        self.entries.push((key, value));
        None
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.entries
            .iter_mut()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// The single entry of a one-key map.
    pub fn single_entry(&self) -> Option<(&str, &Value)> {
        match self.entries.as_slice() {
            [(k, v)] => Some((k.as_str(), v)),
            _ => None,
        }
    }
}

impl IntoIterator for Map {
    type Item = (String, Value);
    type IntoIter = std::vec::IntoIter<(String, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Map {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = Map::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl Value {
    /// Check if this value is null.
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null | Value::Bson(Bson::Null))
    }

    /// Build a list value from anything convertible.
    pub fn list<I, T>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Value>,
    {
        Value::List(items.into_iter().map(Into::into).collect())
    }

    /// Codec lookup name for this value.
    pub fn type_name(&self) -> &str {
        match self {
            Value::Null => "none",
            Value::Bool(_) => "bool",
            Value::Int32(_) => "int32",
            Value::Int64(_) => "int64",
            Value::Double(_) => "float",
            Value::String(_) => "str",
            Value::Decimal(_) => "decimal",
            Value::Uuid(_) => "uuid",
            Value::Bytes(_) => "bytes",
            Value::DateTime(_) => "datetime",
            Value::Duration(_) => "timedelta",
            Value::IpAddr(IpAddr::V4(_)) => "ipv4_address",
            Value::IpAddr(IpAddr::V6(_)) => "ipv6_address",
            Value::Path(_) => "path",
            Value::Secret(_) => "secret_str",
            Value::Enum(e) => e.type_name,
            Value::Pattern(_) => "pattern",
            Value::ObjectId(_) => "object_id",
            Value::Link(_) => "link",
            Value::BackLink(_) => "back_link",
            Value::Model(m) => m.schema.name,
            Value::Map(_) => "map",
            Value::List(_) => "list",
            Value::Bson(_) => "bson",
            Value::Custom(c) => &c.type_name,
        }
    }

    /// Ancestor type names, most specific first.
    pub fn ancestor_names(&self) -> Vec<&str> {
        match self {
            Value::Int32(_) | Value::Int64(_) => vec!["int"],
            Value::IpAddr(_) => vec!["ip_address"],
            Value::Enum(_) => vec!["enum"],
            Value::Model(_) => vec!["document"],
            Value::Custom(c) => c.ancestors.iter().map(String::as_str).collect(),
            _ => Vec::new(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            Value::Bson(Bson::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Map> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int32(a), Value::Int32(b)) => a == b,
            (Value::Int64(a), Value::Int64(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Decimal(a), Value::Decimal(b)) => a == b,
            (Value::Uuid(a), Value::Uuid(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::DateTime(a), Value::DateTime(b)) => a == b,
            (Value::Duration(a), Value::Duration(b)) => a == b,
            (Value::IpAddr(a), Value::IpAddr(b)) => a == b,
            (Value::Path(a), Value::Path(b)) => a == b,
            (Value::Secret(a), Value::Secret(b)) => a == b,
            (Value::Enum(a), Value::Enum(b)) => a == b,
            (Value::Pattern(a), Value::Pattern(b)) => a == b,
            (Value::ObjectId(a), Value::ObjectId(b)) => a == b,
            (Value::Link(a), Value::Link(b)) => a == b,
            (Value::BackLink(a), Value::BackLink(b)) => a == b,
            (Value::Model(a), Value::Model(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Bson(a), Value::Bson(b)) => a == b,
            (Value::Custom(a), Value::Custom(b)) => a == b,
            _ => false,
        }
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

impl_from! {
    bool => Bool,
    i32 => Int32,
    i64 => Int64,
    f64 => Double,
    String => String,
    Decimal => Decimal,
    Uuid => Uuid,
    Vec<u8> => Bytes,
    DateTime<Utc> => DateTime,
    TimeDelta => Duration,
    IpAddr => IpAddr,
    PathBuf => Path,
    SecretString => Secret,
    EnumValue => Enum,
    Pattern => Pattern,
    ObjectId => ObjectId,
    LinkValue => Link,
    ModelValue => Model,
    Map => Map,
    Vec<Value> => List,
    Bson => Bson,
    CustomValue => Custom,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int64(i64::from(v))
    }
}

impl From<bson::Document> for Value {
    fn from(v: bson::Document) -> Self {
        Value::Bson(Bson::Document(v))
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(inner) => inner.into(),
            None => Value::Null,
        }
    }
}

impl From<&Value> for Value {
    fn from(v: &Value) -> Self {
        v.clone()
    }
}
