//! Typed field references.
//!
//! A [`FieldPath`] names a stored field (dotted for nested paths) and builds
//! operator expressions against it. [`Fields`] materializes one path per
//! declared field of a schema, using stored names (`id` becomes `_id`).

use crate::expr::Expr;
use docmodel_core::{Error, Result, SchemaDescriptor, SchemaErrorKind, Value};
use std::fmt;

/// A dotted path to a stored field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath {
    path: String,
}

impl FieldPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.path
    }

    /// Path to a nested field.
    pub fn field(&self, name: &str) -> FieldPath {
        FieldPath::new(format!("{}.{}", self.path, name))
    }

    /// Path to the id of a linked document. Rewritten to the storage
    /// alias when the query renders.
    pub fn id(&self) -> FieldPath {
        self.field("id")
    }

    pub fn eq(&self, value: impl Into<Value>) -> Expr {
        Expr::eq(self.path.clone(), value)
    }

    pub fn ne(&self, value: impl Into<Value>) -> Expr {
        Expr::ne(self.path.clone(), value)
    }

    pub fn gt(&self, value: impl Into<Value>) -> Expr {
        Expr::gt(self.path.clone(), value)
    }

    pub fn gte(&self, value: impl Into<Value>) -> Expr {
        Expr::gte(self.path.clone(), value)
    }

    pub fn lt(&self, value: impl Into<Value>) -> Expr {
        Expr::lt(self.path.clone(), value)
    }

    pub fn lte(&self, value: impl Into<Value>) -> Expr {
        Expr::lte(self.path.clone(), value)
    }

    pub fn is_in<I, V>(&self, values: I) -> Expr
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Expr::is_in(self.path.clone(), values)
    }

    pub fn not_in<I, V>(&self, values: I) -> Expr
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Expr::not_in(self.path.clone(), values)
    }

    pub fn exists(&self, exists: bool) -> Expr {
        Expr::exists(self.path.clone(), exists)
    }

    pub fn regex(&self, pattern: &str, options: Option<&str>) -> Expr {
        Expr::regex(self.path.clone(), pattern, options)
    }

    pub fn all<I, V>(&self, values: I) -> Expr
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Expr::all(self.path.clone(), values)
    }

    pub fn elem_match(&self, expr: impl Into<Expr>) -> Expr {
        Expr::elem_match(self.path.clone(), expr)
    }

    pub fn size(&self, size: i64) -> Expr {
        Expr::size(self.path.clone(), size)
    }

    pub fn asc(&self) -> SortKey {
        SortKey::new(self.path.clone(), SortDirection::Ascending)
    }

    pub fn desc(&self) -> SortKey {
        SortKey::new(self.path.clone(), SortDirection::Descending)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

impl AsRef<str> for FieldPath {
    fn as_ref(&self) -> &str {
        &self.path
    }
}

impl From<FieldPath> for String {
    fn from(path: FieldPath) -> Self {
        path.path
    }
}

impl From<&FieldPath> for String {
    fn from(path: &FieldPath) -> Self {
        path.path.clone()
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    pub const fn as_i32(self) -> i32 {
        match self {
            SortDirection::Ascending => 1,
            SortDirection::Descending => -1,
        }
    }
}

/// A (field, direction) sort pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub field: String,
    pub direction: SortDirection,
}

impl SortKey {
    pub fn new(field: impl Into<String>, direction: SortDirection) -> Self {
        Self {
            field: field.into(),
            direction,
        }
    }

    /// Parse `"field"` / `"+field"` as ascending and `"-field"` as descending.
    pub fn parse(spec: &str) -> Self {
        match spec.strip_prefix('-') {
            Some(field) => SortKey::new(field, SortDirection::Descending),
            None => SortKey::new(spec.trim_start_matches('+'), SortDirection::Ascending),
        }
    }
}

impl From<&str> for SortKey {
    fn from(spec: &str) -> Self {
        SortKey::parse(spec)
    }
}

/// One field path per declared field of a schema.
#[derive(Debug, Clone)]
pub struct Fields {
    schema: &'static str,
    paths: Vec<(&'static str, FieldPath)>,
}

impl Fields {
    pub fn of(schema: &'static SchemaDescriptor) -> Self {
        Self {
            schema: schema.name,
            paths: schema
                .fields
                .iter()
                .map(|f| (f.name, FieldPath::new(f.stored_name())))
                .collect(),
        }
    }

    /// The path of a declared field.
    pub fn get(&self, name: &str) -> Result<FieldPath> {
        self.paths
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, p)| p.clone())
            .ok_or_else(|| {
                Error::schema(
                    SchemaErrorKind::UnknownField,
                    format!("'{}' has no field '{}'", self.schema, name),
                )
            })
    }
}
