//! Field definitions for document schemas.

/// Declared type of a document field.
///
/// Link targets are named by schema name and resolved when documents are
/// registered, so schemas may refer to each other in any order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    /// Plain scalar, named by its codec type name (`"str"`, `"int64"`, ...)
    Scalar(&'static str),
    /// Embedded model that is not itself a stored document
    Embedded(&'static str),
    /// Nullable wrapper
    Optional(Box<FieldType>),
    /// Sequence
    List(Box<FieldType>),
    /// Forward reference to a document of the named schema
    Link(&'static str),
    /// Back reference from a document of the named schema
    BackLink(&'static str),
}

impl FieldType {
    pub fn optional(inner: FieldType) -> Self {
        FieldType::Optional(Box::new(inner))
    }

    pub fn list(inner: FieldType) -> Self {
        FieldType::List(Box::new(inner))
    }

    /// Strip one `Optional` layer, reporting whether it was present.
    pub fn unwrap_optional(&self) -> (&FieldType, bool) {
        match self {
            FieldType::Optional(inner) => (inner, true),
            other => (other, false),
        }
    }

    /// Whether the field is a back reference at any depth.
    pub fn is_back_link(&self) -> bool {
        match self {
            FieldType::BackLink(_) => true,
            FieldType::Optional(inner) | FieldType::List(inner) => inner.is_back_link(),
            _ => false,
        }
    }
}

/// Metadata about a document field.
#[derive(Debug, Clone)]
pub struct FieldInfo {
    /// Rust field name
    pub name: &'static str,
    /// Stored key when it differs from the field name
    pub alias: Option<&'static str>,
    /// Declared type
    pub ty: FieldType,
    /// For back references: the forward link field on the source schema
    pub original_field: Option<&'static str>,
}

impl FieldInfo {
    pub fn new(name: &'static str, ty: FieldType) -> Self {
        Self {
            name,
            alias: None,
            ty,
            original_field: None,
        }
    }

    #[must_use]
    pub fn alias(mut self, alias: &'static str) -> Self {
        self.alias = Some(alias);
        self
    }

    #[must_use]
    pub fn original_field(mut self, field: &'static str) -> Self {
        self.original_field = Some(field);
        self
    }

    /// Key under which this field is stored.
    pub fn stored_name(&self) -> &'static str {
        self.alias.unwrap_or(self.name)
    }
}
