//! Error types for DocModel operations.

use std::fmt;

/// The primary error type for all DocModel operations.
#[derive(Debug)]
pub enum Error {
    /// Malformed operator or builder input, raised at construction time
    Argument(ArgumentError),
    /// A document expected by the operation does not exist
    NotFound(NotFoundError),
    /// Optimistic revision check failed
    RevisionConflict(RevisionError),
    /// State tracking misuse (disabled policy or missing snapshot)
    State(StateError),
    /// Combination of options the core refuses to execute
    Unsupported(UnsupportedError),
    /// A value could not be reduced to a driver-native representation
    Encoding(EncodingError),
    /// A stored value could not be hydrated into the requested type
    Decode(DecodeError),
    /// Schema validation failed
    Validation(ValidationError),
    /// Schema registration errors
    Schema(SchemaError),
    /// Errors reported by the document database driver
    Driver(DriverError),
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ArgumentError {
    pub message: String,
}

#[derive(Debug)]
pub struct NotFoundError {
    pub collection: String,
    pub filter: Option<String>,
}

#[derive(Debug)]
pub struct RevisionError {
    pub collection: String,
    pub id: Option<String>,
}

#[derive(Debug)]
pub struct StateError {
    pub kind: StateErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateErrorKind {
    /// State management is turned off for the schema
    Disabled,
    /// Previous-state tracking is turned off for the schema
    PreviousDisabled,
    /// No snapshot has been taken yet
    NotSaved,
}

#[derive(Debug)]
pub struct UnsupportedError {
    pub operation: &'static str,
    pub message: String,
}

#[derive(Debug)]
pub struct EncodingError {
    pub type_name: String,
    pub message: String,
}

#[derive(Debug)]
pub struct DecodeError {
    pub expected: &'static str,
    pub actual: String,
    pub field: Option<String>,
}

/// Validation error for field-level and model-level validation.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// One entry per failing field (or "__model__" for model-level)
    pub errors: Vec<FieldValidationError>,
}

/// A single validation error for a field.
#[derive(Debug, Clone)]
pub struct FieldValidationError {
    /// The field name that failed validation
    pub field: String,
    /// Human-readable error message
    pub message: String,
}

#[derive(Debug)]
pub struct SchemaError {
    pub kind: SchemaErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaErrorKind {
    /// A link names a target schema that was never registered
    UnresolvedReference,
    /// The document type was used before `init_documents`
    NotInitialized,
    /// Two different schemas registered under one name
    DuplicateName,
    /// A field name that the schema does not declare
    UnknownField,
}

#[derive(Debug)]
pub struct DriverError {
    pub kind: DriverErrorKind,
    pub code: Option<i32>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// Unique index violation (code 11000)
    DuplicateKey,
    /// Command rejected by the server
    Command,
    /// Network or connection failure
    Connection,
    /// Anything else reported by the driver
    Other,
}

impl ValidationError {
    /// Create a new empty validation error container.
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    /// Check if there are any validation errors.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Add a field validation error.
    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(FieldValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Add a required field error.
    pub fn add_required(&mut self, field: impl Into<String>) {
        self.add(field, "is required");
    }

    /// Add a model-level validation error.
    pub fn add_model_error(&mut self, message: impl Into<String>) {
        self.add("__model__", message);
    }

    /// Convert to Result, returning Ok(()) if no errors, Err(self) otherwise.
    pub fn into_result(self) -> std::result::Result<(), Self> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl Default for ValidationError {
    fn default() -> Self {
        Self::new()
    }
}

impl Error {
    /// Build an argument error.
    pub fn argument(message: impl Into<String>) -> Self {
        Error::Argument(ArgumentError {
            message: message.into(),
        })
    }

    /// Build a not-found error for a collection.
    pub fn not_found(collection: impl Into<String>, filter: Option<String>) -> Self {
        Error::NotFound(NotFoundError {
            collection: collection.into(),
            filter,
        })
    }

    /// Build a revision conflict error.
    pub fn revision_conflict(collection: impl Into<String>, id: Option<String>) -> Self {
        Error::RevisionConflict(RevisionError {
            collection: collection.into(),
            id,
        })
    }

    /// Build a state-policy error.
    pub fn state(kind: StateErrorKind) -> Self {
        let message = match kind {
            StateErrorKind::Disabled => "state management is turned off for this document",
            StateErrorKind::PreviousDisabled => {
                "previous state tracking is turned off for this document"
            }
            StateErrorKind::NotSaved => "no state was saved for this document",
        };
        Error::State(StateError {
            kind,
            message: message.to_string(),
        })
    }

    /// Build an unsupported-operation error.
    pub fn unsupported(operation: &'static str, message: impl Into<String>) -> Self {
        Error::Unsupported(UnsupportedError {
            operation,
            message: message.into(),
        })
    }

    /// Build an encoding error.
    pub fn encoding(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Encoding(EncodingError {
            type_name: type_name.into(),
            message: message.into(),
        })
    }

    /// Build a decode error.
    pub fn decode(expected: &'static str, actual: impl Into<String>) -> Self {
        Error::Decode(DecodeError {
            expected,
            actual: actual.into(),
            field: None,
        })
    }

    /// Build a schema error.
    pub fn schema(kind: SchemaErrorKind, message: impl Into<String>) -> Self {
        Error::Schema(SchemaError {
            kind,
            message: message.into(),
        })
    }

    /// Build a driver error.
    pub fn driver(kind: DriverErrorKind, message: impl Into<String>) -> Self {
        Error::Driver(DriverError {
            kind,
            code: match kind {
                DriverErrorKind::DuplicateKey => Some(11000),
                _ => None,
            },
            message: message.into(),
            source: None,
        })
    }

    /// Attach a field name to a decode error; other errors pass through.
    #[must_use]
    pub fn in_field(self, field: &str) -> Self {
        match self {
            Error::Decode(mut e) => {
                if e.field.is_none() {
                    e.field = Some(field.to_string());
                } else if let Some(inner) = e.field.take() {
                    e.field = Some(format!("{field}.{inner}"));
                }
                Error::Decode(e)
            }
            other => other,
        }
    }

    /// Is this a unique index violation reported by the driver?
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, Error::Driver(d) if d.kind == DriverErrorKind::DuplicateKey)
    }

    /// Is this a revision conflict?
    pub fn is_revision_conflict(&self) -> bool {
        matches!(self, Error::RevisionConflict(_))
    }

    /// Is this a not-found error?
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// The state error kind, if this is a state-policy error.
    pub fn state_kind(&self) -> Option<StateErrorKind> {
        match self {
            Error::State(s) => Some(s.kind),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Argument(e) => write!(f, "Invalid argument: {}", e.message),
            Error::NotFound(e) => write!(f, "Document not found: {}", e),
            Error::RevisionConflict(e) => write!(f, "Revision conflict: {}", e),
            Error::State(e) => write!(f, "State error: {}", e.message),
            Error::Unsupported(e) => write!(f, "Unsupported operation: {}", e),
            Error::Encoding(e) => write!(f, "Encoding error: {}", e),
            Error::Decode(e) => write!(f, "Decode error: {}", e),
            Error::Validation(e) => write!(f, "Validation error: {}", e),
            Error::Schema(e) => write!(f, "Schema error: {}", e.message),
            Error::Driver(e) => write!(f, "Driver error: {}", e),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Driver(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Validation(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for NotFoundError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.filter {
            Some(filter) => write!(f, "no document in '{}' matches {}", self.collection, filter),
            None => write!(f, "no matching document in '{}'", self.collection),
        }
    }
}

impl fmt::Display for RevisionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(
                f,
                "revision of document {} in '{}' was changed concurrently",
                id, self.collection
            ),
            None => write!(
                f,
                "revision of a document in '{}' was changed concurrently",
                self.collection
            ),
        }
    }
}

impl fmt::Display for UnsupportedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

impl fmt::Display for EncodingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot encode {}: {}", self.type_name, self.message)
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(field) = &self.field {
            write!(
                f,
                "expected {} for field '{}', found {}",
                self.expected, field, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.code {
            write!(f, "{} (code {})", self.message, code)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() {
            write!(f, "validation passed")
        } else if self.errors.len() == 1 {
            let err = &self.errors[0];
            write!(f, "validation error on '{}': {}", err.field, err.message)
        } else {
            writeln!(f, "validation errors:")?;
            for err in &self.errors {
                writeln!(f, "  - {}: {}", err.field, err.message)?;
            }
            Ok(())
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<ValidationError> for Error {
    fn from(err: ValidationError) -> Self {
        Error::Validation(err)
    }
}

impl From<DriverError> for Error {
    fn from(err: DriverError) -> Self {
        Error::Driver(err)
    }
}

impl From<SchemaError> for Error {
    fn from(err: SchemaError) -> Self {
        Error::Schema(err)
    }
}

impl From<DecodeError> for Error {
    fn from(err: DecodeError) -> Self {
        Error::Decode(err)
    }
}

impl From<EncodingError> for Error {
    fn from(err: EncodingError) -> Self {
        Error::Encoding(err)
    }
}

impl From<bson::de::Error> for Error {
    fn from(err: bson::de::Error) -> Self {
        Error::Decode(DecodeError {
            expected: "document",
            actual: err.to_string(),
            field: None,
        })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Custom(format!("Serialization error: {err}"))
    }
}

/// Result type alias for DocModel operations.
pub type Result<T> = std::result::Result<T, Error>;
