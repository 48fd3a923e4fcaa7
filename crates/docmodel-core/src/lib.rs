//! Core types and traits for DocModel.
//!
//! This crate provides the foundations the query layer and the document
//! actions build on:
//!
//! - `Value`, the dynamic pre-encoding value, and the `Encoder` that reduces it to BSON
//! - `Document`, `SchemaDescriptor` and the two-phase schema registry
//! - `Link` / `BackLink` reference types and link detection
//! - `StateTracker` for field-level change tracking
//! - `Connection`, the driver boundary
//! - `Outcome` and `Cx` re-exported from asupersync for cancel-correct operations

pub use asupersync::{Cx, Outcome};

pub mod connection;
pub mod decimal;
pub mod decode;
pub mod document;
pub mod encoder;
pub mod error;
pub mod field;
pub mod link;
pub mod registry;
pub mod schema;
pub mod state;
pub mod value;

pub use connection::{
    BulkWriteResult, Connection, DeleteResult, FindOneAndUpdateOptions, FindOptions, IndexModel,
    InsertManyResult, InsertOneResult, ReturnDocument, Session, UpdateResult, WriteModel,
};
pub use decode::{DocumentExt, FromBson};
pub use document::{Document, EventHooks, EventKind, FromStored, LinkedDocument, Phase};
pub use encoder::Encoder;
pub use error::{
    DriverErrorKind, Error, FieldValidationError, Result, SchemaErrorKind, StateErrorKind,
    ValidationError,
};
pub use field::{FieldInfo, FieldType};
pub use link::{BackLink, Link, LinkKind, LinkMap, LinkRef, ReferenceInfo};
pub use registry::{RegisteredSchema, init_documents};
pub use schema::{Codecs, DocumentSettings, SchemaBuilder, SchemaDescriptor};
pub use state::{StatePolicy, StateTracker};
pub use value::{CustomValue, EnumValue, LinkValue, Map, ModelValue, Pattern, SecretString, Value};

/// Unwrap an `Outcome`, returning early from the enclosing async fn on
/// anything but `Ok`.
#[macro_export]
macro_rules! try_outcome {
    ($expr:expr) => {
        match $expr {
            $crate::Outcome::Ok(value) => value,
            $crate::Outcome::Err(err) => return $crate::Outcome::Err(err.into()),
            $crate::Outcome::Cancelled(reason) => return $crate::Outcome::Cancelled(reason),
            $crate::Outcome::Panicked(payload) => return $crate::Outcome::Panicked(payload),
        }
    };
}

/// Unwrap a `Result` inside an async fn returning `Outcome`.
#[macro_export]
macro_rules! try_result {
    ($expr:expr) => {
        match $expr {
            Ok(value) => value,
            Err(err) => return $crate::Outcome::Err(err.into()),
        }
    };
}
