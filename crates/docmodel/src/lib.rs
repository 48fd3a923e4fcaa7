//! DocModel Rust - typed document models over a document database driver.
//!
//! DocModel maps Rust types onto stored documents and provides:
//!
//! - A typed filter and update DSL rendering driver-native documents
//! - Link fields resolved through generated `$lookup` pipelines
//! - Field-level change tracking with minimal `$set` diffs
//! - Optimistic concurrency through revision tokens
//! - A per-model LRU/TTL read cache
//!
//! # Quick Start
//!
//! ```ignore
//! use docmodel::prelude::*;
//!
//! struct Pet {
//!     id: Option<Bson>,
//!     name: String,
//! }
//!
//! impl Document for Pet {
//!     fn schema() -> &'static SchemaDescriptor {
//!         static S: OnceLock<SchemaDescriptor> = OnceLock::new();
//!         S.get_or_init(|| {
//!             SchemaDescriptor::document("Pet")
//!                 .settings(DocumentSettings::new().collection("pets").use_state_management(true))
//!                 .field(FieldInfo::new("name", FieldType::Scalar("str")))
//!                 .build()
//!         })
//!     }
//!     // to_fields, from_document, id, set_id ...
//! }
//!
//! async fn example(cx: &Cx, conn: &impl Connection) -> Outcome<(), Error> {
//!     try_result!(init_documents(&[Pet::schema()]));
//!
//!     let mut rex = TrackedDocument::new(Pet { id: None, name: "Rex".into() });
//!     try_outcome!(rex.insert(cx, conn, WriteRules::DoNothing, None).await);
//!
//!     let name = try_result!(Pet::fields().get("name"));
//!     let found = try_outcome!(Pet::find(name.eq("Rex")).sort("-name").to_list(cx, conn).await);
//!     assert_eq!(found.len(), 1);
//!
//!     rex.name = "Max".into();
//!     rex.save_changes(cx, conn, false).await
//! }
//! ```
//!
//! # Drivers
//!
//! Every operation runs against an implementation of [`Connection`]. The
//! `docmodel-memory` crate provides an in-process one.

pub use docmodel_core::{
    BackLink, BulkWriteResult, Codecs, Connection, CustomValue, Cx, DeleteResult, Document,
    DocumentExt, DocumentSettings, DriverErrorKind, Encoder, EnumValue, Error, EventHooks,
    EventKind, FieldInfo, FieldType, FromBson, FromStored, IndexModel, Link, LinkKind, LinkRef,
    LinkValue, LinkedDocument, Map, ModelValue, Outcome, Pattern, Phase, Result, SchemaDescriptor,
    SecretString, Session, StatePolicy, StateTracker, UpdateResult, Value, ValidationError,
    WriteModel, init_documents, try_outcome, try_result,
};

pub use docmodel_query::{
    AggregationQuery, BulkWriter, DeleteMany, DeleteOne, Expr, FieldPath, Fields, FindMany,
    FindOne, LogicalOp, SortDirection, SortKey, TextOptions, Update, UpdateMany, UpdateOne,
    UpdateOutput, UpdateResponse, fetch_list, filter,
};

pub mod query;
pub mod tracked;

pub use query::DocumentQuery;
pub use tracked::{DeleteRules, REVISION_FIELD, TrackedDocument, WriteRules};

/// Everything needed to declare and query document types.
pub mod prelude {
    pub use crate::{
        BulkWriter, Connection, Cx, DeleteRules, Document, DocumentExt, DocumentQuery,
        DocumentSettings, Error, EventHooks, EventKind, Expr, FieldInfo, FieldType, Link,
        LinkedDocument, Outcome, Result, SchemaDescriptor, TrackedDocument, Update, Value,
        WriteRules, init_documents, try_outcome, try_result,
    };
    pub use bson::{Bson, doc};
    pub use std::sync::OnceLock;
}
