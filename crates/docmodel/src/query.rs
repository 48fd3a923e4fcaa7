//! Query entry points on document types.

use crate::tracked::TrackedDocument;
use bson::Bson;
use docmodel_core::{Document, Value};
use docmodel_query::{
    AggregationQuery, DeleteMany, Expr, Fields, FindMany, FindOne, Update, UpdateMany,
};

/// Class-level queries, available on every [`Document`].
///
/// Reads hydrate [`TrackedDocument`]s; use `project::<Q>()` on the
/// returned builder to read another shape.
pub trait DocumentQuery: Document {
    /// Typed field paths of this schema.
    fn fields() -> Fields {
        Fields::of(Self::schema())
    }

    fn find(expr: impl Into<Expr>) -> FindMany<Self, TrackedDocument<Self>> {
        FindMany::new().find(expr)
    }

    /// Every document of this type.
    fn find_all() -> FindMany<Self, TrackedDocument<Self>> {
        FindMany::new()
    }

    fn find_one(expr: impl Into<Expr>) -> FindOne<Self, TrackedDocument<Self>> {
        FindOne::new().find(expr)
    }

    /// The document with identity `id`.
    fn get(id: impl Into<Bson>) -> FindOne<Self, TrackedDocument<Self>> {
        FindOne::new().find(Expr::eq("_id", Value::Bson(id.into())))
    }

    fn aggregate(pipeline: Vec<bson::Document>) -> AggregationQuery<Self> {
        AggregationQuery::new(Vec::new(), pipeline)
    }

    fn update_all(updates: Vec<Update>) -> UpdateMany<Self> {
        UpdateMany::new(Vec::new(), updates)
    }

    fn delete_all() -> DeleteMany<Self> {
        DeleteMany::new(Vec::new())
    }
}

impl<T: Document> DocumentQuery for T {}
