//! Delete queries.

use crate::bulk::BulkWriter;
use crate::expr::Expr;
use crate::find::render_filter;
use bson::Document;
use docmodel_core::{
    Connection, Cx, DeleteResult, Error, Outcome, Result, Session, WriteModel, try_outcome,
    try_result,
};
use std::fmt;
use std::marker::PhantomData;

macro_rules! delete_builder {
    ($name:ident, $label:literal, $many:literal) => {
        pub struct $name<T: docmodel_core::Document> {
            filters: Vec<Expr>,
            session: Option<Session>,
            bulk: Option<BulkWriter>,
            _marker: PhantomData<fn() -> T>,
        }

        impl<T: docmodel_core::Document> fmt::Debug for $name<T> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct($label)
                    .field("schema", &T::schema().name)
                    .field("filters", &self.filters)
                    .finish_non_exhaustive()
            }
        }

        impl<T: docmodel_core::Document> $name<T> {
            pub fn new(filters: Vec<Expr>) -> Self {
                Self {
                    filters,
                    session: None,
                    bulk: None,
                    _marker: PhantomData,
                }
            }

            #[must_use]
            pub fn with_session(mut self, session: Session) -> Self {
                self.session = Some(session);
                self
            }

            /// Queue on `writer` instead of executing.
            #[must_use]
            pub fn bulk_writer(mut self, writer: BulkWriter) -> Self {
                self.bulk = Some(writer);
                self
            }

            pub fn build_query(&self) -> Result<Document> {
                render_filter(T::schema(), &self.filters, false)
            }

            /// Delete matching documents. Returns `None` when queued on a
            /// bulk writer.
            #[tracing::instrument(level = "debug", skip(self, cx, conn), fields(schema = T::schema().name))]
            pub async fn execute<C: Connection>(
                self,
                cx: &Cx,
                conn: &C,
            ) -> Outcome<Option<DeleteResult>, Error> {
                let collection = T::schema().collection_name();
                let filter = try_result!(self.build_query());
                if let Some(writer) = &self.bulk {
                    let model = if $many {
                        WriteModel::DeleteMany { filter }
                    } else {
                        WriteModel::DeleteOne { filter }
                    };
                    writer.add(T::schema(), model);
                    return Outcome::Ok(None);
                }
                let session = self.session.as_ref();
                let result = if $many {
                    try_outcome!(conn.delete_many(cx, collection, &filter, session).await)
                } else {
                    try_outcome!(conn.delete_one(cx, collection, &filter, session).await)
                };
                tracing::debug!(collection, deleted = result.deleted_count, "Deleted documents");
                Outcome::Ok(Some(result))
            }
        }
    };
}

delete_builder!(DeleteMany, "DeleteMany", true);
delete_builder!(DeleteOne, "DeleteOne", false);
