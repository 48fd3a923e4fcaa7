//! Update queries.

use crate::bulk::BulkWriter;
use crate::expr::Expr;
use crate::find::render_filter;
use crate::update_ops::{Update, merge_updates};
use bson::{Bson, Document};
use docmodel_core::{
    Connection, Cx, Encoder, Error, FindOneAndUpdateOptions, Outcome, Result, ReturnDocument,
    Session, UpdateResult, WriteModel, try_outcome, try_result,
};
use std::fmt;

/// What an update returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateResponse {
    #[default]
    UpdateResult,
    OldDocument,
    NewDocument,
}

/// Result of executing an update.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutput {
    Updated(UpdateResult),
    /// Matched document before or after the update
    Document(Option<Document>),
    /// Nothing matched; the upsert document was inserted under this id
    Inserted(Bson),
    /// Redirected to a bulk writer
    Queued,
}

impl UpdateOutput {
    pub fn matched_count(&self) -> u64 {
        match self {
            UpdateOutput::Updated(r) => r.matched_count,
            UpdateOutput::Document(Some(_)) => 1,
            _ => 0,
        }
    }

    pub fn into_document(self) -> Option<Document> {
        match self {
            UpdateOutput::Document(doc) => doc,
            _ => None,
        }
    }
}

/// Insert a document in its stored form and return its id.
pub(crate) async fn insert_document<T, C>(
    cx: &Cx,
    conn: &C,
    doc: &T,
    session: Option<&Session>,
) -> Outcome<Bson, Error>
where
    T: docmodel_core::Document,
    C: Connection,
{
    let schema = T::schema();
    let stored = try_result!(Encoder::for_storage(schema).encode_model(&doc.to_model_value()));
    conn.insert_one(cx, schema.collection_name(), &stored, session)
        .await
        .map(|r| r.inserted_id)
}

fn encode_update(schema: &docmodel_core::SchemaDescriptor, updates: &[Update]) -> Result<Document> {
    Encoder::new()
        .codecs(&schema.codecs)
        .to_db(true)
        .encode_map(&merge_updates(updates))
}

macro_rules! update_builder {
    ($name:ident, $label:literal) => {
        impl<T: docmodel_core::Document> fmt::Debug for $name<T> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct($label)
                    .field("schema", &T::schema().name)
                    .field("filters", &self.filters)
                    .field("updates", &self.updates)
                    .field("upsert", &self.on_insert.is_some())
                    .field("response", &self.response)
                    .finish_non_exhaustive()
            }
        }

        impl<T: docmodel_core::Document> $name<T> {
            pub fn new(filters: Vec<Expr>, updates: Vec<Update>) -> Self {
                Self {
                    filters,
                    updates,
                    on_insert: None,
                    session: None,
                    bulk: None,
                    response: UpdateResponse::default(),
                }
            }

            /// Append update expressions.
            #[must_use]
            pub fn update(mut self, updates: Vec<Update>) -> Self {
                self.updates.extend(updates);
                self
            }

            /// Insert `doc` when the update matches nothing.
            #[must_use]
            pub fn upsert(mut self, doc: T) -> Self {
                self.on_insert = Some(doc);
                self
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

            /// The merged update document.
            pub fn build_update(&self) -> Result<Document> {
                encode_update(T::schema(), &self.updates)
            }

            fn deferred(&self, filter: Document, update: Document, many: bool) -> Result<UpdateOutput> {
                let Some(writer) = &self.bulk else {
                    return Err(Error::Custom("no bulk writer".to_string()));
                };
                if self.on_insert.is_some() {
                    return Err(Error::unsupported(
                        "upsert",
                        "insert-on-miss cannot be deferred to a bulk writer",
                    ));
                }
                let model = if many {
                    WriteModel::UpdateMany { filter, update, upsert: false }
                } else {
                    WriteModel::UpdateOne { filter, update, upsert: false }
                };
                writer.add(T::schema(), model);
                Ok(UpdateOutput::Queued)
            }

            async fn insert_fallback<C: Connection>(
                &self,
                cx: &Cx,
                conn: &C,
                on_insert: &T,
            ) -> Outcome<UpdateOutput, Error> {
                tracing::debug!(
                    collection = T::schema().collection_name(),
                    "Update matched nothing, inserting upsert document"
                );
                insert_document(cx, conn, on_insert, self.session.as_ref())
                    .await
                    .map(UpdateOutput::Inserted)
            }
        }
    };
}

/// Update every document matching the filters.
pub struct UpdateMany<T: docmodel_core::Document> {
    filters: Vec<Expr>,
    updates: Vec<Update>,
    on_insert: Option<T>,
    session: Option<Session>,
    bulk: Option<BulkWriter>,
    response: UpdateResponse,
}

update_builder!(UpdateMany, "UpdateMany");

impl<T: docmodel_core::Document> UpdateMany<T> {
    #[tracing::instrument(level = "debug", skip(self, cx, conn), fields(schema = T::schema().name))]
    pub async fn execute<C: Connection>(self, cx: &Cx, conn: &C) -> Outcome<UpdateOutput, Error> {
        let collection = T::schema().collection_name();
        let filter = try_result!(self.build_query());
        let update = try_result!(self.build_update());
        if self.bulk.is_some() {
            return Outcome::Ok(try_result!(self.deferred(filter, update, true)));
        }

        let result = try_outcome!(
            conn.update_many(cx, collection, &filter, &update, false, self.session.as_ref())
                .await
        );
        tracing::debug!(
            collection,
            matched = result.matched_count,
            modified = result.modified_count,
            "Updated documents"
        );
        match &self.on_insert {
            Some(doc) if result.matched_count == 0 && !update.is_empty() => {
                self.insert_fallback(cx, conn, doc).await
            }
            _ => Outcome::Ok(UpdateOutput::Updated(result)),
        }
    }
}

/// Update the first document matching the filters.
pub struct UpdateOne<T: docmodel_core::Document> {
    filters: Vec<Expr>,
    updates: Vec<Update>,
    on_insert: Option<T>,
    session: Option<Session>,
    bulk: Option<BulkWriter>,
    response: UpdateResponse,
}

update_builder!(UpdateOne, "UpdateOne");

impl<T: docmodel_core::Document> UpdateOne<T> {
    /// Return the matched document instead of the update result.
    #[must_use]
    pub fn response_type(mut self, response: UpdateResponse) -> Self {
        self.response = response;
        self
    }

    #[tracing::instrument(level = "debug", skip(self, cx, conn), fields(schema = T::schema().name))]
    pub async fn execute<C: Connection>(self, cx: &Cx, conn: &C) -> Outcome<UpdateOutput, Error> {
        let collection = T::schema().collection_name();
        let filter = try_result!(self.build_query());
        let update = try_result!(self.build_update());
        if self.bulk.is_some() {
            return Outcome::Ok(try_result!(self.deferred(filter, update, false)));
        }

        let output = match self.response {
            UpdateResponse::UpdateResult => {
                let result = try_outcome!(
                    conn.update_one(cx, collection, &filter, &update, false, self.session.as_ref())
                        .await
                );
                tracing::debug!(collection, matched = result.matched_count, "Updated document");
                UpdateOutput::Updated(result)
            }
            UpdateResponse::OldDocument | UpdateResponse::NewDocument => {
                let options = FindOneAndUpdateOptions {
                    upsert: false,
                    return_document: if self.response == UpdateResponse::NewDocument {
                        ReturnDocument::After
                    } else {
                        ReturnDocument::Before
                    },
                    projection: None,
                };
                let found = try_outcome!(
                    conn.find_one_and_update(cx, collection, &filter, &update, &options, self.session.as_ref())
                        .await
                );
                UpdateOutput::Document(found)
            }
        };

        match &self.on_insert {
            Some(doc) if output.matched_count() == 0 && !update.is_empty() => {
                self.insert_fallback(cx, conn, doc).await
            }
            _ => Outcome::Ok(output),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use asupersync::runtime::RuntimeBuilder;
    use bson::doc;
    use docmodel_memory::MemoryConnection;

    #[test]
    fn update_documents_merge_operators() {
        register();
        let query = UpdateMany::<Item>::new(
            vec![Expr::eq("name", "pen")],
            vec![Update::set([("price", 3)]), Update::set([("name", "ink")])],
        )
        .update(vec![Update::inc([("stock", 1)])]);
        assert_eq!(
            query.build_update().expect("update"),
            doc! { "$set": { "price": 3, "name": "ink" }, "$inc": { "stock": 1 } }
        );
        assert_eq!(query.build_query().expect("filter"), doc! { "name": "pen" });
    }

    #[test]
    fn deferred_updates_are_queued_and_reject_upsert() {
        register();
        let writer = BulkWriter::new();
        let query = UpdateOne::<Item>::new(vec![], vec![Update::set([("price", 1)])])
            .bulk_writer(writer.clone());
        let filter = query.build_query().expect("filter");
        let update = query.build_update().expect("update");
        assert_eq!(
            query.deferred(filter.clone(), update.clone(), false).expect("queued"),
            UpdateOutput::Queued
        );
        assert_eq!(writer.len(), 1);

        let upsert = UpdateOne::<Item>::new(vec![], vec![Update::set([("price", 1)])])
            .bulk_writer(writer.clone())
            .upsert(Item::new("pen", 1));
        assert!(upsert.deferred(filter, update, false).is_err());
        assert_eq!(writer.len(), 1);
    }

    #[test]
    fn upsert_inserts_when_nothing_matches() {
        register();
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let conn = MemoryConnection::new();
            seed_items(&cx, &conn, &[("pen", 1)]).await;

            let hit = UpdateOne::<Item>::new(vec![Expr::eq("name", "pen")], vec![Update::set([("price", 2_i64)])])
                .upsert(Item::new("pen", 99))
                .execute(&cx, &conn)
                .await;
            assert!(matches!(hit, Outcome::Ok(UpdateOutput::Updated(ref r)) if r.matched_count == 1));
            assert_eq!(conn.documents(ITEMS).len(), 1);

            let miss = UpdateMany::<Item>::new(vec![Expr::eq("name", "zzz")], vec![Update::set([("price", 2_i64)])])
                .upsert(Item::new("zzz", 7))
                .execute(&cx, &conn)
                .await;
            let id = match miss {
                Outcome::Ok(UpdateOutput::Inserted(id)) => id,
                other => panic!("expected the upsert document to be inserted, got {other:?}"),
            };
            let stored = conn.documents(ITEMS);
            assert_eq!(stored.len(), 2);
            let inserted = stored
                .iter()
                .find(|d| d.get("_id") == Some(&id))
                .expect("inserted document");
            assert_eq!(inserted.get_str("name").expect("name"), "zzz");
            assert_eq!(inserted.get_i64("price").expect("price"), 7);
        });
    }
}
