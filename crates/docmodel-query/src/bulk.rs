//! Deferred write queue.

use bson::Document;
use docmodel_core::{
    BulkWriteResult, Connection, Cx, Error, Outcome, SchemaDescriptor, Session, WriteModel,
};
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone)]
struct QueuedWrite {
    schema: &'static str,
    collection: String,
    model: WriteModel,
}

/// Ordered queue of write operations committed in one `bulk_write`.
///
/// Handles are cheap to clone and share one queue. Every queued
/// operation must target the same schema.
///
/// # Example
///
/// ```ignore
/// let writer = BulkWriter::new();
/// FindMany::<Item>::new()
///     .find(Expr::eq("name", "pen"))
///     .set([("price", 2)])
///     .bulk_writer(writer.clone())
///     .execute(&cx, &conn)
///     .await;
/// writer.commit(&cx, &conn).await;
/// ```
#[derive(Debug, Clone, Default)]
pub struct BulkWriter {
    queue: Arc<Mutex<Vec<QueuedWrite>>>,
    session: Option<Session>,
}

impl BulkWriter {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_session(mut self, session: Session) -> Self {
        self.session = Some(session);
        self
    }

    /// Queue an operation on the collection of `schema`.
    pub fn add(&self, schema: &'static SchemaDescriptor, model: WriteModel) {
        tracing::trace!(schema = schema.name, operation = model.kind(), "Queued bulk operation");
        self.lock().push(QueuedWrite {
            schema: schema.name,
            collection: schema.collection_name().to_string(),
            model,
        });
    }

    /// Queue an insert of an already encoded document.
    pub fn add_insert(&self, schema: &'static SchemaDescriptor, document: Document) {
        self.add(schema, WriteModel::InsertOne { document });
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Queued operations in insertion order.
    pub fn operations(&self) -> Vec<WriteModel> {
        self.lock().iter().map(|w| w.model.clone()).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<QueuedWrite>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Issue every queued operation in order and clear the queue.
    ///
    /// Operations for more than one schema are rejected and stay queued.
    #[tracing::instrument(level = "debug", skip(self, cx, conn))]
    pub async fn commit<C: Connection>(&self, cx: &Cx, conn: &C) -> Outcome<BulkWriteResult, Error> {
        let (collection, models) = {
            let mut queue = self.lock();
            let Some(first) = queue.first() else {
                return Outcome::Ok(BulkWriteResult::default());
            };
            if let Some(other) = queue.iter().find(|w| w.schema != first.schema) {
                return Outcome::Err(Error::unsupported(
                    "bulk_write",
                    format!(
                        "all operations must target one document type, found '{}' and '{}'",
                        first.schema, other.schema
                    ),
                ));
            }
            let collection = first.collection.clone();
            let models: Vec<WriteModel> = queue.drain(..).map(|w| w.model).collect();
            (collection, models)
        };
        tracing::debug!(collection = %collection, operations = models.len(), "Committing bulk write");
        conn.bulk_write(cx, &collection, &models, self.session.as_ref())
            .await
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
    fn commit_applies_in_order_and_clears() {
        register();
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let conn = MemoryConnection::new();
            let writer = BulkWriter::new();
            writer.add_insert(item_schema(), doc! { "_id": 1, "name": "pen", "price": 1_i64 });
            writer.add(
                item_schema(),
                WriteModel::UpdateOne {
                    filter: doc! { "_id": 1 },
                    update: doc! { "$set": { "price": 4_i64 } },
                    upsert: false,
                },
            );
            assert_eq!(writer.operations()[1].kind(), "update_one");

            let result = writer.commit(&cx, &conn).await;
            assert!(matches!(result, Outcome::Ok(ref r) if r.inserted_count == 1 && r.modified_count == 1));
            assert!(writer.is_empty());
            assert_eq!(conn.documents(ITEMS)[0].get_i64("price").expect("price"), 4);
        });
    }

    #[test]
    fn mixed_schemas_are_rejected() {
        register();
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let conn = MemoryConnection::new();
            let writer = BulkWriter::new();
            writer.add_insert(item_schema(), doc! { "_id": 1 });
            writer.add_insert(maker_schema(), doc! { "_id": 2 });
            let result = writer.commit(&cx, &conn).await;
            assert!(matches!(result, Outcome::Err(ref e) if e.to_string().contains("one document type")));
            assert_eq!(writer.len(), 2);
        });
    }
}
