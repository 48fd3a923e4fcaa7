//! In-process document store implementing [`Connection`].
//!
//! Collections live behind one mutex. Every operation runs synchronously
//! under the lock and hands back a ready future, so a connection can be
//! shared freely across tasks.

use crate::matcher::{self, values_at, values_equal};
use crate::path::get_path;
use crate::pipeline::{self, CollectionSource};
use crate::update::{self, is_operator_update, upsert_seed};
use bson::{Bson, Document, doc, oid::ObjectId};
use docmodel_core::{
    BulkWriteResult, Connection, Cx, DeleteResult, DriverErrorKind, Error, FindOneAndUpdateOptions,
    FindOptions, IndexModel, InsertManyResult, InsertOneResult, Outcome, Result, ReturnDocument,
    Session, UpdateResult, WriteModel,
};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Name of the implicit unique index on `_id`.
pub const ID_INDEX: &str = "_id_";

/// Configuration for an in-process store.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Database name, reported in logs.
    pub database: String,
    /// Major version reported by `server_major_version`.
    pub server_version: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            database: "test".to_string(),
            server_version: 7,
        }
    }
}

impl MemoryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the database name.
    pub fn database(mut self, name: impl Into<String>) -> Self {
        self.database = name.into();
        self
    }

    /// Set the reported server major version.
    pub fn server_version(mut self, version: u32) -> Self {
        self.server_version = version;
        self
    }
}

#[derive(Debug, Default)]
struct Collection {
    documents: Vec<Document>,
    indexes: Vec<IndexModel>,
}

impl Collection {
    fn positions(&self, filter: &Document, first_only: bool) -> Result<Vec<usize>> {
        let mut out = Vec::new();
        for (i, doc) in self.documents.iter().enumerate() {
            if matcher::matches(doc, filter)? {
                out.push(i);
                if first_only {
                    break;
                }
            }
        }
        Ok(out)
    }

    /// Reject `candidate` if it collides on `_id` or a unique index.
    fn check_unique(&self, collection: &str, candidate: &Document, skip: Option<usize>) -> Result<()> {
        let others = || {
            self.documents
                .iter()
                .enumerate()
                .filter(move |(i, _)| Some(*i) != skip)
                .map(|(_, d)| d)
        };
        if let Some(id) = candidate.get("_id") {
            if others().any(|d| d.get("_id").is_some_and(|other| values_equal(other, id))) {
                return Err(duplicate_key(collection, ID_INDEX, id));
            }
        }
        for index in self.indexes.iter().filter(|i| i.unique) {
            let key = index_key(index, candidate);
            if others().any(|d| {
                index_key(index, d)
                    .iter()
                    .zip(&key)
                    .all(|(a, b)| values_equal(a, b))
            }) {
                return Err(duplicate_key(
                    collection,
                    &index.resolved_name(),
                    &Bson::Array(key),
                ));
            }
        }
        Ok(())
    }
}

fn index_key(index: &IndexModel, doc: &Document) -> Vec<Bson> {
    index
        .keys
        .keys()
        .map(|field| get_path(doc, field).cloned().unwrap_or(Bson::Null))
        .collect()
}

fn duplicate_key(collection: &str, index: &str, key: &Bson) -> Error {
    Error::driver(
        DriverErrorKind::DuplicateKey,
        format!("E11000 duplicate key error collection: {collection} index: {index} dup key: {key}"),
    )
}

fn command(message: impl Into<String>) -> Error {
    Error::driver(DriverErrorKind::Command, message)
}

#[derive(Debug, Default)]
struct Store {
    collections: BTreeMap<String, Collection>,
}

impl Store {
    fn collection(&mut self, name: &str) -> &mut Collection {
        self.collections.entry(name.to_string()).or_default()
    }
}

impl CollectionSource for Store {
    fn documents(&self, collection: &str) -> &[Document] {
        self.collections
            .get(collection)
            .map(|c| c.documents.as_slice())
            .unwrap_or_default()
    }
}

/// Identity first, as the server stores it.
fn with_id(document: &Document) -> (Bson, Document) {
    if let Some(id) = document.get("_id") {
        return (id.clone(), document.clone());
    }
    let id = Bson::ObjectId(ObjectId::new());
    let mut out = doc! { "_id": id.clone() };
    for (key, value) in document {
        out.insert(key.clone(), value.clone());
    }
    (id, out)
}

/// A shared in-process document store.
#[derive(Debug, Default)]
pub struct MemoryConnection {
    inner: Mutex<Store>,
    config: MemoryConfig,
}

impl MemoryConnection {
    /// An empty store with the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: MemoryConfig) -> Self {
        Self {
            inner: Mutex::new(Store::default()),
            config,
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of a collection in storage order.
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.lock().documents(collection).to_vec()
    }

    /// Names of collections that have been written to.
    pub fn collection_names(&self) -> Vec<String> {
        self.lock().collections.keys().cloned().collect()
    }

    /// Drop every collection.
    pub fn clear(&self) {
        self.lock().collections.clear();
    }

    // ==================== Synchronous operations ====================

    fn find_sync(&self, collection: &str, filter: &Document, options: &FindOptions) -> Result<Vec<Document>> {
        let store = self.lock();
        let mut docs = Vec::new();
        for doc in store.documents(collection) {
            if matcher::matches(doc, filter)? {
                docs.push(doc.clone());
            }
        }
        if let Some(sort) = &options.sort {
            pipeline::sort_documents(&mut docs, sort);
        }
        let skip = options.skip.map_or(0, |n| usize::try_from(n).unwrap_or(usize::MAX));
        let mut docs: Vec<Document> = docs.into_iter().skip(skip).collect();
        if let Some(limit) = options.limit.filter(|n| *n != 0) {
            docs.truncate(usize::try_from(limit.unsigned_abs()).unwrap_or(usize::MAX));
        }
        if let Some(projection) = &options.projection {
            let vars = Document::new();
            docs = docs
                .iter()
                .map(|d| pipeline::project(d, projection, &vars))
                .collect::<Result<_>>()?;
        }
        tracing::trace!(collection, returned = docs.len(), "find");
        Ok(docs)
    }

    fn insert_sync(&self, collection: &str, documents: &[Document]) -> Result<Vec<Bson>> {
        let mut store = self.lock();
        let coll = store.collection(collection);
        let mut ids = Vec::with_capacity(documents.len());
        for document in documents {
            let (id, stored) = with_id(document);
            coll.check_unique(collection, &stored, None)?;
            coll.documents.push(stored);
            ids.push(id);
        }
        tracing::trace!(collection, inserted = ids.len(), "insert");
        Ok(ids)
    }

    fn update_sync(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
        upsert: bool,
        many: bool,
    ) -> Result<UpdateResult> {
        if !is_operator_update(update) {
            return Err(command("update document requires atomic operators"));
        }
        let mut store = self.lock();
        let coll = store.collection(collection);
        let positions = coll.positions(filter, !many)?;
        let mut result = UpdateResult {
            matched_count: positions.len() as u64,
            ..UpdateResult::default()
        };
        for i in positions {
            let mut doc = coll.documents[i].clone();
            if update::apply(&mut doc, update, false)? {
                coll.check_unique(collection, &doc, Some(i))?;
                coll.documents[i] = doc;
                result.modified_count += 1;
            }
        }
        if result.matched_count == 0 && upsert {
            let mut seed = upsert_seed(filter)?;
            update::apply(&mut seed, update, true)?;
            let (id, stored) = with_id(&seed);
            coll.check_unique(collection, &stored, None)?;
            coll.documents.push(stored);
            result.upserted_id = Some(id);
        }
        tracing::trace!(
            collection,
            matched = result.matched_count,
            modified = result.modified_count,
            "update"
        );
        Ok(result)
    }

    fn find_one_and_update_sync(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
        options: &FindOneAndUpdateOptions,
    ) -> Result<Option<Document>> {
        let mut store = self.lock();
        let coll = store.collection(collection);
        let found = coll.positions(filter, true)?.first().copied();
        let (before, after) = match found {
            Some(i) => {
                let before = coll.documents[i].clone();
                let mut after = before.clone();
                if update::apply(&mut after, update, false)? {
                    coll.check_unique(collection, &after, Some(i))?;
                    coll.documents[i] = after.clone();
                }
                (Some(before), after)
            }
            None if options.upsert => {
                let mut seed = upsert_seed(filter)?;
                update::apply(&mut seed, update, true)?;
                let (_, stored) = with_id(&seed);
                coll.check_unique(collection, &stored, None)?;
                coll.documents.push(stored.clone());
                (None, stored)
            }
            None => return Ok(None),
        };
        let chosen = match options.return_document {
            ReturnDocument::Before => before,
            ReturnDocument::After => Some(after),
        };
        match (&options.projection, chosen) {
            (Some(projection), Some(doc)) => pipeline::project(&doc, projection, &Document::new()).map(Some),
            (_, chosen) => Ok(chosen),
        }
    }

    fn replace_sync(
        &self,
        collection: &str,
        filter: &Document,
        replacement: &Document,
        upsert: bool,
    ) -> Result<UpdateResult> {
        if is_operator_update(replacement) {
            return Err(command("replacement document must not contain update operators"));
        }
        let mut store = self.lock();
        let coll = store.collection(collection);
        let mut result = UpdateResult::default();
        match coll.positions(filter, true)?.first().copied() {
            Some(i) => {
                result.matched_count = 1;
                let existing_id = coll.documents[i].get("_id").cloned();
                if let (Some(new), Some(old)) = (replacement.get("_id"), &existing_id) {
                    if !values_equal(new, old) {
                        return Err(command(
                            "the _id field cannot be changed by a replacement",
                        ));
                    }
                }
                let mut stored = Document::new();
                if let Some(id) = existing_id {
                    stored.insert("_id", id);
                }
                for (key, value) in replacement.iter().filter(|(k, _)| k.as_str() != "_id") {
                    stored.insert(key.clone(), value.clone());
                }
                if stored != coll.documents[i] {
                    coll.check_unique(collection, &stored, Some(i))?;
                    coll.documents[i] = stored;
                    result.modified_count = 1;
                }
            }
            None if upsert => {
                let mut seed = upsert_seed(filter)?;
                for (key, value) in replacement {
                    seed.insert(key.clone(), value.clone());
                }
                let (id, stored) = with_id(&seed);
                coll.check_unique(collection, &stored, None)?;
                coll.documents.push(stored);
                result.upserted_id = Some(id);
            }
            None => {}
        }
        tracing::trace!(collection, matched = result.matched_count, "replace");
        Ok(result)
    }

    fn delete_sync(&self, collection: &str, filter: &Document, many: bool) -> Result<DeleteResult> {
        let mut store = self.lock();
        let coll = store.collection(collection);
        let positions = coll.positions(filter, !many)?;
        for i in positions.iter().rev() {
            coll.documents.remove(*i);
        }
        tracing::trace!(collection, deleted = positions.len(), "delete");
        Ok(DeleteResult {
            deleted_count: positions.len() as u64,
        })
    }

    fn aggregate_sync(&self, collection: &str, stages: &[Document]) -> Result<Vec<Document>> {
        let store = self.lock();
        let input = store.documents(collection).to_vec();
        let out = pipeline::run(&*store, input, stages, &Document::new())?;
        tracing::trace!(collection, stages = stages.len(), returned = out.len(), "aggregate");
        Ok(out)
    }

    fn count_sync(&self, collection: &str, filter: &Document) -> Result<u64> {
        let store = self.lock();
        let mut n = 0;
        for doc in store.documents(collection) {
            if matcher::matches(doc, filter)? {
                n += 1;
            }
        }
        Ok(n)
    }

    fn distinct_sync(&self, collection: &str, key: &str, filter: &Document) -> Result<Vec<Bson>> {
        let store = self.lock();
        let mut out: Vec<Bson> = Vec::new();
        for doc in store.documents(collection) {
            if !matcher::matches(doc, filter)? {
                continue;
            }
            for value in values_at(doc, key) {
                let items = match value {
                    Bson::Array(items) => items,
                    other => vec![other],
                };
                for item in items {
                    if !out.iter().any(|seen| values_equal(seen, &item)) {
                        out.push(item);
                    }
                }
            }
        }
        Ok(out)
    }

    fn bulk_write_sync(&self, collection: &str, operations: &[WriteModel]) -> Result<BulkWriteResult> {
        let mut result = BulkWriteResult::default();
        for (index, operation) in operations.iter().enumerate() {
            let updated = match operation {
                WriteModel::InsertOne { document } => {
                    self.insert_sync(collection, std::slice::from_ref(document))?;
                    result.inserted_count += 1;
                    None
                }
                WriteModel::UpdateOne { filter, update, upsert } => {
                    Some(self.update_sync(collection, filter, update, *upsert, false)?)
                }
                WriteModel::UpdateMany { filter, update, upsert } => {
                    Some(self.update_sync(collection, filter, update, *upsert, true)?)
                }
                WriteModel::ReplaceOne { filter, replacement, upsert } => {
                    Some(self.replace_sync(collection, filter, replacement, *upsert)?)
                }
                WriteModel::DeleteOne { filter } => {
                    result.deleted_count += self.delete_sync(collection, filter, false)?.deleted_count;
                    None
                }
                WriteModel::DeleteMany { filter } => {
                    result.deleted_count += self.delete_sync(collection, filter, true)?.deleted_count;
                    None
                }
            };
            if let Some(updated) = updated {
                result.matched_count += updated.matched_count;
                result.modified_count += updated.modified_count;
                if let Some(id) = updated.upserted_id {
                    result.upserted_ids.push((index, id));
                }
            }
        }
        Ok(result)
    }

    fn create_indexes_sync(&self, collection: &str, indexes: &[IndexModel]) -> Result<Vec<String>> {
        let mut store = self.lock();
        let coll = store.collection(collection);
        let mut names = Vec::with_capacity(indexes.len());
        for index in indexes {
            let name = index.resolved_name();
            if index.unique {
                let keys: Vec<Vec<Bson>> = coll.documents.iter().map(|d| index_key(index, d)).collect();
                for (i, key) in keys.iter().enumerate() {
                    let clash = keys[..i]
                        .iter()
                        .any(|other| other.iter().zip(key).all(|(a, b)| values_equal(a, b)));
                    if clash {
                        return Err(duplicate_key(collection, &name, &Bson::Array(key.clone())));
                    }
                }
            }
            coll.indexes.retain(|existing| existing.resolved_name() != name);
            coll.indexes.push(index.clone());
            tracing::debug!(collection, index = %name, unique = index.unique, "Created index");
            names.push(name);
        }
        Ok(names)
    }

    fn drop_index_sync(&self, collection: &str, name: &str) -> Result<()> {
        if name == ID_INDEX {
            return Err(command("cannot drop _id index"));
        }
        let mut store = self.lock();
        let coll = store.collection(collection);
        let before = coll.indexes.len();
        coll.indexes.retain(|existing| existing.resolved_name() != name);
        if coll.indexes.len() == before {
            return Err(command(format!("index not found with name [{name}]")));
        }
        Ok(())
    }

    fn index_information_sync(&self, collection: &str) -> Document {
        let store = self.lock();
        let mut info = doc! { ID_INDEX: { "_id": 1 } };
        if let Some(coll) = store.collections.get(collection) {
            for index in &coll.indexes {
                info.insert(index.resolved_name(), index.keys.clone());
            }
        }
        info
    }
}

/// Run `op` unless the context is cancelled, as a ready future.
fn ready<T: Send>(cx: &Cx, session: Option<&Session>, op: impl FnOnce() -> Result<T>) -> impl Future<Output = Outcome<T, Error>> + Send {
    let outcome = match cx.cancel_reason() {
        Some(reason) => Outcome::Cancelled(reason),
        None => {
            if let Some(session) = session {
                tracing::trace!(session = session.id(), "Operation in session");
            }
            op().map_or_else(Outcome::Err, Outcome::Ok)
        }
    };
    async move { outcome }
}

impl Connection for MemoryConnection {
    fn find(
        &self,
        cx: &Cx,
        collection: &str,
        filter: &Document,
        options: &FindOptions,
        session: Option<&Session>,
    ) -> impl Future<Output = Outcome<Vec<Document>, Error>> + Send {
        ready(cx, session, move || self.find_sync(collection, filter, options))
    }

    fn find_one(
        &self,
        cx: &Cx,
        collection: &str,
        filter: &Document,
        options: &FindOptions,
        session: Option<&Session>,
    ) -> impl Future<Output = Outcome<Option<Document>, Error>> + Send {
        let options = FindOptions {
            limit: Some(1),
            ..options.clone()
        };
        ready(cx, session, move || {
            self.find_sync(collection, filter, &options)
                .map(|docs| docs.into_iter().next())
        })
    }

    fn insert_one(
        &self,
        cx: &Cx,
        collection: &str,
        document: &Document,
        session: Option<&Session>,
    ) -> impl Future<Output = Outcome<InsertOneResult, Error>> + Send {
        ready(cx, session, move || {
            let mut ids = self.insert_sync(collection, std::slice::from_ref(document))?;
            let inserted_id = ids.pop().unwrap_or(Bson::Null);
            Ok(InsertOneResult { inserted_id })
        })
    }

    fn insert_many(
        &self,
        cx: &Cx,
        collection: &str,
        documents: &[Document],
        session: Option<&Session>,
    ) -> impl Future<Output = Outcome<InsertManyResult, Error>> + Send {
        ready(cx, session, move || {
            self.insert_sync(collection, documents)
                .map(|inserted_ids| InsertManyResult { inserted_ids })
        })
    }

    fn update_one(
        &self,
        cx: &Cx,
        collection: &str,
        filter: &Document,
        update: &Document,
        upsert: bool,
        session: Option<&Session>,
    ) -> impl Future<Output = Outcome<UpdateResult, Error>> + Send {
        ready(cx, session, move || self.update_sync(collection, filter, update, upsert, false))
    }

    fn update_many(
        &self,
        cx: &Cx,
        collection: &str,
        filter: &Document,
        update: &Document,
        upsert: bool,
        session: Option<&Session>,
    ) -> impl Future<Output = Outcome<UpdateResult, Error>> + Send {
        ready(cx, session, move || self.update_sync(collection, filter, update, upsert, true))
    }

    fn find_one_and_update(
        &self,
        cx: &Cx,
        collection: &str,
        filter: &Document,
        update: &Document,
        options: &FindOneAndUpdateOptions,
        session: Option<&Session>,
    ) -> impl Future<Output = Outcome<Option<Document>, Error>> + Send {
        ready(cx, session, move || {
            self.find_one_and_update_sync(collection, filter, update, options)
        })
    }

    fn replace_one(
        &self,
        cx: &Cx,
        collection: &str,
        filter: &Document,
        replacement: &Document,
        upsert: bool,
        session: Option<&Session>,
    ) -> impl Future<Output = Outcome<UpdateResult, Error>> + Send {
        ready(cx, session, move || self.replace_sync(collection, filter, replacement, upsert))
    }

    fn delete_one(
        &self,
        cx: &Cx,
        collection: &str,
        filter: &Document,
        session: Option<&Session>,
    ) -> impl Future<Output = Outcome<DeleteResult, Error>> + Send {
        ready(cx, session, move || self.delete_sync(collection, filter, false))
    }

    fn delete_many(
        &self,
        cx: &Cx,
        collection: &str,
        filter: &Document,
        session: Option<&Session>,
    ) -> impl Future<Output = Outcome<DeleteResult, Error>> + Send {
        ready(cx, session, move || self.delete_sync(collection, filter, true))
    }

    fn aggregate(
        &self,
        cx: &Cx,
        collection: &str,
        pipeline: &[Document],
        session: Option<&Session>,
    ) -> impl Future<Output = Outcome<Vec<Document>, Error>> + Send {
        ready(cx, session, move || self.aggregate_sync(collection, pipeline))
    }

    fn count_documents(
        &self,
        cx: &Cx,
        collection: &str,
        filter: &Document,
        session: Option<&Session>,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        ready(cx, session, move || self.count_sync(collection, filter))
    }

    fn distinct(
        &self,
        cx: &Cx,
        collection: &str,
        key: &str,
        filter: &Document,
        session: Option<&Session>,
    ) -> impl Future<Output = Outcome<Vec<Bson>, Error>> + Send {
        ready(cx, session, move || self.distinct_sync(collection, key, filter))
    }

    fn bulk_write(
        &self,
        cx: &Cx,
        collection: &str,
        operations: &[WriteModel],
        session: Option<&Session>,
    ) -> impl Future<Output = Outcome<BulkWriteResult, Error>> + Send {
        ready(cx, session, move || self.bulk_write_sync(collection, operations))
    }

    fn create_indexes(
        &self,
        cx: &Cx,
        collection: &str,
        indexes: &[IndexModel],
        session: Option<&Session>,
    ) -> impl Future<Output = Outcome<Vec<String>, Error>> + Send {
        ready(cx, session, move || self.create_indexes_sync(collection, indexes))
    }

    fn drop_index(
        &self,
        cx: &Cx,
        collection: &str,
        name: &str,
        session: Option<&Session>,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        ready(cx, session, move || self.drop_index_sync(collection, name))
    }

    fn index_information(
        &self,
        cx: &Cx,
        collection: &str,
        session: Option<&Session>,
    ) -> impl Future<Output = Outcome<Document, Error>> + Send {
        ready(cx, session, move || Ok(self.index_information_sync(collection)))
    }

    fn server_major_version(&self, cx: &Cx) -> impl Future<Output = Outcome<u32, Error>> + Send {
        tracing::trace!(database = %self.config.database, version = self.config.server_version, "Server version");
        ready(cx, None, move || Ok(self.config.server_version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;

    fn ok<T>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(value) => value,
            Outcome::Err(e) => panic!("unexpected error: {e}"),
            _ => panic!("operation did not complete"),
        }
    }

    #[test]
    fn insert_assigns_ids_and_rejects_duplicates() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = &Cx::for_testing();
            let conn = &MemoryConnection::new();
            let first = ok(conn.insert_one(cx, "pets", &doc! { "name": "rex" }, None).await);
            assert!(matches!(first.inserted_id, Bson::ObjectId(_)));
            let stored = conn.documents("pets");
            assert_eq!(stored[0].keys().next().map(String::as_str), Some("_id"));

            ok(conn.insert_one(cx, "pets", &doc! { "_id": 1, "name": "tom" }, None).await);
            match conn.insert_one(cx, "pets", &doc! { "_id": 1 }, None).await {
                Outcome::Err(e) => assert!(e.is_duplicate_key(), "{e}"),
                _ => panic!("duplicate id accepted"),
            }
        });
    }

    #[test]
    fn find_sorts_skips_limits_and_projects() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = &Cx::for_testing();
            let conn = &MemoryConnection::new();
            let docs: Vec<Document> = (1..=5).map(|n| doc! { "_id": n, "n": 6 - n }).collect();
            ok(conn.insert_many(cx, "nums", &docs, None).await);
            let options = FindOptions {
                sort: Some(doc! { "n": 1 }),
                skip: Some(1),
                limit: Some(2),
                projection: Some(doc! { "n": 1, "_id": 0 }),
            };
            let found = ok(conn.find(cx, "nums", &doc! { "n": { "$gte": 2 } }, &options, None).await);
            assert_eq!(found, vec![doc! { "n": 3 }, doc! { "n": 4 }]);
            assert_eq!(ok(conn.count_documents(cx, "nums", &doc! {}, None).await), 5);
            let distinct = ok(conn.distinct(cx, "nums", "n", &doc! { "n": { "$lt": 3 } }, None).await);
            assert_eq!(distinct.len(), 2);
        });
    }

    #[test]
    fn updates_upserts_and_returned_documents() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = &Cx::for_testing();
            let conn = &MemoryConnection::new();
            ok(conn.insert_one(cx, "items", &doc! { "_id": 1, "price": 1 }, None).await);
            let updated = ok(conn
                .update_many(cx, "items", &doc! { "price": 1 }, &doc! { "$inc": { "price": 1 } }, false, None)
                .await);
            assert_eq!((updated.matched_count, updated.modified_count), (1, 1));

            let upserted = ok(conn
                .update_one(cx, "items", &doc! { "name": "ink" }, &doc! { "$set": { "price": 9 } }, true, None)
                .await);
            assert!(upserted.upserted_id.is_some());
            let ink = ok(conn.find_one(cx, "items", &doc! { "name": "ink" }, &FindOptions::default(), None).await);
            assert_eq!(ink.and_then(|d| d.get_i32("price").ok()), Some(9));

            let options = FindOneAndUpdateOptions {
                return_document: ReturnDocument::After,
                ..FindOneAndUpdateOptions::default()
            };
            let after = ok(conn
                .find_one_and_update(cx, "items", &doc! { "_id": 1 }, &doc! { "$set": { "price": 5 } }, &options, None)
                .await);
            assert_eq!(after, Some(doc! { "_id": 1, "price": 5 }));

            let replaced = ok(conn
                .replace_one(cx, "items", &doc! { "_id": 1 }, &doc! { "name": "pen" }, false, None)
                .await);
            assert_eq!(replaced.modified_count, 1);
            assert_eq!(conn.documents("items")[0], doc! { "_id": 1, "name": "pen" });
            assert!(matches!(
                conn.update_one(cx, "items", &doc! {}, &doc! { "name": "x" }, false, None).await,
                Outcome::Err(_)
            ));
        });
    }

    #[test]
    fn unique_indexes_and_bulk_writes() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = &Cx::for_testing();
            let conn = &MemoryConnection::new();
            let names = ok(conn
                .create_indexes(cx, "users", &[IndexModel::new(doc! { "email": 1 }).unique(true)], None)
                .await);
            assert_eq!(names, vec!["email_1".to_string()]);
            let info = ok(conn.index_information(cx, "users", None).await);
            assert!(info.contains_key(ID_INDEX) && info.contains_key("email_1"));

            let ops = vec![
                WriteModel::InsertOne { document: doc! { "_id": 1, "email": "a@x" } },
                WriteModel::UpdateOne { filter: doc! { "_id": 1 }, update: doc! { "$set": { "n": 1 } }, upsert: false },
                WriteModel::UpdateOne { filter: doc! { "_id": 2 }, update: doc! { "$set": { "email": "b@x" } }, upsert: true },
                WriteModel::DeleteOne { filter: doc! { "_id": 1 } },
            ];
            let result = ok(conn.bulk_write(cx, "users", &ops, None).await);
            assert_eq!(result.inserted_count, 1);
            assert_eq!(result.modified_count, 1);
            assert_eq!(result.deleted_count, 1);
            assert_eq!(result.upserted_ids, vec![(2, Bson::Int32(2))]);

            match conn.insert_one(cx, "users", &doc! { "email": "b@x" }, None).await {
                Outcome::Err(e) => assert!(e.is_duplicate_key()),
                _ => panic!("unique index not enforced"),
            }
            ok(conn.drop_index(cx, "users", "email_1", None).await);
            assert!(matches!(conn.drop_index(cx, "users", ID_INDEX, None).await, Outcome::Err(_)));
        });
    }

    #[test]
    fn server_version_is_configurable() {
        let conn = MemoryConnection::with_config(MemoryConfig::new().server_version(4).database("legacy"));
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        let version = rt.block_on(async {
            let cx = Cx::for_testing();
            conn.server_major_version(&cx).await
        });
        assert!(matches!(version, Outcome::Ok(4)));
        assert_eq!(conn.config().database, "legacy");
    }
}
