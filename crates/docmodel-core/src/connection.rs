//! Document driver abstraction.
//!
//! [`Connection`] is the boundary to the external document database. All
//! operations take the target collection by name, an optional [`Session`]
//! for transactional grouping, and integrate with asupersync's structured
//! concurrency via `Cx`.

use bson::{Bson, Document};
use asupersync::{Cx, Outcome};

/// Opaque session handle passed through to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Session {
    id: u64,
}

impl Session {
    pub const fn new(id: u64) -> Self {
        Self { id }
    }

    pub const fn id(&self) -> u64 {
        self.id
    }
}

/// Options for `find`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub sort: Option<Document>,
    pub skip: Option<u64>,
    pub limit: Option<i64>,
    pub projection: Option<Document>,
}

/// Which version of the document `find_one_and_update` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnDocument {
    #[default]
    Before,
    After,
}

/// Options for `find_one_and_update`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOneAndUpdateOptions {
    pub upsert: bool,
    pub return_document: ReturnDocument,
    pub projection: Option<Document>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertOneResult {
    pub inserted_id: Bson,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct InsertManyResult {
    pub inserted_ids: Vec<Bson>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpdateResult {
    pub matched_count: u64,
    pub modified_count: u64,
    pub upserted_id: Option<Bson>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeleteResult {
    pub deleted_count: u64,
}

/// One queued operation of a bulk write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteModel {
    InsertOne {
        document: Document,
    },
    UpdateOne {
        filter: Document,
        update: Document,
        upsert: bool,
    },
    UpdateMany {
        filter: Document,
        update: Document,
        upsert: bool,
    },
    ReplaceOne {
        filter: Document,
        replacement: Document,
        upsert: bool,
    },
    DeleteOne {
        filter: Document,
    },
    DeleteMany {
        filter: Document,
    },
}

impl WriteModel {
    pub fn kind(&self) -> &'static str {
        match self {
            WriteModel::InsertOne { .. } => "insert_one",
            WriteModel::UpdateOne { .. } => "update_one",
            WriteModel::UpdateMany { .. } => "update_many",
            WriteModel::ReplaceOne { .. } => "replace_one",
            WriteModel::DeleteOne { .. } => "delete_one",
            WriteModel::DeleteMany { .. } => "delete_many",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BulkWriteResult {
    pub inserted_count: u64,
    pub matched_count: u64,
    pub modified_count: u64,
    pub deleted_count: u64,
    /// Operation index to upserted id
    pub upserted_ids: Vec<(usize, Bson)>,
}

/// Index definition for `create_indexes`.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexModel {
    pub keys: Document,
    pub name: Option<String>,
    pub unique: bool,
}

impl IndexModel {
    pub fn new(keys: Document) -> Self {
        Self {
            keys,
            name: None,
            unique: false,
        }
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    /// Name the driver uses when none is given: `field_dir` pairs joined by `_`.
    pub fn resolved_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            self.keys
                .iter()
                .map(|(k, v)| format!("{k}_{v}"))
                .collect::<Vec<_>>()
                .join("_")
        })
    }
}

/// A document database driver.
///
/// Implementations must be safe to share across tasks. Failures map onto
/// [`crate::Error::Driver`], with unique index violations reported as
/// [`crate::DriverErrorKind::DuplicateKey`].
pub trait Connection: Send + Sync {
    /// All documents matching `filter`.
    fn find(
        &self,
        cx: &Cx,
        collection: &str,
        filter: &Document,
        options: &FindOptions,
        session: Option<&Session>,
    ) -> impl Future<Output = Outcome<Vec<Document>, crate::Error>> + Send;

    /// The first document matching `filter`.
    fn find_one(
        &self,
        cx: &Cx,
        collection: &str,
        filter: &Document,
        options: &FindOptions,
        session: Option<&Session>,
    ) -> impl Future<Output = Outcome<Option<Document>, crate::Error>> + Send;

    fn insert_one(
        &self,
        cx: &Cx,
        collection: &str,
        document: &Document,
        session: Option<&Session>,
    ) -> impl Future<Output = Outcome<InsertOneResult, crate::Error>> + Send;

    fn insert_many(
        &self,
        cx: &Cx,
        collection: &str,
        documents: &[Document],
        session: Option<&Session>,
    ) -> impl Future<Output = Outcome<InsertManyResult, crate::Error>> + Send;

    fn update_one(
        &self,
        cx: &Cx,
        collection: &str,
        filter: &Document,
        update: &Document,
        upsert: bool,
        session: Option<&Session>,
    ) -> impl Future<Output = Outcome<UpdateResult, crate::Error>> + Send;

    fn update_many(
        &self,
        cx: &Cx,
        collection: &str,
        filter: &Document,
        update: &Document,
        upsert: bool,
        session: Option<&Session>,
    ) -> impl Future<Output = Outcome<UpdateResult, crate::Error>> + Send;

    fn find_one_and_update(
        &self,
        cx: &Cx,
        collection: &str,
        filter: &Document,
        update: &Document,
        options: &FindOneAndUpdateOptions,
        session: Option<&Session>,
    ) -> impl Future<Output = Outcome<Option<Document>, crate::Error>> + Send;

    fn replace_one(
        &self,
        cx: &Cx,
        collection: &str,
        filter: &Document,
        replacement: &Document,
        upsert: bool,
        session: Option<&Session>,
    ) -> impl Future<Output = Outcome<UpdateResult, crate::Error>> + Send;

    fn delete_one(
        &self,
        cx: &Cx,
        collection: &str,
        filter: &Document,
        session: Option<&Session>,
    ) -> impl Future<Output = Outcome<DeleteResult, crate::Error>> + Send;

    fn delete_many(
        &self,
        cx: &Cx,
        collection: &str,
        filter: &Document,
        session: Option<&Session>,
    ) -> impl Future<Output = Outcome<DeleteResult, crate::Error>> + Send;

    fn aggregate(
        &self,
        cx: &Cx,
        collection: &str,
        pipeline: &[Document],
        session: Option<&Session>,
    ) -> impl Future<Output = Outcome<Vec<Document>, crate::Error>> + Send;

    fn count_documents(
        &self,
        cx: &Cx,
        collection: &str,
        filter: &Document,
        session: Option<&Session>,
    ) -> impl Future<Output = Outcome<u64, crate::Error>> + Send;

    fn distinct(
        &self,
        cx: &Cx,
        collection: &str,
        key: &str,
        filter: &Document,
        session: Option<&Session>,
    ) -> impl Future<Output = Outcome<Vec<Bson>, crate::Error>> + Send;

    /// Apply `operations` in order, stopping at the first failure.
    fn bulk_write(
        &self,
        cx: &Cx,
        collection: &str,
        operations: &[WriteModel],
        session: Option<&Session>,
    ) -> impl Future<Output = Outcome<BulkWriteResult, crate::Error>> + Send;

    fn create_indexes(
        &self,
        cx: &Cx,
        collection: &str,
        indexes: &[IndexModel],
        session: Option<&Session>,
    ) -> impl Future<Output = Outcome<Vec<String>, crate::Error>> + Send;

    fn drop_index(
        &self,
        cx: &Cx,
        collection: &str,
        name: &str,
        session: Option<&Session>,
    ) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// Index name to index keys.
    fn index_information(
        &self,
        cx: &Cx,
        collection: &str,
        session: Option<&Session>,
    ) -> impl Future<Output = Outcome<Document, crate::Error>> + Send;

    /// Major version of the connected server.
    fn server_major_version(
        &self,
        cx: &Cx,
    ) -> impl Future<Output = Outcome<u32, crate::Error>> + Send;
}
