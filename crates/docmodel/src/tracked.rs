//! Document-level actions with change tracking.
//!
//! A [`TrackedDocument`] pairs a model instance with its [`StateTracker`]
//! and the revision token it was loaded with. Reads through
//! [`DocumentQuery`](crate::DocumentQuery) hydrate tracked documents
//! directly, so a loaded instance can be saved, diffed and rolled back.

use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;

use bson::{Bson, doc, oid::ObjectId};
use docmodel_core::{
    Connection, Cx, Document, Encoder, Error, EventKind, FromStored, LinkedDocument, Outcome,
    Phase, Result, Session, StatePolicy, StateTracker, UpdateResult, Value, WriteModel, registry,
    try_outcome, try_result,
};
use docmodel_query::{BulkWriter, Expr, FindMany, FindOne, Update, UpdateResponse};

/// Stored key of the revision token.
pub const REVISION_FIELD: &str = "revision_id";

/// What a write does with resolved links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteRules {
    /// Store handles only
    #[default]
    DoNothing,
    /// Insert or replace every resolved linked document first
    Write,
}

/// What a delete does with resolved links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeleteRules {
    #[default]
    DoNothing,
    /// Delete every resolved linked document as well
    DeleteLinks,
}

fn new_revision() -> Bson {
    Bson::String(uuid::Uuid::new_v4().to_string())
}

/// Put a known id in front of a stored body.
fn with_id(id: Option<Bson>, body: bson::Document) -> bson::Document {
    let Some(id) = id else {
        return body;
    };
    let mut out = doc! { "_id": id };
    for (key, value) in body {
        out.insert(key, value);
    }
    out
}

/// Link cascades issue their own writes and cannot be queued.
fn reject_deferred_cascade(
    operation: &'static str,
    cascades: bool,
    bulk_writer: Option<&BulkWriter>,
) -> Result<()> {
    if cascades && bulk_writer.is_some() {
        return Err(Error::unsupported(
            operation,
            "cascading link writes cannot be combined with a bulk writer",
        ));
    }
    Ok(())
}

type Action<'a> = Pin<Box<dyn Future<Output = Outcome<(), Error>> + 'a>>;

/// Upsert a linked document after its own links, depth first.
fn write_linked<'a, C: Connection>(
    cx: &'a Cx,
    conn: &'a C,
    target: &'a mut dyn LinkedDocument,
    session: Option<&'a Session>,
) -> Action<'a> {
    Box::pin(async move {
        for nested in target.nested_links_mut() {
            try_outcome!(write_linked(cx, conn, nested, session).await);
        }
        let schema = target.linked_schema();
        let collection = schema.collection_name();
        let encoder = Encoder::for_storage(schema).exclude(["_id"]);
        let body = try_result!(encoder.encode_model(&target.linked_value()));
        match target.linked_id() {
            Some(id) => {
                try_outcome!(
                    conn.replace_one(cx, collection, &doc! { "_id": id }, &body, true, session)
                        .await
                );
            }
            None => {
                let inserted = try_outcome!(conn.insert_one(cx, collection, &body, session).await);
                target.assign_id(inserted.inserted_id);
            }
        }
        tracing::trace!(collection, "Wrote linked document");
        Outcome::Ok(())
    })
}

/// Delete a linked document after its own links, depth first.
fn delete_linked<'a, C: Connection>(
    cx: &'a Cx,
    conn: &'a C,
    target: &'a mut dyn LinkedDocument,
    session: Option<&'a Session>,
) -> Action<'a> {
    Box::pin(async move {
        for nested in target.nested_links_mut() {
            try_outcome!(delete_linked(cx, conn, nested, session).await);
        }
        if let Some(id) = target.linked_id() {
            let collection = target.linked_schema().collection_name();
            try_outcome!(conn.delete_one(cx, collection, &doc! { "_id": id }, session).await);
            tracing::trace!(collection, "Deleted linked document");
        }
        Outcome::Ok(())
    })
}

/// A model instance with its saved state and revision token.
#[derive(Debug, Clone)]
pub struct TrackedDocument<T: Document> {
    doc: T,
    state: StateTracker,
    revision_id: Option<Bson>,
    session: Option<Session>,
}

impl<T: Document> Deref for TrackedDocument<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.doc
    }
}

impl<T: Document> DerefMut for TrackedDocument<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.doc
    }
}

impl<T: Document> FromStored for TrackedDocument<T> {
    fn from_stored(stored: &bson::Document) -> Result<Self> {
        let mut tracked = Self::new(T::from_document(stored)?);
        tracked.revision_id = stored.get(REVISION_FIELD).cloned();
        tracked.snapshot()?;
        Ok(tracked)
    }
}

impl<T: Document> TrackedDocument<T> {
    /// Wrap a new, not yet stored instance.
    pub fn new(doc: T) -> Self {
        Self {
            doc,
            state: StateTracker::new(StatePolicy::from(&T::schema().settings)),
            revision_id: None,
            session: None,
        }
    }

    /// Run every action of this instance inside `session`.
    #[must_use]
    pub fn with_session(mut self, session: Session) -> Self {
        self.session = Some(session);
        self
    }

    pub fn inner(&self) -> &T {
        &self.doc
    }

    pub fn inner_mut(&mut self) -> &mut T {
        &mut self.doc
    }

    pub fn into_inner(self) -> T {
        self.doc
    }

    pub fn state(&self) -> &StateTracker {
        &self.state
    }

    /// Revision token of the stored copy this instance last saw.
    pub fn revision_id(&self) -> Option<&Bson> {
        self.revision_id.as_ref()
    }

    // ==================== State ====================

    /// Storage form used for snapshots. Nulls are kept so they diff.
    fn encoded(&self) -> Result<bson::Document> {
        Encoder::for_storage(T::schema())
            .keep_nulls(true)
            .encode_model(&self.doc.to_model_value())
    }

    fn snapshot(&mut self) -> Result<()> {
        let current = self.encoded()?;
        self.state.save(current);
        Ok(())
    }

    pub fn is_changed(&self) -> Result<bool> {
        self.state.is_changed(&self.encoded()?)
    }

    pub fn has_changed(&self) -> Result<bool> {
        self.state.has_changed()
    }

    /// Dotted-path changes since the last load or save.
    pub fn get_changes(&self) -> Result<bson::Document> {
        self.state.get_changes(&self.encoded()?)
    }

    pub fn get_previous_changes(&self) -> Result<bson::Document> {
        self.state.get_previous_changes()
    }

    /// Restore every field, identity included, to the saved state.
    pub fn rollback(&mut self) -> Result<()> {
        let current = self.encoded()?;
        if let Some(saved) = self.state.rollback_target(&current)? {
            self.doc = T::from_document(saved)?;
            tracing::debug!(schema = T::schema().name, "Rolled back document");
        }
        Ok(())
    }

    // ==================== Helpers ====================

    fn require_id(&self) -> Result<Bson> {
        self.doc.id().ok_or_else(|| {
            Error::argument(format!("{} has no id; insert it first", T::schema().name))
        })
    }

    fn checks_revision(&self, ignore_revision: bool) -> bool {
        T::schema().settings.use_revision && !ignore_revision && self.revision_id.is_some()
    }

    /// Query for the stored copy, guarded by the revision when checked.
    fn by_id<P: FromStored>(&self, ignore_revision: bool) -> Result<FindOne<T, P>> {
        let mut query = FindOne::new().find(Expr::eq("_id", Value::Bson(self.require_id()?)));
        if self.checks_revision(ignore_revision) {
            if let Some(revision) = &self.revision_id {
                query = query.find(Expr::eq(REVISION_FIELD, Value::Bson(revision.clone())));
            }
        }
        if let Some(session) = self.session {
            query = query.with_session(session);
        }
        Ok(query)
    }

    fn run_hooks(&mut self, kind: EventKind, phase: Phase) -> Result<()> {
        T::hooks().run(kind, phase, &mut self.doc)
    }

    fn validate_on_save(&mut self) -> Result<()> {
        if !T::schema().settings.validate_on_save {
            return Ok(());
        }
        self.run_hooks(EventKind::ValidateOnSave, Phase::Before)?;
        self.doc.validate()?;
        self.run_hooks(EventKind::ValidateOnSave, Phase::After)
    }

    /// Stored body without `_id`, carrying `revision` when enabled.
    fn stored_body(&self, revision: Option<&Bson>) -> Result<bson::Document> {
        let mut body = Encoder::for_storage(T::schema())
            .exclude(["_id"])
            .encode_model(&self.doc.to_model_value())?;
        if let Some(revision) = revision {
            body.insert(REVISION_FIELD, revision.clone());
        }
        Ok(body)
    }

    fn next_revision() -> Option<Bson> {
        T::schema().settings.use_revision.then(new_revision)
    }

    fn write_error(&self, ignore_revision: bool) -> Error {
        let schema = T::schema();
        let id = self.doc.id().map(|id| id.to_string());
        if self.checks_revision(ignore_revision) {
            Error::revision_conflict(schema.collection_name(), id)
        } else {
            Error::not_found(schema.collection_name(), id)
        }
    }

    async fn write_links<C: Connection>(&mut self, cx: &Cx, conn: &C, rules: WriteRules) -> Outcome<(), Error> {
        if rules == WriteRules::DoNothing {
            return Outcome::Ok(());
        }
        let session = self.session;
        for linked in self.doc.linked_documents_mut() {
            try_outcome!(write_linked(cx, conn, linked, session.as_ref()).await);
        }
        Outcome::Ok(())
    }

    // ==================== Writes ====================

    /// Insert this instance. Assigns the id the driver reports.
    ///
    /// With a bulk writer the insert is queued under a locally generated id
    /// and the saved state is left as it was.
    #[tracing::instrument(level = "debug", skip(self, cx, conn, bulk_writer), fields(schema = T::schema().name))]
    pub async fn insert<C: Connection>(
        &mut self,
        cx: &Cx,
        conn: &C,
        rules: WriteRules,
        bulk_writer: Option<&BulkWriter>,
    ) -> Outcome<(), Error> {
        try_result!(reject_deferred_cascade("insert", rules == WriteRules::Write, bulk_writer));
        try_result!(self.validate_on_save());
        try_result!(self.run_hooks(EventKind::Insert, Phase::Before));
        try_outcome!(self.write_links(cx, conn, rules).await);

        let revision = Self::next_revision();
        let collection = T::schema().collection_name();
        if let Some(writer) = bulk_writer {
            if self.doc.id().is_none() {
                self.doc.set_id(Bson::ObjectId(ObjectId::new()));
            }
            let body = try_result!(self.stored_body(revision.as_ref()));
            writer.add_insert(T::schema(), with_id(self.doc.id(), body));
            self.revision_id = revision;
            tracing::debug!(collection, "Queued insert");
            return Outcome::Ok(());
        }
        let body = try_result!(self.stored_body(revision.as_ref()));
        let body = with_id(self.doc.id(), body);
        let inserted = try_outcome!(conn.insert_one(cx, collection, &body, self.session.as_ref()).await);
        self.doc.set_id(inserted.inserted_id);
        self.revision_id = revision;
        try_result!(self.snapshot());
        tracing::debug!(collection, "Inserted document");

        try_result!(self.run_hooks(EventKind::Insert, Phase::After));
        Outcome::Ok(())
    }

    /// Insert many instances in one call. Cascading link writes are refused.
    #[tracing::instrument(level = "debug", skip(cx, conn, docs), fields(schema = T::schema().name, count = docs.len()))]
    pub async fn insert_many<C: Connection>(
        cx: &Cx,
        conn: &C,
        docs: Vec<T>,
        rules: WriteRules,
        session: Option<Session>,
    ) -> Outcome<Vec<Self>, Error> {
        if rules == WriteRules::Write {
            return Outcome::Err(Error::unsupported(
                "insert_many",
                "cascading link writes are not supported by insert_many",
            ));
        }
        let mut tracked: Vec<Self> = docs.into_iter().map(Self::new).collect();
        let mut bodies = Vec::with_capacity(tracked.len());
        for item in &mut tracked {
            item.session = session;
            item.revision_id = Self::next_revision();
            let body = try_result!(item.stored_body(item.revision_id.as_ref()));
            bodies.push(with_id(item.doc.id(), body));
        }
        let collection = T::schema().collection_name();
        let result = try_outcome!(conn.insert_many(cx, collection, &bodies, session.as_ref()).await);
        for (item, id) in tracked.iter_mut().zip(result.inserted_ids) {
            item.doc.set_id(id);
            try_result!(item.snapshot());
        }
        tracing::debug!(collection, inserted = tracked.len(), "Inserted documents");
        Outcome::Ok(tracked)
    }

    /// Replace the stored copy with this instance.
    ///
    /// A missing stored copy is a not-found error, or a revision conflict
    /// when the revision is checked. A queued replacement that matches
    /// nothing at commit time is only visible in the bulk result.
    #[tracing::instrument(level = "debug", skip(self, cx, conn, bulk_writer), fields(schema = T::schema().name))]
    pub async fn replace<C: Connection>(
        &mut self,
        cx: &Cx,
        conn: &C,
        rules: WriteRules,
        ignore_revision: bool,
        bulk_writer: Option<&BulkWriter>,
    ) -> Outcome<(), Error> {
        try_result!(reject_deferred_cascade("replace", rules == WriteRules::Write, bulk_writer));
        try_result!(self.validate_on_save());
        try_result!(self.run_hooks(EventKind::Replace, Phase::Before));
        try_outcome!(self.write_links(cx, conn, rules).await);

        let query: FindOne<T> = try_result!(self.by_id(ignore_revision));
        let filter = try_result!(query.build_query());
        let revision = Self::next_revision();
        let body = try_result!(self.stored_body(revision.as_ref()));
        let collection = T::schema().collection_name();
        if let Some(writer) = bulk_writer {
            writer.add(
                T::schema(),
                WriteModel::ReplaceOne {
                    filter,
                    replacement: body,
                    upsert: false,
                },
            );
            self.revision_id = revision;
            tracing::debug!(collection, "Queued replacement");
            return Outcome::Ok(());
        }
        let result = try_outcome!(
            conn.replace_one(cx, collection, &filter, &body, false, self.session.as_ref())
                .await
        );
        if result.matched_count == 0 {
            return Outcome::Err(self.write_error(ignore_revision));
        }
        self.revision_id = revision;
        try_result!(self.snapshot());

        try_result!(self.run_hooks(EventKind::Replace, Phase::After));
        Outcome::Ok(())
    }

    /// Store this instance, inserting it when it does not exist yet.
    ///
    /// With revision checking, a concurrent save surfaces as a duplicate key
    /// on the upsert and is reported as a revision conflict.
    #[tracing::instrument(level = "debug", skip(self, cx, conn, bulk_writer), fields(schema = T::schema().name))]
    pub async fn save<C: Connection>(
        &mut self,
        cx: &Cx,
        conn: &C,
        rules: WriteRules,
        ignore_revision: bool,
        bulk_writer: Option<&BulkWriter>,
    ) -> Outcome<(), Error> {
        try_result!(reject_deferred_cascade("save", rules == WriteRules::Write, bulk_writer));
        try_result!(self.validate_on_save());
        try_result!(self.run_hooks(EventKind::Save, Phase::Before));
        try_outcome!(self.write_links(cx, conn, rules).await);

        if self.doc.id().is_none() {
            self.doc.set_id(Bson::ObjectId(ObjectId::new()));
        }
        let query: FindOne<T> = try_result!(self.by_id(ignore_revision));
        let filter = try_result!(query.build_query());
        let revision = Self::next_revision();
        let body = try_result!(self.stored_body(revision.as_ref()));
        let collection = T::schema().collection_name();
        let update = doc! { "$set": body };
        if let Some(writer) = bulk_writer {
            writer.add(
                T::schema(),
                WriteModel::UpdateOne {
                    filter,
                    update,
                    upsert: true,
                },
            );
            self.revision_id = revision;
            tracing::debug!(collection, "Queued save");
            return Outcome::Ok(());
        }
        match conn
            .update_one(cx, collection, &filter, &update, true, self.session.as_ref())
            .await
        {
            Outcome::Ok(result) => {
                tracing::debug!(collection, upserted = result.upserted_id.is_some(), "Saved document");
            }
            Outcome::Err(e) if e.is_duplicate_key() && self.checks_revision(ignore_revision) => {
                return Outcome::Err(self.write_error(ignore_revision));
            }
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(reason) => return Outcome::Cancelled(reason),
            Outcome::Panicked(payload) => return Outcome::Panicked(payload),
        }
        self.revision_id = revision;
        try_result!(self.snapshot());

        try_result!(self.run_hooks(EventKind::Save, Phase::After));
        Outcome::Ok(())
    }

    /// Write only the fields changed since the last load or save.
    ///
    /// Does nothing when nothing changed. With `keep_nulls` off, fields set
    /// to null are unset instead.
    #[tracing::instrument(level = "debug", skip(self, cx, conn), fields(schema = T::schema().name))]
    pub async fn save_changes<C: Connection>(
        &mut self,
        cx: &Cx,
        conn: &C,
        ignore_revision: bool,
    ) -> Outcome<(), Error> {
        if !try_result!(self.is_changed()) {
            tracing::trace!("No changes to save");
            return Outcome::Ok(());
        }
        try_result!(self.validate_on_save());
        try_result!(self.run_hooks(EventKind::SaveChanges, Phase::Before));

        let changes = try_result!(self.get_changes());
        let keep_nulls = T::schema().settings.keep_nulls;
        let mut set = bson::Document::new();
        let mut unset = bson::Document::new();
        for (path, value) in changes {
            if value == Bson::Null && !keep_nulls {
                unset.insert(path, "");
            } else {
                set.insert(path, value);
            }
        }
        let revision = Self::next_revision();
        if let Some(revision) = &revision {
            set.insert(REVISION_FIELD, revision.clone());
        }
        let mut update = bson::Document::new();
        if !set.is_empty() {
            update.insert("$set", set);
        }
        if !unset.is_empty() {
            update.insert("$unset", unset);
        }

        let query: FindOne<T> = try_result!(self.by_id(ignore_revision));
        let filter = try_result!(query.build_query());
        let collection = T::schema().collection_name();
        let result: UpdateResult = try_outcome!(
            conn.update_one(cx, collection, &filter, &update, false, self.session.as_ref())
                .await
        );
        if result.matched_count == 0 {
            return Outcome::Err(self.write_error(ignore_revision));
        }
        tracing::debug!(collection, modified = result.modified_count, "Saved changes");
        self.revision_id = revision;
        try_result!(self.snapshot());

        try_result!(self.run_hooks(EventKind::SaveChanges, Phase::After));
        Outcome::Ok(())
    }

    /// Apply update operators to the stored copy and reload from it.
    #[tracing::instrument(level = "debug", skip(self, cx, conn, updates), fields(schema = T::schema().name))]
    pub async fn update<C: Connection>(
        &mut self,
        cx: &Cx,
        conn: &C,
        mut updates: Vec<Update>,
        ignore_revision: bool,
    ) -> Outcome<(), Error> {
        try_result!(self.run_hooks(EventKind::Update, Phase::Before));

        let revision = Self::next_revision();
        if let Some(revision) = &revision {
            updates.push(Update::set([(REVISION_FIELD, Value::Bson(revision.clone()))]));
        }
        let query: FindOne<T> = try_result!(self.by_id(ignore_revision));
        let output = try_outcome!(
            query
                .update(updates)
                .response_type(UpdateResponse::NewDocument)
                .execute(cx, conn)
                .await
        );
        let Some(stored) = output.into_document() else {
            return Outcome::Err(self.write_error(ignore_revision));
        };
        self.doc = try_result!(T::from_document(&stored));
        self.revision_id = stored.get(REVISION_FIELD).cloned();
        try_result!(self.snapshot());

        try_result!(self.run_hooks(EventKind::Update, Phase::After));
        Outcome::Ok(())
    }

    /// `$set` shortcut for [`update`](Self::update).
    pub async fn set<C, I, K, V>(&mut self, cx: &Cx, conn: &C, fields: I) -> Outcome<(), Error>
    where
        C: Connection,
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        self.update(cx, conn, vec![Update::set(fields)], false).await
    }

    /// `$inc` shortcut for [`update`](Self::update).
    pub async fn inc<C, I, K, V>(&mut self, cx: &Cx, conn: &C, fields: I) -> Outcome<(), Error>
    where
        C: Connection,
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        self.update(cx, conn, vec![Update::inc(fields)], false).await
    }

    /// `$currentDate` shortcut for [`update`](Self::update).
    pub async fn current_date<C, I, K>(&mut self, cx: &Cx, conn: &C, fields: I) -> Outcome<(), Error>
    where
        C: Connection,
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        self.update(cx, conn, vec![Update::current_date(fields)], false).await
    }

    /// Delete the stored copy. Returns the number of documents deleted, or
    /// `None` when the delete was queued on `bulk_writer`.
    #[tracing::instrument(level = "debug", skip(self, cx, conn, bulk_writer), fields(schema = T::schema().name))]
    pub async fn delete<C: Connection>(
        &mut self,
        cx: &Cx,
        conn: &C,
        rules: DeleteRules,
        bulk_writer: Option<&BulkWriter>,
    ) -> Outcome<Option<u64>, Error> {
        try_result!(reject_deferred_cascade("delete", rules == DeleteRules::DeleteLinks, bulk_writer));
        try_result!(self.run_hooks(EventKind::Delete, Phase::Before));
        if rules == DeleteRules::DeleteLinks {
            let session = self.session;
            for linked in self.doc.linked_documents_mut() {
                try_outcome!(delete_linked(cx, conn, linked, session.as_ref()).await);
            }
        }
        let query: FindOne<T> = try_result!(self.by_id(true));
        if let Some(writer) = bulk_writer {
            try_outcome!(query.delete().bulk_writer(writer.clone()).execute(cx, conn).await);
            tracing::debug!(collection = T::schema().collection_name(), "Queued delete");
            return Outcome::Ok(None);
        }
        let deleted = try_outcome!(query.delete().execute(cx, conn).await).map_or(0, |r| r.deleted_count);
        tracing::debug!(collection = T::schema().collection_name(), deleted, "Deleted document");
        try_result!(self.run_hooks(EventKind::Delete, Phase::After));
        Outcome::Ok(Some(deleted))
    }

    // ==================== Reads ====================

    /// Reload this instance from its stored copy, discarding local changes.
    #[tracing::instrument(level = "debug", skip(self, cx, conn), fields(schema = T::schema().name))]
    pub async fn sync<C: Connection>(&mut self, cx: &Cx, conn: &C) -> Outcome<(), Error> {
        let query: FindOne<T> = try_result!(self.by_id(true));
        let Some(stored) = try_outcome!(query.ignore_cache(true).run(cx, conn).await) else {
            return Outcome::Err(self.write_error(true));
        };
        self.doc = try_result!(T::from_document(&stored));
        self.revision_id = stored.get(REVISION_FIELD).cloned();
        try_result!(self.snapshot());
        Outcome::Ok(())
    }

    /// Resolve one link field in place. Other fields keep their local values.
    pub async fn fetch_link<C: Connection>(&mut self, cx: &Cx, conn: &C, field: &str) -> Outcome<(), Error> {
        self.fetch_fields(cx, conn, Some(field)).await
    }

    /// Resolve every link field in place.
    pub async fn fetch_all_links<C: Connection>(&mut self, cx: &Cx, conn: &C) -> Outcome<(), Error> {
        self.fetch_fields(cx, conn, None).await
    }

    #[tracing::instrument(level = "debug", skip(self, cx, conn), fields(schema = T::schema().name))]
    async fn fetch_fields<C: Connection>(&mut self, cx: &Cx, conn: &C, only: Option<&str>) -> Outcome<(), Error> {
        let schema = T::schema();
        let entry = try_result!(registry::registered(schema));
        if let Some(field) = only {
            if entry.links.get(field).is_none() {
                return Outcome::Err(Error::argument(format!(
                    "'{field}' is not a link field of {}",
                    schema.name
                )));
            }
        }
        let query: FindOne<T> = try_result!(self.by_id(true));
        let Some(joined) = try_outcome!(query.fetch_links(true).ignore_cache(true).run(cx, conn).await) else {
            return Outcome::Err(self.write_error(true));
        };

        let mut local = try_result!(
            Encoder::new()
                .codecs(&schema.codecs)
                .encode_model(&self.doc.to_model_value())
        );
        for info in entry.links.iter() {
            if only.is_some_and(|field| field != info.field_name) {
                continue;
            }
            let key = schema.field(info.field_name).map_or(info.field_name, |f| f.stored_name());
            match joined.get(key) {
                Some(value) => local.insert(key, value.clone()),
                None => local.remove(key),
            };
        }
        self.doc = try_result!(T::from_document(&local));
        tracing::debug!(fields = only.unwrap_or("*"), "Fetched links");
        Outcome::Ok(())
    }

    // ==================== Batches ====================

    /// Replace many stored documents in one bulk write.
    ///
    /// Every document must already exist; cascading link writes are refused.
    #[tracing::instrument(level = "debug", skip(cx, conn, docs), fields(schema = T::schema().name, count = docs.len()))]
    pub async fn replace_many<C: Connection>(
        cx: &Cx,
        conn: &C,
        docs: &mut [Self],
        rules: WriteRules,
    ) -> Outcome<(), Error> {
        if rules == WriteRules::Write {
            return Outcome::Err(Error::unsupported(
                "replace_many",
                "cascading link writes are not supported by replace_many",
            ));
        }
        let mut ids = Vec::with_capacity(docs.len());
        for item in docs.iter() {
            ids.push(Value::Bson(try_result!(item.require_id())));
        }
        let existing = try_outcome!(
            FindMany::<T>::new()
                .find(Expr::is_in("_id", ids))
                .ignore_cache(true)
                .count(cx, conn)
                .await
        );
        if existing != docs.len() as u64 {
            return Outcome::Err(Error::not_found(
                T::schema().collection_name(),
                Some("some documents to replace do not exist".to_string()),
            ));
        }

        let writer = BulkWriter::new();
        let mut revisions = Vec::with_capacity(docs.len());
        for item in docs.iter() {
            let query: FindOne<T> = try_result!(item.by_id(true));
            let filter = try_result!(query.build_query());
            let revision = Self::next_revision();
            let body = try_result!(item.stored_body(revision.as_ref()));
            writer.add(
                T::schema(),
                WriteModel::ReplaceOne {
                    filter,
                    replacement: body,
                    upsert: false,
                },
            );
            revisions.push(revision);
        }
        let result = try_outcome!(writer.commit(cx, conn).await);
        tracing::debug!(matched = result.matched_count, "Replaced documents");
        for (item, revision) in docs.iter_mut().zip(revisions) {
            item.revision_id = revision;
            try_result!(item.snapshot());
        }
        Outcome::Ok(())
    }
}
