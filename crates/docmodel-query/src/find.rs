//! Find queries.
//!
//! A [`FindMany`] accumulates filter expressions, sort keys, paging and a
//! projection. Without `fetch_links` it runs as a plain `find`; with it the
//! query becomes an aggregation pipeline with the link lookups in front.

use crate::aggregate::AggregationQuery;
use crate::cache::{self, CachedResult, QueryShape};
use crate::delete::{DeleteMany, DeleteOne};
use crate::expr::{self, Expr};
use crate::field::SortKey;
use crate::links::{self, NATIVE_LOOKUP_VERSION};
use crate::update::{UpdateMany, UpdateOne};
use crate::update_ops::Update;
use bson::{Bson, Document, doc};
use docmodel_core::registry;
use docmodel_core::{
    Connection, Cx, Encoder, Error, FindOptions, FromBson, FromStored, Outcome, Result, Session,
    try_outcome, try_result,
};
use std::fmt;
use std::marker::PhantomData;

/// Render accumulated filters for `schema`: AND-combined, discriminator
/// filter appended, encoded, link id paths rewritten.
pub(crate) fn render_filter(
    schema: &'static docmodel_core::SchemaDescriptor,
    filters: &[Expr],
    fetch_links: bool,
) -> Result<Document> {
    let entry = registry::registered(schema)?;
    let class = registry::class_filter(schema)?;
    let encoder = Encoder::new().codecs(&schema.codecs).to_db(true);
    let encoded = match class {
        Some(class) => {
            let mut all = filters.to_vec();
            all.push(Expr::from(class));
            encoder.encode_map(&expr::combine(&all))?
        }
        None => encoder.encode_map(&expr::combine(filters))?,
    };
    Ok(links::convert_ids(&encoded, &entry.links, fetch_links))
}

/// Split a filter into its `$text` part and the rest.
fn split_text(filter: Document) -> (Vec<Document>, Vec<Document>) {
    if filter.is_empty() {
        return (Vec::new(), Vec::new());
    }
    if filter.len() == 1 {
        if let Some(Bson::Array(items)) = filter.get("$and") {
            let mut text = Vec::new();
            let mut rest = Vec::new();
            for item in items {
                match item {
                    Bson::Document(d) if d.contains_key("$text") => text.push(d.clone()),
                    Bson::Document(d) => rest.push(d.clone()),
                    _ => {}
                }
            }
            return (text, rest);
        }
    }
    if filter.contains_key("$text") {
        (vec![filter], Vec::new())
    } else {
        (Vec::new(), vec![filter])
    }
}

fn and_of(mut docs: Vec<Document>) -> Document {
    if docs.len() == 1 {
        docs.remove(0)
    } else {
        doc! { "$and": docs }
    }
}

fn hydrate<P: FromStored>(docs: &[Document]) -> Outcome<Vec<P>, Error> {
    match docs.iter().map(P::from_stored).collect::<Result<Vec<_>>>() {
        Ok(items) => Outcome::Ok(items),
        Err(e) => Outcome::Err(e),
    }
}

fn count_from(docs: &[Document]) -> u64 {
    docs.first()
        .and_then(|d| d.get("count"))
        .and_then(|c| i64::from_bson(c).ok())
        .map_or(0, |c| u64::try_from(c).unwrap_or(0))
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// A query over many documents of `T`, hydrating results as `P`.
pub struct FindMany<T: docmodel_core::Document, P: FromStored = Document> {
    filters: Vec<Expr>,
    sort: Vec<SortKey>,
    skip: Option<u64>,
    limit: Option<i64>,
    projection: Option<Document>,
    fetch_links: bool,
    nesting_depth: Option<u32>,
    session: Option<Session>,
    ignore_cache: bool,
    _marker: PhantomData<fn() -> (T, P)>,
}

impl<T: docmodel_core::Document, P: FromStored> Clone for FindMany<T, P> {
    fn clone(&self) -> Self {
        Self {
            filters: self.filters.clone(),
            sort: self.sort.clone(),
            skip: self.skip,
            limit: self.limit,
            projection: self.projection.clone(),
            fetch_links: self.fetch_links,
            nesting_depth: self.nesting_depth,
            session: self.session,
            ignore_cache: self.ignore_cache,
            _marker: PhantomData,
        }
    }
}

impl<T: docmodel_core::Document, P: FromStored> fmt::Debug for FindMany<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FindMany")
            .field("schema", &T::schema().name)
            .field("filters", &self.filters)
            .field("sort", &self.sort)
            .field("skip", &self.skip)
            .field("limit", &self.limit)
            .field("fetch_links", &self.fetch_links)
            .finish_non_exhaustive()
    }
}

impl<T: docmodel_core::Document, P: FromStored> Default for FindMany<T, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: docmodel_core::Document, P: FromStored> FindMany<T, P> {
    pub fn new() -> Self {
        Self {
            filters: Vec::new(),
            sort: Vec::new(),
            skip: None,
            limit: None,
            projection: P::projection(),
            fetch_links: false,
            nesting_depth: None,
            session: None,
            ignore_cache: false,
            _marker: PhantomData,
        }
    }

    /// Add a filter expression. Filters are AND-combined.
    #[must_use]
    pub fn find(mut self, expr: impl Into<Expr>) -> Self {
        self.filters.push(expr.into());
        self
    }

    #[must_use]
    pub fn sort(mut self, key: impl Into<SortKey>) -> Self {
        self.sort.push(key.into());
        self
    }

    #[must_use]
    pub fn skip(mut self, n: u64) -> Self {
        self.skip = (n > 0).then_some(n);
        self
    }

    #[must_use]
    pub fn limit(mut self, n: i64) -> Self {
        self.limit = (n > 0).then_some(n);
        self
    }

    /// Hydrate results as `Q`, requesting its projection.
    pub fn project<Q: FromStored>(self) -> FindMany<T, Q> {
        FindMany {
            filters: self.filters,
            sort: self.sort,
            skip: self.skip,
            limit: self.limit,
            projection: Q::projection(),
            fetch_links: self.fetch_links,
            nesting_depth: self.nesting_depth,
            session: self.session,
            ignore_cache: self.ignore_cache,
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub fn fetch_links(mut self, fetch: bool) -> Self {
        self.fetch_links = fetch;
        self
    }

    /// Limit link expansion depth for every reference field.
    #[must_use]
    pub fn nesting_depth(mut self, depth: u32) -> Self {
        self.nesting_depth = Some(depth);
        self
    }

    #[must_use]
    pub fn with_session(mut self, session: Session) -> Self {
        self.session = Some(session);
        self
    }

    #[must_use]
    pub fn ignore_cache(mut self, ignore: bool) -> Self {
        self.ignore_cache = ignore;
        self
    }

    pub fn filters(&self) -> &[Expr] {
        &self.filters
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    // ==================== Rendering ====================

    /// The encoded filter document.
    #[tracing::instrument(level = "trace", skip(self), fields(schema = T::schema().name))]
    pub fn build_query(&self) -> Result<Document> {
        render_filter(T::schema(), &self.filters, self.fetch_links)
    }

    fn sort_document(&self) -> Option<Document> {
        if self.sort.is_empty() {
            return None;
        }
        let mut sort = Document::new();
        for key in &self.sort {
            sort.insert(key.field.as_str(), key.direction.as_i32());
        }
        Some(sort)
    }

    /// The aggregation pipeline this query runs as when fetching links.
    pub fn build_pipeline(&self, server_version: u32) -> Result<Vec<Document>> {
        self.pipeline_with(server_version, Vec::new())
    }

    fn pipeline_with(&self, server_version: u32, extra: Vec<Document>) -> Result<Vec<Document>> {
        let schema = T::schema();
        let mut pipeline = if self.fetch_links {
            let entry = registry::registered(schema)?;
            links::lookup_stages(schema, &entry.links, server_version, self.nesting_depth)
        } else {
            Vec::new()
        };
        let (text, rest) = split_text(self.build_query()?);
        // Text search has to be the first stage.
        if !text.is_empty() {
            pipeline.insert(0, doc! { "$match": and_of(text) });
        }
        if !rest.is_empty() {
            pipeline.push(doc! { "$match": and_of(rest) });
        }
        pipeline.extend(extra);
        if let Some(sort) = self.sort_document() {
            pipeline.push(doc! { "$sort": sort });
        }
        if let Some(skip) = self.skip {
            pipeline.push(doc! { "$skip": to_i64(skip) });
        }
        if let Some(limit) = self.limit {
            pipeline.push(doc! { "$limit": limit });
        }
        if let Some(projection) = &self.projection {
            pipeline.push(doc! { "$project": projection.clone() });
        }
        Ok(pipeline)
    }

    fn shape<'a>(&'a self, kind: &'a str, filter: &'a Document, sort: Option<&'a Document>) -> QueryShape<'a> {
        QueryShape {
            kind,
            filter,
            projection: self.projection.as_ref(),
            fetch_links: self.fetch_links,
            sort,
            skip: self.skip,
            limit: self.limit,
        }
    }

    fn cache_key(&self, kind: &str, filter: &Document) -> Result<Option<(cache::SharedCache, String)>> {
        if self.ignore_cache {
            return Ok(None);
        }
        let Some(shared) = cache::cache_for(T::schema()) else {
            return Ok(None);
        };
        let sort = self.sort_document();
        let key = self.shape(kind, filter, sort.as_ref()).cache_key()?;
        Ok(Some((shared, key)))
    }

    async fn server_version<C: Connection>(&self, cx: &Cx, conn: &C) -> Outcome<u32, Error> {
        if self.fetch_links {
            conn.server_major_version(cx).await
        } else {
            Outcome::Ok(NATIVE_LOOKUP_VERSION)
        }
    }

    // ==================== Execution ====================

    async fn fetch_documents<C: Connection>(&self, cx: &Cx, conn: &C) -> Outcome<Vec<Document>, Error> {
        let schema = T::schema();
        let collection = schema.collection_name();
        let filter = try_result!(self.build_query());
        let cached = try_result!(self.cache_key("FindMany", &filter));

        if let Some((shared, key)) = &cached {
            let hit = cache::lock(shared).get(key);
            if let Some(CachedResult::Documents(docs)) = hit {
                tracing::debug!(collection, cache_hit = true, count = docs.len(), "Served find from cache");
                return Outcome::Ok(docs);
            }
        }

        let docs = if self.fetch_links {
            let version = try_outcome!(self.server_version(cx, conn).await);
            let pipeline = try_result!(self.build_pipeline(version));
            tracing::debug!(collection, stages = pipeline.len(), "Executing find as pipeline");
            try_outcome!(conn.aggregate(cx, collection, &pipeline, self.session.as_ref()).await)
        } else {
            let options = FindOptions {
                sort: self.sort_document(),
                skip: self.skip,
                limit: self.limit,
                projection: self.projection.clone(),
            };
            tracing::debug!(collection, cache_hit = false, "Executing find");
            try_outcome!(conn.find(cx, collection, &filter, &options, self.session.as_ref()).await)
        };

        if let Some((shared, key)) = cached {
            cache::lock(&shared).set(key, CachedResult::Documents(docs.clone()));
        }
        Outcome::Ok(docs)
    }

    /// Run the query and hydrate every result.
    #[tracing::instrument(level = "debug", skip(self, cx, conn), fields(schema = T::schema().name))]
    pub async fn to_list<C: Connection>(&self, cx: &Cx, conn: &C) -> Outcome<Vec<P>, Error> {
        self.fetch_documents(cx, conn)
            .await
            .and_then(|docs| hydrate(&docs))
    }

    /// The first result, if any.
    pub async fn first_or_none<C: Connection>(&self, cx: &Cx, conn: &C) -> Outcome<Option<P>, Error> {
        let limited = self.clone().limit(1);
        limited
            .to_list(cx, conn)
            .await
            .map(|items| items.into_iter().next())
    }

    /// Number of matching documents.
    #[tracing::instrument(level = "debug", skip(self, cx, conn), fields(schema = T::schema().name))]
    pub async fn count<C: Connection>(&self, cx: &Cx, conn: &C) -> Outcome<u64, Error> {
        let collection = T::schema().collection_name();
        let filter = try_result!(self.build_query());
        let cached = try_result!(self.cache_key("Count", &filter));
        if let Some((shared, key)) = &cached {
            let hit = cache::lock(shared).get(key);
            if let Some(CachedResult::Count(n)) = hit {
                tracing::debug!(collection, cache_hit = true, count = n, "Served count from cache");
                return Outcome::Ok(n);
            }
        }

        let count = if self.fetch_links || self.skip.is_some() || self.limit.is_some() {
            let version = try_outcome!(self.server_version(cx, conn).await);
            let mut pipeline = try_result!(self.build_pipeline(version));
            pipeline.push(doc! { "$count": "count" });
            let docs = try_outcome!(conn.aggregate(cx, collection, &pipeline, self.session.as_ref()).await);
            count_from(&docs)
        } else {
            try_outcome!(conn.count_documents(cx, collection, &filter, self.session.as_ref()).await)
        };

        if let Some((shared, key)) = cached {
            cache::lock(&shared).set(key, CachedResult::Count(count));
        }
        Outcome::Ok(count)
    }

    pub async fn exists<C: Connection>(&self, cx: &Cx, conn: &C) -> Outcome<bool, Error> {
        self.count(cx, conn).await.map(|n| n > 0)
    }

    async fn group<C: Connection>(&self, cx: &Cx, conn: &C, op: &str, field: &str) -> Outcome<Option<Bson>, Error> {
        let stages = vec![
            doc! { "$group": { "_id": Bson::Null, "value": { op: format!("${field}") } } },
            doc! { "$project": { "_id": 0 } },
        ];
        self.aggregate(stages)
            .to_list(cx, conn)
            .await
            .map(|docs| docs.first().and_then(|d| d.get("value")).cloned())
    }

    async fn group_f64<C: Connection>(&self, cx: &Cx, conn: &C, op: &str, field: &str) -> Outcome<Option<f64>, Error> {
        self.group(cx, conn, op, field).await.and_then(|value| match value {
            None | Some(Bson::Null) => Outcome::Ok(None),
            Some(v) => match f64::from_bson(&v) {
                Ok(n) => Outcome::Ok(Some(n)),
                Err(e) => Outcome::Err(e.in_field(field)),
            },
        })
    }

    /// Sum of `field` over matching documents; `None` when nothing matches.
    pub async fn sum<C: Connection>(&self, cx: &Cx, conn: &C, field: &str) -> Outcome<Option<f64>, Error> {
        self.group_f64(cx, conn, "$sum", field).await
    }

    pub async fn avg<C: Connection>(&self, cx: &Cx, conn: &C, field: &str) -> Outcome<Option<f64>, Error> {
        self.group_f64(cx, conn, "$avg", field).await
    }

    pub async fn max<C: Connection>(&self, cx: &Cx, conn: &C, field: &str) -> Outcome<Option<Bson>, Error> {
        self.group(cx, conn, "$max", field).await
    }

    pub async fn min<C: Connection>(&self, cx: &Cx, conn: &C, field: &str) -> Outcome<Option<Bson>, Error> {
        self.group(cx, conn, "$min", field).await
    }

    /// Distinct values of `key` among matching documents.
    pub async fn distinct<C: Connection>(&self, cx: &Cx, conn: &C, key: &str) -> Outcome<Vec<Bson>, Error> {
        let filter = try_result!(self.build_query());
        conn.distinct(cx, T::schema().collection_name(), key, &filter, self.session.as_ref())
            .await
    }

    // ==================== Derived queries ====================

    /// Aggregation over the matching documents.
    pub fn aggregate(&self, pipeline: Vec<Document>) -> AggregationQuery<T> {
        let mut query = AggregationQuery::new(self.filters.clone(), pipeline)
            .fetch_links(self.fetch_links);
        if let Some(depth) = self.nesting_depth {
            query = query.nesting_depth(depth);
        }
        if let Some(session) = self.session {
            query = query.with_session(session);
        }
        query
    }

    pub fn update(&self, updates: Vec<Update>) -> UpdateMany<T> {
        let query = UpdateMany::new(self.filters.clone(), updates);
        match self.session {
            Some(session) => query.with_session(session),
            None => query,
        }
    }

    /// Update matching documents, inserting `on_insert` when none match.
    pub fn upsert(&self, updates: Vec<Update>, on_insert: T) -> UpdateMany<T> {
        self.update(updates).upsert(on_insert)
    }

    pub fn set<I, K, V>(&self, fields: I) -> UpdateMany<T>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<docmodel_core::Value>,
    {
        self.update(vec![Update::set(fields)])
    }

    pub fn inc<I, K, V>(&self, fields: I) -> UpdateMany<T>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<docmodel_core::Value>,
    {
        self.update(vec![Update::inc(fields)])
    }

    pub fn current_date<I, K>(&self, fields: I) -> UpdateMany<T>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        self.update(vec![Update::current_date(fields)])
    }

    pub fn delete(&self) -> DeleteMany<T> {
        let query = DeleteMany::new(self.filters.clone());
        match self.session {
            Some(session) => query.with_session(session),
            None => query,
        }
    }
}

/// A query for a single document of `T`, hydrated as `P`.
pub struct FindOne<T: docmodel_core::Document, P: FromStored = Document> {
    filters: Vec<Expr>,
    projection: Option<Document>,
    fetch_links: bool,
    nesting_depth: Option<u32>,
    session: Option<Session>,
    ignore_cache: bool,
    _marker: PhantomData<fn() -> (T, P)>,
}

impl<T: docmodel_core::Document, P: FromStored> Clone for FindOne<T, P> {
    fn clone(&self) -> Self {
        Self {
            filters: self.filters.clone(),
            projection: self.projection.clone(),
            fetch_links: self.fetch_links,
            nesting_depth: self.nesting_depth,
            session: self.session,
            ignore_cache: self.ignore_cache,
            _marker: PhantomData,
        }
    }
}

impl<T: docmodel_core::Document, P: FromStored> fmt::Debug for FindOne<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FindOne")
            .field("schema", &T::schema().name)
            .field("filters", &self.filters)
            .field("fetch_links", &self.fetch_links)
            .finish_non_exhaustive()
    }
}

impl<T: docmodel_core::Document, P: FromStored> Default for FindOne<T, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: docmodel_core::Document, P: FromStored> FindOne<T, P> {
    pub fn new() -> Self {
        Self {
            filters: Vec::new(),
            projection: P::projection(),
            fetch_links: false,
            nesting_depth: None,
            session: None,
            ignore_cache: false,
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub fn find(mut self, expr: impl Into<Expr>) -> Self {
        self.filters.push(expr.into());
        self
    }

    pub fn project<Q: FromStored>(self) -> FindOne<T, Q> {
        FindOne {
            filters: self.filters,
            projection: Q::projection(),
            fetch_links: self.fetch_links,
            nesting_depth: self.nesting_depth,
            session: self.session,
            ignore_cache: self.ignore_cache,
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub fn fetch_links(mut self, fetch: bool) -> Self {
        self.fetch_links = fetch;
        self
    }

    #[must_use]
    pub fn nesting_depth(mut self, depth: u32) -> Self {
        self.nesting_depth = Some(depth);
        self
    }

    #[must_use]
    pub fn with_session(mut self, session: Session) -> Self {
        self.session = Some(session);
        self
    }

    #[must_use]
    pub fn ignore_cache(mut self, ignore: bool) -> Self {
        self.ignore_cache = ignore;
        self
    }

    pub fn build_query(&self) -> Result<Document> {
        render_filter(T::schema(), &self.filters, self.fetch_links)
    }

    fn as_many(&self) -> FindMany<T, P> {
        let mut many = FindMany::<T, P> {
            filters: self.filters.clone(),
            projection: self.projection.clone(),
            fetch_links: self.fetch_links,
            nesting_depth: self.nesting_depth,
            session: self.session,
            ignore_cache: self.ignore_cache,
            ..FindMany::new()
        };
        many.limit = Some(1);
        many
    }

    /// Run the query.
    #[tracing::instrument(level = "debug", skip(self, cx, conn), fields(schema = T::schema().name))]
    pub async fn run<C: Connection>(&self, cx: &Cx, conn: &C) -> Outcome<Option<P>, Error> {
        if self.fetch_links {
            return self.as_many().first_or_none(cx, conn).await;
        }
        let schema = T::schema();
        let collection = schema.collection_name();
        let filter = try_result!(self.build_query());

        let cached = if self.ignore_cache {
            None
        } else {
            match cache::cache_for(schema) {
                Some(shared) => {
                    let shape = QueryShape {
                        kind: "FindOne",
                        filter: &filter,
                        projection: self.projection.as_ref(),
                        fetch_links: false,
                        sort: None,
                        skip: None,
                        limit: None,
                    };
                    Some((shared, try_result!(shape.cache_key())))
                }
                None => None,
            }
        };
        if let Some((shared, key)) = &cached {
            let hit = cache::lock(shared).get(key);
            if let Some(CachedResult::Documents(docs)) = hit {
                tracing::debug!(collection, cache_hit = true, "Served find_one from cache");
                return hydrate(&docs).map(|items| items.into_iter().next());
            }
        }

        let options = FindOptions {
            projection: self.projection.clone(),
            ..FindOptions::default()
        };
        let found = try_outcome!(
            conn.find_one(cx, collection, &filter, &options, self.session.as_ref())
                .await
        );
        let docs: Vec<Document> = found.into_iter().collect();
        if let Some((shared, key)) = cached {
            cache::lock(&shared).set(key, CachedResult::Documents(docs.clone()));
        }
        hydrate(&docs).map(|items| items.into_iter().next())
    }

    pub fn update(&self, updates: Vec<Update>) -> UpdateOne<T> {
        let query = UpdateOne::new(self.filters.clone(), updates);
        match self.session {
            Some(session) => query.with_session(session),
            None => query,
        }
    }

    pub fn upsert(&self, updates: Vec<Update>, on_insert: T) -> UpdateOne<T> {
        self.update(updates).upsert(on_insert)
    }

    /// Replace the matched document. No match is a not-found error.
    #[tracing::instrument(level = "debug", skip(self, cx, conn, replacement), fields(schema = T::schema().name))]
    pub async fn replace_one<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        replacement: &T,
    ) -> Outcome<docmodel_core::UpdateResult, Error> {
        let schema = T::schema();
        let collection = schema.collection_name();
        let filter = try_result!(self.build_query());
        let body = try_result!(
            Encoder::for_storage(schema)
                .exclude(["_id"])
                .encode_model(&replacement.to_model_value())
        );
        let result = try_outcome!(
            conn.replace_one(cx, collection, &filter, &body, false, self.session.as_ref())
                .await
        );
        if result.matched_count == 0 {
            return Outcome::Err(Error::not_found(collection, Some(filter.to_string())));
        }
        Outcome::Ok(result)
    }

    pub fn delete(&self) -> DeleteOne<T> {
        let query = DeleteOne::new(self.filters.clone());
        match self.session {
            Some(session) => query.with_session(session),
            None => query,
        }
    }
}
