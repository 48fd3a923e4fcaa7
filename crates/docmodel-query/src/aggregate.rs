//! Aggregation queries.

use crate::expr::Expr;
use crate::find::render_filter;
use crate::links;
use bson::{Document, doc};
use docmodel_core::registry;
use docmodel_core::{Connection, Cx, Error, Outcome, Result, Session, try_outcome, try_result};
use std::fmt;
use std::marker::PhantomData;

/// A user pipeline run over the documents a find would match.
///
/// The rendered pipeline is: link lookups (when fetching links), the
/// `$match` of the find filters, the user stages, then the projection.
pub struct AggregationQuery<T: docmodel_core::Document> {
    filters: Vec<Expr>,
    pipeline: Vec<Document>,
    projection: Option<Document>,
    fetch_links: bool,
    nesting_depth: Option<u32>,
    session: Option<Session>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: docmodel_core::Document> fmt::Debug for AggregationQuery<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregationQuery")
            .field("schema", &T::schema().name)
            .field("filters", &self.filters)
            .field("pipeline", &self.pipeline)
            .field("fetch_links", &self.fetch_links)
            .finish_non_exhaustive()
    }
}

impl<T: docmodel_core::Document> AggregationQuery<T> {
    pub fn new(filters: Vec<Expr>, pipeline: Vec<Document>) -> Self {
        Self {
            filters,
            pipeline,
            projection: None,
            fetch_links: false,
            nesting_depth: None,
            session: None,
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub fn project(mut self, projection: Document) -> Self {
        self.projection = Some(projection);
        self
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

    pub fn build_pipeline(&self, server_version: u32) -> Result<Vec<Document>> {
        let schema = T::schema();
        let mut pipeline = if self.fetch_links {
            let entry = registry::registered(schema)?;
            links::lookup_stages(schema, &entry.links, server_version, self.nesting_depth)
        } else {
            Vec::new()
        };
        let filter = render_filter(schema, &self.filters, self.fetch_links)?;
        if !filter.is_empty() {
            pipeline.push(doc! { "$match": filter });
        }
        pipeline.extend(self.pipeline.iter().cloned());
        if let Some(projection) = &self.projection {
            pipeline.push(doc! { "$project": projection.clone() });
        }
        Ok(pipeline)
    }

    /// Run the pipeline and return the raw result documents.
    #[tracing::instrument(level = "debug", skip(self, cx, conn), fields(schema = T::schema().name))]
    pub async fn to_list<C: Connection>(&self, cx: &Cx, conn: &C) -> Outcome<Vec<Document>, Error> {
        let version = if self.fetch_links {
            try_outcome!(conn.server_major_version(cx).await)
        } else {
            links::NATIVE_LOOKUP_VERSION
        };
        let pipeline = try_result!(self.build_pipeline(version));
        let collection = T::schema().collection_name();
        tracing::debug!(collection, stages = pipeline.len(), "Executing aggregation");
        conn.aggregate(cx, collection, &pipeline, self.session.as_ref())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use asupersync::runtime::RuntimeBuilder;
    use docmodel_memory::MemoryConnection;

    #[test]
    fn user_stages_follow_the_find_filter() {
        register();
        let query = AggregationQuery::<Item>::new(
            vec![Expr::gt("price", 1)],
            vec![doc! { "$sort": { "price": 1 } }],
        )
        .project(doc! { "name": 1 });
        assert_eq!(
            query.build_pipeline(6).expect("pipeline"),
            vec![
                doc! { "$match": { "price": { "$gt": 1 } } },
                doc! { "$sort": { "price": 1 } },
                doc! { "$project": { "name": 1 } },
            ]
        );
    }

    #[test]
    fn group_totals_over_matches() {
        register();
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let conn = MemoryConnection::new();
            seed_items(&cx, &conn, &[("pen", 2), ("ink", 5), ("cap", 7)]).await;
            let query = crate::FindMany::<Item>::new().find(Expr::gt("price", 2));
            let total = query.sum(&cx, &conn, "price").await;
            assert!(matches!(total, Outcome::Ok(Some(t)) if (t - 12.0).abs() < f64::EPSILON));
            let none = crate::FindMany::<Item>::new()
                .find(Expr::gt("price", 100))
                .avg(&cx, &conn, "price")
                .await;
            assert!(matches!(none, Outcome::Ok(None)));
        });
    }
}
