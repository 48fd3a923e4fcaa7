//! Typed query builders for DocModel.
//!
//! `docmodel-query` is the **query construction layer**. It turns a
//! registered schema plus operator expressions into driver calls.
//!
//! # Role In The Architecture
//!
//! - **Operators**: `Expr` and `FieldPath` build filter documents.
//! - **Finds**: `FindMany` / `FindOne` render either a plain filter or an
//!   aggregation pipeline with link lookups, and serve repeated reads from
//!   a per-schema LRU/TTL cache.
//! - **Writes**: `UpdateMany`, `UpdateOne`, `DeleteMany`, `DeleteOne` and
//!   the `BulkWriter` queue.
//!
//! Queries execute through the `Connection` trait from `docmodel-core`.
//! Most users reach these builders through the `docmodel` facade crate.

pub mod aggregate;
pub mod bulk;
pub mod cache;
pub mod delete;
pub mod expr;
pub mod field;
pub mod find;
pub mod links;
pub mod update;
pub mod update_ops;

#[cfg(test)]
mod test_support;

pub use aggregate::AggregationQuery;
pub use bulk::BulkWriter;
pub use cache::{CachedResult, LruTtlCache, QueryShape};
pub use delete::{DeleteMany, DeleteOne};
pub use expr::{Expr, LogicalOp, TextOptions, combine};
pub use field::{FieldPath, Fields, SortDirection, SortKey};
pub use find::{FindMany, FindOne};
pub use links::{NATIVE_LOOKUP_VERSION, convert_ids, fetch_list, lookup_stages};
pub use update::{UpdateMany, UpdateOne, UpdateOutput, UpdateResponse};
pub use update_ops::{Update, UpdateOp, merge_updates};

/// Filter expression shorthand.
///
/// ```ignore
/// let cheap = filter!("price" < 10);
/// let named = filter!("name" == "pen");
/// ```
#[macro_export]
macro_rules! filter {
    ($field:literal == $value:expr) => {
        $crate::Expr::eq($field, $value)
    };
    ($field:literal != $value:expr) => {
        $crate::Expr::ne($field, $value)
    };
    ($field:literal > $value:expr) => {
        $crate::Expr::gt($field, $value)
    };
    ($field:literal >= $value:expr) => {
        $crate::Expr::gte($field, $value)
    };
    ($field:literal < $value:expr) => {
        $crate::Expr::lt($field, $value)
    };
    ($field:literal <= $value:expr) => {
        $crate::Expr::lte($field, $value)
    };
}
