//! In-process driver for DocModel Rust.
//!
//! `MemoryConnection` keeps every collection in memory and implements the
//! `Connection` trait from docmodel-core, so the query builders and document
//! actions run unchanged against it. It understands the filter, update and
//! aggregation vocabulary the rest of the workspace emits.
//!
//! # Example
//!
//! ```rust,ignore
//! use docmodel_core::{Connection, Cx, FindOptions, Outcome};
//! use docmodel_memory::MemoryConnection;
//! use bson::doc;
//!
//! let conn = MemoryConnection::new();
//! let cx = Cx::for_testing();
//! conn.insert_one(&cx, "pets", &doc! { "name": "rex" }, None).await;
//! match conn.find(&cx, "pets", &doc! {}, &FindOptions::default(), None).await {
//!     Outcome::Ok(docs) => println!("{} pets", docs.len()),
//!     Outcome::Err(e) => eprintln!("Error: {e}"),
//!     _ => {}
//! }
//! ```
//!
//! # Supported vocabulary
//!
//! | Area | Operators |
//! |------|-----------|
//! | Filters | `$eq` `$ne` `$gt` `$gte` `$lt` `$lte` `$in` `$nin` `$exists` `$type` `$regex` `$not` `$mod` `$all` `$elemMatch` `$size` `$and` `$or` `$nor` `$expr` `$text` |
//! | Updates | `$set` `$setOnInsert` `$unset` `$inc` `$mul` `$min` `$max` `$rename` `$currentDate` `$push` `$addToSet` `$pull` `$pullAll` `$pop` |
//! | Stages | `$match` `$lookup` `$unwind` `$set` `$addFields` `$unset` `$sort` `$skip` `$limit` `$project` `$count` `$group` `$replaceRoot` |
//!
//! # Thread Safety
//!
//! `MemoryConnection` is `Send` and `Sync`; each operation runs to completion
//! under an internal mutex.

pub mod connection;
pub mod eval;
pub mod matcher;
pub mod path;
pub mod pipeline;
pub mod update;

pub use connection::{MemoryConfig, MemoryConnection};
