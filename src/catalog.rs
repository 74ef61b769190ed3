//! Implementations of the [`CatalogReader`](crate::traits::CatalogReader) boundary.
//!
//! - [`memory::MemoryCatalog`] keeps everything in process memory and counts the queries it serves.
//! - [`db::DbCatalog`] (feature `db`) reads `books` and `reviews` tables through SeaORM and aggregates ratings with a
//!   single `GROUP BY` query.
#[cfg(feature = "db")]
pub mod db;
pub mod memory;
