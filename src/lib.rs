//! # rec-cache
//!
//! Bounded, single-flight in-app cache for expensive derived results, plus the rating aggregation that feeds them.
//!
//! Think of it as the piece of a recommendation endpoint that decides when to recompute.
//!
//! # The Basics
//!
//! The crate is designed for the following use case:
//!
//! - A per-subject value (a ranked recommendation list) is expensive to derive from a large dataset.
//! - Many requests for the same subject arrive at once.
//! - The set of subjects is open-ended, so an unbounded map would eventually eat all memory.
//!
//! The cache operates on the following principles:
//!
//! - Every cache is an explicitly built [`BoundedCache`] instance with a mandatory capacity and TTL. There is no
//!   global cache state.
//! - The number of stored entries never exceeds the capacity. When room is needed an expired entry goes first, then
//!   the least recently used one.
//! - An entry is never served once its TTL has elapsed.
//! - At most one recomputation per key runs at any moment. Concurrent callers for the same key share its outcome,
//!   including a failure. Failures are never cached.
//! - A slow recomputation for one key never blocks requests for other keys.
//!
//! # Aggregation
//!
//! Recommendations need per-item rating summaries. [`AggregationIndex`] obtains them for any number of items with a
//! single grouped query through the [`CatalogReader`] boundary; there is no way to ask for one item's summary at a time,
//! which rules out N+1 access by construction.
//!
//! # Putting It Together
//!
//! [`RecommendationService`] wires a catalog, a [`Recommender`] and a [`KeyPolicy`] into a cache:
//!
//! ```ignore
//! let catalog = Arc::new(MemoryCatalog::new());
//! let config = CacheConfig::default();
//! let service = RecommendationService::new(catalog, TopRated::from_config(&config)?, &config)?;
//!
//! let recs = service.get_recommendations(UserId(42)).await?;
//! service.invalidate_recommendations(UserId(42));
//! ```
//!
//! With the `sqlite` or `pg` feature enabled, [`catalog::db::DbCatalog`] provides the same boundary over SeaORM.

pub mod aggregate;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod entry;
pub mod error;
pub mod key_policy;
pub mod recommend;
pub mod service;
pub mod traits;
pub mod types;

#[doc(inline)]
pub use aggregate::AggregationIndex;
#[doc(inline)]
pub use cache::BoundedCache;
#[doc(inline)]
pub use config::CacheConfig;
#[doc(inline)]
pub use key_policy::KeyPolicy;
#[doc(inline)]
pub use recommend::TopRated;
#[doc(inline)]
pub use service::RecommendationService;
#[doc(inline)]
pub use traits::CatalogReader;
#[doc(inline)]
pub use traits::Recommender;

pub mod prelude {
    pub use crate::aggregate::AggregationIndex;
    pub use crate::cache::BoundedCache;
    pub use crate::cache::CacheStats;
    pub use crate::cache::MAX_TTL;
    pub use crate::catalog::memory::MemoryCatalog;
    pub use crate::config::CacheConfig;
    pub use crate::error::*;
    pub use crate::key_policy::KeyPolicy;
    pub use crate::recommend::TopRated;
    pub use crate::service::RecommendationService;
    pub use crate::traits::CatalogReader;
    pub use crate::traits::Recommender;
    pub use crate::types::*;
}
