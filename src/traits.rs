use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::fmt::Display;

use crate::aggregate::AggregationIndex;
use crate::types::Item;
use crate::types::RatingEvent;
use crate::types::RatingScope;
use crate::types::RatingTally;
use crate::types::Recommendations;
use crate::types::UserId;

/// Read-only access to the catalog store.
///
/// There is deliberately no "summary of one item" method: summaries for any number of items are obtained with a
/// single [`aggregate_ratings()`](CatalogReader::aggregate_ratings) call.
#[async_trait]
pub trait CatalogReader: Send + Sync + 'static {
    type Error: Display + Debug + Send + Sync + 'static;

    /// Items ordered by their IDs.
    async fn fetch_catalog_page(&self, offset: u64, limit: u64) -> Result<Vec<Item>, Self::Error>;

    async fn fetch_rating_events(&self, scope: &RatingScope) -> Result<Vec<RatingEvent>, Self::Error>;

    /// Grouped aggregation of rating events: one tally per item having at least one event in scope.
    ///
    /// The default implementation folds the outcome of a single
    /// [`fetch_rating_events()`](CatalogReader::fetch_rating_events) call. Stores able to aggregate on their side are
    /// expected to override it.
    async fn aggregate_ratings(&self, scope: &RatingScope) -> Result<Vec<RatingTally>, Self::Error> {
        let events = self.fetch_rating_events(scope).await?;
        Ok(tally_events(events.iter()))
    }
}

/// The recomputation function behind the recommendation cache.
///
/// Implementations must be deterministic for identical inputs, must not modify the catalog, and must terminate; they
/// are not supposed to retry on their own.
#[async_trait]
pub trait Recommender<C>: Send + Sync + 'static
where
    C: CatalogReader,
{
    async fn recompute(
        &self,
        subject: UserId,
        catalog: &C,
        ratings: &AggregationIndex,
    ) -> Result<Recommendations, C::Error>;
}

/// Folds events into per-item tallies, ordered by item ID.
pub fn tally_events<'a, I>(events: I) -> Vec<RatingTally>
where
    I: IntoIterator<Item = &'a RatingEvent>,
{
    let mut tallies: BTreeMap<_, RatingTally> = BTreeMap::new();
    for event in events {
        let tally = tallies.entry(event.item_id).or_insert(RatingTally {
            item_id: event.item_id,
            count:   0,
            sum:     0,
        });
        tally.count += 1;
        tally.sum += event.score.get() as i64;
    }
    tallies.into_values().collect()
}
