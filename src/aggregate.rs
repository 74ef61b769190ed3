use std::collections::BTreeMap;
use tracing::instrument;
use tracing::trace;

use crate::traits::tally_events;
use crate::traits::CatalogReader;
use crate::types::AggregateSummary;
use crate::types::ItemId;
use crate::types::RatingEvent;
use crate::types::RatingScope;
use crate::types::RatingTally;

/// Per-item rating summaries derived from the rating events of the catalog.
///
/// The index is an immutable snapshot. It is never patched event by event; to account for new ratings build a new
/// one. Every constructor reads the source with a single grouped aggregation (or a single fold over an event stream),
/// never with one lookup per item.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AggregationIndex {
    summaries:   BTreeMap<ItemId, AggregateSummary>,
    // Exact totals over all indexed events, kept to compute the global mean without float accumulation.
    total_count: u64,
    total_sum:   i64,
}

impl AggregationIndex {
    /// Builds the index over the whole catalog.
    pub async fn build<C: CatalogReader>(catalog: &C) -> Result<Self, C::Error> {
        Self::build_scoped(catalog, &RatingScope::All).await
    }

    /// Builds the index over the given items only.
    pub async fn build_for<C, I>(catalog: &C, ids: I) -> Result<Self, C::Error>
    where
        C: CatalogReader,
        I: IntoIterator<Item = ItemId>,
    {
        Self::build_scoped(catalog, &RatingScope::items(ids)).await
    }

    #[instrument(level = "trace", skip(catalog))]
    pub async fn build_scoped<C: CatalogReader>(catalog: &C, scope: &RatingScope) -> Result<Self, C::Error> {
        if matches!(scope, RatingScope::Items(ids) if ids.is_empty()) {
            return Ok(Self::default());
        }

        let tallies = catalog.aggregate_ratings(scope).await?;
        trace!("aggregated ratings for {scope}: {} item(s)", tallies.len());
        Ok(Self::from_tallies(tallies))
    }

    pub fn from_events<'a, I>(events: I) -> Self
    where
        I: IntoIterator<Item = &'a RatingEvent>,
    {
        Self::from_tallies(tally_events(events))
    }

    /// Tallies with zero events are skipped: items without ratings are never present in the index.
    pub fn from_tallies<I>(tallies: I) -> Self
    where
        I: IntoIterator<Item = RatingTally>,
    {
        let mut index = Self::default();
        for tally in tallies.into_iter().filter(|t| t.count > 0) {
            index.total_count += tally.count;
            index.total_sum += tally.sum;
            index.summaries.insert(tally.item_id, AggregateSummary::from_tally(&tally));
        }
        index
    }

    /// Summaries of the requested items. Items without ratings are absent from the result.
    pub fn summarize<'a, I>(&self, ids: I) -> BTreeMap<ItemId, AggregateSummary>
    where
        I: IntoIterator<Item = &'a ItemId>,
    {
        ids.into_iter()
            .filter_map(|id| self.summaries.get(id).map(|s| (*id, *s)))
            .collect()
    }

    pub fn summarize_all(&self) -> BTreeMap<ItemId, AggregateSummary> {
        self.summaries.clone()
    }

    pub fn summary(&self, id: ItemId) -> Option<&AggregateSummary> {
        self.summaries.get(&id)
    }

    /// Mean rating of the item, 0 for an item nobody has rated.
    pub fn mean_or_zero(&self, id: ItemId) -> f64 {
        self.summaries.get(&id).map_or(0.0, |s| s.mean)
    }

    pub fn count(&self, id: ItemId) -> u64 {
        self.summaries.get(&id).map_or(0, |s| s.count)
    }

    /// Mean over all indexed events; 0 when there are none.
    pub fn global_mean(&self) -> f64 {
        if self.total_count == 0 {
            0.0
        }
        else {
            self.total_sum as f64 / self.total_count as f64
        }
    }

    pub fn len(&self) -> usize {
        self.summaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.summaries.is_empty()
    }
}
