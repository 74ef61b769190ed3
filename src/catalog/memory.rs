use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use thiserror::Error;

use crate::traits::tally_events;
use crate::traits::CatalogReader;
use crate::types::Item;
use crate::types::ItemId;
use crate::types::RatingEvent;
use crate::types::RatingScope;
use crate::types::RatingTally;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryCatalogError {
    #[error("catalog is unavailable: {0}")]
    Unavailable(String),
}

/// Number of queries served, by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryCounts {
    pub pages:      u64,
    pub events:     u64,
    pub aggregates: u64,
}

impl QueryCounts {
    pub fn total(&self) -> u64 {
        self.pages + self.events + self.aggregates
    }
}

/// In-process catalog. Every query can be slowed down by a fixed latency and the whole catalog can be switched into
/// a failing state, which makes it handy for exercising the cache around it.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    items:       RwLock<BTreeMap<ItemId, Item>>,
    events:      RwLock<Vec<RatingEvent>>,
    latency:     RwLock<Option<Duration>>,
    unavailable: RwLock<Option<String>>,
    pages:       AtomicU64,
    event_reads: AtomicU64,
    aggregates:  AtomicU64,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.write() = Some(latency);
        self
    }

    pub fn add_item(&self, item: Item) {
        self.items.write().insert(item.id, item);
    }

    pub fn add_items<I: IntoIterator<Item = Item>>(&self, items: I) {
        let mut guard = self.items.write();
        for item in items {
            guard.insert(item.id, item);
        }
    }

    pub fn record_rating(&self, event: RatingEvent) {
        self.events.write().push(event);
    }

    pub fn record_ratings<I: IntoIterator<Item = RatingEvent>>(&self, events: I) {
        self.events.write().extend(events);
    }

    pub fn item_count(&self) -> usize {
        self.items.read().len()
    }

    pub fn rating_count(&self) -> usize {
        self.events.read().len()
    }

    /// Makes every following query fail with [`MemoryCatalogError::Unavailable`] until [`restore()`](Self::restore).
    pub fn fail_with<S: Into<String>>(&self, reason: S) {
        *self.unavailable.write() = Some(reason.into());
    }

    pub fn restore(&self) {
        *self.unavailable.write() = None;
    }

    pub fn query_counts(&self) -> QueryCounts {
        QueryCounts {
            pages:      self.pages.load(Ordering::Relaxed),
            events:     self.event_reads.load(Ordering::Relaxed),
            aggregates: self.aggregates.load(Ordering::Relaxed),
        }
    }

    async fn enter(&self, counter: &AtomicU64) -> Result<(), MemoryCatalogError> {
        counter.fetch_add(1, Ordering::Relaxed);
        let latency = *self.latency.read();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        match self.unavailable.read().as_ref() {
            Some(reason) => Err(MemoryCatalogError::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CatalogReader for MemoryCatalog {
    type Error = MemoryCatalogError;

    async fn fetch_catalog_page(&self, offset: u64, limit: u64) -> Result<Vec<Item>, Self::Error> {
        self.enter(&self.pages).await?;
        Ok(self
            .items
            .read()
            .values()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn fetch_rating_events(&self, scope: &RatingScope) -> Result<Vec<RatingEvent>, Self::Error> {
        self.enter(&self.event_reads).await?;
        Ok(self.events.read().iter().filter(|e| scope.covers(e)).cloned().collect())
    }

    async fn aggregate_ratings(&self, scope: &RatingScope) -> Result<Vec<RatingTally>, Self::Error> {
        self.enter(&self.aggregates).await?;
        Ok(tally_events(self.events.read().iter().filter(|e| scope.covers(e))))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::aggregate::AggregationIndex;
    use crate::test::book;
    use crate::test::rating;

    #[tokio::test]
    async fn pages_are_ordered_by_id() {
        let catalog = MemoryCatalog::new();
        catalog.add_items((1..=7).rev().map(book));

        let page = catalog.fetch_catalog_page(2, 3).await.unwrap();
        assert_eq!(page.iter().map(|i| i.id.0).collect::<Vec<_>>(), vec![3, 4, 5]);
        assert!(catalog.fetch_catalog_page(7, 3).await.unwrap().is_empty());
        assert_eq!(catalog.query_counts().pages, 2);
    }

    #[tokio::test]
    async fn aggregation_is_one_query() {
        let catalog = MemoryCatalog::new();
        catalog.add_items((1..=100).map(book));
        catalog.record_ratings((1..=100).flat_map(|i| [rating(i, 1, 5), rating(i, 2, 3)]));

        let index = AggregationIndex::build(&catalog).await.unwrap();
        assert_eq!(index.len(), 100);
        assert_eq!(index.mean_or_zero(ItemId(42)), 4.0);
        assert_eq!(
            catalog.query_counts(),
            QueryCounts {
                pages:      0,
                events:     0,
                aggregates: 1,
            }
        );

        let scoped = AggregationIndex::build_for(&catalog, [ItemId(1), ItemId(2), ItemId(500)]).await.unwrap();
        assert_eq!(scoped.len(), 2);
        assert_eq!(catalog.query_counts().aggregates, 2);
    }

    #[tokio::test]
    async fn failing_catalog() {
        let catalog = MemoryCatalog::new();
        catalog.fail_with("maintenance");
        assert_eq!(
            catalog.fetch_catalog_page(0, 10).await.unwrap_err(),
            MemoryCatalogError::Unavailable("maintenance".into())
        );
        catalog.restore();
        assert!(catalog.fetch_catalog_page(0, 10).await.is_ok());
    }
}
