use async_trait::async_trait;
use chrono::Utc;
use fieldx::fxstruct;
use std::cmp::Ordering;
use std::collections::HashSet;
use tracing::debug;
use tracing::instrument;

use crate::aggregate::AggregationIndex;
use crate::config::CacheConfig;
use crate::error::ConfigError;
use crate::traits::CatalogReader;
use crate::traits::Recommender;
use crate::types::Item;
use crate::types::ItemId;
use crate::types::RankedItem;
use crate::types::RatingScope;
use crate::types::Recommendations;
use crate::types::UserId;

/// Ranks catalog items by their smoothed mean rating, skipping the ones the subject has already rated.
///
/// The score of an item is its Bayesian mean (its ratings plus `prior_weight` pseudo-ratings at the catalog-wide mean,
/// so a single 5-star review doesn't beat a hundred 4.8 ones) plus a per-subject jitter in `[0, jitter)`. The jitter is
/// derived from a hash of the subject and the item, which keeps lists personal yet reproducible.
///
/// The catalog is walked page by page; summaries come from the [`AggregationIndex`] handed in, so the number of
/// catalog queries depends on the number of pages only.
#[derive(Debug, Clone, PartialEq)]
#[fxstruct(no_new, default, get(copy), builder(error(ConfigError), post_build))]
pub struct TopRated {
    /// Length of the produced list. Must be positive.
    #[fieldx(default(10))]
    limit:        usize,
    /// Catalog page size. Zero is bumped up to one.
    #[fieldx(default(500))]
    page_size:    u64,
    /// Number of pseudo-ratings at the catalog mean added to every item.
    #[fieldx(default(2.0))]
    prior_weight: f64,
    /// Upper bound of the per-subject score jitter; zero turns it off.
    #[fieldx(default(1.0))]
    jitter:       f64,
}

impl TopRated {
    pub fn new(limit: usize) -> Result<Self, ConfigError> {
        Self::builder().limit(limit).build()
    }

    pub fn from_config(config: &CacheConfig) -> Result<Self, ConfigError> {
        Self::builder()
            .limit(config.limit())
            .page_size(config.page_size())
            .build()
    }

    fn post_build(mut self) -> Result<Self, ConfigError> {
        if self.limit == 0 {
            return Err(ConfigError::ZeroLimit);
        }
        self.page_size = self.page_size.max(1);
        self.prior_weight = self.prior_weight.max(0.0);
        self.jitter = self.jitter.max(0.0);
        Ok(self)
    }

    fn score(&self, subject: UserId, item: &Item, ratings: &AggregationIndex, prior: f64) -> f64 {
        let count = ratings.count(item.id) as f64;
        let mean = ratings.mean_or_zero(item.id);
        let smoothed = if count + self.prior_weight > 0.0 {
            (count * mean + self.prior_weight * prior) / (count + self.prior_weight)
        }
        else {
            0.0
        };
        smoothed + self.jitter * unit_hash(subject, item.id)
    }

    fn rank(&self, ranked: &mut Vec<RankedItem>) {
        ranked.sort_by(by_score);
        ranked.truncate(self.limit);
    }
}

// Best score first; equal scores keep the lower item ID first.
fn by_score(a: &RankedItem, b: &RankedItem) -> Ordering {
    b.score.total_cmp(&a.score).then_with(|| a.item.id.cmp(&b.item.id))
}

// Maps a (subject, item) pair to [0, 1) with the splitmix64 finalizer.
fn unit_hash(subject: UserId, item: ItemId) -> f64 {
    let mut x = ((subject.0 as u32 as u64) << 32) | item.0 as u32 as u64;
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^= x >> 31;
    (x >> 11) as f64 / (1u64 << 53) as f64
}

#[async_trait]
impl<C> Recommender<C> for TopRated
where
    C: CatalogReader,
{
    #[instrument(level = "debug", skip(self, catalog, ratings))]
    async fn recompute(
        &self,
        subject: UserId,
        catalog: &C,
        ratings: &AggregationIndex,
    ) -> Result<Recommendations, C::Error> {
        let already_rated: HashSet<ItemId> = catalog
            .fetch_rating_events(&RatingScope::Rater(subject))
            .await?
            .into_iter()
            .map(|e| e.item_id)
            .collect();

        let prior = ratings.global_mean();
        let mut ranked = Vec::new();
        let mut offset = 0;
        let mut pages = 0;

        loop {
            let page = catalog.fetch_catalog_page(offset, self.page_size).await?;
            let fetched = page.len() as u64;
            pages += 1;

            ranked.extend(page.into_iter().filter(|i| !already_rated.contains(&i.id)).map(|item| {
                let score = self.score(subject, &item, ratings, prior);
                RankedItem {
                    avg_rating: ratings.mean_or_zero(item.id),
                    rating_count: ratings.count(item.id),
                    score,
                    item,
                }
            }));
            // Only the best `limit` can make it, no need to carry the rest over.
            self.rank(&mut ranked);

            if fetched < self.page_size {
                break;
            }
            offset += fetched;
        }

        debug!(
            "ranked catalog for #{subject} in {pages} page(s), {} already rated",
            already_rated.len()
        );

        Ok(Recommendations {
            subject,
            items: ranked,
            generated_at: Utc::now(),
        })
    }
}
