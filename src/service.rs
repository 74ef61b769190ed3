use std::sync::Arc;
use tracing::debug;
use tracing::instrument;

use crate::aggregate::AggregationIndex;
use crate::cache::BoundedCache;
use crate::cache::CacheStats;
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::error::ConfigError;
use crate::key_policy::DerivedKey;
use crate::key_policy::KeyPolicy;
use crate::traits::CatalogReader;
use crate::traits::Recommender;
use crate::types::Recommendations;
use crate::types::UserId;

pub type RecommendationCache<E> = BoundedCache<String, Arc<Recommendations>, E>;

/// Serves per-subject recommendation lists through a [`BoundedCache`].
///
/// A miss builds a fresh [`AggregationIndex`] over the whole catalog with one grouped query and hands it to the
/// recommender. Concurrent requests for the same subject share that work.
pub struct RecommendationService<C, R>
where
    C: CatalogReader,
    R: Recommender<C>,
{
    catalog:     Arc<C>,
    recommender: Arc<R>,
    policy:      KeyPolicy,
    cache:       Arc<RecommendationCache<C::Error>>,
}

impl<C, R> RecommendationService<C, R>
where
    C: CatalogReader,
    R: Recommender<C>,
{
    pub fn new(catalog: Arc<C>, recommender: R, config: &CacheConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let cache = RecommendationCache::<C::Error>::builder()
            .name(config.name())
            .capacity(config.capacity())
            .ttl(config.ttl())
            .sweep_interval(config.sweep_interval())
            .build()?;

        Ok(Self {
            catalog,
            recommender: Arc::new(recommender),
            policy: config.key_policy(),
            cache: Arc::new(cache),
        })
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn get_recommendations(&self, subject: UserId) -> Result<Arc<Recommendations>, CacheError<C::Error>> {
        let DerivedKey { key, window } = self.policy.derive(subject, self.cache.ttl());
        let catalog = Arc::clone(&self.catalog);
        let recommender = Arc::clone(&self.recommender);

        self.cache
            .get_with_ttl(key, window, move || async move {
                let ratings = AggregationIndex::build(catalog.as_ref()).await?;
                let recommendations = recommender.recompute(subject, catalog.as_ref(), &ratings).await?;
                Ok::<_, C::Error>(Arc::new(recommendations))
            })
            .await
    }

    /// Drops the cached list of the subject so that the next request recomputes it. Safe to call for subjects that have
    /// nothing cached.
    pub fn invalidate_recommendations(&self, subject: UserId) {
        let DerivedKey { key, .. } = self.policy.derive(subject, self.cache.ttl());
        debug!("invalidating recommendations of #{subject}");
        self.cache.invalidate(&key);
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn cache(&self) -> &Arc<RecommendationCache<C::Error>> {
        &self.cache
    }

    pub fn catalog(&self) -> &Arc<C> {
        &self.catalog
    }

    pub fn recommender(&self) -> &Arc<R> {
        &self.recommender
    }

    pub fn policy(&self) -> &KeyPolicy {
        &self.policy
    }
}

impl<C, R> Clone for RecommendationService<C, R>
where
    C: CatalogReader,
    R: Recommender<C>,
{
    fn clone(&self) -> Self {
        Self {
            catalog:     Arc::clone(&self.catalog),
            recommender: Arc::clone(&self.recommender),
            policy:      self.policy.clone(),
            cache:       Arc::clone(&self.cache),
        }
    }
}
