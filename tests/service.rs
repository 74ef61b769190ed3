use rec_cache::catalog::memory::MemoryCatalogError;
use rec_cache::catalog::memory::QueryCounts;
use rec_cache::prelude::*;
use rec_cache::test::book;
use rec_cache::test::rating;
use rec_cache::test::CountingRecommender;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

fn catalog(items: i32) -> Arc<MemoryCatalog> {
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.add_items((1..=items).map(book));
    // Every item gets three ratings from distinct raters.
    catalog.record_ratings((1..=items).flat_map(|i| {
        [
            rating(i, 1000 + i, 1 + i % 5),
            rating(i, 2000 + i, 1 + (i * 3) % 5),
            rating(i, 3000 + i, 1 + (i * 7) % 5),
        ]
    }));
    catalog
}

fn config() -> CacheConfig {
    CacheConfig {
        page_size: 100,
        ..Default::default()
    }
}

#[tokio::test]
async fn recomputation_has_no_per_item_queries() {
    for items in [150, 1000] {
        let catalog = catalog(items);
        let svc = RecommendationService::new(Arc::clone(&catalog), TopRated::from_config(&config()).unwrap(), &config())
            .unwrap();

        let recs = svc.get_recommendations(UserId(1)).await.unwrap();
        assert_eq!(recs.items.len(), 10);

        let counts = catalog.query_counts();
        assert_eq!(counts.aggregates, 1, "{items} items");
        assert_eq!(counts.events, 1, "{items} items");
        // Full pages plus the one that comes back short.
        assert_eq!(counts.pages, items as u64 / 100 + 1, "{items} items");

        svc.get_recommendations(UserId(1)).await.unwrap();
        assert_eq!(catalog.query_counts().total(), counts.total());
    }
}

#[tokio::test]
async fn ranking_is_ordered_and_skips_rated_items() {
    let catalog = catalog(60);
    // The subject has rated the first five items already.
    catalog.record_ratings((1..=5).map(|i| rating(i, 7, 5)));
    let svc = RecommendationService::new(Arc::clone(&catalog), TopRated::from_config(&config()).unwrap(), &config())
        .unwrap();

    let recs = svc.get_recommendations(UserId(7)).await.unwrap();
    assert_eq!(recs.subject, UserId(7));
    assert!(recs.items.iter().all(|r| r.item.id.0 > 5));
    assert!(recs.items.windows(2).all(|w| w[0].score >= w[1].score));
    for ranked in &recs.items {
        assert_eq!(ranked.rating_count, 3);
        assert!(ranked.avg_rating >= 1.0 && ranked.avg_rating <= 5.0);
    }

    // Same inputs, same ranking.
    let other = RecommendationService::new(catalog, TopRated::from_config(&config()).unwrap(), &config()).unwrap();
    assert_eq!(other.get_recommendations(UserId(7)).await.unwrap().item_ids(), recs.item_ids());
}

#[tokio::test(start_paused = true)]
async fn concurrent_requests_share_one_recomputation() {
    let catalog = catalog(200);
    let recommender = CountingRecommender::new(TopRated::default()).with_delay(Duration::from_millis(100));
    let svc = RecommendationService::new(Arc::clone(&catalog), recommender, &config()).unwrap();

    let mut tasks = JoinSet::new();
    for _ in 0..50 {
        let svc = svc.clone();
        tasks.spawn(async move { svc.get_recommendations(UserId(1)).await });
    }

    let mut lists = Vec::new();
    while let Some(outcome) = tasks.join_next().await {
        lists.push(outcome.unwrap().unwrap());
    }

    assert_eq!(svc.recommender().calls(), 1);
    assert_eq!(catalog.query_counts().aggregates, 1);
    assert!(lists.iter().all(|l| Arc::ptr_eq(l, &lists[0])));
}

#[tokio::test]
async fn catalog_failure_is_reported_and_not_cached() {
    let catalog = catalog(20);
    let svc = RecommendationService::new(Arc::clone(&catalog), TopRated::default(), &config()).unwrap();

    catalog.fail_with("maintenance");
    let err = svc.get_recommendations(UserId(1)).await.unwrap_err();
    assert_eq!(
        err.recompute_error(),
        Some(&MemoryCatalogError::Unavailable("maintenance".to_string()))
    );
    assert!(svc.cache().is_empty());
    assert_eq!(svc.stats().failures, 1);

    catalog.restore();
    let recs = svc.get_recommendations(UserId(1)).await.unwrap();
    assert_eq!(recs.items.len(), 10);
}

#[tokio::test]
async fn invalidation_picks_up_new_ratings() {
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.add_items((1..=10).map(book));
    catalog.record_ratings((1..=10).map(|i| rating(i, 500, 3)));

    let recommender = TopRated::builder().limit(3).jitter(0.0).build().unwrap();
    let svc = RecommendationService::new(Arc::clone(&catalog), recommender, &config()).unwrap();

    // All items are equal; ties go to the lower ID.
    let before = svc.get_recommendations(UserId(1)).await.unwrap();
    assert_eq!(before.item_ids(), vec![ItemId(1), ItemId(2), ItemId(3)]);

    catalog.record_ratings((0..20).map(|r| rating(7, 600 + r, 5)));
    let cached = svc.get_recommendations(UserId(1)).await.unwrap();
    assert!(Arc::ptr_eq(&before, &cached));

    svc.invalidate_recommendations(UserId(1));
    let after = svc.get_recommendations(UserId(1)).await.unwrap();
    assert_eq!(after.item_ids()[0], ItemId(7));
}

#[tokio::test]
async fn many_subjects_stay_within_capacity() {
    let catalog = catalog(30);
    let config = CacheConfig {
        capacity: 5,
        ..config()
    };
    let svc = RecommendationService::new(catalog, TopRated::default(), &config).unwrap();

    for subject in 0..20 {
        svc.get_recommendations(UserId(subject)).await.unwrap();
        assert!(svc.cache().len() <= 5);
    }

    let stats = svc.stats();
    assert_eq!(stats.entries, 5);
    assert_eq!(stats.evictions, 15);
    assert_eq!(stats.recomputations, 20);
}

#[tokio::test]
async fn bucketed_keys_still_single_entry_per_bucket() {
    let catalog = catalog(30);
    let config = CacheConfig {
        key_policy: KeyPolicy::Bucketed { bucket_secs: 3600 },
        ..config()
    };
    let svc = RecommendationService::new(catalog, TopRated::default(), &config).unwrap();

    svc.get_recommendations(UserId(3)).await.unwrap();
    svc.get_recommendations(UserId(3)).await.unwrap();
    assert_eq!(svc.stats().recomputations, 1);
    assert_eq!(svc.cache().len(), 1);

    svc.invalidate_recommendations(UserId(3));
    assert!(svc.cache().is_empty());
}

#[tokio::test]
async fn empty_catalog_gives_empty_list() {
    let catalog = Arc::new(MemoryCatalog::new());
    let svc = RecommendationService::new(Arc::clone(&catalog), TopRated::default(), &config()).unwrap();

    let recs = svc.get_recommendations(UserId(1)).await.unwrap();
    assert!(recs.is_empty());
    assert_eq!(
        catalog.query_counts(),
        QueryCounts {
            pages:      1,
            events:     1,
            aggregates: 1,
        }
    );
}
