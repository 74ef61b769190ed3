use crate::entry::EntryTable;
use crate::entry::Removal;
use crate::error::CacheError;
use crate::error::ConfigError;
use fieldx::fxstruct;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Debug;
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;
use tracing::instrument;
use tracing::trace;
use tracing::warn;

type Outcome<V, E> = Result<V, CacheError<E>>;

// Placeholder for a recomputation in progress. Waiters subscribe to the channel; the value turns from `None` into the
// outcome exactly once.
struct InFlight<V, E>
where
    E: Display + Debug + Send + Sync + 'static,
{
    tx:          watch::Sender<Option<Outcome<V, E>>>,
    invalidated: AtomicBool,
}

impl<V, E> InFlight<V, E>
where
    V: Clone,
    E: Display + Debug + Send + Sync + 'static,
{
    fn new() -> Self {
        Self {
            tx:          watch::Sender::new(None),
            invalidated: AtomicBool::new(false),
        }
    }

    #[inline]
    fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Acquire)
    }

    fn invalidate(&self) {
        self.invalidated.store(true, Ordering::Release);
    }

    fn publish(&self, outcome: Outcome<V, E>) {
        // send_replace stores the value even when nobody is subscribed at the moment.
        self.tx.send_replace(Some(outcome));
    }

    #[inline]
    fn is_published(&self) -> bool {
        self.tx.borrow().is_some()
    }

    // Dropping the future returned by this method only unsubscribes the caller; the recomputation goes on.
    async fn wait(&self) -> Outcome<V, E> {
        let mut rx = self.tx.subscribe();
        let published = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        published.unwrap_or_else(|| Err(CacheError::Aborted("recomputation vanished before publishing".to_string())))
    }
}

enum Claim<V, E>
where
    E: Display + Debug + Send + Sync + 'static,
{
    Hit(V),
    Join(Arc<InFlight<V, E>>),
    Lead(Arc<InFlight<V, E>>),
}

// Owned by the task publishing a recomputation outcome. Should the task unwind or be torn down before the outcome is
// out, dropping the guard releases the key and reports the recomputation as aborted.
struct PublishGuard<K, V, E>
where
    K: Debug + Display + Hash + Clone + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Display + Debug + Send + Sync + 'static,
{
    cache:  Weak<BoundedCache<K, V, E>>,
    key:    K,
    marker: Arc<InFlight<V, E>>,
}

impl<K, V, E> Drop for PublishGuard<K, V, E>
where
    K: Debug + Display + Hash + Clone + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Display + Debug + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if self.marker.is_published() {
            return;
        }
        if let Some(cache) = self.cache.upgrade() {
            cache.release(&self.key, &self.marker);
            Counters::bump(&cache.counters.failures);
            warn!("[{}] recomputation of '{}' was abandoned before publishing", cache.name, self.key);
        }
        self.marker
            .publish(Err(CacheError::Aborted("recomputation outcome was never published".to_string())));
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits:           AtomicU64,
    misses:         AtomicU64,
    recomputations: AtomicU64,
    failures:       AtomicU64,
    evictions:      AtomicU64,
    expirations:    AtomicU64,
}

impl Counters {
    #[inline(always)]
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// A point-in-time copy of cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Requests served from a stored entry.
    pub hits:           u64,
    /// Requests that had to wait for a recomputation, either their own or a shared one.
    pub misses:         u64,
    /// Recomputations that succeeded.
    pub recomputations: u64,
    /// Recomputations that failed or were aborted.
    pub failures:       u64,
    /// Live entries dropped to respect the capacity.
    pub evictions:      u64,
    /// Expired entries purged, whichever way it happened.
    pub expirations:    u64,
    /// Entries stored at the moment of the snapshot, expired ones not purged yet included.
    pub entries:        usize,
    /// Recomputations running at the moment of the snapshot.
    pub in_flight:      usize,
}

/// The longest TTL a cache accepts, about ten years. Entry lifetimes are computed against the monotonic clock and have to
/// stay representable there.
pub const MAX_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// A capacity- and TTL-bounded key/value store that recomputes missing values with single-flight semantics.
///
/// ```ignore
/// let cache = Arc::new(
///     BoundedCache::<String, Vec<u32>, MyError>::builder()
///         .name("recommendations")
///         .capacity(1000)
///         .ttl(Duration::from_secs(60))
///         .build()?,
/// );
///
/// let value = cache
///     .get("rec_1".to_string(), || async move { compute_for_user(1).await })
///     .await?;
/// ```
///
/// Only one recomputation per key runs at any moment; everybody asking for the same key while it runs gets its
/// outcome, be it a value or an error. Errors are never cached. Recomputations run on their own tokio tasks, outside of
/// any lock, so a slow key never holds up other keys and a cancelled caller never cancels the work others wait for.
///
/// The entry table and the in-flight table are guarded by separate mutexes which are held for bookkeeping only. When
/// both are needed the in-flight table is locked first.
///
/// Lookups take the cache by `Arc` because recomputations and the expiry sweeper keep a weak reference to it.
#[fxstruct(
    sync,
    no_new,
    builder(
        error(ConfigError),
        post_build(validate),
        doc("Builder object of [`BoundedCache`].", "", "See [`BoundedCache::builder()`] method."),
        method_doc("Implement builder pattern for [`BoundedCache`]."),
    )
)]
pub struct BoundedCache<K, V, E>
where
    K: Debug + Display + Hash + Clone + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Display + Debug + Send + Sync + 'static,
{
    /// Cache name. Most useful for debugging and logging.
    #[fieldx(get, builder(into), default(std::any::type_name::<V>().to_string()))]
    name: String,

    /// Maximum number of stored entries. Mandatory, must be positive.
    #[fieldx(get(copy), builder(required))]
    capacity: usize,

    /// Lifetime of an entry. Mandatory, must be positive and not longer than [`MAX_TTL`].
    #[fieldx(get(copy), builder(required))]
    ttl: Duration,

    /// How often the background sweeper purges expired entries. Defaults to the TTL.
    #[fieldx(get(off), builder(into), default(None))]
    sweep_interval: Option<Duration>,

    #[fieldx(builder(off), default(Mutex::new(EntryTable::new())))]
    entries: Mutex<EntryTable<K, V>>,

    #[fieldx(builder(off), default(Mutex::new(HashMap::new())))]
    in_flight: Mutex<HashMap<K, Arc<InFlight<V, E>>>>,

    #[fieldx(builder(off), default(Mutex::new(None)))]
    sweeper: Mutex<Option<JoinHandle<()>>>,

    #[fieldx(builder(off), default(Counters::default()))]
    counters: Counters,
}

impl<K, V, E> BoundedCache<K, V, E>
where
    K: Debug + Display + Hash + Clone + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Display + Debug + Send + Sync + 'static,
{
    // The cache is never handed out misconfigured.
    fn validate(mut self) -> Result<Self, ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.ttl.is_zero() {
            return Err(ConfigError::ZeroTtl);
        }
        if self.ttl > MAX_TTL {
            return Err(ConfigError::TtlTooLong(self.ttl));
        }
        if self.sweep_interval.get_or_insert(self.ttl).is_zero() {
            return Err(ConfigError::ZeroSweepInterval);
        }
        Ok(self)
    }

    #[inline]
    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval.unwrap_or(self.ttl)
    }

    /// Number of stored entries, including expired ones not purged yet. Never exceeds the capacity.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of recomputations currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            hits:           c.hits.load(Ordering::Relaxed),
            misses:         c.misses.load(Ordering::Relaxed),
            recomputations: c.recomputations.load(Ordering::Relaxed),
            failures:       c.failures.load(Ordering::Relaxed),
            evictions:      c.evictions.load(Ordering::Relaxed),
            expirations:    c.expirations.load(Ordering::Relaxed),
            entries:        self.len(),
            in_flight:      self.in_flight(),
        }
    }

    /// Returns the value for `key`, recomputing it with `recompute` when there is no fresh entry.
    pub async fn get<F, Fut>(self: &Arc<Self>, key: K, recompute: F) -> Result<V, CacheError<E>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        self.get_with_ttl(key, self.ttl, recompute).await
    }

    /// Same as [`get()`](Self::get), but a recomputed value lives for `ttl` or the cache TTL, whichever is shorter.
    #[instrument(level = "trace", skip(self, recompute), fields(cache = %self.name))]
    pub async fn get_with_ttl<F, Fut>(self: &Arc<Self>, key: K, ttl: Duration, recompute: F) -> Result<V, CacheError<E>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        if let Some(value) = self.fresh_value(&key) {
            Counters::bump(&self.counters.hits);
            return Ok(value);
        }

        let marker = loop {
            match self.claim(&key) {
                Claim::Hit(value) => {
                    Counters::bump(&self.counters.hits);
                    return Ok(value);
                }
                Claim::Join(marker) if marker.is_invalidated() => {
                    // Its result is not going to be stored; let it finish and then compute anew.
                    trace!("[{}] waiting out invalidated recomputation of '{key}'", self.name);
                    let _ = marker.wait().await;
                }
                Claim::Join(marker) => {
                    Counters::bump(&self.counters.misses);
                    trace!("[{}] joining recomputation of '{key}'", self.name);
                    return marker.wait().await;
                }
                Claim::Lead(marker) => break marker,
            }
        };

        Counters::bump(&self.counters.misses);
        debug!("[{}] MISS({key}), recomputing", self.name);
        self.spawn_recompute(key, Arc::clone(&marker), ttl.min(self.ttl), recompute);
        marker.wait().await
    }

    /// Returns a fresh value without affecting its recency of use.
    pub fn peek(&self, key: &K) -> Option<V> {
        let entries = self.entries.lock();
        entries
            .get(key)
            .filter(|e| !e.is_expired_at(Instant::now()))
            .map(|e| e.value().clone())
    }

    /// Removes the entry for `key` if there is one. A recomputation already running for the key still delivers its
    /// result to the callers waiting on it, but the result is not stored.
    pub fn invalidate(&self, key: &K) {
        let in_flight = self.in_flight.lock();
        if let Some(marker) = in_flight.get(key) {
            marker.invalidate();
        }
        let removed = self.entries.lock().remove(key).is_some();
        drop(in_flight);

        if removed {
            debug!("[{}] INVALIDATE({key})", self.name);
        }
    }

    pub fn invalidate_all(&self) {
        let in_flight = self.in_flight.lock();
        for marker in in_flight.values() {
            marker.invalidate();
        }
        let count = self.entries.lock().clear();
        drop(in_flight);

        debug!("[{}] INVALIDATE_ALL, {count} entries dropped", self.name);
    }

    /// Drops all expired entries. Returns the number of entries purged.
    pub fn purge_expired(&self) -> usize {
        let purged = self.entries.lock().purge_expired(Instant::now());
        if !purged.is_empty() {
            self.counters.expirations.fetch_add(purged.len() as u64, Ordering::Relaxed);
            trace!("[{}] purged {} expired entries", self.name, purged.len());
        }
        purged.len()
    }

    // Lazy expiry: an expired entry met on the way is dropped right away.
    fn fresh_value(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        if entries.get(key)?.is_expired_at(now) {
            entries.remove(key);
            Counters::bump(&self.counters.expirations);
            trace!("[{}] EXPIRED({key})", self.name);
            return None;
        }

        entries.touch(key, now).map(|e| e.value().clone())
    }

    fn claim(&self, key: &K) -> Claim<V, E> {
        let mut in_flight = self.in_flight.lock();

        if let Some(marker) = in_flight.get(key) {
            return Claim::Join(Arc::clone(marker));
        }

        // The previous recomputation could have been published since our first lookup.
        if let Some(value) = self.fresh_value(key) {
            return Claim::Hit(value);
        }

        let marker = Arc::new(InFlight::new());
        in_flight.insert(key.clone(), Arc::clone(&marker));
        Claim::Lead(marker)
    }

    fn spawn_recompute<F, Fut>(self: &Arc<Self>, key: K, marker: Arc<InFlight<V, E>>, ttl: Duration, recompute: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let guard = PublishGuard {
            cache: Arc::downgrade(self),
            key,
            marker,
        };
        let name = self.name.clone();

        tokio::spawn(async move {
            let started = Instant::now();
            // The inner task isolates a panicking recomputation from the publishing logic.
            let outcome = match tokio::spawn(recompute()).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(CacheError::Recompute(Arc::new(err))),
                Err(join_err) => Err(CacheError::Aborted(join_err.to_string())),
            };

            trace!(
                "[{name}] recomputation of '{}' took {:?}, {} waiter(s)",
                guard.key,
                started.elapsed(),
                guard.marker.tx.receiver_count()
            );

            if let Some(cache) = guard.cache.upgrade() {
                cache.publish(&guard.key, &guard.marker, ttl, outcome);
            }
            else {
                guard.marker.publish(outcome);
            }
        });
    }

    // Forgets the in-flight marker of `key` if it is still the one given.
    fn release(&self, key: &K, marker: &Arc<InFlight<V, E>>) {
        let mut in_flight = self.in_flight.lock();
        if in_flight.get(key).is_some_and(|m| Arc::ptr_eq(m, marker)) {
            in_flight.remove(key);
        }
    }

    fn publish(self: &Arc<Self>, key: &K, marker: &Arc<InFlight<V, E>>, ttl: Duration, outcome: Outcome<V, E>) {
        let mut removals = Vec::new();

        {
            let mut in_flight = self.in_flight.lock();
            if in_flight.get(key).is_some_and(|m| Arc::ptr_eq(m, marker)) {
                in_flight.remove(key);
            }

            if let Ok(value) = &outcome {
                if !marker.is_invalidated() {
                    removals =
                        self.entries
                            .lock()
                            .insert(key.clone(), value.clone(), Instant::now(), ttl, self.capacity);
                }
            }
        }

        for (victim, removal) in &removals {
            match removal {
                Removal::Expired => Counters::bump(&self.counters.expirations),
                Removal::Evicted => Counters::bump(&self.counters.evictions),
            }
            debug!("[{}] EVICT({victim}) {removal:?} to make room for '{key}'", self.name);
        }

        match &outcome {
            Ok(_) => Counters::bump(&self.counters.recomputations),
            Err(err) => {
                Counters::bump(&self.counters.failures);
                warn!("[{}] recomputation of '{key}' failed: {err}", self.name);
            }
        }

        marker.publish(outcome);

        if !self.is_empty() {
            self.ensure_sweeper();
        }
    }

    fn ensure_sweeper(self: &Arc<Self>) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.as_ref().is_none_or(|task| task.is_finished()) {
            debug!("[{}] starting expiry sweeper", self.name);
            *sweeper = Some(tokio::spawn(Self::sweep(Arc::downgrade(self), self.sweep_interval())));
        }
    }

    // Holds only a weak reference between rounds so that the cache can be dropped at any time.
    async fn sweep(cache: Weak<Self>, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;

            let Some(cache) = cache.upgrade()
            else {
                break;
            };

            cache.purge_expired();

            let mut sweeper = cache.sweeper.lock();
            if cache.is_empty() {
                // Don't take resources while there is nothing to expire; the next insert restarts us.
                debug!("[{}] stopping expiry sweeper, cache is empty", cache.name);
                *sweeper = None;
                break;
            }
        }
    }
}

impl<K, V, E> Drop for BoundedCache<K, V, E>
where
    K: Debug + Display + Hash + Clone + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Display + Debug + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            sweeper.abort();
        }
    }
}

impl<K, V, E> Debug for BoundedCache<K, V, E>
where
    K: Debug + Display + Hash + Clone + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Display + Debug + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedCache")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("ttl", &self.ttl)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, thiserror::Error)]
    #[error("boom #{0}")]
    struct Boom(usize);

    type TestCache = BoundedCache<String, Vec<u32>, Boom>;

    fn cache(capacity: usize, ttl_secs: u64) -> Arc<TestCache> {
        Arc::new(
            TestCache::builder()
                .name("test")
                .capacity(capacity)
                .ttl(Duration::from_secs(ttl_secs))
                .build()
                .unwrap(),
        )
    }

    fn counted(calls: &Arc<AtomicUsize>, value: Vec<u32>) -> impl FnOnce() -> std::future::Ready<Result<Vec<u32>, Boom>> {
        let calls = Arc::clone(calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok(value))
        }
    }

    fn explode() -> Result<Vec<u32>, Boom> {
        panic!("recommender exploded")
    }

    #[test]
    fn rejects_misconfiguration() {
        let built = |capacity, ttl| TestCache::builder().capacity(capacity).ttl(ttl).build();

        assert_eq!(built(0, Duration::from_secs(1)).unwrap_err(), ConfigError::ZeroCapacity);
        assert_eq!(built(1, Duration::ZERO).unwrap_err(), ConfigError::ZeroTtl);
        assert_eq!(
            built(1, Duration::from_secs(u64::MAX)).unwrap_err(),
            ConfigError::TtlTooLong(Duration::from_secs(u64::MAX))
        );
        assert_eq!(
            TestCache::builder()
                .capacity(1)
                .ttl(Duration::from_secs(1))
                .sweep_interval(Duration::ZERO)
                .build()
                .unwrap_err(),
            ConfigError::ZeroSweepInterval
        );
        assert!(matches!(
            TestCache::builder().ttl(Duration::from_secs(1)).build(),
            Err(ConfigError::Incomplete(_))
        ));
    }

    #[test]
    fn defaults_follow_configuration() {
        let cache = cache(3, 30);
        assert_eq!(cache.name(), "test");
        assert_eq!(cache.capacity(), 3);
        assert_eq!(cache.ttl(), Duration::from_secs(30));
        assert_eq!(cache.sweep_interval(), Duration::from_secs(30));

        let unnamed = TestCache::builder()
            .capacity(1)
            .ttl(MAX_TTL)
            .build()
            .unwrap();
        assert_eq!(unnamed.name(), std::any::type_name::<Vec<u32>>());
    }

    #[tokio::test]
    async fn hit_after_miss() {
        let cache = cache(4, 60);
        let calls = Arc::new(AtomicUsize::new(0));

        let v = cache.get("u1".into(), counted(&calls, vec![1, 2])).await.unwrap();
        assert_eq!(v, vec![1, 2]);
        let v = cache.get("u1".into(), counted(&calls, vec![9])).await.unwrap();
        assert_eq!(v, vec![1, 2]);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.recomputations, 1);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn lru_eviction_scenario() {
        let cache = cache(2, 60);
        let calls = Arc::new(AtomicUsize::new(0));

        for key in ["u1", "u2", "u3"] {
            cache.get(key.into(), counted(&calls, vec![])).await.unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(cache.len(), 2);
        assert!(cache.peek(&"u1".to_string()).is_none());
        assert!(cache.peek(&"u2".to_string()).is_some());

        cache.get("u1".into(), counted(&calls, vec![])).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(cache.stats().evictions, 2);
        assert!(cache.len() <= 2);
    }

    #[tokio::test]
    async fn size_never_exceeds_capacity() {
        let cache = cache(5, 60);
        let calls = Arc::new(AtomicUsize::new(0));

        for i in 0..50u32 {
            cache.get(format!("k{i}"), counted(&calls, vec![i])).await.unwrap();
            assert!(cache.len() <= 5);
        }
        assert_eq!(cache.stats().evictions, 45);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_is_recomputed() {
        let cache = cache(4, 60);
        let calls = Arc::new(AtomicUsize::new(0));

        cache.get("u1".into(), counted(&calls, vec![1])).await.unwrap();
        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(cache.get("u1".into(), counted(&calls, vec![2])).await.unwrap(), vec![1]);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cache.peek(&"u1".to_string()).is_none());
        assert_eq!(cache.get("u1".into(), counted(&calls, vec![2])).await.unwrap(), vec![2]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(cache.stats().expirations >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shorter_ttl_wins() {
        let cache = cache(4, 60);
        let calls = Arc::new(AtomicUsize::new(0));

        cache
            .get_with_ttl("u1".into(), Duration::from_secs(5), counted(&calls, vec![1]))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(cache.peek(&"u1".to_string()).is_none());

        cache
            .get_with_ttl("u2".into(), Duration::from_secs(600), counted(&calls, vec![1]))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(cache.peek(&"u2".to_string()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_purges_and_stops() {
        let cache = Arc::new(
            TestCache::builder()
                .capacity(4)
                .ttl(Duration::from_secs(10))
                .sweep_interval(Duration::from_secs(1))
                .build()
                .unwrap(),
        );
        let calls = Arc::new(AtomicUsize::new(0));

        cache.get("a".into(), counted(&calls, vec![])).await.unwrap();
        cache.get("b".into(), counted(&calls, vec![])).await.unwrap();
        assert_eq!(cache.len(), 2);

        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.stats().expirations, 2);
        assert!(cache.sweeper.lock().is_none());
    }

    #[tokio::test]
    async fn failure_is_not_cached() {
        let cache = cache(4, 60);

        let err = cache
            .get("u1".into(), || async { Err(Boom(1)) })
            .await
            .unwrap_err();
        assert_eq!(err.recompute_error().map(|b| b.0), Some(1));
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.in_flight(), 0);

        let v = cache.get("u1".into(), || async { Ok(vec![7]) }).await.unwrap();
        assert_eq!(v, vec![7]);
        assert_eq!(cache.stats().failures, 1);
    }

    #[tokio::test]
    async fn panic_is_reported_as_aborted() {
        let cache = cache(4, 60);

        let err = cache
            .get("u1".into(), || async { explode() })
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Aborted(_)));
        assert_eq!(cache.in_flight(), 0);

        let v = cache.get("u1".into(), || async { Ok(vec![1]) }).await.unwrap();
        assert_eq!(v, vec![1]);
    }

    static FRAGILE: AtomicBool = AtomicBool::new(false);

    // A key that refuses to be cloned while FRAGILE is raised, which makes storing a computed value blow up.
    #[derive(Debug, PartialEq, Eq, Hash)]
    struct FragileKey(&'static str);

    impl Clone for FragileKey {
        fn clone(&self) -> Self {
            if FRAGILE.load(Ordering::SeqCst) {
                panic!("key {} can't be cloned now", self.0);
            }
            Self(self.0)
        }
    }

    impl Display for FragileKey {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(self.0)
        }
    }

    #[tokio::test]
    async fn outcome_is_published_even_if_storing_panics() {
        let cache = Arc::new(
            BoundedCache::<FragileKey, Vec<u32>, Boom>::builder()
                .capacity(4)
                .ttl(Duration::from_secs(60))
                .build()
                .unwrap(),
        );

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            cache.get(FragileKey("u1"), || async {
                FRAGILE.store(true, Ordering::SeqCst);
                Ok(vec![1])
            }),
        )
        .await
        .expect("waiter must not hang")
        .unwrap_err();
        FRAGILE.store(false, Ordering::SeqCst);

        assert!(matches!(err, CacheError::Aborted(_)));
        assert_eq!(cache.in_flight(), 0);
        assert_eq!(cache.stats().failures, 1);

        let v = cache.get(FragileKey("u1"), || async { Ok(vec![2]) }).await.unwrap();
        assert_eq!(v, vec![2]);
    }

    #[tokio::test]
    async fn invalidate_is_idempotent() {
        let cache = cache(4, 60);
        let calls = Arc::new(AtomicUsize::new(0));

        cache.get("u1".into(), counted(&calls, vec![1])).await.unwrap();
        cache.invalidate(&"u1".to_string());
        cache.invalidate(&"u1".to_string());
        cache.invalidate(&"nope".to_string());
        assert!(cache.is_empty());

        cache.get("u1".into(), counted(&calls, vec![1])).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        cache.invalidate_all();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn invalidated_recomputation_is_not_stored() {
        let cache = cache(4, 60);
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let first = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .get("u1".into(), || async move {
                        let _ = release_rx.await;
                        Ok(vec![1])
                    })
                    .await
            })
        };

        while cache.in_flight() == 0 {
            tokio::task::yield_now().await;
        }
        cache.invalidate(&"u1".to_string());
        release_tx.send(()).unwrap();

        // The caller waiting before the invalidation still gets the value.
        assert_eq!(first.await.unwrap().unwrap(), vec![1]);
        assert!(cache.peek(&"u1".to_string()).is_none());

        let v = cache.get("u1".into(), || async { Ok(vec![2]) }).await.unwrap();
        assert_eq!(v, vec![2]);
    }
}
