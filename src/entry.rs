use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use tokio::time::Instant;

use crate::cache::MAX_TTL;

/// A stored value together with its lifetime bookkeeping.
#[derive(Clone, Debug)]
pub struct CacheEntry<V> {
    value:       V,
    created_at:  Instant,
    expires_at:  Instant,
    last_access: Instant,
    // Monotonic insertion number; keeps index keys unique when instants collide.
    seq:         u64,
}

impl<V> CacheEntry<V> {
    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub fn last_access(&self) -> Instant {
        self.last_access
    }

    #[inline]
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    #[inline]
    fn lru_key(&self) -> LruKey {
        (self.last_access, self.created_at, self.seq)
    }

    #[inline]
    fn expiry_key(&self) -> ExpiryKey {
        (self.expires_at, self.seq)
    }
}

// Least recently used first; equal access times fall back to the earliest creation.
type LruKey = (Instant, Instant, u64);
type ExpiryKey = (Instant, u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Removal {
    Expired,
    Evicted,
}

/// The entry table of [`BoundedCache`](crate::BoundedCache): a hash map plus two ordered indices, one by recency of
/// use and one by expiration time. All three are kept in sync by every mutating method.
#[derive(Debug)]
pub(crate) struct EntryTable<K, V>
where
    K: Hash + Eq + Clone,
{
    entries:   HashMap<K, CacheEntry<V>>,
    by_use:    BTreeMap<LruKey, K>,
    by_expiry: BTreeMap<ExpiryKey, K>,
    next_seq:  u64,
}

impl<K, V> EntryTable<K, V>
where
    K: Hash + Eq + Clone + Debug,
{
    pub(crate) fn new() -> Self {
        Self {
            entries:   HashMap::new(),
            by_use:    BTreeMap::new(),
            by_expiry: BTreeMap::new(),
            next_seq:  0,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn get(&self, key: &K) -> Option<&CacheEntry<V>> {
        self.entries.get(key)
    }

    /// Marks the entry as used at `now` and returns it.
    pub(crate) fn touch(&mut self, key: &K, now: Instant) -> Option<&CacheEntry<V>> {
        let entry = self.entries.get_mut(key)?;
        self.by_use.remove(&entry.lru_key());
        entry.last_access = now;
        self.by_use.insert(entry.lru_key(), key.clone());
        Some(entry)
    }

    /// Inserts a fresh entry, making room first so that the table never holds more than `capacity` entries. Returns
    /// the removals performed to make that room.
    pub(crate) fn insert(
        &mut self,
        key: K,
        value: V,
        now: Instant,
        ttl: std::time::Duration,
        capacity: usize,
    ) -> Vec<(K, Removal)> {
        let mut removed = Vec::new();

        self.remove(&key);

        while self.entries.len() >= capacity {
            match self.evict_one(now) {
                Some(r) => removed.push(r),
                None => break,
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        let entry = CacheEntry {
            value,
            created_at: now,
            expires_at: now.checked_add(ttl).unwrap_or_else(|| now + MAX_TTL),
            last_access: now,
            seq,
        };

        self.by_use.insert(entry.lru_key(), key.clone());
        self.by_expiry.insert(entry.expiry_key(), key.clone());
        self.entries.insert(key, entry);

        removed
    }

    pub(crate) fn remove(&mut self, key: &K) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.by_use.remove(&entry.lru_key());
        self.by_expiry.remove(&entry.expiry_key());
        Some(entry)
    }

    pub(crate) fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        self.by_use.clear();
        self.by_expiry.clear();
        count
    }

    /// Removes every entry expired at `now`, earliest expiration first.
    pub(crate) fn purge_expired(&mut self, now: Instant) -> Vec<K> {
        let mut purged = Vec::new();
        while let Some(key) = self.first_expired(now) {
            self.remove(&key);
            purged.push(key);
        }
        purged
    }

    fn first_expired(&self, now: Instant) -> Option<K> {
        self.by_expiry
            .first_key_value()
            .filter(|((expires_at, _), _)| *expires_at <= now)
            .map(|(_, key)| key.clone())
    }

    // Expired entries always go first; only when there is none is a live one sacrificed.
    fn evict_one(&mut self, now: Instant) -> Option<(K, Removal)> {
        if let Some(key) = self.first_expired(now) {
            self.remove(&key);
            return Some((key, Removal::Expired));
        }

        let key = self.by_use.first_key_value().map(|(_, key)| key.clone())?;
        self.remove(&key);
        Some((key, Removal::Evicted))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test(start_paused = true)]
    async fn evicts_least_recently_used() {
        let mut table = EntryTable::new();
        let t0 = Instant::now();

        table.insert("a", 1, t0, TTL, 2);
        table.insert("b", 2, t0 + Duration::from_secs(1), TTL, 2);
        table.touch(&"a", t0 + Duration::from_secs(2));

        let removed = table.insert("c", 3, t0 + Duration::from_secs(3), TTL, 2);
        assert_eq!(removed, vec![("b", Removal::Evicted)]);
        assert!(table.get(&"a").is_some());
        assert!(table.get(&"c").is_some());
        assert_eq!(table.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn ties_fall_back_to_creation_order() {
        let mut table = EntryTable::new();
        let t0 = Instant::now();

        table.insert("a", 1, t0, TTL, 3);
        table.insert("b", 2, t0 + Duration::from_secs(1), TTL, 3);
        // Both used at the very same instant.
        let used = t0 + Duration::from_secs(5);
        table.touch(&"b", used);
        table.touch(&"a", used);

        let removed = table.insert("c", 3, used, TTL, 2);
        assert_eq!(removed, vec![("a", Removal::Evicted)]);
    }

    #[tokio::test(start_paused = true)]
    async fn prefers_expired_victims() {
        let mut table = EntryTable::new();
        let t0 = Instant::now();

        table.insert("short", 1, t0, Duration::from_secs(1), 2);
        table.insert("long", 2, t0, TTL, 2);
        // "long" is the least recently used one, but "short" has expired.
        table.touch(&"short", t0 + Duration::from_millis(500));

        let removed = table.insert("new", 3, t0 + Duration::from_secs(2), TTL, 2);
        assert_eq!(removed, vec![("short", Removal::Expired)]);
        assert!(table.get(&"long").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn huge_ttl_saturates() {
        let mut table = EntryTable::new();
        let t0 = Instant::now();

        table.insert("forever", 1, t0, Duration::MAX, 2);
        let entry = table.get(&"forever").unwrap();
        assert_eq!(entry.expires_at(), t0 + MAX_TTL);
        assert!(!entry.is_expired_at(t0 + Duration::from_secs(365 * 24 * 60 * 60)));
    }

    #[tokio::test(start_paused = true)]
    async fn purge_keeps_indices_in_sync() {
        let mut table = EntryTable::new();
        let t0 = Instant::now();

        table.insert(1, "x", t0, Duration::from_secs(1), 10);
        table.insert(2, "y", t0, Duration::from_secs(2), 10);
        table.insert(3, "z", t0, TTL, 10);

        let purged = table.purge_expired(t0 + Duration::from_secs(2));
        assert_eq!(purged, vec![1, 2]);
        assert_eq!(table.len(), 1);
        assert_eq!(table.by_use.len(), 1);
        assert_eq!(table.by_expiry.len(), 1);

        // Re-inserting an existing key replaces it without leaving stale index records behind.
        table.insert(3, "zz", t0 + Duration::from_secs(3), TTL, 10);
        assert_eq!(table.len(), 1);
        assert_eq!(table.by_use.len(), 1);
        assert_eq!(table.get(&3).map(|e| *e.value()), Some("zz"));
    }
}
