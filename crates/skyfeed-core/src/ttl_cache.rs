//! Bounded in-memory cache with age-based expiry.
//!
//! [`TtlCache`] is the single cache abstraction used by the classifier runtime
//! for both match results and list memberships. Eviction is explicit:
//!
//! - **Age bound**: entries older than `ttl` are never returned by
//!   [`TtlCache::get_fresh`]. [`TtlCache::get_stale`] still returns them
//!   together with their age, for callers that fall back to the last good
//!   value when revalidation fails.
//! - **Size bound**: inserting a new key into a full cache applies the
//!   configured [`OverflowPolicy`].
//!
//! Timestamps come from `tokio::time::Instant`, so a paused test clock
//! drives expiry deterministically.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// What to do when an insert would exceed `max_entries`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Drop every entry and start over.
    ClearAll,
    /// Drop the single oldest entry.
    EvictOldest,
}

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

/// Thread-safe cache with a size bound and an age bound.
pub struct TtlCache<K, V> {
    entries: Mutex<HashMap<K, Entry<V>>>,
    max_entries: usize,
    ttl: Duration,
    policy: OverflowPolicy,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create a cache holding at most `max_entries` (minimum 1) entries,
    /// each trusted for `ttl`.
    pub fn new(max_entries: usize, ttl: Duration, policy: OverflowPolicy) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
            ttl,
            policy,
        }
    }

    /// The age bound for fresh reads.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Get a value if it is younger than the TTL.
    pub fn get_fresh(&self, key: &K) -> Option<V> {
        let entries = self.entries.lock();
        entries
            .get(key)
            .filter(|e| e.inserted_at.elapsed() < self.ttl)
            .map(|e| e.value.clone())
    }

    /// Get a value regardless of age, along with how old it is.
    pub fn get_stale(&self, key: &K) -> Option<(V, Duration)> {
        let entries = self.entries.lock();
        entries
            .get(key)
            .map(|e| (e.value.clone(), e.inserted_at.elapsed()))
    }

    /// Insert or replace a value.
    ///
    /// Returns the number of entries evicted to make room.
    pub fn insert(&self, key: K, value: V) -> usize {
        let mut entries = self.entries.lock();
        let mut evicted = 0;

        if !entries.contains_key(&key) && entries.len() >= self.max_entries {
            match self.policy {
                OverflowPolicy::ClearAll => {
                    evicted = entries.len();
                    entries.clear();
                }
                OverflowPolicy::EvictOldest => {
                    let oldest = entries
                        .iter()
                        .min_by_key(|(_, e)| e.inserted_at)
                        .map(|(k, _)| k.clone());
                    if let Some(oldest) = oldest {
                        entries.remove(&oldest);
                        evicted = 1;
                    }
                }
            }
        }

        entries.insert(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
        evicted
    }

    /// Remove a single entry.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.lock().remove(key).map(|e| e.value)
    }

    /// Remove entries older than `max_age`. Returns how many were removed.
    pub fn prune_older_than(&self, max_age: Duration) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.inserted_at.elapsed() < max_age);
        before - entries.len()
    }

    /// Remove entries older than the TTL.
    pub fn prune_expired(&self) -> usize {
        self.prune_older_than(self.ttl)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get_fresh() {
        let cache = TtlCache::new(10, Duration::from_secs(60), OverflowPolicy::ClearAll);
        cache.insert("a".to_string(), 1);
        assert_eq!(cache.get_fresh(&"a".to_string()), Some(1));
        assert_eq!(cache.get_fresh(&"b".to_string()), None);
    }

    #[test]
    fn test_clear_all_on_overflow() {
        let cache = TtlCache::new(2, Duration::from_secs(60), OverflowPolicy::ClearAll);
        assert_eq!(cache.insert(1, "one"), 0);
        assert_eq!(cache.insert(2, "two"), 0);

        // Replacing an existing key does not overflow
        assert_eq!(cache.insert(2, "deux"), 0);
        assert_eq!(cache.len(), 2);

        // A third key wipes the cache, then lands alone
        assert_eq!(cache.insert(3, "three"), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get_fresh(&3), Some("three"));
        assert_eq!(cache.get_fresh(&1), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_oldest_on_overflow() {
        let cache = TtlCache::new(2, Duration::from_secs(60), OverflowPolicy::EvictOldest);
        cache.insert(1, "one");
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.insert(2, "two");
        tokio::time::advance(Duration::from_millis(10)).await;

        assert_eq!(cache.insert(3, "three"), 1);
        assert_eq!(cache.get_fresh(&1), None);
        assert_eq!(cache.get_fresh(&2), Some("two"));
        assert_eq!(cache.get_fresh(&3), Some("three"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_are_not_fresh() {
        let cache = TtlCache::new(10, Duration::from_secs(30), OverflowPolicy::ClearAll);
        cache.insert("k", 7);

        tokio::time::advance(Duration::from_secs(31)).await;

        assert_eq!(cache.get_fresh(&"k"), None);
        let (value, age) = cache.get_stale(&"k").unwrap();
        assert_eq!(value, 7);
        assert!(age >= Duration::from_secs(31));
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune() {
        let cache = TtlCache::new(10, Duration::from_secs(30), OverflowPolicy::ClearAll);
        cache.insert("old", 1);
        tokio::time::advance(Duration::from_secs(40)).await;
        cache.insert("new", 2);

        assert_eq!(cache.prune_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get_fresh(&"new"), Some(2));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(cache.prune_older_than(Duration::from_secs(5)), 1);
        assert!(cache.is_empty());
    }
}
