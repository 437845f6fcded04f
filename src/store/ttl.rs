//! Key/value map with per-entry expiry.

use std::hash::Hash;
use std::time::{Duration, Instant};

use dashmap::DashMap;

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// Concurrent map whose entries disappear after their TTL.
///
/// Expired entries are invisible to readers immediately and are physically
/// removed by [`TtlMap::purge`] or when overwritten.
#[derive(Debug)]
pub struct TtlMap<K: Eq + Hash, V> {
    inner: DashMap<K, Entry<V>>,
}

impl<K: Eq + Hash, V> Default for TtlMap<K, V> {
    fn default() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> TtlMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: K, value: V, ttl: Duration, now: Instant) {
        self.inner.insert(
            key,
            Entry {
                value,
                expires_at: now + ttl,
            },
        );
    }

    /// Live value for `key`.
    pub fn get(&self, key: &K, now: Instant) -> Option<V> {
        self.inner
            .get(key)
            .filter(|e| e.expires_at > now)
            .map(|e| e.value.clone())
    }

    /// Remaining lifetime of `key`.
    pub fn ttl(&self, key: &K, now: Instant) -> Option<Duration> {
        self.inner
            .get(key)
            .filter(|e| e.expires_at > now)
            .map(|e| e.expires_at - now)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.remove(key).map(|(_, e)| e.value)
    }

    /// Drop expired entries; returns how many were removed.
    pub fn purge(&self, now: Instant) -> usize {
        let before = self.inner.len();
        self.inner.retain(|_, e| e.expires_at > now);
        before - self.inner.len()
    }

    /// Live entries.
    pub fn snapshot(&self, now: Instant) -> Vec<(K, V, Duration)> {
        self.inner
            .iter()
            .filter(|e| e.expires_at > now)
            .map(|e| (e.key().clone(), e.value().value.clone(), e.expires_at - now))
            .collect()
    }
}

impl<K: Eq + Hash + Clone> TtlMap<K, u64> {
    /// Atomically add one to the counter at `key`, starting a fresh TTL if it
    /// was absent or expired. Returns the new count.
    pub fn increment(&self, key: K, ttl: Duration, now: Instant) -> u64 {
        let mut entry = self.inner.entry(key).or_insert_with(|| Entry {
            value: 0,
            expires_at: now + ttl,
        });
        if entry.expires_at <= now {
            entry.value = 0;
            entry.expires_at = now + ttl;
        }
        entry.value += 1;
        entry.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_expire() {
        let map = TtlMap::new();
        let now = Instant::now();
        map.insert("k", "v", Duration::from_secs(5), now);
        assert_eq!(map.get(&"k", now + Duration::from_secs(4)), Some("v"));
        assert_eq!(map.get(&"k", now + Duration::from_secs(5)), None);
        assert_eq!(map.purge(now + Duration::from_secs(6)), 1);
    }

    #[test]
    fn counter_restarts_after_expiry() {
        let map: TtlMap<&str, u64> = TtlMap::new();
        let now = Instant::now();
        let ttl = Duration::from_secs(10);
        assert_eq!(map.increment("k", ttl, now), 1);
        assert_eq!(map.increment("k", ttl, now + Duration::from_secs(1)), 2);
        assert_eq!(map.increment("k", ttl, now + Duration::from_secs(11)), 1);
    }
}
