//! Bounded, time-limited cache of settlement results keyed by authorization nonce.
//!
//! A facilitator may see the same signed authorization more than once (client
//! retries, duplicate hook invocations). Replaying the cached result avoids a
//! second round of chain reads and a doomed deposit transaction.

use std::time::{Duration, Instant};

use alloy_primitives::B256;
use dashmap::DashMap;

/// Default lifetime of a cached result.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(600);

/// Default maximum number of cached results.
pub const DEFAULT_CACHE_MAX_ENTRIES: usize = 1024;

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

/// Concurrent cache keyed by the 32-byte authorization nonce.
///
/// Entries expire after `ttl`. When an insert would exceed `max_entries`,
/// expired entries are purged first and then the oldest entry is evicted.
#[derive(Debug)]
pub struct SettlementCache<V> {
    entries: DashMap<B256, Entry<V>>,
    ttl: Duration,
    max_entries: usize,
}

impl<V: Clone> Default for SettlementCache<V> {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL, DEFAULT_CACHE_MAX_ENTRIES)
    }
}

impl<V: Clone> SettlementCache<V> {
    /// Creates an empty cache. A `max_entries` of zero is treated as one.
    #[must_use]
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Returns the cached value for `nonce` unless it has expired.
    pub fn get(&self, nonce: &B256) -> Option<V> {
        let hit = self.entries.get(nonce).and_then(|entry| {
            (entry.inserted_at.elapsed() < self.ttl).then(|| entry.value.clone())
        });
        if hit.is_none() {
            self.entries
                .remove_if(nonce, |_, entry| entry.inserted_at.elapsed() >= self.ttl);
        }
        hit
    }

    /// Stores `value` under `nonce`, replacing any previous entry.
    pub fn insert(&self, nonce: B256, value: V) {
        if !self.entries.contains_key(&nonce) && self.entries.len() >= self.max_entries {
            self.purge_expired();
            if self.entries.len() >= self.max_entries {
                self.evict_oldest();
            }
        }
        self.entries.insert(
            nonce,
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drops every expired entry.
    pub fn purge_expired(&self) {
        let ttl = self.ttl;
        self.entries
            .retain(|_, entry| entry.inserted_at.elapsed() < ttl);
    }

    /// Number of entries currently held, including expired ones not yet purged.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().inserted_at)
            .map(|entry| *entry.key());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nonce(byte: u8) -> B256 {
        B256::repeat_byte(byte)
    }

    #[test]
    fn test_get_returns_inserted_value() {
        let cache = SettlementCache::new(Duration::from_secs(60), 4);
        cache.insert(nonce(1), "0xabc".to_owned());
        assert_eq!(cache.get(&nonce(1)).as_deref(), Some("0xabc"));
        assert!(cache.get(&nonce(2)).is_none());
    }

    #[test]
    fn test_zero_ttl_never_hits() {
        let cache = SettlementCache::new(Duration::ZERO, 4);
        cache.insert(nonce(1), 1_u32);
        assert!(cache.get(&nonce(1)).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let cache = SettlementCache::new(Duration::from_secs(60), 2);
        cache.insert(nonce(1), 1_u32);
        std::thread::sleep(Duration::from_millis(2));
        cache.insert(nonce(2), 2);
        std::thread::sleep(Duration::from_millis(2));
        cache.insert(nonce(3), 3);
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&nonce(1)).is_none());
        assert_eq!(cache.get(&nonce(2)), Some(2));
        assert_eq!(cache.get(&nonce(3)), Some(3));
    }

    #[test]
    fn test_replacing_existing_key_does_not_evict() {
        let cache = SettlementCache::new(Duration::from_secs(60), 2);
        cache.insert(nonce(1), 1_u32);
        cache.insert(nonce(2), 2);
        cache.insert(nonce(2), 20);
        assert_eq!(cache.get(&nonce(1)), Some(1));
        assert_eq!(cache.get(&nonce(2)), Some(20));
    }
}
