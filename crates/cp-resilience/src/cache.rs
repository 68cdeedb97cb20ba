use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;

/// Cached response with its expiry instant
#[derive(Debug, Clone)]
struct CacheEntry {
    value: serde_json::Value,
    expires_at: Instant,
}

impl CacheEntry {
    fn new(value: serde_json::Value, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// Derive a deterministic cache key from an operation name and its
/// stringified arguments. The prefix is kept readable; the arguments are
/// fingerprinted.
pub fn cache_key(prefix: &str, parts: &[&str]) -> String {
    let mut hasher = DefaultHasher::new();
    for part in parts {
        part.hash(&mut hasher);
    }
    format!("{}:{:016x}", prefix, hasher.finish())
}

/// In-memory TTL cache for serialized dependency responses
#[derive(Debug)]
pub struct ResponseCache {
    entries: DashMap<String, CacheEntry>,
    stats: RwLock<CacheStats>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            stats: RwLock::new(CacheStats::default()),
        }
    }

    /// Get a live value. An expired entry counts as a miss and is removed.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        if let Some(entry) = self.entries.get(key) {
            if entry.is_live() {
                let mut stats = self.stats.write();
                stats.hits += 1;
                return Some(entry.value.clone());
            }
        }

        // Expired or absent
        self.entries.remove_if(key, |_, entry| !entry.is_live());
        {
            let mut stats = self.stats.write();
            stats.misses += 1;
        }
        None
    }

    pub fn insert(&self, key: &str, value: serde_json::Value, ttl: Duration) {
        self.entries
            .insert(key.to_string(), CacheEntry::new(value, ttl));

        let mut stats = self.stats.write();
        stats.stores += 1;
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Clear every entry, returning how many were dropped.
    pub fn flush(&self) -> usize {
        let flushed = self.entries.len();
        self.entries.clear();

        let mut stats = self.stats.write();
        stats.flushes += 1;
        flushed
    }

    /// Round-trip a sentinel entry to confirm the cache is operational.
    pub fn ping(&self) -> bool {
        let key = "__ping__";
        self.entries.insert(
            key.to_string(),
            CacheEntry::new(serde_json::Value::Bool(true), Duration::from_secs(1)),
        );
        let ok = self
            .entries
            .get(key)
            .map(|e| e.value == serde_json::Value::Bool(true))
            .unwrap_or(false);
        self.entries.remove(key);
        ok
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.read().clone()
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub flushes: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        if self.hits + self.misses == 0 {
            0.0
        } else {
            self.hits as f64 / (self.hits + self.misses) as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cache_basic_operations() {
        let cache = ResponseCache::new();
        let key = cache_key("price_data", &["ethereum", "bitcoin"]);

        assert!(cache.get(&key).is_none());

        cache.insert(&key, json!({"ethereum": 2500.0}), Duration::from_secs(60));
        assert_eq!(cache.get(&key), Some(json!({"ethereum": 2500.0})));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.stores, 1);
    }

    #[test]
    fn expired_entry_is_a_miss() {
        let cache = ResponseCache::new();
        cache.insert("k", json!(1), Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(25));

        assert!(cache.get("k").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn flush_clears_everything() {
        let cache = ResponseCache::new();
        cache.insert("a", json!(1), Duration::from_secs(60));
        cache.insert("b", json!(2), Duration::from_secs(60));

        assert_eq!(cache.flush(), 2);
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_none());
    }

    #[test]
    fn key_derivation_is_deterministic() {
        let a = cache_key("price_data", &["ethereum", "usd"]);
        let b = cache_key("price_data", &["ethereum", "usd"]);
        let c = cache_key("price_data", &["bitcoin", "usd"]);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("price_data:"));
    }

    #[test]
    fn ping_round_trips() {
        let cache = ResponseCache::new();
        assert!(cache.ping());
        assert!(cache.is_empty());
    }
}
