// In-memory TTL cache for tool results

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub created: Instant,
    pub ttl: Duration,
    pub metadata: serde_json::Value,
}

impl<V> CacheEntry<V> {
    fn is_live(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created) < self.ttl
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Debug)]
struct CacheInner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    stats: CacheStats,
}

/// Best-effort cache keyed by string. A lookup that misses and a lookup of
/// an expired entry look the same to the caller.
///
/// When full, an insert evicts the entry with the oldest creation time.
#[derive(Debug)]
pub struct ResultCache<V> {
    inner: Mutex<CacheInner<V>>,
    default_ttl: Duration,
    max_entries: usize,
}

impl<V: Clone> ResultCache<V> {
    pub fn new(default_ttl: Duration, max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                stats: CacheStats::default(),
            }),
            default_ttl,
            max_entries: max_entries.max(1),
        }
    }

    pub async fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        match inner.entries.get(key) {
            Some(entry) if entry.is_live(now) => {
                let value = entry.value.clone();
                inner.stats.hits += 1;
                Some(value)
            }
            Some(_) => {
                inner.entries.remove(key);
                inner.stats.misses += 1;
                None
            }
            None => {
                inner.stats.misses += 1;
                None
            }
        }
    }

    /// Insert `value` under `key`. `ttl` falls back to the cache default.
    pub async fn set(
        &self,
        key: impl Into<String>,
        value: V,
        ttl: Option<Duration>,
        metadata: serde_json::Value,
    ) {
        let key = key.into();
        let mut inner = self.inner.lock().await;
        let now = Instant::now();

        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.max_entries {
            inner.entries.retain(|_, e| e.is_live(now));
            if inner.entries.len() >= self.max_entries {
                let oldest = inner
                    .entries
                    .iter()
                    .min_by_key(|(_, e)| e.created)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    inner.entries.remove(&oldest);
                    inner.stats.evictions += 1;
                    debug!(key = %oldest, "Evicted oldest cache entry");
                }
            }
        }

        inner.entries.insert(
            key,
            CacheEntry {
                value,
                created: now,
                ttl: ttl.unwrap_or(self.default_ttl),
                metadata,
            },
        );
    }

    /// Metadata stored alongside a live entry.
    pub async fn metadata(&self, key: &str) -> Option<serde_json::Value> {
        let inner = self.inner.lock().await;
        inner
            .entries
            .get(key)
            .filter(|e| e.is_live(Instant::now()))
            .map(|e| e.metadata.clone())
    }

    /// Drop every expired entry. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let before = inner.entries.len();
        inner.entries.retain(|_, e| e.is_live(now));
        before - inner.entries.len()
    }

    pub async fn clear(&self) {
        self.inner.lock().await.entries.clear();
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().await;
        CacheStats {
            entries: inner.entries.len(),
            ..inner.stats.clone()
        }
    }
}

/// Stable key for a tool invocation.
pub fn cache_key(tool: &str, argv: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tool.as_bytes());
    for arg in argv {
        hasher.update([0u8]);
        hasher.update(arg.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let cache = ResultCache::new(Duration::from_secs(3600), 10);
        cache
            .set("k", "v".to_string(), Some(Duration::from_secs(1)), json!({}))
            .await;
        assert_eq!(cache.get("k").await.as_deref(), Some("v"));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(cache.get("k").await.is_none());
        // Lazily purged on lookup.
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_ttl_applies() {
        let cache = ResultCache::new(Duration::from_secs(5), 10);
        cache.set("k", 1u32, None, json!(null)).await;

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(cache.get("k").await, Some(1));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evicts_oldest_when_full() {
        let cache = ResultCache::new(Duration::from_secs(60), 2);
        cache.set("first", 1, None, json!({})).await;
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.set("second", 2, None, json!({})).await;
        tokio::time::advance(Duration::from_millis(10)).await;

        // Reading does not protect an entry from age-based eviction.
        assert_eq!(cache.get("first").await, Some(1));
        cache.set("third", 3, None, json!({})).await;

        assert_eq!(cache.get("first").await, None);
        assert_eq!(cache.get("second").await, Some(2));
        assert_eq!(cache.get("third").await, Some(3));
        assert_eq!(cache.stats().await.evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_are_dropped_before_eviction() {
        let cache = ResultCache::new(Duration::from_secs(60), 2);
        cache.set("short", 1, Some(Duration::from_secs(1)), json!({})).await;
        cache.set("long", 2, None, json!({})).await;
        tokio::time::advance(Duration::from_secs(2)).await;

        cache.set("new", 3, None, json!({})).await;
        assert_eq!(cache.get("long").await, Some(2));
        assert_eq!(cache.stats().await.evictions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overwrite_does_not_evict() {
        let cache = ResultCache::new(Duration::from_secs(60), 1);
        cache.set("k", 1, None, json!({})).await;
        cache.set("k", 2, None, json!({"tool": "dnsx"})).await;
        assert_eq!(cache.get("k").await, Some(2));
        assert_eq!(cache.metadata("k").await, Some(json!({"tool": "dnsx"})));
        assert_eq!(cache.stats().await.evictions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_and_purge() {
        let cache = ResultCache::new(Duration::from_secs(1), 10);
        cache.set("a", 1, None, json!({})).await;
        cache.set("b", 2, Some(Duration::from_secs(10)), json!({})).await;
        cache.get("a").await;
        cache.get("missing").await;

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.purge_expired().await, 1);

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);

        cache.clear().await;
        assert!(cache.is_empty().await);
    }

    #[test]
    fn test_cache_key_separates_arguments() {
        let a = cache_key("dnsx", &["-l".into(), "hosts".into()]);
        let b = cache_key("dnsx", &["-lhosts".into()]);
        let c = cache_key("dnsx", &["-l".into(), "hosts".into()]);
        assert_ne!(a, b);
        assert_eq!(a, c);
        assert_eq!(a.len(), 64);
    }
}
